//! Logging setup for the operator.
//!
//! The output format is controlled via `XGB_LOG_FORMAT`:
//! - `json` - Structured JSON output (for ELK/Loki)
//! - `pretty` - Human-readable multi-line output
//! - `compact` - Single-line output
//!
//! When unset, JSON is used off a terminal and pretty output on one.
//!
//! # Example
//!
//! ```ignore
//! use xgboost_operator::observability::{TracingConfig, init_tracing};
//!
//! let _guard = init_tracing(TracingConfig::from_env())?;
//!
//! let config = TracingConfig::builder()
//!     .json_format(true)
//!     .log_filter("info,xgboost_operator=debug")
//!     .build();
//! let _guard = init_tracing(config)?;
//! ```

mod config;
mod tracing_setup;

pub use config::{LogFormat, TracingConfig, TracingConfigBuilder};
pub use tracing_setup::{TracingGuard, init_tracing};
