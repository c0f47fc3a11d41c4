//! Command-line and environment configuration of the operator.

use crate::controller::ControllerConfig;
use crate::crd::GANG_SCHEDULER_NAME;
use crate::observability::{LogFormat, TracingConfig};
use clap::Parser;
use std::time::Duration;

/// Kubernetes operator for distributed XGBoost training jobs.
#[derive(Debug, Clone, Parser)]
#[command(name = "xgboost-operator")]
#[command(author, version, about, long_about = None)]
pub struct OperatorConfig {
    /// Number of jobs reconciled concurrently
    #[arg(long, env = "XGB_THREADINESS", default_value_t = 1)]
    pub threadiness: usize,

    /// Schedule the pods of a job as one gang through a PodGroup
    #[arg(long, env = "XGB_ENABLE_GANG_SCHEDULING")]
    pub enable_gang_scheduling: bool,

    /// Scheduler that understands PodGroups
    #[arg(long, env = "XGB_GANG_SCHEDULER_NAME", default_value = GANG_SCHEDULER_NAME)]
    pub gang_scheduler_name: String,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long, env = "XGB_NAMESPACE")]
    pub namespace: Option<String>,

    /// Seconds after which unobserved creations/deletions are given up on
    #[arg(long, env = "XGB_EXPECTATIONS_TIMEOUT_SECS", default_value_t = 300)]
    pub expectations_timeout_secs: u64,

    /// Seconds between reconciles of every known job (0 disables)
    #[arg(long, env = "XGB_RESYNC_PERIOD_SECS", default_value_t = 30)]
    pub resync_period_secs: u64,

    /// Print the XGBoostJob CRD as YAML and exit
    #[arg(long)]
    pub generate_crds: bool,

    /// Log format: json, pretty or compact (overrides XGB_LOG_FORMAT)
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Log filter, e.g. "info,xgboost_operator=debug" (overrides XGB_LOG_LEVEL)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl OperatorConfig {
    /// Options handed to the job controller.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            enable_gang_scheduling: self.enable_gang_scheduling,
            gang_scheduler_name: self.gang_scheduler_name.clone(),
            expectations_timeout: Duration::from_secs(self.expectations_timeout_secs),
        }
    }

    /// Logging configuration: environment first, flags on top.
    pub fn tracing_config(&self) -> TracingConfig {
        let mut builder = TracingConfig::from_env().to_builder();
        if let Some(format) = self.log_format {
            builder = builder.log_format(format);
        }
        if let Some(level) = &self.log_level {
            builder = builder.log_filter(level.clone());
        }
        builder.build()
    }

    /// Resync interval, `None` when disabled.
    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OperatorConfig::try_parse_from(["xgboost-operator"]).unwrap();
        assert_eq!(config.threadiness, 1);
        assert!(!config.generate_crds);
        assert_eq!(config.resync_period(), Some(Duration::from_secs(30)));

        let controller = config.controller_config();
        assert_eq!(controller.gang_scheduler_name, "kube-batch");
        assert_eq!(controller.expectations_timeout, Duration::from_secs(300));
    }

    #[test]
    fn flags_override() {
        let config = OperatorConfig::try_parse_from([
            "xgboost-operator",
            "--threadiness",
            "4",
            "--enable-gang-scheduling",
            "--namespace",
            "training",
            "--resync-period-secs",
            "0",
            "--log-format",
            "json",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(config.threadiness, 4);
        assert!(config.controller_config().enable_gang_scheduling);
        assert_eq!(config.namespace.as_deref(), Some("training"));
        assert_eq!(config.resync_period(), None);

        let tracing = config.tracing_config();
        assert_eq!(tracing.log_format(), LogFormat::Json);
        assert_eq!(tracing.log_filter(), "debug");
    }

    #[test]
    fn rejects_unknown_log_format() {
        let result = OperatorConfig::try_parse_from(["xgboost-operator", "--log-format", "xml"]);
        assert!(result.is_err());
    }
}
