//! XGBoostJob Kubernetes Operator
//!
//! This crate provides a Kubernetes operator that runs distributed XGBoost
//! training jobs: one pod and one headless service per replica, wired
//! together through environment variables, with job progress reported in
//! status conditions.
//!
//! # Custom Resource Definitions
//!
//! - **XGBoostJob**: A training job made of one `Master` and any number of `Worker` replicas
//! - **PodGroup**: Gang-scheduling group requested from kube-batch (optional)
//!
//! # Example
//!
//! ```yaml
//! apiVersion: xgboostjob.kubeflow.org/v1
//! kind: XGBoostJob
//! metadata:
//!   name: xgboost-dist-iris
//! spec:
//!   backoffLimit: 3
//!   cleanPodPolicy: All
//!   xgbReplicaSpecs:
//!     Master:
//!       replicas: 1
//!       restartPolicy: Never
//!       template:
//!         spec:
//!           containers:
//!             - name: xgboostjob
//!               image: docker.io/kubeflow/xgboost-dist-iris:1.0
//!     Worker:
//!       replicas: 2
//!       restartPolicy: ExitCode
//!       template:
//!         spec:
//!           containers:
//!             - name: xgboostjob
//!               image: docker.io/kubeflow/xgboost-dist-iris:1.0
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod observability;

pub use crd::{XGBoostJob, XGBoostJobSpec};
pub use error::{OperatorError, OperatorResult};
