//! XGBoostJob Kubernetes Operator binary.
//!
//! This binary watches XGBoostJob resources and the pods and services they
//! own, and reconciles the jobs until SIGINT or SIGTERM.

use anyhow::Context;
use clap::Parser;
use kube::{Client, CustomResourceExt};
use std::sync::Arc;
use xgboost_operator::client::{KubeRecorder, KubeStore};
use xgboost_operator::config::OperatorConfig;
use xgboost_operator::controller::{ControllerContext, Operator};
use xgboost_operator::crd::{CONTROLLER_NAME, XGBoostJob};
use xgboost_operator::observability::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    // Check for CRD generation mode
    if config.generate_crds {
        generate_crds()?;
        return Ok(());
    }

    let _tracing_guard = init_tracing(config.tracing_config())?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting XGBoostJob operator");

    // Connect to Kubernetes
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    tracing::info!("Connected to Kubernetes cluster");

    let ctx = ControllerContext::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(KubeRecorder::new(client.clone(), CONTROLLER_NAME)),
        config.controller_config(),
    );

    let mut operator = Operator::new(client, ctx, config.namespace.clone());
    if let Some(period) = config.resync_period() {
        operator = operator.with_resync_period(period);
    }

    // Runs until Ctrl-C or SIGTERM
    operator.run(config.threadiness).await;
    Ok(())
}

/// Generate CRD YAML.
fn generate_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&XGBoostJob::crd())?);
    Ok(())
}
