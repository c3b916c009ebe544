//! loadrun operator - drives TestRun resources through their lifecycle

mod config;
mod controller_runner;

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use loadrun_common::crd::TestRun;
use loadrun_common::telemetry::init_telemetry;
use loadrun_common::FIELD_MANAGER;
use loadrun_controller::Context;

use crate::config::{Cli, ControllerArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&TestRun::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(cli.controller.telemetry_config())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    run_controller(cli.controller).await
}

/// Install or update the TestRun CRD using server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = TestRun::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    tracing::info!(crd = %name, "Installing TestRun CRD...");
    crds.patch(&name, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install TestRun CRD: {}", e))?;
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("loadrun controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let ctx = Context::builder(client.clone())
        .config(args.controller_config())
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?;

    controller_runner::build_test_run_controller(
        client,
        Arc::new(ctx),
        args.namespace.as_deref(),
        args.max_concurrent_reconciles,
    )
    .await;

    tracing::info!("loadrun controller stopped");
    Ok(())
}
