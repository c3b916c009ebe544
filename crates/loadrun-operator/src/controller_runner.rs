//! Controller runner - wires the TestRun controller to its watches

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::Config as ControllerSettings;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client;

use loadrun_common::crd::TestRun;
use loadrun_common::{APP_LABEL_KEY, APP_LABEL_VALUE};
use loadrun_controller::{
    error_policy, reconcile, runner_pod_to_run, runner_pod_watcher_config, Context,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Build the TestRun controller future
///
/// Reconciles are triggered by TestRun changes, by changes to runner Jobs the
/// run owns, and by runner pod events.
pub fn build_test_run_controller(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
    concurrency: u16,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let runs: Api<TestRun> = scoped(&client, namespace);
    let jobs: Api<Job> = scoped(&client, namespace);
    let pods: Api<Pod> = scoped(&client, namespace);

    let runner_jobs = format!("{}={}", APP_LABEL_KEY, APP_LABEL_VALUE);

    tracing::info!(
        namespace = namespace.unwrap_or("*"),
        concurrency,
        "- TestRun controller"
    );

    Box::pin(
        Controller::new(runs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(
                jobs,
                WatcherConfig::default()
                    .labels(&runner_jobs)
                    .timeout(WATCH_TIMEOUT_SECS),
            )
            .watches(
                pods,
                runner_pod_watcher_config().timeout(WATCH_TIMEOUT_SECS),
                runner_pod_to_run,
            )
            .with_config(ControllerSettings::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("TestRun")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
