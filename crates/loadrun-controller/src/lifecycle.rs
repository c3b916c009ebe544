//! Stage actions that touch runners or the cloud
//!
//! The state machine decides *when* to validate, create, start or stop; a
//! [`RunLifecycle`] decides *how*. [`StandardLifecycle`] creates one Job and
//! one Service per shard and drives the runners through their REST API.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use loadrun_cloud::{CloudClient, CreateTestRun};
use loadrun_common::crd::TestRun;
use loadrun_common::{Error, Result};

use crate::client::KubeClient;
use crate::resources::{build_runner_job, build_runner_service};
use crate::runner::RunnerClient;
use crate::workers;

/// Outcome of validating a TestRun
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Validation {
    /// The runners send results to the cloud
    pub cloud_output: bool,
}

/// Side effects performed on behalf of the state machine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunLifecycle: Send + Sync {
    /// Check the run is executable; [`Error::Validation`] fails the run
    async fn validate(&self, run: &TestRun) -> Result<Validation>;

    /// Create the remote run record and return its id
    async fn create_cloud_test_run(
        &self,
        run: &TestRun,
        cloud: Arc<dyn CloudClient>,
    ) -> Result<String>;

    /// Create all runner shards
    async fn create_workers(&self, run: &TestRun) -> Result<()>;

    /// Resume every runner; false while runners are not all up yet
    async fn start_workers(&self, run: &TestRun) -> Result<bool>;

    /// Ask every runner to stop
    async fn stop_workers(&self, run: &TestRun) -> Result<()>;
}

/// True when runner arguments send output to the cloud
pub fn has_cloud_output(arguments: &str) -> bool {
    let mut args = arguments.split_whitespace();
    while let Some(arg) = args.next() {
        let value = match arg {
            "-o" | "--out" => args.next(),
            other => other
                .strip_prefix("--out=")
                .or_else(|| other.strip_prefix("-o=")),
        };
        if value.is_some_and(|v| v == "cloud" || v.starts_with("cloud=")) {
            return true;
        }
    }
    false
}

/// Runner shards as Jobs and Services, controlled over HTTP
pub struct StandardLifecycle {
    kube: Arc<dyn KubeClient>,
    runner: Arc<dyn RunnerClient>,
    default_image: String,
}

impl StandardLifecycle {
    /// Lifecycle using the given clients and fallback runner image
    pub fn new(
        kube: Arc<dyn KubeClient>,
        runner: Arc<dyn RunnerClient>,
        default_image: impl Into<String>,
    ) -> Self {
        Self {
            kube,
            runner,
            default_image: default_image.into(),
        }
    }
}

#[async_trait]
impl RunLifecycle for StandardLifecycle {
    async fn validate(&self, run: &TestRun) -> Result<Validation> {
        let name = run.name_any();
        if run.spec.parallelism <= 0 {
            return Err(Error::validation_for_field(
                &name,
                "spec.parallelism",
                format!("must be positive, got {}", run.spec.parallelism),
            ));
        }
        if run.spec.script.path().is_none() {
            return Err(Error::validation_for_field(
                &name,
                "spec.script",
                "either configMap or localFile must be set",
            ));
        }

        let cloud_output = run
            .spec
            .arguments
            .as_deref()
            .is_some_and(has_cloud_output);
        info!(run = %name, cloud_output, "TestRun validated");
        Ok(Validation { cloud_output })
    }

    async fn create_cloud_test_run(
        &self,
        run: &TestRun,
        cloud: Arc<dyn CloudClient>,
    ) -> Result<String> {
        let name = run.name_any();
        let request = CreateTestRun {
            name: name.clone(),
            vus: i64::from(run.spec.parallelism),
            ..Default::default()
        };
        cloud
            .create_test_run(&request)
            .await
            .map_err(|e| e.for_run(&name))
    }

    async fn create_workers(&self, run: &TestRun) -> Result<()> {
        for index in 1..=run.spec.parallelism {
            let job = build_runner_job(run, index, &self.default_image)?;
            self.kube.create_job(&job).await?;
            let service = build_runner_service(run, index)?;
            self.kube.create_service(&service).await?;
        }
        info!(run = %run.name_any(), shards = run.spec.parallelism, "runner shards created");
        Ok(())
    }

    async fn start_workers(&self, run: &TestRun) -> Result<bool> {
        let name = run.name_any();
        let namespace = run.namespace().unwrap_or_default();

        let pods = self.kube.list_runner_pods(&namespace, &name).await?;
        let ready = pods
            .iter()
            .filter(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Running")
            })
            .count();
        let expected = usize::try_from(run.spec.parallelism).unwrap_or_default();
        if ready < expected {
            info!(run = %name, ready, expected, "waiting for runner pods");
            return Ok(false);
        }

        let endpoints = workers::endpoints(self.kube.as_ref(), run).await?;
        if endpoints.len() < expected {
            info!(run = %name, services = endpoints.len(), expected, "waiting for runner services");
            return Ok(false);
        }
        for endpoint in &endpoints {
            self.runner.resume(endpoint).await?;
        }
        info!(run = %name, runners = endpoints.len(), "runners resumed");
        Ok(true)
    }

    async fn stop_workers(&self, run: &TestRun) -> Result<()> {
        let name = run.name_any();
        let endpoints = workers::endpoints(self.kube.as_ref(), run).await?;

        let mut first_error = None;
        for endpoint in &endpoints {
            if let Err(e) = self.runner.stop(endpoint).await {
                warn!(run = %name, runner = %endpoint.name, error = %e, "failed to stop runner");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(run = %name, runners = endpoints.len(), "runners asked to stop");
                Ok(())
            }
        }
    }
}
