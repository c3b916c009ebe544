//! Runner shard discovery, stop detection and teardown
//!
//! Shards are found by label on every call; nothing is cached between
//! reconciliations.

use kube::ResourceExt;
use tracing::{error, info, warn};

use loadrun_common::crd::TestRun;
use loadrun_common::{metrics, Error, Result};

use crate::client::KubeClient;
use crate::runner::{RunnerClient, WorkerEndpoint};

/// Runner REST endpoints of a run, one per Service
pub async fn endpoints(kube: &dyn KubeClient, run: &TestRun) -> Result<Vec<WorkerEndpoint>> {
    let namespace = run.namespace().unwrap_or_default();
    let services = kube
        .list_runner_services(&namespace, &run.name_any())
        .await?;
    Ok(services
        .iter()
        .filter_map(WorkerEndpoint::from_service)
        .collect())
}

/// True once no runner of the run is still executing
///
/// A runner that cannot be reached, answers with an error, or returns an
/// unreadable body is counted as running. With no runners at all the answer
/// is true.
pub async fn poll_stopped(
    kube: &dyn KubeClient,
    runner: &dyn RunnerClient,
    run: &TestRun,
) -> Result<bool> {
    let endpoints = endpoints(kube, run).await?;
    let total = endpoints.len();
    let mut running = 0usize;

    for endpoint in &endpoints {
        match runner.status(endpoint).await {
            Ok(status) if status.stopped => {}
            Ok(_) => running += 1,
            Err(e) => {
                error!(
                    run = %run.name_any(),
                    runner = %endpoint.name,
                    error = %e,
                    "could not read runner status, assuming it is still running"
                );
                running += 1;
            }
        }
    }

    info!(
        run = %run.name_any(),
        test_run_id = %run.test_run_id(),
        running,
        total,
        "{}/{} runners stopped execution",
        total - running,
        total
    );

    Ok(running == 0)
}

/// Result of a bulk runner deletion
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KillOutcome {
    /// Jobs matched by the selector
    pub matched: usize,
    /// Jobs deleted, including ones that were already gone
    pub deleted: usize,
    /// `(job, error)` for each failed deletion
    pub failures: Vec<(String, String)>,
}

impl KillOutcome {
    /// Every matched job is gone
    pub fn all_deleted(&self) -> bool {
        self.failures.is_empty() && self.deleted == self.matched
    }

    /// Aggregate the failures into one error
    pub fn into_result(self, run: &str) -> Result<()> {
        if self.all_deleted() {
            return Ok(());
        }
        let message = self
            .failures
            .iter()
            .map(|(job, e)| format!("{}: {}", job, e))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::WorkerCleanup {
            run: run.to_string(),
            failed: self.failures.len(),
            total: self.matched,
            message,
        })
    }
}

/// Delete every runner Job of the run with background propagation
///
/// A failed deletion is logged and recorded; the remaining jobs are still
/// attempted. Only a failure to list the jobs is returned as an error.
pub async fn kill_all(kube: &dyn KubeClient, run: &TestRun) -> Result<KillOutcome> {
    let namespace = run.namespace().unwrap_or_default();
    let name = run.name_any();
    let jobs = kube.list_runner_jobs(&namespace, &name).await?;

    let mut outcome = KillOutcome {
        matched: jobs.len(),
        ..Default::default()
    };

    for job in &jobs {
        let job_name = job.name_any();
        match kube.delete_job(&namespace, &job_name).await {
            Ok(()) => outcome.deleted += 1,
            Err(e) => {
                warn!(run = %name, job = %job_name, error = %e, "failed to delete runner job");
                outcome.failures.push((job_name, e.to_string()));
            }
        }
    }

    metrics::record_runner_kills(outcome.deleted, outcome.failures.len());
    info!(
        run = %name,
        matched = outcome.matched,
        deleted = outcome.deleted,
        failed = outcome.failures.len(),
        "runner jobs deleted"
    );

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use crate::runner::{MockRunnerClient, RunnerStatus};
    use crate::testing::{runner_job, runner_service, sample_run};

    fn stopped(stopped: bool) -> RunnerStatus {
        RunnerStatus {
            stopped,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn no_runners_means_all_stopped() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_runner_services()
            .returning(|_, _| Ok(vec![]));
        let runner = MockRunnerClient::new();

        let run = sample_run("smoke", 3);
        assert!(poll_stopped(&kube, &runner, &run).await.unwrap());
    }

    /// Story: one runner is unreachable while another has finished
    ///
    /// An unreachable runner might still be generating load, so the run must
    /// not be treated as stopped.
    #[tokio::test]
    async fn story_unreachable_runner_counts_as_running() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_runner_services().returning(|ns, run| {
            Ok(vec![runner_service(ns, run, 1), runner_service(ns, run, 2)])
        });
        let mut runner = MockRunnerClient::new();
        runner.expect_status().returning(|endpoint| {
            if endpoint.name.ends_with("-1") {
                Err(Error::runner(&endpoint.name, "connection refused"))
            } else {
                Ok(stopped(true))
            }
        });

        let run = sample_run("smoke", 2);
        assert!(!poll_stopped(&kube, &runner, &run).await.unwrap());
    }

    #[tokio::test]
    async fn all_stopped_runners() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_runner_services().returning(|ns, run| {
            Ok((1..=3).map(|i| runner_service(ns, run, i)).collect())
        });
        let mut runner = MockRunnerClient::new();
        runner
            .expect_status()
            .times(3)
            .returning(|_| Ok(stopped(true)));

        let run = sample_run("smoke", 3);
        assert!(poll_stopped(&kube, &runner, &run).await.unwrap());
    }

    #[tokio::test]
    async fn list_failure_is_surfaced() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_runner_services()
            .returning(|_, _| Err(Error::internal("list failed")));
        let runner = MockRunnerClient::new();

        let run = sample_run("smoke", 1);
        assert!(poll_stopped(&kube, &runner, &run).await.is_err());
    }

    #[tokio::test]
    async fn kill_all_deletes_every_job() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_runner_jobs().returning(|ns, run| {
            Ok((1..=3).map(|i| runner_job(ns, run, i)).collect())
        });
        kube.expect_delete_job().times(3).returning(|_, _| Ok(()));

        let run = sample_run("smoke", 3);
        let outcome = kill_all(&kube, &run).await.unwrap();
        assert!(outcome.all_deleted());
        assert_eq!(outcome.deleted, 3);
        assert!(outcome.into_result("smoke").is_ok());
    }

    /// Story: one runner job refuses to be deleted
    ///
    /// The sweep continues past the failure so the other shards are still
    /// torn down, and the caller receives one aggregate error to retry on.
    #[tokio::test]
    async fn story_partial_delete_failure_is_aggregated() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_runner_jobs().returning(|ns, run| {
            Ok((1..=3).map(|i| runner_job(ns, run, i)).collect())
        });
        kube.expect_delete_job().times(3).returning(|_, name| {
            if name == "smoke-2" {
                Err(Error::internal("forbidden"))
            } else {
                Ok(())
            }
        });

        let run = sample_run("smoke", 3);
        let outcome = kill_all(&kube, &run).await.unwrap();
        assert!(!outcome.all_deleted());
        assert_eq!(outcome.deleted, 2);

        match outcome.into_result("smoke") {
            Err(Error::WorkerCleanup {
                failed,
                total,
                message,
                ..
            }) => {
                assert_eq!((failed, total), (1, 3));
                assert!(message.contains("smoke-2"));
            }
            other => panic!("expected WorkerCleanup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn kill_all_with_no_jobs_is_complete() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_runner_jobs().returning(|_, _| Ok(vec![]));

        let outcome = kill_all(&kube, &sample_run("smoke", 1)).await.unwrap();
        assert!(outcome.all_deleted());
        assert_eq!(outcome.matched, 0);
    }
}
