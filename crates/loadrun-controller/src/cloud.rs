//! Cloud coordination for TestRuns
//!
//! One cloud client is built lazily from the first run that needs it and then
//! shared by every reconciliation in the process.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use loadrun_cloud::{CloudClient, HttpCloudClient};
use loadrun_common::crd::TestRun;
use loadrun_common::{Error, Result, CLOUD_TOKEN_KEY};

use crate::client::KubeClient;

/// Builds cloud clients from a token and optional host override
#[cfg_attr(test, automock)]
pub trait CloudClientFactory: Send + Sync {
    /// Build a client
    fn build(&self, token: &str, host: Option<String>) -> Result<Arc<dyn CloudClient>>;
}

/// Factory producing [`HttpCloudClient`]s
pub struct HttpCloudClientFactory {
    timeout: Duration,
}

impl HttpCloudClientFactory {
    /// Factory whose clients use the given request timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpCloudClientFactory {
    fn default() -> Self {
        Self::new(loadrun_cloud::client::DEFAULT_TIMEOUT)
    }
}

impl CloudClientFactory for HttpCloudClientFactory {
    fn build(&self, token: &str, host: Option<String>) -> Result<Arc<dyn CloudClient>> {
        let client = HttpCloudClient::with_timeout(token, host.as_deref(), self.timeout)?;
        info!(host = %client.host(), "cloud client created");
        Ok(Arc::new(client))
    }
}

/// Process-wide cloud client holder plus the checks built on it
pub struct CloudCoordinator {
    factory: Arc<dyn CloudClientFactory>,
    client: Mutex<Option<Arc<dyn CloudClient>>>,
}

impl CloudCoordinator {
    /// Coordinator that builds its client with `factory` on first use
    pub fn new(factory: Arc<dyn CloudClientFactory>) -> Self {
        Self {
            factory,
            client: Mutex::new(None),
        }
    }

    /// The client, if one has been built
    pub async fn client(&self) -> Option<Arc<dyn CloudClient>> {
        self.client.lock().await.clone()
    }

    /// Return the shared client, building it from the run's token Secret if needed
    ///
    /// `Ok(None)` means the Secret does not exist yet; the caller should retry
    /// shortly. A Secret without a `token` key is a configuration error.
    pub async fn ensure_client(
        &self,
        kube: &dyn KubeClient,
        run: &TestRun,
    ) -> Result<Option<Arc<dyn CloudClient>>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(Some(client.clone()));
        }

        let name = run.name_any();
        let secret_name = run
            .spec
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::validation_for_field(&name, "spec.token", "cloud runs need a token Secret")
            })?;
        let namespace = run.namespace().unwrap_or_default();

        let Some(secret) = kube.get_secret(&namespace, secret_name).await? else {
            debug!(run = %name, secret = %secret_name, "token secret not found yet");
            return Ok(None);
        };

        let token = secret
            .data
            .as_ref()
            .and_then(|data| data.get(CLOUD_TOKEN_KEY))
            .map(|bytes| String::from_utf8_lossy(&bytes.0).trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::validation_for_field(
                    &name,
                    "spec.token",
                    format!("secret {} has no '{}' key", secret_name, CLOUD_TOKEN_KEY),
                )
            })?;

        let client = self.factory.build(&token, run.cloud_host())?;
        *slot = Some(client.clone());
        Ok(Some(client))
    }

    /// Whether the cloud has aborted this run
    ///
    /// Anything short of a definite "aborted" answer, including errors, is
    /// reported as false.
    pub async fn should_abort(&self, run: &TestRun) -> bool {
        let name = run.name_any();
        let test_run_id = run.test_run_id();
        if test_run_id.is_empty() {
            error!(run = %name, "cannot check abort state of a run without a test run id");
            return false;
        }

        let Some(client) = self.client().await else {
            warn!(run = %name, "cloud client not initialized, skipping abort check");
            return false;
        };

        match client.test_run_state(test_run_id).await {
            Ok(state) => {
                info!(run = %name, test_run_id, run_status = %state.run_status, "received test run state");
                state.aborted()
            }
            Err(e) => {
                error!(run = %name, test_run_id, error = %e, "failed to get test run state");
                false
            }
        }
    }

    /// Finalize the remote run record
    pub async fn finalize(&self, run: &TestRun) -> Result<()> {
        let name = run.name_any();
        let test_run_id = run.test_run_id();
        if test_run_id.is_empty() {
            return Err(Error::cloud_for(&name, "cannot finalize a run without a test run id"));
        }
        let client = self
            .client()
            .await
            .ok_or_else(|| Error::cloud_for(&name, "cloud client not initialized"))?;

        client
            .finish_test_run(test_run_id)
            .await
            .map_err(|e| e.for_run(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use loadrun_cloud::{CloudError, RunStatus, TestRunState};
    use loadrun_common::crd::{EnvVar, RunnerSpec};
    use loadrun_common::CLOUD_HOST_ENV;

    use crate::client::MockKubeClient;
    use crate::testing::{plz_run, MockCloud};

    fn token_secret(token: Option<&str>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("cloud-token".to_string()),
                ..Default::default()
            },
            data: token.map(|t| {
                BTreeMap::from([(CLOUD_TOKEN_KEY.to_string(), ByteString(t.as_bytes().to_vec()))])
            }),
            ..Default::default()
        }
    }

    fn coordinator_with(cloud: MockCloud) -> CloudCoordinator {
        let shared: Arc<dyn CloudClient> = Arc::new(cloud);
        let mut factory = MockCloudClientFactory::new();
        factory
            .expect_build()
            .returning(move |_, _| Ok(shared.clone()));
        CloudCoordinator::new(Arc::new(factory))
    }

    async fn primed(cloud: MockCloud) -> CloudCoordinator {
        let coordinator = coordinator_with(cloud);
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(Some(token_secret(Some("abc")))));
        let run = plz_run("plz", 1, "42");
        assert!(coordinator.ensure_client(&kube, &run).await.unwrap().is_some());
        coordinator
    }

    #[tokio::test]
    async fn missing_secret_is_not_ready() {
        let coordinator = CloudCoordinator::new(Arc::new(MockCloudClientFactory::new()));
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|_, _| Ok(None));

        let run = plz_run("plz", 1, "42");
        assert!(coordinator.ensure_client(&kube, &run).await.unwrap().is_none());
        assert!(coordinator.client().await.is_none());
    }

    /// Story: the first PLZ run bootstraps the client for everyone
    ///
    /// The token Secret is read and the client built exactly once; later
    /// reconciliations reuse it without touching the Secret again. The host
    /// override comes from the runner environment.
    #[tokio::test]
    async fn story_client_is_built_once_and_reused() {
        let mut factory = MockCloudClientFactory::new();
        factory
            .expect_build()
            .withf(|token, host| {
                token == "abc" && host.as_deref() == Some("https://cloud.example")
            })
            .times(1)
            .returning(|_, _| Ok(Arc::new(MockCloud::new()) as Arc<dyn CloudClient>));
        let coordinator = CloudCoordinator::new(Arc::new(factory));

        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .withf(|ns, name| ns == "load" && name == "cloud-token")
            .times(1)
            .returning(|_, _| Ok(Some(token_secret(Some("abc\n")))));

        let mut run = plz_run("plz", 1, "42");
        run.spec.runner = RunnerSpec {
            image: None,
            env: vec![EnvVar {
                name: CLOUD_HOST_ENV.to_string(),
                value: "https://cloud.example".to_string(),
            }],
        };

        assert!(coordinator.ensure_client(&kube, &run).await.unwrap().is_some());
        assert!(coordinator.ensure_client(&kube, &run).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn secret_without_token_key_is_invalid() {
        let coordinator = CloudCoordinator::new(Arc::new(MockCloudClientFactory::new()));
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(Some(token_secret(None))));

        let Err(err) = coordinator
            .ensure_client(&kube, &plz_run("plz", 1, "42"))
            .await
        else {
            panic!("a secret without the token key must be rejected");
        };
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn aborted_state_requests_abort() {
        let mut cloud = MockCloud::new();
        cloud.expect_test_run_state().returning(|_| {
            Ok(TestRunState {
                id: 42,
                run_status: RunStatus::ABORTED_USER,
            })
        });
        let coordinator = primed(cloud).await;

        let mut run = plz_run("plz", 1, "42");
        run.initialize();
        assert!(coordinator.should_abort(&run).await);
    }

    /// Story: the cloud API is having a bad day
    ///
    /// A 500 or an unreadable body must never be mistaken for an abort:
    /// tearing down a healthy run is worse than noticing an abort late.
    #[tokio::test]
    async fn story_abort_check_fails_closed() {
        let mut cloud = MockCloud::new();
        let mut calls = 0;
        cloud.expect_test_run_state().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(CloudError::Http {
                    url: "http://cloud/loadtests".to_string(),
                    status: 500,
                    message: "internal".to_string(),
                })
            } else {
                Err(CloudError::Decode {
                    url: "http://cloud/loadtests".to_string(),
                    message: "expected value".to_string(),
                })
            }
        });
        let coordinator = primed(cloud).await;

        let mut run = plz_run("plz", 1, "42");
        run.initialize();
        assert!(!coordinator.should_abort(&run).await);
        assert!(!coordinator.should_abort(&run).await);
    }

    #[tokio::test]
    async fn abort_check_without_id_or_client_is_false() {
        let coordinator = CloudCoordinator::new(Arc::new(MockCloudClientFactory::new()));
        let run = plz_run("plz", 1, "42");
        // no status yet, so no test run id
        assert!(!coordinator.should_abort(&run).await);

        let mut run = run;
        run.initialize();
        assert!(!coordinator.should_abort(&run).await);
    }

    #[tokio::test]
    async fn finalize_sends_test_run_id() {
        let mut cloud = MockCloud::new();
        cloud
            .expect_finish_test_run()
            .withf(|id| id == "42")
            .times(1)
            .returning(|_| Ok(()));
        let coordinator = primed(cloud).await;

        let mut run = plz_run("plz", 1, "42");
        run.initialize();
        coordinator.finalize(&run).await.unwrap();
    }

    #[tokio::test]
    async fn finalize_error_carries_run_name() {
        let mut cloud = MockCloud::new();
        cloud.expect_finish_test_run().returning(|_| {
            Err(CloudError::Transport {
                url: "http://cloud/v1/tests/42".to_string(),
                message: "timeout".to_string(),
            })
        });
        let coordinator = primed(cloud).await;

        let mut run = plz_run("plz", 1, "42");
        run.initialize();
        let err = coordinator.finalize(&run).await.unwrap_err();
        assert_eq!(err.run(), Some("plz"));
    }
}
