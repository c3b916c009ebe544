//! Runner REST API client
//!
//! Each runner shard exposes a small JSON:API endpoint on port 6565 through
//! its Service. The controller reads `/v1/status` to learn whether the shard
//! has stopped and patches it to resume or stop execution.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use loadrun_common::{Error, RUNNER_STATUS_PORT};

/// Address of one runner's REST API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerEndpoint {
    /// Service name, used in logs
    pub name: String,
    /// Base URL without trailing slash, e.g. `http://smoke-service-1.load.svc.cluster.local:6565`
    pub base_url: String,
}

impl WorkerEndpoint {
    /// Endpoint with an explicit base URL
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// In-cluster DNS endpoint of a runner Service
    pub fn from_service(service: &Service) -> Option<Self> {
        let name = service.metadata.name.clone()?;
        let namespace = service.namespace()?;
        let base_url = format!(
            "http://{}.{}.svc.cluster.local:{}",
            name, namespace, RUNNER_STATUS_PORT
        );
        Some(Self { name, base_url })
    }

    /// Status resource URL
    pub fn status_url(&self) -> String {
        format!("{}/v1/status", self.base_url)
    }
}

/// Execution state reported by a runner
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStatus {
    /// Waiting for a resume
    #[serde(default)]
    pub paused: bool,
    /// Finished or stopped executing
    #[serde(default)]
    pub stopped: bool,
    /// Active virtual users
    #[serde(default)]
    pub vus: i64,
    /// Thresholds have failed
    #[serde(default)]
    pub tainted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusDocument<T> {
    data: StatusData<T>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusData<T> {
    #[serde(rename = "type", default = "status_type")]
    type_: String,
    #[serde(default = "status_id")]
    id: String,
    attributes: T,
}

fn status_type() -> String {
    "status".to_string()
}

fn status_id() -> String {
    "default".to_string()
}

#[derive(Debug, Default, Serialize)]
struct StatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stopped: Option<bool>,
}

/// Operations on a single runner
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunnerClient: Send + Sync {
    /// Current execution state
    async fn status(&self, endpoint: &WorkerEndpoint) -> Result<RunnerStatus, Error>;

    /// Resume a paused runner
    async fn resume(&self, endpoint: &WorkerEndpoint) -> Result<(), Error>;

    /// Stop a runner
    async fn stop(&self, endpoint: &WorkerEndpoint) -> Result<(), Error>;
}

/// reqwest-backed [`RunnerClient`] with a per-request timeout
pub struct HttpRunnerClient {
    http: reqwest::Client,
}

impl HttpRunnerClient {
    /// Build a client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("runner-client", e.to_string()))?;
        Ok(Self { http })
    }

    async fn update(&self, endpoint: &WorkerEndpoint, update: StatusUpdate) -> Result<(), Error> {
        let body = StatusDocument {
            data: StatusData {
                type_: status_type(),
                id: status_id(),
                attributes: update,
            },
        };
        let response = self
            .http
            .patch(endpoint.status_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::runner(&endpoint.name, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::runner(
                &endpoint.name,
                format!("status update returned {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RunnerClient for HttpRunnerClient {
    async fn status(&self, endpoint: &WorkerEndpoint) -> Result<RunnerStatus, Error> {
        let response = self
            .http
            .get(endpoint.status_url())
            .send()
            .await
            .map_err(|e| Error::runner(&endpoint.name, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::runner(
                &endpoint.name,
                format!("status returned {}", response.status()),
            ));
        }

        let document: StatusDocument<RunnerStatus> = response
            .json()
            .await
            .map_err(|e| Error::runner(&endpoint.name, format!("invalid status body: {}", e)))?;
        Ok(document.data.attributes)
    }

    async fn resume(&self, endpoint: &WorkerEndpoint) -> Result<(), Error> {
        self.update(
            endpoint,
            StatusUpdate {
                paused: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    async fn stop(&self, endpoint: &WorkerEndpoint) -> Result<(), Error> {
        self.update(
            endpoint,
            StatusUpdate {
                stopped: Some(true),
                ..Default::default()
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client() -> HttpRunnerClient {
        HttpRunnerClient::new(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn endpoint_from_service_uses_cluster_dns() {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("smoke-service-2".to_string()),
                namespace: Some("load".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let endpoint = WorkerEndpoint::from_service(&service).unwrap();
        assert_eq!(
            endpoint.status_url(),
            "http://smoke-service-2.load.svc.cluster.local:6565/v1/status"
        );
    }

    #[test]
    fn endpoint_requires_namespace() {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("orphan".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(WorkerEndpoint::from_service(&service).is_none());
    }

    #[tokio::test]
    async fn status_decodes_json_api_document() {
        let router = Router::new().route(
            "/v1/status",
            get(|| async {
                Json(serde_json::json!({
                    "data": {
                        "type": "status",
                        "id": "default",
                        "attributes": { "status": 7, "paused": false, "stopped": true, "vus": 0, "tainted": false }
                    }
                }))
            }),
        );
        let base = serve(router).await;

        let status = client()
            .status(&WorkerEndpoint::new("smoke-service-1", base))
            .await
            .unwrap();
        assert!(status.stopped);
        assert!(!status.paused);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let router = Router::new().route(
            "/v1/status",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let base = serve(router).await;

        let err = client()
            .status(&WorkerEndpoint::new("smoke-service-1", base))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Runner { .. }));
    }

    #[tokio::test]
    async fn resume_and_stop_patch_status_attributes() {
        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let recorder = seen.clone();
        let router = Router::new().route(
            "/v1/status",
            axum::routing::patch(move |Json(body): Json<serde_json::Value>| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(body);
                    StatusCode::OK
                }
            }),
        );
        let base = serve(router).await;
        let endpoint = WorkerEndpoint::new("smoke-service-1", base);

        client().resume(&endpoint).await.unwrap();
        client().stop(&endpoint).await.unwrap();

        let bodies = seen.lock().unwrap().clone();
        assert_eq!(bodies[0]["data"]["attributes"], serde_json::json!({ "paused": false }));
        assert_eq!(bodies[1]["data"]["attributes"], serde_json::json!({ "stopped": true }));
        assert_eq!(bodies[1]["data"]["type"], "status");
    }

    #[tokio::test]
    async fn unreachable_runner_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client()
            .status(&WorkerEndpoint::new("gone", format!("http://{}", addr)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gone"));
    }
}
