//! Cloud control-plane client
//!
//! Two hosts are involved: the ingest host accepts run lifecycle calls
//! (create, finalize, load zone registration) and the API host answers run
//! state queries. The API host is derived from the ingest host.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::CloudError;
use crate::types::{
    CreateTestRun, CreateTestRunResponse, ErrorResponse, FinishTestRun, PlzRegistration,
    ResultStatus, RunStatus, TestRunState,
};

/// Ingest host used when no override is configured
pub const DEFAULT_HOST: &str = "https://ingest.k6.io";

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the controller needs from the control plane
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Create a remote run record, returning its id
    async fn create_test_run(&self, request: &CreateTestRun) -> Result<String, CloudError>;

    /// Mark a remote run finished
    async fn finish_test_run(&self, test_run_id: &str) -> Result<(), CloudError>;

    /// Fetch the remote run status
    async fn test_run_state(&self, test_run_id: &str) -> Result<TestRunState, CloudError>;
}

/// reqwest-backed [`CloudClient`]
#[derive(Clone, Debug)]
pub struct HttpCloudClient {
    http: reqwest::Client,
    host: String,
    api_host: String,
    token: String,
}

impl HttpCloudClient {
    /// Build a client for `host` (or [`DEFAULT_HOST`]) authenticating with `token`
    pub fn new(token: impl Into<String>, host: Option<&str>) -> Result<Self, CloudError> {
        Self::with_timeout(token, host, DEFAULT_TIMEOUT)
    }

    /// Same as [`new`](Self::new) with an explicit request timeout
    pub fn with_timeout(
        token: impl Into<String>,
        host: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CloudError::Build(e.to_string()))?;

        let host = host
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HOST)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http,
            api_host: api_host_for(&host),
            host,
            token: token.into(),
        })
    }

    /// Ingest host in use
    pub fn host(&self) -> &str {
        &self.host
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<Response, CloudError> {
        debug!(%method, url, "cloud request");

        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", format!("Token {}", self.token));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| CloudError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let raw = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorResponse>(&raw) {
            Ok(parsed) if !parsed.error.message.is_empty() => parsed.error.message,
            _ => raw,
        };
        Err(CloudError::Http {
            url: url.to_string(),
            status,
            message,
        })
    }

    async fn decode<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, CloudError> {
        response.json::<T>().await.map_err(|e| CloudError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// Run-state queries go to the API host, which sits next to the ingest host
fn api_host_for(host: &str) -> String {
    if host.contains("://ingest.") {
        host.replacen("://ingest.", "://api.", 1)
    } else {
        host.to_string()
    }
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn create_test_run(&self, request: &CreateTestRun) -> Result<String, CloudError> {
        let url = format!("{}/v1/tests", self.host);
        let response = self.send(Method::POST, &url, Some(request)).await?;
        let created: CreateTestRunResponse = Self::decode(&url, response).await?;
        Ok(created.reference_id)
    }

    async fn finish_test_run(&self, test_run_id: &str) -> Result<(), CloudError> {
        let url = format!("{}/v1/tests/{}", self.host, test_run_id);
        let body = FinishTestRun {
            result_status: ResultStatus::Passed,
            run_status: RunStatus::FINISHED,
            thresholds: BTreeMap::new(),
        };
        self.send(Method::POST, &url, Some(&body)).await?;
        Ok(())
    }

    async fn test_run_state(&self, test_run_id: &str) -> Result<TestRunState, CloudError> {
        let url = format!(
            "{}/loadtests/v4/test_runs({})?$select=id,run_status",
            self.api_host, test_run_id
        );
        let response = self.send::<()>(Method::GET, &url, None).await?;
        Self::decode(&url, response).await
    }
}

/// Private load zone registration, used by load zone management rather than
/// by TestRun reconciliation
impl HttpCloudClient {
    /// Register a private load zone
    pub async fn register_plz(&self, registration: &PlzRegistration) -> Result<(), CloudError> {
        let url = format!("{}/v1/load-zones", self.host);
        self.send(Method::POST, &url, Some(registration)).await?;
        Ok(())
    }

    /// Remove a private load zone
    pub async fn deregister_plz(&self, name: &str) -> Result<(), CloudError> {
        let url = format!("{}/v1/load-zones/{}", self.host, name);
        self.send::<()>(Method::DELETE, &url, None).await?;
        Ok(())
    }
}
