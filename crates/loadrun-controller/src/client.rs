//! Kubernetes access for the TestRun controller
//!
//! Everything the reconciler reads or writes goes through [`KubeClient`] so
//! the state machine can be exercised against an in-memory store in tests.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use loadrun_common::crd::TestRun;
use loadrun_common::error::{is_already_exists, is_not_found};
use loadrun_common::{runner_selector, Error, FIELD_MANAGER};

/// Kubernetes operations used by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a TestRun, `None` if it no longer exists
    async fn get_test_run(&self, namespace: &str, name: &str) -> Result<Option<TestRun>, Error>;

    /// Apply a JSON merge patch to the status subresource
    ///
    /// The patch may carry `metadata.resourceVersion`, in which case the API
    /// server rejects it with 409 if the object changed since that version.
    async fn patch_test_run_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Delete a TestRun; already gone is success
    async fn delete_test_run(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Runner Services of a run
    async fn list_runner_services(&self, namespace: &str, run: &str)
        -> Result<Vec<Service>, Error>;

    /// Runner Jobs of a run
    async fn list_runner_jobs(&self, namespace: &str, run: &str) -> Result<Vec<Job>, Error>;

    /// Runner Pods of a run
    async fn list_runner_pods(&self, namespace: &str, run: &str) -> Result<Vec<Pod>, Error>;

    /// Delete a Job and, in the background, its Pods; already gone is success
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a Secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a Job; already existing is success
    async fn create_job(&self, job: &Job) -> Result<(), Error>;

    /// Create a Service; already existing is success
    async fn create_service(&self, service: &Service) -> Result<(), Error>;
}

/// [`KubeClient`] backed by the API server
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn runner_list_params(run: &str) -> ListParams {
        ListParams::default().labels(&runner_selector(run))
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_test_run(&self, namespace: &str, name: &str) -> Result<Option<TestRun>, Error> {
        let api: Api<TestRun> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_test_run_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<TestRun> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch_status(name, &params, &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn delete_test_run(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<TestRun> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(run = %name, "deleted TestRun");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(run = %name, "TestRun already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_runner_services(
        &self,
        namespace: &str,
        run: &str,
    ) -> Result<Vec<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Self::runner_list_params(run)).await?.items)
    }

    async fn list_runner_jobs(&self, namespace: &str, run: &str) -> Result<Vec<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Self::runner_list_params(run)).await?.items)
    }

    async fn list_runner_pods(&self, namespace: &str, run: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Self::runner_list_params(run)).await?.items)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(job = %name, "runner job already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_job(&self, job: &Job) -> Result<(), Error> {
        let namespace = job.namespace().unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), job).await {
            Ok(_) => {
                info!(job = %job.name_any(), "created runner job");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!(job = %job.name_any(), "runner job already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        let namespace = service.namespace().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), service).await {
            Ok(_) => {
                info!(service = %service.name_any(), "created runner service");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!(service = %service.name_any(), "runner service already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
