//! Shared test fixtures

use std::sync::{Arc, Mutex};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, PodStatus, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use mockall::mock;

use loadrun_cloud::{CloudClient, CloudError, CreateTestRun, TestRunState};
use loadrun_common::crd::{ConfigMapScript, ScriptSpec, TestRun, TestRunSpec};
use loadrun_common::{runner_labels, Error};

use crate::client::MockKubeClient;

// CloudClient lives in loadrun-cloud, so its automock is not visible here
mock! {
    pub Cloud {}

    #[async_trait::async_trait]
    impl CloudClient for Cloud {
        async fn create_test_run(&self, request: &CreateTestRun) -> Result<String, CloudError>;
        async fn finish_test_run(&self, test_run_id: &str) -> Result<(), CloudError>;
        async fn test_run_state(&self, test_run_id: &str) -> Result<TestRunState, CloudError>;
    }
}

pub const NAMESPACE: &str = "load";

pub fn sample_run(name: &str, parallelism: i32) -> TestRun {
    let mut run = TestRun::new(
        name,
        TestRunSpec {
            parallelism,
            script: ScriptSpec {
                config_map: Some(ConfigMapScript {
                    name: format!("{}-script", name),
                    file: "test.js".to_string(),
                }),
                local_file: None,
            },
            ..Default::default()
        },
    );
    run.metadata.namespace = Some(NAMESPACE.to_string());
    run.metadata.uid = Some(format!("uid-{}", name));
    run.metadata.resource_version = Some("1".to_string());
    run
}

pub fn plz_run(name: &str, parallelism: i32, test_run_id: &str) -> TestRun {
    let mut run = sample_run(name, parallelism);
    run.spec.test_run_id = Some(test_run_id.to_string());
    run.spec.token = Some("cloud-token".to_string());
    run
}

fn runner_meta(namespace: &str, name: String, run: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        labels: Some(runner_labels(run)),
        ..Default::default()
    }
}

pub fn runner_service(namespace: &str, run: &str, index: i32) -> Service {
    Service {
        metadata: runner_meta(namespace, format!("{}-service-{}", run, index), run),
        ..Default::default()
    }
}

pub fn runner_job(namespace: &str, run: &str, index: i32) -> Job {
    Job {
        metadata: runner_meta(namespace, format!("{}-{}", run, index), run),
        ..Default::default()
    }
}

pub fn runner_pod(namespace: &str, run: &str, index: i32, phase: &str) -> Pod {
    Pod {
        metadata: runner_meta(namespace, format!("{}-{}-abcde", run, index), run),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn conflict() -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

/// In-memory stand-in for the API server's copy of one TestRun
///
/// Status patches are applied as JSON merge patches and honour the
/// `metadata.resourceVersion` precondition.
#[derive(Clone)]
pub struct RunStore {
    inner: Arc<Mutex<Option<TestRun>>>,
    patches: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl RunStore {
    pub fn new(run: TestRun) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(run))),
            patches: Arc::default(),
        }
    }

    pub fn get(&self) -> Option<TestRun> {
        self.inner.lock().unwrap().clone()
    }

    pub fn current(&self) -> TestRun {
        self.get().expect("run should exist")
    }

    pub fn patch_count(&self) -> usize {
        self.patches.lock().unwrap().len()
    }

    pub fn last_patch(&self) -> Option<serde_json::Value> {
        self.patches.lock().unwrap().last().cloned()
    }

    /// Mutate the stored run as another writer would, bumping its version
    pub fn external_write(&self, f: impl FnOnce(&mut TestRun)) {
        let mut guard = self.inner.lock().unwrap();
        let run = guard.as_mut().expect("run should exist");
        f(run);
        bump(run);
    }

    pub fn delete(&self) {
        *self.inner.lock().unwrap() = None;
    }

    pub fn apply_status_patch(&self, patch: &serde_json::Value) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        let Some(run) = guard.as_mut() else {
            return Err(Error::from(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            })));
        };

        let expected = patch["metadata"]["resourceVersion"].as_str();
        if expected.is_some() && expected != run.metadata.resource_version.as_deref() {
            return Err(conflict());
        }

        let mut doc = serde_json::to_value(&*run).unwrap();
        json_patch::merge(
            &mut doc,
            &serde_json::json!({ "status": patch["status"].clone() }),
        );
        *run = serde_json::from_value(doc).unwrap();
        bump(run);
        self.patches.lock().unwrap().push(patch.clone());
        Ok(())
    }

    /// Wire `get_test_run` and `patch_test_run_status` to this store
    pub fn attach(&self, kube: &mut MockKubeClient) {
        let reader = self.clone();
        kube.expect_get_test_run()
            .returning(move |_, _| Ok(reader.get()));
        let writer = self.clone();
        kube.expect_patch_test_run_status()
            .returning(move |_, _, patch| writer.apply_status_patch(patch));
    }
}

fn bump(run: &mut TestRun) {
    let next = run
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    run.metadata.resource_version = Some(next.to_string());
}
