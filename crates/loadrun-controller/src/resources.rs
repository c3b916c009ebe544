//! Runner Job and Service construction
//!
//! Shard `i` of `n` (1-based) gets Job `<run>-<i>` and Service
//! `<run>-service-<i>`. Both are owned by the TestRun so deleting the run
//! garbage-collects them.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, PodSpec,
    PodTemplateSpec, SecretKeySelector, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use loadrun_common::crd::TestRun;
use loadrun_common::{
    runner_labels, Error, Result, CLOUD_TOKEN_KEY, RUNNER_INDEX_LABEL, RUNNER_STATUS_PORT,
};

/// Runner image used when the TestRun does not name one
pub const DEFAULT_RUNNER_IMAGE: &str = "grafana/k6:latest";

const SCRIPT_VOLUME: &str = "test-script";
const SCRIPT_MOUNT_PATH: &str = "/test";

/// Name of the runner Job for shard `index`
pub fn runner_job_name(run: &str, index: i32) -> String {
    format!("{}-{}", run, index)
}

/// Name of the runner Service for shard `index`
pub fn runner_service_name(run: &str, index: i32) -> String {
    format!("{}-service-{}", run, index)
}

/// Execution segment and full segment sequence for shard `index` of `total`
///
/// A single shard runs the whole test and needs no segment.
pub fn execution_segment(index: i32, total: i32) -> Option<(String, String)> {
    if total <= 1 {
        return None;
    }
    let segment = format!("{}/{}:{}/{}", index - 1, total, index, total);
    let sequence = (0..=total)
        .map(|i| match i {
            0 => "0".to_string(),
            i if i == total => "1".to_string(),
            i => format!("{}/{}", i, total),
        })
        .collect::<Vec<_>>()
        .join(",");
    Some((segment, sequence))
}

fn shard_labels(run: &str, index: i32) -> BTreeMap<String, String> {
    let mut labels = runner_labels(run);
    labels.insert(RUNNER_INDEX_LABEL.to_string(), index.to_string());
    labels
}

fn owner_reference(run: &TestRun) -> Result<OwnerReference> {
    run.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context("resources", format!("TestRun {} has no uid", run.name_any()))
    })
}

fn runner_command(run: &TestRun, index: i32, script: &str) -> Vec<String> {
    let mut command = vec!["k6".to_string(), "run".to_string(), "--quiet".to_string()];

    if let Some((segment, sequence)) = execution_segment(index, run.spec.parallelism) {
        command.push(format!("--execution-segment={}", segment));
        command.push(format!("--execution-segment-sequence={}", sequence));
    }
    if let Some(arguments) = &run.spec.arguments {
        command.extend(arguments.split_whitespace().map(str::to_string));
    }

    command.push(script.to_string());
    command.push(format!("--address=0.0.0.0:{}", RUNNER_STATUS_PORT));
    command.push("--paused".to_string());
    command.push("--tag".to_string());
    command.push(format!("instance_id={}", index));
    command.push("--tag".to_string());
    command.push(format!("job_name={}", runner_job_name(&run.name_any(), index)));
    command
}

fn runner_env(run: &TestRun) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = run
        .spec
        .runner
        .env
        .iter()
        .map(|e| EnvVar {
            name: e.name.clone(),
            value: Some(e.value.clone()),
            ..Default::default()
        })
        .collect();

    let test_run_id = run.test_run_id();
    if !test_run_id.is_empty() {
        env.push(EnvVar {
            name: "K6_CLOUD_PUSH_REF_ID".to_string(),
            value: Some(test_run_id.to_string()),
            ..Default::default()
        });
    }
    if let Some(secret) = run.spec.token.as_deref().filter(|t| !t.is_empty()) {
        env.push(EnvVar {
            name: "K6_CLOUD_TOKEN".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.to_string(),
                    key: CLOUD_TOKEN_KEY.to_string(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    env
}

/// Runner Job for shard `index`, started paused
pub fn build_runner_job(run: &TestRun, index: i32, default_image: &str) -> Result<Job> {
    let name = run.name_any();
    let namespace = run
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "TestRun must be namespaced"))?;
    let script = run
        .spec
        .script
        .path()
        .ok_or_else(|| Error::validation_for_field(&name, "spec.script", "no script source"))?;
    let labels = shard_labels(&name, index);

    let (volumes, mounts) = match &run.spec.script.config_map {
        Some(cm) => (
            Some(vec![Volume {
                name: SCRIPT_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: cm.name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            Some(vec![VolumeMount {
                name: SCRIPT_VOLUME.to_string(),
                mount_path: SCRIPT_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
        ),
        None => (None, None),
    };

    let container = Container {
        name: "k6".to_string(),
        image: Some(
            run.spec
                .runner
                .image
                .clone()
                .unwrap_or_else(|| default_image.to_string()),
        ),
        command: Some(runner_command(run, index, &script)),
        env: Some(runner_env(run)),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(RUNNER_STATUS_PORT),
            ..Default::default()
        }]),
        volume_mounts: mounts,
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(runner_job_name(&name, index)),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(run)?]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    hostname: Some(runner_job_name(&name, index)),
                    containers: vec![container],
                    volumes,
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// ClusterIP Service exposing the REST API of shard `index`
pub fn build_runner_service(run: &TestRun, index: i32) -> Result<Service> {
    let name = run.name_any();
    let namespace = run
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "TestRun must be namespaced"))?;

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(runner_service_name(&name, index)),
            namespace: Some(namespace),
            labels: Some(runner_labels(&name)),
            owner_references: Some(vec![owner_reference(run)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(shard_labels(&name, index)),
            ports: Some(vec![ServicePort {
                name: Some("http-api".to_string()),
                port: i32::from(RUNNER_STATUS_PORT),
                target_port: Some(IntOrString::Int(i32::from(RUNNER_STATUS_PORT))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}
