//! Mapping runner pod events to TestRun reconcile requests

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::ResourceExt;

use loadrun_common::crd::TestRun;
use loadrun_common::TEST_RUN_LABEL;

/// Watch configuration for runner pods
///
/// Only pods carrying the test-run label are delivered.
pub fn runner_pod_watcher_config() -> watcher::Config {
    watcher::Config::default().labels(TEST_RUN_LABEL)
}

/// The TestRun a runner pod belongs to
pub fn runner_pod_to_run(pod: Pod) -> Option<ObjectRef<TestRun>> {
    let run = pod.labels().get(TEST_RUN_LABEL)?;
    if run.is_empty() {
        return None;
    }
    let namespace = pod.namespace()?;
    Some(ObjectRef::new(run).within(&namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{runner_pod, NAMESPACE};

    #[test]
    fn runner_pod_maps_to_its_run() {
        let pod = runner_pod(NAMESPACE, "smoke", 1, "Running");
        let target = runner_pod_to_run(pod).unwrap();
        assert_eq!(target.name, "smoke");
        assert_eq!(target.namespace.as_deref(), Some(NAMESPACE));
    }

    #[test]
    fn unlabeled_pod_is_dropped() {
        let mut pod = runner_pod(NAMESPACE, "smoke", 1, "Running");
        pod.metadata.labels = None;
        assert!(runner_pod_to_run(pod).is_none());
    }

    #[test]
    fn pod_without_namespace_is_dropped() {
        let mut pod = runner_pod(NAMESPACE, "smoke", 1, "Running");
        pod.metadata.namespace = None;
        assert!(runner_pod_to_run(pod).is_none());
    }

    #[test]
    fn watcher_selects_on_label_existence() {
        let config = runner_pod_watcher_config();
        assert_eq!(config.label_selector.as_deref(), Some(TEST_RUN_LABEL));
    }
}
