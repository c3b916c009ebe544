//! Common types for loadrun: the TestRun CRD, errors, and telemetry

#![deny(missing_docs)]

use std::collections::BTreeMap;

pub mod crd;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Runner labels
// =============================================================================
// Every runner Job, Service and Pod carries these three labels. The poller
// and the event router both depend on them, so they live here rather than in
// the controller crate.

/// `app` label key shared by all resources created for a test run
pub const APP_LABEL_KEY: &str = "app";

/// `app` label value for loadrun-managed resources
pub const APP_LABEL_VALUE: &str = "loadrun";

/// Label carrying the owning TestRun name
pub const TEST_RUN_LABEL: &str = "loadrun.dev/test-run";

/// Marker label set to `"true"` on runner shards
pub const RUNNER_LABEL: &str = "runner";

/// Label carrying the 1-based shard index of a runner
pub const RUNNER_INDEX_LABEL: &str = "loadrun.dev/runner-index";

/// Port the runner REST API listens on
pub const RUNNER_STATUS_PORT: u16 = 6565;

/// Runner env variable that overrides the cloud control-plane host
pub const CLOUD_HOST_ENV: &str = "K6_CLOUD_HOST";

/// Key inside the credential Secret holding the cloud token
pub const CLOUD_TOKEN_KEY: &str = "token";

/// Field manager used for every write made by the controller
pub const FIELD_MANAGER: &str = "loadrun-controller";

/// Labels identifying the runner shards of a test run
pub fn runner_labels(run_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string()),
        (TEST_RUN_LABEL.to_string(), run_name.to_string()),
        (RUNNER_LABEL.to_string(), "true".to_string()),
    ])
}

/// Exact-match label selector for the runner shards of a test run
pub fn runner_selector(run_name: &str) -> String {
    runner_labels(run_name)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_all_runner_labels() {
        let selector = runner_selector("smoke");
        assert_eq!(selector, "app=loadrun,loadrun.dev/test-run=smoke,runner=true");
    }

    #[test]
    fn runner_labels_are_scoped_to_run() {
        let labels = runner_labels("soak");
        assert_eq!(labels.get(TEST_RUN_LABEL).map(String::as_str), Some("soak"));
        assert_eq!(labels.get(RUNNER_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.len(), 3);
    }
}
