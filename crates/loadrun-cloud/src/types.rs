//! Wire types for the cloud control-plane API

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Remote run status code
///
/// The numbering is fixed by the control plane. Codes 5 through 9 are the
/// various ways a run can be aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunStatus(pub i32);

impl RunStatus {
    /// Run record exists but has not been validated
    pub const CREATED: RunStatus = RunStatus(-2);
    /// Waiting for capacity
    pub const QUEUED: RunStatus = RunStatus(0);
    /// Executing
    pub const RUNNING: RunStatus = RunStatus(2);
    /// Completed normally
    pub const FINISHED: RunStatus = RunStatus(3);
    /// Exceeded its maximum duration
    pub const TIMED_OUT: RunStatus = RunStatus(4);
    /// Stopped by a user
    pub const ABORTED_USER: RunStatus = RunStatus(5);
    /// Stopped by the platform
    pub const ABORTED_SYSTEM: RunStatus = RunStatus(6);
    /// Stopped because of a script error
    pub const ABORTED_SCRIPT_ERROR: RunStatus = RunStatus(7);
    /// Stopped by a failed threshold
    pub const ABORTED_THRESHOLD: RunStatus = RunStatus(8);
    /// Stopped by a subscription limit
    pub const ABORTED_LIMIT: RunStatus = RunStatus(9);

    /// Any of the aborted codes
    pub fn is_aborted(&self) -> bool {
        (Self::ABORTED_USER.0..=Self::ABORTED_LIMIT.0).contains(&self.0)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::CREATED => "created",
            Self::QUEUED => "queued",
            Self::RUNNING => "running",
            Self::FINISHED => "finished",
            Self::TIMED_OUT => "timed_out",
            Self::ABORTED_USER => "aborted_user",
            Self::ABORTED_SYSTEM => "aborted_system",
            Self::ABORTED_SCRIPT_ERROR => "aborted_script_error",
            Self::ABORTED_THRESHOLD => "aborted_threshold",
            Self::ABORTED_LIMIT => "aborted_limit",
            RunStatus(other) => return write!(f, "status({other})"),
        };
        f.write_str(name)
    }
}

/// Remote view of a run, as returned by the state query
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TestRunState {
    /// Remote run id
    pub id: i64,
    /// Current run status
    pub run_status: RunStatus,
}

impl TestRunState {
    /// The run was aborted remotely
    pub fn aborted(&self) -> bool {
        self.run_status.is_aborted()
    }
}

/// Body of a create-run request
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CreateTestRun {
    /// Display name
    pub name: String,
    /// Virtual user count
    pub vus: i64,
    /// Target project, account default if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    /// Threshold expressions keyed by metric
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateTestRunResponse {
    pub reference_id: String,
}

/// Overall pass/fail verdict sent when finalizing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(into = "i32")]
pub enum ResultStatus {
    /// Thresholds passed
    Passed,
    /// At least one threshold failed
    Failed,
}

impl From<ResultStatus> for i32 {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Passed => 0,
            ResultStatus::Failed => 1,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct FinishTestRun {
    pub result_status: ResultStatus,
    pub run_status: RunStatus,
    pub thresholds: BTreeMap<String, BTreeMap<String, bool>>,
}

/// Private load zone registration
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlzRegistration {
    /// Load zone name, also used to deregister
    #[serde(rename = "k6_load_zone_id")]
    pub load_zone_id: String,
    /// Cluster-side identifier of the zone owner
    pub provider_id: String,
    /// Resources reserved for runners
    pub pod_tiers: PlzResources,
    /// Runner configuration
    #[serde(rename = "config")]
    pub lz_config: PlzConfig,
}

/// Per-runner resource shape
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlzResources {
    /// CPU quantity, e.g. "1"
    pub cpu: String,
    /// Memory quantity, e.g. "1Gi"
    pub memory: String,
}

/// Runner settings advertised for a load zone
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlzConfig {
    /// Runner image
    #[serde(rename = "load_runner_image")]
    pub runner_image: String,
}

/// Error body returned by the control plane
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorResponse {
    #[serde(default)]
    pub error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: String,
}
