//! TestRun CRD types
//!
//! A `TestRun` describes one distributed load-test execution. The controller
//! drives `status.stage` through a fixed lifecycle while a set of tri-state
//! conditions records partial knowledge about the run (is it cloud-backed,
//! was the remote run created, finalized, aborted, ...).

use chrono::{Duration as ChronoDuration, Utc};
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus};
use crate::CLOUD_HOST_ENV;

// =============================================================================
// Stage
// =============================================================================

/// Lifecycle stage of a TestRun
///
/// Stored as a plain string in status. Values the controller does not know
/// deserialize into [`Stage::Invalid`] so a hand-edited status surfaces as a
/// reconcile error instead of breaking the watch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Stage {
    /// Freshly created, nothing persisted yet
    #[default]
    Unset,
    /// Defaults persisted, waiting for validation / cloud setup
    Initialization,
    /// Ready to create runner shards
    Initialized,
    /// Runner jobs exist, waiting to be started
    Created,
    /// Runners are executing the test
    Started,
    /// All runners stopped
    Stopped,
    /// Run complete
    Finished,
    /// Run failed
    Error,
    /// Unrecognised value found in status
    Invalid(String),
}

impl Stage {
    /// Position in the forward-only lifecycle; `None` for error and invalid
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Unset => Some(0),
            Self::Initialization => Some(1),
            Self::Initialized => Some(2),
            Self::Created => Some(3),
            Self::Started => Some(4),
            Self::Stopped => Some(5),
            Self::Finished => Some(6),
            Self::Error | Self::Invalid(_) => None,
        }
    }

    /// True for stages no transition may leave
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    /// Whether moving from `self` to `next` is forward progress
    ///
    /// `error` is reachable from every non-terminal stage. Re-proposing the
    /// current stage is not progress.
    pub fn can_advance_to(&self, next: &Stage) -> bool {
        if self == next || self.is_terminal() {
            return false;
        }
        if *next == Stage::Error {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(current), Some(proposed)) => proposed > current,
            _ => false,
        }
    }

    /// Wire representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unset => "",
            Self::Initialization => "initialization",
            Self::Initialized => "initialized",
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Invalid(s) => s,
        }
    }
}

impl From<String> for Stage {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" => Self::Unset,
            "initialization" => Self::Initialization,
            "initialized" => Self::Initialized,
            "created" => Self::Created,
            "started" => Self::Started,
            "stopped" => Self::Stopped,
            "finished" => Self::Finished,
            "error" => Self::Error,
            _ => Self::Invalid(value),
        }
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.as_str().to_string()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "<unset>"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl JsonSchema for Stage {
    fn schema_name() -> String {
        "Stage".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Named tri-state flags tracked in `status.conditions`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// The run reports results to the cloud
    CloudTestRun,
    /// The remote run record exists
    CloudTestRunCreated,
    /// The remote run record was finalized
    CloudTestRunFinalized,
    /// The run was aborted from the cloud and its runners torn down
    CloudTestRunAborted,
    /// The run executes in a private load zone
    CloudPLZTestRun,
    /// Runners are executing
    TestRunRunning,
}

impl ConditionType {
    /// All condition types, in initialization order
    pub const ALL: [ConditionType; 6] = [
        ConditionType::CloudTestRun,
        ConditionType::CloudTestRunCreated,
        ConditionType::CloudTestRunFinalized,
        ConditionType::CloudTestRunAborted,
        ConditionType::CloudPLZTestRun,
        ConditionType::TestRunRunning,
    ];

    /// Name used as the condition `type`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CloudTestRun => "CloudTestRun",
            Self::CloudTestRunCreated => "CloudTestRunCreated",
            Self::CloudTestRunFinalized => "CloudTestRunFinalized",
            Self::CloudTestRunAborted => "CloudTestRunAborted",
            Self::CloudPLZTestRun => "CloudPLZTestRun",
            Self::TestRunRunning => "TestRunRunning",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Spec
// =============================================================================

/// What to do with the TestRun once it reaches a terminal stage
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    /// Keep the TestRun
    #[default]
    Never,
    /// Delete the TestRun (and, through owner references, its runners)
    Post,
}

/// ConfigMap holding the test script
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConfigMapScript {
    /// ConfigMap name
    pub name: String,
    /// Key of the script within the ConfigMap
    #[serde(default = "default_script_file")]
    pub file: String,
}

fn default_script_file() -> String {
    "test.js".to_string()
}

/// Where the runners load the test script from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSpec {
    /// Script stored in a ConfigMap, mounted at `/test`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapScript>,
    /// Script already present in the runner image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_file: Option<String>,
}

impl ScriptSpec {
    /// Path of the script inside the runner container
    pub fn path(&self) -> Option<String> {
        if let Some(cm) = &self.config_map {
            return Some(format!("/test/{}", cm.file));
        }
        self.local_file.clone()
    }
}

/// Environment variable passed to runners
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

/// Runner pod settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RunnerSpec {
    /// Runner image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Extra environment for the runner container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// Distributed load-test run
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "loadrun.dev",
    version = "v1alpha1",
    kind = "TestRun",
    plural = "testruns",
    shortname = "tr",
    namespaced,
    status = "TestRunStatus",
    printcolumn = r#"{"name":"Stage","type":"string","jsonPath":".status.stage"}"#,
    printcolumn = r#"{"name":"Parallelism","type":"integer","jsonPath":".spec.parallelism"}"#,
    printcolumn = r#"{"name":"TestRunID","type":"string","jsonPath":".status.testRunId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TestRunSpec {
    /// Number of runner shards
    pub parallelism: i32,

    /// Test script source
    #[serde(default)]
    pub script: ScriptSpec,

    /// Extra arguments appended to the runner command line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,

    /// Runner pod settings
    #[serde(default)]
    pub runner: RunnerSpec,

    /// Cleanup policy once the run is finished
    #[serde(default)]
    pub cleanup: CleanupPolicy,

    /// Name of the Secret holding the cloud token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Pre-assigned remote run id; set only for private load zone runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_id: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a TestRun
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestRunStatus {
    /// Lifecycle stage
    #[serde(default)]
    pub stage: Stage,

    /// Remote run id, empty until a cloud run exists
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub test_run_id: String,

    /// Tri-state conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl TestRunStatus {
    /// Status of a named condition; absent conditions read as `Unknown`
    pub fn condition(&self, ty: ConditionType) -> ConditionStatus {
        self.conditions
            .iter()
            .find(|c| c.type_ == ty.as_str())
            .map(|c| c.status)
            .unwrap_or_default()
    }

    /// Set a condition, stamping a transition time only if the status changes
    ///
    /// The new transition time is always strictly after the previous one so
    /// that [`set_if_newer`](Self::set_if_newer) can order the two.
    pub fn set_condition(&mut self, ty: ConditionType, status: ConditionStatus) {
        let reason = format!("{}{}", ty.as_str(), status);
        match self.conditions.iter_mut().find(|c| c.type_ == ty.as_str()) {
            Some(existing) if existing.status == status => {}
            Some(existing) => {
                let now = Utc::now()
                    .max(existing.last_transition_time + ChronoDuration::nanoseconds(1));
                *existing = Condition::at(ty.as_str(), status, reason, "", now);
            }
            None => self
                .conditions
                .push(Condition::new(ty.as_str(), status, reason, "")),
        }
    }

    /// Merge `proposed` into `self` if it represents forward progress
    ///
    /// Rules, applied field by field:
    /// - conditions: new ones are added; `Unknown` is never re-entered once a
    ///   condition is decided; `Unknown -> True|False` always applies;
    ///   `True <-> False` applies only if the proposal transitioned later.
    /// - stage: only forward along the lifecycle (see [`Stage::can_advance_to`]).
    /// - test run id: only from empty to non-empty.
    ///
    /// Returns true if anything changed.
    pub fn set_if_newer(&mut self, proposed: &TestRunStatus) -> bool {
        let mut changed = false;

        for candidate in &proposed.conditions {
            match self
                .conditions
                .iter_mut()
                .find(|c| c.type_ == candidate.type_)
            {
                None => {
                    self.conditions.push(candidate.clone());
                    changed = true;
                }
                Some(existing) => {
                    if condition_is_newer(existing, candidate) {
                        *existing = candidate.clone();
                        changed = true;
                    }
                }
            }
        }

        if self.stage.can_advance_to(&proposed.stage) {
            self.stage = proposed.stage.clone();
            changed = true;
        }

        if self.test_run_id.is_empty() && !proposed.test_run_id.is_empty() {
            self.test_run_id = proposed.test_run_id.clone();
            changed = true;
        }

        changed
    }
}

fn condition_is_newer(existing: &Condition, candidate: &Condition) -> bool {
    match (existing.status, candidate.status) {
        (a, b) if a == b => false,
        (_, ConditionStatus::Unknown) => false,
        (ConditionStatus::Unknown, _) => true,
        _ => candidate.last_transition_time > existing.last_transition_time,
    }
}

// =============================================================================
// TestRun helpers
// =============================================================================

impl TestRun {
    /// Current stage (`Unset` when status is absent)
    pub fn stage(&self) -> Stage {
        self.status
            .as_ref()
            .map(|s| s.stage.clone())
            .unwrap_or_default()
    }

    /// Remote run id, empty if none
    pub fn test_run_id(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.test_run_id.as_str())
            .unwrap_or_default()
    }

    /// Status of a named condition
    pub fn condition(&self, ty: ConditionType) -> ConditionStatus {
        self.status
            .as_ref()
            .map(|s| s.condition(ty))
            .unwrap_or_default()
    }

    /// Condition is `True`
    pub fn is_true(&self, ty: ConditionType) -> bool {
        self.condition(ty) == ConditionStatus::True
    }

    /// Condition is `False`
    pub fn is_false(&self, ty: ConditionType) -> bool {
        self.condition(ty) == ConditionStatus::False
    }

    /// Condition is `Unknown` or absent
    pub fn is_unknown(&self, ty: ConditionType) -> bool {
        self.condition(ty) == ConditionStatus::Unknown
    }

    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut TestRunStatus {
        self.status.get_or_insert_with(TestRunStatus::default)
    }

    /// Update a condition in the working copy
    pub fn update_condition(&mut self, ty: ConditionType, status: ConditionStatus) {
        self.status_mut().set_condition(ty, status);
    }

    /// Set the stage in the working copy
    pub fn set_stage(&mut self, stage: Stage) {
        self.status_mut().stage = stage;
    }

    /// Fill in default conditions for a brand new run
    ///
    /// A run with a pre-assigned `spec.testRunId` belongs to a private load
    /// zone: its remote record already exists and it is subject to remote
    /// abort.
    pub fn initialize(&mut self) {
        let plz_id = self
            .spec
            .test_run_id
            .clone()
            .filter(|id| !id.is_empty());
        let status = self.status_mut();

        for ty in ConditionType::ALL {
            if !status.conditions.iter().any(|c| c.type_ == ty.as_str()) {
                status.set_condition(ty, ConditionStatus::Unknown);
            }
        }
        status.set_condition(ConditionType::CloudTestRunAborted, ConditionStatus::False);

        match plz_id {
            Some(id) => {
                status.set_condition(ConditionType::CloudTestRun, ConditionStatus::True);
                status.set_condition(ConditionType::CloudPLZTestRun, ConditionStatus::True);
                status.set_condition(ConditionType::CloudTestRunCreated, ConditionStatus::True);
                status.set_condition(ConditionType::CloudTestRunFinalized, ConditionStatus::False);
                status.test_run_id = id;
            }
            None => {
                status.set_condition(ConditionType::CloudPLZTestRun, ConditionStatus::False);
            }
        }
    }

    /// Cloud host override from the runner environment
    pub fn cloud_host(&self) -> Option<String> {
        self.spec
            .runner
            .env
            .iter()
            .find(|e| e.name == CLOUD_HOST_ENV && !e.value.is_empty())
            .map(|e| e.value.clone())
    }
}
