//! Custom Resource Definitions for loadrun

mod test_run;
mod types;

pub use test_run::{
    CleanupPolicy, ConditionType, ConfigMapScript, EnvVar, RunnerSpec, ScriptSpec, Stage, TestRun,
    TestRunSpec, TestRunStatus,
};
pub use types::{Condition, ConditionStatus};
