//! OpenTelemetry metrics for the TestRun controller
//!
//! Instruments are created lazily on the global meter, so recording before
//! telemetry is installed is a cheap no-op.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("loadrun"));

/// Reconciliations by stage and outcome
///
/// Labels:
/// - `stage`: stage observed at the start of the reconciliation
/// - `result`: success, error
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("loadrun_reconcile_total")
        .with_description("Total number of TestRun reconciliations")
        .with_unit("{reconciliations}")
        .build()
});

/// Reconciliation latency
///
/// Labels:
/// - `stage`: stage observed at the start of the reconciliation
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("loadrun_reconcile_duration_seconds")
        .with_description("Duration of TestRun reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Persisted stage transitions
///
/// Labels:
/// - `to`: stage written to status
pub static STAGE_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("loadrun_stage_transitions_total")
        .with_description("Total number of TestRun stage transitions")
        .with_unit("{transitions}")
        .build()
});

/// Runner jobs deleted after a remote abort
///
/// Labels:
/// - `result`: deleted, failed
pub static RUNNER_KILLS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("loadrun_runner_kills_total")
        .with_description("Total number of runner job deletions")
        .with_unit("{jobs}")
        .build()
});

/// Outcome label for a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Returned an action
    Success,
    /// Returned an error
    Error,
}

impl ReconcileResult {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Times one reconciliation of one TestRun
pub struct ReconcileTimer {
    stage: String,
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing; `stage` is the stage the run was in when picked up
    pub fn start(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            start: Instant::now(),
        }
    }

    /// Record the outcome
    pub fn finish(self, result: ReconcileResult) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(duration, &[KeyValue::new("stage", self.stage.clone())]);
        RECONCILE_TOTAL.add(
            1,
            &[
                KeyValue::new("stage", self.stage),
                KeyValue::new("result", result.as_str()),
            ],
        );
    }
}

/// Count a stage written to status
pub fn record_stage_transition(to: &str) {
    STAGE_TRANSITIONS.add(1, &[KeyValue::new("to", to.to_string())]);
}

/// Count runner job deletions
pub fn record_runner_kills(deleted: usize, failed: usize) {
    if deleted > 0 {
        RUNNER_KILLS.add(deleted as u64, &[KeyValue::new("result", "deleted")]);
    }
    if failed > 0 {
        RUNNER_KILLS.add(failed as u64, &[KeyValue::new("result", "failed")]);
    }
}
