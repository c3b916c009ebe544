//! Optimistic TestRun status updates
//!
//! The reconciler works on a copy of the run and proposes a new status. The
//! proposal is merged into a fresh read of the run with the forward-only rule
//! from [`TestRunStatus::set_if_newer`], and only the status fields that
//! actually changed are written. The write is conditional on the resource
//! version that was read, so a concurrent writer produces a 409 instead of
//! being overwritten.

use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use loadrun_common::crd::{TestRun, TestRunStatus};
use loadrun_common::error::is_not_found;
use loadrun_common::{metrics, Error, Result};

use crate::client::KubeClient;

/// Persist the status proposed in `run` if it moves the run forward
///
/// Returns `Ok(true)` if a patch was written. On return `run` holds the
/// freshly read object with the merge applied, whether or not anything was
/// written. If the run no longer exists, `run` is left untouched.
pub async fn update_status(kube: &dyn KubeClient, run: &mut TestRun) -> Result<bool> {
    let name = run.name_any();
    let namespace = run
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "TestRun must be namespaced"))?;
    let proposed = run.status.clone().unwrap_or_default();

    let Some(mut fresh) = kube.get_test_run(&namespace, &name).await? else {
        info!(run = %name, "TestRun deleted, no status to update");
        return Ok(false);
    };

    let before = status_fields(fresh.status.as_ref())?;
    let previous_stage = fresh.stage();
    let newer = fresh.status_mut().set_if_newer(&proposed);
    if !newer {
        debug!(run = %name, "proposed status is not newer, skipping update");
        *run = fresh;
        return Ok(false);
    }

    let after = status_fields(fresh.status.as_ref())?;
    let changed: Map<String, Value> = after
        .into_iter()
        .filter(|(key, value)| before.get(key) != Some(value))
        .collect();

    let patch = serde_json::json!({
        "metadata": { "resourceVersion": fresh.resource_version() },
        "status": changed,
    });

    match kube.patch_test_run_status(&namespace, &name, &patch).await {
        Ok(()) => {}
        Err(Error::Kube { source }) if is_not_found(&source) => {
            info!(run = %name, "TestRun deleted before status update");
            return Ok(false);
        }
        Err(e) => {
            error!(run = %name, error = %e, "could not update TestRun status");
            return Err(e);
        }
    }

    let stage = fresh.stage();
    if stage != previous_stage {
        info!(run = %name, from = %previous_stage, to = %stage, "stage changed");
        metrics::record_stage_transition(stage.as_str());
    }

    *run = fresh;
    Ok(true)
}

fn status_fields(status: Option<&TestRunStatus>) -> Result<Map<String, Value>> {
    match status {
        None => Ok(Map::new()),
        Some(status) => match serde_json::to_value(status)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::serialization(format!(
                "status serialized to {} instead of an object",
                other
            ))),
        },
    }
}
