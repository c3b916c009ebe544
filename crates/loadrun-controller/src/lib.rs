//! TestRun reconciliation for the loadrun operator
//!
//! This crate provides the Kubernetes controller for TestRun CRDs: the stage
//! state machine, the optimistic status updater, runner discovery and
//! teardown, and coordination with the cloud control plane.
//!
//! Related crates:
//! - `loadrun-common`: CRD types, errors, telemetry
//! - `loadrun-cloud`: cloud control-plane client

#![deny(missing_docs)]

pub mod client;
pub mod cloud;
pub mod controller;
pub mod events;
pub mod lifecycle;
pub mod resources;
pub mod runner;
pub mod status;
pub mod workers;

#[cfg(test)]
mod testing;

pub use client::{KubeClient, KubeClientImpl};
pub use cloud::{CloudClientFactory, CloudCoordinator, HttpCloudClientFactory};
pub use controller::{error_policy, reconcile, Context, ContextBuilder, ControllerConfig};
pub use events::{runner_pod_to_run, runner_pod_watcher_config};
pub use lifecycle::{RunLifecycle, StandardLifecycle, Validation};
pub use runner::{HttpRunnerClient, RunnerClient, RunnerStatus, WorkerEndpoint};
pub use status::update_status;
pub use workers::{kill_all, poll_stopped, KillOutcome};

pub use loadrun_common::{Error, Result};
