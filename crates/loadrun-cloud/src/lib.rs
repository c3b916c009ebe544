//! Client for the cloud control plane that aggregates loadrun results
//!
//! Cloud-backed runs get a remote run record that is created before the
//! runners start and finalized after they stop. Private load zone runs are
//! additionally subject to aborts issued remotely, which the controller
//! discovers by polling the run state.

#![deny(missing_docs)]

pub mod client;
pub mod error;
pub mod types;

pub use client::{CloudClient, HttpCloudClient, DEFAULT_HOST};
pub use error::CloudError;
pub use types::{CreateTestRun, PlzConfig, PlzRegistration, PlzResources, RunStatus, TestRunState};
