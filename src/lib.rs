//! Host-level backup and restore.
//!
//! Descriptors (`<project>-backup.yaml`) name what to back up on a machine;
//! targets turn those names into artifacts; the remote module stores them
//! under `project/yyyymm/yyyymmdd_host_hhmmss-file` keys and finds the latest
//! ones again.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod orchestrator;
pub mod process;
pub mod providers;
pub mod remote;
pub mod report;
pub mod targets;

pub use error::{Error, Result};
