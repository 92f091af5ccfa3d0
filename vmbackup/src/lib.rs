//! # vmbackup
//!
//! Backs up libvirt guests to a local tree: each guest is shut down,
//! its definition and file-backed disks are copied to
//! `<destination>/<guest name>/`, and guests that were running are started
//! again.
//!
//! The binary wires these modules together; they are public so the
//! integration tests can drive a run against the mock hypervisor.

pub mod cli;
pub mod config;
pub mod copy;
pub mod error;
pub mod orchestrator;
pub mod report;
pub mod runner;
pub mod types;

pub use config::BackupConfig;
pub use orchestrator::Orchestrator;
pub use report::RunSummary;
pub use types::{GuestHandle, Outcome, VmBackupResult};
