//! Per-run guest handles and per-guest results.

use serde::Serialize;
use std::path::PathBuf;

use vmbackup_hypervisor::{GuestInfo, Hypervisor, HypervisorError};

use crate::copy::CopyDecision;
use crate::error::{self, FailureKind, StepFailure};

/// Skip reason for guests on the exclude list.
pub const SKIP_EXCLUDED: &str = "excluded";

/// Skip reason for guests not reached before cancellation.
pub const SKIP_CANCELLED: &str = "cancelled";

/// A guest resolved for one backup run. Never persisted.
///
/// Only the power state is captured up front; the definition and volume
/// list are fetched by the orchestrator in their own steps, so a failure
/// there stays scoped to that step.
#[derive(Debug, Clone)]
pub struct GuestHandle {
    pub id: String,
    pub name: String,
    /// Power state captured before anything was changed
    pub was_running: bool,
}

impl GuestHandle {
    /// Capture the power state of a listed guest.
    pub async fn resolve(
        hypervisor: &dyn Hypervisor,
        info: &GuestInfo,
    ) -> Result<Self, HypervisorError> {
        let was_running = hypervisor.is_running(&info.id).await?;

        Ok(Self {
            id: info.id.clone(),
            name: info.name.clone(),
            was_running,
        })
    }
}

/// Final outcome for one guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    PartialFailure(String),
    Skipped(String),
}

impl Outcome {
    /// Whether this outcome should make the process exit non-zero.
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::PartialFailure(_))
    }
}

/// Result of backing up one guest.
#[derive(Debug, Clone, Serialize)]
pub struct VmBackupResult {
    pub name: String,
    pub outcome: Outcome,
    /// A start command for a previously running guest succeeded
    pub restarted: bool,
    pub failures: Vec<StepFailure>,
    pub copies: Vec<CopyDecision>,
    /// Where the definition was written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<PathBuf>,
    pub duration_ms: u64,
}

impl VmBackupResult {
    /// A guest that was not processed at all.
    pub fn skipped(name: &str, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: Outcome::Skipped(reason.to_string()),
            restarted: false,
            failures: Vec::new(),
            copies: Vec::new(),
            definition: None,
            duration_ms: 0,
        }
    }

    /// A guest that failed before the orchestrator could touch it.
    pub fn failed(name: &str, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::from_parts(name, Vec::new(), vec![StepFailure::new(kind, detail)], None, false, 0)
    }

    /// Build a result; the worst failure names the outcome.
    pub fn from_parts(
        name: &str,
        copies: Vec<CopyDecision>,
        failures: Vec<StepFailure>,
        definition: Option<PathBuf>,
        restarted: bool,
        duration_ms: u64,
    ) -> Self {
        let outcome = match error::worst(&failures) {
            Some(failure) => Outcome::PartialFailure(failure.kind.reason().to_string()),
            None => Outcome::Success,
        };

        Self {
            name: name.to_string(),
            outcome,
            restarted,
            failures,
            copies,
            definition,
            duration_ms,
        }
    }

    /// Whether the guest was left down although it was running before.
    pub fn restart_failed(&self) -> bool {
        self.failures
            .iter()
            .any(|f| f.kind == FailureKind::RestartFailed)
    }

    /// Total bytes written for this guest's volumes.
    pub fn bytes_copied(&self) -> u64 {
        self.copies.iter().map(|c| c.bytes_copied).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_failures() {
        let result = VmBackupResult::from_parts("web", Vec::new(), Vec::new(), None, true, 10);
        assert_eq!(result.outcome, Outcome::Success);

        let result = VmBackupResult::failed("web", FailureKind::Hypervisor, "lost connection");
        assert_eq!(result.outcome, Outcome::PartialFailure("hypervisor".to_string()));
        assert!(result.outcome.is_failure());
        assert!(!result.restart_failed());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(Outcome::Skipped("excluded".to_string())).unwrap();
        assert_eq!(json, serde_json::json!({"status": "skipped", "reason": "excluded"}));

        let json = serde_json::to_value(Outcome::Success).unwrap();
        assert_eq!(json, serde_json::json!({"status": "success"}));
    }
}
