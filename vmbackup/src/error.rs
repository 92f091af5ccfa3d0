//! Per-guest failure taxonomy.
//!
//! Nothing in here aborts a run. Every failure that happens while a guest is
//! processed is recorded as a [`StepFailure`] on that guest's result, and the
//! most severe one names the outcome.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Kind of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A storage volume could not be copied.
    Copy,
    /// The definition could not be written.
    Export,
    /// Hypervisor communication failed.
    Hypervisor,
    /// The guest's destination directory could not be created.
    Mkdir,
    /// A step panicked.
    Internal,
    /// The guest did not power off in time; storage was not copied.
    ShutdownTimeout,
    /// The run was cancelled while this guest was in flight.
    Cancelled,
    /// A guest that was running before the backup is down now.
    RestartFailed,
}

impl FailureKind {
    /// Higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            FailureKind::Copy | FailureKind::Export => 1,
            FailureKind::Hypervisor => 2,
            FailureKind::Mkdir => 3,
            FailureKind::Internal => 4,
            FailureKind::ShutdownTimeout => 5,
            FailureKind::Cancelled => 6,
            FailureKind::RestartFailed => 7,
        }
    }

    /// Short reason used in outcomes and summary lines.
    pub fn reason(&self) -> &'static str {
        match self {
            FailureKind::Copy => "copy-failed",
            FailureKind::Export => "export-failed",
            FailureKind::Hypervisor => "hypervisor",
            FailureKind::Mkdir => "mkdir",
            FailureKind::Internal => "internal-error",
            FailureKind::ShutdownTimeout => "shutdown-timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::RestartFailed => "restart-failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// One failure observed while processing a guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub detail: String,
    /// Volume the failure relates to, for copy failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<PathBuf>,
}

impl StepFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            volume: None,
        }
    }

    pub fn for_volume(kind: FailureKind, volume: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            volume: Some(volume.into()),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.volume {
            Some(volume) => write!(f, "{} ({}): {}", self.kind, volume.display(), self.detail),
            None => write!(f, "{}: {}", self.kind, self.detail),
        }
    }
}

/// The most severe failure; the earliest one wins a tie.
pub fn worst(failures: &[StepFailure]) -> Option<&StepFailure> {
    failures.iter().fold(None, |worst: Option<&StepFailure>, f| match worst {
        Some(w) if w.kind.severity() >= f.kind.severity() => Some(w),
        _ => Some(f),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_failure_dominates() {
        let failures = vec![
            StepFailure::new(FailureKind::ShutdownTimeout, "still running"),
            StepFailure::new(FailureKind::RestartFailed, "start refused"),
            StepFailure::for_volume(FailureKind::Copy, "/img/a.qcow2", "disk full"),
        ];
        assert_eq!(worst(&failures).unwrap().kind, FailureKind::RestartFailed);
    }

    #[test]
    fn test_tie_keeps_first() {
        let failures = vec![
            StepFailure::for_volume(FailureKind::Copy, "/img/a.qcow2", "first"),
            StepFailure::new(FailureKind::Export, "second"),
        ];
        assert_eq!(worst(&failures).unwrap().detail, "first");
        assert!(worst(&[]).is_none());
    }
}
