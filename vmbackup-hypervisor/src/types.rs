//! Guest types reported by the hypervisor gateway.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A guest as reported by the hypervisor's live enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfo {
    /// Stable identifier (libvirt UUID)
    pub id: String,
    /// Human-readable domain name
    pub name: String,
    /// Power state at enumeration time
    pub state: GuestState,
}

/// Guest power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestState {
    Running,
    Paused,
    ShuttingDown,
    Stopped,
    Crashed,
    Suspended,
    Unknown,
}

impl GuestState {
    /// Whether the guest still holds its disks open.
    ///
    /// Paused, suspended and shutting-down guests keep their qemu process and
    /// images open, so copying them is as unsafe as copying a running guest.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            GuestState::Running
                | GuestState::Paused
                | GuestState::ShuttingDown
                | GuestState::Suspended
        )
    }

    /// Whether the guest is up and stays up without a start request.
    ///
    /// A shutting-down guest is active but on its way to `Stopped`, so it
    /// does not count.
    pub fn is_up(&self) -> bool {
        matches!(self, GuestState::Running | GuestState::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuestState::Running => "running",
            GuestState::Paused => "paused",
            GuestState::ShuttingDown => "shutting_down",
            GuestState::Stopped => "stopped",
            GuestState::Crashed => "crashed",
            GuestState::Suspended => "suspended",
            GuestState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for GuestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(GuestState::Running.is_active());
        assert!(GuestState::Paused.is_active());
        assert!(GuestState::ShuttingDown.is_active());
        assert!(GuestState::Suspended.is_active());
        assert!(!GuestState::Stopped.is_active());
        assert!(!GuestState::Crashed.is_active());
        assert!(!GuestState::Unknown.is_active());
    }

    #[test]
    fn test_up_states() {
        assert!(GuestState::Running.is_up());
        assert!(GuestState::Paused.is_up());
        assert!(!GuestState::ShuttingDown.is_up());
        assert!(!GuestState::Suspended.is_up());
        assert!(!GuestState::Stopped.is_up());
    }
}
