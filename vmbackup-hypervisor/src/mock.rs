//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{HypervisorError, Result};
use crate::traits::Hypervisor;
use crate::types::*;

/// Failures a mock guest should simulate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockFaults {
    /// Accept the shutdown request but never power off.
    pub ignore_shutdown: bool,
    /// Reject the shutdown request outright.
    pub reject_shutdown: bool,
    /// Fail every start request.
    pub fail_start: bool,
    /// Fail definition export.
    pub fail_export: bool,
    /// Fail state queries.
    pub fail_state_query: bool,
    /// Number of state polls the guest stays in `ShuttingDown` before it
    /// reaches `Stopped`.
    pub shutdown_delay_polls: u32,
}

/// A guest to register with the mock backend.
#[derive(Debug, Clone)]
pub struct MockGuestSpec {
    pub id: String,
    pub name: String,
    pub state: GuestState,
    pub volumes: Vec<PathBuf>,
    pub faults: MockFaults,
}

impl MockGuestSpec {
    /// A stopped guest with no disks.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            state: GuestState::Stopped,
            volumes: Vec::new(),
            faults: MockFaults::default(),
        }
    }

    /// Mark the guest as running.
    pub fn running(mut self) -> Self {
        self.state = GuestState::Running;
        self
    }

    /// Attach a file-backed disk.
    pub fn with_volume(mut self, path: impl Into<PathBuf>) -> Self {
        self.volumes.push(path.into());
        self
    }

    /// Set the simulated failures.
    pub fn with_faults(mut self, faults: MockFaults) -> Self {
        self.faults = faults;
        self
    }
}

/// A call received by the mock backend, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ListGuests,
    GetState(String),
    RequestShutdown(String),
    StartGuest(String),
    ExportDefinition(String),
    ListStorageVolumes(String),
}

impl MockCall {
    /// The guest the call targeted, if any.
    pub fn guest_id(&self) -> Option<&str> {
        match self {
            MockCall::ListGuests => None,
            MockCall::GetState(id)
            | MockCall::RequestShutdown(id)
            | MockCall::StartGuest(id)
            | MockCall::ExportDefinition(id)
            | MockCall::ListStorageVolumes(id) => Some(id),
        }
    }
}

struct MockGuest {
    spec: MockGuestSpec,
    polls_until_stopped: u32,
}

/// Mock hypervisor backend.
///
/// Simulates guests in memory without requiring libvirt. Useful for:
/// - Unit and integration testing (fault injection, call journal)
/// - Running the CLI with `--dev` on a workstation
///
/// Clones share the same guests, journal and connection state.
#[derive(Clone)]
pub struct MockBackend {
    guests: Arc<RwLock<Vec<MockGuest>>>,
    calls: Arc<RwLock<Vec<MockCall>>>,
    closed: Arc<AtomicBool>,
}

impl MockBackend {
    /// Create a new mock backend with no guests.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            guests: Arc::new(RwLock::new(Vec::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a guest. Returns its id.
    pub fn add_guest(&self, spec: MockGuestSpec) -> String {
        let id = spec.id.clone();
        debug!(guest = %spec.name, id = %id, state = %spec.state, "Adding mock guest");
        if let Ok(mut guests) = self.guests.write() {
            guests.push(MockGuest {
                spec,
                polls_until_stopped: 0,
            });
        }
        id
    }

    /// Replace the simulated failures of a guest.
    pub fn set_faults(&self, guest_id: &str, faults: MockFaults) -> Result<()> {
        self.with_guest(guest_id, |guest| {
            guest.spec.faults = faults;
            Ok(())
        })
    }

    /// Force a guest into a state, bypassing the journal.
    pub fn set_state(&self, guest_id: &str, state: GuestState) -> Result<()> {
        self.with_guest(guest_id, |guest| {
            guest.spec.state = state;
            Ok(())
        })
    }

    /// Current state, bypassing the journal and fault plan.
    pub fn peek_state(&self, guest_id: &str) -> Option<GuestState> {
        let guests = self.guests.read().ok()?;
        guests
            .iter()
            .find(|g| g.spec.id == guest_id)
            .map(|g| g.spec.state)
    }

    /// All calls received so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls that targeted one guest.
    pub fn calls_for(&self, guest_id: &str) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.guest_id() == Some(guest_id))
            .collect()
    }

    /// Number of shutdown requests sent to a guest.
    pub fn shutdown_calls(&self, guest_id: &str) -> usize {
        self.calls_for(guest_id)
            .iter()
            .filter(|c| matches!(c, MockCall::RequestShutdown(_)))
            .count()
    }

    /// Number of start requests sent to a guest.
    pub fn start_calls(&self, guest_id: &str) -> usize {
        self.calls_for(guest_id)
            .iter()
            .filter(|c| matches!(c, MockCall::StartGuest(_)))
            .count()
    }

    /// Whether [`Hypervisor::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: MockCall) -> Result<()> {
        if self.is_closed() {
            return Err(HypervisorError::ConnectionFailed(
                "connection is closed".to_string(),
            ));
        }
        self.calls
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .push(call);
        Ok(())
    }

    fn with_guest<T>(
        &self,
        guest_id: &str,
        f: impl FnOnce(&mut MockGuest) -> Result<T>,
    ) -> Result<T> {
        let mut guests = self
            .guests
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;

        let guest = guests
            .iter_mut()
            .find(|g| g.spec.id == guest_id)
            .ok_or_else(|| HypervisorError::GuestNotFound(guest_id.to_string()))?;

        f(guest)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    async fn health_check(&self) -> Result<bool> {
        Ok(!self.is_closed())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Mock hypervisor connection closed");
        }
        Ok(())
    }

    async fn list_guests(&self) -> Result<Vec<GuestInfo>> {
        self.record(MockCall::ListGuests)?;

        let guests = self
            .guests
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;

        Ok(guests
            .iter()
            .map(|g| GuestInfo {
                id: g.spec.id.clone(),
                name: g.spec.name.clone(),
                state: g.spec.state,
            })
            .collect())
    }

    async fn get_guest_state(&self, guest_id: &str) -> Result<GuestState> {
        self.record(MockCall::GetState(guest_id.to_string()))?;

        self.with_guest(guest_id, |guest| {
            if guest.spec.faults.fail_state_query {
                return Err(HypervisorError::QueryFailed(format!(
                    "state of {} unavailable",
                    guest.spec.name
                )));
            }

            if guest.spec.state == GuestState::ShuttingDown {
                if guest.polls_until_stopped == 0 {
                    guest.spec.state = GuestState::Stopped;
                } else {
                    guest.polls_until_stopped -= 1;
                }
            }

            Ok(guest.spec.state)
        })
    }

    #[instrument(skip(self), fields(guest_id = %guest_id))]
    async fn request_shutdown(&self, guest_id: &str) -> Result<()> {
        self.record(MockCall::RequestShutdown(guest_id.to_string()))?;

        self.with_guest(guest_id, |guest| {
            if !guest.spec.state.is_active() {
                return Err(HypervisorError::InvalidState(
                    "guest is not running".to_string(),
                ));
            }

            let faults = &guest.spec.faults;
            if faults.reject_shutdown {
                return Err(HypervisorError::ShutdownFailed(
                    "guest agent rejected the request".to_string(),
                ));
            }
            if faults.ignore_shutdown {
                debug!("Mock guest ignores shutdown request");
                return Ok(());
            }

            guest.spec.state = GuestState::ShuttingDown;
            guest.polls_until_stopped = faults.shutdown_delay_polls;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(guest_id = %guest_id))]
    async fn start_guest(&self, guest_id: &str) -> Result<()> {
        self.record(MockCall::StartGuest(guest_id.to_string()))?;

        self.with_guest(guest_id, |guest| {
            if guest.spec.faults.fail_start {
                return Err(HypervisorError::StartFailed(
                    "simulated start failure".to_string(),
                ));
            }
            if guest.spec.state.is_active() {
                return Err(HypervisorError::InvalidState(
                    "guest is already running".to_string(),
                ));
            }

            guest.spec.state = GuestState::Running;
            info!("Mock guest started");
            Ok(())
        })
    }

    async fn export_definition(&self, guest_id: &str) -> Result<String> {
        self.record(MockCall::ExportDefinition(guest_id.to_string()))?;

        self.with_guest(guest_id, |guest| {
            if guest.spec.faults.fail_export {
                return Err(HypervisorError::QueryFailed(
                    "simulated export failure".to_string(),
                ));
            }
            Ok(render_definition(&guest.spec))
        })
    }

    /// Volumes come from the guest spec, so a failing definition export
    /// does not hide them.
    async fn list_storage_volumes(&self, guest_id: &str) -> Result<Vec<PathBuf>> {
        self.record(MockCall::ListStorageVolumes(guest_id.to_string()))?;

        self.with_guest(guest_id, |guest| Ok(guest.spec.volumes.clone()))
    }
}

/// Render a minimal libvirt-style domain definition for a mock guest.
fn render_definition(spec: &MockGuestSpec) -> String {
    let mut xml = format!(
        "<domain type='kvm'>\n  <name>{}</name>\n  <uuid>{}</uuid>\n  <devices>\n",
        escape(&spec.name),
        spec.id
    );
    for (index, volume) in spec.volumes.iter().enumerate() {
        let dev = (b'a' + (index % 26) as u8) as char;
        xml.push_str(&format!(
            "    <disk type='file' device='disk'>\n      <source file='{}'/>\n      <target dev='vd{}' bus='virtio'/>\n    </disk>\n",
            escape(&volume.to_string_lossy()),
            dev
        ));
    }
    xml.push_str("  </devices>\n</domain>\n");
    xml
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}
