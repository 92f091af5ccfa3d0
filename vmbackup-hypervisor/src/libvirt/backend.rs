//! Libvirt backend implementation.

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::Hypervisor;
use crate::types::*;

/// Libvirt/QEMU hypervisor backend.
///
/// Holds a single connection for the lifetime of a backup run. The
/// connection is released by [`Hypervisor::close`]; any call after that
/// fails with `ConnectionFailed`.
pub struct LibvirtBackend {
    uri: String,
    connection: Mutex<Option<Connect>>,
}

impl LibvirtBackend {
    /// Connect to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn connect(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            connection: Mutex::new(Some(connection)),
        })
    }

    /// The URI this backend is connected to.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connect>>> {
        self.connection
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    /// Look up a domain by UUID on the open connection.
    fn get_domain(&self, guest_id: &str) -> Result<Domain> {
        let guard = self.lock()?;
        let connection = guard
            .as_ref()
            .ok_or_else(|| HypervisorError::ConnectionFailed("connection is closed".to_string()))?;

        Domain::lookup_by_uuid_string(connection, guest_id)
            .map_err(|e| HypervisorError::GuestNotFound(format!("{}: {}", guest_id, e)))
    }

    /// Convert libvirt domain state to GuestState.
    fn state_from_libvirt(state: sys::virDomainState) -> GuestState {
        match state {
            sys::VIR_DOMAIN_RUNNING => GuestState::Running,
            sys::VIR_DOMAIN_BLOCKED => GuestState::Running,
            sys::VIR_DOMAIN_PAUSED => GuestState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => GuestState::ShuttingDown,
            sys::VIR_DOMAIN_SHUTOFF => GuestState::Stopped,
            sys::VIR_DOMAIN_CRASHED => GuestState::Crashed,
            sys::VIR_DOMAIN_PMSUSPENDED => GuestState::Suspended,
            _ => GuestState::Unknown,
        }
    }
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<bool> {
        let guard = self.lock()?;
        match guard.as_ref() {
            Some(connection) => Ok(connection.is_alive().unwrap_or(false)),
            None => Ok(false),
        }
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn close(&self) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(mut connection) = guard.take() {
            match connection.close() {
                Ok(remaining) if remaining > 0 => {
                    warn!(remaining_refs = remaining, "Libvirt connection still referenced after close");
                }
                Ok(_) => info!("Libvirt connection closed"),
                Err(e) => {
                    return Err(HypervisorError::Internal(format!(
                        "failed to close connection: {}",
                        e
                    )))
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_guests(&self) -> Result<Vec<GuestInfo>> {
        let guard = self.lock()?;
        let connection = guard
            .as_ref()
            .ok_or_else(|| HypervisorError::ConnectionFailed("connection is closed".to_string()))?;

        let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;

        let domains = connection
            .list_all_domains(flags)
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

        let mut guests = Vec::with_capacity(domains.len());

        for domain in domains {
            let id = domain
                .get_uuid_string()
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

            let name = domain
                .get_name()
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

            let (state, _) = domain
                .get_state()
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

            guests.push(GuestInfo {
                id,
                name,
                state: Self::state_from_libvirt(state),
            });
        }

        debug!(count = guests.len(), "Listed guests");
        Ok(guests)
    }

    #[instrument(skip(self), fields(guest_id = %guest_id))]
    async fn get_guest_state(&self, guest_id: &str) -> Result<GuestState> {
        let domain = self.get_domain(guest_id)?;

        let (state, _) = domain
            .get_state()
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

        Ok(Self::state_from_libvirt(state))
    }

    #[instrument(skip(self), fields(guest_id = %guest_id))]
    async fn request_shutdown(&self, guest_id: &str) -> Result<()> {
        info!("Requesting graceful shutdown");

        let domain = self.get_domain(guest_id)?;

        // ACPI shutdown; completion is observed by polling the state
        domain
            .shutdown()
            .map_err(|e| HypervisorError::ShutdownFailed(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self), fields(guest_id = %guest_id))]
    async fn start_guest(&self, guest_id: &str) -> Result<()> {
        info!("Starting guest");

        let domain = self.get_domain(guest_id)?;

        domain
            .create()
            .map_err(|e| HypervisorError::StartFailed(e.to_string()))?;

        info!("Guest started");
        Ok(())
    }

    #[instrument(skip(self), fields(guest_id = %guest_id))]
    async fn export_definition(&self, guest_id: &str) -> Result<String> {
        let domain = self.get_domain(guest_id)?;

        // The persistent definition is what `virsh define` needs on restore
        domain
            .get_xml_desc(sys::VIR_DOMAIN_XML_INACTIVE)
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))
    }
}
