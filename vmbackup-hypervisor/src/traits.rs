//! Hypervisor gateway trait.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;
use crate::types::*;
use crate::xml;

/// The operations the backup tooling needs from a hypervisor.
///
/// Guests are addressed by their stable `id` (libvirt UUID); names are only
/// used for display and destination layout. A backend owns one connection,
/// which is released by [`Hypervisor::close`].
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Check if the hypervisor connection is healthy.
    async fn health_check(&self) -> Result<bool>;

    /// Release the connection. Further calls fail with `ConnectionFailed`.
    ///
    /// Closing an already closed backend is a no-op.
    async fn close(&self) -> Result<()>;

    // =========================================================================
    // Enumeration & State
    // =========================================================================

    /// List all guests, active and inactive.
    async fn list_guests(&self) -> Result<Vec<GuestInfo>>;

    /// Get the current power state of a guest.
    async fn get_guest_state(&self, guest_id: &str) -> Result<GuestState>;

    /// Whether the guest is currently active (see [`GuestState::is_active`]).
    async fn is_running(&self, guest_id: &str) -> Result<bool> {
        Ok(self.get_guest_state(guest_id).await?.is_active())
    }

    // =========================================================================
    // Power Control
    // =========================================================================

    /// Send an ACPI shutdown request. Returns as soon as the request is
    /// accepted; callers poll [`Hypervisor::get_guest_state`] to observe
    /// completion.
    async fn request_shutdown(&self, guest_id: &str) -> Result<()>;

    /// Start a defined guest.
    async fn start_guest(&self, guest_id: &str) -> Result<()>;

    // =========================================================================
    // Definitions & Storage
    // =========================================================================

    /// Export the guest's persistent XML definition.
    async fn export_definition(&self, guest_id: &str) -> Result<String>;

    /// List the guest's file-backed disk images, in definition order.
    async fn list_storage_volumes(&self, guest_id: &str) -> Result<Vec<PathBuf>> {
        let definition = self.export_definition(guest_id).await?;
        xml::disk_source_files(&definition)
    }
}
