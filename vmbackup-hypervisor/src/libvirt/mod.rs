//! Libvirt hypervisor backend.
//!
//! Talks to libvirt/QEMU through the `virt` bindings. Requires the `libvirt`
//! feature and a system libvirt installation.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::LibvirtBackend;

/// Default connection URI.
pub const DEFAULT_URI: &str = "qemu:///system";
