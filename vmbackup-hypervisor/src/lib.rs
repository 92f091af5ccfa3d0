//! # vmbackup Hypervisor
//!
//! Hypervisor gateway for the backup tooling.
//!
//! The backup run only needs a narrow slice of a hypervisor: enumerate
//! guests, observe their power state, ask them to shut down, start them
//! again and export their definitions. This crate puts that slice behind
//! the [`Hypervisor`] trait:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Hypervisor Trait             │
//! │ (list_guests, request_shutdown, start)  │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │  LibvirtBackend   │     │    MockBackend    │
//! │   (via libvirt)   │     │ (tests, --dev)    │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vmbackup_hypervisor::{Hypervisor, MockBackend, MockGuestSpec};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MockBackend::new();
//!     let id = backend.add_guest(MockGuestSpec::new("web").running());
//!
//!     backend.request_shutdown(&id).await.unwrap();
//!     backend.start_guest(&id).await.unwrap();
//!     backend.close().await.unwrap();
//! }
//! ```

pub mod error;
pub mod libvirt;
pub mod mock;
pub mod traits;
pub mod types;
pub mod xml;

pub use error::HypervisorError;
pub use mock::{MockBackend, MockCall, MockFaults, MockGuestSpec};
pub use traits::Hypervisor;
pub use types::*;

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
