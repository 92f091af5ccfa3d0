//! # vmbackup Common
//!
//! Shared utilities for the vmbackup tools.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use vmbackup_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(guest = "web", "Backing up guest");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
