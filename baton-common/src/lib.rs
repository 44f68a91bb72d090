//! # Baton Common
//!
//! Shared utilities for the Baton update binaries.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use baton_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(step = "bin/app", "Replacing file");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_with_file, LogFormat};
pub use tracing_appender::non_blocking::WorkerGuard;
