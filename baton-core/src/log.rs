//! Update log
//!
//! An in-memory record of everything the engine did during an update
//! attempt. Unlike `tracing` output it is part of the session context, so the
//! updater host can continue the same log and dump it next to the
//! application once it is done.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Severity of a log item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Debug => f.pad("DEBUG"),
            Severity::Warning => f.pad("WARN"),
            Severity::Error => f.pad("ERROR"),
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogItem {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub error: Option<String>,
}

impl fmt::Display for LogItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<5} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.severity,
            self.message
        )?;
        if let Some(err) = &self.error {
            write!(f, ": {}", err)?;
        }
        Ok(())
    }
}

/// Shared, cloneable log handle
#[derive(Debug, Clone, Default)]
pub struct UpdateLog {
    items: Arc<Mutex<Vec<LogItem>>>,
}

impl UpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue a log received from another process.
    pub fn from_items(items: Vec<LogItem>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items)),
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(target: "baton::update_log", "{}", message);
        self.push(Severity::Debug, message, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(target: "baton::update_log", "{}", message);
        self.push(Severity::Warning, message, None);
    }

    pub fn error(&self, message: impl Into<String>, err: &dyn std::error::Error) {
        let message = message.into();
        error!(target: "baton::update_log", error = %err, "{}", message);
        self.push(Severity::Error, message, Some(err.to_string()));
    }

    fn push(&self, severity: Severity, message: String, error: Option<String>) {
        let item = LogItem {
            timestamp: Utc::now(),
            severity,
            message,
            error,
        };
        if let Ok(mut items) = self.items.lock() {
            items.push(item);
        }
    }

    /// Snapshot of the items recorded so far
    pub fn items(&self) -> Vec<LogItem> {
        self.items.lock().map(|i| i.clone()).unwrap_or_default()
    }

    /// Insert items recorded by an earlier process in front of this log.
    pub fn prepend(&self, earlier: Vec<LogItem>) {
        if let Ok(mut items) = self.items.lock() {
            let current = std::mem::replace(&mut *items, earlier);
            items.extend(current);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every item as one line of text to `path`.
    pub fn dump(&self, path: &Path) -> std::io::Result<()> {
        let mut out = String::new();
        for item in self.items() {
            out.push_str(&item.to_string());
            out.push('\n');
        }
        std::fs::write(path, out)
    }
}
