//! Tracing setup and the in-memory run log.
//!
//! Besides the usual fmt output every event is captured as a plain
//! `[YYYY-mm-dd HH:MM:SS] LEVEL: message` line, so a run log can be saved next
//! to its report.

use crate::error::{RcaError, Result};
use chrono::Local;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Bounded buffer of formatted log lines, shared between clones.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<String>>>,
    max_lines: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(Vec::new())),
            max_lines,
        }
    }

    fn guard(&self) -> MutexGuard<'_, Vec<String>> {
        // A panic while holding the lock leaves the lines intact.
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, level: &str, message: &str) {
        let line = format!(
            "[{}] {}: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            message
        );
        let mut lines = self.guard();
        lines.push(line);
        if lines.len() > self.max_lines {
            let excess = lines.len() - self.max_lines;
            lines.drain(..excess);
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.guard().clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut content = self.lines().join("\n");
        content.push('\n');
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for LogBuffer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let mut message = visitor.message;
        if !visitor.fields.is_empty() {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&visitor.fields.join(" "));
        }
        self.push(event.metadata().level().as_str(), &message);
    }
}

/// Install the global subscriber. `level` overrides `RUST_LOG`; the default is `info`.
pub fn init(level: Option<&str>) -> Result<LogBuffer> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level),
        None => EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")),
    }
    .map_err(|e| RcaError::Config(format!("Invalid log filter: {}", e)))?;

    let buffer = LogBuffer::default();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(ChronoLocal::rfc_3339())
                .with_writer(std::io::stderr),
        )
        .with(buffer.clone())
        .try_init()
        .map_err(|e| RcaError::Config(format!("Failed to initialise logging: {}", e)))?;
    Ok(buffer)
}
