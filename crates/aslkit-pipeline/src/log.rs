//! Human-readable run log.
//!
//! Every line is also emitted through `tracing`, so a subscriber sees the
//! same messages; the log itself is kept so the caller can inspect or save
//! it after the run.

use tracing::{info, warn};

/// Ordered lines describing what a run did.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    lines: Vec<String>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an informational line.
    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.lines.push(message);
    }

    /// Record a configuration warning. The line is prefixed `WARNING:`.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.lines.push(format!("WARNING: {message}"));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Whether any warning has been recorded.
    pub fn has_warnings(&self) -> bool {
        self.lines.iter().any(|l| l.starts_with("WARNING"))
    }

    /// Whole log as newline-separated text.
    pub fn contents(&self) -> String {
        self.lines.join("\n")
    }
}
