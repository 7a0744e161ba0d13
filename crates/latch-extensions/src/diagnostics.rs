//! Load-time and runtime diagnostic records.

use std::collections::VecDeque;

use latch_core::current_unix_timestamp_ms;
use serde::Serialize;

/// Maximum number of runtime diagnostics retained between loads.
pub const RUNTIME_DIAGNOSTICS_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
/// Enumerates supported `DiagnosticPhase` values.
pub enum DiagnosticPhase {
    Load,
    Runtime,
}

impl DiagnosticPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Runtime => "runtime",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// One non-fatal `(source, message)` record.
pub struct ExtensionDiagnostic {
    pub source: String,
    pub message: String,
    pub phase: DiagnosticPhase,
    pub timestamp_unix_ms: u64,
}

impl ExtensionDiagnostic {
    pub fn load(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DiagnosticPhase::Load, source, message)
    }

    pub fn runtime(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DiagnosticPhase::Runtime, source, message)
    }

    fn new(phase: DiagnosticPhase, source: impl Into<String>, message: impl Into<String>) -> Self {
        let diagnostic = Self {
            source: source.into(),
            message: message.into(),
            phase,
            timestamp_unix_ms: current_unix_timestamp_ms(),
        };
        tracing::warn!(
            phase = diagnostic.phase.as_str(),
            source = %diagnostic.source,
            "extension diagnostic: {}",
            diagnostic.message
        );
        diagnostic
    }

    /// Renders the record without its timestamp.
    pub fn render(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.phase.as_str(),
            self.source,
            self.message
        )
    }
}

/// Append-only collector used while one load cycle runs.
#[derive(Debug, Default)]
pub struct DiagnosticLog {
    entries: Vec<ExtensionDiagnostic>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, source: impl Into<String>, message: impl Into<String>) {
        self.entries.push(ExtensionDiagnostic::load(source, message));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ExtensionDiagnostic] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ExtensionDiagnostic> {
        self.entries
    }
}

/// Bounded ring of post-load failures; the oldest record is evicted first.
#[derive(Debug)]
pub struct RuntimeDiagnostics {
    entries: VecDeque<ExtensionDiagnostic>,
    capacity: usize,
}

impl Default for RuntimeDiagnostics {
    fn default() -> Self {
        Self::with_capacity(RUNTIME_DIAGNOSTICS_CAPACITY)
    }
}

impl RuntimeDiagnostics {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(RUNTIME_DIAGNOSTICS_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, source: impl Into<String>, message: impl Into<String>) {
        self.push(ExtensionDiagnostic::runtime(source, message));
    }

    pub fn push(&mut self, diagnostic: ExtensionDiagnostic) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(diagnostic);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ExtensionDiagnostic> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{DiagnosticLog, DiagnosticPhase, RuntimeDiagnostics, RUNTIME_DIAGNOSTICS_CAPACITY};

    #[test]
    fn unit_diagnostic_log_preserves_insertion_order() {
        let mut log = DiagnosticLog::new();
        log.record("trust.json", "ignored malformed entry");
        log.record("deploy.js", "blocked by trust policy (denied)");
        let entries = log.into_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source, "trust.json");
        assert_eq!(entries[1].phase, DiagnosticPhase::Load);
        assert_eq!(
            entries[1].render(),
            "[load] deploy.js: blocked by trust policy (denied)"
        );
    }

    #[test]
    fn regression_runtime_diagnostics_keeps_most_recent_entries() {
        let mut runtime = RuntimeDiagnostics::default();
        for index in 0..(RUNTIME_DIAGNOSTICS_CAPACITY + 25) {
            runtime.record("hook:audit", format!("failure {index}"));
        }
        let snapshot = runtime.snapshot();
        assert_eq!(snapshot.len(), RUNTIME_DIAGNOSTICS_CAPACITY);
        assert_eq!(snapshot[0].message, "failure 25");
        assert_eq!(
            snapshot.last().map(|entry| entry.message.as_str()),
            Some("failure 224")
        );
        assert!(snapshot
            .iter()
            .all(|entry| entry.phase == DiagnosticPhase::Runtime));
    }

    #[test]
    fn unit_runtime_diagnostics_clear_empties_ring() {
        let mut runtime = RuntimeDiagnostics::with_capacity(2);
        runtime.record("hook:a", "one");
        runtime.record("hook:b", "two");
        runtime.record("hook:c", "three");
        assert_eq!(runtime.len(), 2);
        runtime.clear();
        assert!(runtime.is_empty());
    }
}
