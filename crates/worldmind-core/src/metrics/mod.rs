//! Metrics sinks for externally consumed observability.
//!
//! The core emits counters and timings through the [`MetricsSink`] seam;
//! concrete exporters live outside this crate. A tracing-backed sink and an
//! in-memory recording sink (for tests) are provided.

use std::collections::HashMap;
use std::sync::Mutex;

/// Counter and timing names emitted by the core.
pub mod name {
    pub const DISPATCH_TOTAL: &str = "dispatch_total";
    pub const QUALITY_GATE_DECISIONS_TOTAL: &str = "quality_gate_decisions_total";
    pub const RETRY_TOTAL: &str = "retry_total";
    pub const OSCILLATION_DETECTED_TOTAL: &str = "oscillation_detected_total";
    pub const TASK_ELAPSED_MS: &str = "task_elapsed_ms";
    pub const WAVE_ELAPSED_MS: &str = "wave_elapsed_ms";
    pub const MISSION_ELAPSED_MS: &str = "mission_elapsed_ms";
}

/// Receiver of counter increments and timings.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by one.
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Record one timing observation in milliseconds.
    fn record_timing(&self, name: &str, labels: &[(&str, &str)], ms: u64);
}

/// Sink that forwards everything to `tracing` at debug level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) {
        tracing::debug!(metric = name, labels = ?labels, "counter");
    }

    fn record_timing(&self, name: &str, labels: &[(&str, &str)], ms: u64) {
        tracing::debug!(metric = name, labels = ?labels, ms = ms, "timing");
    }
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn incr_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}

    fn record_timing(&self, _name: &str, _labels: &[(&str, &str)], _ms: u64) {}
}

/// In-memory sink that records observations for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    counters: Mutex<HashMap<String, u64>>,
    timings: Mutex<HashMap<String, Vec<u64>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter under its fully-labelled key.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = labelled_key(name, labels);
        *self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .unwrap_or(&0)
    }

    /// All timing observations recorded under a key.
    pub fn timings(&self, name: &str, labels: &[(&str, &str)]) -> Vec<u64> {
        let key = labelled_key(name, labels);
        self.timings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for RecordingSink {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = labelled_key(name, labels);
        *self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert(0) += 1;
    }

    fn record_timing(&self, name: &str, labels: &[(&str, &str)], ms: u64) {
        let key = labelled_key(name, labels);
        self.timings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .push(ms);
    }
}

/// Canonical `name{k=v,k=v}` key used by the recording sink.
fn labelled_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_owned();
    }
    let parts: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", parts.join(","))
}
