//! Runtime telemetry meter — in-process counters only, no external
//! metrics export (per the ambient-stack note: observability stays
//! internal to this core).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub write_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub write_tokens: u64,
    pub avg_latency_ms: f64,
}

#[derive(Default)]
pub struct TelemetryMeter {
    requests: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cached_tokens: AtomicU64,
    write_tokens: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl TelemetryMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: &Usage, latency_ms: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::Relaxed);
        self.cached_tokens.fetch_add(usage.cached_tokens, Ordering::Relaxed);
        self.write_tokens.fetch_add(usage.write_tokens, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let total_latency_ms = self.total_latency_ms.load(Ordering::Relaxed);
        let avg_latency_ms = if requests == 0 {
            0.0
        } else {
            total_latency_ms as f64 / requests as f64
        };
        TelemetrySnapshot {
            requests,
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            cached_tokens: self.cached_tokens.load(Ordering::Relaxed),
            write_tokens: self.write_tokens.load(Ordering::Relaxed),
            avg_latency_ms,
        }
    }
}
