//! Process-local pipeline counters.
//!
//! One counter per drop/error kind, plus throughput totals.  The counters
//! are plain atomics read by the /health endpoint; a metrics exporter is a
//! deployment concern and lives outside this service.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineCounters {
    /// MQTT publishes seen, before any validation.
    pub received: AtomicU64,
    /// Readings durably written by the persister.
    pub persisted: AtomicU64,
    pub malformed_payload: AtomicU64,
    pub invalid_reading: AtomicU64,
    pub quality_check_failed: AtomicU64,
    pub identity_mismatch: AtomicU64,
    pub buffer_overflow: AtomicU64,
    /// Whole-batch retries after a transient store failure.
    pub store_retries: AtomicU64,
    /// Rows the store refused permanently (never retried).
    pub store_rejected: AtomicU64,
    /// Readings still buffered when the shutdown grace window expired.
    pub shutdown_dropped: AtomicU64,
}

/// Point-in-time copy for the health endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub received: u64,
    pub persisted: u64,
    pub malformed_payload: u64,
    pub invalid_reading: u64,
    pub quality_check_failed: u64,
    pub identity_mismatch: u64,
    pub buffer_overflow: u64,
    pub store_retries: u64,
    pub store_rejected: u64,
    pub shutdown_dropped: u64,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            malformed_payload: self.malformed_payload.load(Ordering::Relaxed),
            invalid_reading: self.invalid_reading.load(Ordering::Relaxed),
            quality_check_failed: self.quality_check_failed.load(Ordering::Relaxed),
            identity_mismatch: self.identity_mismatch.load(Ordering::Relaxed),
            buffer_overflow: self.buffer_overflow.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            store_rejected: self.store_rejected.load(Ordering::Relaxed),
            shutdown_dropped: self.shutdown_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Relaxed is sufficient everywhere: counters are monotonic and only read
/// for reporting.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn bump_by(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

// ===========================================================================
// Tests
// ===========================================================================
