//! Ingest pipeline: bounded buffer plus a single batching persister.
//!
//! Producers (the MQTT subscriber and nothing else in normal operation)
//! push validated readings into a bounded channel; when it is full the new
//! reading is dropped and counted (drop-new — the broker redelivers at QoS
//! 1, and bounded memory under overload matters more than recency).  One
//! persister task drains the channel, flushing a batch once `batch_max`
//! readings are queued or `batch_linger_ms` has passed since the first.
//!
//! Transient store failures retry the held batch with exponential backoff;
//! the batch is never re-enqueued.  On shutdown the persister keeps
//! flushing until the buffer is empty or the grace window expires, counting
//! whatever remains as `shutdown_dropped`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::IngestSettings;
use crate::db::ReadingStore;
use crate::metrics::{bump, bump_by, PipelineCounters};
use crate::reading::Reading;

const RETRY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);

/// How often the persister wakes to notice shutdown when the buffer is idle.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Exposed in the health snapshot so operators know which overflow policy
/// is in effect.
pub const BUFFER_POLICY: &str = "drop-new";

// ---------------------------------------------------------------------------
// Producer handle
// ---------------------------------------------------------------------------

/// Cheap-to-clone sending side of the buffer.
#[derive(Clone)]
pub struct Pipeline {
    tx: mpsc::Sender<Reading>,
    counters: Arc<PipelineCounters>,
}

impl Pipeline {
    pub fn new(capacity: usize, counters: Arc<PipelineCounters>) -> (Self, mpsc::Receiver<Reading>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, counters }, rx)
    }

    /// Enqueue a validated reading.  Returns false when it was dropped
    /// (buffer full or pipeline already stopped).
    pub fn submit(&self, reading: Reading) -> bool {
        match self.tx.try_send(reading) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(r)) => {
                bump(&self.counters.buffer_overflow);
                warn!(machine = %r.machine_id, "ingest buffer full — dropping new reading");
                false
            }
            Err(mpsc::error::TrySendError::Closed(r)) => {
                warn!(machine = %r.machine_id, "ingest pipeline stopped — dropping reading");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Persister
// ---------------------------------------------------------------------------

pub fn spawn_persister(
    store: Arc<dyn ReadingStore>,
    rx: mpsc::Receiver<Reading>,
    settings: IngestSettings,
    counters: Arc<PipelineCounters>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_persister(store, rx, settings, counters, shutdown))
}

async fn run_persister(
    store: Arc<dyn ReadingStore>,
    mut rx: mpsc::Receiver<Reading>,
    settings: IngestSettings,
    counters: Arc<PipelineCounters>,
    shutdown: watch::Receiver<bool>,
) {
    let linger = Duration::from_millis(settings.batch_linger_ms);
    let grace = Duration::from_secs(settings.shutdown_grace_s);
    let mut drain_deadline: Option<Instant> = None;

    loop {
        refresh_deadline(&shutdown, &mut drain_deadline, grace);

        if drain_deadline.is_some_and(|d| Instant::now() >= d) {
            let mut dropped = 0u64;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                bump_by(&counters.shutdown_dropped, dropped);
                warn!(dropped, "shutdown grace expired — dropping buffered readings");
            }
            break;
        }

        // First reading of the next batch.  The idle timeout keeps the
        // shutdown/deadline checks responsive without a busy loop.
        let first = match tokio::time::timeout(IDLE_POLL, rx.recv()).await {
            Ok(Some(r)) => r,
            Ok(None) => break,
            Err(_) => continue,
        };

        let mut batch = Vec::with_capacity(settings.batch_max);
        batch.push(first);
        let flush_at = Instant::now() + linger;
        while batch.len() < settings.batch_max {
            match tokio::time::timeout_at(flush_at, rx.recv()).await {
                Ok(Some(r)) => batch.push(r),
                Ok(None) | Err(_) => break,
            }
        }

        refresh_deadline(&shutdown, &mut drain_deadline, grace);
        flush(&*store, &batch, &counters, drain_deadline).await;
    }

    info!("persister stopped");
}

fn refresh_deadline(
    shutdown: &watch::Receiver<bool>,
    deadline: &mut Option<Instant>,
    grace: Duration,
) {
    if deadline.is_none() && *shutdown.borrow() {
        *deadline = Some(Instant::now() + grace);
    }
}

enum FlushOutcome {
    Flushed(u64),
    Rejected,
    DeadlineExceeded,
}

/// Retry Unavailable with 1s→30s backoff, holding the rows.  Unbounded in
/// time unless a drain deadline is in force.
async fn append_retrying(
    store: &dyn ReadingStore,
    rows: &[Reading],
    counters: &PipelineCounters,
    deadline: Option<Instant>,
) -> FlushOutcome {
    let mut backoff = RETRY_INITIAL;
    loop {
        match store.append_batch(rows).await {
            Ok(n) => return FlushOutcome::Flushed(n),
            Err(e) if e.retryable() => {
                bump(&counters.store_retries);
                warn!(
                    error = %e,
                    rows = rows.len(),
                    retry_in_s = backoff.as_secs(),
                    "store append failed — holding batch for retry"
                );
                if deadline.is_some_and(|d| Instant::now() + backoff >= d) {
                    return FlushOutcome::DeadlineExceeded;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_MAX);
            }
            Err(_) => return FlushOutcome::Rejected,
        }
    }
}

async fn flush(
    store: &dyn ReadingStore,
    batch: &[Reading],
    counters: &PipelineCounters,
    deadline: Option<Instant>,
) {
    match append_retrying(store, batch, counters, deadline).await {
        FlushOutcome::Flushed(n) => {
            bump_by(&counters.persisted, n);
            debug!(rows = n, "batch persisted");
        }
        FlushOutcome::DeadlineExceeded => {
            bump_by(&counters.shutdown_dropped, batch.len() as u64);
            warn!(
                rows = batch.len(),
                "shutdown grace expired mid-retry — dropping held batch"
            );
        }
        FlushOutcome::Rejected => {
            // The statement failed for the whole batch; isolate the bad
            // row(s) so the rest still make it in.
            for (i, row) in batch.iter().enumerate() {
                match append_retrying(store, std::slice::from_ref(row), counters, deadline).await {
                    FlushOutcome::Flushed(n) => bump_by(&counters.persisted, n),
                    FlushOutcome::Rejected => {
                        bump(&counters.store_rejected);
                        error!(
                            machine = %row.machine_id,
                            timestamp = %row.timestamp,
                            "store rejected reading — dropped"
                        );
                    }
                    FlushOutcome::DeadlineExceeded => {
                        let remaining = (batch.len() - i) as u64;
                        bump_by(&counters.shutdown_dropped, remaining);
                        warn!(remaining, "shutdown grace expired during row isolation");
                        return;
                    }
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
