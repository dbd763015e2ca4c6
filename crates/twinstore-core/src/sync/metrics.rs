//! Replication metrics.
//!
//! Emitted through the `metrics` facade; whoever embeds the core decides
//! which recorder (if any) to install:
//! - `twinstore_replications_total{entity,operation,result}` - Counter of finished attempts
//! - `twinstore_replication_duration_seconds{entity,operation}` - Histogram of attempt durations
//! - `twinstore_guard_skips_total{entity}` - Counter of attempts dropped as already in flight
//! - `twinstore_dead_letters_total{reason}` - Counter of dead-letter entries written
//! - `twinstore_queue_rejections_total` - Counter of tasks rejected by a full queue
//!
//! [`SyncStats`] keeps the same numbers in-process for tests and the CLI.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;
use twinstore_types::{ReplicationOutcome, SkipReason, SyncKey, SyncOperation};

static DESCRIBE: Once = Once::new();

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!(
            "twinstore_replications_total",
            "Total replication attempts by entity, operation and result"
        );
        describe_histogram!(
            "twinstore_replication_duration_seconds",
            "Replication attempt duration in seconds, retries included"
        );
        describe_counter!(
            "twinstore_guard_skips_total",
            "Replication attempts dropped because the sync key was in flight"
        );
        describe_counter!(
            "twinstore_dead_letters_total",
            "Dead-letter entries written by reason"
        );
        describe_counter!(
            "twinstore_queue_rejections_total",
            "Replication tasks rejected because the dispatch queue was full"
        );
    });
}

/// Record a finished replication attempt.
pub fn record_replication(
    key: &SyncKey,
    operation: SyncOperation,
    outcome: &ReplicationOutcome,
    elapsed: Duration,
) {
    let labels = [
        ("entity", key.entity.to_string()),
        ("operation", operation.as_str().to_string()),
        ("result", outcome.label().to_string()),
    ];
    counter!("twinstore_replications_total", &labels).increment(1);

    if !matches!(outcome, ReplicationOutcome::Skipped { .. }) {
        histogram!(
            "twinstore_replication_duration_seconds",
            "entity" => key.entity.to_string(),
            "operation" => operation.as_str()
        )
        .record(elapsed.as_secs_f64());
    }
}

pub fn record_guard_skip(key: &SyncKey) {
    counter!("twinstore_guard_skips_total", "entity" => key.entity.to_string()).increment(1);
}

pub fn record_dead_letter(reason: &'static str) {
    counter!("twinstore_dead_letters_total", "reason" => reason).increment(1);
}

pub fn record_queue_rejection() {
    counter!("twinstore_queue_rejections_total").increment(1);
}

/// In-process counters shared by the interceptor, coordinator and dispatcher.
#[derive(Debug, Default)]
pub struct SyncStats {
    captured: AtomicU64,
    capture_errors: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    skipped_in_flight: AtomicU64,
    skipped_other: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    queue_rejections: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub capture_errors: u64,
    pub applied: u64,
    pub failed: u64,
    pub skipped_in_flight: u64,
    pub skipped_other: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub queue_rejections: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_capture_error(&self) {
        self.capture_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, outcome: &ReplicationOutcome) {
        let counter = match outcome {
            ReplicationOutcome::Applied { .. } => &self.applied,
            ReplicationOutcome::Failed { .. } => &self.failed,
            ReplicationOutcome::Skipped { reason: SkipReason::InFlight } => &self.skipped_in_flight,
            ReplicationOutcome::Skipped { .. } => &self.skipped_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_guard_skip(&self) {
        self.skipped_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_rejection(&self) {
        self.queue_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_in_flight: self.skipped_in_flight.load(Ordering::Relaxed),
            skipped_other: self.skipped_other.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            queue_rejections: self.queue_rejections.load(Ordering::Relaxed),
        }
    }
}
