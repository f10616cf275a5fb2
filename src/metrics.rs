// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for trending-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host service is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `trending_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: primary, fallback
//! - `operation`: increment, top_n, remove, decay
//! - `status`: success, error, fallback

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a score operation and where it was served
pub fn record_operation(store: &str, operation: &str, status: &str) {
    counter!(
        "trending_engine_operations_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "trending_engine_operation_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a score event by kind
pub fn record_event(event: &str) {
    counter!("trending_engine_events_total", "event" => event.to_string()).increment(1);
}

/// Set circuit breaker state (0=closed, 1=half_open, 2=open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "trending_engine_circuit_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record a circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "trending_engine_circuit_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a primary call that exceeded the call timeout
pub fn record_timeout(circuit: &str) {
    counter!(
        "trending_engine_timeouts_total",
        "circuit" => circuit.to_string()
    )
    .increment(1);
}

/// Set fallback cache entry count
pub fn set_fallback_entries(count: usize) {
    gauge!("trending_engine_fallback_entries").set(count as f64);
}

/// Record fallback evictions
pub fn record_evictions(count: usize) {
    counter!("trending_engine_fallback_evictions_total").increment(count as u64);
}

/// Set pending deletion log size
pub fn set_deletion_log_size(count: usize) {
    gauge!("trending_engine_deletion_log_entries").set(count as f64);
}

/// Record a decay pass on one store
pub fn record_decay_run(store: &str, status: &str, removed: usize) {
    counter!(
        "trending_engine_decay_runs_total",
        "store" => store.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    if removed > 0 {
        counter!(
            "trending_engine_decay_removed_total",
            "store" => store.to_string()
        )
        .increment(removed as u64);
    }
}

/// Record a fallback warm-up attempt
pub fn record_warm_up(status: &str, entries: usize) {
    counter!("trending_engine_warm_up_total", "status" => status.to_string()).increment(1);
    if entries > 0 {
        histogram!("trending_engine_warm_up_entries").record(entries as f64);
    }
}

/// Record a deletion log replay against the primary
pub fn record_replay(status: &str, count: usize) {
    counter!("trending_engine_replay_total", "status" => status.to_string()).increment(1);
    if count > 0 {
        counter!("trending_engine_replayed_deletions_total").increment(count as u64);
    }
}

/// Record a view and whether the dedup marker already existed
pub fn record_view(duplicate: bool) {
    let result = if duplicate { "duplicate" } else { "unique" };
    counter!("trending_engine_views_total", "result" => result).increment(1);
}

/// Record the dedup store being unreachable
pub fn record_dedup_error() {
    counter!("trending_engine_dedup_errors_total").increment(1);
}

/// Record a view count flush to the durable store
pub fn record_view_flush(success: bool, items: usize) {
    let status = if success { "success" } else { "error" };
    counter!("trending_engine_view_flush_total", "status" => status).increment(1);
    if success {
        histogram!("trending_engine_view_flush_items").record(items as f64);
    }
}

/// Record a malformed member or score read from a store
pub fn record_data_type_error(store: &str) {
    counter!(
        "trending_engine_data_type_errors_total",
        "store" => store.to_string()
    )
    .increment(1);
}

/// Record a background task run skipped because one was in flight
pub fn record_task_skipped(task: &str) {
    counter!(
        "trending_engine_task_skipped_total",
        "task" => task.to_string()
    )
    .increment(1);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "trending_engine_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record engine state transition
pub fn set_engine_state(state: &str) {
    counter!(
        "trending_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    store: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(store: &'static str, operation: &'static str) -> Self {
        Self {
            store,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.store, self.operation, self.start.elapsed());
    }
}
