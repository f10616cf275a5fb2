// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timer-driven background jobs.
//!
//! Each job is a plain struct with a `run_once()`-style method guarded by a
//! [`SingleFlight`], so overlapping runs (a slow tick, or a manual run while
//! the timer fires) are skipped rather than stacked. [`spawn_periodic`]
//! drives a job from a `tokio::time::interval`.

pub mod decay;
pub mod reconcile;
pub mod view_flush;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Allows at most one run of a job at a time.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

/// Marks the flight finished when dropped, including on panic or abort.
pub struct FlightGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl SingleFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run, or `None` if one is already in flight.
    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(FlightGuard { running: &self.running })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Run `job` every `period`, starting one period from now.
///
/// Missed ticks are skipped, not bursted.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;
        debug!(task = name, ?period, "Periodic task started");

        loop {
            ticker.tick().await;
            job().await;
        }
    })
}

/// Handles of spawned background tasks, aborted together on shutdown.
#[derive(Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl BackgroundTasks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.lock().push((name, handle));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Abort every task. An in-flight run is dropped at its next await.
    pub fn abort_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for (name, handle) in handles {
            handle.abort();
            debug!(task = name, "Background task aborted");
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}
