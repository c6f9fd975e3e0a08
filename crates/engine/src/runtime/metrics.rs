use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

static METRICS_LOCK_POISON_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_metrics_lock_poison_once(operation: &'static str) {
    if METRICS_LOCK_POISON_WARNED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(operation, "region metrics lock poisoned; recovered inner value");
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegionMetricsSnapshot {
    pub heartbeats_per_second: f32,
    pub timers_per_second: f32,
    pub requests_per_second: f32,
    pub step_time_ms: f32,
    pub active_timers: usize,
}

/// Latest metrics of one region, readable from any thread.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    snapshot: Arc<RwLock<RegionMetricsSnapshot>>,
}

impl Default for MetricsHandle {
    fn default() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(RegionMetricsSnapshot::default())),
        }
    }
}

impl MetricsHandle {
    pub fn snapshot(&self) -> RegionMetricsSnapshot {
        match self.snapshot.read() {
            Ok(guard) => *guard,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("read");
                *poisoned.into_inner()
            }
        }
    }

    pub(crate) fn publish(&self, snapshot: RegionMetricsSnapshot) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("write");
                let mut guard = poisoned.into_inner();
                *guard = snapshot;
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct MetricsAccumulator {
    interval_start: Instant,
    interval: Duration,
    steps: u32,
    heartbeats: u32,
    timers_fired: u64,
    requests: u64,
    step_time_sum: Duration,
}

impl MetricsAccumulator {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval_start: Instant::now(),
            interval,
            steps: 0,
            heartbeats: 0,
            timers_fired: 0,
            requests: 0,
            step_time_sum: Duration::ZERO,
        }
    }

    pub(crate) fn record_step(
        &mut self,
        step_time: Duration,
        heartbeats: u32,
        timers_fired: usize,
        requests: usize,
    ) {
        self.steps = self.steps.saturating_add(1);
        self.heartbeats = self.heartbeats.saturating_add(heartbeats);
        self.timers_fired = self.timers_fired.saturating_add(timers_fired as u64);
        self.requests = self.requests.saturating_add(requests as u64);
        self.step_time_sum = self.step_time_sum.saturating_add(step_time);
    }

    pub(crate) fn maybe_snapshot(
        &mut self,
        now: Instant,
        active_timers: usize,
    ) -> Option<RegionMetricsSnapshot> {
        let elapsed = now.saturating_duration_since(self.interval_start);
        if elapsed < self.interval {
            return None;
        }

        let elapsed_seconds = elapsed.as_secs_f32().max(f32::EPSILON);
        let step_time_ms = if self.steps == 0 {
            0.0
        } else {
            (self.step_time_sum.as_secs_f32() / self.steps as f32) * 1000.0
        };

        let snapshot = RegionMetricsSnapshot {
            heartbeats_per_second: self.heartbeats as f32 / elapsed_seconds,
            timers_per_second: self.timers_fired as f32 / elapsed_seconds,
            requests_per_second: self.requests as f32 / elapsed_seconds,
            step_time_ms,
            active_timers,
        };

        self.interval_start = now;
        self.steps = 0;
        self.heartbeats = 0;
        self.timers_fired = 0;
        self.requests = 0;
        self.step_time_sum = Duration::ZERO;

        Some(snapshot)
    }
}
