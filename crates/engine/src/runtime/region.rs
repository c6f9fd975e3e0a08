use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::isolation::run_isolated;

use super::clock::Clock;
use super::metrics::{MetricsAccumulator, MetricsHandle, RegionMetricsSnapshot};
use super::timers::TimerWheel;

/// State driven by one region thread.
pub trait RegionContext: Send + 'static {
    /// Runs once per planned heartbeat, after due timers have fired.
    fn on_heartbeat(&mut self, _now_ms: u64) {}

    /// Runs once on the region thread after the loop stops.
    fn on_shutdown(&mut self) {}
}

type Request<C> = Box<dyn FnOnce(&mut C) + Send>;

enum RegionMessage<C> {
    Run(Request<C>),
    Shutdown,
}

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("region {region} is no longer accepting requests")]
    Closed { region: String },
    #[error("failed to spawn thread for region {region}: {source}")]
    Spawn {
        region: String,
        #[source]
        source: io::Error,
    },
    #[error("region thread {region} panicked")]
    Panicked { region: String },
}

#[derive(Debug, Clone)]
pub struct RegionConfig {
    pub name: String,
    pub heartbeat: Duration,
    pub max_heartbeats_per_step: u32,
    pub max_idle_wait: Duration,
    pub out_of_sync_threshold: Duration,
    pub out_of_sync_warn_interval: Duration,
    pub metrics_log_interval: Duration,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name: "region".to_string(),
            heartbeat: Duration::from_millis(50),
            max_heartbeats_per_step: 5,
            max_idle_wait: Duration::from_millis(4500),
            out_of_sync_threshold: Duration::from_millis(150),
            out_of_sync_warn_interval: Duration::from_secs(10),
            metrics_log_interval: Duration::from_secs(10),
        }
    }
}

impl RegionConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Cross-thread entry point into a region. Requests run on the region thread
/// in the order they were posted.
pub struct RegionHandle<C> {
    name: Arc<str>,
    sender: Sender<RegionMessage<C>>,
    metrics: MetricsHandle,
}

impl<C> Clone for RegionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            sender: self.sender.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<C> RegionHandle<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post<F>(&self, request: F) -> Result<(), RegionError>
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.sender
            .send(RegionMessage::Run(Box::new(request)))
            .map_err(|_| RegionError::Closed {
                region: self.name.to_string(),
            })
    }

    pub fn shutdown(&self) -> Result<(), RegionError> {
        self.sender
            .send(RegionMessage::Shutdown)
            .map_err(|_| RegionError::Closed {
                region: self.name.to_string(),
            })
    }

    pub fn metrics(&self) -> RegionMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub requests: usize,
    pub timers_fired: usize,
    pub heartbeats: u32,
    pub dropped_backlog_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPlan {
    pub heartbeats: u32,
    pub remaining_ms: u64,
    pub dropped_backlog_ms: u64,
}

/// Splits accumulated time into whole heartbeats, capped per step. Backlog
/// beyond the cap is dropped rather than replayed.
pub fn plan_heartbeats(
    mut accumulator_ms: u64,
    heartbeat_ms: u64,
    max_per_step: u32,
) -> HeartbeatPlan {
    let heartbeat_ms = heartbeat_ms.max(1);
    let mut heartbeats = 0u32;

    while accumulator_ms >= heartbeat_ms && heartbeats < max_per_step {
        accumulator_ms -= heartbeat_ms;
        heartbeats = heartbeats.saturating_add(1);
    }

    if accumulator_ms >= heartbeat_ms {
        HeartbeatPlan {
            heartbeats,
            remaining_ms: 0,
            dropped_backlog_ms: accumulator_ms,
        }
    } else {
        HeartbeatPlan {
            heartbeats,
            remaining_ms: accumulator_ms,
            dropped_backlog_ms: 0,
        }
    }
}

/// One independently ticking partition of the world.
///
/// The region owns its timer wheel and mailbox. [`Region::step`] is the
/// whole unit of work: drain posted requests, fire due timers, run planned
/// heartbeats. [`Region::spawn`] repeats it on a dedicated thread.
pub struct Region<C> {
    config: RegionConfig,
    clock: Arc<dyn Clock>,
    wheel: TimerWheel<C>,
    receiver: Receiver<RegionMessage<C>>,
    handle: RegionHandle<C>,
    accumulator_ms: u64,
    last_step_ms: Option<u64>,
    metrics_accumulator: MetricsAccumulator,
    last_out_of_sync_warn: Option<Instant>,
    shutdown_requested: bool,
}

impl<C: RegionContext> Region<C> {
    pub fn new(config: RegionConfig, clock: Arc<dyn Clock>) -> Self {
        let (sender, receiver) = unbounded();
        let wheel = TimerWheel::new(config.name.clone(), Arc::clone(&clock));
        let handle = RegionHandle {
            name: Arc::from(config.name.as_str()),
            sender,
            metrics: MetricsHandle::default(),
        };
        let metrics_accumulator = MetricsAccumulator::new(config.metrics_log_interval);
        Self {
            config,
            clock,
            wheel,
            receiver,
            handle,
            accumulator_ms: 0,
            last_step_ms: None,
            metrics_accumulator,
            last_out_of_sync_warn: None,
            shutdown_requested: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn wheel(&self) -> TimerWheel<C> {
        self.wheel.clone()
    }

    pub fn handle(&self) -> RegionHandle<C> {
        self.handle.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub fn step(&mut self, ctx: &mut C) -> StepReport {
        let started = Instant::now();
        let now_ms = self.clock.now_ms();
        let mut report = StepReport::default();

        loop {
            match self.receiver.try_recv() {
                Ok(message) => {
                    if self.handle_message(message, ctx) {
                        report.requests += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        report.timers_fired = self.wheel.advance_to(now_ms, ctx);

        let elapsed_ms = self
            .last_step_ms
            .map_or(0, |last| now_ms.saturating_sub(last));
        self.last_step_ms = Some(now_ms);
        let plan = plan_heartbeats(
            self.accumulator_ms.saturating_add(elapsed_ms),
            self.config.heartbeat.as_millis() as u64,
            self.config.max_heartbeats_per_step,
        );
        self.accumulator_ms = plan.remaining_ms;
        for _ in 0..plan.heartbeats {
            if let Err(panic) = run_isolated(|| ctx.on_heartbeat(now_ms)) {
                error!(region = %self.config.name, panic = %panic, "region_heartbeat_panicked");
            }
        }
        report.heartbeats = plan.heartbeats;
        report.dropped_backlog_ms = plan.dropped_backlog_ms;
        if plan.dropped_backlog_ms > 0 {
            warn!(
                region = %self.config.name,
                dropped_backlog_ms = plan.dropped_backlog_ms,
                "region_heartbeat_clamped"
            );
        }

        let step_time = started.elapsed();
        self.metrics_accumulator.record_step(
            step_time,
            report.heartbeats,
            report.timers_fired,
            report.requests,
        );
        let now = Instant::now();
        if let Some(snapshot) = self
            .metrics_accumulator
            .maybe_snapshot(now, self.wheel.active_count())
        {
            self.handle.metrics.publish(snapshot);
            let purged = self.wheel.purge_cancelled();
            info!(
                region = %self.config.name,
                heartbeats_per_second = snapshot.heartbeats_per_second,
                timers_per_second = snapshot.timers_per_second,
                step_time_ms = snapshot.step_time_ms,
                active_timers = snapshot.active_timers,
                purged,
                "region_metrics"
            );
        }
        self.check_out_of_sync(step_time, now);
        report
    }

    /// Runs the region loop on the current thread until shutdown is
    /// requested, then returns the context.
    pub fn run(mut self, mut ctx: C) -> C {
        info!(
            region = %self.config.name,
            heartbeat_ms = self.config.heartbeat.as_millis() as u64,
            "region_started"
        );
        while !self.shutdown_requested {
            self.step(&mut ctx);
            if self.shutdown_requested {
                break;
            }

            match self.receiver.recv_timeout(self.idle_wait()) {
                Ok(message) => {
                    self.handle_message(message, &mut ctx);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(region = %self.config.name, "region_mailbox_disconnected");
                    thread::sleep(self.idle_wait());
                }
            }
        }

        let cancelled = self.wheel.cancel_all();
        if let Err(panic) = run_isolated(|| ctx.on_shutdown()) {
            error!(region = %self.config.name, panic = %panic, "region_shutdown_panicked");
        }
        info!(region = %self.config.name, cancelled_timers = cancelled, "region_stopped");
        ctx
    }

    pub fn spawn(self, ctx: C) -> Result<RegionThread<C>, RegionError> {
        let handle = self.handle();
        let name = self.config.name.clone();
        let join = thread::Builder::new()
            .name(format!("region-{name}"))
            .spawn(move || self.run(ctx))
            .map_err(|source| RegionError::Spawn {
                region: name,
                source,
            })?;
        Ok(RegionThread { handle, join })
    }

    // Returns true when the message was a request that ran.
    fn handle_message(&mut self, message: RegionMessage<C>, ctx: &mut C) -> bool {
        match message {
            RegionMessage::Run(request) => {
                if let Err(panic) = run_isolated(|| request(ctx)) {
                    error!(region = %self.config.name, panic = %panic, "region_request_panicked");
                }
                true
            }
            RegionMessage::Shutdown => {
                info!(region = %self.config.name, "shutdown_requested");
                self.shutdown_requested = true;
                false
            }
        }
    }

    fn idle_wait(&self) -> Duration {
        let now_ms = self.clock.now_ms();
        let heartbeat_ms = self.config.heartbeat.as_millis() as u64;
        let until_heartbeat = heartbeat_ms.saturating_sub(self.accumulator_ms);
        let until_timer = self
            .wheel
            .next_due_ms()
            .map_or(u64::MAX, |due| due.saturating_sub(now_ms));
        Duration::from_millis(until_heartbeat.min(until_timer)).min(self.config.max_idle_wait)
    }

    fn check_out_of_sync(&mut self, step_time: Duration, now: Instant) {
        if step_time <= self.config.out_of_sync_threshold {
            return;
        }
        let should_warn = self.last_out_of_sync_warn.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.config.out_of_sync_warn_interval
        });
        if should_warn {
            self.last_out_of_sync_warn = Some(now);
            warn!(
                region = %self.config.name,
                step_time_ms = step_time.as_millis() as u64,
                threshold_ms = self.config.out_of_sync_threshold.as_millis() as u64,
                "region_out_of_sync"
            );
        }
    }
}

pub struct RegionThread<C> {
    handle: RegionHandle<C>,
    join: JoinHandle<C>,
}

impl<C> RegionThread<C> {
    pub fn handle(&self) -> RegionHandle<C> {
        self.handle.clone()
    }

    /// Requests shutdown and waits for the region to hand back its context.
    pub fn shutdown_and_join(self) -> Result<C, RegionError> {
        if let Err(err) = self.handle.shutdown() {
            debug!(error = %err, "region_already_closed");
        }
        self.join.join().map_err(|_| RegionError::Panicked {
            region: self.handle.name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::runtime::clock::{ManualClock, MonotonicClock};

    #[derive(Default)]
    struct Counter {
        heartbeats: u32,
        requests: Vec<u32>,
        fired: u32,
        shut_down: bool,
    }

    impl RegionContext for Counter {
        fn on_heartbeat(&mut self, _now_ms: u64) {
            self.heartbeats += 1;
        }

        fn on_shutdown(&mut self) {
            self.shut_down = true;
        }
    }

    fn manual_region(heartbeat_ms: u64) -> (Region<Counter>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let config = RegionConfig {
            heartbeat: Duration::from_millis(heartbeat_ms),
            ..RegionConfig::named("test")
        };
        (Region::new(config, clock.clone() as Arc<dyn Clock>), clock)
    }

    #[test]
    fn plan_heartbeats_runs_expected_count_without_drop() {
        let plan = plan_heartbeats(150, 50, 5);
        assert_eq!(plan.heartbeats, 3);
        assert_eq!(plan.remaining_ms, 0);
        assert_eq!(plan.dropped_backlog_ms, 0);
    }

    #[test]
    fn plan_heartbeats_drops_backlog_when_cap_hit() {
        let plan = plan_heartbeats(400, 50, 3);
        assert_eq!(plan.heartbeats, 3);
        assert_eq!(plan.remaining_ms, 0);
        assert_eq!(plan.dropped_backlog_ms, 250);
    }

    #[test]
    fn step_drains_requests_before_firing_timers() {
        let (mut region, clock) = manual_region(50);
        let mut ctx = Counter::default();
        region
            .wheel()
            .start_once(10, |ctx: &mut Counter, _| {
                ctx.requests.push(99);
                Ok(())
            })
            .expect("start");
        let handle = region.handle();
        handle.post(|ctx: &mut Counter| ctx.requests.push(1)).expect("post");
        handle.post(|ctx: &mut Counter| ctx.requests.push(2)).expect("post");

        clock.set(10);
        let report = region.step(&mut ctx);

        assert_eq!(report.requests, 2);
        assert_eq!(report.timers_fired, 1);
        assert_eq!(ctx.requests, vec![1, 2, 99]);
    }

    #[test]
    fn heartbeats_follow_elapsed_time() {
        let (mut region, clock) = manual_region(50);
        let mut ctx = Counter::default();
        region.step(&mut ctx);
        clock.advance(120);
        let report = region.step(&mut ctx);
        assert_eq!(report.heartbeats, 2);
        clock.advance(30);
        let report = region.step(&mut ctx);
        assert_eq!(report.heartbeats, 1);
        assert_eq!(ctx.heartbeats, 3);
    }

    #[test]
    fn panicking_request_does_not_break_the_region() {
        let (mut region, _clock) = manual_region(50);
        let mut ctx = Counter::default();
        let handle = region.handle();
        handle.post(|_: &mut Counter| panic!("bad request")).expect("post");
        handle.post(|ctx: &mut Counter| ctx.requests.push(7)).expect("post");

        let report = region.step(&mut ctx);
        assert_eq!(report.requests, 2);
        assert_eq!(ctx.requests, vec![7]);
    }

    #[test]
    fn spawned_region_runs_timers_and_returns_context_on_shutdown() {
        let config = RegionConfig {
            heartbeat: Duration::from_millis(5),
            ..RegionConfig::named("threaded")
        };
        let region = Region::new(config, Arc::new(MonotonicClock::new()) as Arc<dyn Clock>);
        let fired = Arc::new(AtomicU64::new(0));
        let observed = Arc::clone(&fired);
        region
            .wheel()
            .start_repeating(0, 5, move |ctx: &mut Counter, tick| {
                ctx.fired += 1;
                observed.fetch_add(1, Ordering::SeqCst);
                if tick.fire_count == 3 {
                    tick.handle.stop();
                }
                Ok(())
            })
            .expect("start");

        let thread = region.spawn(Counter::default()).expect("spawn");
        let deadline = Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        thread
            .handle()
            .post(|ctx: &mut Counter| ctx.requests.push(42))
            .expect("post");
        let ctx = thread.shutdown_and_join().expect("join");

        assert_eq!(ctx.fired, 3);
        assert_eq!(ctx.requests, vec![42]);
        assert!(ctx.shut_down);
    }

    #[test]
    fn post_after_shutdown_reports_closed() {
        let (region, _clock) = manual_region(50);
        let handle = region.handle();
        drop(region);
        assert!(matches!(
            handle.post(|_: &mut Counter| {}),
            Err(RegionError::Closed { .. })
        ));
    }
}
