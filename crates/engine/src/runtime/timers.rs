use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::isolation::run_isolated;

use super::clock::Clock;

pub const MAX_TIMER_DELAY_MS: u64 = 24 * 60 * 60 * 1000;
const SLOW_CALLBACK: Duration = Duration::from_millis(250);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("repeating timer interval must be at least 1ms")]
    ZeroInterval,
    #[error("timer delay {delay_ms}ms exceeds the {max_ms}ms limit")]
    DelayTooLong { delay_ms: u64, max_ms: u64 },
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct TaskError {
    message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type TaskResult = Result<(), TaskError>;

type Callback<C> = Box<dyn FnMut(&mut C, &TimerTick) -> TaskResult + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Default)]
struct TaskState {
    cancelled: AtomicBool,
    finished: AtomicBool,
    fires: AtomicU64,
}

/// Cancellation handle for a scheduled task. Dropping the handle leaves the
/// task scheduled.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: TimerId,
    state: Arc<TaskState>,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Prevents every future fire. An invocation already running completes.
    /// Returns `true` for the call that actually cancelled the task.
    pub fn stop(&self) -> bool {
        !self.state.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        !self.is_stopped() && !self.state.finished.load(Ordering::SeqCst)
    }

    pub fn fire_count(&self) -> u64 {
        self.state.fires.load(Ordering::SeqCst)
    }
}

/// Passed to each callback invocation.
#[derive(Debug, Clone)]
pub struct TimerTick {
    pub handle: TimerHandle,
    pub due_ms: u64,
    pub now_ms: u64,
    pub fire_count: u64,
}

struct ScheduledTask<C> {
    due_ms: u64,
    seq: u64,
    interval_ms: Option<u64>,
    callback: Callback<C>,
    handle: TimerHandle,
}

impl<C> PartialEq for ScheduledTask<C> {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl<C> Eq for ScheduledTask<C> {}

impl<C> PartialOrd for ScheduledTask<C> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for ScheduledTask<C> {
    // Reversed so the max-heap yields the earliest (due, seq) first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due_ms
            .cmp(&self.due_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct WheelQueue<C> {
    heap: BinaryHeap<ScheduledTask<C>>,
    next_seq: u64,
}

impl<C> WheelQueue<C> {
    fn push(&mut self, mut task: ScheduledTask<C>) {
        self.next_seq = self.next_seq.saturating_add(1);
        task.seq = self.next_seq;
        self.heap.push(task);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    pub active: usize,
    pub invoked: u64,
    pub failed: u64,
    pub late_reschedules: u64,
}

struct WheelShared<C> {
    name: String,
    clock: Arc<dyn Clock>,
    queue: Mutex<WheelQueue<C>>,
    next_id: AtomicU64,
    invoked: AtomicU64,
    failed: AtomicU64,
    late_reschedules: AtomicU64,
}

/// Per-region scheduler of one-shot and repeating callbacks.
///
/// Cloning yields another handle to the same queue, so callbacks can start
/// new timers while the wheel is firing. Callbacks receive the region context
/// `C` and only ever run inside [`TimerWheel::advance_to`], on whichever
/// thread drives the region.
pub struct TimerWheel<C> {
    shared: Arc<WheelShared<C>>,
}

impl<C> Clone for TimerWheel<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> TimerWheel<C> {
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(WheelShared {
                name: name.into(),
                clock,
                queue: Mutex::new(WheelQueue {
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                }),
                next_id: AtomicU64::new(0),
                invoked: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                late_reschedules: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    pub fn start_once<F>(&self, delay_ms: u64, callback: F) -> Result<TimerHandle, TimerError>
    where
        F: FnMut(&mut C, &TimerTick) -> TaskResult + Send + 'static,
    {
        self.schedule(delay_ms, None, Box::new(callback))
    }

    pub fn start_repeating<F>(
        &self,
        delay_ms: u64,
        interval_ms: u64,
        callback: F,
    ) -> Result<TimerHandle, TimerError>
    where
        F: FnMut(&mut C, &TimerTick) -> TaskResult + Send + 'static,
    {
        if interval_ms == 0 {
            return Err(TimerError::ZeroInterval);
        }
        if interval_ms > MAX_TIMER_DELAY_MS {
            return Err(TimerError::DelayTooLong {
                delay_ms: interval_ms,
                max_ms: MAX_TIMER_DELAY_MS,
            });
        }
        self.schedule(delay_ms, Some(interval_ms), Box::new(callback))
    }

    fn schedule(
        &self,
        delay_ms: u64,
        interval_ms: Option<u64>,
        callback: Callback<C>,
    ) -> Result<TimerHandle, TimerError> {
        if delay_ms > MAX_TIMER_DELAY_MS {
            return Err(TimerError::DelayTooLong {
                delay_ms,
                max_ms: MAX_TIMER_DELAY_MS,
            });
        }
        let id = TimerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = TimerHandle {
            id,
            state: Arc::new(TaskState::default()),
        };
        let due_ms = self.now_ms().saturating_add(delay_ms);
        self.shared.queue.lock().push(ScheduledTask {
            due_ms,
            seq: 0,
            interval_ms,
            callback,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    /// Earliest due tick among tasks that are still live.
    pub fn next_due_ms(&self) -> Option<u64> {
        let mut queue = self.shared.queue.lock();
        while let Some(top) = queue.heap.peek() {
            if !top.handle.is_stopped() {
                return Some(top.due_ms);
            }
            if let Some(task) = queue.heap.pop() {
                task.handle.state.finished.store(true, Ordering::SeqCst);
            }
        }
        None
    }

    pub fn advance(&self, ctx: &mut C) -> usize {
        self.advance_to(self.now_ms(), ctx)
    }

    /// Fires every task due at or before `now_ms` in (due, insertion) order.
    ///
    /// Tasks started by callbacks during this pass wait for the next call.
    /// Cancellation is re-checked right before each invocation, so a task
    /// stopped by an earlier callback in the same batch does not run.
    pub fn advance_to(&self, now_ms: u64, ctx: &mut C) -> usize {
        let batch = {
            let mut queue = self.shared.queue.lock();
            let mut batch = Vec::new();
            while queue.heap.peek().is_some_and(|top| top.due_ms <= now_ms) {
                if let Some(task) = queue.heap.pop() {
                    batch.push(task);
                }
            }
            batch
        };

        let mut fired = 0usize;
        let mut reinsert = Vec::new();
        for mut task in batch {
            let state = Arc::clone(&task.handle.state);
            if state.cancelled.load(Ordering::SeqCst) {
                state.finished.store(true, Ordering::SeqCst);
                continue;
            }

            let fire_count = state.fires.fetch_add(1, Ordering::SeqCst) + 1;
            let tick = TimerTick {
                handle: task.handle.clone(),
                due_ms: task.due_ms,
                now_ms,
                fire_count,
            };
            let started = Instant::now();
            let outcome = run_isolated(|| (task.callback)(ctx, &tick));
            fired += 1;
            self.shared.invoked.fetch_add(1, Ordering::Relaxed);
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.shared.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        wheel = %self.shared.name,
                        timer = task.handle.id.0,
                        error = %err,
                        "timer_callback_failed"
                    );
                }
                Err(panic) => {
                    self.shared.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        wheel = %self.shared.name,
                        timer = task.handle.id.0,
                        panic = %panic,
                        "timer_callback_panicked"
                    );
                }
            }
            let elapsed = started.elapsed();
            if elapsed > SLOW_CALLBACK {
                warn!(
                    wheel = %self.shared.name,
                    timer = task.handle.id.0,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "timer_callback_slow"
                );
            }

            match task.interval_ms {
                Some(interval_ms) if !state.cancelled.load(Ordering::SeqCst) => {
                    task.due_ms = self.next_repeat_due(task.due_ms, interval_ms, now_ms);
                    reinsert.push(task);
                }
                _ => state.finished.store(true, Ordering::SeqCst),
            }
        }

        if !reinsert.is_empty() {
            let mut queue = self.shared.queue.lock();
            for task in reinsert {
                queue.push(task);
            }
        }
        fired
    }

    // Repeats keep their phase relative to the first due tick. Fires missed
    // while the region was stalled are coalesced into the next one.
    fn next_repeat_due(&self, due_ms: u64, interval_ms: u64, now_ms: u64) -> u64 {
        let next = due_ms.saturating_add(interval_ms);
        if next > now_ms {
            return next;
        }
        self.shared.late_reschedules.fetch_add(1, Ordering::Relaxed);
        let skipped = (now_ms - next) / interval_ms + 1;
        debug!(
            wheel = %self.shared.name,
            skipped,
            "timer_rescheduled_in_past"
        );
        next.saturating_add(skipped.saturating_mul(interval_ms))
    }

    /// Drops cancelled tasks still sitting in the queue.
    pub fn purge_cancelled(&self) -> usize {
        let mut queue = self.shared.queue.lock();
        let before = queue.heap.len();
        queue.heap.retain(|task| {
            let stopped = task.handle.is_stopped();
            if stopped {
                task.handle.state.finished.store(true, Ordering::SeqCst);
            }
            !stopped
        });
        before - queue.heap.len()
    }

    /// Cancels and drops every queued task.
    pub fn cancel_all(&self) -> usize {
        let mut queue = self.shared.queue.lock();
        let count = queue.heap.len();
        for task in queue.heap.drain() {
            task.handle.stop();
            task.handle.state.finished.store(true, Ordering::SeqCst);
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.shared
            .queue
            .lock()
            .heap
            .iter()
            .filter(|task| !task.handle.is_stopped())
            .count()
    }

    pub fn stats(&self) -> TimerStats {
        TimerStats {
            active: self.active_count(),
            invoked: self.shared.invoked.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            late_reschedules: self.shared.late_reschedules.load(Ordering::Relaxed),
        }
    }
}
