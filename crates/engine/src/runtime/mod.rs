mod clock;
mod metrics;
mod region;
mod timers;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use metrics::{MetricsHandle, RegionMetricsSnapshot};
pub use region::{
    plan_heartbeats, HeartbeatPlan, Region, RegionConfig, RegionContext, RegionError,
    RegionHandle, RegionThread, StepReport,
};
pub use timers::{
    TaskError, TaskResult, TimerError, TimerHandle, TimerId, TimerStats, TimerTick, TimerWheel,
    MAX_TIMER_DELAY_MS,
};
