use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use realm_engine::{RegionThread, StoreWorker};
use tracing::{error, info};

use crate::region_state::RegionState;

use super::bootstrap::ServerWiring;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn run(wiring: ServerWiring) -> ExitCode {
    let ServerWiring {
        config,
        regions,
        store_worker,
    } = wiring;

    let mut threads: Vec<RegionThread<RegionState>> = Vec::with_capacity(regions.len());
    for wiring in regions {
        let thread = match wiring.region.spawn(wiring.state) {
            Ok(thread) => thread,
            Err(err) => {
                error!(error = %err, "startup_failed");
                shutdown_all(threads);
                stop_store_worker(store_worker);
                return ExitCode::FAILURE;
            }
        };
        let handle = thread.handle();
        for key in &wiring.encounters {
            if let Err(err) = RegionState::request_begin_encounter(&handle, key.as_str()) {
                error!(
                    region = %handle.name(),
                    encounter = %key,
                    error = %err,
                    "encounter_request_failed"
                );
            }
        }
        threads.push(thread);
    }

    let run_for = (config.run_secs > 0).then(|| Duration::from_secs(config.run_secs));
    info!(
        regions = threads.len(),
        run_secs = config.run_secs,
        "server_running"
    );
    let started = Instant::now();
    let mut last_status = started;
    while run_for.map_or(true, |limit| started.elapsed() < limit) {
        thread::sleep(POLL_INTERVAL);
        if last_status.elapsed() >= STATUS_LOG_INTERVAL {
            last_status = Instant::now();
            log_status(&threads);
        }
    }

    // Regions queue their final saves on shutdown, so the worker stops last.
    let regions_clean = shutdown_all(threads);
    let store_clean = stop_store_worker(store_worker);
    if regions_clean && store_clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn stop_store_worker(worker: StoreWorker) -> bool {
    match worker.shutdown_and_join() {
        Ok(()) => {
            info!("store_worker_joined");
            true
        }
        Err(err) => {
            error!(error = %err, "store_worker_join_failed");
            false
        }
    }
}

fn log_status(threads: &[RegionThread<RegionState>]) {
    for thread in threads {
        let handle = thread.handle();
        let metrics = handle.metrics();
        info!(
            region = %handle.name(),
            heartbeats_per_second = metrics.heartbeats_per_second,
            requests_per_second = metrics.requests_per_second,
            active_timers = metrics.active_timers,
            "server_status"
        );
    }
}

// Returns false when any region failed to stop cleanly.
fn shutdown_all(threads: Vec<RegionThread<RegionState>>) -> bool {
    for thread in &threads {
        if let Err(err) = thread.handle().shutdown() {
            error!(region = %thread.handle().name(), error = %err, "region_shutdown_failed");
        }
    }
    let mut clean = true;
    for thread in threads {
        match thread.shutdown_and_join() {
            Ok(state) => info!(
                region = %state.name(),
                actors = state.world().len(),
                "region_joined"
            ),
            Err(err) => {
                clean = false;
                error!(error = %err, "region_join_failed");
            }
        }
    }
    clean
}
