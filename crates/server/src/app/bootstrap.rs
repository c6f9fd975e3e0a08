use std::sync::Arc;
use std::time::Duration;

use realm_engine::{
    app_paths_at, resolve_root, JsonFileStore, MonotonicClock, Region, RegionConfig,
    StartupError, StoreWorker, TracingSink, WorkerError,
};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::encounter::{EncounterCatalog, EncounterLoadError};
use crate::region_state::{RegionServices, RegionState};
use crate::tasks::{KillTask, TaskError, TaskRegistry};
use crate::templates::{TemplateCatalog, TemplateError};

use super::config::{ConfigError, RegionSettings, ServerConfig};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Templates(#[from] TemplateError),
    #[error(transparent)]
    Encounters(#[from] EncounterLoadError),
    #[error("region '{region}' begins unknown encounter '{key}'")]
    UnknownEncounter { region: String, key: String },
    #[error("region '{region}' places unknown npc template '{template}'")]
    UnknownTemplate { region: String, template: String },
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    StoreWorker(#[from] WorkerError),
}

/// One region ready to be spawned on its own thread.
pub struct RegionWiring {
    pub region: Region<RegionState>,
    pub state: RegionState,
    pub encounters: Vec<String>,
}

pub struct ServerWiring {
    pub config: ServerConfig,
    pub regions: Vec<RegionWiring>,
    /// Performs record I/O for every region; joined after the regions stop.
    pub store_worker: StoreWorker,
}

pub fn build_server() -> Result<ServerWiring, BootstrapError> {
    init_tracing();
    info!("=== Realm Server Startup ===");

    let root = resolve_root()?;
    let config = ServerConfig::resolve(&root.join("data"))?;
    let paths = app_paths_at(root, &config.store_dir)?;
    info!(
        root = %paths.root.display(),
        store = %paths.store_dir.display(),
        "paths_resolved"
    );

    let templates = Arc::new(TemplateCatalog::load(
        &paths.data_dir.join(&config.templates_file),
    )?);
    let encounters = Arc::new(EncounterCatalog::load(
        &paths.data_dir.join(&config.encounters_file),
    )?);
    let base_seed = config.rng_seed.unwrap_or_else(|| fastrand::u64(..));
    let store_worker = StoreWorker::spawn(Arc::new(JsonFileStore::new(paths.store_dir.clone())))?;
    let services = RegionServices {
        templates,
        encounters,
        store: store_worker.queue(),
        sink: Arc::new(TracingSink),
        tasks: TaskRegistry::with_builtin(),
        event_lock_timeout: Duration::from_millis(config.event_lock_timeout_ms),
        corpse_despawn_ms: config.corpse_despawn_ms,
        rng_seed: base_seed,
    };

    let mut regions = Vec::with_capacity(config.regions.len());
    for (index, settings) in config.regions.iter().enumerate() {
        let services = RegionServices {
            rng_seed: base_seed.wrapping_add(index as u64),
            ..services.clone()
        };
        match build_region(settings, services) {
            Ok(region) => regions.push(region),
            Err(err) => {
                if let Err(join_err) = store_worker.shutdown_and_join() {
                    warn!(error = %join_err, "store_worker_join_failed");
                }
                return Err(err);
            }
        }
    }

    Ok(ServerWiring {
        config,
        regions,
        store_worker,
    })
}

/// Builds a region and places its scripted NPCs and players.
pub fn build_region(
    settings: &RegionSettings,
    services: RegionServices,
) -> Result<RegionWiring, BootstrapError> {
    for key in &settings.encounters {
        if services.encounters.get(key).is_none() {
            return Err(BootstrapError::UnknownEncounter {
                region: settings.name.clone(),
                key: key.clone(),
            });
        }
    }
    for npc in &settings.npcs {
        if services.templates.get(&npc.template).is_none() {
            return Err(BootstrapError::UnknownTemplate {
                region: settings.name.clone(),
                template: npc.template.clone(),
            });
        }
    }

    let config = RegionConfig {
        heartbeat: Duration::from_millis(settings.heartbeat_ms),
        ..RegionConfig::named(settings.name.as_str())
    };
    let region = Region::new(config, Arc::new(MonotonicClock::new()));
    let mut state = RegionState::new(&region, services);

    for npc in &settings.npcs {
        state.spawn_npc(&npc.template, npc.position, false);
    }
    // Saved progress on a matching task wins once the restore lands.
    for placement in &settings.players {
        let player = state.player_enter(&placement.name, placement.level, placement.position);
        for task in &placement.kill_tasks {
            let task = KillTask::new(placement.name.as_str(), task.template.as_str(), task.count);
            state.assign_task(player, Box::new(task))?;
        }
    }
    if settings.players.is_empty() && !settings.encounters.is_empty() {
        warn!(region = %settings.name, "encounters_without_players");
    }
    info!(
        region = %settings.name,
        actors = state.world().len(),
        encounters = settings.encounters.len(),
        "region_built"
    );

    Ok(RegionWiring {
        region,
        state,
        encounters: settings.encounters.clone(),
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}
