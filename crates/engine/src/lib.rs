use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod config;
pub mod events;
mod isolation;
pub mod json;
pub mod runtime;
pub mod services;

pub use config::{env_override, env_string};
pub use events::{
    handler, DispatchReport, EventBus, EventBusError, Handler, HandlerError, HandlerResult,
    Liveness, Notification, ObjectId, ObjectRegistry, Subject, SubscriptionId,
};
pub use json::{parse_json, JsonError};
pub use runtime::{
    Clock, ManualClock, MonotonicClock, Region, RegionConfig, RegionContext, RegionError,
    RegionHandle, RegionMetricsSnapshot, RegionThread, StepReport, TaskError, TaskResult,
    TimerError, TimerHandle, TimerTick, TimerWheel, MAX_TIMER_DELAY_MS,
};
pub use services::{
    ActorKind, ActorSnapshot, ChatChannel, JsonFileStore, LoadReply, MemoryStore, MessageSink,
    Persistence, Record, RecordingSink, SinkError, StoreError, StoreQueue, StoreWorker,
    TracingSink, Vec2, WorkerError, WorldQuery,
};

pub const ROOT_ENV_VAR: &str = "REALM_ROOT";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub store_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to read environment variable {var}: {source}")]
    EnvVar {
        var: &'static str,
        #[source]
        source: env::VarError,
    },
    #[error("failed to resolve current executable path: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("current executable path has no parent directory: {0}")]
    ExeHasNoParent(PathBuf),
    #[error("failed to create store directory at {path}: {source}")]
    CreateStoreDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "REALM_ROOT is set but does not point to a valid server root: {path}\n\
A valid root must contain a data/ directory."
    )]
    InvalidEnvRoot { path: PathBuf },
    #[error(
        "Could not detect server root by walking upward from executable directory: {start_dir}\n\
Expected a directory containing data/.\n\
Set {env_var} explicitly, for example:\n\
Bash/zsh: export {env_var}=\"/path/to/realm\""
    )]
    RootNotFound {
        start_dir: PathBuf,
        env_var: &'static str,
    },
}

/// Builds the paths under `root` and makes sure the record store directory
/// exists. `store_subdir` is resolved relative to the root.
pub fn app_paths_at(root: PathBuf, store_subdir: &Path) -> Result<AppPaths, StartupError> {
    let data_dir = root.join("data");
    let store_dir = root.join(store_subdir);

    fs::create_dir_all(&store_dir).map_err(|source| StartupError::CreateStoreDir {
        path: store_dir.clone(),
        source,
    })?;

    Ok(AppPaths {
        root,
        data_dir,
        store_dir,
    })
}

/// Locates the server root: `REALM_ROOT` when set, otherwise the nearest
/// ancestor of the executable or working directory that contains `data/`.
pub fn resolve_root() -> Result<PathBuf, StartupError> {
    match env::var(ROOT_ENV_VAR) {
        Ok(value) => {
            let raw = PathBuf::from(value);
            let normalized = normalize_path(&raw);
            if is_root_marker(&normalized) {
                Ok(normalized)
            } else {
                Err(StartupError::InvalidEnvRoot { path: normalized })
            }
        }
        Err(env::VarError::NotPresent) => {
            let exe = env::current_exe().map_err(StartupError::CurrentExe)?;
            let exe_dir = exe
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| StartupError::ExeHasNoParent(exe.clone()))?;

            let cwd = env::current_dir().ok();
            let candidates = exe_dir
                .ancestors()
                .chain(cwd.iter().flat_map(|dir| dir.ancestors()));
            for candidate in candidates {
                if is_root_marker(candidate) {
                    return Ok(normalize_path(candidate));
                }
            }

            Err(StartupError::RootNotFound {
                start_dir: normalize_path(&exe_dir),
                env_var: ROOT_ENV_VAR,
            })
        }
        Err(source) => Err(StartupError::EnvVar {
            var: ROOT_ENV_VAR,
            source,
        }),
    }
}

fn is_root_marker(path: &Path) -> bool {
    path.join("data").is_dir()
}

fn normalize_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
