use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use realm_engine::{env_override, env_string, parse_json, JsonError, Vec2};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

pub const CONFIG_ENV_VAR: &str = "REALM_CONFIG";
pub const RUN_SECS_ENV_VAR: &str = "REALM_RUN_SECS";
pub const HEARTBEAT_ENV_VAR: &str = "REALM_HEARTBEAT_MS";
const DEFAULT_CONFIG_FILE: &str = "server.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// How long the server runs before shutting down; 0 runs until killed.
    pub run_secs: u64,
    /// Record store location, relative to the server root.
    pub store_dir: PathBuf,
    /// Data files, relative to the `data/` directory.
    pub templates_file: PathBuf,
    pub encounters_file: PathBuf,
    pub corpse_despawn_ms: u64,
    pub event_lock_timeout_ms: u64,
    /// Fixed seed for chance rolls; random when unset.
    pub rng_seed: Option<u64>,
    pub regions: Vec<RegionSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            run_secs: 30,
            store_dir: PathBuf::from("store"),
            templates_file: PathBuf::from("npc_templates.json"),
            encounters_file: PathBuf::from("encounters.json"),
            corpse_despawn_ms: 60_000,
            event_lock_timeout_ms: 3000,
            rng_seed: None,
            regions: vec![RegionSettings::named("overworld")],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionSettings {
    pub name: String,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Encounters begun as soon as the region is running.
    #[serde(default)]
    pub encounters: Vec<String>,
    #[serde(default)]
    pub npcs: Vec<NpcPlacement>,
    #[serde(default)]
    pub players: Vec<PlayerPlacement>,
}

impl RegionSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            heartbeat_ms: default_heartbeat_ms(),
            encounters: Vec::new(),
            npcs: Vec::new(),
            players: Vec::new(),
        }
    }
}

fn default_heartbeat_ms() -> u64 {
    50
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NpcPlacement {
    pub template: String,
    pub position: Vec2,
}

/// A scripted player that enters the region at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayerPlacement {
    pub name: String,
    pub level: u8,
    pub position: Vec2,
    #[serde(default)]
    pub kill_tasks: Vec<KillTaskSettings>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KillTaskSettings {
    pub template: String,
    pub count: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] JsonError),
    #[error("config must declare at least one region")]
    NoRegions,
    #[error("region '{name}' is declared more than once")]
    DuplicateRegion { name: String },
    #[error("region '{name}' has a zero heartbeat")]
    ZeroHeartbeat { name: String },
    #[error("region name must not be empty")]
    EmptyRegionName,
}

impl ServerConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(parse_json(raw, "config")?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Picks the config file from `REALM_CONFIG`, else `data/server.json`
    /// when present, else the defaults. Env overrides and validation run on
    /// the result.
    pub fn resolve(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = env_string(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .or_else(|| Some(data_dir.join(DEFAULT_CONFIG_FILE)).filter(|path| path.is_file()));
        let mut config = match &path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        let source = path
            .as_ref()
            .map_or_else(|| "defaults".to_string(), |path| path.display().to_string());
        info!(
            source = %source,
            regions = config.regions.len(),
            run_secs = config.run_secs,
            "config_loaded"
        );
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.run_secs = env_override(RUN_SECS_ENV_VAR, self.run_secs);
        for region in &mut self.regions {
            region.heartbeat_ms = env_override(HEARTBEAT_ENV_VAR, region.heartbeat_ms);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.regions.is_empty() {
            return Err(ConfigError::NoRegions);
        }
        let mut seen = HashSet::new();
        for region in &self.regions {
            if region.name.trim().is_empty() {
                return Err(ConfigError::EmptyRegionName);
            }
            if !seen.insert(region.name.as_str()) {
                return Err(ConfigError::DuplicateRegion {
                    name: region.name.clone(),
                });
            }
            if region.heartbeat_ms == 0 {
                return Err(ConfigError::ZeroHeartbeat {
                    name: region.name.clone(),
                });
            }
        }
        Ok(())
    }
}
