use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use realm_engine::{parse_json, JsonError, Vec2, MAX_TIMER_DELAY_MS};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncounterDefinition {
    pub key: String,
    #[serde(default)]
    pub staging_ms: u64,
    pub timeout_ms: u64,
    pub arena: Arena,
    pub spawn_groups: Vec<SpawnGroup>,
    #[serde(default)]
    pub damage_links: Vec<DamageLink>,
    #[serde(default)]
    pub crowd_limit: Option<CrowdLimit>,
    #[serde(default)]
    pub announce_start: Option<String>,
    #[serde(default)]
    pub announce_victory: Option<String>,
    #[serde(default)]
    pub announce_timeout: Option<String>,
}

impl EncounterDefinition {
    pub fn has_role(&self, role: &str) -> bool {
        self.spawn_groups.iter().any(|group| group.role == role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Arena {
    pub center: Vec2,
    pub radius: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpawnGroup {
    pub template: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub count: SpawnCount,
    /// Defaults to the arena center.
    #[serde(default)]
    pub position: Option<Vec2>,
    #[serde(default)]
    pub scatter: f32,
    #[serde(default)]
    pub boss: bool,
}

fn default_role() -> String {
    "trash".to_string()
}

/// Either an exact count or an inclusive range rolled at activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SpawnCount {
    Fixed(u32),
    Range { min: u32, max: u32 },
}

impl Default for SpawnCount {
    fn default() -> Self {
        Self::Fixed(1)
    }
}

impl SpawnCount {
    pub fn roll(self, rng: &mut fastrand::Rng) -> u32 {
        match self {
            Self::Fixed(count) => count,
            Self::Range { min, max } => rng.u32(min.min(max)..=max.max(min)),
        }
    }
}

/// While the `to_role` actor lives, `percent` of damage taken by the
/// `from_role` actor lands on it instead.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DamageLink {
    pub from_role: String,
    pub to_role: String,
    pub percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrowdLimit {
    pub max_players: usize,
    pub enforcer_role: String,
    #[serde(default = "default_min_aggro")]
    pub min_aggro: u32,
    #[serde(default = "default_max_aggro")]
    pub max_aggro: u32,
}

fn default_min_aggro() -> u32 {
    50
}

fn default_max_aggro() -> u32 {
    100
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EncounterFile {
    encounters: Vec<EncounterDefinition>,
}

#[derive(Debug, Error)]
pub enum EncounterLoadError {
    #[error("failed to read encounters at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: JsonError,
    },
    #[error("duplicate encounter key '{key}'")]
    Duplicate { key: String },
    #[error("encounter '{key}' is invalid: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct EncounterCatalog {
    definitions: HashMap<String, EncounterDefinition>,
}

impl EncounterCatalog {
    pub fn load(path: &Path) -> Result<Self, EncounterLoadError> {
        let raw = fs::read_to_string(path).map_err(|source| EncounterLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json(&raw).map_err(|err| match err {
            EncounterLoadError::Parse { source, .. } => EncounterLoadError::Parse {
                origin: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        info!(
            path = %path.display(),
            encounters = catalog.len(),
            "encounters_loaded"
        );
        Ok(catalog)
    }

    pub fn from_json(raw: &str) -> Result<Self, EncounterLoadError> {
        let file: EncounterFile =
            parse_json(raw, "encounters").map_err(|source| EncounterLoadError::Parse {
                origin: "<inline>".to_string(),
                source,
            })?;
        Self::from_definitions(file.encounters)
    }

    pub fn from_definitions(
        definitions: Vec<EncounterDefinition>,
    ) -> Result<Self, EncounterLoadError> {
        let mut by_key = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            validate(&definition)?;
            let key = definition.key.clone();
            if by_key.insert(key.clone(), definition).is_some() {
                return Err(EncounterLoadError::Duplicate { key });
            }
        }
        Ok(Self {
            definitions: by_key,
        })
    }

    pub fn get(&self, key: &str) -> Option<&EncounterDefinition> {
        self.definitions.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

fn validate(definition: &EncounterDefinition) -> Result<(), EncounterLoadError> {
    let invalid = |reason: String| EncounterLoadError::Invalid {
        key: definition.key.clone(),
        reason,
    };
    if definition.timeout_ms == 0 {
        return Err(invalid("timeout_ms must be positive".to_string()));
    }
    for (field, value) in [
        ("staging_ms", definition.staging_ms),
        ("timeout_ms", definition.timeout_ms),
    ] {
        if value > MAX_TIMER_DELAY_MS {
            return Err(invalid(format!(
                "{field} {value} exceeds the {MAX_TIMER_DELAY_MS} ms timer limit"
            )));
        }
    }
    if !definition.spawn_groups.iter().any(|group| group.boss) {
        return Err(invalid("at least one spawn group must be a boss".to_string()));
    }
    for link in &definition.damage_links {
        if link.percent > 100 {
            return Err(invalid(format!(
                "damage link {} -> {} above 100 percent",
                link.from_role, link.to_role
            )));
        }
        for role in [&link.from_role, &link.to_role] {
            if !definition.has_role(role) {
                return Err(invalid(format!("damage link names unknown role '{role}'")));
            }
        }
    }
    if let Some(limit) = &definition.crowd_limit {
        if !definition.has_role(&limit.enforcer_role) {
            return Err(invalid(format!(
                "crowd limit names unknown role '{}'",
                limit.enforcer_role
            )));
        }
        if limit.min_aggro > limit.max_aggro {
            return Err(invalid("crowd limit min_aggro above max_aggro".to_string()));
        }
    }
    Ok(())
}
