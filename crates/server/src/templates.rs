use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use realm_engine::{parse_json, ActorKind, JsonError, Vec2};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::ai::{AbilityEffect, AbilitySpec, BrainConfig};
use crate::world::ActorSpawn;

/// Stat table for one kind of NPC.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NpcTemplate {
    pub id: String,
    pub name: String,
    pub level: u8,
    pub max_health: u32,
    #[serde(default)]
    pub damage: u32,
    #[serde(default = "default_attack_range")]
    pub attack_range: f32,
    #[serde(default)]
    pub aggro_level: u8,
    #[serde(default = "default_aggro_range")]
    pub aggro_range: f32,
    #[serde(default = "default_faction")]
    pub faction: String,
    #[serde(default)]
    pub think_interval_ms: Option<u64>,
    #[serde(default)]
    pub flee_health_percent: Option<u8>,
    #[serde(default)]
    pub abilities: Vec<AbilitySpec>,
}

fn default_attack_range() -> f32 {
    200.0
}

fn default_aggro_range() -> f32 {
    400.0
}

fn default_faction() -> String {
    "monsters".to_string()
}

impl NpcTemplate {
    pub fn brain_config(&self) -> BrainConfig {
        BrainConfig {
            think_interval_ms: self
                .think_interval_ms
                .unwrap_or_else(|| BrainConfig::default_think_interval_ms(self.aggro_level)),
            aggro_level: self.aggro_level.min(100),
            aggro_range: self.aggro_range,
            flee_health_percent: self.flee_health_percent,
            abilities: self.abilities.clone(),
        }
    }

    pub fn to_spawn(&self, position: Vec2, managed: bool) -> ActorSpawn {
        ActorSpawn {
            kind: ActorKind::Npc,
            name: self.name.clone(),
            template: Some(self.id.clone()),
            faction: self.faction.clone(),
            level: self.level,
            position,
            max_health: self.max_health,
            damage: self.damage,
            attack_range: self.attack_range,
            managed,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateFile {
    templates: Vec<NpcTemplate>,
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read templates at {path}: {source}")]
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
    #[error("duplicate npc template id '{id}'")]
    Duplicate { id: String },
    #[error("npc template '{id}' is invalid: {reason}")]
    Invalid { id: String, reason: String },
}

/// Templates in file order with a lookup index by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: Vec<NpcTemplate>,
    index_by_id: HashMap<String, usize>,
}

impl TemplateCatalog {
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let raw = fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json(&raw).map_err(|err| match err {
            TemplateError::Parse { source, .. } => TemplateError::Parse {
                origin: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        info!(
            path = %path.display(),
            templates = catalog.len(),
            "npc_templates_loaded"
        );
        Ok(catalog)
    }

    pub fn from_json(raw: &str) -> Result<Self, TemplateError> {
        let file: TemplateFile =
            parse_json(raw, "npc templates").map_err(|source| TemplateError::Parse {
                origin: "<inline>".to_string(),
                source,
            })?;
        Self::from_templates(file.templates)
    }

    pub fn from_templates(templates: Vec<NpcTemplate>) -> Result<Self, TemplateError> {
        let mut index_by_id = HashMap::with_capacity(templates.len());
        for (index, template) in templates.iter().enumerate() {
            if index_by_id.insert(template.id.clone(), index).is_some() {
                return Err(TemplateError::Duplicate {
                    id: template.id.clone(),
                });
            }
        }
        let catalog = Self {
            templates,
            index_by_id,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&NpcTemplate> {
        self.index_by_id
            .get(id)
            .and_then(|index| self.templates.get(*index))
    }

    pub fn templates(&self) -> &[NpcTemplate] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    fn validate(&self) -> Result<(), TemplateError> {
        for template in &self.templates {
            let invalid = |reason: String| TemplateError::Invalid {
                id: template.id.clone(),
                reason,
            };
            if template.max_health == 0 {
                return Err(invalid("max_health must be positive".to_string()));
            }
            if template.flee_health_percent.is_some_and(|percent| percent > 100) {
                return Err(invalid("flee_health_percent above 100".to_string()));
            }
            for ability in &template.abilities {
                if ability.chance_percent > 100 {
                    return Err(invalid(format!(
                        "ability '{}' chance_percent above 100",
                        ability.name
                    )));
                }
                if let AbilityEffect::Summon { template: add, .. } = &ability.effect {
                    if self.get(add).is_none() {
                        return Err(invalid(format!(
                            "ability '{}' summons unknown template '{add}'",
                            ability.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = r#"{
        "templates": [
            { "id": "whelp", "name": "Dragon Whelp", "level": 40, "max_health": 300 },
            {
                "id": "dragon",
                "name": "Golestandt",
                "level": 75,
                "max_health": 20000,
                "damage": 250,
                "aggro_level": 100,
                "abilities": [{
                    "name": "call whelps",
                    "trigger": { "kind": "health_below", "percent": 50 },
                    "effect": { "kind": "summon", "template": "whelp", "count": 3, "uptime_ms": 60000 }
                }]
            }
        ]
    }"#;

    #[test]
    fn loads_with_defaults_and_lookup() {
        let catalog = TemplateCatalog::from_json(RAW).expect("catalog parses");
        assert_eq!(catalog.len(), 2);
        let whelp = catalog.get("whelp").expect("whelp");
        assert_eq!(whelp.faction, "monsters");
        assert_eq!(whelp.aggro_level, 0);
        assert_eq!(whelp.brain_config().think_interval_ms, 10_000);

        let dragon = catalog.get("dragon").expect("dragon");
        assert_eq!(dragon.brain_config().think_interval_ms, 1_500);
        assert_eq!(dragon.abilities[0].chance_percent, 100);
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let raw = r#"{ "templates": [
            { "id": "a", "name": "A", "level": 1, "max_health": 1 },
            { "id": "a", "name": "B", "level": 1, "max_health": 1 }
        ] }"#;
        let err = TemplateCatalog::from_json(raw).expect_err("duplicate");
        assert!(matches!(err, TemplateError::Duplicate { id } if id == "a"));
    }

    #[test]
    fn unknown_summon_template_is_invalid() {
        let raw = RAW.replace("\"template\": \"whelp\"", "\"template\": \"wyrm\"");
        let err = TemplateCatalog::from_json(&raw).expect_err("invalid");
        assert!(err.to_string().contains("wyrm"));
    }

    #[test]
    fn parse_errors_name_the_field_path() {
        let raw = r#"{ "templates": [ { "id": "a", "name": "A", "level": "high", "max_health": 1 } ] }"#;
        let err = TemplateCatalog::from_json(raw).expect_err("bad level");
        let message = err.to_string();
        assert!(message.contains("templates[0].level"), "{message}");
    }
}
