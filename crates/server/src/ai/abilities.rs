use serde::Deserialize;

/// One data-driven NPC ability, e.g. a dragon's breath.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AbilitySpec {
    pub name: String,
    pub trigger: AbilityTrigger,
    #[serde(default = "always")]
    pub chance_percent: u8,
    #[serde(default)]
    pub cast_ms: u64,
    #[serde(default)]
    pub cooldown_ms: u64,
    pub effect: AbilityEffect,
    /// Shown when the cast starts; `{name}` is replaced with the caster.
    #[serde(default)]
    pub announce: Option<String>,
}

fn always() -> u8 {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum AbilityTrigger {
    /// Health percent dropped to or below `percent` since the previous think.
    HealthBelow { percent: u8 },
    /// Every think while attacking.
    EveryThink,
}

impl AbilityTrigger {
    pub fn is_met(self, previous_health_percent: u8, health_percent: u8) -> bool {
        match self {
            AbilityTrigger::HealthBelow { percent } => {
                previous_health_percent > percent && health_percent <= percent
            }
            AbilityTrigger::EveryThink => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum AbilityEffect {
    /// Hits every living player within `radius` of the caster.
    AreaDamage { amount: u32, radius: f32 },
    /// Hits the caster's current target.
    TargetDamage { amount: u32 },
    /// Spawns adds next to the caster that despawn after `uptime_ms`.
    Summon {
        template: String,
        count: u32,
        uptime_ms: u64,
    },
    /// Restores a percentage of the caster's maximum health.
    Heal { percent: u8 },
}

/// Integer percent roll; the chance is clamped to `[0,100]`.
pub fn roll_percent(rng: &mut fastrand::Rng, chance_percent: u8) -> bool {
    let chance = chance_percent.min(100);
    chance > 0 && rng.u8(0..100) < chance
}

pub fn render_announcement(template: &str, caster_name: &str) -> String {
    template.replace("{name}", caster_name)
}
