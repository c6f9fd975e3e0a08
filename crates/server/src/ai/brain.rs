use std::fmt;

use realm_engine::{ActorSnapshot, ChatChannel, ObjectId, TimerHandle, WorldQuery};
use tracing::{debug, error};

use super::abilities::{render_announcement, roll_percent, AbilitySpec};
use super::aggro::{AggroTable, MAX_AGGRO_LIST_DISTANCE};
use super::con::aggro_level_to_target;

const MIN_THINK_INTERVAL_MS: u64 = 1500;
const BASE_THINK_INTERVAL_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrainState {
    Idle,
    Aggroed,
    Attacking,
    Fleeing,
    Casting,
    Dead,
}

impl fmt::Display for BrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Aggroed => "aggroed",
            Self::Attacking => "attacking",
            Self::Fleeing => "fleeing",
            Self::Casting => "casting",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrainConfig {
    pub think_interval_ms: u64,
    pub aggro_level: u8,
    pub aggro_range: f32,
    pub flee_health_percent: Option<u8>,
    pub abilities: Vec<AbilitySpec>,
}

impl BrainConfig {
    /// More aggressive NPCs think more often, never faster than every 1.5s.
    pub fn default_think_interval_ms(aggro_level: u8) -> u64 {
        BASE_THINK_INTERVAL_MS
            .saturating_sub(u64::from(aggro_level) * 100)
            .max(MIN_THINK_INTERVAL_MS)
    }
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            think_interval_ms: Self::default_think_interval_ms(0),
            aggro_level: 0,
            aggro_range: 0.0,
            flee_health_percent: None,
            abilities: Vec::new(),
        }
    }
}

/// Side effects requested by a think. The owning region applies them.
#[derive(Debug, Clone, PartialEq)]
pub enum BrainIntent {
    Attack {
        target: ObjectId,
    },
    BeginCast {
        ability: usize,
        target: Option<ObjectId>,
        cast_ms: u64,
    },
    Flee {
        from: ObjectId,
    },
    Announce {
        text: String,
        channel: ChatChannel,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThinkOutcome {
    pub transition: Option<(BrainState, BrainState)>,
    pub intents: Vec<BrainIntent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCast {
    pub ability: usize,
    pub target: Option<ObjectId>,
}

/// Behavior state machine for one NPC body.
#[derive(Debug)]
pub struct Brain {
    body: ObjectId,
    config: BrainConfig,
    state: BrainState,
    aggro: AggroTable,
    target: Option<ObjectId>,
    health_percent_old: u8,
    ability_ready_at: Vec<u64>,
    pending_cast: Option<PendingCast>,
    cast_finished: bool,
    think_timer: Option<TimerHandle>,
    attacked: bool,
}

impl Brain {
    pub fn new(body: ObjectId, config: BrainConfig) -> Self {
        let ability_count = config.abilities.len();
        Self {
            body,
            config,
            state: BrainState::Idle,
            aggro: AggroTable::new(),
            target: None,
            health_percent_old: 100,
            ability_ready_at: vec![0; ability_count],
            pending_cast: None,
            cast_finished: false,
            think_timer: None,
            attacked: false,
        }
    }

    pub fn body(&self) -> ObjectId {
        self.body
    }

    pub fn config(&self) -> &BrainConfig {
        &self.config
    }

    pub fn state(&self) -> BrainState {
        self.state
    }

    pub fn target(&self) -> Option<ObjectId> {
        self.target
    }

    pub fn aggro(&self) -> &AggroTable {
        &self.aggro
    }

    pub fn ability(&self, index: usize) -> Option<&AbilitySpec> {
        self.config.abilities.get(index)
    }

    pub fn set_think_timer(&mut self, handle: TimerHandle) {
        if let Some(previous) = self.think_timer.replace(handle) {
            previous.stop();
        }
    }

    pub fn stop_thinking(&mut self) {
        if let Some(handle) = self.think_timer.take() {
            handle.stop();
        }
    }

    /// Logs and ignores negative amounts.
    pub fn add_to_aggro(&mut self, target: ObjectId, amount: i64, now_ms: u64) -> Option<u64> {
        if self.state == BrainState::Dead || target == self.body {
            return None;
        }
        match self.aggro.add(target, amount, now_ms) {
            Ok(value) => Some(value),
            Err(err) => {
                error!(body = %self.body, error = %err, "aggro_add_rejected");
                None
            }
        }
    }

    /// Records damage taken. Returns true for the first hit this body has
    /// ever taken, which is when it calls for help.
    pub fn on_damaged(&mut self, attacker: ObjectId, amount: u32, now_ms: u64) -> bool {
        if self.add_to_aggro(attacker, i64::from(amount), now_ms).is_none() {
            return false;
        }
        !std::mem::replace(&mut self.attacked, true)
    }

    /// A healer who restores someone already on the list draws that much aggro.
    pub fn on_target_healed(
        &mut self,
        healed: ObjectId,
        healer: ObjectId,
        amount: u32,
        now_ms: u64,
    ) -> bool {
        if !self.aggro.contains(healed) {
            return false;
        }
        self.add_to_aggro(healer, i64::from(amount), now_ms).is_some()
    }

    pub fn on_body_died(&mut self) -> Option<(BrainState, BrainState)> {
        self.stop_thinking();
        self.aggro.clear();
        self.target = None;
        self.pending_cast = None;
        self.transition(BrainState::Dead)
    }

    /// Finishes the current cast and hands it back for the region to apply.
    pub fn complete_cast(&mut self) -> Option<PendingCast> {
        if self.state != BrainState::Casting {
            return None;
        }
        let cast = self.pending_cast.take()?;
        self.cast_finished = true;
        Some(cast)
    }

    /// One evaluation tick. Never fails; a vanished target drops the brain
    /// back to idle and the next tick starts over.
    pub fn think(
        &mut self,
        world: &dyn WorldQuery,
        now_ms: u64,
        rng: &mut fastrand::Rng,
    ) -> ThinkOutcome {
        let mut outcome = ThinkOutcome::default();
        if self.state == BrainState::Dead {
            return outcome;
        }
        let Some(body) = world.actor(self.body).filter(|actor| actor.alive) else {
            outcome.transition = self.on_body_died();
            return outcome;
        };

        self.prune_aggro(world, &body);
        if self.state == BrainState::Idle && self.config.aggro_level > 0 {
            self.check_proximity(world, &body, now_ms);
        }

        let health_percent = body.health_percent();
        outcome.transition = match self.state {
            BrainState::Idle => match self.select_target(world, &body) {
                Some(target) => {
                    self.target = Some(target);
                    self.transition(BrainState::Aggroed)
                }
                None => None,
            },
            BrainState::Aggroed => {
                self.target = self.select_target(world, &body);
                if self.target.is_some() {
                    self.transition(BrainState::Attacking)
                } else {
                    self.transition(BrainState::Idle)
                }
            }
            BrainState::Attacking => self.think_attacking(world, &body, now_ms, rng, &mut outcome),
            BrainState::Casting => {
                if self.cast_finished {
                    self.cast_finished = false;
                    self.target = self.select_target(world, &body);
                    if self.target.is_some() {
                        self.transition(BrainState::Attacking)
                    } else {
                        self.transition(BrainState::Idle)
                    }
                } else {
                    None
                }
            }
            BrainState::Fleeing => {
                self.target = None;
                self.transition(BrainState::Idle)
            }
            BrainState::Dead => None,
        };

        if self.state == BrainState::Attacking {
            if let Some(target) = self.target {
                outcome.intents.push(BrainIntent::Attack { target });
            }
        }
        self.health_percent_old = health_percent;
        outcome
    }

    fn think_attacking(
        &mut self,
        world: &dyn WorldQuery,
        body: &ActorSnapshot,
        now_ms: u64,
        rng: &mut fastrand::Rng,
        outcome: &mut ThinkOutcome,
    ) -> Option<(BrainState, BrainState)> {
        let Some(target) = self.select_target(world, body) else {
            self.target = None;
            return self.transition(BrainState::Idle);
        };
        self.target = Some(target);

        let health_percent = body.health_percent();
        if let Some(threshold) = self.config.flee_health_percent {
            if self.health_percent_old > threshold && health_percent <= threshold {
                outcome.intents.push(BrainIntent::Flee { from: target });
                return self.transition(BrainState::Fleeing);
            }
        }

        let index = self.pick_ability(health_percent, now_ms, rng)?;
        let ability = &self.config.abilities[index];
        self.ability_ready_at[index] = now_ms
            .saturating_add(ability.cast_ms)
            .saturating_add(ability.cooldown_ms);
        if let Some(template) = &ability.announce {
            outcome.intents.push(BrainIntent::Announce {
                text: render_announcement(template, &body.name),
                channel: ChatChannel::Yell,
            });
        }
        outcome.intents.push(BrainIntent::BeginCast {
            ability: index,
            target: Some(target),
            cast_ms: ability.cast_ms,
        });
        self.pending_cast = Some(PendingCast {
            ability: index,
            target: Some(target),
        });
        self.cast_finished = false;
        self.transition(BrainState::Casting)
    }

    fn pick_ability(
        &self,
        health_percent: u8,
        now_ms: u64,
        rng: &mut fastrand::Rng,
    ) -> Option<usize> {
        self.config
            .abilities
            .iter()
            .enumerate()
            .find(|(index, ability)| {
                now_ms >= self.ability_ready_at[*index]
                    && ability
                        .trigger
                        .is_met(self.health_percent_old, health_percent)
                    && roll_percent(rng, ability.chance_percent)
            })
            .map(|(index, _)| index)
    }

    fn prune_aggro(&mut self, world: &dyn WorldQuery, body: &ActorSnapshot) {
        let origin = body.position;
        let pruned = self.aggro.retain(|entry| {
            world.actor(entry.target).is_some_and(|target| {
                target.alive && target.position.distance(origin) <= MAX_AGGRO_LIST_DISTANCE
            })
        });
        if pruned.is_empty() {
            return;
        }
        debug!(body = %self.body, pruned = pruned.len(), "aggro_pruned");
        if self.target.is_some_and(|target| pruned.contains(&target)) {
            self.target = None;
        }
    }

    fn check_proximity(&mut self, world: &dyn WorldQuery, body: &ActorSnapshot, now_ms: u64) {
        for player in world.players_in_radius(body.position, self.config.aggro_range) {
            if !player.alive {
                continue;
            }
            let level = aggro_level_to_target(self.config.aggro_level, body.level, player.level);
            if level > 0 {
                self.add_to_aggro(player.id, i64::from(level) << 1, now_ms);
            }
        }
    }

    fn select_target(&self, world: &dyn WorldQuery, body: &ActorSnapshot) -> Option<ObjectId> {
        self.aggro.select_target(|target| {
            world
                .actor(target)
                .filter(|actor| actor.alive)
                .map(|actor| actor.position.distance(body.position))
        })
    }

    fn transition(&mut self, to: BrainState) -> Option<(BrainState, BrainState)> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        debug!(body = %self.body, from = %from, to = %to, "brain_transition");
        Some((from, to))
    }
}
