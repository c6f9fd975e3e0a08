use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use realm_engine::{
    handler, ActorKind, ChatChannel, HandlerError, MessageSink, Notification, ObjectRegistry,
    Record, Region, RegionContext, RegionError, RegionHandle, StoreError, StoreQueue, TimerWheel,
    Vec2, WorldQuery,
};
use tracing::{debug, error, info, warn};

use crate::ai::{AbilityEffect, Brain, BrainIntent};
use crate::encounter::{EncounterCatalog, EncounterOrchestrator};
use crate::events::{
    GameEvent, GameEventBus, DYING, ENEMY_HEALED, ENEMY_KILLED, PLAYER_ENTERED, PLAYER_LEFT,
    TAKE_DAMAGE,
};
use crate::tasks::{PlayerTask, TaskBook, TaskError, TaskRegistry};
use crate::templates::TemplateCatalog;
use crate::world::{ActorId, ActorSpawn, DamageReport, GameWorld, WorldError};

/// Heartbeats between full sweeps of dead event subscriptions.
const SUBSCRIPTION_SWEEP_HEARTBEATS: u64 = 200;
const SUMMON_SCATTER: f32 = 150.0;

/// Shared, read-mostly inputs for building a region.
#[derive(Clone)]
pub struct RegionServices {
    pub templates: Arc<TemplateCatalog>,
    pub encounters: Arc<EncounterCatalog>,
    pub store: StoreQueue,
    pub sink: Arc<dyn MessageSink>,
    pub tasks: TaskRegistry,
    pub event_lock_timeout: Duration,
    pub corpse_despawn_ms: u64,
    pub rng_seed: u64,
}

/// Everything one region thread owns. Only the region thread touches it;
/// other threads go through [`RegionHandle::post`].
pub struct RegionState {
    name: String,
    pub(crate) world: GameWorld,
    pub(crate) brains: BTreeMap<ActorId, Brain>,
    pub(crate) encounters: BTreeMap<String, EncounterOrchestrator>,
    pub(crate) encounter_catalog: Arc<EncounterCatalog>,
    templates: Arc<TemplateCatalog>,
    pub(crate) timers: TimerWheel<RegionState>,
    pub(crate) mailbox: RegionHandle<RegionState>,
    pub(crate) events: Arc<GameEventBus>,
    sink: Arc<dyn MessageSink>,
    tasks: TaskBook,
    pub(crate) rng: fastrand::Rng,
    player_names: BTreeMap<ActorId, String>,
    corpse_despawn_ms: u64,
    heartbeats: u64,
}

impl RegionState {
    pub fn new(region: &Region<RegionState>, services: RegionServices) -> Self {
        let registry = Arc::new(ObjectRegistry::new());
        let events = Arc::new(GameEventBus::with_lock_timeout(
            registry.clone(),
            services.event_lock_timeout,
        ));
        Self {
            name: region.name().to_string(),
            world: GameWorld::new(registry),
            brains: BTreeMap::new(),
            encounters: BTreeMap::new(),
            encounter_catalog: services.encounters,
            templates: services.templates,
            timers: region.wheel(),
            mailbox: region.handle(),
            events,
            sink: services.sink,
            tasks: TaskBook::new(services.tasks, services.store),
            rng: fastrand::Rng::with_seed(services.rng_seed),
            player_names: BTreeMap::new(),
            corpse_despawn_ms: services.corpse_despawn_ms,
            heartbeats: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn world(&self) -> &GameWorld {
        &self.world
    }

    pub fn events(&self) -> &Arc<GameEventBus> {
        &self.events
    }

    pub fn brain(&self, body: ActorId) -> Option<&Brain> {
        self.brains.get(&body)
    }

    pub fn encounter(&self, key: &str) -> Option<&EncounterOrchestrator> {
        self.encounters.get(key)
    }

    pub fn tasks(&self) -> &TaskBook {
        &self.tasks
    }

    pub fn now_ms(&self) -> u64 {
        self.timers.now_ms()
    }

    /// Places an NPC from a template and starts its brain. A missing
    /// template is logged and nothing is spawned.
    pub fn spawn_npc(
        &mut self,
        template_id: &str,
        position: Vec2,
        managed: bool,
    ) -> Option<ActorId> {
        let Some(template) = self.templates.get(template_id) else {
            error!(region = %self.name, template = template_id, "spawn_template_missing");
            return None;
        };
        let config = template.brain_config();
        let body = self.world.spawn(template.to_spawn(position, managed));
        let interval_ms = config.think_interval_ms.max(1);
        let first_think_ms = self.rng.u64(0..interval_ms);
        let mut brain = Brain::new(body, config);

        match self
            .timers
            .start_repeating(first_think_ms, interval_ms, move |state: &mut RegionState, tick| {
                if !state.think(body) {
                    tick.handle.stop();
                }
                Ok(())
            }) {
            Ok(handle) => brain.set_think_timer(handle),
            Err(err) => {
                warn!(region = %self.name, body = %body, error = %err, "think_timer_rejected")
            }
        }

        let mailbox = self.mailbox.clone();
        let on_damage = handler(move |notification: &Notification<'_, GameEvent>| {
            let GameEvent::TakeDamage {
                attacker: Some(attacker),
                amount,
            } = *notification.args
            else {
                return Ok(());
            };
            mailbox
                .post(move |state: &mut RegionState| state.on_npc_damaged(body, attacker, amount))
                .map_err(|err| HandlerError::new(err.to_string()))
        });
        if let Err(err) = self
            .events
            .add_object_handler(body, TAKE_DAMAGE, on_damage, Some(body))
        {
            warn!(region = %self.name, body = %body, error = %err, "damage_handler_rejected");
        }

        debug!(
            region = %self.name,
            body = %body,
            template = template_id,
            managed,
            "npc_spawned"
        );
        self.brains.insert(body, brain);
        Some(body)
    }

    /// Removes an actor with its brain and object-scoped subscriptions.
    pub fn despawn_actor(&mut self, id: ActorId) -> bool {
        if let Some(mut brain) = self.brains.remove(&id) {
            brain.stop_thinking();
        }
        if let Err(err) = self.events.remove_object_handlers(id) {
            warn!(region = %self.name, actor = %id, error = %err, "object_handlers_not_removed");
        }
        self.world.despawn(id).is_some()
    }

    /// Runs one think for `body`. Returns false once the brain is gone so
    /// its timer can stop itself.
    pub fn think(&mut self, body: ActorId) -> bool {
        let now_ms = self.now_ms();
        let Some(brain) = self.brains.get_mut(&body) else {
            return false;
        };
        let outcome = brain.think(&self.world, now_ms, &mut self.rng);
        if let Some((from, to)) = outcome.transition {
            debug!(region = %self.name, body = %body, from = %from, to = %to, "npc_state_changed");
        }
        for intent in outcome.intents {
            self.apply_intent(body, intent);
        }
        true
    }

    fn apply_intent(&mut self, body: ActorId, intent: BrainIntent) {
        match intent {
            BrainIntent::Attack { target } => self.attack(body, target),
            BrainIntent::BeginCast { cast_ms, .. } => {
                let scheduled = self
                    .timers
                    .start_once(cast_ms, move |state: &mut RegionState, _tick| {
                        state.complete_cast(body);
                        Ok(())
                    });
                if let Err(err) = scheduled {
                    warn!(region = %self.name, body = %body, error = %err, "cast_timer_rejected");
                }
            }
            BrainIntent::Flee { from } => {
                let (Some(actor), Some(threat)) = (self.world.actor(body), self.world.actor(from))
                else {
                    return;
                };
                let away = step_away(actor.position, threat.position, actor.attack_range * 2.0);
                if let Err(err) = self.world.move_actor(body, away) {
                    debug!(region = %self.name, body = %body, error = %err, "flee_failed");
                }
            }
            BrainIntent::Announce { text, channel } => self.say(body, &text, channel),
        }
    }

    fn attack(&mut self, body: ActorId, target: ActorId) {
        let (Some(attacker), Some(victim)) = (self.world.actor(body), self.world.actor(target))
        else {
            return;
        };
        let (damage, range) = (attacker.damage, attacker.attack_range);
        if attacker.position.distance(victim.position) > range {
            let closer = step_toward(attacker.position, victim.position, range * 0.9);
            if let Err(err) = self.world.move_actor(body, closer) {
                debug!(region = %self.name, body = %body, error = %err, "chase_failed");
                return;
            }
        }
        if let Err(err) = self.deal_damage(Some(body), target, damage) {
            debug!(region = %self.name, body = %body, error = %err, "attack_missed");
        }
    }

    /// Applies a hit and publishes the resulting events.
    pub fn deal_damage(
        &mut self,
        attacker: Option<ActorId>,
        target: ActorId,
        amount: u32,
    ) -> Result<DamageReport, WorldError> {
        let report = self.world.apply_damage(attacker, target, amount)?;
        self.events.notify(
            TAKE_DAMAGE,
            Some(target),
            &GameEvent::TakeDamage {
                attacker,
                amount: report.nominal,
            },
        );
        for forwarded in &report.forwarded {
            self.events.notify(
                TAKE_DAMAGE,
                Some(forwarded.to),
                &GameEvent::TakeDamage {
                    attacker,
                    amount: forwarded.amount,
                },
            );
        }
        for forwarded in &report.forwarded {
            if forwarded.killed {
                self.handle_death(forwarded.to, attacker);
            }
        }
        if report.killed {
            self.handle_death(target, attacker);
        }
        Ok(report)
    }

    fn handle_death(&mut self, victim: ActorId, killer: Option<ActorId>) {
        let (template, managed, kind) = match self.world.actor(victim) {
            Some(actor) => (actor.template.clone(), actor.managed, actor.kind),
            None => return,
        };
        info!(
            region = %self.name,
            victim = %victim,
            killer = ?killer,
            "actor_died"
        );
        if let Some(brain) = self.brains.get_mut(&victim) {
            brain.on_body_died();
        }
        self.events
            .notify(DYING, Some(victim), &GameEvent::Dying { killer });
        if let Some(killer) = killer {
            self.events.notify(
                ENEMY_KILLED,
                Some(killer),
                &GameEvent::EnemyKilled { victim, template },
            );
        }

        if kind == ActorKind::Npc && !managed {
            let scheduled = self.timers.start_once(
                self.corpse_despawn_ms,
                move |state: &mut RegionState, _tick| {
                    state.despawn_actor(victim);
                    Ok(())
                },
            );
            if let Err(err) = scheduled {
                warn!(region = %self.name, victim = %victim, error = %err, "corpse_timer_rejected");
            }
        }
    }

    /// Runs on the region thread after a damage notification.
    fn on_npc_damaged(&mut self, body: ActorId, attacker: ActorId, amount: u32) {
        let now_ms = self.now_ms();
        let Some(brain) = self.brains.get_mut(&body) else {
            return;
        };
        if brain.on_damaged(attacker, amount, now_ms) {
            let range = brain.config().aggro_range * 2.0 / 5.0;
            self.bring_friends(body, attacker, range);
        }
    }

    /// Same-faction NPCs near a freshly attacked one join in with a token
    /// amount of aggro.
    fn bring_friends(&mut self, body: ActorId, attacker: ActorId, range: f32) {
        let Some(actor) = self.world.actor(body) else {
            return;
        };
        let faction = actor.faction.clone();
        let friends: Vec<ActorId> = self
            .world
            .npcs_in_radius(actor.position, range)
            .into_iter()
            .filter(|friend| friend.alive && friend.id != body && friend.faction == faction)
            .map(|friend| friend.id)
            .collect();
        let now_ms = self.now_ms();
        for friend in &friends {
            if let Some(brain) = self.brains.get_mut(friend) {
                brain.add_to_aggro(attacker, 1, now_ms);
            }
        }
        if !friends.is_empty() {
            debug!(region = %self.name, body = %body, friends = friends.len(), "friends_called");
        }
    }

    pub fn heal_actor(
        &mut self,
        healer: ActorId,
        target: ActorId,
        amount: u32,
    ) -> Result<u32, WorldError> {
        let restored = self.world.heal(target, amount)?;
        if restored == 0 {
            return Ok(0);
        }
        self.events.notify(
            ENEMY_HEALED,
            Some(healer),
            &GameEvent::EnemyHealed {
                target,
                amount: restored,
            },
        );
        let now_ms = self.now_ms();
        for brain in self.brains.values_mut() {
            brain.on_target_healed(target, healer, restored, now_ms);
        }
        Ok(restored)
    }

    pub fn complete_cast(&mut self, body: ActorId) {
        let Some(brain) = self.brains.get_mut(&body) else {
            return;
        };
        let Some(cast) = brain.complete_cast() else {
            return;
        };
        let Some(ability) = brain.ability(cast.ability).cloned() else {
            return;
        };
        let Some(origin) = self.world.actor(body).map(|actor| actor.position) else {
            return;
        };
        info!(region = %self.name, body = %body, ability = %ability.name, "ability_cast");

        match ability.effect {
            AbilityEffect::AreaDamage { amount, radius } => {
                let victims: Vec<ActorId> = self
                    .world
                    .players_in_radius(origin, radius)
                    .into_iter()
                    .filter(|player| player.alive)
                    .map(|player| player.id)
                    .collect();
                for victim in victims {
                    if let Err(err) = self.deal_damage(Some(body), victim, amount) {
                        debug!(region = %self.name, error = %err, "area_hit_skipped");
                    }
                }
            }
            AbilityEffect::TargetDamage { amount } => {
                if let Some(target) = cast.target {
                    if let Err(err) = self.deal_damage(Some(body), target, amount) {
                        debug!(region = %self.name, error = %err, "target_hit_skipped");
                    }
                }
            }
            AbilityEffect::Summon {
                template,
                count,
                uptime_ms,
            } => {
                for _ in 0..count {
                    let dx = (self.rng.f32() * 2.0 - 1.0) * SUMMON_SCATTER;
                    let dy = (self.rng.f32() * 2.0 - 1.0) * SUMMON_SCATTER;
                    let Some(add) = self.spawn_npc(&template, origin.offset(dx, dy), false) else {
                        continue;
                    };
                    if let Some(target) = cast.target {
                        let now_ms = self.now_ms();
                        if let Some(brain) = self.brains.get_mut(&add) {
                            brain.add_to_aggro(target, 1, now_ms);
                        }
                    }
                    let despawn = self
                        .timers
                        .start_once(uptime_ms, move |state: &mut RegionState, _tick| {
                            state.despawn_actor(add);
                            Ok(())
                        });
                    if let Err(err) = despawn {
                        warn!(region = %self.name, error = %err, "summon_timer_rejected");
                    }
                }
            }
            AbilityEffect::Heal { percent } => {
                let Some(max_health) = self.world.actor(body).map(|actor| actor.max_health) else {
                    return;
                };
                let amount = ((u64::from(max_health) * u64::from(percent.min(100))) / 100) as u32;
                if let Err(err) = self.heal_actor(body, body, amount) {
                    debug!(region = %self.name, body = %body, error = %err, "self_heal_skipped");
                }
            }
        }
    }

    /// Adds a player and queues the restore of their saved tasks, which
    /// lands on a later step. Task progress follows kills made by this
    /// player for as long as the player exists.
    pub fn player_enter(&mut self, name: &str, level: u8, position: Vec2) -> ActorId {
        let player = self.world.spawn(ActorSpawn::player(name, level, position));
        self.player_names.insert(player, name.to_string());
        let mailbox = self.mailbox.clone();
        let restore = self.tasks.begin_restore(player, name, move |loaded| {
            let posted = mailbox.post(move |state: &mut RegionState| {
                state.finish_task_restore(player, loaded);
            });
            if let Err(err) = posted {
                warn!(player = %player, error = %err, "task_restore_undelivered");
            }
        });
        if let Err(err) = restore {
            warn!(region = %self.name, player = %player, error = %err, "task_restore_failed");
        }

        let mailbox = self.mailbox.clone();
        let on_kill = handler(move |notification: &Notification<'_, GameEvent>| {
            let GameEvent::EnemyKilled { template, .. } = notification.args else {
                return Ok(());
            };
            let template = template.clone();
            mailbox
                .post(move |state: &mut RegionState| state.record_kill(player, template.as_deref()))
                .map_err(|err| HandlerError::new(err.to_string()))
        });
        if let Err(err) = self
            .events
            .add_object_handler(player, ENEMY_KILLED, on_kill, Some(player))
        {
            warn!(region = %self.name, player = %player, error = %err, "kill_handler_rejected");
        }

        self.events
            .notify(PLAYER_ENTERED, None, &GameEvent::PlayerEntered { player });
        info!(region = %self.name, player = %player, name, "player_entered");
        player
    }

    /// Saves the player's tasks and removes the player. Subscriptions owned
    /// by the player go stale and are pruned on the next dispatch or sweep.
    pub fn player_leave(&mut self, player: ActorId) -> bool {
        if !self.player_names.contains_key(&player) {
            return false;
        }
        if let Err(err) = self.tasks.remove_player(player) {
            warn!(region = %self.name, player = %player, error = %err, "task_save_failed");
        }
        self.events
            .notify(PLAYER_LEFT, None, &GameEvent::PlayerLeft { player });
        self.player_names.remove(&player);
        self.world.despawn(player);
        info!(region = %self.name, player = %player, "player_left");
        true
    }

    pub fn assign_task(
        &mut self,
        player: ActorId,
        task: Box<dyn PlayerTask>,
    ) -> Result<(), TaskError> {
        self.tasks.assign(player, task)
    }

    fn finish_task_restore(
        &mut self,
        player: ActorId,
        loaded: Result<Option<Record>, StoreError>,
    ) {
        if let Err(err) = self.tasks.finish_restore(player, loaded) {
            warn!(region = %self.name, player = %player, error = %err, "task_restore_failed");
        }
    }

    fn record_kill(&mut self, player: ActorId, template: Option<&str>) {
        for completed in self.tasks.record_kill(player, template) {
            let text = format!("Task complete: {}", completed.description);
            self.say(completed.player, &text, ChatChannel::System);
        }
    }

    pub(crate) fn say(&self, actor: ActorId, text: &str, channel: ChatChannel) {
        if let Err(err) = self.sink.notify(actor, text, channel) {
            warn!(region = %self.name, actor = %actor, error = %err, "message_sink_failed");
        }
    }

    /// Sends `text` to every living player within `radius` of `origin`.
    pub(crate) fn broadcast_near(&self, origin: Vec2, radius: f32, text: &str) {
        for player in self.world.players_in_radius(origin, radius) {
            self.say(player.id, text, ChatChannel::Broadcast);
        }
    }

    /// Marshals an aggro change onto the region thread.
    pub fn request_add_aggro(
        handle: &RegionHandle<RegionState>,
        npc: ActorId,
        target: ActorId,
        amount: i64,
    ) -> Result<(), RegionError> {
        handle.post(move |state: &mut RegionState| {
            let now_ms = state.now_ms();
            if let Some(brain) = state.brains.get_mut(&npc) {
                brain.add_to_aggro(target, amount, now_ms);
            }
        })
    }

    pub fn request_begin_encounter(
        handle: &RegionHandle<RegionState>,
        key: impl Into<String>,
    ) -> Result<(), RegionError> {
        let key = key.into();
        handle.post(move |state: &mut RegionState| {
            if let Err(err) = state.begin_encounter(&key) {
                warn!(region = %state.name, error = %err, "encounter_begin_rejected");
            }
        })
    }
}

impl RegionContext for RegionState {
    fn on_heartbeat(&mut self, _now_ms: u64) {
        self.heartbeats = self.heartbeats.saturating_add(1);
        if self.heartbeats % SUBSCRIPTION_SWEEP_HEARTBEATS == 0 {
            let pruned = self.events.prune_dead();
            if pruned > 0 {
                debug!(region = %self.name, pruned, "event_subscriptions_swept");
            }
        }
    }

    fn on_shutdown(&mut self) {
        let running: Vec<String> = self
            .encounters
            .iter()
            .filter(|(_, encounter)| encounter.phase().is_running())
            .map(|(key, _)| key.clone())
            .collect();
        for key in running {
            self.abort_encounter(&key);
        }
        let saved = self.tasks.save_all();
        info!(
            region = %self.name,
            saved_tasks = saved,
            actors = self.world.len(),
            "region_state_shutdown"
        );
    }
}

fn step_toward(from: Vec2, to: Vec2, keep_distance: f32) -> Vec2 {
    let distance = from.distance(to);
    if distance <= keep_distance || distance == 0.0 {
        return from;
    }
    let travel = (distance - keep_distance) / distance;
    from.offset((to.x - from.x) * travel, (to.y - from.y) * travel)
}

fn step_away(from: Vec2, threat: Vec2, distance: f32) -> Vec2 {
    let current = from.distance(threat);
    if current == 0.0 {
        return from.offset(distance, 0.0);
    }
    let scale = distance / current;
    from.offset((from.x - threat.x) * scale, (from.y - threat.y) * scale)
}
