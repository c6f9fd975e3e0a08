use std::collections::btree_map::Entry;

use realm_engine::{handler, HandlerError, Notification, Vec2, WorldQuery};
use tracing::{error, info, warn};

use crate::events::{GameEvent, DYING, ENCOUNTER_COMPLETED};
use crate::region_state::RegionState;
use crate::world::{ActorId, DamageRule};

use super::{EncounterDefinition, EncounterError, EncounterOrchestrator, EncounterOutcome};

impl RegionState {
    /// Starts staging a run of `key`. The actors appear once staging ends.
    pub fn begin_encounter(&mut self, key: &str) -> Result<(), EncounterError> {
        let now_ms = self.now_ms();
        let orchestrator = match self.encounters.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let definition = self.encounter_catalog.get(key).cloned().ok_or_else(|| {
                    EncounterError::UnknownEncounter {
                        key: key.to_string(),
                    }
                })?;
                entry.insert(EncounterOrchestrator::new(definition))
            }
        };
        orchestrator.begin(now_ms)?;
        let staging_ms = orchestrator.definition().staging_ms;

        let owned_key = key.to_string();
        let staging = self
            .timers
            .start_once(staging_ms, move |state: &mut RegionState, _tick| {
                state.activate_encounter(&owned_key);
                Ok(())
            });
        match staging {
            Ok(handle) => {
                if let Some(orchestrator) = self.encounters.get_mut(key) {
                    orchestrator.track_timer(handle);
                }
            }
            Err(source) => {
                self.complete_encounter(key, EncounterOutcome::Aborted);
                return Err(EncounterError::Schedule {
                    key: key.to_string(),
                    source,
                });
            }
        }
        info!(region = %self.name(), encounter = key, staging_ms, "encounter_staging");
        Ok(())
    }

    /// Ends staging: spawns every group, wires boss deaths, damage links,
    /// the crowd limit and the timeout.
    fn activate_encounter(&mut self, key: &str) {
        let Some(mut orchestrator) = self.encounters.remove(key) else {
            return;
        };
        let now_ms = self.now_ms();
        if let Err(err) = orchestrator.activate(now_ms) {
            warn!(region = %self.name(), error = %err, "encounter_activation_skipped");
            self.encounters.insert(key.to_string(), orchestrator);
            return;
        }
        let definition = orchestrator.definition().clone();
        if let Some(text) = &definition.announce_start {
            self.broadcast_near(definition.arena.center, definition.arena.radius, text);
        }

        self.spawn_groups(&definition, &mut orchestrator);
        self.link_damage(&definition, &mut orchestrator);
        self.enforce_crowd_limit(&definition, &orchestrator);

        let timeout_key = key.to_string();
        let timeout = self
            .timers
            .start_once(definition.timeout_ms, move |state: &mut RegionState, _tick| {
                state.complete_encounter(&timeout_key, EncounterOutcome::TimedOut);
                Ok(())
            });
        let timeout_armed = match timeout {
            Ok(handle) => {
                orchestrator.track_timer(handle);
                true
            }
            Err(err) => {
                error!(
                    region = %self.name(),
                    encounter = key,
                    error = %err,
                    "encounter_timeout_rejected"
                );
                false
            }
        };

        let spawned = orchestrator.spawned_count();
        let bosses = orchestrator.bosses_alive();
        self.encounters.insert(key.to_string(), orchestrator);
        if !timeout_armed {
            self.complete_encounter(key, EncounterOutcome::Aborted);
            return;
        }
        info!(
            region = %self.name(),
            encounter = key,
            spawned,
            bosses,
            timeout_ms = definition.timeout_ms,
            "encounter_active"
        );
        if bosses == 0 {
            warn!(region = %self.name(), encounter = key, "encounter_without_bosses");
            self.complete_encounter(key, EncounterOutcome::Aborted);
        }
    }

    fn spawn_groups(
        &mut self,
        definition: &EncounterDefinition,
        orchestrator: &mut EncounterOrchestrator,
    ) {
        for group in &definition.spawn_groups {
            let base = group.position.unwrap_or(definition.arena.center);
            let count = group.count.roll(&mut self.rng);
            for _ in 0..count {
                let position = scatter(base, group.scatter, &mut self.rng);
                let Some(actor) = self.spawn_npc(&group.template, position, true) else {
                    continue;
                };
                orchestrator.track_spawn(actor, &group.role, group.boss);
                if group.boss {
                    self.watch_boss(definition, orchestrator, actor);
                }
            }
        }
    }

    fn watch_boss(
        &mut self,
        definition: &EncounterDefinition,
        orchestrator: &mut EncounterOrchestrator,
        boss: ActorId,
    ) {
        let mailbox = self.mailbox.clone();
        let key = definition.key.clone();
        let on_dying = handler(move |_notification: &Notification<'_, GameEvent>| {
            let key = key.clone();
            mailbox
                .post(move |state: &mut RegionState| state.on_encounter_boss_dying(&key, boss))
                .map_err(|err| HandlerError::new(err.to_string()))
        });
        match self.events.add_object_handler(boss, DYING, on_dying, Some(boss)) {
            Ok(id) => orchestrator.track_subscription(DYING, id),
            Err(err) => {
                warn!(region = %self.name(), boss = %boss, error = %err, "boss_watch_rejected")
            }
        }
    }

    fn link_damage(
        &mut self,
        definition: &EncounterDefinition,
        orchestrator: &mut EncounterOrchestrator,
    ) {
        for link in &definition.damage_links {
            let partners = orchestrator.role_members(&link.to_role).to_vec();
            let sources = orchestrator.role_members(&link.from_role).to_vec();
            for source in &sources {
                for partner in partners.iter().filter(|partner| *partner != source) {
                    let rule = DamageRule::new(*source, *partner, link.percent);
                    self.world.add_damage_rule(rule);
                    orchestrator.track_rule(rule);
                }
            }
        }
    }

    /// Too many players in the arena sets every enforcer on all of them.
    fn enforce_crowd_limit(
        &mut self,
        definition: &EncounterDefinition,
        orchestrator: &EncounterOrchestrator,
    ) {
        let Some(limit) = &definition.crowd_limit else {
            return;
        };
        let players: Vec<ActorId> = self
            .world
            .players_in_radius(definition.arena.center, definition.arena.radius)
            .into_iter()
            .filter(|player| player.alive)
            .map(|player| player.id)
            .collect();
        if players.len() <= limit.max_players {
            return;
        }
        let now_ms = self.now_ms();
        let low = limit.min_aggro.min(limit.max_aggro);
        let high = limit.max_aggro.max(limit.min_aggro);
        for enforcer in orchestrator.role_members(&limit.enforcer_role) {
            for player in &players {
                let amount = self.rng.u32(low..=high);
                if let Some(brain) = self.brains.get_mut(enforcer) {
                    brain.add_to_aggro(*player, i64::from(amount), now_ms);
                }
            }
        }
        warn!(
            region = %self.name(),
            encounter = %definition.key,
            players = players.len(),
            max_players = limit.max_players,
            "encounter_crowd_limit"
        );
    }

    fn on_encounter_boss_dying(&mut self, key: &str, boss: ActorId) {
        let all_dead = self
            .encounters
            .get_mut(key)
            .is_some_and(|orchestrator| orchestrator.on_boss_dying(boss));
        if all_dead {
            self.complete_encounter(key, EncounterOutcome::Victory);
        }
    }

    /// Tears down the running lifecycle of `key`. Returns false when no run
    /// was in progress, so repeated completions are harmless.
    pub fn complete_encounter(&mut self, key: &str, outcome: EncounterOutcome) -> bool {
        let Some(orchestrator) = self.encounters.get_mut(key) else {
            return false;
        };
        let Some(teardown) = orchestrator.finish(outcome) else {
            return false;
        };
        let definition = orchestrator.definition();
        let arena = definition.arena;
        let announcement = match outcome {
            EncounterOutcome::Victory => definition.announce_victory.clone(),
            EncounterOutcome::TimedOut => definition.announce_timeout.clone(),
            EncounterOutcome::Aborted => None,
        };

        for timer in &teardown.timers {
            timer.stop();
        }
        for (subject, id) in teardown.subscriptions {
            if let Err(err) = self.events.remove_subscription(subject, id) {
                warn!(
                    region = %self.name(),
                    subject = %subject,
                    error = %err,
                    "encounter_unsubscribe_failed"
                );
            }
        }
        for rule in &teardown.rules {
            self.world.remove_damage_rule(rule);
        }
        let mut despawned = 0usize;
        for actor in &teardown.spawned {
            if self.despawn_actor(*actor) {
                despawned += 1;
            }
        }

        self.events.notify(
            ENCOUNTER_COMPLETED,
            None,
            &GameEvent::EncounterCompleted {
                key: key.to_string(),
                outcome,
            },
        );
        if let Some(text) = announcement {
            self.broadcast_near(arena.center, arena.radius, &text);
        }
        info!(
            region = %self.name(),
            encounter = key,
            outcome = %outcome,
            despawned,
            "encounter_complete"
        );
        true
    }

    pub fn abort_encounter(&mut self, key: &str) -> bool {
        self.complete_encounter(key, EncounterOutcome::Aborted)
    }
}

fn scatter(base: Vec2, radius: f32, rng: &mut fastrand::Rng) -> Vec2 {
    if radius <= 0.0 {
        return base;
    }
    base.offset(
        (rng.f32() * 2.0 - 1.0) * radius,
        (rng.f32() * 2.0 - 1.0) * radius,
    )
}

#[cfg(test)]
mod tests {
    use realm_engine::{RegionContext, MAX_TIMER_DELAY_MS};

    use crate::events::TAKE_DAMAGE;
    use crate::region_state::tests::Harness;

    use super::super::EncounterPhase;
    use super::*;

    const KEY: &str = "twin_giants";

    fn start(h: &mut Harness) {
        h.state.begin_encounter(KEY).expect("begin");
        assert_eq!(h.state.encounter(KEY).expect("tracked").phase(), EncounterPhase::Staging);
        h.advance(1000);
        assert_eq!(h.state.encounter(KEY).expect("tracked").phase(), EncounterPhase::Active);
    }

    fn role(h: &Harness, role: &str) -> ActorId {
        h.state.encounter(KEY).expect("tracked").role_members(role)[0]
    }

    #[test]
    fn activation_spawns_and_tracks_every_group() {
        let mut h = Harness::new();
        start(&mut h);
        let encounter = h.state.encounter(KEY).expect("tracked");
        // the group with an unknown template is skipped
        assert_eq!(encounter.spawned_count(), 5);
        assert_eq!(encounter.bosses_alive(), 2);
        assert_eq!(encounter.role_members("guard").len(), 3);
        assert_eq!(h.state.world().damage_rules().len(), 1);
        assert_eq!(h.state.events().handler_count(DYING), 2);
    }

    #[test]
    fn begin_while_running_is_rejected_without_respawning() {
        let mut h = Harness::new();
        h.state.begin_encounter(KEY).expect("begin");
        assert!(matches!(
            h.state.begin_encounter(KEY),
            Err(EncounterError::AlreadyInProgress {
                phase: EncounterPhase::Staging,
                ..
            })
        ));
        h.advance(1000);
        let before = h.state.world().len();
        assert_eq!(
            h.state.begin_encounter(KEY),
            Err(EncounterError::AlreadyInProgress {
                key: KEY.to_string(),
                phase: EncounterPhase::Active,
            })
        );
        h.advance(1000);
        assert_eq!(h.state.encounter(KEY).expect("tracked").spawned_count(), 5);
        assert_eq!(h.state.world().len(), before);
        assert_eq!(h.state.encounter(KEY).expect("tracked").runs(), 1);
    }

    #[test]
    fn linked_boss_forwards_half_while_partner_lives() {
        let mut h = Harness::new();
        let player = h.state.player_enter("alice", 10, Vec2::new(0.0, 100.0));
        start(&mut h);
        let (elder, twin) = (role(&h, "elder"), role(&h, "twin"));

        let report = h.state.deal_damage(Some(player), elder, 100).expect("hit");
        assert_eq!(report.applied, 50);
        assert_eq!(report.forwarded_total(), 50);
        assert_eq!(h.state.world().actor(elder).expect("elder").health, 950);
        assert_eq!(h.state.world().actor(twin).expect("twin").health, 950);
        let twin_ledger = h.state.world().ledger(twin).expect("ledger");
        assert_eq!(twin_ledger.entries()[0].forwarded_from, Some(elder));

        h.state.deal_damage(Some(player), twin, 2000).expect("kill twin");
        let report = h.state.deal_damage(Some(player), elder, 100).expect("hit");
        assert_eq!(report.applied, 100);
        assert!(report.forwarded.is_empty());
    }

    #[test]
    fn killing_every_boss_is_a_victory_and_cleans_up() {
        let mut h = Harness::new();
        let player = h.state.player_enter("alice", 10, Vec2::new(0.0, 100.0));
        start(&mut h);
        let elder = role(&h, "elder");

        // half lands on the twin, so one hit fells both
        let report = h.state.deal_damage(Some(player), elder, 2000).expect("hit");
        assert!(report.killed);
        assert!(report.forwarded[0].killed);
        h.settle();

        let encounter = h.state.encounter(KEY).expect("tracked");
        assert_eq!(encounter.phase(), EncounterPhase::Complete);
        assert_eq!(encounter.last_outcome(), Some(EncounterOutcome::Victory));
        assert!(h.sink.contains("The giants have fallen"));
        assert_eq!(h.state.world().len(), 1);
        assert!(h.state.world().damage_rules().is_empty());
        assert_eq!(h.state.events().handler_count(DYING), 0);
        assert_eq!(h.state.events().handler_count(TAKE_DAMAGE), 0);
        assert!(!h.state.complete_encounter(KEY, EncounterOutcome::TimedOut));
    }

    #[test]
    fn timeout_completes_and_despawns_everything() {
        let mut h = Harness::new();
        h.state.player_enter("alice", 10, Vec2::new(0.0, 100.0));
        start(&mut h);
        let elder = role(&h, "elder");

        h.advance(59_000);
        assert_eq!(h.state.encounter(KEY).expect("tracked").phase(), EncounterPhase::Active);
        h.advance(1000);
        let encounter = h.state.encounter(KEY).expect("tracked");
        assert_eq!(encounter.phase(), EncounterPhase::Complete);
        assert_eq!(encounter.last_outcome(), Some(EncounterOutcome::TimedOut));
        assert!(h.sink.contains("The giants sink back into the lava"));
        assert_eq!(h.state.world().len(), 1);
        assert!(h.state.brain(elder).is_none());
        assert_eq!(h.state.events().handler_count(DYING), 0);
    }

    #[test]
    fn unschedulable_timeout_aborts_instead_of_running_unbounded() {
        let mut h = Harness::new();
        let mut definition = h.state.encounter_catalog.get(KEY).cloned().expect("definition");
        definition.timeout_ms = MAX_TIMER_DELAY_MS + 1;
        h.state
            .encounters
            .insert(KEY.to_string(), EncounterOrchestrator::new(definition));

        h.state.begin_encounter(KEY).expect("begin");
        h.advance(1000);
        let encounter = h.state.encounter(KEY).expect("tracked");
        assert_eq!(encounter.phase(), EncounterPhase::Complete);
        assert_eq!(encounter.last_outcome(), Some(EncounterOutcome::Aborted));
        assert!(h.state.world().is_empty());
        assert!(h.state.world().damage_rules().is_empty());
        assert_eq!(h.state.events().handler_count(DYING), 0);
    }

    #[test]
    fn crowd_limit_sets_enforcers_on_every_player_in_the_arena() {
        let mut h = Harness::new();
        let alice = h.state.player_enter("alice", 10, Vec2::new(0.0, 100.0));
        let bob = h.state.player_enter("bob", 10, Vec2::new(100.0, 0.0));
        let outsider = h.state.player_enter("carol", 10, Vec2::new(9000.0, 0.0));
        h.state.begin_encounter(KEY).expect("begin");
        h.clock.advance(1000);
        // one step only, so no enforcer has thought yet
        h.region.step(&mut h.state);

        let guards = h.state.encounter(KEY).expect("tracked").role_members("guard").to_vec();
        for guard in guards {
            let aggro = h.state.brain(guard).expect("brain").aggro();
            for player in [alice, bob] {
                let amount = aggro.get(player).expect("on the list");
                assert!((50..=100).contains(&amount));
            }
            assert!(!aggro.contains(outsider));
        }
    }

    #[test]
    fn abort_then_restart_runs_a_fresh_lifecycle() {
        let mut h = Harness::new();
        start(&mut h);
        assert!(h.state.abort_encounter(KEY));
        assert!(!h.state.abort_encounter(KEY));
        assert!(h.state.world().is_empty());

        h.state.begin_encounter(KEY).expect("restart");
        h.advance(1000);
        let encounter = h.state.encounter(KEY).expect("tracked");
        assert_eq!(encounter.runs(), 2);
        assert_eq!(encounter.spawned_count(), 5);
    }

    #[test]
    fn abort_during_staging_never_spawns() {
        let mut h = Harness::new();
        h.state.begin_encounter(KEY).expect("begin");
        assert!(h.state.abort_encounter(KEY));
        h.advance(2000);
        assert!(h.state.world().is_empty());
        assert_eq!(
            h.state.encounter(KEY).expect("tracked").last_outcome(),
            Some(EncounterOutcome::Aborted)
        );
    }

    #[test]
    fn unknown_encounter_is_rejected() {
        let mut h = Harness::new();
        assert_eq!(
            h.state.begin_encounter("dragon_lair"),
            Err(EncounterError::UnknownEncounter {
                key: "dragon_lair".to_string()
            })
        );
        assert!(h.state.encounter("dragon_lair").is_none());
    }

    #[test]
    fn begin_request_is_marshalled_onto_the_region() {
        let mut h = Harness::new();
        let handle = h.region.handle();
        RegionState::request_begin_encounter(&handle, KEY).expect("post");
        assert!(h.state.encounter(KEY).is_none());
        h.settle();
        assert_eq!(h.state.encounter(KEY).expect("tracked").phase(), EncounterPhase::Staging);
    }

    #[test]
    fn shutdown_aborts_running_encounters() {
        let mut h = Harness::new();
        start(&mut h);
        h.state.on_shutdown();
        let encounter = h.state.encounter(KEY).expect("tracked");
        assert_eq!(encounter.last_outcome(), Some(EncounterOutcome::Aborted));
        assert!(h.state.world().is_empty());
    }
}
