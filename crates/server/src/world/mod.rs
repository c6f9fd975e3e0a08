use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use realm_engine::{ActorKind, ActorSnapshot, ObjectId, ObjectRegistry, Vec2, WorldQuery};
use thiserror::Error;
use tracing::{debug, info};

pub mod damage;

pub use damage::{
    DamageLedger, DamageReport, DamageRule, ForwardedDamage, LedgerEntry, LEDGER_CAPACITY,
};

pub type ActorId = ObjectId;

#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub id: ActorId,
    pub kind: ActorKind,
    pub name: String,
    pub template: Option<String>,
    pub faction: String,
    pub level: u8,
    pub position: Vec2,
    pub health: u32,
    pub max_health: u32,
    pub damage: u32,
    pub attack_range: f32,
    /// Owned by an encounter; only that encounter may despawn it.
    pub managed: bool,
}

impl Actor {
    pub fn is_alive(&self) -> bool {
        self.health > 0
    }

    pub fn snapshot(&self) -> ActorSnapshot {
        ActorSnapshot {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            faction: self.faction.clone(),
            level: self.level,
            position: self.position,
            health: self.health,
            max_health: self.max_health,
            alive: self.is_alive(),
        }
    }
}

/// Everything needed to place a new actor; the world assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorSpawn {
    pub kind: ActorKind,
    pub name: String,
    pub template: Option<String>,
    pub faction: String,
    pub level: u8,
    pub position: Vec2,
    pub max_health: u32,
    pub damage: u32,
    pub attack_range: f32,
    pub managed: bool,
}

impl ActorSpawn {
    pub fn player(name: impl Into<String>, level: u8, position: Vec2) -> Self {
        Self {
            kind: ActorKind::Player,
            name: name.into(),
            template: None,
            faction: "players".to_string(),
            level,
            position,
            max_health: 100 + u32::from(level) * 20,
            damage: 5 + u32::from(level),
            attack_range: 150.0,
            managed: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("actor {0} does not exist")]
    UnknownActor(ActorId),
    #[error("actor {0} is already dead")]
    ActorDead(ActorId),
}

/// Actor table for one region. Ids come from the shared object registry so
/// despawning an actor also invalidates every weak reference to it.
pub struct GameWorld {
    registry: Arc<ObjectRegistry>,
    actors: BTreeMap<ActorId, Actor>,
    damage_rules: Vec<DamageRule>,
    ledgers: HashMap<ActorId, DamageLedger>,
}

impl GameWorld {
    pub fn new(registry: Arc<ObjectRegistry>) -> Self {
        Self {
            registry,
            actors: BTreeMap::new(),
            damage_rules: Vec::new(),
            ledgers: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub fn spawn(&mut self, spawn: ActorSpawn) -> ActorId {
        let id = self.registry.register();
        debug!(actor = %id, name = %spawn.name, kind = ?spawn.kind, "actor_spawned");
        self.actors.insert(
            id,
            Actor {
                id,
                kind: spawn.kind,
                name: spawn.name,
                template: spawn.template,
                faction: spawn.faction,
                level: spawn.level,
                position: spawn.position,
                health: spawn.max_health,
                max_health: spawn.max_health,
                damage: spawn.damage,
                attack_range: spawn.attack_range,
                managed: spawn.managed,
            },
        );
        id
    }

    /// Removes the actor, releases its id and drops every damage rule that
    /// mentions it. Returns `None` for ids that are already gone.
    pub fn despawn(&mut self, id: ActorId) -> Option<Actor> {
        let actor = self.actors.remove(&id)?;
        self.registry.release(id);
        self.remove_rules_involving(id);
        self.ledgers.remove(&id);
        debug!(actor = %id, name = %actor.name, "actor_despawned");
        Some(actor)
    }

    pub fn actor(&self, id: ActorId) -> Option<&Actor> {
        self.actors.get(&id)
    }

    pub fn actor_mut(&mut self, id: ActorId) -> Option<&mut Actor> {
        self.actors.get_mut(&id)
    }

    pub fn contains(&self, id: ActorId) -> bool {
        self.actors.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    pub fn move_actor(&mut self, id: ActorId, position: Vec2) -> Result<(), WorldError> {
        let actor = self
            .actors
            .get_mut(&id)
            .ok_or(WorldError::UnknownActor(id))?;
        actor.position = position;
        Ok(())
    }

    /// Restores up to `amount` health and returns how much was restored.
    pub fn heal(&mut self, id: ActorId, amount: u32) -> Result<u32, WorldError> {
        let actor = self
            .actors
            .get_mut(&id)
            .ok_or(WorldError::UnknownActor(id))?;
        if !actor.is_alive() {
            return Err(WorldError::ActorDead(id));
        }
        let restored = amount.min(actor.max_health.saturating_sub(actor.health));
        actor.health += restored;
        Ok(restored)
    }

    pub fn add_damage_rule(&mut self, rule: DamageRule) {
        info!(
            source = %rule.source,
            partner = %rule.partner,
            percent = rule.percent,
            "damage_rule_added"
        );
        self.damage_rules.push(rule);
    }

    pub fn remove_damage_rule(&mut self, rule: &DamageRule) -> bool {
        let Some(position) = self.damage_rules.iter().position(|existing| existing == rule) else {
            return false;
        };
        self.damage_rules.remove(position);
        true
    }

    pub fn remove_rules_involving(&mut self, actor: ActorId) -> usize {
        let before = self.damage_rules.len();
        self.damage_rules.retain(|rule| !rule.involves(actor));
        before - self.damage_rules.len()
    }

    pub fn damage_rules(&self) -> &[DamageRule] {
        &self.damage_rules
    }

    pub fn ledger(&self, id: ActorId) -> Option<&DamageLedger> {
        self.ledgers.get(&id)
    }

    /// Applies one hit of `amount` to `target`.
    ///
    /// Each rule whose source is the target moves its share onto a living
    /// partner; the target keeps the remainder. Forwarded shares do not
    /// forward again. Both pools and the nominal amount land in the ledgers.
    pub fn apply_damage(
        &mut self,
        attacker: Option<ActorId>,
        target: ActorId,
        amount: u32,
    ) -> Result<DamageReport, WorldError> {
        match self.actors.get(&target) {
            None => return Err(WorldError::UnknownActor(target)),
            Some(actor) if !actor.is_alive() => return Err(WorldError::ActorDead(target)),
            Some(_) => {}
        }

        let shares: Vec<(ActorId, u32)> = self
            .damage_rules
            .iter()
            .filter(|rule| rule.source == target)
            .filter(|rule| self.actors.get(&rule.partner).is_some_and(Actor::is_alive))
            .map(|rule| (rule.partner, rule.share_of(amount)))
            .collect();

        let mut remaining = amount;
        let mut forwarded = Vec::with_capacity(shares.len());
        for (partner, share) in shares {
            let share = share.min(remaining);
            if share == 0 {
                continue;
            }
            remaining -= share;
            let (lost, killed) = self.subtract_health(partner, share);
            self.ledgers.entry(partner).or_default().record(LedgerEntry {
                attacker,
                nominal: share,
                applied: lost,
                forwarded: 0,
                forwarded_from: Some(target),
            });
            forwarded.push(ForwardedDamage {
                to: partner,
                amount: lost,
                killed,
            });
        }

        let (applied, killed) = self.subtract_health(target, remaining);
        let report = DamageReport {
            target,
            attacker,
            nominal: amount,
            applied,
            forwarded,
            killed,
        };
        self.ledgers.entry(target).or_default().record(LedgerEntry {
            attacker,
            nominal: amount,
            applied,
            forwarded: report.forwarded_total(),
            forwarded_from: None,
        });
        Ok(report)
    }

    fn subtract_health(&mut self, id: ActorId, amount: u32) -> (u32, bool) {
        let Some(actor) = self.actors.get_mut(&id) else {
            return (0, false);
        };
        if !actor.is_alive() {
            return (0, false);
        }
        let lost = amount.min(actor.health);
        actor.health -= lost;
        (lost, actor.health == 0)
    }

    fn in_radius(&self, kind: ActorKind, origin: Vec2, range: f32) -> Vec<ActorSnapshot> {
        self.actors
            .values()
            .filter(|actor| actor.kind == kind && actor.position.distance(origin) <= range)
            .map(Actor::snapshot)
            .collect()
    }
}

impl WorldQuery for GameWorld {
    fn actor(&self, id: ObjectId) -> Option<ActorSnapshot> {
        self.actors.get(&id).map(Actor::snapshot)
    }

    fn players_in_radius(&self, origin: Vec2, range: f32) -> Vec<ActorSnapshot> {
        self.in_radius(ActorKind::Player, origin, range)
    }

    fn npcs_in_radius(&self, origin: Vec2, range: f32) -> Vec<ActorSnapshot> {
        self.in_radius(ActorKind::Npc, origin, range)
    }
}

#[cfg(test)]
mod tests {
    use realm_engine::Liveness;

    use super::*;

    fn boss(name: &str, max_health: u32) -> ActorSpawn {
        ActorSpawn {
            kind: ActorKind::Npc,
            name: name.to_string(),
            template: Some(name.to_string()),
            faction: "giants".to_string(),
            level: 60,
            position: Vec2::new(0.0, 0.0),
            max_health,
            damage: 50,
            attack_range: 200.0,
            managed: true,
        }
    }

    fn world() -> GameWorld {
        GameWorld::new(Arc::new(ObjectRegistry::new()))
    }

    #[test]
    fn linked_damage_is_split_and_auditable() {
        let mut world = world();
        let a = world.spawn(boss("a", 1000));
        let b = world.spawn(boss("b", 1000));
        world.add_damage_rule(DamageRule::new(a, b, 50));

        let report = world.apply_damage(None, a, 100).expect("damage applies");
        assert_eq!(report.nominal, 100);
        assert_eq!(report.applied, 50);
        assert_eq!(
            report.forwarded,
            vec![ForwardedDamage {
                to: b,
                amount: 50,
                killed: false
            }]
        );
        assert_eq!(world.actor(a).expect("a").health, 950);
        assert_eq!(world.actor(b).expect("b").health, 950);

        let ledger = world.ledger(a).expect("ledger for a");
        assert_eq!(ledger.total_nominal(), 100);
        assert_eq!(ledger.entries()[0].forwarded, 50);
        let partner = world.ledger(b).expect("ledger for b");
        assert_eq!(partner.entries()[0].forwarded_from, Some(a));
    }

    #[test]
    fn dead_partner_stops_forwarding() {
        let mut world = world();
        let a = world.spawn(boss("a", 1000));
        let b = world.spawn(boss("b", 10));
        world.add_damage_rule(DamageRule::new(a, b, 50));

        let report = world.apply_damage(None, a, 100).expect("first hit");
        assert_eq!(report.forwarded[0].amount, 10);
        assert!(report.forwarded[0].killed);

        let report = world.apply_damage(None, a, 100).expect("second hit");
        assert!(report.forwarded.is_empty());
        assert_eq!(report.applied, 100);
    }

    #[test]
    fn forwarded_share_does_not_bounce_back() {
        let mut world = world();
        let a = world.spawn(boss("a", 1000));
        let b = world.spawn(boss("b", 1000));
        world.add_damage_rule(DamageRule::new(a, b, 50));
        world.add_damage_rule(DamageRule::new(b, a, 50));

        world.apply_damage(None, a, 100).expect("hit");
        assert_eq!(world.actor(a).expect("a").health, 950);
        assert_eq!(world.actor(b).expect("b").health, 950);
    }

    #[test]
    fn killing_blow_and_dead_targets() {
        let mut world = world();
        let a = world.spawn(boss("a", 30));
        let report = world.apply_damage(None, a, 100).expect("hit");
        assert!(report.killed);
        assert_eq!(report.applied, 30);
        assert_eq!(
            world.apply_damage(None, a, 1),
            Err(WorldError::ActorDead(a))
        );
        assert_eq!(world.heal(a, 10), Err(WorldError::ActorDead(a)));
    }

    #[test]
    fn despawn_releases_id_and_rules() {
        let mut world = world();
        let a = world.spawn(boss("a", 100));
        let b = world.spawn(boss("b", 100));
        world.add_damage_rule(DamageRule::new(a, b, 25));

        assert!(world.despawn(b).is_some());
        assert!(world.despawn(b).is_none());
        assert!(!world.registry().is_alive(b));
        assert!(world.damage_rules().is_empty());
        assert_eq!(
            world.apply_damage(None, b, 1),
            Err(WorldError::UnknownActor(b))
        );
    }

    #[test]
    fn heal_is_capped_at_max_health() {
        let mut world = world();
        let a = world.spawn(boss("a", 100));
        world.apply_damage(None, a, 30).expect("hit");
        assert_eq!(world.heal(a, 50), Ok(30));
        assert_eq!(world.actor(a).expect("a").health, 100);
    }

    #[test]
    fn radius_queries_filter_by_kind_and_distance() {
        let mut world = world();
        world.spawn(boss("near", 100));
        let player = world.spawn(ActorSpawn::player("p", 10, Vec2::new(50.0, 0.0)));
        world.spawn(ActorSpawn::player("far", 10, Vec2::new(5000.0, 0.0)));

        let players = world.players_in_radius(Vec2::new(0.0, 0.0), 100.0);
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].id, player);
        assert_eq!(world.npcs_in_radius(Vec2::new(0.0, 0.0), 100.0).len(), 1);
    }
}
