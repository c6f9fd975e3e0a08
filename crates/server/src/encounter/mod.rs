use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use realm_engine::{Subject, SubscriptionId, TimerError, TimerHandle};
use thiserror::Error;

use crate::world::{ActorId, DamageRule};

pub mod definition;
mod lifecycle;

pub use definition::{
    Arena, CrowdLimit, DamageLink, EncounterCatalog, EncounterDefinition, EncounterLoadError,
    SpawnCount, SpawnGroup,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncounterPhase {
    NotStarted,
    Staging,
    Active,
    Complete,
}

impl EncounterPhase {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Staging | Self::Active)
    }
}

impl fmt::Display for EncounterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Staging => "staging",
            Self::Active => "active",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncounterOutcome {
    Victory,
    TimedOut,
    Aborted,
}

impl fmt::Display for EncounterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Victory => "victory",
            Self::TimedOut => "timed_out",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncounterError {
    #[error("unknown encounter '{key}'")]
    UnknownEncounter { key: String },
    #[error("encounter '{key}' is already in progress ({phase})")]
    AlreadyInProgress { key: String, phase: EncounterPhase },
    #[error("encounter '{key}' is not staging ({phase})")]
    NotStaging { key: String, phase: EncounterPhase },
    #[error("failed to schedule encounter '{key}': {source}")]
    Schedule {
        key: String,
        #[source]
        source: TimerError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncounterState {
    pub phase: EncounterPhase,
    pub spawned: BTreeSet<ActorId>,
    pub start_ms: Option<u64>,
    /// Absolute tick at which an active run is forced to complete.
    pub timeout_ms: Option<u64>,
}

impl Default for EncounterState {
    fn default() -> Self {
        Self {
            phase: EncounterPhase::NotStarted,
            spawned: BTreeSet::new(),
            start_ms: None,
            timeout_ms: None,
        }
    }
}

/// Everything a finished run installed, handed back once for cleanup.
#[derive(Debug, Default)]
pub struct Teardown {
    pub spawned: BTreeSet<ActorId>,
    pub timers: Vec<TimerHandle>,
    pub subscriptions: Vec<(Subject, SubscriptionId)>,
    pub rules: Vec<DamageRule>,
}

/// Lifecycle bookkeeping for one scripted encounter. Holds actor ids only;
/// the region world owns the actors and their brains.
#[derive(Debug)]
pub struct EncounterOrchestrator {
    definition: EncounterDefinition,
    state: EncounterState,
    roles: BTreeMap<String, Vec<ActorId>>,
    bosses_alive: BTreeSet<ActorId>,
    timers: Vec<TimerHandle>,
    subscriptions: Vec<(Subject, SubscriptionId)>,
    rules: Vec<DamageRule>,
    last_outcome: Option<EncounterOutcome>,
    runs: u32,
}

impl EncounterOrchestrator {
    pub fn new(definition: EncounterDefinition) -> Self {
        Self {
            definition,
            state: EncounterState::default(),
            roles: BTreeMap::new(),
            bosses_alive: BTreeSet::new(),
            timers: Vec::new(),
            subscriptions: Vec::new(),
            rules: Vec::new(),
            last_outcome: None,
            runs: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.definition.key
    }

    pub fn definition(&self) -> &EncounterDefinition {
        &self.definition
    }

    pub fn state(&self) -> &EncounterState {
        &self.state
    }

    pub fn phase(&self) -> EncounterPhase {
        self.state.phase
    }

    pub fn spawned_count(&self) -> usize {
        self.state.spawned.len()
    }

    pub fn bosses_alive(&self) -> usize {
        self.bosses_alive.len()
    }

    pub fn last_outcome(&self) -> Option<EncounterOutcome> {
        self.last_outcome
    }

    /// Number of runs that reached staging.
    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn role_members(&self, role: &str) -> &[ActorId] {
        self.roles.get(role).map_or(&[], Vec::as_slice)
    }

    pub fn is_tracked(&self, actor: ActorId) -> bool {
        self.state.spawned.contains(&actor)
    }

    /// Moves to staging. Rejected while a run is staging or active.
    pub fn begin(&mut self, now_ms: u64) -> Result<(), EncounterError> {
        if self.state.phase.is_running() {
            return Err(EncounterError::AlreadyInProgress {
                key: self.definition.key.clone(),
                phase: self.state.phase,
            });
        }
        self.state = EncounterState {
            phase: EncounterPhase::Staging,
            spawned: BTreeSet::new(),
            start_ms: Some(now_ms),
            timeout_ms: None,
        };
        self.roles.clear();
        self.bosses_alive.clear();
        self.last_outcome = None;
        self.runs = self.runs.saturating_add(1);
        Ok(())
    }

    pub fn activate(&mut self, now_ms: u64) -> Result<u64, EncounterError> {
        if self.state.phase != EncounterPhase::Staging {
            return Err(EncounterError::NotStaging {
                key: self.definition.key.clone(),
                phase: self.state.phase,
            });
        }
        let timeout_ms = now_ms.saturating_add(self.definition.timeout_ms);
        self.state.phase = EncounterPhase::Active;
        self.state.timeout_ms = Some(timeout_ms);
        Ok(timeout_ms)
    }

    pub fn track_spawn(&mut self, actor: ActorId, role: &str, boss: bool) {
        self.state.spawned.insert(actor);
        self.roles.entry(role.to_string()).or_default().push(actor);
        if boss {
            self.bosses_alive.insert(actor);
        }
    }

    pub fn track_timer(&mut self, handle: TimerHandle) {
        self.timers.push(handle);
    }

    pub fn track_subscription(&mut self, subject: Subject, id: SubscriptionId) {
        self.subscriptions.push((subject, id));
    }

    pub fn track_rule(&mut self, rule: DamageRule) {
        self.rules.push(rule);
    }

    /// Returns true when the last living boss just died.
    pub fn on_boss_dying(&mut self, boss: ActorId) -> bool {
        self.state.phase == EncounterPhase::Active
            && self.bosses_alive.remove(&boss)
            && self.bosses_alive.is_empty()
    }

    /// Ends the current run. Only the first call per run returns the
    /// teardown; later calls return `None`.
    pub fn finish(&mut self, outcome: EncounterOutcome) -> Option<Teardown> {
        if !self.state.phase.is_running() {
            return None;
        }
        self.state.phase = EncounterPhase::Complete;
        self.state.timeout_ms = None;
        self.last_outcome = Some(outcome);
        self.roles.clear();
        self.bosses_alive.clear();
        Some(Teardown {
            spawned: std::mem::take(&mut self.state.spawned),
            timers: std::mem::take(&mut self.timers),
            subscriptions: std::mem::take(&mut self.subscriptions),
            rules: std::mem::take(&mut self.rules),
        })
    }
}
