use std::collections::HashMap;

use realm_engine::{Record, StoreError, StoreQueue};
use tracing::{debug, info, warn};

use crate::world::ActorId;

use super::{PlayerTask, TaskError, TaskRegistry};

/// Store kind of the per-player task bundle, keyed by player name.
pub const TASKS_KIND: &str = "player_tasks";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTask {
    pub player: ActorId,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestoreStatus {
    /// Load queued; saves wait until it lands so they cannot clobber it.
    Pending,
    Ready,
    /// The saved bundle could not be read; nothing is written over it.
    Unavailable,
}

struct PlayerTasks {
    name: String,
    status: RestoreStatus,
    tasks: Vec<Box<dyn PlayerTask>>,
}

/// Active tasks of the players currently in one region. All store traffic
/// goes through a [`StoreQueue`], so nothing here waits on I/O.
pub struct TaskBook {
    registry: TaskRegistry,
    store: StoreQueue,
    players: HashMap<ActorId, PlayerTasks>,
}

impl TaskBook {
    pub fn new(registry: TaskRegistry, store: StoreQueue) -> Self {
        Self {
            registry,
            store,
            players: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Queues a load of the bundle saved under `player_name`. `reply` runs on
    /// the store side and must hand the result to [`TaskBook::finish_restore`]
    /// on the owning region.
    pub fn begin_restore(
        &mut self,
        player: ActorId,
        player_name: &str,
        reply: impl FnOnce(Result<Option<Record>, StoreError>) + Send + 'static,
    ) -> Result<(), TaskError> {
        self.players.insert(
            player,
            PlayerTasks {
                name: player_name.to_string(),
                status: RestoreStatus::Pending,
                tasks: Vec::new(),
            },
        );
        if let Err(err) = self.store.load(TASKS_KIND, player_name, reply) {
            self.mark_unavailable(player);
            return Err(err.into());
        }
        Ok(())
    }

    /// Merges a loaded bundle into the player's list. Tasks assigned while
    /// the load was in flight are kept unless the bundle holds the same task
    /// with at least as much progress.
    pub fn finish_restore(
        &mut self,
        player: ActorId,
        loaded: Result<Option<Record>, StoreError>,
    ) -> Result<usize, TaskError> {
        let Some(entry) = self.players.get_mut(&player) else {
            debug!(player = %player, "task_restore_stale");
            return Ok(0);
        };
        if entry.status != RestoreStatus::Pending {
            return Ok(0);
        }
        let restored = match loaded
            .map_err(TaskError::from)
            .and_then(|record| decode_bundle(&self.registry, &entry.name, record))
        {
            Ok(restored) => restored,
            Err(err) => {
                entry.status = RestoreStatus::Unavailable;
                return Err(err);
            }
        };

        let count = restored.len();
        for task in restored {
            match entry.tasks.iter().position(|held| held.key() == task.key()) {
                Some(index) => {
                    if task.progress().current >= entry.tasks[index].progress().current {
                        entry.tasks[index] = task;
                    }
                }
                None => entry.tasks.push(task),
            }
        }
        entry.status = RestoreStatus::Ready;
        info!(player = %player, player_name = %entry.name, tasks = count, "tasks_restored");
        self.persist(player)?;
        Ok(count)
    }

    pub fn is_restoring(&self, player: ActorId) -> bool {
        self.players
            .get(&player)
            .is_some_and(|entry| entry.status == RestoreStatus::Pending)
    }

    /// Gives a new task to a player. A task with the same key already held
    /// is left alone.
    pub fn assign(&mut self, player: ActorId, task: Box<dyn PlayerTask>) -> Result<(), TaskError> {
        let entry = self
            .players
            .get_mut(&player)
            .ok_or(TaskError::UnknownPlayer { player })?;
        if entry.tasks.iter().any(|held| held.key() == task.key()) {
            debug!(player = %player, key = task.key(), "task_already_held");
            return Ok(());
        }
        entry.tasks.push(task);
        self.persist(player)?;
        Ok(())
    }

    pub fn tasks_for(&self, player: ActorId) -> &[Box<dyn PlayerTask>] {
        self.players
            .get(&player)
            .map_or(&[], |entry| entry.tasks.as_slice())
    }

    /// Counts a kill for every matching task. Finished tasks are dropped and
    /// returned; the player's bundle is saved when anything advanced.
    pub fn record_kill(
        &mut self,
        player: ActorId,
        victim_template: Option<&str>,
    ) -> Vec<CompletedTask> {
        let Some(entry) = self.players.get_mut(&player) else {
            return Vec::new();
        };
        let mut advanced = false;
        let mut completed = Vec::new();
        entry.tasks.retain_mut(|task| {
            if !task.on_enemy_killed(victim_template) {
                return true;
            }
            advanced = true;
            if task.is_complete() {
                completed.push(CompletedTask {
                    player,
                    description: task.describe(),
                });
                return false;
            }
            true
        });
        if advanced {
            if let Err(err) = self.persist(player) {
                warn!(player = %player, error = %err, "task_save_failed");
            }
        }
        completed
    }

    /// Queues a save of the player's bundle, or its deletion once empty.
    /// Returns how many tasks were written.
    pub fn persist(&self, player: ActorId) -> Result<usize, TaskError> {
        let Some(entry) = self.players.get(&player) else {
            return Ok(0);
        };
        match entry.status {
            RestoreStatus::Ready => {}
            RestoreStatus::Pending => return Ok(0),
            RestoreStatus::Unavailable => {
                warn!(player = %player, player_name = %entry.name, "task_save_skipped");
                return Ok(0);
            }
        }
        let record = encode_bundle(&entry.name, &entry.tasks)?;
        if entry.tasks.is_empty() {
            self.store.delete(record)?;
        } else {
            self.store.save(record)?;
        }
        Ok(entry.tasks.len())
    }

    /// Saves and forgets a player's tasks.
    pub fn remove_player(&mut self, player: ActorId) -> Result<usize, TaskError> {
        let saved = self.persist(player);
        self.players.remove(&player);
        saved
    }

    pub fn save_all(&self) -> usize {
        let mut saved = 0usize;
        for player in self.players.keys() {
            match self.persist(*player) {
                Ok(count) => saved += count,
                Err(err) => warn!(player = %player, error = %err, "task_save_failed"),
            }
        }
        saved
    }

    fn mark_unavailable(&mut self, player: ActorId) {
        if let Some(entry) = self.players.get_mut(&player) {
            entry.status = RestoreStatus::Unavailable;
        }
    }
}

fn encode_bundle(player_name: &str, tasks: &[Box<dyn PlayerTask>]) -> Result<Record, TaskError> {
    let records = tasks
        .iter()
        .map(|task| task.to_record())
        .collect::<Result<Vec<_>, _>>()?;
    let data = serde_json::to_value(&records).map_err(|err| TaskError::Malformed {
        kind: TASKS_KIND.to_string(),
        key: player_name.to_string(),
        reason: err.to_string(),
    })?;
    Ok(Record::new(TASKS_KIND, player_name, data))
}

// Entries that fail to rebuild are logged and dropped; a bundle that is not
// a list of records fails as a whole.
fn decode_bundle(
    registry: &TaskRegistry,
    player_name: &str,
    record: Option<Record>,
) -> Result<Vec<Box<dyn PlayerTask>>, TaskError> {
    let Some(record) = record else {
        return Ok(Vec::new());
    };
    let entries: Vec<Record> =
        serde_json::from_value(record.data).map_err(|err| TaskError::Malformed {
            kind: TASKS_KIND.to_string(),
            key: player_name.to_string(),
            reason: err.to_string(),
        })?;
    let mut tasks = Vec::with_capacity(entries.len());
    for entry in entries {
        match registry.restore(&entry) {
            Ok(task) if task.player() == player_name => tasks.push(task),
            Ok(task) => warn!(
                player_name,
                owner = task.player(),
                key = task.key(),
                "task_owner_mismatch"
            ),
            Err(err) => warn!(
                kind = %entry.kind,
                key = %entry.key,
                error = %err,
                "task_restore_failed"
            ),
        }
    }
    Ok(tasks)
}
