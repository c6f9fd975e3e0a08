use std::collections::HashMap;
use std::fmt;

use realm_engine::{Record, StoreError, WorkerError};
use thiserror::Error;

use crate::world::ActorId;

mod book;
mod kill;

pub use book::{CompletedTask, TaskBook, TASKS_KIND};
pub use kill::KillTask;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no task factory registered for kind '{kind}'")]
    UnknownKind { kind: String },
    #[error("task kind '{kind}' is already registered")]
    DuplicateKind { kind: String },
    #[error("task record {kind}/{key} is malformed: {reason}")]
    Malformed {
        kind: String,
        key: String,
        reason: String,
    },
    #[error("player {player} has no task list in this region")]
    UnknownPlayer { player: ActorId },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProgress {
    pub current: u32,
    pub required: u32,
}

impl TaskProgress {
    pub fn is_complete(self) -> bool {
        self.current >= self.required
    }
}

impl fmt::Display for TaskProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current, self.required)
    }
}

/// Persistent per-player objective that advances on game events.
pub trait PlayerTask: Send + fmt::Debug {
    /// Registry key used to rebuild the task from its record.
    fn kind(&self) -> &'static str;
    fn key(&self) -> &str;
    /// Persistent name of the owning player.
    fn player(&self) -> &str;
    /// Returns true when the kill counted toward this task.
    fn on_enemy_killed(&mut self, victim_template: Option<&str>) -> bool;
    fn progress(&self) -> TaskProgress;
    fn describe(&self) -> String;
    fn to_record(&self) -> Result<Record, TaskError>;

    fn is_complete(&self) -> bool {
        self.progress().is_complete()
    }
}

pub type TaskFactory = fn(&Record) -> Result<Box<dyn PlayerTask>, TaskError>;

/// Maps stable kind strings to the factory that rebuilds a saved task.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(KillTask::KIND.to_string(), KillTask::restore);
        registry
    }

    pub fn register(&mut self, kind: &str, factory: TaskFactory) -> Result<(), TaskError> {
        if self.factories.contains_key(kind) {
            return Err(TaskError::DuplicateKind {
                kind: kind.to_string(),
            });
        }
        self.factories.insert(kind.to_string(), factory);
        Ok(())
    }

    pub fn restore(&self, record: &Record) -> Result<Box<dyn PlayerTask>, TaskError> {
        let factory = self
            .factories
            .get(&record.kind)
            .ok_or_else(|| TaskError::UnknownKind {
                kind: record.kind.clone(),
            })?;
        factory(record)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn always_fails(record: &Record) -> Result<Box<dyn PlayerTask>, TaskError> {
        Err(TaskError::Malformed {
            kind: record.kind.clone(),
            key: record.key.clone(),
            reason: "test factory".to_string(),
        })
    }

    #[test]
    fn builtin_registry_restores_kill_tasks() {
        let registry = TaskRegistry::with_builtin();
        let task = KillTask::new("alice", "whelp", 3);
        let record = task.to_record().expect("record");
        let restored = registry.restore(&record).expect("restore");
        assert_eq!(restored.kind(), KillTask::KIND);
        assert_eq!(restored.player(), "alice");
        assert_eq!(restored.progress(), TaskProgress { current: 0, required: 3 });
    }

    #[test]
    fn unknown_and_duplicate_kinds_are_errors() {
        let mut registry = TaskRegistry::with_builtin();
        let record = Record::new("escort_task", "x", json!({}));
        assert!(matches!(
            registry.restore(&record),
            Err(TaskError::UnknownKind { kind }) if kind == "escort_task"
        ));
        assert!(matches!(
            registry.register(KillTask::KIND, always_fails),
            Err(TaskError::DuplicateKind { .. })
        ));
        registry.register("escort_task", always_fails).expect("register");
        assert!(matches!(
            registry.restore(&record),
            Err(TaskError::Malformed { .. })
        ));
        assert_eq!(registry.kinds().count(), 2);
    }
}
