use realm_engine::Record;
use serde::{Deserialize, Serialize};

use super::{PlayerTask, TaskError, TaskProgress};

/// Kill `required` NPCs spawned from `template`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillTask {
    pub player: String,
    pub template: String,
    pub required: u32,
    #[serde(default)]
    pub progress: u32,
    #[serde(skip)]
    key: String,
}

impl KillTask {
    pub const KIND: &'static str = "kill_task";

    pub fn new(player: impl Into<String>, template: impl Into<String>, required: u32) -> Self {
        let player = player.into();
        let template = template.into();
        let key = format!("{player}-{template}");
        Self {
            player,
            template,
            required: required.max(1),
            progress: 0,
            key,
        }
    }

    pub fn restore(record: &Record) -> Result<Box<dyn PlayerTask>, TaskError> {
        let mut task: KillTask =
            serde_json::from_value(record.data.clone()).map_err(|err| TaskError::Malformed {
                kind: record.kind.clone(),
                key: record.key.clone(),
                reason: err.to_string(),
            })?;
        task.key = record.key.clone();
        Ok(Box::new(task))
    }
}

impl PlayerTask for KillTask {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn player(&self) -> &str {
        &self.player
    }

    fn on_enemy_killed(&mut self, victim_template: Option<&str>) -> bool {
        if self.is_complete() || victim_template != Some(self.template.as_str()) {
            return false;
        }
        self.progress = self.progress.saturating_add(1);
        true
    }

    fn progress(&self) -> TaskProgress {
        TaskProgress {
            current: self.progress.min(self.required),
            required: self.required,
        }
    }

    fn describe(&self) -> String {
        format!("Slay {} {}", self.required, self.template)
    }

    fn to_record(&self) -> Result<Record, TaskError> {
        let data = serde_json::to_value(self).map_err(|err| TaskError::Malformed {
            kind: Self::KIND.to_string(),
            key: self.key.clone(),
            reason: err.to_string(),
        })?;
        Ok(Record::new(Self::KIND, self.key.clone(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_only_matching_templates_until_complete() {
        let mut task = KillTask::new("alice", "whelp", 2);
        assert!(!task.on_enemy_killed(Some("dragon")));
        assert!(!task.on_enemy_killed(None));
        assert!(task.on_enemy_killed(Some("whelp")));
        assert!(!task.is_complete());
        assert!(task.on_enemy_killed(Some("whelp")));
        assert!(task.is_complete());
        assert!(!task.on_enemy_killed(Some("whelp")));
        assert_eq!(task.progress().to_string(), "2/2");
    }

    #[test]
    fn malformed_record_reports_kind_and_key() {
        let record = Record::new(KillTask::KIND, "bob-whelp", serde_json::json!({ "player": 5 }));
        let err = KillTask::restore(&record).expect_err("malformed");
        assert!(err.to_string().contains("kill_task/bob-whelp"));
    }
}
