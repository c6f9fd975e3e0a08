use std::collections::BTreeMap;

use realm_engine::ObjectId;
use thiserror::Error;

/// Targets farther than this are kept on the list but never chosen.
pub const MAX_AGGRO_DISTANCE: f32 = 3600.0;
/// Targets farther than this are dropped from the list.
pub const MAX_AGGRO_LIST_DISTANCE: f32 = 6000.0;
const FULL_WEIGHT_DISTANCE: f32 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggroEntry {
    pub target: ObjectId,
    pub amount: u64,
    pub last_update_ms: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggroError {
    #[error("refusing negative aggro {amount} for target {target}")]
    NegativeAmount { target: ObjectId, amount: i64 },
}

/// Per-NPC aggro scores. Values only grow; entries leave the table through
/// [`AggroTable::retain`], [`AggroTable::remove`] or [`AggroTable::clear`].
#[derive(Debug, Clone, Default)]
pub struct AggroTable {
    entries: BTreeMap<ObjectId, AggroEntry>,
}

impl AggroTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to the target's score and returns the new value. New
    /// entries start at no less than 1 so a zero-damage hit still registers.
    pub fn add(&mut self, target: ObjectId, amount: i64, now_ms: u64) -> Result<u64, AggroError> {
        if amount < 0 {
            return Err(AggroError::NegativeAmount { target, amount });
        }
        let amount = amount as u64;
        let entry = self.entries.entry(target).or_insert(AggroEntry {
            target,
            amount: 0,
            last_update_ms: now_ms,
        });
        entry.amount = entry.amount.saturating_add(amount).max(1);
        entry.last_update_ms = now_ms;
        Ok(entry.amount)
    }

    pub fn get(&self, target: ObjectId) -> Option<u64> {
        self.entries.get(&target).map(|entry| entry.amount)
    }

    pub fn contains(&self, target: ObjectId) -> bool {
        self.entries.contains_key(&target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &AggroEntry> {
        self.entries.values()
    }

    pub fn remove(&mut self, target: ObjectId) -> Option<AggroEntry> {
        self.entries.remove(&target)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Keeps entries for which `keep` holds and returns the pruned targets.
    pub fn retain(&mut self, mut keep: impl FnMut(&AggroEntry) -> bool) -> Vec<ObjectId> {
        let mut pruned = Vec::new();
        self.entries.retain(|target, entry| {
            let kept = keep(entry);
            if !kept {
                pruned.push(*target);
            }
            kept
        });
        pruned
    }

    /// Picks the entry with the highest distance-weighted score.
    ///
    /// `distance_to` returns `None` for targets that cannot be attacked right
    /// now. Targets within 500 units count at full weight, farther ones at
    /// `500 / distance`; targets beyond [`MAX_AGGRO_DISTANCE`] are skipped.
    /// Ties go to the lowest id.
    pub fn select_target(
        &self,
        mut distance_to: impl FnMut(ObjectId) -> Option<f32>,
    ) -> Option<ObjectId> {
        let mut best: Option<(ObjectId, f64)> = None;
        for entry in self.entries.values() {
            let Some(distance) = distance_to(entry.target) else {
                continue;
            };
            if distance > MAX_AGGRO_DISTANCE {
                continue;
            }
            let weight = if distance <= FULL_WEIGHT_DISTANCE {
                1.0
            } else {
                f64::from(FULL_WEIGHT_DISTANCE / distance)
            };
            let score = entry.amount as f64 * weight;
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((entry.target, score));
            }
        }
        best.map(|(target, _)| target)
    }
}

#[cfg(test)]
mod tests {
    use realm_engine::ObjectRegistry;

    use super::*;

    fn ids(count: usize) -> Vec<ObjectId> {
        let registry = ObjectRegistry::new();
        (0..count).map(|_| registry.register()).collect()
    }

    #[test]
    fn adds_accumulate_and_new_entries_start_at_one() {
        let target = ids(1)[0];
        let mut table = AggroTable::new();
        assert_eq!(table.add(target, 0, 10), Ok(1));
        assert_eq!(table.add(target, 40, 20), Ok(41));
        let entry = table.entries().next().expect("entry");
        assert_eq!(entry.last_update_ms, 20);
    }

    #[test]
    fn negative_amount_is_rejected_without_change() {
        let target = ids(1)[0];
        let mut table = AggroTable::new();
        table.add(target, 10, 0).expect("add");
        assert_eq!(
            table.add(target, -5, 1),
            Err(AggroError::NegativeAmount { target, amount: -5 })
        );
        assert_eq!(table.get(target), Some(10));
    }

    #[test]
    fn values_never_decrease_under_non_negative_adds() {
        let targets = ids(4);
        let mut table = AggroTable::new();
        let mut rng = fastrand::Rng::with_seed(7);
        let mut last = vec![0u64; targets.len()];
        for step in 0..500u64 {
            let index = rng.usize(0..targets.len());
            let amount = rng.i64(0..=250);
            let value = table.add(targets[index], amount, step).expect("add");
            assert!(value >= last[index]);
            last[index] = value;
        }
    }

    #[test]
    fn saturates_instead_of_overflowing() {
        let target = ids(1)[0];
        let mut table = AggroTable::new();
        table.add(target, i64::MAX, 0).expect("add");
        table.add(target, i64::MAX, 0).expect("add");
        assert_eq!(table.add(target, i64::MAX, 0), Ok(u64::MAX));
    }

    #[test]
    fn retain_reports_pruned_targets() {
        let targets = ids(3);
        let mut table = AggroTable::new();
        for target in &targets {
            table.add(*target, 5, 0).expect("add");
        }
        let pruned = table.retain(|entry| entry.target != targets[1]);
        assert_eq!(pruned, vec![targets[1]]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn selection_prefers_highest_weighted_score() {
        let targets = ids(3);
        let mut table = AggroTable::new();
        table.add(targets[0], 100, 0).expect("add");
        table.add(targets[1], 150, 0).expect("add");
        table.add(targets[2], 500, 0).expect("add");

        // targets[1] is close, targets[2] is at 2000 units so counts for 125
        let chosen = table.select_target(|target| {
            if target == targets[2] {
                Some(2000.0)
            } else {
                Some(100.0)
            }
        });
        assert_eq!(chosen, Some(targets[1]));
    }

    #[test]
    fn selection_skips_unreachable_and_far_targets_and_breaks_ties_by_id() {
        let targets = ids(3);
        let mut table = AggroTable::new();
        table.add(targets[0], 50, 0).expect("add");
        table.add(targets[1], 50, 0).expect("add");
        table.add(targets[2], 900, 0).expect("add");

        let chosen = table.select_target(|target| {
            if target == targets[2] {
                Some(MAX_AGGRO_DISTANCE + 1.0)
            } else {
                Some(10.0)
            }
        });
        assert_eq!(chosen, Some(targets[0]));
        assert_eq!(table.select_target(|_| None), None);
    }
}
