use std::collections::VecDeque;

use realm_engine::ObjectId;

/// Recent entries kept per actor; totals cover every hit.
pub const LEDGER_CAPACITY: usize = 256;

/// While `partner` is alive, `percent` of every hit on `source` lands on
/// `partner` instead. Each actor keeps its own health pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageRule {
    pub source: ObjectId,
    pub partner: ObjectId,
    pub percent: u8,
}

impl DamageRule {
    pub fn new(source: ObjectId, partner: ObjectId, percent: u8) -> Self {
        Self {
            source,
            partner,
            percent: percent.min(100),
        }
    }

    pub fn involves(&self, actor: ObjectId) -> bool {
        self.source == actor || self.partner == actor
    }

    pub fn share_of(&self, nominal: u32) -> u32 {
        ((u64::from(nominal) * u64::from(self.percent)) / 100) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedDamage {
    pub to: ObjectId,
    pub amount: u32,
    pub killed: bool,
}

/// Outcome of one hit. `nominal` is what the attacker dealt; `applied` is
/// what the target's own pool lost after forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamageReport {
    pub target: ObjectId,
    pub attacker: Option<ObjectId>,
    pub nominal: u32,
    pub applied: u32,
    pub forwarded: Vec<ForwardedDamage>,
    pub killed: bool,
}

impl DamageReport {
    pub fn forwarded_total(&self) -> u32 {
        self.forwarded
            .iter()
            .fold(0u32, |total, hit| total.saturating_add(hit.amount))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub attacker: Option<ObjectId>,
    pub nominal: u32,
    pub applied: u32,
    pub forwarded: u32,
    /// Set when this entry is a share forwarded from another actor.
    pub forwarded_from: Option<ObjectId>,
}

/// Audit trail of the hits an actor received: running totals plus the most
/// recent [`LEDGER_CAPACITY`] entries, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DamageLedger {
    entries: VecDeque<LedgerEntry>,
    hits: u64,
    total_nominal: u64,
    total_applied: u64,
}

impl DamageLedger {
    pub fn record(&mut self, entry: LedgerEntry) {
        self.hits = self.hits.saturating_add(1);
        self.total_nominal = self.total_nominal.saturating_add(u64::from(entry.nominal));
        self.total_applied = self.total_applied.saturating_add(u64::from(entry.applied));
        if self.entries.len() == LEDGER_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> &VecDeque<LedgerEntry> {
        &self.entries
    }

    /// Every hit ever recorded, including those rotated out of `entries`.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn total_nominal(&self) -> u64 {
        self.total_nominal
    }

    pub fn total_applied(&self) -> u64 {
        self.total_applied
    }
}

#[cfg(test)]
mod tests {
    use realm_engine::ObjectRegistry;

    use super::*;

    #[test]
    fn share_rounds_down_and_percent_is_clamped() {
        let registry = ObjectRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert_eq!(DamageRule::new(a, b, 50).share_of(101), 50);
        assert_eq!(DamageRule::new(a, b, 250).percent, 100);
    }

    #[test]
    fn ledger_totals_track_entries() {
        let mut ledger = DamageLedger::default();
        ledger.record(LedgerEntry {
            attacker: None,
            nominal: 100,
            applied: 50,
            forwarded: 50,
            forwarded_from: None,
        });
        ledger.record(LedgerEntry {
            attacker: None,
            nominal: 30,
            applied: 30,
            forwarded: 0,
            forwarded_from: None,
        });
        assert_eq!(ledger.total_nominal(), 130);
        assert_eq!(ledger.total_applied(), 80);
        assert_eq!(ledger.entries().len(), 2);
    }

    #[test]
    fn ledger_keeps_recent_entries_and_full_totals() {
        let mut ledger = DamageLedger::default();
        for nominal in 1..=100_000u32 {
            ledger.record(LedgerEntry {
                attacker: None,
                nominal,
                applied: 1,
                forwarded: 0,
                forwarded_from: None,
            });
        }
        assert_eq!(ledger.entries().len(), LEDGER_CAPACITY);
        assert_eq!(ledger.hits(), 100_000);
        assert_eq!(ledger.total_applied(), 100_000);
        assert_eq!(ledger.total_nominal(), 100_000 * 100_001 / 2);
        let oldest = 100_000 - LEDGER_CAPACITY as u32 + 1;
        assert_eq!(ledger.entries().front().map(|entry| entry.nominal), Some(oldest));
        assert_eq!(ledger.entries().back().map(|entry| entry.nominal), Some(100_000));
    }
}
