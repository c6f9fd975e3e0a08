use realm_engine::{EventBus, Subject};

use crate::encounter::EncounterOutcome;
use crate::world::ActorId;

pub const TAKE_DAMAGE: Subject = Subject::new("TakeDamage");
pub const DYING: Subject = Subject::new("Dying");
pub const ENEMY_KILLED: Subject = Subject::new("EnemyKilled");
pub const ENEMY_HEALED: Subject = Subject::new("EnemyHealed");
pub const PLAYER_ENTERED: Subject = Subject::new("PlayerEntered");
pub const PLAYER_LEFT: Subject = Subject::new("PlayerLeft");
pub const ENCOUNTER_COMPLETED: Subject = Subject::new("EncounterCompleted");

/// Payload carried by every game notification. The sender is passed
/// separately on the notification itself.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// Sent by the victim.
    TakeDamage {
        attacker: Option<ActorId>,
        amount: u32,
    },
    /// Sent by the victim.
    Dying { killer: Option<ActorId> },
    /// Sent by the killer.
    EnemyKilled {
        victim: ActorId,
        template: Option<String>,
    },
    /// Sent by the healer.
    EnemyHealed { target: ActorId, amount: u32 },
    PlayerEntered { player: ActorId },
    PlayerLeft { player: ActorId },
    EncounterCompleted {
        key: String,
        outcome: EncounterOutcome,
    },
}

pub type GameEventBus = EventBus<GameEvent>;
