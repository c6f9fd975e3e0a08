pub mod abilities;
pub mod aggro;
pub mod brain;
pub mod con;

pub use abilities::{AbilityEffect, AbilitySpec, AbilityTrigger};
pub use aggro::{AggroEntry, AggroError, AggroTable, MAX_AGGRO_DISTANCE, MAX_AGGRO_LIST_DISTANCE};
pub use brain::{Brain, BrainConfig, BrainIntent, BrainState, PendingCast, ThinkOutcome};
pub use con::{aggro_level_to_target, con_steps, is_grey, Con};
