pub mod ai;
pub mod app;
pub mod encounter;
pub mod events;
pub mod region_state;
pub mod tasks;
pub mod templates;
pub mod world;

pub use region_state::{RegionServices, RegionState};
