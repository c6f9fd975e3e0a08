use serde::{Deserialize, Serialize};

use crate::events::ObjectId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Vec2) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn offset(self, dx: f32, dy: f32) -> Vec2 {
        Vec2 {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorKind {
    Player,
    Npc,
}

/// Read-only copy of an actor taken at query time.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorSnapshot {
    pub id: ObjectId,
    pub kind: ActorKind,
    pub name: String,
    pub faction: String,
    pub level: u8,
    pub position: Vec2,
    pub health: u32,
    pub max_health: u32,
    pub alive: bool,
}

impl ActorSnapshot {
    pub fn health_percent(&self) -> u8 {
        if self.max_health == 0 {
            return 0;
        }
        ((u64::from(self.health) * 100) / u64::from(self.max_health)).min(100) as u8
    }
}

/// Spatial lookups consumed once per think. Results may be one tick stale.
pub trait WorldQuery {
    fn actor(&self, id: ObjectId) -> Option<ActorSnapshot>;
    fn players_in_radius(&self, origin: Vec2, range: f32) -> Vec<ActorSnapshot>;
    fn npcs_in_radius(&self, origin: Vec2, range: f32) -> Vec<ActorSnapshot>;
}
