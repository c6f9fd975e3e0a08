use std::fmt;

use parking_lot::RwLock;

/// Generation-checked handle to a live game object.
///
/// Holding an `ObjectId` never keeps the object alive. Once the slot is
/// released the generation moves on and every stale id fails
/// [`Liveness::is_alive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

pub trait Liveness: Send + Sync {
    fn is_alive(&self, id: ObjectId) -> bool;
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    alive: bool,
}

#[derive(Debug, Default)]
struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Arena of object slots shared by the world and the event bus.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    table: RwLock<SlotTable>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> ObjectId {
        let mut table = self.table.write();
        table.live = table.live.saturating_add(1);
        if let Some(index) = table.free.pop() {
            let slot = &mut table.slots[index as usize];
            slot.alive = true;
            return ObjectId {
                index,
                generation: slot.generation,
            };
        }

        let index = table.slots.len() as u32;
        table.slots.push(Slot {
            generation: 0,
            alive: true,
        });
        ObjectId {
            index,
            generation: 0,
        }
    }

    /// Returns `false` when the id was already stale.
    pub fn release(&self, id: ObjectId) -> bool {
        let mut table = self.table.write();
        let Some(slot) = table.slots.get_mut(id.index as usize) else {
            return false;
        };
        if !slot.alive || slot.generation != id.generation {
            return false;
        }
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        table.free.push(id.index);
        table.live = table.live.saturating_sub(1);
        true
    }

    pub fn live_count(&self) -> usize {
        self.table.read().live
    }
}

impl Liveness for ObjectRegistry {
    fn is_alive(&self, id: ObjectId) -> bool {
        self.table
            .read()
            .slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.alive && slot.generation == id.generation)
    }
}
