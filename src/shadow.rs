use slab::Slab;

use crate::reach::PathId;

/// A stable handle for a live host value.
///
/// Handles are generational: the slot index may be reused after a release,
/// but the generation never repeats, so a stale handle can never alias a
/// newer value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ValueId {
    index: u32,
    generation: u64,
}

/// Out-of-band metadata for one tracked value.
#[derive(Debug)]
pub struct ShadowRecord {
    generation: u64,
    /// Call clock at the moment the value came into existence.
    pub created_at: u64,
    /// The global path this value is known to be reachable from, if any.
    /// First writer wins; see `Reachability` for why one path suffices.
    pub container: Option<PathId>,
}

/// Address-free shadow metadata store.
///
/// This is a weak, non-owning relation: it never keeps a host value alive,
/// and a record is invalidated before its slot can be reused.
#[derive(Debug, Default)]
pub struct ShadowStore {
    slots: Slab<ShadowRecord>,
    next_generation: u64,
}

impl ShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a value born at the given call clock.
    pub fn register(&mut self, created_at: u64) -> ValueId {
        self.next_generation += 1;
        let generation = self.next_generation;
        let index = self.slots.insert(ShadowRecord {
            generation,
            created_at,
            container: None,
        });
        ValueId { index: index as u32, generation }
    }

    /// Invalidates a record. Must happen before the host reuses the value's
    /// storage; stale handles are rejected from then on.
    pub fn release(&mut self, id: ValueId) {
        if self.get(id).is_some() {
            self.slots.remove(id.index as usize);
        }
    }

    pub fn get(&self, id: ValueId) -> Option<&ShadowRecord> {
        self.slots
            .get(id.index as usize)
            .filter(|record| record.generation == id.generation)
    }

    /// The creation clock of a value. Unregistered values are treated as
    /// ancient, so mutation blame falls on every frame.
    pub fn created_at(&self, id: ValueId) -> u64 {
        self.get(id).map_or(0, |record| record.created_at)
    }

    /// The reachability tag of a value, if any.
    pub fn container(&self, id: ValueId) -> Option<PathId> {
        self.get(id).and_then(|record| record.container)
    }

    /// Tags a value as reachable via a global path, unless it already has
    /// a tag.
    pub fn tag(&mut self, id: ValueId, path: PathId) {
        if let Some(record) = self
            .slots
            .get_mut(id.index as usize)
            .filter(|record| record.generation == id.generation)
            && record.container.is_none()
        {
            record.container = Some(path);
        }
    }
}
