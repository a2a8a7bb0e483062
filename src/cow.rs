use rustc_hash::{FxHashMap, FxHashSet};

use crate::shadow::ValueId;
use crate::store::SlotRef;

/// Bookkeeping for one deferred copy.
#[derive(Debug)]
struct Deferral {
    /// Addresses of every mutable value transitively contained in the base
    /// at capture time, the base itself included.
    contained: FxHashSet<ValueId>,
    /// Snapshot slots that still alias the base and must be patched when
    /// the real copy happens.
    slots: Vec<SlotRef>,
}

/// The copy-on-write deferral index.
///
/// An entry here means "this value's real copy has been deferred; if any
/// contained value is about to be mutated, copy now and patch every
/// outstanding reference". The copy cost is paid only when a mutation
/// actually occurs.
#[derive(Debug, Default)]
pub struct Deferrals {
    bases: FxHashMap<ValueId, Deferral>,
    /// Union of every contained set, for a fast negative membership check
    /// on the mutation path.
    members: FxHashSet<ValueId>,
}

impl Deferrals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts deferring copies of `base`.
    ///
    /// `contained` comes from the host traversal and must include `base`.
    /// A base that is already tracked keeps its containment set as captured;
    /// if a mutation had happened in between, the base would have been
    /// resolved and dropped first.
    pub fn track(&mut self, base: ValueId, contained: FxHashSet<ValueId>) {
        if self.bases.contains_key(&base) {
            return;
        }
        self.members.extend(contained.iter().copied());
        self.bases.insert(base, Deferral { contained, slots: Vec::new() });
    }

    /// Registers a snapshot slot that aliases a tracked base. Returns false
    /// if the base is no longer tracked; the slot must then hold a ready
    /// copy instead.
    pub fn attach(&mut self, base: ValueId, slot: SlotRef) -> bool {
        match self.bases.get_mut(&base) {
            Some(deferral) => {
                deferral.slots.push(slot);
                true
            }
            None => false,
        }
    }

    /// Drops a base whose deferral never received a snapshot slot (or lost
    /// them all). No-op while slots are outstanding; those still need the
    /// copy.
    pub fn untrack_unreferenced(&mut self, base: ValueId) {
        if self.bases.get(&base).is_some_and(|deferral| deferral.slots.is_empty()) {
            self.bases.remove(&base);
            self.rebuild_members();
        }
    }

    /// Fast negative check: is this value inside any deferred base?
    pub fn is_traced(&self, value: ValueId) -> bool {
        self.members.contains(&value)
    }

    /// The bases whose deferred copies are invalidated by a mutation of
    /// `value`.
    pub fn affected_bases(&self, value: ValueId) -> Vec<ValueId> {
        if !self.is_traced(value) {
            return Vec::new();
        }
        self.bases
            .iter()
            .filter(|(_, deferral)| deferral.contained.contains(&value))
            .map(|(&base, _)| base)
            .collect()
    }

    /// Drops a base from the index, handing back the slots that must be
    /// patched with the materialized copy.
    pub fn resolve(&mut self, base: ValueId) -> Vec<SlotRef> {
        let Some(deferral) = self.bases.remove(&base) else { return Vec::new() };
        self.rebuild_members();
        deferral.slots
    }

    fn rebuild_members(&mut self) {
        self.members.clear();
        for deferral in self.bases.values() {
            self.members.extend(deferral.contained.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::Arbitrary;

    use super::*;
    use crate::shadow::ShadowStore;
    use crate::store::{NamespaceId, Slot, SlotRef};

    fn slot(position: usize) -> SlotRef {
        SlotRef {
            ns: NamespaceId::test_id(),
            key: 0,
            slot: Slot::Arg(position),
        }
    }

    #[test]
    fn test_mutation_resolves_every_containing_base() {
        let mut shadow = ShadowStore::new();
        let values: Vec<_> = (0..4).map(|i| shadow.register(i)).collect();
        let mut deferrals = Deferrals::new();

        // Two bases share values[2]; a third does not contain it.
        deferrals.track(values[0], [values[0], values[2]].into_iter().collect());
        assert!(deferrals.attach(values[0], slot(0)));
        deferrals.track(values[1], [values[1], values[2]].into_iter().collect());
        assert!(deferrals.attach(values[1], slot(1)));
        deferrals.track(values[3], [values[3]].into_iter().collect());
        assert!(deferrals.attach(values[3], slot(2)));

        assert!(deferrals.is_traced(values[2]));
        let mut affected = deferrals.affected_bases(values[2]);
        affected.sort_by_key(|id| format!("{id:?}"));
        assert_eq!(affected.len(), 2);

        for base in affected {
            assert_eq!(deferrals.resolve(base).len(), 1);
        }
        assert!(!deferrals.is_traced(values[2]));
        assert!(deferrals.is_traced(values[3]));
    }

    #[test]
    fn test_attached_slots_accumulate_until_resolution() {
        let mut shadow = ShadowStore::new();
        let base = shadow.register(0);
        let mut deferrals = Deferrals::new();
        deferrals.track(base, [base].into_iter().collect());
        assert!(deferrals.attach(base, slot(0)));
        assert!(deferrals.attach(base, slot(1)));
        assert_eq!(deferrals.resolve(base).len(), 2);
        assert_eq!(deferrals.resolve(base).len(), 0);
        assert!(!deferrals.attach(base, slot(2)));
    }

    #[test]
    fn test_unreferenced_base_can_be_untracked() {
        let mut shadow = ShadowStore::new();
        let unused = shadow.register(0);
        let referenced = shadow.register(0);
        let mut deferrals = Deferrals::new();

        deferrals.track(unused, [unused].into_iter().collect());
        deferrals.untrack_unreferenced(unused);
        assert!(!deferrals.is_traced(unused));

        // A base with an outstanding slot still owes a copy.
        deferrals.track(referenced, [referenced].into_iter().collect());
        deferrals.attach(referenced, slot(0));
        deferrals.untrack_unreferenced(referenced);
        assert!(deferrals.is_traced(referenced));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Defer { base: u8, contained: Vec<u8> },
        Mutate(u8),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            if bool::arbitrary(g) {
                Self::Defer { base: u8::arbitrary(g) % 16, contained: Vec::arbitrary(g) }
            } else {
                Self::Mutate(u8::arbitrary(g) % 16)
            }
        }
    }

    // The index must agree with a naive model: after any op sequence, a
    // mutation resolves exactly the bases whose captured containment set
    // includes the mutated value, and the membership set is their union.
    #[quickcheck_macros::quickcheck]
    fn test_index_matches_naive_model(ops: Vec<Op>) {
        let mut shadow = ShadowStore::new();
        let values: Vec<_> = (0..16).map(|i| shadow.register(i)).collect();
        let mut deferrals = Deferrals::new();
        let mut model: FxHashMap<ValueId, FxHashSet<ValueId>> = FxHashMap::default();

        for op in ops {
            match op {
                Op::Defer { base, contained } => {
                    let base = values[base as usize];
                    let mut set: FxHashSet<ValueId> = contained
                        .iter()
                        .map(|&i| values[i as usize % 16])
                        .collect();
                    set.insert(base);
                    if !model.contains_key(&base) {
                        model.insert(base, set.clone());
                    }
                    deferrals.track(base, set);
                    deferrals.attach(base, slot(0));
                }
                Op::Mutate(i) => {
                    let value = values[i as usize];
                    let expected: FxHashSet<ValueId> = model
                        .iter()
                        .filter(|(_, set)| set.contains(&value))
                        .map(|(&base, _)| base)
                        .collect();
                    let actual: FxHashSet<ValueId> =
                        deferrals.affected_bases(value).into_iter().collect();
                    assert_eq!(actual, expected);
                    for base in &expected {
                        deferrals.resolve(*base);
                        model.remove(base);
                    }
                }
            }

            let union: FxHashSet<ValueId> =
                model.values().flatten().copied().collect();
            for &v in &values {
                assert_eq!(deferrals.is_traced(v), union.contains(&v));
            }
        }
    }
}
