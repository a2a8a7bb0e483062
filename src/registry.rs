use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::fingerprint::CodeFingerprint;

/// A callable's stable identity: qualified name plus defining-file path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalName {
    pub file: String,
    pub qualified: String,
}

impl CanonicalName {
    pub fn new(file: impl Into<String>, qualified: impl Into<String>) -> Self {
        Self { file: file.into(), qualified: qualified.into() }
    }
}

impl Display for CanonicalName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.qualified)
    }
}

/// An interned callable.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CallableId(u32);

/// Per-callable memoization state for the current run.
///
/// Created lazily on first call and never persisted itself; only its code
/// dependency map and its cache entries reach disk.
#[derive(Debug)]
pub struct CallableRecord {
    pub name: CanonicalName,
    /// Canonical name → fingerprint of everything this callable depends
    /// on, always including a self entry once code is known.
    pub code_deps: FxHashMap<String, Arc<CodeFingerprint>>,
    /// Whether the persisted dependency map was already pulled from disk.
    pub deps_loaded: bool,
    /// First impurity reason of this run, if any. Sticky until the cache
    /// for this callable is invalidated.
    pub impure: Option<&'static str>,
    /// Adaptive flag: repeated fast calls that stored nothing make lookup
    /// overhead a net loss, so skip it.
    pub likely_nothing_to_memoize: bool,
    fast_empty_calls: u8,
    /// The registry epoch at which the code dependencies were last verified
    /// to all still hold. Broken verdicts are never cached; they are rare
    /// and resolve themselves via invalidation.
    pub deps_ok_epoch: Option<u64>,
}

impl CallableRecord {
    fn new(name: CanonicalName) -> Self {
        Self {
            name,
            code_deps: FxHashMap::default(),
            deps_loaded: false,
            impure: None,
            likely_nothing_to_memoize: false,
            fast_empty_calls: 0,
            deps_ok_epoch: None,
        }
    }

    /// Marks this callable impure for the rest of the run. Idempotent; the
    /// first reason wins.
    pub fn mark_impure(&mut self, why: &'static str) -> bool {
        if self.impure.is_none() {
            self.impure = Some(why);
            true
        } else {
            false
        }
    }

    /// Counts a fast call that had nothing to store. Returns true when the
    /// adaptive flag just flipped on.
    pub fn note_fast_empty_call(&mut self, threshold: u8) -> bool {
        if self.likely_nothing_to_memoize {
            return false;
        }
        self.fast_empty_calls = self.fast_empty_calls.saturating_add(1);
        if self.fast_empty_calls >= threshold {
            self.likely_nothing_to_memoize = true;
            return true;
        }
        false
    }

    /// Puts the record back into its pristine pure state after its cache
    /// was invalidated, keeping only a fresh self code dependency.
    pub fn reset(&mut self, self_fingerprint: Option<Arc<CodeFingerprint>>) {
        self.code_deps.clear();
        if let Some(fingerprint) = self_fingerprint {
            self.code_deps
                .insert(fingerprint.canonical_name.clone(), fingerprint);
        }
        self.deps_loaded = true;
        self.impure = None;
        self.likely_nothing_to_memoize = false;
        self.fast_empty_calls = 0;
        self.deps_ok_epoch = None;
    }
}

/// All callable records created so far this run.
#[derive(Debug, Default)]
pub struct Callables {
    records: Vec<CallableRecord>,
    index: FxHashMap<CanonicalName, CallableId>,
}

impl Callables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up or lazily creates the record for a canonical name.
    pub fn intern(&mut self, name: &CanonicalName) -> CallableId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = CallableId(self.records.len() as u32);
        self.records.push(CallableRecord::new(name.clone()));
        self.index.insert(name.clone(), id);
        id
    }

    pub fn lookup(&self, name: &CanonicalName) -> Option<CallableId> {
        self.index.get(name).copied()
    }

    pub fn get(&self, id: CallableId) -> &CallableRecord {
        &self.records[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: CallableId) -> &mut CallableRecord {
        &mut self.records[id.0 as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallableRecord> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_impurity_reason_wins() {
        let mut callables = Callables::new();
        let id = callables.intern(&CanonicalName::new("f.py", "f"));
        assert!(callables.get_mut(id).mark_impure("mutate global"));
        assert!(!callables.get_mut(id).mark_impure("mutate non-local value"));
        assert_eq!(callables.get(id).impure, Some("mutate global"));
    }

    #[test]
    fn test_adaptive_flag_flips_at_threshold_and_resets() {
        let mut callables = Callables::new();
        let id = callables.intern(&CanonicalName::new("f.py", "f"));
        let record = callables.get_mut(id);
        for _ in 0..7 {
            assert!(!record.note_fast_empty_call(8));
        }
        assert!(record.note_fast_empty_call(8));
        assert!(record.likely_nothing_to_memoize);
        record.reset(None);
        assert!(!record.likely_nothing_to_memoize);
    }
}
