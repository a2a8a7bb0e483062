use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::canon::CanonValue;

/// An immutable structural snapshot of a callable's compiled form.
///
/// Two fingerprints are equal iff they are structurally equal, recursing
/// into nested callables in the constant pool. Fingerprint trees are owned
/// values built by the host at (re)definition time, so they are acyclic by
/// construction and plain derived equality terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFingerprint {
    /// Qualified name plus defining-file path, the callable's stable
    /// identity across runs.
    pub canonical_name: String,
    pub arg_count: u32,
    pub n_locals: u32,
    pub stack_size: u32,
    pub flags: u32,
    /// The raw instruction stream.
    pub code: Vec<u8>,
    /// Names referenced by the instruction stream.
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
    /// The constant pool, with nested callables fingerprinted in place.
    pub consts: Vec<Const>,
}

/// One slot of a fingerprint's constant pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Const {
    Value(CanonValue),
    Code(Box<CodeFingerprint>),
}

impl CodeFingerprint {
    /// Structural equality, spelled out for call sites that compare
    /// recorded against current fingerprints.
    pub fn matches(&self, other: &CodeFingerprint) -> bool {
        self == other
    }
}

/// The current fingerprint of every callable defined so far this run.
#[derive(Debug, Default)]
pub struct CodeRegistry {
    current: FxHashMap<String, Arc<CodeFingerprint>>,
    epoch: u64,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the fingerprint for a callable.
    ///
    /// Redefinition mid-run (dynamic reloading) bumps the epoch, which
    /// invalidates every record's cached "dependencies satisfied" verdict.
    /// That re-verification is O(all records) on next use, acceptable
    /// because redefinition is rare.
    pub fn register(&mut self, fingerprint: CodeFingerprint) -> Arc<CodeFingerprint> {
        let fingerprint = Arc::new(fingerprint);
        let replaced = self
            .current
            .insert(fingerprint.canonical_name.clone(), fingerprint.clone());
        if replaced.is_none_or(|old| !old.matches(&fingerprint)) {
            self.epoch += 1;
        }
        fingerprint
    }

    /// The up-to-date fingerprint for a canonical name, if the callable
    /// currently exists.
    pub fn get(&self, canonical_name: &str) -> Option<&Arc<CodeFingerprint>> {
        self.current.get(canonical_name)
    }

    /// Monotonic counter of meaningful (re)definitions, for verdict caching.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}
