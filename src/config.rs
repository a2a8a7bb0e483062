use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs consumed by the engine.
///
/// How a `Config` gets populated (config file, CLI flags) is the embedder's
/// business; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the on-disk cache.
    pub cache_dir: PathBuf,
    /// Results of invocations that ran for less than this are never cached.
    pub min_runtime_ms: u64,
    /// When set, a broken code dependency is logged but the cached result
    /// is used anyway instead of being invalidated.
    pub trust_prev_results: bool,
    /// Path prefixes whose callables and globals are excluded from all
    /// tracking (library code with internal caches, mostly).
    pub ignore_prefixes: Vec<String>,
    /// Callable names that mark the entire stack impure when invoked.
    pub impure_names: Vec<String>,
    /// Foreign method names known to mutate their receiver.
    pub self_mutators: Vec<String>,
    /// How many fast calls that stored nothing it takes before a callable
    /// is flagged as likely having nothing to memoize.
    pub fast_call_threshold: u8,
}

impl Config {
    /// The minimum runtime as a [`Duration`].
    pub fn min_runtime(&self) -> Duration {
        Duration::from_millis(self.min_runtime_ms)
    }

    /// Whether a defining-file path falls under an ignored prefix.
    pub fn is_ignored_file(&self, file: &str) -> bool {
        self.ignore_prefixes.iter().any(|p| file.starts_with(p.as_str()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("rememo-cache"),
            min_runtime_ms: 1000,
            trust_prev_results: false,
            ignore_prefixes: Vec::new(),
            impure_names: ["input", "raw_input", "draw"]
                .map(String::from)
                .into(),
            self_mutators: [
                "append", "insert", "extend", "pop", "remove", "reverse",
                "sort", "popitem", "update", "clear",
                "intersection_update", "difference_update",
                "symmetric_difference_update", "add", "discard", "resize",
            ]
            .map(String::from)
            .into(),
            fast_call_threshold: 8,
        }
    }
}
