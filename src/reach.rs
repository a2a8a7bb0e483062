use std::fmt::{self, Display, Formatter};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::shadow::{ShadowStore, ValueId};

/// A named path from long-lived global state to a value.
///
/// The first component is always the defining file; the rest are the name
/// components inside that module's namespace, e.g. `("foo.py", ["cfg",
/// "limits"])` for `cfg.limits` defined in `foo.py`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalPath {
    pub file: String,
    pub parts: Vec<String>,
}

impl GlobalPath {
    pub fn new(file: impl Into<String>, parts: &[&str]) -> Self {
        Self {
            file: file.into(),
            parts: parts.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Display for GlobalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.parts.join("."))
    }
}

/// An interned global path.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PathId(u32);

impl PathId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Answers "is this value known to be reachable from global state, and if
/// so, via which named path?".
///
/// Only one path per value is ever tracked. If a value is aliased through a
/// second global path, a mutation through either alias is still observable
/// as a change to the first, so a single dependency suffices.
#[derive(Debug, Default)]
pub struct Reachability {
    paths: Vec<GlobalPath>,
    ignored: Vec<bool>,
    index: FxHashMap<GlobalPath, PathId>,
}

impl Reachability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a path. `ignored` paths (library-internal state) are still
    /// tagged onto values so that mutation events can recognize them, but
    /// they never trigger impurity or global-dependency recording.
    pub fn intern(&mut self, path: &GlobalPath, ignored: bool) -> PathId {
        if let Some(&id) = self.index.get(path) {
            return id;
        }
        let id = PathId(self.paths.len() as u32);
        self.paths.push(path.clone());
        self.ignored.push(ignored);
        self.index.insert(path.clone(), id);
        id
    }

    pub fn path(&self, id: PathId) -> &GlobalPath {
        &self.paths[id.0 as usize]
    }

    pub fn is_ignored(&self, id: PathId) -> bool {
        self.ignored[id.0 as usize]
    }

    /// Extends reachability from a container to a value read out of it.
    pub fn propagate(shadow: &mut ShadowStore, parent: ValueId, child: ValueId) {
        if let Some(tag) = shadow.container(parent) {
            shadow.tag(child, tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_idempotent() {
        let mut reach = Reachability::new();
        let p = GlobalPath::new("foo.py", &["cfg", "limits"]);
        let a = reach.intern(&p, false);
        let b = reach.intern(&p, false);
        assert_eq!(a, b);
        assert_eq!(reach.path(a).to_string(), "foo.py:cfg.limits");
        assert!(!reach.is_ignored(a));
    }

    #[test]
    fn test_propagation_extends_tags_but_never_replaces() {
        let mut reach = Reachability::new();
        let mut shadow = ShadowStore::new();
        let lib = reach.intern(&GlobalPath::new("re.py", &["_cache"]), true);
        let usr = reach.intern(&GlobalPath::new("foo.py", &["table"]), false);

        let parent = shadow.register(1);
        let child = shadow.register(2);
        shadow.tag(parent, usr);
        Reachability::propagate(&mut shadow, parent, child);
        assert_eq!(shadow.container(child), Some(usr));

        // An aliasing read through a library container must not re-tag.
        let lib_parent = shadow.register(3);
        shadow.tag(lib_parent, lib);
        Reachability::propagate(&mut shadow, lib_parent, child);
        assert_eq!(shadow.container(child), Some(usr));
    }
}
