use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::canon::{CanonValue, Snapshot};
use crate::error::{StoreError, fatal};
use crate::fingerprint::CodeFingerprint;
use crate::hash::{hash, hex_digest};
use crate::host::Host;
use crate::reach::GlobalPath;
use crate::registry::CanonicalName;

const ENTRY_SUFFIX: &str = ".entries";
const DEPS_FILE: &str = "deps.bin";

/// An interned cache namespace, one per callable.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct NamespaceId(u32);

#[cfg(test)]
impl NamespaceId {
    pub(crate) fn test_id() -> Self {
        Self(0)
    }
}

/// One memoized invocation: everything needed to replay it and everything
/// that must still hold for the replay to be valid.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub args: Vec<Snapshot>,
    pub retval: Snapshot,
    /// Global paths read during the invocation and their values at capture.
    pub globals: Vec<(GlobalPath, CanonValue)>,
    /// Files read, with modification times at capture.
    pub files_read: Vec<(PathBuf, i64)>,
    /// Files written (self-contained writes only), with modification times
    /// after the invocation.
    pub files_written: Vec<(PathBuf, i64)>,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
    pub runtime_ms: u64,
}

/// The serialized form of a [`CacheEntry`], with every snapshot forced.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    args: Vec<CanonValue>,
    retval: CanonValue,
    globals: Vec<(GlobalPath, CanonValue)>,
    files_read: Vec<(PathBuf, i64)>,
    files_written: Vec<(PathBuf, i64)>,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    runtime_ms: u64,
}

impl CacheEntry {
    /// Materializes every deferred snapshot into a transient on-disk form.
    /// The in-memory entry keeps its deferrals; the deferral manager still
    /// owes it a copy if the underlying value is ever mutated.
    fn persisted(&self, host: &dyn Host) -> Option<PersistedEntry> {
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            args.push(Arc::unwrap_or_clone(arg.current(host).ok()?));
        }
        let retval = Arc::unwrap_or_clone(self.retval.current(host).ok()?);
        Some(PersistedEntry {
            args,
            retval,
            globals: self.globals.clone(),
            files_read: self.files_read.clone(),
            files_written: self.files_written.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            runtime_ms: self.runtime_ms,
        })
    }

    fn from_persisted(persisted: PersistedEntry) -> Self {
        Self {
            args: persisted.args.into_iter().map(|v| Snapshot::Ready(Arc::new(v))).collect(),
            retval: Snapshot::Ready(Arc::new(persisted.retval)),
            globals: persisted.globals,
            files_read: persisted.files_read,
            files_written: persisted.files_written,
            stdout: persisted.stdout,
            stderr: persisted.stderr,
            runtime_ms: persisted.runtime_ms,
        }
    }
}

/// Points at one kind of snapshot slot inside a key's entry list, for
/// copy-on-write back-reference patching. Deliberately carries no entry
/// position: lazy eviction shifts entries within the list, so patching
/// locates snapshots by what they alias, never by index.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SlotRef {
    pub ns: NamespaceId,
    pub key: u128,
    pub slot: Slot,
}

/// Which snapshot of an entry a [`SlotRef`] addresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Slot {
    Retval,
    Arg(usize),
}

#[derive(Debug)]
struct Namespace {
    /// Directory under the cache root, named by the hex digest of the
    /// canonical name's hash.
    dir: PathBuf,
    /// When set, the state machine can skip store access entirely.
    empty: bool,
    entries: FxHashMap<u128, Vec<CacheEntry>>,
    loaded: FxHashSet<u128>,
}

/// The on-disk cache: one namespace per callable, entry lists addressed by
/// argument hash, written atomically via temp-file + rename.
///
/// Single-writer, single-reader. An in-memory overlay mirrors disk within a
/// run; entry files are loaded lazily, once.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    namespaces: Vec<Namespace>,
    index: FxHashMap<String, NamespaceId>,
}

impl CacheStore {
    /// Opens (and creates if needed) the cache root directory.
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, namespaces: Vec::new(), index: FxHashMap::default() })
    }

    /// Interns the namespace for a callable, probing the disk for existing
    /// entries the first time.
    pub fn namespace(&mut self, name: &CanonicalName) -> NamespaceId {
        let key = name.to_string();
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let dir = self.root.join(hex_digest(hash(&key)));
        let empty = !has_entry_files(&dir);
        let id = NamespaceId(self.namespaces.len() as u32);
        self.namespaces.push(Namespace {
            dir,
            empty,
            entries: FxHashMap::default(),
            loaded: FxHashSet::default(),
        });
        self.index.insert(key, id);
        id
    }

    /// Whether the namespace is known to contain nothing.
    pub fn is_empty(&self, ns: NamespaceId) -> bool {
        self.namespaces[ns.0 as usize].empty
    }

    /// The candidate entries for an argument hash, loading them from disk
    /// on first access. Distinct global-state contexts can legally produce
    /// several valid entries for the same arguments.
    pub fn get(&mut self, ns: NamespaceId, key: u128) -> &mut Vec<CacheEntry> {
        let namespace = &mut self.namespaces[ns.0 as usize];
        if namespace.loaded.insert(key) {
            let path = namespace.dir.join(entry_file(key));
            let loaded = match read_entries(&path) {
                Ok(entries) => entries,
                Err(err) => {
                    // An unreadable entry file is just a miss.
                    log::warn!("dropping unreadable cache file {}: {err}", path.display());
                    Vec::new()
                }
            };
            namespace.entries.insert(key, loaded);
        }
        namespace.entries.entry(key).or_default()
    }

    /// Appends an entry and rewrites the on-disk list for its key. Returns
    /// the entry's index for back-reference registration.
    pub fn put(
        &mut self,
        ns: NamespaceId,
        key: u128,
        entry: CacheEntry,
        host: &dyn Host,
    ) -> usize {
        // Make sure older on-disk entries for this key survive the rewrite.
        self.get(ns, key);
        let namespace = &mut self.namespaces[ns.0 as usize];
        namespace.empty = false;
        let list = namespace.entries.entry(key).or_default();
        list.push(entry);
        let index = list.len() - 1;
        self.flush_key(ns, key, host);
        index
    }

    /// Removes one candidate entry (lazy eviction) and rewrites the list.
    pub fn delete_entry(&mut self, ns: NamespaceId, key: u128, index: usize, host: &dyn Host) {
        let namespace = &mut self.namespaces[ns.0 as usize];
        let removed = match namespace.entries.get_mut(&key) {
            Some(list) if index < list.len() => {
                list.remove(index);
                true
            }
            _ => false,
        };
        if removed {
            self.flush_key(ns, key, host);
        }
    }

    /// Deletes every entry for an argument hash.
    pub fn delete(&mut self, ns: NamespaceId, key: u128, host: &dyn Host) {
        let namespace = &mut self.namespaces[ns.0 as usize];
        namespace.loaded.insert(key);
        namespace.entries.insert(key, Vec::new());
        self.flush_key(ns, key, host);
    }

    /// Drops the in-memory overlay for one argument hash so the next access
    /// re-reads the on-disk list. Used when an in-memory deferred snapshot
    /// goes stale; the disk copy was materialized at capture time and is
    /// still correct.
    pub fn forget_key(&mut self, ns: NamespaceId, key: u128) {
        let namespace = &mut self.namespaces[ns.0 as usize];
        namespace.entries.remove(&key);
        namespace.loaded.remove(&key);
    }

    /// Deletes everything the callable ever cached, dependencies included,
    /// and resets the emptiness flag.
    pub fn invalidate_namespace(&mut self, ns: NamespaceId) {
        let namespace = &mut self.namespaces[ns.0 as usize];
        namespace.entries.clear();
        namespace.loaded.clear();
        namespace.empty = true;
        if namespace.dir.exists()
            && let Err(err) = fs::remove_dir_all(&namespace.dir)
        {
            fatal("cache invalidation", StoreError::Io(err));
        }
    }

    /// Replaces every deferred snapshot in the addressed slot kind that
    /// still aliases the given base value with its materialized copy.
    /// Entries whose snapshot was already resolved or evicted are left
    /// alone; disk already holds the same bytes.
    pub fn patch(
        &mut self,
        slot_ref: SlotRef,
        base: crate::shadow::ValueId,
        copy: &Arc<CanonValue>,
    ) {
        let namespace = &mut self.namespaces[slot_ref.ns.0 as usize];
        let Some(list) = namespace.entries.get_mut(&slot_ref.key) else { return };
        for entry in list.iter_mut() {
            let snapshot = match slot_ref.slot {
                Slot::Retval => &mut entry.retval,
                Slot::Arg(i) => match entry.args.get_mut(i) {
                    Some(snapshot) => snapshot,
                    None => continue,
                },
            };
            if snapshot.defers_to(base) {
                *snapshot = Snapshot::Ready(copy.clone());
            }
        }
    }

    /// The persisted code-dependency map for a namespace, if one exists.
    /// Kept separate from entry files so a code-only change is checkable
    /// without loading any cached value.
    pub fn load_deps(&mut self, ns: NamespaceId) -> Option<Vec<(String, CodeFingerprint)>> {
        let path = self.namespaces[ns.0 as usize].dir.join(DEPS_FILE);
        let bytes = fs::read(&path).ok()?;
        match bincode::deserialize(&bytes) {
            Ok(deps) => Some(deps),
            Err(err) => {
                log::warn!("dropping unreadable dependency file {}: {err}", path.display());
                None
            }
        }
    }

    /// Writes the code-dependency map for a namespace.
    pub fn save_deps(&mut self, ns: NamespaceId, deps: &FxHashMap<String, Arc<CodeFingerprint>>) {
        let mut list: Vec<(&String, &CodeFingerprint)> =
            deps.iter().map(|(name, fp)| (name, fp.as_ref())).collect();
        list.sort_by(|a, b| a.0.cmp(b.0));
        let namespace = &self.namespaces[ns.0 as usize];
        let bytes = match bincode::serialize(&list) {
            Ok(bytes) => bytes,
            Err(err) => fatal("dependency serialization", StoreError::Codec(err)),
        };
        if let Err(err) = write_atomic(&namespace.dir, DEPS_FILE, &bytes) {
            fatal("dependency write", err);
        }
    }

    /// Rewrites the entry file for one argument hash, materializing
    /// deferred snapshots transiently. Entries whose values can no longer
    /// be reduced are dropped with a warning.
    fn flush_key(&mut self, ns: NamespaceId, key: u128, host: &dyn Host) {
        let namespace = &self.namespaces[ns.0 as usize];
        let list = namespace.entries.get(&key).map_or(&[][..], Vec::as_slice);
        let persisted: Vec<PersistedEntry> = list
            .iter()
            .filter_map(|entry| {
                let persisted = entry.persisted(host);
                if persisted.is_none() {
                    log::warn!("dropping cache entry whose snapshot can no longer be reduced");
                }
                persisted
            })
            .collect();

        let file = entry_file(key);
        if persisted.is_empty() {
            let path = namespace.dir.join(file);
            if path.exists()
                && let Err(err) = fs::remove_file(&path)
            {
                fatal("cache entry delete", StoreError::Io(err));
            }
            return;
        }

        let bytes = match bincode::serialize(&persisted) {
            Ok(bytes) => bytes,
            Err(err) => fatal("cache entry serialization", StoreError::Codec(err)),
        };
        if let Err(err) = write_atomic(&namespace.dir, &file, &bytes) {
            fatal("cache entry write", err);
        }
    }
}

fn entry_file(key: u128) -> String {
    format!("{}{}", hex_digest(key), ENTRY_SUFFIX)
}

fn has_entry_files(dir: &PathBuf) -> bool {
    let Ok(iter) = fs::read_dir(dir) else { return false };
    iter.flatten().any(|dirent| {
        dirent.file_name().to_string_lossy().ends_with(ENTRY_SUFFIX)
    })
}

fn read_entries(path: &PathBuf) -> Result<Vec<CacheEntry>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path)?;
    let persisted: Vec<PersistedEntry> = bincode::deserialize(&bytes)?;
    Ok(persisted.into_iter().map(CacheEntry::from_persisted).collect())
}

/// Write-to-temp-then-rename, so a reader never observes a partially
/// written file. Atomic against crashes, not against concurrent writers.
fn write_atomic(dir: &PathBuf, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(dir.join(name)).map_err(|err| StoreError::Io(err.error))?;
    Ok(())
}
