use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::canon::{CanonValue, Snapshot, args_hash};
use crate::config::Config;
use crate::cow::Deferrals;
use crate::error::{Broken, StoreError, Uncacheable};
use crate::fingerprint::{CodeFingerprint, CodeRegistry};
use crate::host::{Contents, Host};
use crate::logger::{Logger, user_log};
use crate::reach::{GlobalPath, Reachability};
use crate::registry::{CallableId, Callables, CanonicalName};
use crate::shadow::{ShadowStore, ValueId};
use crate::store::{CacheEntry, CacheStore, NamespaceId, Slot, SlotRef};

/// What the host should do with a call it just announced.
#[derive(Debug)]
pub enum EnterOutcome {
    /// The call is not tracked. Run it normally; a frame was still pushed,
    /// so the matching [`Engine::exit_call`] must follow.
    NotTracked,
    /// No usable cached result. Run the call and report its outcome through
    /// [`Engine::exit_call`].
    Execute,
    /// A cached result is valid. Bind `retval` instead of running the call,
    /// write the captured output directly to the real streams (the engine
    /// has already credited it to the enclosing calls, so no output events
    /// must fire), and do not call [`Engine::exit_call`]; no frame was
    /// pushed.
    Skip {
        retval: Arc<CanonValue>,
        stdout: Option<Vec<u8>>,
        stderr: Option<Vec<u8>>,
    },
}

/// How an argument's entry-time state is being held onto.
enum ArgCapture {
    /// An immutable or untraversable value; the canonical copy taken at
    /// entry is kept as is.
    Ready(Arc<CanonValue>),
    /// A mutable value left in place. The deferral index owes us its
    /// entry-time state if it is mutated before the call exits.
    Live(ValueId),
}

/// Cache coordinates computed at entry, carried to the exit handler.
struct Lookup {
    ns: NamespaceId,
    key: u128,
    captures: Vec<ArgCapture>,
}

/// One announced call.
struct Frame {
    /// `None` for barrier frames (ignored files, paused tracking).
    callable: Option<CallableId>,
    /// Call clock at entry, for mutation blame.
    started_at: u64,
    start: Instant,
    lookup: Option<Lookup>,
    /// First reason this particular invocation became uncacheable.
    uncacheable: Option<Uncacheable>,
    /// Global paths read, with their values at first read.
    globals: FxHashMap<GlobalPath, CanonValue>,
    /// Files read, with modification times at first read.
    files_read: FxHashMap<PathBuf, i64>,
    written: FxHashSet<PathBuf>,
    opened_w: FxHashSet<PathBuf>,
    closed: FxHashSet<PathBuf>,
    /// Entry-time copies handed over by the deferral index when a live
    /// argument was mutated mid-call.
    arg_copies: FxHashMap<ValueId, Arc<CanonValue>>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Frame {
    fn new(callable: Option<CallableId>, started_at: u64) -> Self {
        Self {
            callable,
            started_at,
            start: Instant::now(),
            lookup: None,
            uncacheable: None,
            globals: FxHashMap::default(),
            files_read: FxHashMap::default(),
            written: FxHashSet::default(),
            opened_w: FxHashSet::default(),
            closed: FxHashSet::default(),
            arg_copies: FxHashMap::default(),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    fn captures_live(&self, base: ValueId) -> bool {
        self.lookup.as_ref().is_some_and(|lookup| {
            lookup
                .captures
                .iter()
                .any(|capture| matches!(capture, ArgCapture::Live(v) if *v == base))
        })
    }
}

/// What one traversal of a value learned.
struct Scan {
    /// Whether the root itself is mutable.
    mutable: bool,
    /// Whether any mutable constituent is reachable from outside the frame
    /// that produced the value.
    aliased: bool,
    /// Every mutable constituent, root included.
    contained: FxHashSet<ValueId>,
}

/// The memoization engine.
///
/// The host announces calls, value accesses, mutations, file and global
/// traffic as events; the engine decides which calls to skip and keeps the
/// on-disk cache consistent with what it observed. Everything is
/// synchronous and single-threaded; event handlers re-entered from inside a
/// host query are ignored via the paused switch.
pub struct Engine {
    config: Config,
    logger: Logger,
    callables: Callables,
    registry: CodeRegistry,
    store: CacheStore,
    shadow: ShadowStore,
    reach: Reachability,
    deferrals: Deferrals,
    frames: Vec<Frame>,
    /// Monotonic call clock; stamps value creation for mutation blame.
    clock: u64,
    paused: bool,
}

impl Engine {
    pub fn new(config: Config, logger: Logger) -> Result<Self, StoreError> {
        let store = CacheStore::open(config.cache_dir.clone())?;
        Ok(Self {
            config,
            logger,
            callables: Callables::new(),
            registry: CodeRegistry::new(),
            store,
            shadow: ShadowStore::new(),
            reach: Reachability::new(),
            deferrals: Deferrals::new(),
            frames: Vec::new(),
            clock: 0,
            paused: false,
        })
    }

    /// Hands out a handle for a newly created host value.
    pub fn register_value(&mut self) -> ValueId {
        self.shadow.register(self.clock)
    }

    /// Records the current compiled form of a callable. Call at every
    /// (re)definition; a meaningful change forces re-verification of every
    /// cached code dependency.
    pub fn register_code(&mut self, fingerprint: CodeFingerprint) {
        self.registry.register(fingerprint);
    }

    /// A value is about to be destroyed. Outstanding deferred copies of it
    /// are materialized first; then its handle goes stale.
    pub fn release_value(&mut self, host: &dyn Host, value: ValueId) {
        if !self.begin() {
            return;
        }
        self.resolve_deferrals(host, value);
        self.shadow.release(value);
        self.paused = false;
    }

    /// Announces a call. See [`EnterOutcome`] for the pairing contract.
    pub fn enter_call(
        &mut self,
        host: &dyn Host,
        file: &str,
        qualified: &str,
        args: &[ValueId],
    ) -> EnterOutcome {
        self.clock += 1;
        if !self.begin() {
            self.frames.push(Frame::new(None, self.clock));
            return EnterOutcome::NotTracked;
        }
        let outcome = self.enter_call_inner(host, file, qualified, args);
        self.paused = false;
        outcome
    }

    /// Announces the end of the innermost announced call. `retval` is `None`
    /// when the call unwound with an error; nothing is cached then.
    pub fn exit_call(&mut self, host: &dyn Host, retval: Option<ValueId>) {
        if !self.begin() {
            self.frames.pop();
            return;
        }
        self.exit_call_inner(host, retval);
        self.paused = false;
    }

    /// A global path was read. Tags the value for reachability and records
    /// the dependency in every tracked frame.
    pub fn on_global_read(&mut self, host: &dyn Host, path: &GlobalPath, value: ValueId) {
        if !self.begin() {
            return;
        }
        let ignored = self.config.is_ignored_file(&path.file);
        let tag = self.reach.intern(path, ignored);
        self.shadow.tag(value, tag);
        if !ignored {
            match host.canonicalize(value) {
                Ok(canon) => {
                    for frame in tracked(&mut self.frames) {
                        frame.globals.entry(path.clone()).or_insert_with(|| canon.clone());
                    }
                }
                Err(err) => {
                    for frame in tracked(&mut self.frames) {
                        frame.uncacheable.get_or_insert(err.clone());
                    }
                }
            }
        }
        self.paused = false;
    }

    /// A global path was rebound. Every enclosing call becomes impure.
    pub fn on_global_write(&mut self, path: &GlobalPath) {
        if !self.begin() {
            return;
        }
        if !self.config.is_ignored_file(&path.file) {
            mark_all_impure(
                &self.frames,
                &mut self.callables,
                &self.logger,
                "rebinds a global",
                &format!("rebinds global {path}"),
            );
        }
        self.paused = false;
    }

    /// A value was read out of a container. Extends reachability tags.
    pub fn on_access(&mut self, parent: ValueId, child: ValueId) {
        if !self.begin() {
            return;
        }
        Reachability::propagate(&mut self.shadow, parent, child);
        self.paused = false;
    }

    /// A value is about to be mutated, while still in its pre-mutation
    /// state. Resolves deferred copies and assigns impurity blame.
    pub fn on_mutate(&mut self, host: &dyn Host, value: ValueId) {
        if !self.begin() {
            return;
        }
        self.on_mutate_inner(host, value);
        self.paused = false;
    }

    /// A file was opened in the given mode string.
    pub fn on_file_open(&mut self, path: &Path, mode: &str) {
        if !self.begin() {
            return;
        }
        match classify_mode(mode) {
            FileMode::Mixed => mark_all_impure(
                &self.frames,
                &mut self.callables,
                &self.logger,
                "opens a file in append or update mode",
                &format!("opens {} in append or update mode", path.display()),
            ),
            FileMode::Write => {
                for frame in tracked(&mut self.frames) {
                    frame.opened_w.insert(path.to_owned());
                    frame.written.insert(path.to_owned());
                }
            }
            FileMode::Read => self.record_file_read(path),
        }
        self.paused = false;
    }

    /// A file's contents were read through an already open handle.
    pub fn on_file_read(&mut self, path: &Path) {
        if !self.begin() {
            return;
        }
        self.record_file_read(path);
        self.paused = false;
    }

    pub fn on_file_write(&mut self, path: &Path) {
        if !self.begin() {
            return;
        }
        for frame in tracked(&mut self.frames) {
            frame.written.insert(path.to_owned());
        }
        self.paused = false;
    }

    pub fn on_file_close(&mut self, path: &Path) {
        if !self.begin() {
            return;
        }
        for frame in tracked(&mut self.frames) {
            frame.closed.insert(path.to_owned());
        }
        self.paused = false;
    }

    /// A call into a routine the engine cannot see inside (a builtin or
    /// native extension). Known stdin readers poison the stack; known
    /// self-mutators count as a mutation of their receiver.
    pub fn on_foreign_call(&mut self, host: &dyn Host, name: &str, receiver: Option<ValueId>) {
        if !self.begin() {
            return;
        }
        if self.config.impure_names.iter().any(|n| n == name) {
            mark_all_impure(
                &self.frames,
                &mut self.callables,
                &self.logger,
                "calls an inherently impure routine",
                &format!("calls inherently impure routine {name}"),
            );
        } else if let Some(receiver) = receiver
            && self.config.self_mutators.iter().any(|n| n == name)
        {
            self.on_mutate_inner(host, receiver);
        }
        self.paused = false;
    }

    pub fn on_stdout(&mut self, bytes: &[u8]) {
        if !self.begin() {
            return;
        }
        for frame in tracked(&mut self.frames) {
            frame.stdout.extend_from_slice(bytes);
        }
        self.paused = false;
    }

    pub fn on_stderr(&mut self, bytes: &[u8]) {
        if !self.begin() {
            return;
        }
        for frame in tracked(&mut self.frames) {
            frame.stderr.extend_from_slice(bytes);
        }
        self.paused = false;
    }

    /// Wipes everything cached for one callable and puts its record back
    /// into a pristine pure state.
    pub fn invalidate(&mut self, name: &CanonicalName) {
        if !self.begin() {
            return;
        }
        let id = self.callables.intern(name);
        let ns = self.store.namespace(name);
        self.store.invalidate_namespace(ns);
        let current = self.registry.get(&name.to_string()).cloned();
        self.callables.get_mut(id).reset(current);
        user_log!(self.logger, "CLEAR_CACHE {name} | requested by the host");
        self.paused = false;
    }

    /// Persists the code dependency maps of every callable that has cached
    /// entries. Call once at host shutdown.
    pub fn finalize(&mut self) {
        if !self.begin() {
            return;
        }
        let maps: Vec<_> = self
            .callables
            .iter()
            .filter(|record| !record.code_deps.is_empty())
            .map(|record| (record.name.clone(), record.code_deps.clone()))
            .collect();
        for (name, deps) in maps {
            let ns = self.store.namespace(&name);
            if !self.store.is_empty(ns) {
                self.store.save_deps(ns, &deps);
            }
        }
        self.paused = false;
    }

    fn begin(&mut self) -> bool {
        if self.paused {
            return false;
        }
        self.paused = true;
        true
    }

    fn enter_call_inner(
        &mut self,
        host: &dyn Host,
        file: &str,
        qualified: &str,
        args: &[ValueId],
    ) -> EnterOutcome {
        let started_at = self.clock;

        if self.config.is_ignored_file(file) {
            self.frames.push(Frame::new(None, started_at));
            return EnterOutcome::NotTracked;
        }
        if self.config.impure_names.iter().any(|n| n == qualified) {
            mark_all_impure(
                &self.frames,
                &mut self.callables,
                &self.logger,
                "calls an inherently impure routine",
                &format!("calls inherently impure routine {qualified}"),
            );
            self.frames.push(Frame::new(None, started_at));
            return EnterOutcome::NotTracked;
        }

        let name = CanonicalName::new(file, qualified);
        let id = self.callables.intern(&name);
        let ns = self.store.namespace(&name);

        if !self.callables.get(id).deps_loaded {
            self.load_code_deps(id, ns);
        }

        {
            let record = self.callables.get(id);
            if record.impure.is_some() || record.likely_nothing_to_memoize {
                self.frames.push(Frame::new(Some(id), started_at));
                return EnterOutcome::Execute;
            }
        }

        if let Some(broken) = self.code_verdict(id) {
            if self.config.trust_prev_results {
                user_log!(self.logger, "TRUSTING_MEMOIZED_RESULTS {name} | {broken}");
            } else {
                self.store.invalidate_namespace(ns);
                let current = self.registry.get(&name.to_string()).cloned();
                self.callables.get_mut(id).reset(current);
                user_log!(self.logger, "CLEAR_CACHE {name} | {broken}");
            }
        }

        // Capture entry-time argument snapshots. The call may mutate its
        // arguments, so this is the only moment the cache key can be taken.
        let mut canon_args = Vec::with_capacity(args.len());
        let mut failure = None;
        for (index, &arg) in args.iter().enumerate() {
            if !host.has_comparison(arg) {
                failure = Some(Uncacheable::NoComparison { index });
                break;
            }
            if !host.serializable(arg) {
                failure = Some(Uncacheable::NotSerializable { what: "argument snapshot" });
                break;
            }
            match host.canonicalize(arg) {
                Ok(canon) => canon_args.push(Arc::new(canon)),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let key = match failure {
            None => match args_hash(&canon_args) {
                Ok(key) => Some(key),
                Err(err) => {
                    failure = Some(err);
                    None
                }
            },
            Some(_) => None,
        };
        let Some(key) = key else {
            let mut frame = Frame::new(Some(id), started_at);
            frame.uncacheable = failure;
            self.frames.push(frame);
            return EnterOutcome::Execute;
        };

        if let Some(outcome) = self.scan_candidates(host, id, ns, key, &canon_args) {
            return outcome;
        }

        // Miss. Leave mutable arguments in place; the deferral index will
        // hand us their entry-time state if anything touches them.
        let mut captures = Vec::with_capacity(args.len());
        for (&arg, canon) in args.iter().zip(&canon_args) {
            match scan_value(host, &self.shadow, &self.reach, started_at, arg) {
                Ok(scan) if scan.mutable => {
                    self.deferrals.track(arg, scan.contained);
                    captures.push(ArgCapture::Live(arg));
                }
                _ => captures.push(ArgCapture::Ready(canon.clone())),
            }
        }
        let mut frame = Frame::new(Some(id), started_at);
        frame.lookup = Some(Lookup { ns, key, captures });
        self.frames.push(frame);
        EnterOutcome::Execute
    }

    /// Scans the candidate entries for one argument hash. Returns the skip
    /// outcome on a hit, `None` on a miss.
    fn scan_candidates(
        &mut self,
        host: &dyn Host,
        id: CallableId,
        ns: NamespaceId,
        key: u128,
        canon_args: &[Arc<CanonValue>],
    ) -> Option<EnterOutcome> {
        if self.store.is_empty(ns) {
            return None;
        }
        let name = self.callables.get(id).name.to_string();
        let lookup_start = Instant::now();
        let mut hit = None;
        let mut index = 0;
        'scan: while index < self.store.get(ns, key).len() {
            let candidate = self.store.get(ns, key)[index].clone();

            // Guard against an argument hash collision.
            if candidate.args.len() != canon_args.len() {
                index += 1;
                continue;
            }
            for (snapshot, ours) in candidate.args.iter().zip(canon_args) {
                match snapshot.current(host) {
                    Ok(theirs) if theirs == *ours => {}
                    _ => {
                        index += 1;
                        continue 'scan;
                    }
                }
            }

            // A global mismatch only disqualifies this candidate; the same
            // arguments under other global state stay cached.
            for (path, recorded) in &candidate.globals {
                if host.resolve_global(path).as_ref() != Some(recorded) {
                    let broken = Broken::Global { path: path.to_string() };
                    user_log!(self.logger, "GLOBAL_DEPENDENCY_BROKEN {name} | {broken}");
                    index += 1;
                    continue 'scan;
                }
            }

            // A stale file can never become fresh again; evict the entry.
            for (path, recorded) in
                candidate.files_read.iter().chain(candidate.files_written.iter())
            {
                if file_mtime(path) != Some(*recorded) {
                    let broken = Broken::File { path: path.clone() };
                    user_log!(self.logger, "FILE_DEPENDENCY_BROKEN {name} | {broken}");
                    self.store.delete_entry(ns, key, index, host);
                    continue 'scan;
                }
            }

            match candidate.retval.current(host) {
                Ok(retval) => {
                    hit = Some((candidate, retval));
                    break;
                }
                Err(_) => index += 1,
            }
        }

        let (entry, retval) = hit?;
        let lookup_ms = lookup_start.elapsed().as_millis();
        user_log!(self.logger, "SKIPPED {name} | lookup time {lookup_ms} ms");

        // The skipped call's dependencies become its callers' dependencies.
        for frame in tracked(&mut self.frames) {
            for (path, value) in &entry.globals {
                frame.globals.entry(path.clone()).or_insert_with(|| value.clone());
            }
            for (path, mtime) in &entry.files_read {
                frame.files_read.entry(path.clone()).or_insert(*mtime);
            }
            for (path, _) in &entry.files_written {
                frame.written.insert(path.clone());
                frame.opened_w.insert(path.clone());
                frame.closed.insert(path.clone());
            }
            if let Some(stdout) = &entry.stdout {
                frame.stdout.extend_from_slice(stdout);
            }
            if let Some(stderr) = &entry.stderr {
                frame.stderr.extend_from_slice(stderr);
            }
        }
        self.merge_code_deps(id);

        Some(EnterOutcome::Skip { retval, stdout: entry.stdout, stderr: entry.stderr })
    }

    fn exit_call_inner(&mut self, host: &dyn Host, retval: Option<ValueId>) {
        let Some(mut frame) = self.frames.pop() else {
            log::warn!("exit event with no matching call frame");
            return;
        };
        let Some(id) = frame.callable else { return };
        let runtime = frame.start.elapsed();
        let lookup = frame.lookup.take();

        // Direct dependencies were recorded into every enclosing frame as
        // they happened; code dependencies merge upward here.
        self.merge_code_deps(id);

        let name = self.callables.get(id).name.to_string();
        if self.callables.get(id).impure.is_some()
            || self.callables.get(id).likely_nothing_to_memoize
        {
            return self.release_captures(lookup);
        }
        let Some(retval) = retval else { return self.release_captures(lookup) };
        if let Some(err) = &frame.uncacheable {
            user_log!(self.logger, "CANNOT_MEMOIZE {name} | {err}");
            return self.release_captures(lookup);
        }
        let Some(lookup) = lookup else { return };
        if runtime < self.config.min_runtime() {
            let threshold = self.config.fast_call_threshold;
            if self.callables.get_mut(id).note_fast_empty_call(threshold) {
                log::debug!("{name}: repeatedly too fast to cache, lookups disabled");
            }
            return self.release_captures(Some(lookup));
        }

        // A write is only acceptable when this call owned the file's whole
        // lifetime: opened for pure writing and closed again. Pseudo-files
        // with bracketed names never count.
        for path in &frame.written {
            if path.to_string_lossy().starts_with('<') {
                continue;
            }
            if !(frame.opened_w.contains(path) && frame.closed.contains(path)) {
                let err = Uncacheable::NonSelfContainedWrite { path: path.clone() };
                user_log!(self.logger, "CANNOT_MEMOIZE {name} | {err}");
                return self.release_captures(Some(lookup));
            }
        }

        if !host.serializable(retval) {
            let err = Uncacheable::NotSerializable { what: "return value" };
            user_log!(self.logger, "CANNOT_MEMOIZE {name} | {err}");
            return self.release_captures(Some(lookup));
        }
        let scan = match scan_value(host, &self.shadow, &self.reach, frame.started_at, retval) {
            Ok(scan) => scan,
            Err(err) => {
                user_log!(self.logger, "CANNOT_MEMOIZE {name} | {err}");
                return self.release_captures(Some(lookup));
            }
        };
        if scan.aliased {
            let err = Uncacheable::AliasedReturn;
            user_log!(self.logger, "CANNOT_MEMOIZE {name} | {err}");
            return self.release_captures(Some(lookup));
        }
        let retval_snapshot = if scan.mutable {
            Snapshot::Deferred(retval)
        } else {
            match host.canonicalize(retval) {
                Ok(canon) => Snapshot::Ready(Arc::new(canon)),
                Err(err) => {
                    user_log!(self.logger, "CANNOT_MEMOIZE {name} | {err}");
                    return self.release_captures(Some(lookup));
                }
            }
        };

        let mut args = Vec::with_capacity(lookup.captures.len());
        let mut live_args = Vec::new();
        for (position, capture) in lookup.captures.into_iter().enumerate() {
            match capture {
                ArgCapture::Ready(canon) => args.push(Snapshot::Ready(canon)),
                ArgCapture::Live(base) => match frame.arg_copies.get(&base) {
                    Some(copy) => args.push(Snapshot::Ready(copy.clone())),
                    None => {
                        live_args.push((position, base));
                        args.push(Snapshot::Deferred(base));
                    }
                },
            }
        }

        let mut files_written = Vec::new();
        for path in &frame.written {
            if path.to_string_lossy().starts_with('<') {
                continue;
            }
            if let Some(mtime) = file_mtime(path) {
                files_written.push((path.clone(), mtime));
            }
        }

        let entry = CacheEntry {
            args,
            retval: retval_snapshot,
            globals: frame.globals.into_iter().collect(),
            files_read: frame.files_read.into_iter().collect(),
            files_written,
            stdout: (!frame.stdout.is_empty()).then_some(frame.stdout),
            stderr: (!frame.stderr.is_empty()).then_some(frame.stderr),
            runtime_ms: runtime.as_millis() as u64,
        };

        let store_start = Instant::now();
        let index = self.store.put(lookup.ns, lookup.key, entry, host);
        let store_cost = store_start.elapsed();
        if store_cost > runtime {
            self.store.delete_entry(lookup.ns, lookup.key, index, host);
            user_log!(
                self.logger,
                "UNECONOMICAL {name} | stored in {} ms, ran in {} ms",
                store_cost.as_millis(),
                runtime.as_millis()
            );
            for (_, base) in live_args {
                self.release_capture(base);
            }
            return;
        }

        // The stored snapshots alias live values; wire up the deferred
        // copies they are owed.
        if scan.mutable {
            self.deferrals.track(retval, scan.contained);
            self.deferrals.attach(
                retval,
                SlotRef { ns: lookup.ns, key: lookup.key, slot: Slot::Retval },
            );
        }
        for (position, base) in live_args {
            self.deferrals.attach(
                base,
                SlotRef { ns: lookup.ns, key: lookup.key, slot: Slot::Arg(position) },
            );
        }

        user_log!(self.logger, "MEMOIZED {name} | runtime {} ms", runtime.as_millis());
    }

    fn on_mutate_inner(&mut self, host: &dyn Host, value: ValueId) {
        self.resolve_deferrals(host, value);

        if let Some(tag) = self.shadow.container(value)
            && !self.reach.is_ignored(tag)
        {
            let path = self.reach.path(tag).to_string();
            mark_all_impure(
                &self.frames,
                &mut self.callables,
                &self.logger,
                "mutates a globally reachable value",
                &format!("mutates globally reachable value {path}"),
            );
            return;
        }

        // Blame by age: a frame is impure only if the value predates it.
        let created = self.shadow.created_at(value);
        for frame in &self.frames {
            if let Some(id) = frame.callable
                && created < frame.started_at
                && self
                    .callables
                    .get_mut(id)
                    .mark_impure("mutates a value that outlives the call")
            {
                user_log!(
                    self.logger,
                    "CANNOT_MEMOIZE {} | mutates a value that outlives the call",
                    self.callables.get(id).name
                );
            }
        }
    }

    /// Drops the deferrals of a discarded frame's live argument captures.
    /// A base still captured by an enclosing frame, or with snapshot slots
    /// attached from an earlier cached entry, stays tracked.
    fn release_captures(&mut self, lookup: Option<Lookup>) {
        let Some(lookup) = lookup else { return };
        for capture in lookup.captures {
            if let ArgCapture::Live(base) = capture {
                self.release_capture(base);
            }
        }
    }

    fn release_capture(&mut self, base: ValueId) {
        if !self.frames.iter().any(|frame| frame.captures_live(base)) {
            self.deferrals.untrack_unreferenced(base);
        }
    }

    /// Materializes every deferred copy that a mutation of `value` would
    /// invalidate, while the pre-mutation state is still readable.
    fn resolve_deferrals(&mut self, host: &dyn Host, value: ValueId) {
        if !self.deferrals.is_traced(value) {
            return;
        }
        for base in self.deferrals.affected_bases(value) {
            let slots = self.deferrals.resolve(base);
            match host.canonicalize(base) {
                Ok(copy) => {
                    let copy = Arc::new(copy);
                    for slot in &slots {
                        self.store.patch(*slot, base, &copy);
                    }
                    for frame in &mut self.frames {
                        if frame.captures_live(base) {
                            frame.arg_copies.entry(base).or_insert_with(|| copy.clone());
                        }
                    }
                }
                Err(err) => {
                    // The disk copy was materialized at capture time and is
                    // still correct; drop the stale in-memory overlay.
                    log::warn!("deferred copy could no longer be reduced: {err}");
                    let keys: FxHashSet<(NamespaceId, u128)> =
                        slots.iter().map(|slot| (slot.ns, slot.key)).collect();
                    for (ns, key) in keys {
                        self.store.forget_key(ns, key);
                    }
                    for frame in &mut self.frames {
                        if frame.captures_live(base) && !frame.arg_copies.contains_key(&base) {
                            frame.uncacheable.get_or_insert(err.clone());
                        }
                    }
                }
            }
        }
    }

    /// Copies one callable's code dependency map into every enclosing
    /// tracked frame's record.
    fn merge_code_deps(&mut self, id: CallableId) {
        let deps: Vec<(String, Arc<CodeFingerprint>)> = self
            .callables
            .get(id)
            .code_deps
            .iter()
            .map(|(name, fingerprint)| (name.clone(), fingerprint.clone()))
            .collect();
        for frame in &self.frames {
            if let Some(caller) = frame.callable
                && caller != id
            {
                let record = self.callables.get_mut(caller);
                for (name, fingerprint) in &deps {
                    record
                        .code_deps
                        .entry(name.clone())
                        .or_insert_with(|| fingerprint.clone());
                }
            }
        }
    }

    fn load_code_deps(&mut self, id: CallableId, ns: NamespaceId) {
        let loaded = self.store.load_deps(ns);
        let name = self.callables.get(id).name.to_string();
        let current = self.registry.get(&name).cloned();
        let record = self.callables.get_mut(id);
        record.deps_loaded = true;
        if let Some(deps) = loaded {
            for (dep, fingerprint) in deps {
                record.code_deps.entry(dep).or_insert_with(|| Arc::new(fingerprint));
            }
        }
        // The persisted self entry must win over the live one, otherwise a
        // code change between runs could never be noticed.
        if let Some(fingerprint) = current {
            record.code_deps.entry(name).or_insert(fingerprint);
        }
    }

    /// Checks every recorded code dependency against the live registry.
    /// Positive verdicts are cached per registry epoch.
    fn code_verdict(&mut self, id: CallableId) -> Option<Broken> {
        let epoch = self.registry.epoch();
        let record = self.callables.get(id);
        if record.deps_ok_epoch == Some(epoch) {
            return None;
        }
        for (dep, recorded) in &record.code_deps {
            let ok = self.registry.get(dep).is_some_and(|current| current.matches(recorded));
            if !ok {
                return Some(Broken::Code { name: dep.clone() });
            }
        }
        self.callables.get_mut(id).deps_ok_epoch = Some(epoch);
        None
    }

    fn record_file_read(&mut self, path: &Path) {
        let name = path.to_string_lossy();
        if name == "<stdin>" {
            mark_all_impure(
                &self.frames,
                &mut self.callables,
                &self.logger,
                "reads from stdin",
                "reads from stdin",
            );
            return;
        }
        if name.starts_with('<') {
            return;
        }
        let Some(mtime) = file_mtime(path) else { return };
        for frame in tracked(&mut self.frames) {
            frame.files_read.entry(path.to_owned()).or_insert(mtime);
        }
    }
}

fn tracked(frames: &mut [Frame]) -> impl Iterator<Item = &mut Frame> {
    frames.iter_mut().filter(|frame| frame.callable.is_some())
}

/// Marks every tracked frame's callable impure, logging each record whose
/// state just flipped.
fn mark_all_impure(
    frames: &[Frame],
    callables: &mut Callables,
    logger: &Logger,
    reason: &'static str,
    detail: &str,
) {
    for frame in frames {
        if let Some(id) = frame.callable
            && callables.get_mut(id).mark_impure(reason)
        {
            user_log!(logger, "CANNOT_MEMOIZE {} | {detail}", callables.get(id).name);
        }
    }
}

/// Walks a value's mutable constituents via the host.
fn scan_value(
    host: &dyn Host,
    shadow: &ShadowStore,
    reach: &Reachability,
    frame_started: u64,
    value: ValueId,
) -> Result<Scan, Uncacheable> {
    let mut scan = Scan { mutable: false, aliased: false, contained: FxHashSet::default() };
    let mut stack = vec![value];
    let mut seen = FxHashSet::default();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        match host.contents(current) {
            Contents::Immutable => {}
            Contents::Opaque => return Err(Uncacheable::Opaque),
            Contents::Children(children) => {
                if current == value {
                    scan.mutable = true;
                }
                scan.contained.insert(current);
                if shadow.created_at(current) < frame_started {
                    scan.aliased = true;
                }
                if let Some(tag) = shadow.container(current)
                    && !reach.is_ignored(tag)
                {
                    scan.aliased = true;
                }
                stack.extend(children);
            }
        }
    }
    Ok(scan)
}

enum FileMode {
    Read,
    Write,
    Mixed,
}

/// Append and update modes expose prior file state, so a call using them
/// can never be self-contained.
fn classify_mode(mode: &str) -> FileMode {
    if mode.contains('+') || mode.contains('a') {
        FileMode::Mixed
    } else if mode.contains('w') {
        FileMode::Write
    } else {
        FileMode::Read
    }
}

/// Nanosecond modification time, where the filesystem provides one.
fn file_mtime(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TreeHost {
        children: FxHashMap<ValueId, Vec<ValueId>>,
        opaque: FxHashSet<ValueId>,
    }

    impl Host for TreeHost {
        fn canonicalize(&self, _: ValueId) -> Result<CanonValue, Uncacheable> {
            Ok(CanonValue::None)
        }
        fn has_comparison(&self, _: ValueId) -> bool {
            true
        }
        fn serializable(&self, _: ValueId) -> bool {
            true
        }
        fn resolve_global(&self, _: &GlobalPath) -> Option<CanonValue> {
            None
        }
        fn contents(&self, value: ValueId) -> Contents {
            if self.opaque.contains(&value) {
                Contents::Opaque
            } else if let Some(children) = self.children.get(&value) {
                Contents::Children(children.clone())
            } else {
                Contents::Immutable
            }
        }
    }

    #[test]
    fn test_mode_classification() {
        assert!(matches!(classify_mode("r"), FileMode::Read));
        assert!(matches!(classify_mode("rb"), FileMode::Read));
        assert!(matches!(classify_mode("w"), FileMode::Write));
        assert!(matches!(classify_mode("wb"), FileMode::Write));
        assert!(matches!(classify_mode("a"), FileMode::Mixed));
        assert!(matches!(classify_mode("r+"), FileMode::Mixed));
        assert!(matches!(classify_mode("w+b"), FileMode::Mixed));
    }

    #[test]
    fn test_scan_finds_aliasing_through_nesting() {
        let mut shadow = ShadowStore::new();
        let reach = Reachability::new();
        let old = shadow.register(1);
        let fresh = shadow.register(10);
        let leaf = shadow.register(10);
        let host = TreeHost {
            children: [(fresh, vec![old, leaf])].into_iter().collect(),
            opaque: FxHashSet::default(),
        };

        // A fresh list holding an immutable leaf is clean.
        let scan = scan_value(&host, &shadow, &reach, 5, fresh).unwrap();
        assert!(scan.mutable);
        assert!(!scan.aliased);
        assert_eq!(scan.contained.len(), 1);

        // Nest a pre-existing mutable value inside and it gets flagged.
        let host = TreeHost {
            children: [(fresh, vec![old, leaf]), (old, vec![])].into_iter().collect(),
            opaque: FxHashSet::default(),
        };
        let scan = scan_value(&host, &shadow, &reach, 5, fresh).unwrap();
        assert!(scan.aliased);
        assert_eq!(scan.contained.len(), 2);
    }

    #[test]
    fn test_scan_reports_globally_tagged_constituents() {
        let mut shadow = ShadowStore::new();
        let mut reach = Reachability::new();
        let tag = reach.intern(&GlobalPath::new("m.py", &["table"]), false);
        let fresh = shadow.register(10);
        let tagged = shadow.register(10);
        shadow.tag(tagged, tag);
        let host = TreeHost {
            children: [(fresh, vec![tagged]), (tagged, vec![])].into_iter().collect(),
            opaque: FxHashSet::default(),
        };
        let scan = scan_value(&host, &shadow, &reach, 5, fresh).unwrap();
        assert!(scan.aliased);
    }

    fn test_engine(dir: &std::path::Path) -> Engine {
        let config = Config { cache_dir: dir.to_path_buf(), ..Config::default() };
        Engine::new(config, Logger::disabled()).unwrap()
    }

    #[test]
    fn test_discarded_call_releases_argument_deferrals() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let list = engine.register_value();
        let item = engine.register_value();
        let host = TreeHost {
            children: [(list, vec![item])].into_iter().collect(),
            opaque: FxHashSet::default(),
        };

        assert!(matches!(
            engine.enter_call(&host, "m.py", "f", &[list]),
            EnterOutcome::Execute
        ));
        assert!(engine.deferrals.is_traced(list));

        // The unwound call stores nothing, so nobody is owed a copy.
        engine.exit_call(&host, None);
        assert!(!engine.deferrals.is_traced(list));
    }

    #[test]
    fn test_shared_capture_outlives_inner_discard() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let list = engine.register_value();
        let host = TreeHost {
            children: [(list, vec![])].into_iter().collect(),
            opaque: FxHashSet::default(),
        };

        engine.enter_call(&host, "m.py", "outer", &[list]);
        engine.enter_call(&host, "m.py", "inner", &[list]);
        engine.exit_call(&host, None);
        // The outer frame still needs the entry-time copy.
        assert!(engine.deferrals.is_traced(list));

        engine.exit_call(&host, None);
        assert!(!engine.deferrals.is_traced(list));
    }

    #[test]
    fn test_scan_refuses_opaque_values() {
        let mut shadow = ShadowStore::new();
        let reach = Reachability::new();
        let fresh = shadow.register(10);
        let foreign = shadow.register(10);
        let host = TreeHost {
            children: [(fresh, vec![foreign])].into_iter().collect(),
            opaque: [foreign].into_iter().collect(),
        };
        assert!(matches!(
            scan_value(&host, &shadow, &reach, 5, fresh),
            Err(Uncacheable::Opaque)
        ));
    }
}
