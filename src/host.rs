use crate::canon::CanonValue;
use crate::error::Uncacheable;
use crate::reach::GlobalPath;
use crate::shadow::ValueId;

/// What the engine needs from the embedding runtime.
///
/// The engine is a plain synchronous library: the host raises events into
/// it ([`Engine`](crate::Engine)'s `on_*` methods) and answers these value
/// queries. Event delivery must stay disabled while a query runs; the
/// engine takes care of that via its tracking switch.
pub trait Host {
    /// Reduces a live value to its canonical snapshot.
    ///
    /// Must read the value's current state; the engine only calls this at
    /// points where that state is the one it wants captured.
    fn canonicalize(&self, value: ValueId) -> Result<CanonValue, Uncacheable>;

    /// Whether the value supports identity-independent equality. Without
    /// it, a snapshot reloaded from disk could never match a live value.
    fn has_comparison(&self, value: ValueId) -> bool;

    /// Whether the value can be reduced by [`Host::canonicalize`] at all,
    /// possibly via a proxy descriptor. Cheaper than trying.
    fn serializable(&self, value: ValueId) -> bool;

    /// Resolves a global path to the canonical form of its current value,
    /// or `None` if the path no longer leads anywhere.
    fn resolve_global(&self, path: &GlobalPath) -> Option<CanonValue>;

    /// One traversal step into a value, for reachability and copy-on-write
    /// containment tracking.
    fn contents(&self, value: ValueId) -> Contents;
}

/// The immediate constituents of a value.
pub enum Contents {
    /// A definitely-immutable kind; nothing inside it can ever change.
    Immutable,
    /// A mutable container and the tracked values directly inside it.
    Children(Vec<ValueId>),
    /// A foreign type the host cannot see into. Treated as a soundness
    /// gap: logged, handled conservatively, never crashed on.
    Opaque,
}
