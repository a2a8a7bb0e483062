use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Uncacheable;
use crate::hash::hash_bytes;
use crate::host::Host;
use crate::shadow::ValueId;

/// The canonical, identity-free form of a host value.
///
/// Equality is structural, hashing is content-based, and the whole tree is
/// serializable, so a snapshot written to disk in one run compares equal to
/// the same live value in a later run. Inherently non-serializable values
/// are represented by stable proxy descriptors instead ([`CanonValue::File`]
/// and [`CanonValue::Callable`]).
///
/// Unordered containers must be emitted in a canonical order by the host's
/// reducer; the engine treats `Set` and `Map` entries as ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonValue {
    None,
    Bool(bool),
    Int(i64),
    Float(FloatBits),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<CanonValue>),
    Tuple(Vec<CanonValue>),
    Set(Vec<CanonValue>),
    Map(Vec<(CanonValue, CanonValue)>),
    Record { type_name: String, fields: Vec<(String, CanonValue)> },
    /// Proxy for an open file handle: path plus seek offset.
    File { path: PathBuf, offset: u64 },
    /// Proxy for a callable reference: its canonical name.
    Callable { name: String },
}

/// An `f64` compared and hashed by its bit pattern.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FloatBits(u64);

impl From<f64> for FloatBits {
    fn from(value: f64) -> Self {
        Self(value.to_bits())
    }
}

impl FloatBits {
    pub fn get(self) -> f64 {
        f64::from_bits(self.0)
    }
}

/// Content hash of one serialized argument snapshot, used as the cache key.
pub fn args_hash(args: &[Arc<CanonValue>]) -> Result<u128, Uncacheable> {
    let refs: Vec<&CanonValue> = args.iter().map(Arc::as_ref).collect();
    let bytes = bincode::serialize(&refs)
        .map_err(|_| Uncacheable::NotSerializable { what: "argument snapshot" })?;
    Ok(hash_bytes(&bytes))
}

/// A captured copy of a value inside a cache entry.
///
/// `Deferred` aliases the live host value and owes the deferral manager a
/// real copy before that value's first mutation; `Ready` is an immutable
/// shared snapshot, so "copying" it anywhere is an `Arc` clone.
#[derive(Debug, Clone)]
pub enum Snapshot {
    Deferred(ValueId),
    Ready(Arc<CanonValue>),
}

impl Snapshot {
    /// The canonical form of this snapshot, reading through the host for
    /// deferred ones. Does not resolve the deferral; the returned copy is
    /// transient.
    pub fn current(&self, host: &dyn Host) -> Result<Arc<CanonValue>, Uncacheable> {
        match self {
            Self::Ready(value) => Ok(value.clone()),
            Self::Deferred(id) => host.canonicalize(*id).map(Arc::new),
        }
    }

    /// Whether this snapshot still aliases the given live value.
    pub fn defers_to(&self, id: ValueId) -> bool {
        matches!(self, Self::Deferred(base) if *base == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_hash_depends_on_content_not_identity() {
        let a = vec![Arc::new(CanonValue::Int(4))];
        let b = vec![Arc::new(CanonValue::Int(4))];
        let c = vec![Arc::new(CanonValue::Int(5))];
        assert_eq!(args_hash(&a).unwrap(), args_hash(&b).unwrap());
        assert_ne!(args_hash(&a).unwrap(), args_hash(&c).unwrap());
    }

    #[test]
    fn test_proxies_compare_structurally() {
        let f1 = CanonValue::File { path: "/tmp/data".into(), offset: 12 };
        let f2 = CanonValue::File { path: "/tmp/data".into(), offset: 12 };
        let f3 = CanonValue::File { path: "/tmp/data".into(), offset: 0 };
        assert_eq!(f1, f2);
        assert_ne!(f1, f3);
    }

    #[test]
    fn test_float_compares_by_bits() {
        let x = CanonValue::Float(1.5f64.into());
        let y = CanonValue::Float(1.5f64.into());
        assert_eq!(x, y);
        // NaN payloads survive the round trip, identical bits compare equal.
        let n1 = CanonValue::Float(f64::NAN.into());
        let n2 = CanonValue::Float(f64::NAN.into());
        assert_eq!(n1, n2);
    }
}
