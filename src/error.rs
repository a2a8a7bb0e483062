use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why an invocation cannot be cached.
///
/// None of these ever surface as a failure of the instrumented program; they
/// only show up in the operator log and make the engine decline to help.
#[derive(Debug, Clone, Error)]
pub enum Uncacheable {
    /// An argument supports only identity-based equality, so a copy loaded
    /// from disk could never be matched against a live value.
    #[error("arg {index} has no comparison method")]
    NoComparison { index: usize },
    /// A value cannot be reduced to a serializable canonical form, even via
    /// a proxy descriptor.
    #[error("{what} is not serializable")]
    NotSerializable { what: &'static str },
    /// A file was written without being opened in pure-write mode and closed
    /// within this invocation.
    #[error("non-self-contained write to {path}")]
    NonSelfContainedWrite { path: PathBuf },
    /// The return value transitively contains a mutable value reachable from
    /// outside this call; freezing a copy would break aliasing.
    #[error("return value contains an externally-aliased mutable value")]
    AliasedReturn,
    /// A constituent value cannot be traversed, so purity cannot be claimed.
    #[error("opaque value blocks traversal")]
    Opaque,
}

/// Which recorded dependency of a cache candidate no longer holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broken {
    /// Referenced callable is missing or its fingerprint changed.
    /// Invalidates the whole namespace unless trust mode is active.
    Code { name: String },
    /// A recorded global path is gone or its value is unequal.
    /// Disqualifies only the specific candidate.
    Global { path: String },
    /// A recorded file is missing or its modification time changed.
    /// Disqualifies the candidate and deletes it from the on-disk list.
    File { path: PathBuf },
}

impl std::fmt::Display for Broken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code { name } => write!(f, "code dependency {name} changed"),
            Self::Global { path } => write!(f, "global dependency {path} changed"),
            Self::File { path } => {
                write!(f, "file dependency {} changed", path.display())
            }
        }
    }
}

/// A cache store failure.
///
/// Read-side failures degrade to a cache miss; write-side failures are
/// unrecoverable and terminate the process rather than risking a silently
/// incorrect cached result.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store i/o: {0}")]
    Io(#[from] io::Error),
    #[error("cache store codec: {0}")]
    Codec(#[from] bincode::Error),
}

/// Aborts on an unrecoverable storage failure.
pub(crate) fn fatal(context: &str, err: StoreError) -> ! {
    panic!("rememo: unrecoverable {context}: {err}");
}
