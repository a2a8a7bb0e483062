//! Automatic incremental memoization for instrumented host runtimes.
//!
//! The host runtime announces calls, value mutations, global reads and file
//! traffic to an [`Engine`] and answers its value queries through the
//! [`Host`] trait. The engine infers which calls are pure, captures their
//! arguments, results and dependencies in an on-disk cache, and tells the
//! host to skip a call whenever a cached result's dependencies still hold.

mod canon;
mod config;
mod cow;
mod engine;
mod error;
mod fingerprint;
mod hash;
mod host;
mod logger;
mod reach;
mod registry;
mod shadow;
mod store;

pub use crate::canon::{CanonValue, FloatBits};
pub use crate::config::Config;
pub use crate::engine::{Engine, EnterOutcome};
pub use crate::error::{Broken, StoreError, Uncacheable};
pub use crate::fingerprint::{CodeFingerprint, Const};
pub use crate::host::{Contents, Host};
pub use crate::logger::Logger;
pub use crate::reach::GlobalPath;
pub use crate::registry::CanonicalName;
pub use crate::shadow::ValueId;
