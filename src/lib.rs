//! Preplock: a cancel-correct async reader/writer lock with resource
//! preparation.
//!
//! # Overview
//!
//! Preplock guards two things at once: mutually exclusive access to a
//! critical section, and the *state* of the resources touched while a
//! lock is held. Resources — in-memory projections of a file, a database
//! connection, a parsed model — must be prepared for concurrent reads or
//! for exclusive writes before callers may use them. Preparation is
//! asynchronous, may fail, and is expensive, so the lock runs each
//! preparation at most once per mode transition and shares the result
//! among every concurrent waiter.
//!
//! # Core Guarantees
//!
//! - **One preparation per transition**: concurrent requests for the same
//!   resource join a single in-flight preparation.
//! - **Total order per resource**: preparations for one resource never
//!   overlap, even across mode switches, faults, and abandonment.
//! - **Cancel-correctness**: a caller's cancellation detaches that caller
//!   only; the underlying work is cancelled when the last waiter leaves.
//! - **Invalidation on write release**: releasing the outermost write
//!   lock forgets every resource's state, and resources touched under a
//!   surrounding upgradeable read are re-prepared for concurrent access
//!   before the release completes.
//!
//! # Module Structure
//!
//! - [`cancel`]: cancellation tokens
//! - [`error`]: error types
//! - [`lock`]: the base three-mode re-entrant async reader/writer lock
//! - [`resource`]: the resource-aware lock facade, preparation table, and
//!   shared preparation machinery
//! - [`test_utils`]: shared helpers for unit and integration tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod cancel;
pub mod error;
pub mod lock;
pub mod resource;
pub mod test_utils;

pub use cancel::CancelToken;
pub use error::{Error, ErrorKind};
pub use lock::{LockFlags, ReentrantRwLock};
pub use resource::{
    PreparedMode, ResourceAccess, ResourceLock, ResourceReadGuard,
    ResourceUpgradeableReadGuard, ResourceWriteGuard,
};
