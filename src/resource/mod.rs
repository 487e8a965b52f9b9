//! Reader/writer resource lock with resource preparation.
//!
//! [`ResourceLock`] guards not only mutually exclusive access to a
//! critical section but also the *state* of the resources accessed while
//! holding a lock. Resources are fetched by a caller-supplied
//! [`ResourceAccess`] implementation and must be placed into one of two
//! modes — prepared for concurrent reads or prepared for exclusive
//! writes — before callers may touch them. Preparation is asynchronous,
//! may fail, and is expensive; the lock runs each preparation at most
//! once per mode transition and shares its result among all concurrent
//! waiters.
//!
//! # How a resource flows
//!
//! 1. A caller acquires a lock and receives a resource-aware guard.
//! 2. `guard.get_resource(moniker, ct)` fetches the resource and returns
//!    it once a preparation matching the guard's access mode completes.
//! 3. Concurrent callers requesting the same resource join the one
//!    in-flight preparation; each keeps its own cancellation.
//! 4. When the outermost write lock releases, every resource state
//!    becomes unknown again, and resources touched under a surrounding
//!    upgradeable read are re-prepared for concurrent access before the
//!    release completes.
//!
//! # Cancel Safety
//!
//! A caller's token cancels their *join* on a preparation, never the
//! preparation another caller is still waiting on. Only when every joined
//! waiter has cancelled is the underlying work itself cancelled.
//!
//! # Example
//!
//! ```ignore
//! let lock = ResourceLock::new(MyAccess::new());
//! let ct = CancelToken::new();
//!
//! let read = lock.read(&ct).await?;
//! let doc = read.get_resource(&doc_id, &ct).await?;
//! // doc is prepared for concurrent access until a write lock releases.
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::lock::{self, LockEvents, LockFlags, ReentrantRwLock};

pub(crate) mod manager;
pub(crate) mod record;
pub(crate) mod shared;
pub(crate) mod table;

pub use record::PreparedMode;

use manager::{AmbientLock, ResourceManager};

// ============================================================================
// ResourceAccess
// ============================================================================

/// Supplies resources and their mode transitions.
///
/// The lock core caches by resource identity, never by moniker; caching
/// fetches per moniker is this implementation's concern. Preparation
/// delegates receive a token decoupled from any single caller: it fires
/// only when every waiter has lost interest.
///
/// Delegates never receive a lock guard, so they cannot observe or
/// re-enter their caller's lock.
pub trait ResourceAccess: Send + Sync + 'static {
    /// Caller-supplied handle identifying which resource is wanted.
    type Moniker: Clone + Send + Sync + 'static;
    /// The resource object whose access mode is managed by the lock.
    type Resource: Send + Sync + 'static;

    /// Produces the resource identified by `moniker`.
    fn fetch(
        &self,
        moniker: &Self::Moniker,
        ct: &CancelToken,
    ) -> impl Future<Output = Result<Arc<Self::Resource>, Error>> + Send;

    /// Transitions `resource` into the concurrent-access mode.
    fn prepare_concurrent(
        &self,
        resource: &Arc<Self::Resource>,
        ct: &CancelToken,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Transitions `resource` into the exclusive-access mode.
    ///
    /// `flags` is the union of flags across the caller's held locks;
    /// implementations typically consult
    /// [`LockFlags::SKIP_INITIAL_PREPARATION`].
    fn prepare_exclusive(
        &self,
        resource: &Arc<Self::Resource>,
        flags: LockFlags,
        ct: &CancelToken,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

impl<T: ResourceAccess> ResourceAccess for Arc<T> {
    type Moniker = T::Moniker;
    type Resource = T::Resource;

    fn fetch(
        &self,
        moniker: &Self::Moniker,
        ct: &CancelToken,
    ) -> impl Future<Output = Result<Arc<Self::Resource>, Error>> + Send {
        T::fetch(self, moniker, ct)
    }

    fn prepare_concurrent(
        &self,
        resource: &Arc<Self::Resource>,
        ct: &CancelToken,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        T::prepare_concurrent(self, resource, ct)
    }

    fn prepare_exclusive(
        &self,
        resource: &Arc<Self::Resource>,
        flags: LockFlags,
        ct: &CancelToken,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        T::prepare_exclusive(self, resource, flags, ct)
    }
}

// ============================================================================
// ResourceLock
// ============================================================================

/// An async reader/writer lock whose guards hand out prepared resources.
pub struct ResourceLock<A: ResourceAccess> {
    raw: Arc<ReentrantRwLock>,
    manager: Arc<ResourceManager<A>>,
}

impl<A: ResourceAccess> ResourceLock<A> {
    /// Creates a resource lock over the given access implementation.
    #[must_use]
    pub fn new(access: A) -> Self {
        let manager = Arc::new(ResourceManager::new(access));
        let events: Arc<dyn LockEvents> = manager.clone();
        Self {
            raw: Arc::new(ReentrantRwLock::with_events(events)),
            manager,
        }
    }

    /// Acquires a read lock.
    pub async fn read(&self, ct: &CancelToken) -> Result<ResourceReadGuard<A>, Error> {
        let raw = self.raw.read(ct).await?;
        Ok(ResourceReadGuard {
            raw,
            lock: Arc::clone(&self.raw),
            manager: Arc::clone(&self.manager),
        })
    }

    /// Acquires the upgradeable read lock.
    pub async fn upgradeable_read(
        &self,
        flags: LockFlags,
        ct: &CancelToken,
    ) -> Result<ResourceUpgradeableReadGuard<A>, Error> {
        let raw = self.raw.upgradeable_read(flags, ct).await?;
        Ok(ResourceUpgradeableReadGuard {
            raw,
            lock: Arc::clone(&self.raw),
            manager: Arc::clone(&self.manager),
        })
    }

    /// Acquires a write lock.
    pub async fn write(
        &self,
        flags: LockFlags,
        ct: &CancelToken,
    ) -> Result<ResourceWriteGuard<A>, Error> {
        let raw = self.raw.write(flags, ct).await?;
        Ok(ResourceWriteGuard {
            raw,
            lock: Arc::clone(&self.raw),
            manager: Arc::clone(&self.manager),
        })
    }

    /// Forgets every resource's prepared state, so the next access
    /// re-prepares it.
    ///
    /// Requires a held write lock; fails with
    /// [`ErrorKind::InvalidState`](crate::ErrorKind::InvalidState)
    /// otherwise.
    pub fn mark_all_unknown(&self) -> Result<(), Error> {
        self.raw.require_write_held()?;
        self.manager.mark_all_unknown();
        Ok(())
    }

    /// The access mode `resource`'s current (or most recent) preparation
    /// targets; [`PreparedMode::Unknown`] when the lock has no record of
    /// it or its state was invalidated.
    #[must_use]
    pub fn prepared_mode(&self, resource: &Arc<A::Resource>) -> PreparedMode {
        self.manager.prepared_mode(resource)
    }

    /// True while a write lock is held, including retained sticky write
    /// status.
    #[must_use]
    pub fn is_write_held(&self) -> bool {
        self.raw.is_write_held()
    }

    /// True while the upgradeable read lock is held.
    #[must_use]
    pub fn is_upgradeable_read_held(&self) -> bool {
        self.raw.is_upgradeable_read_held()
    }

    /// True while any lock is held in any mode.
    #[must_use]
    pub fn is_any_lock_held(&self) -> bool {
        self.raw.is_any_lock_held()
    }
}

impl<A: ResourceAccess> std::fmt::Debug for ResourceLock<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLock")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

/// Ambient-state capture shared by the guard types. `released` callers
/// get a snapshot that fails the no-lock check downstream.
fn ambient_outside_read(released: bool) -> AmbientLock {
    AmbientLock {
        any_held: !released,
        write_held: false,
        upgradeable_without_write: false,
        aggregate_flags: LockFlags::NONE,
    }
}

fn ambient_owner(lock: &ReentrantRwLock, released: bool) -> AmbientLock {
    let snapshot = lock.state_snapshot();
    AmbientLock {
        any_held: !released,
        write_held: snapshot.write_held,
        upgradeable_without_write: snapshot.upgradeable_held && !snapshot.write_held,
        aggregate_flags: snapshot.aggregate_flags,
    }
}

fn ambient_write(lock: &ReentrantRwLock, released: bool) -> AmbientLock {
    let snapshot = lock.state_snapshot();
    AmbientLock {
        any_held: !released,
        write_held: true,
        upgradeable_without_write: false,
        aggregate_flags: snapshot.aggregate_flags,
    }
}

// ============================================================================
// Guards
// ============================================================================

/// Shared-access guard handing out concurrently-prepared resources.
pub struct ResourceReadGuard<A: ResourceAccess> {
    raw: lock::ReadGuard,
    lock: Arc<ReentrantRwLock>,
    manager: Arc<ResourceManager<A>>,
}

impl<A: ResourceAccess> ResourceReadGuard<A> {
    /// Fetches the resource for `moniker`, prepared for this guard's
    /// access mode.
    pub async fn get_resource(
        &self,
        moniker: &A::Moniker,
        ct: &CancelToken,
    ) -> Result<Arc<A::Resource>, Error> {
        let ambient = if self.raw.owner_side() {
            ambient_owner(&self.lock, false)
        } else {
            ambient_outside_read(false)
        };
        self.manager.get_resource(ambient, moniker, ct).await
    }

    /// Acquires a nested read lock. Always immediate.
    #[must_use]
    pub fn read(&self) -> Self {
        Self {
            raw: self.raw.read(),
            lock: Arc::clone(&self.lock),
            manager: Arc::clone(&self.manager),
        }
    }

    /// Releases the lock. Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl<A: ResourceAccess> std::fmt::Debug for ResourceReadGuard<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceReadGuard")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

/// Upgradeable-read guard: hands out concurrently-prepared resources,
/// records which ones were touched, and upgrades to a nested write lock.
pub struct ResourceUpgradeableReadGuard<A: ResourceAccess> {
    raw: lock::UpgradeableReadGuard,
    lock: Arc<ReentrantRwLock>,
    manager: Arc<ResourceManager<A>>,
}

impl<A: ResourceAccess> ResourceUpgradeableReadGuard<A> {
    fn ambient(&self) -> AmbientLock {
        ambient_owner(&self.lock, self.raw.is_released())
    }

    /// Fetches the resource for `moniker`, prepared for this guard's
    /// current access mode (exclusive while a nested write is held,
    /// concurrent otherwise).
    pub async fn get_resource(
        &self,
        moniker: &A::Moniker,
        ct: &CancelToken,
    ) -> Result<Arc<A::Resource>, Error> {
        self.manager.get_resource(self.ambient(), moniker, ct).await
    }

    /// Tags `resource` as accessed within this upgradeable read, so it is
    /// re-prepared for concurrent access when a nested write releases.
    ///
    /// No-op while a nested write lock is held.
    pub fn mark_accessed(&self, resource: &Arc<A::Resource>) {
        self.manager.mark_accessed(self.ambient(), resource);
    }

    /// Tags every known resource matched by `predicate`; returns whether
    /// any resource was tagged.
    pub fn mark_accessed_matching(&self, predicate: impl Fn(&Arc<A::Resource>) -> bool) -> bool {
        self.manager.mark_accessed_matching(self.ambient(), predicate)
    }

    /// Acquires a nested read lock. Always immediate.
    #[must_use]
    pub fn read(&self) -> ResourceReadGuard<A> {
        ResourceReadGuard {
            raw: self.raw.read(),
            lock: Arc::clone(&self.lock),
            manager: Arc::clone(&self.manager),
        }
    }

    /// Upgrades to a nested write lock, waiting for outside readers to
    /// drain.
    pub async fn write(
        &self,
        flags: LockFlags,
        ct: &CancelToken,
    ) -> Result<ResourceWriteGuard<A>, Error> {
        let raw = self.raw.write(flags, ct).await?;
        Ok(ResourceWriteGuard {
            raw,
            lock: Arc::clone(&self.lock),
            manager: Arc::clone(&self.manager),
        })
    }

    /// True while this upgradeable read carries write status.
    #[must_use]
    pub fn holds_write_status(&self) -> bool {
        self.raw.holds_write_status()
    }

    /// Releases the lock and drives any pending exclusive-release work to
    /// completion.
    pub async fn release(&mut self) -> Result<(), Error> {
        self.raw.release().await
    }
}

impl<A: ResourceAccess> std::fmt::Debug for ResourceUpgradeableReadGuard<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceUpgradeableReadGuard")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

/// Exclusive guard handing out exclusively-prepared resources.
pub struct ResourceWriteGuard<A: ResourceAccess> {
    raw: lock::WriteGuard,
    lock: Arc<ReentrantRwLock>,
    manager: Arc<ResourceManager<A>>,
}

impl<A: ResourceAccess> ResourceWriteGuard<A> {
    fn ambient(&self) -> AmbientLock {
        ambient_write(&self.lock, self.raw.is_released())
    }

    /// Fetches the resource for `moniker`, prepared for exclusive access.
    pub async fn get_resource(
        &self,
        moniker: &A::Moniker,
        ct: &CancelToken,
    ) -> Result<Arc<A::Resource>, Error> {
        self.manager.get_resource(self.ambient(), moniker, ct).await
    }

    /// Tags every known resource matched by `predicate`; returns whether
    /// any resource was tagged.
    pub fn mark_accessed_matching(&self, predicate: impl Fn(&Arc<A::Resource>) -> bool) -> bool {
        self.manager.mark_accessed_matching(self.ambient(), predicate)
    }

    /// Acquires a nested read lock. Always immediate.
    #[must_use]
    pub fn read(&self) -> ResourceReadGuard<A> {
        ResourceReadGuard {
            raw: self.raw.read(),
            lock: Arc::clone(&self.lock),
            manager: Arc::clone(&self.manager),
        }
    }

    /// Acquires a re-entrant nested write lock. Always immediate.
    #[must_use]
    pub fn write(&self, flags: LockFlags) -> Self {
        Self {
            raw: self.raw.nested_write(flags),
            lock: Arc::clone(&self.lock),
            manager: Arc::clone(&self.manager),
        }
    }

    /// Releases the lock; for the outermost write lock this drives the
    /// exclusive-release work (state invalidation and forced concurrent
    /// re-preparation) to completion and returns its outcome.
    pub async fn release(&mut self) -> Result<(), Error> {
        self.raw.release().await
    }
}

impl<A: ResourceAccess> std::fmt::Debug for ResourceWriteGuard<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWriteGuard")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}
