//! Resource preparation bookkeeping.
//!
//! The manager owns the preparation table and the upgradeable-read-accessed
//! set, and decides — for each resource request — whether to start a new
//! preparation, join the one in flight, or chain a successor after it.
//!
//! # Invariants
//!
//! - At most one [`PreparationRecord`] per resource; records are replaced
//!   only under the manager mutex.
//! - Preparations for one resource never overlap: every successor first
//!   observes its predecessor's terminal state through the record chain.
//! - No user code runs and nothing is awaited under the manager mutex;
//!   factories only construct futures there.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind};
use crate::lock::{LockEvents, LockFlags, ReleaseBarrier};
use crate::resource::record::{PreparationRecord, PreparedMode};
use crate::resource::shared::{JoinPreparation, PrepFactory, PrepFuture};
use crate::resource::table::WeakKeyTable;
use crate::resource::ResourceAccess;

/// Snapshot of the lock state associated with the calling guard, captured
/// once before entering the manager mutex.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AmbientLock {
    /// Some lock is held by the caller.
    pub(crate) any_held: bool,
    /// A write lock (or retained sticky write status) is held.
    pub(crate) write_held: bool,
    /// An upgradeable read is held by the caller with no nested write.
    pub(crate) upgradeable_without_write: bool,
    /// Union of flags across the caller's held locks.
    pub(crate) aggregate_flags: LockFlags,
}

struct ManagerState<A: ResourceAccess> {
    table: WeakKeyTable<A::Resource, PreparationRecord>,
    /// Resources fetched under the outermost upgradeable read and not yet
    /// released with it.
    upgradeable_accessed: Vec<Arc<A::Resource>>,
}

/// Per-lock table of preparation records and the decision procedure over
/// them.
pub(crate) struct ResourceManager<A: ResourceAccess> {
    access: Arc<A>,
    state: Mutex<ManagerState<A>>,
}

impl<A: ResourceAccess> ResourceManager<A> {
    pub(crate) fn new(access: A) -> Self {
        Self {
            access: Arc::new(access),
            state: Mutex::new(ManagerState {
                table: WeakKeyTable::new(),
                upgradeable_accessed: Vec::new(),
            }),
        }
    }

    /// Fetches the resource for `moniker` and returns it once prepared for
    /// the caller's access mode.
    pub(crate) async fn get_resource(
        &self,
        ambient: AmbientLock,
        moniker: &A::Moniker,
        ct: &CancelToken,
    ) -> Result<Arc<A::Resource>, Error> {
        if !ambient.any_held {
            return Err(Error::new(ErrorKind::NoLockHeld)
                .with_context("get_resource requires a held lock"));
        }
        // Fetch failures propagate unchanged to the caller.
        let resource = self.access.fetch(moniker, ct).await?;
        let join = {
            let mut st = self.state.lock();
            Self::mark_accessed_locked(&mut st, ambient, &resource);
            self.prepare_locked(&mut st, &resource, ct, false, ambient)
        };
        join.await?;
        Ok(resource)
    }

    /// Tags `resource` as accessed within the current upgradeable read.
    ///
    /// No-op unless an upgradeable read is held without a nested write
    /// lock.
    pub(crate) fn mark_accessed(&self, ambient: AmbientLock, resource: &Arc<A::Resource>) {
        let mut st = self.state.lock();
        Self::mark_accessed_locked(&mut st, ambient, resource);
    }

    fn mark_accessed_locked(
        st: &mut ManagerState<A>,
        ambient: AmbientLock,
        resource: &Arc<A::Resource>,
    ) {
        if !ambient.upgradeable_without_write {
            return;
        }
        if !st
            .upgradeable_accessed
            .iter()
            .any(|r| Arc::ptr_eq(r, resource))
        {
            st.upgradeable_accessed.push(Arc::clone(resource));
        }
    }

    /// Tags every known resource matched by `predicate`.
    ///
    /// Requires a held write or upgradeable read lock; returns whether any
    /// resource was tagged.
    pub(crate) fn mark_accessed_matching(
        &self,
        ambient: AmbientLock,
        predicate: impl Fn(&Arc<A::Resource>) -> bool,
    ) -> bool {
        if !(ambient.write_held || ambient.upgradeable_without_write) {
            return false;
        }
        let mut st = self.state.lock();
        let snapshot = st.table.snapshot();
        let mut tagged = false;
        for (resource, _) in &snapshot {
            if predicate(resource) {
                if !st
                    .upgradeable_accessed
                    .iter()
                    .any(|r| Arc::ptr_eq(r, resource))
                {
                    st.upgradeable_accessed.push(Arc::clone(resource));
                }
                tagged = true;
            }
        }
        tagged
    }

    /// The target mode of `resource`'s current or most recent
    /// preparation; `Unknown` when the lock has no record of it.
    pub(crate) fn prepared_mode(&self, resource: &Arc<A::Resource>) -> PreparedMode {
        self.state
            .lock()
            .table
            .get(resource)
            .map_or(PreparedMode::Unknown, PreparationRecord::target_mode)
    }

    /// Replaces every record with an `Unknown` one whose task drains the
    /// predecessor, so the next access starts a fresh preparation.
    pub(crate) fn mark_all_unknown(&self) {
        let mut st = self.state.lock();
        Self::invalidate_all_locked(&mut st);
    }

    fn invalidate_all_locked(st: &mut ManagerState<A>) {
        let snapshot = st.table.snapshot();
        let count = snapshot.len();
        for (resource, old) in snapshot {
            let predecessor = old.observe();
            let factory: PrepFactory = Box::new(move |_token| {
                Box::pin(async move {
                    // Drain the predecessor; its outcome no longer matters.
                    let _ = predecessor.await;
                    Ok(())
                }) as PrepFuture
            });
            let replacement = PreparationRecord::new(factory, PreparedMode::Unknown, false);
            st.table.insert(&resource, replacement);
        }
        tracing::debug!(resources = count, "all resource states set to unknown");
    }

    /// Builds the delegate that transitions `resource` into `mode`.
    fn delegate(&self, mode: PreparedMode, resource: &Arc<A::Resource>, flags: LockFlags) -> PrepFactory {
        let access = Arc::clone(&self.access);
        let resource = Arc::clone(resource);
        match mode {
            PreparedMode::Concurrent => Box::new(move |token: CancelToken| {
                Box::pin(async move { access.prepare_concurrent(&resource, &token).await })
                    as PrepFuture
            }),
            PreparedMode::Exclusive => Box::new(move |token: CancelToken| {
                Box::pin(async move { access.prepare_exclusive(&resource, flags, &token).await })
                    as PrepFuture
            }),
            PreparedMode::Unknown => unreachable!("no delegate prepares for Unknown"),
        }
    }

    /// Starts, joins, or chains the preparation for `resource` and returns
    /// the task observed by this waiter. Runs under the manager mutex;
    /// the returned future is awaited outside it.
    fn prepare_locked(
        &self,
        st: &mut ManagerState<A>,
        resource: &Arc<A::Resource>,
        ct: &CancelToken,
        force_concurrent: bool,
        ambient: AmbientLock,
    ) -> JoinPreparation {
        let mode = if force_concurrent || !ambient.write_held {
            PreparedMode::Concurrent
        } else {
            PreparedMode::Exclusive
        };
        let can_cancel = !force_concurrent;
        let record = match st.table.get(resource).cloned() {
            None => {
                tracing::debug!(?mode, "starting preparation");
                let record =
                    PreparationRecord::new(self.delegate(mode, resource, ambient.aggregate_flags), mode, can_cancel);
                st.table.insert(resource, record.clone());
                record
            }
            Some(old) if old.target_mode() != mode || old.is_faulted() => {
                tracing::debug!(
                    from = ?old.target_mode(),
                    to = ?mode,
                    faulted = old.is_faulted(),
                    "chaining preparation after predecessor"
                );
                let predecessor = old.observe();
                let delegate = self.delegate(mode, resource, ambient.aggregate_flags);
                let factory: PrepFactory = Box::new(move |token: CancelToken| {
                    Box::pin(async move {
                        // Serialize with the predecessor regardless of how
                        // it ended; the delegate runs fresh.
                        let _ = predecessor.await;
                        delegate(token).await
                    }) as PrepFuture
                });
                let record = PreparationRecord::new(factory, mode, can_cancel);
                st.table.insert(resource, record.clone());
                record
            }
            Some(old) => {
                if let Some(join) = old.try_join(ct) {
                    tracing::trace!(?mode, "joined in-flight preparation");
                    return join;
                }
                // The previous computation was cancelled after all of its
                // waiters abandoned it. Drain it; reuse its outcome if it
                // still managed to complete, otherwise run fresh.
                tracing::debug!(?mode, "reviving abandoned preparation");
                let predecessor = old.observe();
                let delegate = self.delegate(mode, resource, ambient.aggregate_flags);
                let factory: PrepFactory = Box::new(move |token: CancelToken| {
                    Box::pin(async move {
                        match predecessor.await {
                            Ok(()) => Ok(()),
                            Err(_) => delegate(token).await,
                        }
                    }) as PrepFuture
                });
                let record = PreparationRecord::new(factory, mode, can_cancel);
                st.table.insert(resource, record.clone());
                record
            }
        };
        record
            .try_join(ct)
            .expect("freshly stored preparation is joinable")
    }
}

impl<A: ResourceAccess> LockEvents for ResourceManager<A> {
    fn on_exclusive_released(&self, upgradeable_read_still_held: bool) -> ReleaseBarrier {
        let joins: Vec<JoinPreparation> = {
            let mut st = self.state.lock();
            Self::invalidate_all_locked(&mut st);
            if upgradeable_read_still_held && !st.upgradeable_accessed.is_empty() {
                let accessed = st.upgradeable_accessed.clone();
                let never = CancelToken::never();
                let ambient = AmbientLock {
                    any_held: true,
                    write_held: false,
                    upgradeable_without_write: false,
                    aggregate_flags: LockFlags::NONE,
                };
                accessed
                    .iter()
                    .map(|resource| self.prepare_locked(&mut st, resource, &never, true, ambient))
                    .collect()
            } else {
                Vec::new()
            }
        };
        if joins.is_empty() {
            return Box::pin(std::future::ready(Ok(())));
        }
        tracing::debug!(
            resources = joins.len(),
            "re-preparing upgradeable-read resources for concurrent access"
        );
        Box::pin(async move {
            let mut first_error: Option<Error> = None;
            for join in joins {
                if let Err(error) = join.await {
                    tracing::warn!(%error, "forced concurrent re-preparation failed");
                    first_error.get_or_insert(error);
                }
            }
            match first_error {
                None => Ok(()),
                Some(error) => Err(error),
            }
        })
    }

    fn on_upgradeable_read_released(&self) {
        self.state.lock().upgradeable_accessed.clear();
    }
}

impl<A: ResourceAccess> std::fmt::Debug for ResourceManager<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ResourceManager")
            .field("upgradeable_accessed", &st.upgradeable_accessed.len())
            .finish_non_exhaustive()
    }
}
