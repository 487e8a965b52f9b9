//! Three-mode re-entrant async reader/writer lock.
//!
//! [`ReentrantRwLock`] is the base lock the resource layer is built over.
//! It offers three modes:
//!
//! - **Read**: many concurrent holders.
//! - **Upgradeable read**: one holder, concurrent with readers, able to
//!   upgrade to a nested write lock.
//! - **Write**: one holder, exclusive.
//!
//! Re-entrancy is structural: nested locks are acquired through guard
//! methods ([`UpgradeableReadGuard::write`], [`WriteGuard::nested_write`],
//! `read()` on every guard), never through ambient state.
//!
//! # Fairness
//!
//! Writer-preference: while a writer is waiting, new top-level read
//! requests block until the writer has acquired and released. Nested
//! acquisitions by a current holder are always granted immediately and
//! cannot deadlock against their own chain.
//!
//! # Release hooks and the release barrier
//!
//! The lock is constructed with a [`LockEvents`] listener. When the
//! outermost write lock releases, the listener's
//! [`on_exclusive_released`](LockEvents::on_exclusive_released) future
//! becomes the *release barrier*: no new acquisition is granted until it
//! has run to completion. The barrier is driven cooperatively — by
//! [`WriteGuard::release`] when the holder awaits it, and by the acquire
//! futures of whoever shows up next otherwise.
//!
//! # Cancel Safety
//!
//! Acquisition is cancel-safe: cancelling the caller's [`CancelToken`]
//! (or dropping the acquire future) while waiting removes the waiter and
//! acquires nothing. Once acquired, guards always release on drop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind};

// ============================================================================
// LockFlags
// ============================================================================

/// Modifiers carried by upgradeable-read and write locks.
///
/// Flags accumulate across a nesting: [`ReentrantRwLock::aggregate_flags`]
/// returns the union over every lock currently held.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct LockFlags(u8);

impl LockFlags {
    /// No modifiers.
    pub const NONE: Self = Self(0);
    /// An upgradeable read retains write status once a nested write lock
    /// has been issued, releasing it (and firing the exclusive-release
    /// hook) only when the upgradeable read itself releases.
    pub const STICKY_WRITE: Self = Self(1);
    /// Consulted by preparation delegates only; the lock carries it
    /// through [`ReentrantRwLock::aggregate_flags`] but does not act on it.
    pub const SKIP_INITIAL_PREPARATION: Self = Self(1 << 1);

    /// Returns true if every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of both flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for LockFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for LockFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl std::fmt::Debug for LockFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut first = true;
        let mut emit = |name: &str, f: &mut std::fmt::Formatter<'_>| -> std::fmt::Result {
            if !first {
                write!(f, " | ")?;
            }
            first = false;
            write!(f, "{name}")
        };
        if self.contains(Self::STICKY_WRITE) {
            emit("STICKY_WRITE", f)?;
        }
        if self.contains(Self::SKIP_INITIAL_PREPARATION) {
            emit("SKIP_INITIAL_PREPARATION", f)?;
        }
        Ok(())
    }
}

// ============================================================================
// LockEvents
// ============================================================================

/// The release-barrier future returned by [`LockEvents::on_exclusive_released`].
pub type ReleaseBarrier = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

/// Listener for lock release transitions.
///
/// The exclusive hook runs while the lock internally blocks new entrants;
/// its returned future must complete before the next acquisition is
/// granted.
pub trait LockEvents: Send + Sync + 'static {
    /// Called once after the outermost write lock has released.
    ///
    /// `upgradeable_read_still_held` is true when the write lock was
    /// nested inside an upgradeable read that remains held.
    fn on_exclusive_released(&self, upgradeable_read_still_held: bool) -> ReleaseBarrier;

    /// Called once after the outermost upgradeable read lock has released.
    fn on_upgradeable_read_released(&self);
}

/// One-mutex-acquisition view of the lock state, consumed by the
/// resource layer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StateSnapshot {
    pub(crate) write_held: bool,
    pub(crate) upgradeable_held: bool,
    pub(crate) aggregate_flags: LockFlags,
}

/// A listener that does nothing. Used when the lock stands alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl LockEvents for NoEvents {
    fn on_exclusive_released(&self, _upgradeable_read_still_held: bool) -> ReleaseBarrier {
        Box::pin(std::future::ready(Ok(())))
    }

    fn on_upgradeable_read_released(&self) {}
}

// ============================================================================
// Lock state
// ============================================================================

struct LockState {
    /// Read guards outside the exclusive chain (top-level readers and
    /// their nested reads).
    outside_readers: usize,
    /// Read guards nested inside the upgradeable/write chain. These never
    /// block their own holder's write acquisition.
    owner_reads: usize,
    upgradeable_held: bool,
    upgradeable_flags: LockFlags,
    /// Write status retained by a sticky upgradeable read after its
    /// nested write released.
    sticky_write: bool,
    write_depth: usize,
    write_flags: Vec<LockFlags>,
    write_from_upgradeable: bool,
    /// Writers (top-level or upgrading) currently waiting. While nonzero,
    /// new top-level readers block.
    write_waiters: usize,
    /// Post-exclusive-release work that must finish before the next grant.
    barrier: Option<ReleaseBarrier>,
    barrier_active: bool,
    wakers: Vec<Waker>,
}

impl LockState {
    fn register(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }
}

struct Shared {
    state: Mutex<LockState>,
    events: Arc<dyn LockEvents>,
}

impl Shared {
    fn wake_all(&self) {
        let wakers = std::mem::take(&mut self.state.lock().wakers);
        for waker in wakers {
            waker.wake();
        }
    }

    /// Drives the parked release barrier, if any.
    ///
    /// Returns `Ready` once no barrier is active. A barrier error is
    /// surfaced to the driver; everyone else observes only completion.
    fn poll_barrier(&self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let mut barrier = {
            let mut st = self.state.lock();
            if !st.barrier_active {
                return Poll::Ready(Ok(()));
            }
            match st.barrier.take() {
                Some(barrier) => barrier,
                None => {
                    // Another party is driving it right now.
                    st.register(cx.waker());
                    return Poll::Pending;
                }
            }
        };
        match barrier.as_mut().poll(cx) {
            Poll::Ready(result) => {
                tracing::trace!("release barrier completed");
                {
                    let mut st = self.state.lock();
                    st.barrier_active = false;
                }
                self.wake_all();
                Poll::Ready(result)
            }
            Poll::Pending => {
                let mut st = self.state.lock();
                st.barrier = Some(barrier);
                st.register(cx.waker());
                Poll::Pending
            }
        }
    }

    fn release_read(&self, owner_side: bool) {
        {
            let mut st = self.state.lock();
            if owner_side {
                st.owner_reads -= 1;
            } else {
                st.outside_readers -= 1;
            }
        }
        self.wake_all();
    }

    fn release_write(&self, from_upgradeable: bool) {
        let upgradeable_still_held;
        {
            let mut st = self.state.lock();
            st.write_flags.pop();
            st.write_depth -= 1;
            if st.write_depth > 0 {
                return;
            }
            if from_upgradeable
                && st.upgradeable_held
                && st.upgradeable_flags.contains(LockFlags::STICKY_WRITE)
            {
                // Write status stays with the sticky upgradeable read; the
                // exclusive-release hook fires when that read releases.
                st.sticky_write = true;
                tracing::trace!("write released into sticky upgradeable read");
                return;
            }
            st.barrier_active = true;
            upgradeable_still_held = st.upgradeable_held;
        }
        tracing::trace!(
            upgradeable_read_still_held = upgradeable_still_held,
            "outermost write released; installing release barrier"
        );
        let barrier = self.events.on_exclusive_released(upgradeable_still_held);
        self.state.lock().barrier = Some(barrier);
        self.wake_all();
    }

    fn release_upgradeable(&self) {
        let fire_exclusive;
        {
            let mut st = self.state.lock();
            fire_exclusive = st.sticky_write;
            st.sticky_write = false;
            st.upgradeable_held = false;
            st.upgradeable_flags = LockFlags::NONE;
            if fire_exclusive {
                st.barrier_active = true;
            }
        }
        if fire_exclusive {
            tracing::trace!("sticky upgradeable read released; running exclusive-release hook");
            let barrier = self.events.on_exclusive_released(false);
            self.state.lock().barrier = Some(barrier);
        }
        self.events.on_upgradeable_read_released();
        self.wake_all();
    }

    /// Awaits the release barrier, surfacing its error to the caller.
    async fn drive_barrier(&self) -> Result<(), Error> {
        std::future::poll_fn(|cx| self.poll_barrier(cx)).await
    }
}

// ============================================================================
// Acquire futures
// ============================================================================

struct AcquireRead {
    shared: Arc<Shared>,
    ct: CancelToken,
}

impl Future for AcquireRead {
    type Output = Result<ReadGuard, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.ct.is_cancelled() {
            return Poll::Ready(Err(Error::cancelled("read lock acquisition cancelled")));
        }
        self.ct.register(cx.waker());
        if self.shared.poll_barrier(cx).is_pending() {
            return Poll::Pending;
        }
        let mut st = self.shared.state.lock();
        if !st.barrier_active
            && st.write_depth == 0
            && !st.sticky_write
            && st.write_waiters == 0
        {
            st.outside_readers += 1;
            drop(st);
            return Poll::Ready(Ok(ReadGuard {
                shared: Arc::clone(&self.shared),
                owner_side: false,
                released: false,
            }));
        }
        st.register(cx.waker());
        Poll::Pending
    }
}

struct AcquireUpgradeable {
    shared: Arc<Shared>,
    ct: CancelToken,
    flags: LockFlags,
}

impl Future for AcquireUpgradeable {
    type Output = Result<UpgradeableReadGuard, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.ct.is_cancelled() {
            return Poll::Ready(Err(Error::cancelled(
                "upgradeable read lock acquisition cancelled",
            )));
        }
        self.ct.register(cx.waker());
        if self.shared.poll_barrier(cx).is_pending() {
            return Poll::Pending;
        }
        let mut st = self.shared.state.lock();
        if !st.barrier_active
            && !st.upgradeable_held
            && st.write_depth == 0
            && !st.sticky_write
            && st.write_waiters == 0
        {
            st.upgradeable_held = true;
            st.upgradeable_flags = self.flags;
            drop(st);
            return Poll::Ready(Ok(UpgradeableReadGuard {
                shared: Arc::clone(&self.shared),
                released: false,
            }));
        }
        st.register(cx.waker());
        Poll::Pending
    }
}

struct AcquireWrite {
    shared: Arc<Shared>,
    ct: CancelToken,
    flags: LockFlags,
    from_upgradeable: bool,
    /// Whether this waiter is currently counted in `write_waiters`.
    counted: bool,
    done: bool,
}

impl AcquireWrite {
    fn grant(&mut self, st: &mut LockState) -> WriteGuard {
        if self.counted {
            st.write_waiters -= 1;
            self.counted = false;
        }
        self.done = true;
        st.write_depth += 1;
        st.write_flags.push(self.flags);
        st.write_from_upgradeable = self.from_upgradeable;
        WriteGuard {
            shared: Arc::clone(&self.shared),
            from_upgradeable: self.from_upgradeable,
            released: false,
        }
    }

    fn pend(&mut self, st: &mut LockState, cx: &Context<'_>) {
        if !self.counted {
            st.write_waiters += 1;
            self.counted = true;
        }
        st.register(cx.waker());
    }
}

impl Future for AcquireWrite {
    type Output = Result<WriteGuard, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.ct.is_cancelled() {
            if self.counted {
                let shared = Arc::clone(&self.shared);
                let mut st = shared.state.lock();
                st.write_waiters -= 1;
                self.counted = false;
                drop(st);
                shared.wake_all();
            }
            self.done = true;
            return Poll::Ready(Err(Error::cancelled("write lock acquisition cancelled")));
        }
        self.ct.register(cx.waker());
        if self.shared.poll_barrier(cx).is_pending() {
            return Poll::Pending;
        }
        let this = &mut *self;
        let shared = Arc::clone(&this.shared);
        let mut st = shared.state.lock();
        if st.barrier_active {
            this.pend(&mut st, cx);
            return Poll::Pending;
        }
        if this.from_upgradeable {
            // Re-entrant within the exclusive chain: always immediate.
            if st.sticky_write || (st.write_depth > 0 && st.write_from_upgradeable) {
                return Poll::Ready(Ok(this.grant(&mut st)));
            }
            if st.write_depth == 0 && st.outside_readers == 0 {
                return Poll::Ready(Ok(this.grant(&mut st)));
            }
        } else if st.write_depth == 0
            && !st.sticky_write
            && !st.upgradeable_held
            && st.outside_readers == 0
        {
            return Poll::Ready(Ok(this.grant(&mut st)));
        }
        this.pend(&mut st, cx);
        Poll::Pending
    }
}

impl Drop for AcquireWrite {
    fn drop(&mut self) {
        if self.counted && !self.done {
            self.shared.state.lock().write_waiters -= 1;
            self.shared.wake_all();
        }
    }
}

// ============================================================================
// Guards
// ============================================================================

/// Shared-access guard. Releases on drop.
pub struct ReadGuard {
    shared: Arc<Shared>,
    owner_side: bool,
    released: bool,
}

impl ReadGuard {
    /// Acquires a nested read lock. Always immediate.
    #[must_use]
    pub fn read(&self) -> Self {
        let mut st = self.shared.state.lock();
        if self.owner_side {
            st.owner_reads += 1;
        } else {
            st.outside_readers += 1;
        }
        drop(st);
        Self {
            shared: Arc::clone(&self.shared),
            owner_side: self.owner_side,
            released: false,
        }
    }

    /// Releases the lock. Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }

    /// True if this guard was issued inside an upgradeable-read or write
    /// nesting.
    pub(crate) const fn owner_side(&self) -> bool {
        self.owner_side
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release_read(self.owner_side);
        }
    }
}

impl std::fmt::Debug for ReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadGuard")
            .field("owner_side", &self.owner_side)
            .finish()
    }
}

/// Upgradeable-read guard: concurrent with readers, upgradeable to a
/// nested write lock. Releases on drop.
pub struct UpgradeableReadGuard {
    shared: Arc<Shared>,
    released: bool,
}

impl UpgradeableReadGuard {
    /// Acquires a nested read lock. Always immediate.
    #[must_use]
    pub fn read(&self) -> ReadGuard {
        let mut st = self.shared.state.lock();
        st.owner_reads += 1;
        drop(st);
        ReadGuard {
            shared: Arc::clone(&self.shared),
            owner_side: true,
            released: false,
        }
    }

    /// Upgrades to a nested write lock, waiting for outside readers to
    /// drain. While waiting, new top-level readers are blocked.
    pub async fn write(&self, flags: LockFlags, ct: &CancelToken) -> Result<WriteGuard, Error> {
        AcquireWrite {
            shared: Arc::clone(&self.shared),
            ct: ct.clone(),
            flags,
            from_upgradeable: true,
            counted: false,
            done: false,
        }
        .await
    }

    /// True while this upgradeable read carries write status: a nested
    /// write lock is outstanding, or a sticky write was retained.
    #[must_use]
    pub fn holds_write_status(&self) -> bool {
        let st = self.shared.state.lock();
        st.sticky_write || (st.write_depth > 0 && st.write_from_upgradeable)
    }

    /// Releases the lock and drives any release barrier to completion.
    pub async fn release(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.shared.release_upgradeable();
        self.shared.drive_barrier().await
    }

    pub(crate) const fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for UpgradeableReadGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release_upgradeable();
        }
    }
}

impl std::fmt::Debug for UpgradeableReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeableReadGuard")
            .field("holds_write_status", &self.holds_write_status())
            .finish()
    }
}

/// Exclusive guard. Releases on drop.
///
/// When the outermost write lock releases, the lock's [`LockEvents`]
/// exclusive hook runs and its future gates every subsequent acquisition.
/// Prefer [`release`](Self::release) over dropping: it drives that work to
/// completion and surfaces its outcome.
pub struct WriteGuard {
    shared: Arc<Shared>,
    from_upgradeable: bool,
    released: bool,
}

impl WriteGuard {
    /// Acquires a nested read lock. Always immediate.
    #[must_use]
    pub fn read(&self) -> ReadGuard {
        let mut st = self.shared.state.lock();
        st.owner_reads += 1;
        drop(st);
        ReadGuard {
            shared: Arc::clone(&self.shared),
            owner_side: true,
            released: false,
        }
    }

    /// Acquires a re-entrant nested write lock. Always immediate.
    #[must_use]
    pub fn nested_write(&self, flags: LockFlags) -> Self {
        let mut st = self.shared.state.lock();
        st.write_depth += 1;
        st.write_flags.push(flags);
        drop(st);
        Self {
            shared: Arc::clone(&self.shared),
            from_upgradeable: self.from_upgradeable,
            released: false,
        }
    }

    /// Releases the lock; for the outermost write lock this also drives
    /// the exclusive-release work to completion and returns its outcome.
    pub async fn release(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.shared.release_write(self.from_upgradeable);
        self.shared.drive_barrier().await
    }

    pub(crate) const fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release_write(self.from_upgradeable);
        }
    }
}

impl std::fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteGuard")
            .field("from_upgradeable", &self.from_upgradeable)
            .finish()
    }
}

// ============================================================================
// ReentrantRwLock
// ============================================================================

/// A three-mode re-entrant async reader/writer lock with release hooks.
///
/// # Example
///
/// ```
/// use preplock::lock::{LockFlags, ReentrantRwLock};
/// use preplock::CancelToken;
///
/// # preplock::test_utils::block_on(async {
/// let lock = ReentrantRwLock::new();
/// let ct = CancelToken::new();
///
/// let upgradeable = lock.upgradeable_read(LockFlags::NONE, &ct).await?;
/// let mut write = upgradeable.write(LockFlags::NONE, &ct).await?;
/// write.release().await?;
/// # drop(upgradeable);
/// # Ok::<(), preplock::Error>(())
/// # }).unwrap();
/// ```
pub struct ReentrantRwLock {
    shared: Arc<Shared>,
}

impl ReentrantRwLock {
    /// Creates a lock with no release listener.
    #[must_use]
    pub fn new() -> Self {
        Self::with_events(Arc::new(NoEvents))
    }

    /// Creates a lock that reports release transitions to `events`.
    #[must_use]
    pub fn with_events(events: Arc<dyn LockEvents>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LockState {
                    outside_readers: 0,
                    owner_reads: 0,
                    upgradeable_held: false,
                    upgradeable_flags: LockFlags::NONE,
                    sticky_write: false,
                    write_depth: 0,
                    write_flags: Vec::new(),
                    write_from_upgradeable: false,
                    write_waiters: 0,
                    barrier: None,
                    barrier_active: false,
                    wakers: Vec::new(),
                }),
                events,
            }),
        }
    }

    /// Acquires a top-level read lock.
    pub async fn read(&self, ct: &CancelToken) -> Result<ReadGuard, Error> {
        AcquireRead {
            shared: Arc::clone(&self.shared),
            ct: ct.clone(),
        }
        .await
    }

    /// Tries to acquire a read lock without waiting.
    #[must_use]
    pub fn try_read(&self) -> Option<ReadGuard> {
        let mut st = self.shared.state.lock();
        if !st.barrier_active && st.write_depth == 0 && !st.sticky_write && st.write_waiters == 0 {
            st.outside_readers += 1;
            drop(st);
            Some(ReadGuard {
                shared: Arc::clone(&self.shared),
                owner_side: false,
                released: false,
            })
        } else {
            None
        }
    }

    /// Acquires the upgradeable read lock. At most one holder at a time.
    pub async fn upgradeable_read(
        &self,
        flags: LockFlags,
        ct: &CancelToken,
    ) -> Result<UpgradeableReadGuard, Error> {
        AcquireUpgradeable {
            shared: Arc::clone(&self.shared),
            ct: ct.clone(),
            flags,
        }
        .await
    }

    /// Acquires a top-level write lock.
    ///
    /// Taking a write lock while holding only a plain read lock is not
    /// supported; acquire an upgradeable read and upgrade instead.
    pub async fn write(&self, flags: LockFlags, ct: &CancelToken) -> Result<WriteGuard, Error> {
        AcquireWrite {
            shared: Arc::clone(&self.shared),
            ct: ct.clone(),
            flags,
            from_upgradeable: false,
            counted: false,
            done: false,
        }
        .await
    }

    /// True while a write lock is held, including retained sticky write
    /// status.
    #[must_use]
    pub fn is_write_held(&self) -> bool {
        let st = self.shared.state.lock();
        st.write_depth > 0 || st.sticky_write
    }

    /// True while the upgradeable read lock is held.
    #[must_use]
    pub fn is_upgradeable_read_held(&self) -> bool {
        self.shared.state.lock().upgradeable_held
    }

    /// True while any lock is held in any mode.
    #[must_use]
    pub fn is_any_lock_held(&self) -> bool {
        let st = self.shared.state.lock();
        st.outside_readers > 0
            || st.owner_reads > 0
            || st.upgradeable_held
            || st.write_depth > 0
            || st.sticky_write
    }

    /// The union of flags across every held upgradeable-read and write
    /// lock.
    #[must_use]
    pub fn aggregate_flags(&self) -> LockFlags {
        let st = self.shared.state.lock();
        let mut flags = LockFlags::NONE;
        if st.upgradeable_held || st.sticky_write {
            flags |= st.upgradeable_flags;
        }
        for nested in &st.write_flags {
            flags |= *nested;
        }
        flags
    }

    /// Captures the lock-state facts the resource layer needs, in one
    /// mutex acquisition.
    pub(crate) fn state_snapshot(&self) -> StateSnapshot {
        let st = self.shared.state.lock();
        let write_held = st.write_depth > 0 || st.sticky_write;
        let mut aggregate_flags = LockFlags::NONE;
        if st.upgradeable_held || st.sticky_write {
            aggregate_flags |= st.upgradeable_flags;
        }
        for nested in &st.write_flags {
            aggregate_flags |= *nested;
        }
        StateSnapshot {
            write_held,
            upgradeable_held: st.upgradeable_held,
            aggregate_flags,
        }
    }

    /// Error helper for operations that require a write lock.
    pub(crate) fn require_write_held(&self) -> Result<(), Error> {
        if self.is_write_held() {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::InvalidState)
                .with_context("operation requires a held write lock"))
        }
    }
}

impl Default for ReentrantRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReentrantRwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("ReentrantRwLock")
            .field("outside_readers", &st.outside_readers)
            .field("owner_reads", &st.owner_reads)
            .field("upgradeable_held", &st.upgradeable_held)
            .field("write_depth", &st.write_depth)
            .field("sticky_write", &st.sticky_write)
            .field("write_waiters", &st.write_waiters)
            .field("barrier_active", &st.barrier_active)
            .finish()
    }
}
