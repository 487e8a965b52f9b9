//! Shared preparation computations.
//!
//! A [`SharedPreparation`] is one in-flight asynchronous preparation
//! observed by any number of waiters. There is no executor dependency and
//! nothing is spawned: whichever waiter polls first drives the inner
//! future, and the shared waker re-wakes every registered party when the
//! inner future makes progress.
//!
//! # Cancel Safety
//!
//! - Each waiter joins with its own [`CancelToken`]; a waiter's
//!   cancellation (or dropping its join future) detaches that waiter only.
//! - The inner future sees a separate internal token that fires when the
//!   last active waiter detaches before completion, and only if the
//!   computation was created cancellable. After that, [`try_join`] returns
//!   `None` and the computation is *abandoned*.
//! - An abandoned computation keeps its inner future: a successor chained
//!   through [`observe`] drives it to rest, so two preparations for the
//!   same resource never overlap even across abandonment.
//!
//! [`try_join`]: SharedPreparation::try_join
//! [`observe`]: SharedPreparation::observe

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::error::Error;

/// A boxed preparation future.
pub(crate) type PrepFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

/// A boxed factory producing the preparation future from the internal
/// cancellation token.
pub(crate) type PrepFactory = Box<dyn FnOnce(CancelToken) -> PrepFuture + Send>;

// ============================================================================
// Shared state
// ============================================================================

struct Inner {
    /// The inner future; `None` once completed (or while being driven).
    future: Option<PrepFuture>,
    /// Terminal outcome, cloned to every waiter past and future.
    result: Option<Result<(), Error>>,
    /// Set when the last active waiter detached before completion.
    abandoned: bool,
    /// Waiters currently joined and not yet detached or completed.
    active_waiters: usize,
    /// Everybody (joiners and observers) waiting for progress.
    wakers: Vec<Waker>,
    /// A party is currently driving the inner future.
    polling: bool,
    /// The inner future signalled progress while it was being driven.
    woken: bool,
}

struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    fn register(inner: &mut Inner, waker: &Waker) {
        if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
            inner.wakers.push(waker.clone());
        }
    }

    /// Wakes every registered party. Called by the shared waker and on
    /// abandonment, so that observers re-poll and pick up driving.
    fn notify(&self) {
        let wakers = {
            let mut inner = self.inner.lock();
            inner.woken = true;
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Drives the inner future one step on behalf of the calling party.
    ///
    /// At most one party drives at a time; the rest park their wakers and
    /// are woken when the driver observes progress or completion.
    fn poll_complete(this: &Arc<Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let mut future = {
            let mut inner = this.inner.lock();
            if let Some(result) = &inner.result {
                return Poll::Ready(result.clone());
            }
            Self::register(&mut inner, cx.waker());
            if inner.polling {
                return Poll::Pending;
            }
            let Some(future) = inner.future.take() else {
                return Poll::Pending;
            };
            inner.polling = true;
            inner.woken = false;
            future
        };

        // User code runs here, outside the lock.
        let shared_waker = Waker::from(Arc::new(SharedWake(Arc::clone(this))));
        let mut shared_cx = Context::from_waker(&shared_waker);
        let poll = future.as_mut().poll(&mut shared_cx);

        let (outcome, to_wake) = {
            let mut inner = this.inner.lock();
            inner.polling = false;
            match poll {
                Poll::Ready(result) => {
                    inner.result = Some(result.clone());
                    (Poll::Ready(result), std::mem::take(&mut inner.wakers))
                }
                Poll::Pending => {
                    inner.future = Some(future);
                    if inner.woken {
                        // Progress was signalled mid-drive; re-wake everyone
                        // (including the caller) so a driver re-polls.
                        inner.woken = false;
                        (Poll::Pending, std::mem::take(&mut inner.wakers))
                    } else {
                        (Poll::Pending, Vec::new())
                    }
                }
            }
        };
        for waker in to_wake {
            waker.wake();
        }
        outcome
    }
}

struct SharedWake(Arc<SharedState>);

impl Wake for SharedWake {
    fn wake(self: Arc<Self>) {
        self.0.notify();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.notify();
    }
}

// ============================================================================
// SharedPreparation
// ============================================================================

/// One asynchronous preparation shared by any number of waiters.
pub(crate) struct SharedPreparation {
    state: Arc<SharedState>,
    /// Internal token handed to the factory; fires only on abandonment.
    internal: CancelToken,
    /// Whether abandonment can cancel the computation at all.
    can_cancel: bool,
}

impl Clone for SharedPreparation {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            internal: self.internal.clone(),
            can_cancel: self.can_cancel,
        }
    }
}

impl SharedPreparation {
    /// Begins a new shared computation.
    ///
    /// `factory` receives the internal cancellation token and returns the
    /// future to drive. The future is constructed eagerly but not polled
    /// until the first waiter (or observer) drives it.
    pub(crate) fn new(factory: impl FnOnce(CancelToken) -> PrepFuture, can_cancel: bool) -> Self {
        let internal = if can_cancel {
            CancelToken::new()
        } else {
            CancelToken::never()
        };
        let future = factory(internal.clone());
        Self {
            state: Arc::new(SharedState {
                inner: Mutex::new(Inner {
                    future: Some(future),
                    result: None,
                    abandoned: false,
                    active_waiters: 0,
                    wakers: Vec::new(),
                    polling: false,
                    woken: false,
                }),
            }),
            internal,
            can_cancel,
        }
    }

    /// Attempts to register a new waiter.
    ///
    /// Returns `None` if the computation was abandoned (cancelled because
    /// every previous waiter detached). A completed computation is always
    /// joinable and yields the stored outcome, past and future.
    pub(crate) fn try_join(&self, ct: &CancelToken) -> Option<JoinPreparation> {
        let mut inner = self.state.inner.lock();
        if inner.abandoned {
            return None;
        }
        let joined = inner.result.is_none();
        if joined {
            inner.active_waiters += 1;
        }
        drop(inner);
        Some(JoinPreparation {
            state: Arc::clone(&self.state),
            internal: self.internal.clone(),
            can_cancel: self.can_cancel,
            ct: ct.clone(),
            joined,
            outcome: None,
        })
    }

    /// Returns a passive observer of this computation's terminal state.
    ///
    /// Observers drive the inner future like waiters do, but never count
    /// toward abandonment. Used to chain a successor preparation after
    /// this one has run to rest.
    pub(crate) fn observe(&self) -> ObservePreparation {
        ObservePreparation {
            state: Arc::clone(&self.state),
        }
    }

    /// True once the inner future has produced a result.
    pub(crate) fn has_completed(&self) -> bool {
        self.state.inner.lock().result.is_some()
    }

    /// True if the inner future failed with a non-cancellation error.
    pub(crate) fn is_faulted(&self) -> bool {
        matches!(&self.state.inner.lock().result, Some(Err(e)) if !e.is_cancelled())
    }

    /// True if the computation was abandoned or completed cancelled.
    pub(crate) fn is_cancelled(&self) -> bool {
        let inner = self.state.inner.lock();
        inner.abandoned || matches!(&inner.result, Some(Err(e)) if e.is_cancelled())
    }

    /// Number of currently joined, not yet detached waiters.
    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.state.inner.lock().active_waiters
    }
}

impl std::fmt::Debug for SharedPreparation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.state.inner.lock();
        f.debug_struct("SharedPreparation")
            .field("completed", &inner.result.is_some())
            .field("abandoned", &inner.abandoned)
            .field("active_waiters", &inner.active_waiters)
            .field("can_cancel", &self.can_cancel)
            .finish()
    }
}

// ============================================================================
// Join / observe futures
// ============================================================================

/// Future returned by [`SharedPreparation::try_join`].
///
/// Completes with the shared outcome, or with a cancellation error when
/// this waiter's own token fires first. Dropping it before completion
/// detaches the waiter.
pub(crate) struct JoinPreparation {
    state: Arc<SharedState>,
    internal: CancelToken,
    can_cancel: bool,
    ct: CancelToken,
    joined: bool,
    outcome: Option<Result<(), Error>>,
}

impl JoinPreparation {
    fn detach(&mut self) {
        if !self.joined {
            return;
        }
        self.joined = false;
        let abandon = {
            let mut inner = self.state.inner.lock();
            inner.active_waiters -= 1;
            let abandon = self.can_cancel
                && inner.active_waiters == 0
                && inner.result.is_none()
                && !inner.abandoned;
            if abandon {
                inner.abandoned = true;
            }
            abandon
        };
        if abandon {
            tracing::debug!("all waiters detached; cancelling shared preparation");
            self.internal.cancel();
            // Nudge any chained observer to drive the cancelled future.
            self.state.notify();
        }
    }
}

impl Future for JoinPreparation {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = &self.outcome {
            return Poll::Ready(outcome.clone());
        }
        if self.ct.is_cancelled() {
            self.detach();
            let err = Error::cancelled("preparation waiter cancelled");
            self.outcome = Some(Err(err.clone()));
            return Poll::Ready(Err(err));
        }
        self.ct.register(cx.waker());
        match SharedState::poll_complete(&self.state, cx) {
            Poll::Ready(result) => {
                if self.joined {
                    self.joined = false;
                    self.state.inner.lock().active_waiters -= 1;
                }
                self.outcome = Some(result.clone());
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for JoinPreparation {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for JoinPreparation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinPreparation")
            .field("joined", &self.joined)
            .field("done", &self.outcome.is_some())
            .finish()
    }
}

/// Future returned by [`SharedPreparation::observe`].
pub(crate) struct ObservePreparation {
    state: Arc<SharedState>,
}

impl Future for ObservePreparation {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        SharedState::poll_complete(&self.state, cx)
    }
}

impl std::fmt::Debug for ObservePreparation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservePreparation").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopWaker;

    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
        fn wake_by_ref(self: &Arc<Self>) {}
    }

    fn noop_waker() -> Waker {
        Waker::from(Arc::new(NoopWaker))
    }

    fn poll_once<F>(fut: &mut F) -> Poll<F::Output>
    where
        F: Future + Unpin,
    {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    /// A preparation that stays pending until `gate` is cancelled, then
    /// completes with `Ok(())` unless `fail` is set.
    fn gated(gate: &CancelToken, fail: bool, runs: &Arc<AtomicUsize>) -> PrepFactory {
        let gate = gate.clone();
        let runs = Arc::clone(runs);
        Box::new(move |token: CancelToken| {
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                loop {
                    if token.is_cancelled() {
                        return Err(Error::cancelled("preparation cancelled"));
                    }
                    if gate.is_cancelled() {
                        break;
                    }
                    // Park until either token fires.
                    futures_pending(&gate, &token).await;
                }
                if fail {
                    Err(Error::new(ErrorKind::Preparation).with_context("injected"))
                } else {
                    Ok(())
                }
            }) as PrepFuture
        })
    }

    /// Pends once, registering with both tokens.
    async fn futures_pending(a: &CancelToken, b: &CancelToken) {
        let mut first = true;
        std::future::poll_fn(|cx| {
            if first {
                first = false;
                a.register(cx.waker());
                b.register(cx.waker());
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
        .await;
    }

    #[test]
    fn single_waiter_drives_to_completion() {
        let gate = CancelToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let shared = SharedPreparation::new(gated(&gate, false, &runs), true);
        let ct = CancelToken::new();
        let mut join = shared.try_join(&ct).expect("joinable");

        assert!(poll_once(&mut join).is_pending());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        gate.cancel();
        let result = loop {
            if let Poll::Ready(r) = poll_once(&mut join) {
                break r;
            }
        };
        assert!(result.is_ok());
        assert!(shared.has_completed());
    }

    #[test]
    fn completed_result_is_shared_with_late_joiners() {
        let gate = CancelToken::new();
        gate.cancel();
        let runs = Arc::new(AtomicUsize::new(0));
        let shared = SharedPreparation::new(gated(&gate, false, &runs), true);
        let ct = CancelToken::new();
        let mut first = shared.try_join(&ct).expect("joinable");
        while poll_once(&mut first).is_pending() {}

        let mut late = shared.try_join(&ct).expect("completed stays joinable");
        assert!(matches!(poll_once(&mut late), Poll::Ready(Ok(()))));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_waiter_cancelling_does_not_disturb_the_other() {
        let gate = CancelToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let shared = SharedPreparation::new(gated(&gate, false, &runs), true);
        let ct_a = CancelToken::new();
        let ct_b = CancelToken::new();
        let mut a = shared.try_join(&ct_a).expect("joinable");
        let mut b = shared.try_join(&ct_b).expect("joinable");
        assert!(poll_once(&mut a).is_pending());
        assert!(poll_once(&mut b).is_pending());

        ct_a.cancel();
        match poll_once(&mut a) {
            Poll::Ready(Err(e)) => assert!(e.is_cancelled()),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(shared.waiter_count(), 1);

        gate.cancel();
        let result = loop {
            if let Poll::Ready(r) = poll_once(&mut b) {
                break r;
            }
        };
        assert!(result.is_ok());
    }

    #[test]
    fn abandonment_cancels_and_blocks_joining() {
        let gate = CancelToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let shared = SharedPreparation::new(gated(&gate, false, &runs), true);
        let ct = CancelToken::new();
        let mut join = shared.try_join(&ct).expect("joinable");
        assert!(poll_once(&mut join).is_pending());

        drop(join);
        assert!(shared.is_cancelled());
        assert!(shared.try_join(&ct).is_none());

        // A chained observer drives the cancelled future to rest.
        let mut obs = shared.observe();
        let result = loop {
            if let Poll::Ready(r) = poll_once(&mut obs) {
                break r;
            }
        };
        match result {
            Err(e) => assert!(e.is_cancelled()),
            Ok(()) => panic!("expected cancellation outcome"),
        }
    }

    #[test]
    fn non_cancellable_survives_abandonment() {
        let gate = CancelToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let shared = SharedPreparation::new(gated(&gate, false, &runs), false);
        let ct = CancelToken::new();
        let mut join = shared.try_join(&ct).expect("joinable");
        assert!(poll_once(&mut join).is_pending());
        drop(join);

        assert!(!shared.is_cancelled());
        let mut again = shared.try_join(&ct).expect("still joinable");
        gate.cancel();
        let result = loop {
            if let Poll::Ready(r) = poll_once(&mut again) {
                break r;
            }
        };
        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fault_is_cloned_to_every_waiter() {
        let gate = CancelToken::new();
        gate.cancel();
        let runs = Arc::new(AtomicUsize::new(0));
        let shared = SharedPreparation::new(gated(&gate, true, &runs), true);
        let ct = CancelToken::new();
        let mut a = shared.try_join(&ct).expect("joinable");
        let mut b = shared.try_join(&ct).expect("joinable");

        let res_a = loop {
            if let Poll::Ready(r) = poll_once(&mut a) {
                break r;
            }
        };
        let res_b = loop {
            if let Poll::Ready(r) = poll_once(&mut b) {
                break r;
            }
        };
        assert_eq!(res_a.unwrap_err().kind(), ErrorKind::Preparation);
        assert_eq!(res_b.unwrap_err().kind(), ErrorKind::Preparation);
        assert!(shared.is_faulted());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
