//! Cancellation tokens.
//!
//! [`CancelToken`] carries a caller's interest in an operation. Cancellation
//! is a protocol, not a silent drop: cancelling a token wakes every future
//! that registered with it, propagates to child tokens, and is observable
//! through [`CancelToken::is_cancelled`] for cheap polling.
//!
//! # Cancel Safety
//!
//! - `cancel()` is idempotent and may be called from any thread.
//! - Wakers are woken outside the internal lock.
//! - A token created with [`CancelToken::never`] ignores `cancel()`; it is
//!   used for internal work that must run to completion regardless of any
//!   caller's interest.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

/// Shared state behind a cancellation token.
struct TokenState {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// Whether this token can be cancelled at all.
    can_cancel: bool,
    /// Wakers to wake when cancellation fires.
    wakers: Mutex<Vec<Waker>>,
    /// Child tokens cancelled together with this one.
    children: Mutex<Vec<CancelToken>>,
}

/// A cancellation token.
///
/// Tokens are cheap to clone; clones share the same state. Futures that
/// honor a token check [`is_cancelled`](Self::is_cancelled) on every poll
/// and register their waker so that `cancel()` wakes them promptly.
///
/// # Example
///
/// ```
/// use preplock::CancelToken;
///
/// let token = CancelToken::new();
/// let child = token.child();
/// token.cancel();
/// assert!(child.is_cancelled());
/// ```
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    /// Creates a new token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                can_cancel: true,
                wakers: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a token that can never fire.
    ///
    /// `cancel()` on the returned token is a no-op. Used for caller-less
    /// work (forced re-preparation) that must not be interruptible.
    #[must_use]
    pub fn never() -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                can_cancel: false,
                wakers: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Returns true if this token can fire at all.
    #[must_use]
    pub fn can_cancel(&self) -> bool {
        self.state.can_cancel
    }

    /// Requests cancellation.
    ///
    /// Idempotent. Wakes every registered waker and cancels child tokens.
    /// No-op for tokens created with [`CancelToken::never`].
    pub fn cancel(&self) {
        if !self.state.can_cancel {
            return;
        }
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let wakers: Vec<Waker> = std::mem::take(&mut *self.state.wakers.lock());
        let children: Vec<CancelToken> = std::mem::take(&mut *self.state.children.lock());
        for waker in wakers {
            waker.wake();
        }
        for child in children {
            child.cancel();
        }
    }

    /// Creates a child token that is cancelled when this token is.
    ///
    /// Cancelling the child does not affect the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        if self.is_cancelled() {
            child.cancel();
        } else {
            self.state.children.lock().push(child.clone());
            // Re-check: cancel() may have drained children concurrently.
            if self.is_cancelled() {
                child.cancel();
            }
        }
        child
    }

    /// Registers a waker to be woken when this token fires.
    ///
    /// If the token is already cancelled the waker is woken immediately.
    /// A waker that would wake the same task as an already-registered one
    /// is not stored twice.
    pub fn register(&self, waker: &Waker) {
        if !self.state.can_cancel {
            return;
        }
        if self.is_cancelled() {
            waker.wake_by_ref();
            return;
        }
        let mut wakers = self.state.wakers.lock();
        if wakers.iter().any(|w| w.will_wake(waker)) {
            return;
        }
        wakers.push(waker.clone());
        drop(wakers);
        // Lost-wakeup guard for a cancel() racing with registration.
        if self.is_cancelled() {
            waker.wake_by_ref();
        }
    }

    /// Returns a future that completes when this token is cancelled.
    ///
    /// Never completes for tokens created with [`CancelToken::never`].
    #[must_use]
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("can_cancel", &self.state.can_cancel)
            .finish()
    }
}

/// Future returned by [`CancelToken::cancelled`].
#[derive(Debug)]
pub struct Cancelled {
    token: CancelToken,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        self.token.register(cx.waker());
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_is_idempotent_and_observable() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_wakes_registered_wakers() {
        let token = CancelToken::new();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        token.register(&waker);
        token.register(&waker); // deduplicated
        token.cancel();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_is_born_cancelled() {
        let parent = CancelToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn never_token_ignores_cancel() {
        let token = CancelToken::never();
        token.cancel();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancelled_future_completes_on_cancel() {
        let token = CancelToken::new();
        let mut fut = token.cancelled();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        token.cancel();
        assert!(counter.0.load(Ordering::SeqCst) >= 1);
        assert!(Pin::new(&mut fut).poll(&mut cx).is_ready());
    }
}
