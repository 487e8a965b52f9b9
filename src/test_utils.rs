//! Test utilities for preplock.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - A block-on executor for driving futures on test threads
//! - Polling helpers
//! - Test types for resource-lock tests
//!
//! # Example
//! ```
//! use preplock::test_utils::{block_on, init_test_logging};
//!
//! init_test_logging();
//! let out = block_on(async { 2 + 2 });
//! assert_eq!(out, 4);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind};
use crate::lock::LockFlags;
use crate::resource::ResourceAccess;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

// ============================================================================
// Executor helpers
// ============================================================================

struct ThreadWaker(std::thread::Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Runs a future to completion, parking the current thread between polls.
///
/// # Panics
///
/// Panics if the future has not completed after 30 seconds; a test that
/// legitimately needs longer has a bug.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = std::pin::pin!(future);
    let waker = Waker::from(Arc::new(ThreadWaker(std::thread::current())));
    let mut cx = Context::from_waker(&waker);
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(out) => return out,
            Poll::Pending => {
                assert!(
                    Instant::now() < deadline,
                    "future did not complete within 30s"
                );
                std::thread::park_timeout(Duration::from_millis(5));
            }
        }
    }
}

/// Returns a waker that does nothing when woken.
#[must_use]
pub fn noop_waker() -> Waker {
    struct NoopWaker;
    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
        fn wake_by_ref(self: &Arc<Self>) {}
    }
    Waker::from(Arc::new(NoopWaker))
}

/// Polls an unpinned future exactly once with a no-op waker.
pub fn poll_once<F>(fut: &mut F) -> Poll<F::Output>
where
    F: Future + Unpin,
{
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    std::pin::Pin::new(fut).poll(&mut cx)
}

// ============================================================================
// Trigger
// ============================================================================

/// A one-shot signal used to hold a test preparation open until the test
/// decides to let it finish.
#[derive(Clone, Debug)]
pub struct Trigger {
    signal: CancelToken,
}

impl Trigger {
    /// Creates a trigger in the unfired state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: CancelToken::new(),
        }
    }

    /// Fires the trigger, releasing every waiter.
    pub fn fire(&self) {
        self.signal.cancel();
    }

    /// Returns true once the trigger has fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Waits for the trigger, honoring `ct`.
    pub async fn wait(&self, ct: &CancelToken) -> Result<(), Error> {
        let signal = self.signal.clone();
        let ct = ct.clone();
        std::future::poll_fn(move |cx| {
            if ct.is_cancelled() {
                return Poll::Ready(Err(Error::cancelled("wait cancelled")));
            }
            if signal.is_cancelled() {
                return Poll::Ready(Ok(()));
            }
            ct.register(cx.waker());
            signal.register(cx.waker());
            if ct.is_cancelled() {
                return Poll::Ready(Err(Error::cancelled("wait cancelled")));
            }
            if signal.is_cancelled() {
                return Poll::Ready(Ok(()));
            }
            Poll::Pending
        })
        .await
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Scripted resource access
// ============================================================================

/// A resource handed out by [`ScriptedAccess`], counting how it was
/// prepared.
#[derive(Debug)]
pub struct TestResource {
    /// The moniker this resource was fetched for.
    pub name: String,
    /// Completed or started `prepare_concurrent` invocations.
    pub concurrent_preps: AtomicUsize,
    /// Completed or started `prepare_exclusive` invocations.
    pub exclusive_preps: AtomicUsize,
    /// Flags observed by the most recent exclusive preparation.
    pub last_exclusive_flags: Mutex<LockFlags>,
}

/// A deterministic [`ResourceAccess`] for tests.
///
/// Caches resources by moniker (the moniker-level cache is deliberately
/// the access implementation's concern, not the lock's), counts every
/// delegate invocation, and can hold preparations open or fail them on
/// demand.
#[derive(Debug, Default)]
pub struct ScriptedAccess {
    resources: Mutex<HashMap<String, Arc<TestResource>>>,
    fetches: AtomicUsize,
    fail_next_concurrent: AtomicBool,
    concurrent_hold: Mutex<Option<Trigger>>,
    exclusive_hold: Mutex<Option<Trigger>>,
}

impl ScriptedAccess {
    /// Creates an access implementation with no holds and no failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `fetch` invocations so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Returns the cached resource for `name`, if it was ever fetched.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<Arc<TestResource>> {
        self.resources.lock().get(name).cloned()
    }

    /// Drops the cached resource for `name`, releasing the access-side
    /// strong reference.
    pub fn drop_resource(&self, name: &str) {
        self.resources.lock().remove(name);
    }

    /// Makes the next `prepare_concurrent` fail with a preparation error.
    pub fn fail_next_concurrent(&self) {
        self.fail_next_concurrent.store(true, Ordering::SeqCst);
    }

    /// Holds every subsequent `prepare_concurrent` open until the
    /// returned trigger fires.
    pub fn hold_concurrent(&self) -> Trigger {
        let trigger = Trigger::new();
        *self.concurrent_hold.lock() = Some(trigger.clone());
        trigger
    }

    /// Holds every subsequent `prepare_exclusive` open until the returned
    /// trigger fires.
    pub fn hold_exclusive(&self) -> Trigger {
        let trigger = Trigger::new();
        *self.exclusive_hold.lock() = Some(trigger.clone());
        trigger
    }
}

impl ResourceAccess for ScriptedAccess {
    type Moniker = String;
    type Resource = TestResource;

    async fn fetch(
        &self,
        moniker: &Self::Moniker,
        _ct: &CancelToken,
    ) -> Result<Arc<Self::Resource>, Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut resources = self.resources.lock();
        let resource = resources
            .entry(moniker.clone())
            .or_insert_with(|| {
                Arc::new(TestResource {
                    name: moniker.clone(),
                    concurrent_preps: AtomicUsize::new(0),
                    exclusive_preps: AtomicUsize::new(0),
                    last_exclusive_flags: Mutex::new(LockFlags::NONE),
                })
            })
            .clone();
        Ok(resource)
    }

    async fn prepare_concurrent(
        &self,
        resource: &Arc<Self::Resource>,
        ct: &CancelToken,
    ) -> Result<(), Error> {
        resource.concurrent_preps.fetch_add(1, Ordering::SeqCst);
        let hold = self.concurrent_hold.lock().clone();
        if let Some(trigger) = hold {
            trigger.wait(ct).await?;
        }
        if self.fail_next_concurrent.swap(false, Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Preparation)
                .with_context(format!("scripted failure preparing {}", resource.name)));
        }
        Ok(())
    }

    async fn prepare_exclusive(
        &self,
        resource: &Arc<Self::Resource>,
        flags: LockFlags,
        ct: &CancelToken,
    ) -> Result<(), Error> {
        resource.exclusive_preps.fetch_add(1, Ordering::SeqCst);
        *resource.last_exclusive_flags.lock() = flags;
        let hold = self.exclusive_hold.lock().clone();
        if let Some(trigger) = hold {
            trigger.wait(ct).await?;
        }
        Ok(())
    }
}
