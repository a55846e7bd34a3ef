// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative-shutdown primitives shared by the service, triggers, and the
//! store-and-forward engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// CancellationToken
// ---------------------------------------------------------------------------

/// A cloneable, cheaply-shareable token used to signal cancellation.
///
/// All clones share the same underlying state; cancelling one
/// immediately makes every clone observe `is_cancelled() == true`.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new token that is **not** cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent — calling more than once is harmless.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` if [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns a future that completes when the token is cancelled.
    ///
    /// If the token is already cancelled the future resolves immediately.
    pub async fn cancelled(&self) {
        // Fast-path: already cancelled.
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WaitGroup
// ---------------------------------------------------------------------------

/// Counts outstanding background workers so shutdown can wait on them.
///
/// Clones share one counter. Workers call [`add`](Self::add) before starting
/// and [`done`](Self::done) when they exit; [`wait`](Self::wait) resolves
/// once the counter reaches zero.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WgInner>,
}

struct WgInner {
    count: std::sync::Mutex<usize>,
    notify: Notify,
}

impl WaitGroup {
    /// Create a wait group with a zero count.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WgInner {
                count: std::sync::Mutex::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Add `n` outstanding workers.
    pub fn add(&self, n: usize) {
        let mut count = self.inner.count.lock().expect("wait group lock poisoned");
        *count += n;
    }

    /// Mark one worker as finished.
    ///
    /// # Panics
    ///
    /// Panics if called more times than [`add`](Self::add) accounted for.
    pub fn done(&self) {
        let mut count = self.inner.count.lock().expect("wait group lock poisoned");
        *count = count
            .checked_sub(1)
            .expect("wait group done() without matching add()");
        if *count == 0 {
            self.inner.notify.notify_waiters();
        }
    }

    /// Current number of outstanding workers.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.inner.count.lock().expect("wait group lock poisoned")
    }

    /// Wait until the counter reaches zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// RetryWindow
// ---------------------------------------------------------------------------

/// A bounded retry window: a total duration plus an interval between
/// attempts.
///
/// Used by connection bring-up loops that should keep trying for a fixed
/// period before giving up with the last error.
pub struct RetryWindow {
    deadline: Instant,
    interval: Duration,
}

impl RetryWindow {
    /// Create a window lasting `duration` with `interval` between attempts.
    #[must_use]
    pub fn new(duration: Duration, interval: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
            interval,
        }
    }

    /// Returns `true` while the window is still open.
    #[must_use]
    pub fn has_not_elapsed(&self) -> bool {
        Instant::now() < self.deadline
    }

    /// Sleep for one interval (never past code that polls the window).
    pub async fn sleep_for_interval(&self) {
        tokio::time::sleep(self.interval).await;
    }
}
