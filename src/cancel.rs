//! Cooperative cancellation signal.
//!
//! A [`CancellationToken`] is handed to a promise so that waiters can give up
//! early, and to the computation so that it can stop early if it wants to.
//! Cancelling never interrupts a running computation by itself.
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use crate::wakers::WakerList;

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// [`CancellationToken::cancel`] was called on the token or a parent.
    Canceled,
    /// The token's deadline passed.
    DeadlineExceeded,
}

/// A shareable cancellation signal. Clones observe and control the same
/// signal.
///
/// # Examples
///
/// ```
/// use promise_future::{CancelReason, CancellationToken};
///
/// let token = CancellationToken::new();
/// let child = token.child_token();
/// token.cancel();
/// assert_eq!(child.reason(), Some(CancelReason::Canceled));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    deadline: Option<Instant>,
    /// Present when `deadline` is set.
    timer: Option<Arc<DeadlineTimer>>,
}

#[derive(Debug, Default)]
struct State {
    reason: Option<CancelReason>,
    wakers: WakerList,
    children: Vec<Weak<Inner>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Inner {
    /// The timer thread only holds a `Weak`, so it has to be told when the
    /// last handle goes away.
    fn drop(&mut self) {
        if let Some(timer) = &self.timer {
            timer.stop();
        }
    }
}

/// Shared between a deadline token and its timer thread.
#[derive(Debug, Default)]
struct DeadlineTimer {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl DeadlineTimer {
    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        self.wake.notify_all();
    }

    /// Sleeps until `deadline` or until stopped. Returns true if the deadline
    /// was reached first.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let timeout = deadline.saturating_duration_since(Instant::now());
        let stopped = self.stopped.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (_stopped, result) = self
            .wake
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        result.timed_out()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that cancels itself with [`CancelReason::DeadlineExceeded`]
    /// once `deadline` has passed.
    pub fn with_deadline(deadline: Instant) -> Self {
        let token = Self::with_inner(Some(deadline));
        token.watch_deadline(deadline);
        token
    }

    /// Shorthand for [`with_deadline`](Self::with_deadline) `timeout` from now.
    /// A timeout too large to represent never expires.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    fn with_inner(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::default(),
                deadline,
                timer: deadline.map(|_| Arc::default()),
            }),
        }
    }

    /// Returns a token that is cancelled whenever `self` is, with the same
    /// reason. Cancelling the child leaves `self` alone.
    pub fn child_token(&self) -> Self {
        // The child may outlive every handle to the parent, so it watches the
        // inherited deadline itself.
        let child = Self::with_inner(self.inner.deadline);
        if let Some(deadline) = self.inner.deadline {
            child.watch_deadline(deadline);
        }
        let mut state = self.inner.lock();
        let reason = state.reason;
        match reason {
            Some(reason) => {
                drop(state);
                child.cancel_with(reason);
            }
            None => {
                state.children.retain(|c| c.strong_count() > 0);
                state.children.push(Arc::downgrade(&child.inner));
            }
        }
        child
    }

    /// Cancels the token and its children. Only the first cancellation counts.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Canceled)
    }

    fn cancel_with(&self, reason: CancelReason) {
        let (wakers, children) = {
            let mut state = self.inner.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason);
            (state.wakers.take(), std::mem::take(&mut state.children))
        };
        if let Some(timer) = &self.inner.timer {
            timer.stop();
        }
        for waker in wakers {
            waker.wake()
        }
        for child in children.into_iter().filter_map(|c| c.upgrade()) {
            CancellationToken { inner: child }.cancel_with(reason);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Why the token was cancelled, or `None` while it is still live.
    pub fn reason(&self) -> Option<CancelReason> {
        if let Some(reason) = self.inner.lock().reason {
            return Some(reason);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.cancel_with(CancelReason::DeadlineExceeded);
                self.inner.lock().reason
            }
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Completes once the token is cancelled.
    pub fn cancelled(&self) -> Cancelled<'_> {
        Cancelled {
            token: self,
            key: None,
        }
    }

    /// Returns the reason, or registers `cx`'s waker under `key` to be woken
    /// on cancellation.
    pub(crate) fn poll_cancelled(
        &self,
        cx: &mut Context<'_>,
        key: &mut Option<usize>,
    ) -> Poll<CancelReason> {
        if let Some(reason) = self.reason() {
            return Poll::Ready(reason);
        }
        let mut state = self.inner.lock();
        if let Some(reason) = state.reason {
            return Poll::Ready(reason);
        }
        state.wakers.register(key, cx.waker());
        Poll::Pending
    }

    /// Drops the registration made under `key` by `poll_cancelled`.
    pub(crate) fn deregister(&self, key: usize) {
        self.inner.lock().wakers.remove(key);
    }

    #[cfg(test)]
    pub(crate) fn registered_wakers(&self) -> usize {
        self.inner.lock().wakers.len()
    }

    fn watch_deadline(&self, deadline: Instant) {
        let Some(timer) = self.inner.timer.clone() else {
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("promise-deadline".into())
            .spawn(move || {
                if !timer.sleep_until(deadline) {
                    return;
                }
                if let Some(inner) = inner.upgrade() {
                    CancellationToken { inner }.cancel_with(CancelReason::DeadlineExceeded);
                }
            });
        if let Err(err) = spawned {
            // Without the timer the deadline is only noticed when the token
            // is queried or polled, so a waiter that is already blocked is
            // not woken when it passes.
            log::warn!("failed to start deadline timer: {err}");
        }
    }
}

/// Future returned by [`CancellationToken::cancelled`].
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Cancelled<'a> {
    token: &'a CancellationToken,
    key: Option<usize>,
}

impl Future for Cancelled<'_> {
    type Output = CancelReason;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        this.token.poll_cancelled(cx, &mut this.key)
    }
}

impl Drop for Cancelled<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.token.deregister(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelReason, CancellationToken};
    use futures::executor::block_on;
    use futures::task::noop_waker;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::Context;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_cancel_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);
        token.cancel();
        token.cancel_with(CancelReason::DeadlineExceeded);
        assert_eq!(token.reason(), Some(CancelReason::Canceled));
    }

    #[test]
    fn test_clone_shares_signal() {
        let token = CancellationToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        let grandchild = child.child_token();
        parent.cancel();
        assert_eq!(child.reason(), Some(CancelReason::Canceled));
        assert_eq!(grandchild.reason(), Some(CancelReason::Canceled));

        let late = parent.child_token();
        assert!(late.is_cancelled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_cancelled_wakes_blocked_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let task = thread::spawn(move || block_on(waiter.cancelled()));
        thread::sleep(Duration::from_millis(50));
        token.cancel();
        let reason = task.join().expect("The waiter thread has panicked");
        assert_eq!(reason, CancelReason::Canceled);
    }

    #[test]
    fn test_timeout_fires() {
        let token = CancellationToken::with_timeout(Duration::from_millis(50));
        assert!(token.deadline().is_some());
        let start = Instant::now();
        assert_eq!(block_on(token.cancelled()), CancelReason::DeadlineExceeded);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_past_deadline_is_cancelled_immediately() {
        let token = CancellationToken::with_deadline(Instant::now());
        assert_eq!(token.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[test]
    fn test_cancel_before_deadline() {
        let token = CancellationToken::with_timeout(Duration::from_secs(60));
        token.cancel();
        assert_eq!(block_on(token.cancelled()), CancelReason::Canceled);
    }

    #[test]
    fn test_child_inherits_deadline() {
        let parent = CancellationToken::with_timeout(Duration::from_millis(30));
        let child = parent.child_token();
        assert_eq!(child.deadline(), parent.deadline());
        assert_eq!(block_on(child.cancelled()), CancelReason::DeadlineExceeded);
    }

    #[test]
    fn test_dropped_deadline_token_stops_timer() {
        let token = CancellationToken::with_timeout(Duration::from_secs(3600));
        let timer = token.inner.timer.clone().expect("deadline tokens carry a timer");
        let inner = Arc::downgrade(&token.inner);
        drop(token);
        assert!(inner.upgrade().is_none());

        // Once the timer thread exits only this clone is left.
        let start = Instant::now();
        while Arc::strong_count(&timer) > 1 {
            assert!(start.elapsed() < Duration::from_secs(5), "deadline timer outlived its token");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_cancel_stops_timer() {
        let token = CancellationToken::with_timeout(Duration::from_secs(3600));
        let timer = token.inner.timer.clone().expect("deadline tokens carry a timer");
        token.cancel();
        let start = Instant::now();
        while Arc::strong_count(&timer) > 2 {
            assert!(start.elapsed() < Duration::from_secs(5), "deadline timer outlived cancellation");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(token.reason(), Some(CancelReason::Canceled));
    }

    #[test]
    fn test_dropped_cancelled_future_deregisters() {
        let token = CancellationToken::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut cancelled = token.cancelled();
        assert!(Pin::new(&mut cancelled).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut cancelled).poll(&mut cx).is_pending());
        assert_eq!(token.registered_wakers(), 1);
        drop(cancelled);
        assert_eq!(token.registered_wakers(), 0);
    }
}
