use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;

use futures::executor::block_on;

use crate::cancel::CancellationToken;
use crate::slot::{self, Consumer, Producer};
use crate::Error;

/// Handle to a computation running on its own thread.
///
/// Cloning the handle adds another observer of the same outcome. Dropping
/// every handle does not stop the computation; its result is discarded.
///
/// # Examples
///
/// ```
/// use promise_future::{CancellationToken, Error, Promise};
/// use std::thread;
///
/// let promise = Promise::<u32, String>::spawn(|| Ok(42));
/// let observer = promise.clone();
/// let task = thread::spawn(move || observer.get());
/// assert_eq!(promise.get(), Ok(42));
/// assert_eq!(task.join().unwrap(), Ok(42));
///
/// let token = CancellationToken::new();
/// token.cancel();
/// let promise = Promise::<u32, String>::with_cancellation(token, |_| Ok(42));
/// assert_eq!(promise.wait(), Err(Error::Canceled));
/// ```
pub struct Promise<T, E> {
    consumer: Consumer<T, E>,
    cancellation: Option<CancellationToken>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            consumer: self.consumer.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("finished", &self.is_finished())
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

impl<T, E> Promise<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Starts `computation` on a new thread.
    ///
    /// Never blocks. If the thread cannot be created the promise settles with
    /// [`Error::WorkerLost`]; use [`Builder`](crate::Builder) to get the spawn
    /// error instead.
    pub fn spawn<F>(computation: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        Self::launch_logged(None, move |_| computation())
    }

    /// Starts `computation` on a new thread. [`wait`](Self::wait) and
    /// [`try_wait`](Self::try_wait) stop waiting once `token` is cancelled;
    /// the computation gets the same token and may stop early on its own.
    pub fn with_cancellation<F>(token: CancellationToken, computation: F) -> Self
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
    {
        Self::launch_logged(Some(token), computation)
    }

    fn launch_logged<F>(cancellation: Option<CancellationToken>, computation: F) -> Self
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
    {
        let (promise, spawned) = Self::launch(thread::Builder::new(), cancellation, computation);
        if let Err(err) = spawned {
            log::warn!("failed to spawn promise worker: {err}");
        }
        promise
    }

    pub(crate) fn launch<F>(
        builder: thread::Builder,
        cancellation: Option<CancellationToken>,
        computation: F,
    ) -> (Self, io::Result<()>)
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
    {
        let (producer, consumer) = slot::channel();
        let token = cancellation.clone().unwrap_or_default();
        // On failure the closure is dropped with the producer, which settles
        // the slot with `WorkerLost`.
        let spawned = builder
            .spawn(move || run(producer, token, computation))
            .map(drop);
        (
            Promise {
                consumer,
                cancellation,
            },
            spawned,
        )
    }
}

impl<T, E> Promise<T, E> {
    /// Whether the computation has settled. A cancelled token does not count.
    pub fn is_finished(&self) -> bool {
        self.consumer.is_resolved()
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Future form of [`get`](Self::get).
    pub fn get_async(&self) -> Settled<'_, T, E> {
        Settled {
            consumer: &self.consumer,
            cancellation: None,
            slot_key: None,
            token_key: None,
        }
    }

    /// Future form of [`wait`](Self::wait).
    pub fn wait_async(&self) -> Settled<'_, T, E> {
        Settled {
            consumer: &self.consumer,
            cancellation: self.cancellation.as_ref(),
            slot_key: None,
            token_key: None,
        }
    }
}

impl<T: Clone, E: Clone> Promise<T, E> {
    /// Blocks until the computation settles, ignoring cancellation.
    ///
    /// Blocks forever if the computation never returns.
    pub fn get(&self) -> Result<T, Error<E>> {
        block_on(self.get_async())
    }

    /// Blocks until the computation settles or the cancellation token fires.
    ///
    /// A token that has already fired wins, even if the outcome is available.
    /// Without a token this behaves like [`get`](Self::get).
    pub fn wait(&self) -> Result<T, Error<E>> {
        block_on(self.wait_async())
    }

    /// Non-blocking [`wait`](Self::wait). `None` means the computation is
    /// still running and the token has not fired.
    pub fn try_wait(&self) -> Option<Result<T, Error<E>>> {
        if let Some(reason) = self.cancellation.as_ref().and_then(|c| c.reason()) {
            return Some(Err(reason.into()));
        }
        self.consumer.peek()
    }
}

fn run<T, E, F>(producer: Producer<T, E>, token: CancellationToken, computation: F)
where
    F: FnOnce(&CancellationToken) -> Result<T, E>,
{
    let name = thread::current().name().unwrap_or("<unnamed>").to_owned();
    log::trace!("promise worker '{name}' starting");
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| computation(&token))) {
        Ok(result) => result.map_err(Error::Failed),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::debug!("promise worker '{name}' panicked: {message}");
            Err(Error::Panicked(message))
        }
    };
    producer.resolve(outcome);
    log::trace!("promise worker '{name}' exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::new()
    }
}

/// Future returned by [`Promise::get_async`] and [`Promise::wait_async`].
///
/// When it watches a cancellation token, the token is checked before the
/// outcome on every poll. Wakers it leaves with the promise or the token are
/// removed when it is dropped.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Settled<'a, T, E> {
    consumer: &'a Consumer<T, E>,
    cancellation: Option<&'a CancellationToken>,
    slot_key: Option<usize>,
    token_key: Option<usize>,
}

impl<T: Clone, E: Clone> Future for Settled<'_, T, E> {
    type Output = Result<T, Error<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(reason) = this.cancellation.and_then(|token| token.reason()) {
            return Poll::Ready(Err(reason.into()));
        }
        if let Poll::Ready(outcome) = this.consumer.poll_outcome(cx, &mut this.slot_key) {
            return Poll::Ready(outcome);
        }
        // Only wait on the token while the outcome is still pending.
        if let Some(token) = this.cancellation {
            if let Poll::Ready(reason) = token.poll_cancelled(cx, &mut this.token_key) {
                return Poll::Ready(Err(reason.into()));
            }
        }
        Poll::Pending
    }
}

impl<T, E> Drop for Settled<'_, T, E> {
    fn drop(&mut self) {
        if let Some(key) = self.slot_key {
            self.consumer.deregister(key);
        }
        if let (Some(token), Some(key)) = (self.cancellation, self.token_key) {
            token.deregister(key);
        }
    }
}
