//! Worker thread configuration.
use std::io;
use std::thread;

use crate::cancel::CancellationToken;
use crate::promise::Promise;

/// Configures the worker thread of a [`Promise`] before starting it.
///
/// # Examples
///
/// ```
/// use promise_future::{Builder, CancellationToken};
///
/// let token = CancellationToken::new();
/// let promise = Builder::new()
///     .name("answer")
///     .stack_size(64 * 1024)
///     .cancellation(token)
///     .spawn(|_token| Ok::<_, String>(42))
///     .expect("failed to spawn the worker");
/// assert_eq!(promise.wait(), Ok(42));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    cancellation: Option<CancellationToken>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the worker thread.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the stack size of the worker thread in bytes.
    pub fn stack_size(self, size: usize) -> Self {
        Self {
            stack_size: Some(size),
            ..self
        }
    }

    /// Sets the token observed by [`Promise::wait`] and handed to the
    /// computation.
    pub fn cancellation(self, token: CancellationToken) -> Self {
        Self {
            cancellation: Some(token),
            ..self
        }
    }

    /// Starts `computation` on a configured worker thread.
    ///
    /// Without a [`cancellation`](Self::cancellation) token the computation
    /// gets a token that never fires.
    pub fn spawn<T, E, F>(self, computation: F) -> io::Result<Promise<T, E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let (promise, spawned) = Promise::launch(builder, self.cancellation, computation);
        spawned.map(|()| promise)
    }
}

#[cfg(test)]
mod tests {
    use super::Builder;
    use crate::{CancellationToken, Error};
    use std::thread;

    #[test]
    fn test_named_worker() {
        let promise = Builder::new()
            .name("promise-test-worker")
            .spawn(|_| Ok::<_, ()>(thread::current().name().map(str::to_owned)))
            .expect("failed to spawn the worker");
        assert_eq!(promise.get(), Ok(Some("promise-test-worker".to_string())));
    }

    #[test]
    fn test_default_token_never_fires() {
        let promise = Builder::new()
            .spawn(|token| Ok::<_, ()>(token.is_cancelled()))
            .expect("failed to spawn the worker");
        assert!(promise.cancellation().is_none());
        assert_eq!(promise.wait(), Ok(false));
    }

    #[test]
    fn test_cancellation_reaches_computation() {
        let token = CancellationToken::new();
        token.cancel();
        let promise = Builder::new()
            .cancellation(token)
            .spawn(|token| Ok::<_, ()>(token.is_cancelled()))
            .expect("failed to spawn the worker");
        assert_eq!(promise.get(), Ok(true));
        assert_eq!(promise.wait(), Err(Error::Canceled));
    }

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn test_spawn_error_is_returned() {
        let spawned = Builder::new()
            .stack_size(1 << 60)
            .spawn(|_| Ok::<u32, ()>(5));
        assert!(spawned.is_err());
    }
}
