//! A promise runs one computation on its own thread and hands the outcome to
//! any number of observers.
//!
//! Observers pick how they want to wait:
//!
//! - [`Promise::get`] blocks until the computation is done.
//! - [`Promise::wait`] blocks until the computation is done or the promise's
//!   [`CancellationToken`] fires, whichever comes first.
//! - [`Promise::try_wait`] never blocks.
//!
//! # Examples
//!
//! ```
//! use promise_future::Promise;
//!
//! let promise = Promise::<String, String>::spawn(|| Ok("hello".into()));
//! assert_eq!(promise.get(), Ok("hello".to_string()));
//! ```
pub mod builder;
pub mod cancel;
pub mod promise;
mod slot;
mod wakers;

pub use builder::Builder;
pub use cancel::{CancelReason, Cancelled, CancellationToken};
pub use promise::{Promise, Settled};

use thiserror::Error;

/// Everything a retrieval operation can return instead of a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// The computation returned an error.
    #[error("{0}")]
    Failed(E),
    /// The cancellation token was cancelled explicitly.
    #[error("context canceled")]
    Canceled,
    /// The cancellation token's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// The computation panicked; holds the panic message when there was one.
    #[error("computation panicked: {0}")]
    Panicked(String),
    /// The worker thread could not be started.
    #[error("worker thread was never started")]
    WorkerLost,
}

impl<E> Error<E> {
    /// True for the errors caused by a cancellation signal rather than the
    /// computation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }

    /// The computation's own error, if that is what this is.
    pub fn into_failed(self) -> Option<E> {
        match self {
            Error::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl<E> From<CancelReason> for Error<E> {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Canceled => Error::Canceled,
            CancelReason::DeadlineExceeded => Error::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelReason, Error};

    #[test]
    fn test_error_kinds() {
        let failed: Error<&str> = Error::Failed("boom");
        assert!(!failed.is_cancellation());
        assert_eq!(failed.to_string(), "boom");
        assert_eq!(failed.into_failed(), Some("boom"));

        let canceled: Error<&str> = CancelReason::Canceled.into();
        assert!(canceled.is_cancellation());
        assert_eq!(canceled.clone().into_failed(), None);
        assert_eq!(canceled, Error::Canceled);

        let expired: Error<&str> = CancelReason::DeadlineExceeded.into();
        assert!(expired.is_cancellation());
        assert_eq!(expired.to_string(), "context deadline exceeded");
    }
}
