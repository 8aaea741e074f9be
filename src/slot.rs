//! Write-once result slot shared by one producer and many consumers.
//!
//! The producer stores the outcome under the lock and only then wakes the
//! registered wakers, so a consumer that sees the outcome sees all of it.
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use crate::wakers::WakerList;
use crate::Error;

pub(crate) type Outcome<T, E> = Result<T, Error<E>>;

#[derive(Debug)]
pub(crate) struct Producer<T, E> {
    slot: Arc<Slot<T, E>>,
    resolved: bool,
}

#[derive(Debug)]
pub(crate) struct Consumer<T, E> {
    slot: Arc<Slot<T, E>>,
}

impl<T, E> Clone for Consumer<T, E> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

#[derive(Debug)]
struct Slot<T, E> {
    inner: Mutex<Inner<T, E>>,
}

#[derive(Debug)]
struct Inner<T, E> {
    value: Option<Outcome<T, E>>,
    wakers: WakerList,
}

impl<T, E> Slot<T, E> {
    // Every critical section leaves `Inner` consistent, so a poisoned lock
    // still holds usable data.
    fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn channel<T, E>() -> (Producer<T, E>, Consumer<T, E>) {
    let slot = Arc::new(Slot {
        inner: Mutex::new(Inner {
            value: None,
            wakers: WakerList::default(),
        }),
    });
    (
        Producer {
            slot: slot.clone(),
            resolved: false,
        },
        Consumer { slot },
    )
}

impl<T, E> Producer<T, E> {
    pub(crate) fn resolve(mut self, outcome: Outcome<T, E>) {
        self.resolved = true;
        self.store(outcome);
    }

    fn store(&self, outcome: Outcome<T, E>) {
        let wakers = {
            let mut inner = self.slot.lock();
            if inner.value.is_some() {
                return;
            }
            inner.value = Some(outcome);
            inner.wakers.take()
        };
        for waker in wakers {
            waker.wake()
        }
    }
}

impl<T, E> Drop for Producer<T, E> {
    /// An unresolved producer means the worker never ran.
    fn drop(&mut self) {
        if !self.resolved {
            self.store(Err(Error::WorkerLost));
        }
    }
}

impl<T: Clone, E: Clone> Consumer<T, E> {
    pub(crate) fn peek(&self) -> Option<Outcome<T, E>> {
        self.slot.lock().value.clone()
    }

    /// Returns the outcome, or registers `cx`'s waker under `key` to be woken
    /// once it is stored.
    pub(crate) fn poll_outcome(
        &self,
        cx: &mut Context<'_>,
        key: &mut Option<usize>,
    ) -> Poll<Outcome<T, E>> {
        let mut inner = self.slot.lock();
        match inner.value {
            Some(ref value) => Poll::Ready(value.clone()),
            None => {
                inner.wakers.register(key, cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<T, E> Consumer<T, E> {
    pub(crate) fn is_resolved(&self) -> bool {
        self.slot.lock().value.is_some()
    }

    /// Drops the registration made under `key` by `poll_outcome`.
    pub(crate) fn deregister(&self, key: usize) {
        self.slot.lock().wakers.remove(key);
    }

    #[cfg(test)]
    pub(crate) fn registered_wakers(&self) -> usize {
        self.slot.lock().wakers.len()
    }
}
