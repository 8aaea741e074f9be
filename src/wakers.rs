//! Waker registrations keyed by the future that made them, so a future can
//! take its registration back when it is dropped.
use std::task::Waker;

#[derive(Debug, Default)]
pub(crate) struct WakerList {
    next_key: usize,
    entries: Vec<(usize, Waker)>,
}

impl WakerList {
    /// Registers `waker` under `key`, allocating a key on first use. A later
    /// call with the same key replaces the stored waker.
    pub(crate) fn register(&mut self, key: &mut Option<usize>, waker: &Waker) {
        let id = *key.get_or_insert_with(|| {
            let id = self.next_key;
            self.next_key = self.next_key.wrapping_add(1);
            id
        });
        match self.entries.iter_mut().find(|(k, _)| *k == id) {
            Some((_, stored)) => {
                if !stored.will_wake(waker) {
                    *stored = waker.clone();
                }
            }
            None => self.entries.push((id, waker.clone())),
        }
    }

    pub(crate) fn remove(&mut self, key: usize) {
        self.entries.retain(|(k, _)| *k != key);
    }

    /// Empties the list, handing back the wakers to be woken outside the lock.
    pub(crate) fn take(&mut self) -> Vec<Waker> {
        self.entries.drain(..).map(|(_, waker)| waker).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
