//! The pending set of one tick.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::oneshot;

use crate::LoadError;

pub(crate) type Slot<V> = oneshot::Sender<Result<Option<V>, LoadError>>;

/// Keys requested since the last dispatch, each with the callers waiting on
/// it. `keys` holds every key once, in first-request order.
pub(crate) struct Batch<K, V> {
    keys: Vec<K>,
    waiters: HashMap<K, Vec<Slot<V>>>,
    /// Bumped every time the batch is taken; a scheduled dispatch only fires
    /// for the generation it was scheduled for.
    pub(crate) generation: u64,
    pub(crate) scheduled: bool,
}

impl<K: Clone + Eq + Hash, V: Clone> Batch<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Vec::new(),
            waiters: HashMap::new(),
            generation: 0,
            scheduled: false,
        }
    }

    /// Add a waiter; a key already in the batch is not requested twice.
    pub(crate) fn push(&mut self, key: K, slot: Slot<V>) {
        match self.waiters.get_mut(&key) {
            Some(slots) => slots.push(slot),
            None => {
                self.keys.push(key.clone());
                self.waiters.insert(key, vec![slot]);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Close this batch and leave an empty one for the next generation.
    pub(crate) fn take(&mut self) -> Closed<K, V> {
        self.generation += 1;
        self.scheduled = false;
        Closed {
            keys: std::mem::take(&mut self.keys),
            waiters: std::mem::take(&mut self.waiters),
        }
    }
}

/// A dispatched batch: no more waiters can join it.
pub(crate) struct Closed<K, V> {
    pub(crate) keys: Vec<K>,
    waiters: HashMap<K, Vec<Slot<V>>>,
}

impl<K: Eq + Hash, V: Clone> Closed<K, V> {
    /// Hand each key's value to all of its waiters. `values` is in key order.
    pub(crate) fn resolve(mut self, values: Vec<Option<V>>) {
        for (key, value) in self.keys.iter().zip(values) {
            if let Some(slots) = self.waiters.remove(key) {
                for slot in slots {
                    // A dropped receiver just means the caller stopped waiting.
                    let _ = slot.send(Ok(value.clone()));
                }
            }
        }
    }

    pub(crate) fn fail(self, err: LoadError) {
        for slot in self.waiters.into_values().flatten() {
            let _ = slot.send(Err(err.clone()));
        }
    }
}
