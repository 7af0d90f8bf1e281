//! Collapse concurrent calls for the same key into one execution.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

/// Tracks one in-flight call per key. Entries exist only while a call is
/// running and are removed when it finishes or is dropped.
pub struct SingleFlight<K, V> {
    calls: Mutex<HashMap<K, broadcast::Sender<V>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or wait for the call already running for it.
    /// Returns the value and whether it came from another caller's run.
    ///
    /// If the running caller is dropped before finishing, waiters start
    /// over and one of them runs `work` itself.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            let waiting = {
                let mut calls = self.lock();
                match calls.get(&key) {
                    Some(tx) => Some(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        calls.insert(key.clone(), tx);
                        None
                    }
                }
            };
            match waiting {
                Some(mut rx) => {
                    if let Ok(value) = rx.recv().await {
                        return (value, true);
                    }
                }
                None => break,
            }
        }

        let mut leader = Leader {
            flight: self,
            key: Some(key),
        };
        let value = work().await;
        leader.finish(&value);
        (value, false)
    }

    /// Number of keys with a call in progress.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, broadcast::Sender<V>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns a key's entry for the duration of the running call.
struct Leader<'a, K: Eq + Hash, V> {
    flight: &'a SingleFlight<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash, V> Leader<'_, K, V> {
    fn remove(&mut self) -> Option<broadcast::Sender<V>> {
        let key = self.key.take()?;
        let mut calls = self.flight.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.remove(&key)
    }
}

impl<K: Eq + Hash, V: Clone> Leader<'_, K, V> {
    fn finish(&mut self, value: &V) {
        if let Some(tx) = self.remove() {
            // No receivers is fine: nobody was waiting.
            let _ = tx.send(value.clone());
        }
    }
}

impl<K: Eq + Hash, V> Drop for Leader<'_, K, V> {
    fn drop(&mut self) {
        // Dropping the sender wakes waiters with `Closed`.
        self.remove();
    }
}
