//! Single-flight lock
//!
//! Coalesces concurrent work per key: while a call for a key is in flight,
//! later callers await the same shared future instead of starting new work.
//! The slot is cleared once the work completes, so the next call starts fresh.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

type InFlight<T> = Shared<BoxFuture<'static, T>>;

pub struct SingleFlight<K, T>
where
    T: Clone,
{
    inflight: Mutex<HashMap<K, InFlight<T>>>,
}

impl<K, T> Default for SingleFlight<K, T>
where
    T: Clone,
{
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `factory` for `key` unless a call for `key` is already in flight,
    /// in which case its result is awaited and returned instead.
    pub async fn run<F, Fut>(&self, key: K, factory: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.lock();
            match inflight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let fut = factory().boxed().shared();
                    inflight.insert(key.clone(), fut.clone());
                    fut
                }
            }
        };

        let output = shared.clone().await;

        let mut inflight = self.lock();
        if inflight.get(&key).is_some_and(|current| current.ptr_eq(&shared)) {
            inflight.remove(&key);
        }

        output
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, InFlight<T>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
