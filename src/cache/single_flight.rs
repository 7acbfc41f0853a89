//! Single-flight execution: one producer per key, many waiters.
//!
//! The producing future runs on its own Tokio task, so a waiter that gives
//! up (caller timeout, dropped request) never cancels work other waiters,
//! or the next caller, will benefit from.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinError;
use tracing::debug;

type Flight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Deduplicates concurrent work per key.
pub struct SingleFlight<K, T, E> {
    in_flight: Arc<Mutex<HashMap<K, Flight<T, E>>>>,
}

impl<K, T, E> Default for SingleFlight<K, T, E> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T, E> SingleFlight<K, T, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<JoinError> + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight producer for `key`, or start one with `produce`.
    ///
    /// `produce` is only invoked when no flight exists for `key`.
    pub async fn run<F, Fut>(&self, key: K, produce: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let flight = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!("Joining in-flight producer");
                    existing.clone()
                }
                None => {
                    let registry = Arc::clone(&self.in_flight);
                    let done_key = key.clone();
                    let work = produce();
                    // The entry is removed by the task itself, under the same
                    // lock we hold here, so it cannot vanish before insertion.
                    let handle = tokio::spawn(async move {
                        let out = work.await;
                        registry
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&done_key);
                        out
                    });
                    let flight: Flight<T, E> = async move {
                        match handle.await {
                            Ok(out) => out,
                            Err(join) => Err(E::from(join)),
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}
