//! Collapse concurrent cache misses into a single upstream fetch
//!
//! Callers that miss the same cache identity while a fetch is outstanding
//! await the same shared future instead of starting their own. The fetch runs
//! as a spawned task: a caller that gives up does not cancel it, and the cache
//! is still populated for whoever comes next.
//!
//! The registry entry is owned by a guard inside the task, so a fetch that
//! panics still unregisters itself and the next miss starts a new fetch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Result, VerifyError};

type Flight<T> = Shared<BoxFuture<'static, Result<T>>>;
type Registry<T> = Arc<Mutex<HashMap<String, Flight<T>>>>;

/// Pending fetches keyed by cache identity
pub(crate) struct SingleFlight<T> {
    pending: Registry<T>,
}

/// Removes a flight from the registry when its task ends, including by panic
struct FlightGuard<T> {
    registry: Registry<T>,
    key: String,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `fetch` unless a fetch for `key` is already in flight, in which
    /// case wait for that one. Every waiter receives the same result.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) async fn run<F>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let flight = {
            let mut pending = self.pending.lock();
            if let Some(existing) = pending.get(key) {
                debug!(key = key, "Joining in-flight fetch");
                existing.clone()
            } else {
                let registry = Arc::clone(&self.pending);
                let owned_key = key.to_string();

                // The registry lock is held until the flight is inserted, so
                // the guard cannot remove the entry before it exists.
                let task = tokio::spawn(async move {
                    let _guard = FlightGuard {
                        registry,
                        key: owned_key,
                    };
                    fetch.await
                });

                let flight = async move {
                    task.await.unwrap_or_else(|e| {
                        error!(error = %e, "Provider fetch task did not complete");
                        Err(VerifyError::provider_unreachable(format!(
                            "fetch task did not complete: {e}"
                        )))
                    })
                }
                .boxed()
                .shared();

                pending.insert(key.to_string(), flight.clone());
                flight
            }
        };

        flight.await
    }
}

impl<T> SingleFlight<T> {
    /// Number of fetches currently outstanding
    pub(crate) fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let flights: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            let release_rx = Arc::clone(&release_rx);
            handles.push(tokio::spawn(async move {
                flights
                    .run("jwks", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let rx = release_rx.lock().take();
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                        Ok(42)
                    })
                    .await
            }));
        }

        // Let every caller register before the fetch completes.
        while flights.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_tx.send(()).unwrap();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_not_cached() {
        let flights: SingleFlight<u32> = SingleFlight::new();

        let err = flights
            .run("discovery", async { Err(VerifyError::provider_unreachable("down")) })
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::provider_unreachable("down"));

        // A completed flight is gone; the next call fetches again.
        let value = flights.run("discovery", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_collapse() {
        let flights: SingleFlight<&'static str> = SingleFlight::new();
        let (a, b) = tokio::join!(
            flights.run("https://idp/a", async { Ok("a") }),
            flights.run("https://idp/b", async { Ok("b") }),
        );
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_fetch() {
        let flights: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let completed = Arc::new(AtomicUsize::new(0));

        let done = Arc::clone(&completed);
        let caller = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run("jwks", async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    })
                    .await
            })
        };

        while flights.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        caller.abort();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_fetch_unregisters_itself() {
        let flights: SingleFlight<u32> = SingleFlight::new();

        let err = flights
            .run("jwks", panicking_fetch())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::ProviderUnreachable(_)), "{err}");
        assert_eq!(flights.in_flight(), 0);

        // The next miss runs its own fetch instead of replaying the panic.
        let value = flights.run("jwks", async { Ok(9) }).await.unwrap();
        assert_eq!(value, 9);
    }

    async fn panicking_fetch() -> Result<u32> {
        panic!("fetch bug")
    }
}
