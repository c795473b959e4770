//! Request Coalescing
//!
//! Concurrent misses on the same key share one backing-store fetch. The first
//! caller runs the load; everyone arriving while it is in flight awaits the
//! same cell and receives a clone of its result, success or failure.

use crate::error::Error;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Failure shared by every caller of a collapsed load
///
/// [`Error`] is not `Clone`, so the retryable backing-store variants are kept
/// and everything else is carried as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    Unavailable { key: String, reason: String },
    Timeout { key: String, timeout_ms: u64 },
    Rejected { key: String, reason: String },
    Other(String),
}

impl From<Error> for LoadFailure {
    fn from(e: Error) -> Self {
        match e {
            Error::BackingStoreUnavailable { key, reason } => LoadFailure::Unavailable { key, reason },
            Error::BackingStoreTimeout { key, timeout_ms } => LoadFailure::Timeout { key, timeout_ms },
            Error::BackingStoreRejected { key, reason, .. } => LoadFailure::Rejected { key, reason },
            other => LoadFailure::Other(other.to_string()),
        }
    }
}

impl From<LoadFailure> for Error {
    fn from(f: LoadFailure) -> Self {
        match f {
            LoadFailure::Unavailable { key, reason } => Error::BackingStoreUnavailable { key, reason },
            LoadFailure::Timeout { key, timeout_ms } => Error::BackingStoreTimeout { key, timeout_ms },
            LoadFailure::Rejected { key, reason } => Error::BackingStoreRejected {
                key,
                operation: "load".to_string(),
                reason,
            },
            LoadFailure::Other(message) => Error::Internal(message),
        }
    }
}

/// Per-key in-flight call table
pub struct Singleflight<T> {
    calls: DashMap<String, Arc<OnceCell<T>>>,
}

impl<T> Default for Singleflight<T> {
    fn default() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }
}

impl<T: Clone> Singleflight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `load` unless a call for `key` is already in flight
    ///
    /// Returns the shared result and whether this caller ran the load. If the
    /// running caller is cancelled, one of the waiters takes over.
    pub async fn run<F, Fut>(&self, key: &str, load: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = self
            .calls
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut led = false;
        let value = cell
            .get_or_init(|| {
                led = true;
                load()
            })
            .await
            .clone();

        // Only the cell we joined; a newer flight may already be registered
        self.calls.remove_if(key, |_, current| Arc::ptr_eq(current, &cell));
        (value, led)
    }

    /// Keys with a load in flight
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_collapse() {
        let flights: Arc<Singleflight<u64>> = Arc::new(Singleflight::new());
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let flights = Arc::clone(&flights);
            let loads = Arc::clone(&loads);
            handles.push(tokio::spawn(async move {
                flights
                    .run("features:acme", || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        7
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (value, led) = handle.await.unwrap();
            assert_eq!(value, 7);
            leaders += led as usize;
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared() {
        let flights: Arc<Singleflight<Result<u64, LoadFailure>>> = Arc::new(Singleflight::new());
        let a = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(LoadFailure::Timeout {
                            key: "k".into(),
                            timeout_ms: 10,
                        })
                    })
                    .await
                    .0
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (b, led) = flights.run("k", || async { Ok(1) }).await;

        assert!(!led);
        assert_eq!(a.await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_sequential_calls_load_again() {
        let flights: Singleflight<usize> = Singleflight::new();
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            flights
                .run("k", || async { loads.fetch_add(1, Ordering::SeqCst) })
                .await;
        }
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failure_conversion() {
        let err: Error = LoadFailure::from(Error::BackingStoreTimeout {
            key: "k".into(),
            timeout_ms: 5,
        })
        .into();
        assert!(err.is_transient());
    }
}
