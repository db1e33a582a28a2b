//! Per-provider concurrency cap realized as a non-blocking permit pool.
//!
//! `try_acquire` never waits: when the pool is exhausted the caller gets
//! [`BulkheadExceeded`] immediately and routes around the provider. The
//! returned permit releases on drop, so acquire/release pair up on every
//! exit path, early returns and panics included.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// All permits are in use.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("bulkhead exhausted: {in_flight}/{max} permits in use")]
pub struct BulkheadExceeded {
    pub in_flight: usize,
    pub max: usize,
}

/// RAII guard for one in-flight call against a provider.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Bounded permit pool for one provider.
#[derive(Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
}

impl Bulkhead {
    pub fn new(max_permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_permits)),
            max_permits,
        }
    }

    /// Take a permit without waiting.
    pub fn try_acquire(&self) -> Result<BulkheadPermit, BulkheadExceeded> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(BulkheadPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                Err(BulkheadExceeded {
                    in_flight: self.in_flight(),
                    max: self.max_permits,
                })
            }
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max_permits
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_when_at_capacity() {
        let bulkhead = Bulkhead::new(2);
        let p1 = bulkhead.try_acquire().unwrap();
        let _p2 = bulkhead.try_acquire().unwrap();

        let err = bulkhead.try_acquire().unwrap_err();
        assert_eq!(err.in_flight, 2);
        assert_eq!(err.max, 2);

        drop(p1);
        assert!(bulkhead.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn permit_releases_on_drop_in_all_paths() {
        let bulkhead = Bulkhead::new(1);

        {
            let _permit = bulkhead.try_acquire().unwrap();
            assert_eq!(bulkhead.available(), 0);
        }
        assert_eq!(bulkhead.available(), 1);

        // Release must also happen when the holding task panics.
        let clone = bulkhead.clone();
        let handle = tokio::spawn(async move {
            let _permit = clone.try_acquire().unwrap();
            panic!("boom");
        });
        assert!(handle.await.is_err());
        assert_eq!(bulkhead.available(), 1);
    }
}
