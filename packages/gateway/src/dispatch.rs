use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::CoordinatorError;
use crate::pool::WorkerPool;

/// Bounds how many requests may be in flight (being rendered) or waiting
/// for a worker at once. The admission capacity passed to [`Self::new`]
/// must already be `pool_size + max_pending` (see the spec's queue-full
/// scenario: a pool of 1 with `MAX_PENDING` 2 admits 3 concurrent requests
/// total — 1 executing, 2 waiting — before the 4th fails fast); this type
/// itself just enforces whatever capacity it is given.
pub struct DispatchQueue {
    pool: Arc<WorkerPool>,
    admission: Arc<Semaphore>,
}

/// Held by a request for as long as it owns a worker. Dropping it ordinarily
/// releases the worker back to the idle pool and frees one admission slot,
/// so a panic mid-request can never leak either. Call [`Lease::abandon`]
/// instead of letting an ordinary drop happen when the worker must be
/// killed/replaced rather than handed back for reuse (e.g. a parent-side
/// render timeout, spec.md §5) — an abandoned lease still frees its
/// admission slot, it just skips the idle-pool release.
pub struct Lease {
    pool: Arc<WorkerPool>,
    worker_id: usize,
    _permit: tokio::sync::OwnedSemaphorePermit,
    abandoned: bool,
}

impl Lease {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Consumes the lease without returning its worker to the idle pool.
    /// The caller is responsible for having already arranged for the
    /// worker to be killed and replaced (see `WorkerPool::kill_and_replace`)
    /// — otherwise the worker is simply never reused, and the pool's
    /// steady-state size quietly shrinks.
    pub fn abandon(mut self) {
        self.abandoned = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.abandoned {
            self.pool.release(self.worker_id);
        }
    }
}

impl DispatchQueue {
    /// `capacity` is the total number of requests allowed to hold an
    /// admission slot at once (in flight + waiting) — callers should pass
    /// `pool_size + max_pending`, not `max_pending` alone.
    pub fn new(pool: Arc<WorkerPool>, capacity: usize) -> Self {
        Self {
            pool,
            admission: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Suspends until either an admission slot and an idle worker are both
    /// available, or fails immediately if the queue bound is already hit.
    pub async fn acquire(&self) -> Result<Lease, CoordinatorError> {
        let permit = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| CoordinatorError::QueueFull)?;

        let worker_id = self.pool.acquire().await;

        Ok(Lease {
            pool: self.pool.clone(),
            worker_id,
            _permit: permit,
            abandoned: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_reporter::StateReporter;

    #[tokio::test]
    async fn queue_full_fails_fast_past_the_bound() {
        // zero workers means acquire() would hang forever waiting on the
        // pool; the admission semaphore must reject before that happens.
        let pool = WorkerPool::spawn(std::path::PathBuf::from("/bin/true"), 0, StateReporter::new())
            .await
            .unwrap();
        let queue = DispatchQueue::new(Arc::new(pool), 1);

        let first = queue.admission.clone().try_acquire_owned();
        assert!(first.is_ok());
        let second = queue.acquire().await;
        assert!(matches!(second, Err(CoordinatorError::QueueFull)));
    }

    #[tokio::test]
    async fn release_on_drop_does_not_deadlock_with_a_concurrent_acquire() {
        // Regression test: `Lease::drop` used to re-lock the whole pool
        // just to call `release`, which could never complete while another
        // task's `acquire` held that same lock suspended on an idle wait.
        let pool = WorkerPool::spawn(std::path::PathBuf::from("/bin/true"), 1, StateReporter::new())
            .await
            .unwrap();
        let queue = DispatchQueue::new(Arc::new(pool), 4);

        let first = queue.acquire().await.unwrap();
        let waiter = {
            let admission = queue.admission.clone();
            let pool = queue.pool.clone();
            tokio::spawn(async move {
                let _permit = admission.acquire_owned().await.unwrap();
                pool.acquire().await
            })
        };
        tokio::task::yield_now().await;
        let released_id = first.worker_id();
        drop(first);

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("release must not deadlock a concurrent acquire")
            .unwrap();
        assert_eq!(got, released_id);
    }
}
