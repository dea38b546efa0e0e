//! Admission slot pool
//!
//! A fixed number of interchangeable tokens gate how many work units execute
//! at once. Tokens are RAII guards around an owned semaphore permit, so a
//! unit gives its token back on every exit path, including a panic inside
//! the spawned task.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::metrics::BACKFILL_UNITS_IN_FLIGHT;

#[derive(Debug, Clone)]
pub struct AdmissionPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionPool {
    /// Create a pool with `capacity` tokens, at least one and at most what
    /// [`drain`](Self::drain) can take back in one `acquire_many`
    pub fn new(capacity: usize) -> Self {
        let max = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        let capacity = capacity.clamp(1, max);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Tokens currently held
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    /// Wait for a free token
    pub async fn acquire(&self) -> Result<AdmissionToken, AcquireError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        BACKFILL_UNITS_IN_FLIGHT.inc();
        Ok(AdmissionToken { _permit: permit })
    }

    /// Block until every token is back in the pool.
    ///
    /// Acquires the whole capacity at once, then returns it, leaving the pool
    /// reusable.
    pub async fn drain(&self) -> Result<(), AcquireError> {
        let count = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        let all = self.semaphore.acquire_many(count).await?;
        drop(all);
        Ok(())
    }
}

/// Held by a running unit; dropping it returns the token
#[derive(Debug)]
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        BACKFILL_UNITS_IN_FLIGHT.dec();
    }
}

/// Spawner for fire-and-forget tasks gated by an [`AdmissionPool`]
#[derive(Debug, Clone)]
pub struct TaskPool {
    admission: AdmissionPool,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            admission: AdmissionPool::new(capacity),
        }
    }

    pub fn admission(&self) -> &AdmissionPool {
        &self.admission
    }

    /// Wait for a token, then run `task` on the runtime while holding it.
    ///
    /// The wait is the only backpressure on the caller's dispatch loop.
    pub async fn submit<F>(&self, task: F) -> Result<(), AcquireError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.admission.acquire().await?;
        tokio::spawn(async move {
            let _token = token;
            task.await;
        });
        Ok(())
    }

    /// Barrier: returns once all submitted tasks have finished
    pub async fn wait_all(&self) -> Result<(), AcquireError> {
        self.admission.drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_token_returns_on_drop() {
        let pool = AdmissionPool::new(2);
        let token = pool.acquire().await.unwrap();
        assert_eq!(pool.in_flight(), 1);
        drop(token);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_raised_to_one() {
        let pool = AdmissionPool::new(0);
        assert_eq!(pool.capacity(), 1);
    }

    #[tokio::test]
    async fn test_huge_capacity_still_drains() {
        let pool = AdmissionPool::new(usize::MAX);
        assert!(pool.capacity() <= u32::MAX as usize);
        let token = pool.acquire().await.unwrap();
        assert_eq!(pool.in_flight(), 1);
        drop(token);
        timeout(Duration::from_secs(1), pool.drain())
            .await
            .expect("drain must take back the whole capacity")
            .unwrap();
        assert_eq!(pool.available(), pool.capacity());
    }

    #[tokio::test]
    async fn test_acquire_blocks_when_exhausted() {
        let pool = AdmissionPool::new(1);
        let _held = pool.acquire().await.unwrap();
        let blocked = timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_wait_all_blocks_until_slow_task_finishes() {
        let pool = TaskPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for delay in [10u64, 150] {
            let done = Arc::clone(&done);
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        timeout(Duration::from_secs(5), pool.wait_all())
            .await
            .expect("drain timed out")
            .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(pool.admission().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_token() {
        let pool = TaskPool::new(1);
        pool.submit(async { panic!("unit blew up") }).await.unwrap();

        // A second submit can only proceed once the panicked task released its token
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        timeout(
            Duration::from_secs(5),
            pool.submit(async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .expect("token leaked by panicking task")
        .unwrap();

        timeout(Duration::from_secs(5), pool.wait_all())
            .await
            .expect("drain timed out")
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
