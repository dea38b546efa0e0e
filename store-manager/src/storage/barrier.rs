use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use super::{StorageError, StorageResult};
use crate::metrics::PENDING_DURABLE_WRITES;

/// Tracks writes that have been accepted but not yet made durable.
///
/// Shutdown marks the barrier pending (new writes are refused) and then waits
/// until every outstanding guard is dropped. The wait may happen once.
#[derive(Debug, Default)]
pub struct DurabilityBarrier {
    shutdown_pending: AtomicBool,
    pending: AtomicUsize,
    waited: AtomicBool,
    drained: Notify,
}

impl DurabilityBarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one in-flight durable operation
    pub fn enter(self: &Arc<Self>) -> DurabilityGuard {
        self.pending.fetch_add(1, Ordering::AcqRel);
        PENDING_DURABLE_WRITES.inc();
        DurabilityGuard {
            barrier: Arc::clone(self),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn mark_shutdown_pending(&self) {
        self.shutdown_pending.store(true, Ordering::Release);
    }

    pub fn is_shutdown_pending(&self) -> bool {
        self.shutdown_pending.load(Ordering::Acquire)
    }

    /// Wait until no guards remain. A second call returns
    /// [`StorageError::BarrierAlreadyWaited`].
    pub async fn wait(&self) -> StorageResult<()> {
        if self.waited.swap(true, Ordering::AcqRel) {
            return Err(StorageError::BarrierAlreadyWaited);
        }
        loop {
            // Registered before the check so a release in between is not lost
            let drained = self.drained.notified();
            if self.pending() == 0 {
                return Ok(());
            }
            drained.await;
        }
    }

    fn leave(&self) {
        PENDING_DURABLE_WRITES.dec();
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Dropping the guard marks its operation durable
#[derive(Debug)]
pub struct DurabilityGuard {
    barrier: Arc<DurabilityBarrier>,
}

impl Drop for DurabilityGuard {
    fn drop(&mut self) {
        self.barrier.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let barrier = DurabilityBarrier::new();
        timeout(Duration::from_secs(1), barrier.wait())
            .await
            .expect("idle barrier blocked")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_guards_drop() {
        let barrier = DurabilityBarrier::new();
        let guard = barrier.enter();
        assert_eq!(barrier.pending(), 1);

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        timeout(Duration::from_secs(5), barrier.wait())
            .await
            .expect("barrier never drained")
            .unwrap();
        assert_eq!(barrier.pending(), 0);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_wait_is_rejected() {
        let barrier = DurabilityBarrier::new();
        barrier.wait().await.unwrap();
        assert!(matches!(
            barrier.wait().await,
            Err(StorageError::BarrierAlreadyWaited)
        ));
    }

    #[test]
    fn test_shutdown_pending_flag() {
        let barrier = DurabilityBarrier::new();
        assert!(!barrier.is_shutdown_pending());
        barrier.mark_shutdown_pending();
        assert!(barrier.is_shutdown_pending());
    }
}
