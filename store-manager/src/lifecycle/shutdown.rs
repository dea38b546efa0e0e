//! Ordered, run-once shutdown sequence

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::readiness::ReadinessGate;
use super::state::{LifecycleState, StateMachine};
use crate::frontend::RpcService;
use crate::storage::DurabilityBarrier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownStep {
    StopApi,
    CancelLifecycle,
    StopReplication,
    CloseReadiness,
    GracePeriod,
    DurabilityWait,
    Exit,
}

pub struct ShutdownCoordinator {
    api: Arc<dyn RpcService>,
    replication: Arc<dyn RpcService>,
    lifecycle: CancellationToken,
    gate: ReadinessGate,
    state: Arc<StateMachine>,
    grace_period: Duration,
    barrier: Mutex<Option<Arc<DurabilityBarrier>>>,
    started: AtomicBool,
    runs: AtomicUsize,
    steps: Mutex<Vec<ShutdownStep>>,
    exited: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(
        api: Arc<dyn RpcService>,
        replication: Arc<dyn RpcService>,
        lifecycle: CancellationToken,
        gate: ReadinessGate,
        state: Arc<StateMachine>,
        grace_period: Duration,
    ) -> Self {
        Self {
            api,
            replication,
            lifecycle,
            gate,
            state,
            grace_period,
            barrier: Mutex::new(None),
            started: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
            steps: Mutex::new(Vec::new()),
            exited: CancellationToken::new(),
        }
    }

    /// Storage barrier to wait on; absent until storage is initialized
    pub fn attach_barrier(&self, barrier: Arc<DurabilityBarrier>) {
        *self.barrier.lock() = Some(barrier);
    }

    pub fn barrier(&self) -> Option<Arc<DurabilityBarrier>> {
        self.barrier.lock().clone()
    }

    /// Tear down after a failed startup, skipping the shutdown sequence
    pub fn abort(&self) {
        self.lifecycle.cancel();
        self.api.stop();
        self.replication.stop();
        self.exited.cancel();
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Number of times the sequence actually ran; never above one
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Acquire)
    }

    pub fn completed_steps(&self) -> Vec<ShutdownStep> {
        self.steps.lock().clone()
    }

    /// Cancelled once the final step completes
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Run the sequence. Returns false if another call already started it.
    pub async fn shutdown(&self) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            info!("Shutdown already in progress, ignoring");
            return false;
        }
        self.runs.fetch_add(1, Ordering::AcqRel);
        let queryable = self.state.current() == LifecycleState::Queryable;
        if queryable {
            self.advance(LifecycleState::ShuttingDown);
        } else {
            warn!(state = %self.state.current(), "Shutdown requested before the server became queryable");
        }

        info!("Initiating graceful shutdown");
        self.api.graceful_stop().await;
        self.record(ShutdownStep::StopApi);

        self.lifecycle.cancel();
        self.record(ShutdownStep::CancelLifecycle);

        self.replication.stop();
        self.record(ShutdownStep::StopReplication);

        self.gate.set(false);
        self.record(ShutdownStep::CloseReadiness);

        info!(grace_period = ?self.grace_period, "Waiting grace period before shutdown");
        tokio::time::sleep(self.grace_period).await;
        self.record(ShutdownStep::GracePeriod);
        if queryable {
            self.advance(LifecycleState::Draining);
        }

        let barrier = self.barrier.lock().clone();
        if let Some(barrier) = barrier {
            barrier.mark_shutdown_pending();
            info!(pending = barrier.pending(), "Waiting for durable writes");
            if let Err(e) = barrier.wait().await {
                error!(error = %e, "Durability wait failed");
            }
        }
        self.record(ShutdownStep::DurabilityWait);
        if queryable {
            self.advance(LifecycleState::Terminated);
        }

        info!("Exiting");
        self.record(ShutdownStep::Exit);
        self.exited.cancel();
        true
    }

    fn advance(&self, to: LifecycleState) {
        if let Err(e) = self.state.transition(to) {
            error!(error = %e, "Unexpected lifecycle state during shutdown");
        }
    }

    fn record(&self, step: ShutdownStep) {
        self.steps.lock().push(step);
    }
}
