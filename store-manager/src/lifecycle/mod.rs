//! Server lifecycle
//!
//! ```text
//!  Initializing ─► RoleNegotiated ─► ServicesStarting ─► Queryable
//!                                                            │ Terminate
//!  Terminated ◄── Draining ◄──────────── ShuttingDown ◄──────┘
//! ```
//!
//! [`LifecycleManager`] runs the startup stages in order and opens the
//! [`ReadinessGate`] only after every stage before `BindListeners` has
//! succeeded. A failure before `Queryable` aborts startup without running
//! the shutdown sequence. [`ShutdownCoordinator`] runs the shutdown sequence
//! at most once per process.

mod control;
mod manager;
mod readiness;
mod shutdown;
mod state;

pub use control::{
    control_channel, spawn_control_task, spawn_signal_adapter, ControlEvent, DiagnosticsSnapshot,
};
pub use manager::LifecycleManager;
pub use readiness::ReadinessGate;
pub use shutdown::{ShutdownCoordinator, ShutdownStep};
pub use state::{LifecycleState, StageOutcome, StageRecord, StartupStage, StateMachine};

use store_common::error::{ConfigurationError, ErrorCategory, ErrorClassification};
use thiserror::Error;

use crate::frontend::ServiceError;
use crate::replication::ReplicationError;
use crate::storage::StorageError;
use crate::trigger::TriggerError;

/// Failure inside one startup stage
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StageError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error("Signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

impl ErrorClassification for StageError {
    fn category(&self) -> ErrorCategory {
        match self {
            StageError::Configuration(e) => e.category(),
            StageError::Service(e) => e.category(),
            StageError::Replication(e) => e.category(),
            StageError::Storage(e) => e.category(),
            StageError::Trigger(_) => ErrorCategory::Configuration,
            StageError::Signal(_) => ErrorCategory::Internal,
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error("Startup failed at stage {stage}: {source}")]
    Startup {
        stage: StartupStage,
        #[source]
        source: StageError,
    },

    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Shutdown requested before stage {stage}")]
    Interrupted { stage: StartupStage },

    #[error("HTTP listener failed: {0}")]
    Serve(#[from] ServiceError),
}

impl LifecycleError {
    pub fn stage(&self) -> Option<StartupStage> {
        match self {
            LifecycleError::Startup { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl ErrorClassification for LifecycleError {
    fn category(&self) -> ErrorCategory {
        match self {
            LifecycleError::Startup { source, .. } => source.category(),
            LifecycleError::InvalidTransition { .. } | LifecycleError::Interrupted { .. } => {
                ErrorCategory::Internal
            }
            LifecycleError::Serve(e) => e.category(),
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_error_names_stage() {
        let err = LifecycleError::Startup {
            stage: StartupStage::InitStorage,
            source: StageError::Configuration(ConfigurationError::MissingField(
                "root_directory".into(),
            )),
        };
        assert!(err.to_string().contains("init-storage"));
        assert_eq!(err.stage(), Some(StartupStage::InitStorage));
        assert!(err.is_fatal());
    }
}
