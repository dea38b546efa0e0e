//! Lifecycle states and startup stages

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use super::LifecycleError;
use crate::metrics::LIFECYCLE_STATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Initializing,
    RoleNegotiated,
    ServicesStarting,
    Queryable,
    ShuttingDown,
    Draining,
    Terminated,
}

impl LifecycleState {
    /// The only state reachable from `self`
    pub fn next(self) -> Option<LifecycleState> {
        use LifecycleState::*;
        match self {
            Initializing => Some(RoleNegotiated),
            RoleNegotiated => Some(ServicesStarting),
            ServicesStarting => Some(Queryable),
            Queryable => Some(ShuttingDown),
            ShuttingDown => Some(Draining),
            Draining => Some(Terminated),
            Terminated => None,
        }
    }

    /// Gauge value
    pub fn code(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Process-wide lifecycle state with validated transitions
#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<LifecycleState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        LIFECYCLE_STATE.set(LifecycleState::Initializing.code());
        Self {
            state: Mutex::new(LifecycleState::Initializing),
        }
    }

    pub fn current(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn transition(&self, to: LifecycleState) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        let from = *state;
        if from.next() != Some(to) {
            return Err(LifecycleError::InvalidTransition { from, to });
        }
        *state = to;
        LIFECYCLE_STATE.set(to.code());
        info!(%from, %to, "Lifecycle transition");
        Ok(())
    }
}

/// Ordered server startup stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StartupStage {
    LoadConfig,
    BuildServices,
    InstallSignals,
    NegotiateRole,
    InitStorage,
    RegisterHandlers,
    StartUtilities,
    EnableQueries,
    BindListeners,
}

impl StartupStage {
    pub const ALL: [StartupStage; 9] = [
        StartupStage::LoadConfig,
        StartupStage::BuildServices,
        StartupStage::InstallSignals,
        StartupStage::NegotiateRole,
        StartupStage::InitStorage,
        StartupStage::RegisterHandlers,
        StartupStage::StartUtilities,
        StartupStage::EnableQueries,
        StartupStage::BindListeners,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StartupStage::LoadConfig => "load-config",
            StartupStage::BuildServices => "build-services",
            StartupStage::InstallSignals => "install-signals",
            StartupStage::NegotiateRole => "negotiate-role",
            StartupStage::InitStorage => "init-storage",
            StartupStage::RegisterHandlers => "register-handlers",
            StartupStage::StartUtilities => "start-utilities",
            StartupStage::EnableQueries => "enable-queries",
            StartupStage::BindListeners => "bind-listeners",
        }
    }
}

impl fmt::Display for StartupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: StartupStage,
    pub outcome: StageOutcome,
    pub elapsed: Duration,
    /// Readiness gate after the stage finished
    pub queryable: bool,
}

impl StageRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == StageOutcome::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let machine = StateMachine::new();
        let mut state = machine.current();
        while let Some(next) = state.next() {
            machine.transition(next).unwrap();
            state = next;
        }
        assert_eq!(machine.current(), LifecycleState::Terminated);
    }

    #[test]
    fn test_skipping_a_state_is_rejected() {
        let machine = StateMachine::new();
        let err = machine.transition(LifecycleState::Queryable).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: LifecycleState::Initializing,
                to: LifecycleState::Queryable
            }
        ));
        assert_eq!(machine.current(), LifecycleState::Initializing);
    }

    #[test]
    fn test_stages_are_ordered() {
        assert_eq!(StartupStage::ALL.first(), Some(&StartupStage::LoadConfig));
        assert_eq!(StartupStage::ALL.last(), Some(&StartupStage::BindListeners));
        assert_eq!(StartupStage::EnableQueries.to_string(), "enable-queries");
    }
}
