//! Out-of-band control events
//!
//! OS signals are translated into [`ControlEvent`]s by a thin adapter and
//! delivered on one channel. A single control task consumes the channel:
//! diagnostic dumps are written inline, terminations start the shutdown
//! sequence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::shutdown::ShutdownCoordinator;
use super::state::{LifecycleState, StageRecord};

const CONTROL_BACKLOG: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    DumpDiagnostics,
    Terminate,
}

pub fn control_channel() -> (mpsc::Sender<ControlEvent>, mpsc::Receiver<ControlEvent>) {
    mpsc::channel(CONTROL_BACKLOG)
}

/// Point-in-time view of the server written on a diagnostics request
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub uptime: Duration,
    pub state: LifecycleState,
    pub queryable: bool,
    pub role: String,
    pub stages: Vec<StageRecord>,
    pub shutdown_pending: bool,
    pub pending_durable_writes: Option<usize>,
}

pub type DiagnosticsSource = Arc<dyn Fn() -> DiagnosticsSnapshot + Send + Sync>;

/// Consume control events for the rest of the process lifetime
pub fn spawn_control_task(
    mut events: mpsc::Receiver<ControlEvent>,
    coordinator: Arc<ShutdownCoordinator>,
    diagnostics: DiagnosticsSource,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ControlEvent::DumpDiagnostics => {
                    let snapshot = diagnostics();
                    match serde_json::to_string_pretty(&snapshot) {
                        Ok(dump) => info!("Diagnostics dump requested\n{}", dump),
                        Err(e) => warn!(error = %e, "Failed to encode diagnostics"),
                    }
                }
                ControlEvent::Terminate => {
                    // Keep serving dumps while the sequence runs
                    let coordinator = Arc::clone(&coordinator);
                    tokio::spawn(async move {
                        coordinator.shutdown().await;
                    });
                }
            }
        }
    })
}

/// Map SIGUSR1 to a diagnostics dump and SIGINT/SIGTERM to termination
#[cfg(unix)]
pub fn spawn_signal_adapter(
    events: mpsc::Sender<ControlEvent>,
) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let (name, event) = tokio::select! {
                Some(()) = usr1.recv() => ("SIGUSR1", ControlEvent::DumpDiagnostics),
                Some(()) = interrupt.recv() => ("SIGINT", ControlEvent::Terminate),
                Some(()) = terminate.recv() => ("SIGTERM", ControlEvent::Terminate),
                else => break,
            };
            info!(signal = name, ?event, "Signal received");
            if events.send(event).await.is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_signal_adapter(
    events: mpsc::Sender<ControlEvent>,
) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!(signal = "ctrl-c", "Signal received");
            if events.send(ControlEvent::Terminate).await.is_err() {
                break;
            }
        }
    }))
}
