use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::control::{
    control_channel, spawn_control_task, spawn_signal_adapter, ControlEvent, DiagnosticsSnapshot,
    DiagnosticsSource,
};
use super::readiness::ReadinessGate;
use super::shutdown::ShutdownCoordinator;
use super::state::{LifecycleState, StageOutcome, StageRecord, StartupStage, StateMachine};
use super::{LifecycleError, LifecycleResult, StageError};
use crate::config::ServerSettings;
use crate::frontend::{
    serve_http, spawn_uptime_monitor, stream_route, ApiService, HttpMux, MessageLimits,
    RpcService, StoreApi, UtilitiesServer,
};
use crate::replication::{
    ReplicationFactory, ReplicationReceiver, ReplicationRole, ReplicationService,
    TcpReplicationFactory,
};
use crate::storage::{ChangeSink, LocalStoreFactory, StorageFactory};
use crate::trigger::build_matcher;

/// Drives a server from configuration to serving and back down.
///
/// Storage and replication are built through injected factories so each
/// startup stage can be failed in isolation.
pub struct LifecycleManager {
    config_path: PathBuf,
    storage_factory: Arc<dyn StorageFactory>,
    replication_factory: Arc<dyn ReplicationFactory>,
    os_signals: bool,

    gate: ReadinessGate,
    state: Arc<StateMachine>,
    stages: Arc<Mutex<Vec<StageRecord>>>,
    lifecycle: CancellationToken,
    control_tx: mpsc::Sender<ControlEvent>,
    control_rx: Mutex<Option<mpsc::Receiver<ControlEvent>>>,
    coordinator: Mutex<Option<Arc<ShutdownCoordinator>>>,
    http_addr: Mutex<Option<SocketAddr>>,
    api_addr: Mutex<Option<SocketAddr>>,

    started_at: DateTime<Utc>,
    started: Instant,
}

type RoleEndpoints = (Option<Arc<dyn ChangeSink>>, Option<Arc<ReplicationReceiver>>);

impl LifecycleManager {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        let (control_tx, control_rx) = control_channel();
        Self {
            config_path: config_path.into(),
            storage_factory: Arc::new(LocalStoreFactory),
            replication_factory: Arc::new(TcpReplicationFactory),
            os_signals: true,
            gate: ReadinessGate::new(),
            state: Arc::new(StateMachine::new()),
            stages: Arc::new(Mutex::new(Vec::new())),
            lifecycle: CancellationToken::new(),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            coordinator: Mutex::new(None),
            http_addr: Mutex::new(None),
            api_addr: Mutex::new(None),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn with_storage_factory(mut self, factory: Arc<dyn StorageFactory>) -> Self {
        self.storage_factory = factory;
        self
    }

    pub fn with_replication_factory(mut self, factory: Arc<dyn ReplicationFactory>) -> Self {
        self.replication_factory = factory;
        self
    }

    /// Disable the OS signal adapter; events then only arrive via [`Self::control`]
    pub fn with_os_signals(mut self, enabled: bool) -> Self {
        self.os_signals = enabled;
        self
    }

    pub fn readiness(&self) -> ReadinessGate {
        self.gate.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.state.current()
    }

    pub fn stages(&self) -> Vec<StageRecord> {
        self.stages.lock().clone()
    }

    /// Sender for control events, the same channel the signal adapter feeds
    pub fn control(&self) -> mpsc::Sender<ControlEvent> {
        self.control_tx.clone()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        *self.http_addr.lock()
    }

    pub fn api_addr(&self) -> Option<SocketAddr> {
        *self.api_addr.lock()
    }

    /// How many times the shutdown sequence ran
    pub fn shutdown_runs(&self) -> usize {
        self.coordinator
            .lock()
            .as_ref()
            .map_or(0, |coordinator| coordinator.runs())
    }

    /// Start, serve until terminated, then return once shutdown completes
    pub async fn run(&self) -> LifecycleResult<()> {
        match self.start_and_serve().await {
            Ok(()) => Ok(()),
            Err(LifecycleError::Interrupted { stage }) => {
                info!(%stage, "Startup interrupted by shutdown request");
                let coordinator = self.coordinator.lock().clone();
                if let Some(coordinator) = coordinator {
                    coordinator.exited().cancelled().await;
                }
                Ok(())
            }
            Err(e) => {
                self.gate.set(false);
                let coordinator = self.coordinator.lock().clone();
                match coordinator {
                    // Writes may already be in flight; drain them like a terminate
                    Some(coordinator)
                        if matches!(
                            self.state.current(),
                            LifecycleState::Queryable
                                | LifecycleState::ShuttingDown
                                | LifecycleState::Draining
                                | LifecycleState::Terminated
                        ) =>
                    {
                        error!(error = %e, "Server failed while serving, shutting down");
                        if !coordinator.shutdown().await {
                            coordinator.exited().cancelled().await;
                        }
                    }
                    coordinator => {
                        error!(error = %e, "Server startup aborted");
                        self.lifecycle.cancel();
                        if let Some(coordinator) = coordinator {
                            coordinator.abort();
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn start_and_serve(&self) -> LifecycleResult<()> {
        info!(config = %self.config_path.display(), "Initializing market store server");

        let settings = self
            .run_stage(StartupStage::LoadConfig, async {
                Ok(ServerSettings::load(&self.config_path)?)
            })
            .await?;
        let role = ReplicationRole::from_settings(&settings.replication);

        let (api, replication) = self
            .run_stage(StartupStage::BuildServices, async {
                let limits = MessageLimits {
                    max_send: settings.grpc_max_send_msg_size,
                    max_recv: settings.grpc_max_recv_msg_size,
                };
                let api = Arc::new(ApiService::new(limits, self.gate.clone()));
                let replication = Arc::new(ReplicationService::new(
                    settings.replication.max_send_msg_size,
                ));
                Ok((api, replication))
            })
            .await?;

        let coordinator = self
            .run_stage(StartupStage::InstallSignals, async {
                let coordinator = Arc::new(ShutdownCoordinator::new(
                    Arc::clone(&api) as Arc<dyn RpcService>,
                    Arc::clone(&replication) as Arc<dyn RpcService>,
                    self.lifecycle.clone(),
                    self.gate.clone(),
                    Arc::clone(&self.state),
                    settings.stop_grace_period,
                ));
                if self.os_signals {
                    spawn_signal_adapter(self.control_tx.clone())?;
                }
                let events = self.control_rx.lock().take();
                match events {
                    Some(events) => {
                        let diagnostics =
                            self.diagnostics_source(role.to_string(), Arc::clone(&coordinator));
                        spawn_control_task(events, Arc::clone(&coordinator), diagnostics);
                    }
                    None => warn!("Control task already installed"),
                }
                *self.coordinator.lock() = Some(Arc::clone(&coordinator));
                Ok(coordinator)
            })
            .await?;

        let (sink, receiver) = self
            .run_stage(StartupStage::NegotiateRole, async {
                let endpoints: RoleEndpoints = match &role {
                    ReplicationRole::None => {
                        info!("Replication disabled");
                        (None, None)
                    }
                    ReplicationRole::Master => {
                        let sender = self
                            .replication_factory
                            .master(Arc::clone(&replication), &settings.replication)
                            .await?;
                        tokio::spawn(Arc::clone(&sender).run(self.lifecycle.clone()));
                        info!("Initialized replication master");
                        (Some(sender as Arc<dyn ChangeSink>), None)
                    }
                    ReplicationRole::Client { master_host } => {
                        let receiver = self
                            .replication_factory
                            .client(master_host, &settings.replication)
                            .await?;
                        tokio::spawn(Arc::clone(&receiver).run(self.lifecycle.clone()));
                        info!(master = %master_host, "Initialized replication client");
                        (None, Some(receiver))
                    }
                };
                Ok(endpoints)
            })
            .await?;
        self.state.transition(LifecycleState::RoleNegotiated)?;
        self.state.transition(LifecycleState::ServicesStarting)?;

        let storage = self
            .run_stage(StartupStage::InitStorage, async {
                let setup = settings.instance_setup().with_replication_sender(sink);
                info!(?setup, "Initializing storage");
                let storage = self.storage_factory.initialize(setup).await?;
                if let Some(receiver) = &receiver {
                    receiver.attach(Arc::clone(&storage));
                }
                coordinator.attach_barrier(storage.barrier());
                Ok(storage)
            })
            .await?;

        let mux = self
            .run_stage(StartupStage::RegisterHandlers, async {
                let mux = Arc::new(HttpMux::new());
                let endpoint = api.endpoint();
                endpoint.register_handler(Arc::new(StoreApi::new(Arc::clone(&storage))));
                mux.handle_rpc("/rpc", endpoint);
                mux.handle("/ws", stream_route(Arc::clone(&storage)));
                mux.handle_metrics("/metrics");

                for setting in &settings.triggers {
                    storage.register_trigger(build_matcher(setting)?);
                    info!(module = %setting.module, on = %setting.on, "Registered trigger");
                }
                spawn_uptime_monitor(self.started, settings.uptime_interval, self.lifecycle.clone());
                Ok(mux)
            })
            .await?;

        self.run_stage(StartupStage::StartUtilities, async {
            if let Some(addr) = settings.utilities_addr()? {
                UtilitiesServer::new(self.started_at).start(addr, coordinator.exited())?;
            }
            Ok(())
        })
        .await?;

        self.run_stage(StartupStage::EnableQueries, async {
            info!("Enabling query access");
            self.gate.set(true);
            Ok(())
        })
        .await?;
        self.state.transition(LifecycleState::Queryable)?;

        let serving = self
            .run_stage(StartupStage::BindListeners, async {
                let api_addr = match settings.grpc_listen_addr()? {
                    Some(addr) => Some(api.serve(addr).await?),
                    None => {
                        info!("No RPC listen URL configured, RPC served on /rpc only");
                        None
                    }
                };
                *self.api_addr.lock() = api_addr;
                let (http_addr, serving) =
                    serve_http(settings.listen_addr()?, mux, coordinator.exited())?;
                *self.http_addr.lock() = Some(http_addr);
                info!(http = %http_addr, api = ?api_addr, "Listening for all services");
                Ok(serving)
            })
            .await?;

        serving.await?;
        coordinator.exited().cancelled().await;
        info!("Shutdown complete");
        Ok(())
    }

    /// Run one stage and record its outcome. A failure closes the gate.
    async fn run_stage<T>(
        &self,
        stage: StartupStage,
        work: impl Future<Output = Result<T, StageError>>,
    ) -> LifecycleResult<T> {
        let interrupted = self
            .coordinator
            .lock()
            .as_ref()
            .map_or(false, |coordinator| coordinator.has_started());
        if interrupted {
            return Err(LifecycleError::Interrupted { stage });
        }

        debug!(%stage, "Startup stage");
        let started = Instant::now();
        let result = work.await;
        if result.is_err() {
            self.gate.set(false);
        }
        let outcome = match &result {
            Ok(_) => StageOutcome::Succeeded,
            Err(e) => StageOutcome::Failed(e.to_string()),
        };
        let elapsed = started.elapsed();
        self.stages.lock().push(StageRecord {
            stage,
            outcome,
            elapsed,
            queryable: self.gate.is_open(),
        });

        match result {
            Ok(value) => {
                info!(%stage, elapsed_ms = elapsed.as_millis() as u64, "Startup stage complete");
                Ok(value)
            }
            Err(source) => {
                error!(%stage, error = %source, "Startup stage failed");
                Err(LifecycleError::Startup { stage, source })
            }
        }
    }

    fn diagnostics_source(
        &self,
        role: String,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> DiagnosticsSource {
        let state = Arc::clone(&self.state);
        let gate = self.gate.clone();
        let stages = Arc::clone(&self.stages);
        let started_at = self.started_at;
        let started = self.started;
        Arc::new(move || {
            let barrier = coordinator.barrier();
            DiagnosticsSnapshot {
                taken_at: Utc::now(),
                started_at,
                uptime: started.elapsed(),
                state: state.current(),
                queryable: gate.is_open(),
                role: role.clone(),
                stages: stages.lock().clone(),
                shutdown_pending: barrier
                    .as_ref()
                    .map_or(false, |barrier| barrier.is_shutdown_pending()),
                pending_durable_writes: barrier.map(|barrier| barrier.pending()),
            }
        })
    }
}
