//! Supervisor: the single writer of the strategy registry.
//!
//! Accepts deploy / pause / resume / stop / remove commands, validates deploy
//! specs, owns one gateway per broker instance, and fans registry updates out
//! over a broadcast channel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stratequeue_broker::BrokerAdapter;
use stratequeue_core::{
    Allocation, BrokerCapabilities, Granularity, Price, StrategyId, StrategyRecord, StrategyStatus,
    Symbol, TradingMode,
};
use stratequeue_data::DataManagerHandle;
use stratequeue_engine::{detect_engine, evaluator_registry, registered_engines, SignalEngine};
use stratequeue_gateway::{GatewayConfig, GatewayHandle, OrderGateway};
use stratequeue_portfolio::{LedgerSnapshot, StrategyPortfolio};
use stratequeue_stats::{StatisticsManager, StrategyStats};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::runner::{
    spawn_runner, RunnerCommand, RunnerConfig, RunnerEvent, RunnerHandle, RunnerSpec, StopOptions,
};
use crate::shutdown::ShutdownSignal;

/// Failures surfaced by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("deploy spec invalid: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("supervisor stopped")]
    ChannelClosed,
}

/// Strategy deploy request, as accepted over the control plane.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploySpec {
    /// Path to the user strategy file.
    pub strategy: String,
    /// Human name; defaults to the strategy file stem.
    #[serde(default)]
    pub strategy_id: Option<String>,
    /// Engine name; auto-detected from the strategy file when omitted.
    #[serde(default)]
    pub engine: Option<String>,
    pub symbols: Vec<Symbol>,
    pub granularity: Granularity,
    pub lookback: usize,
    /// Stop automatically after this many minutes.
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    /// Fraction in (0, 1] or an absolute currency amount (> 1).
    pub allocation: Decimal,
    pub data_source: String,
    #[serde(default = "default_broker")]
    pub broker: String,
    pub mode: TradingMode,
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_broker() -> String {
    "paper".to_string()
}

impl DeploySpec {
    /// Fractions at or below one, absolute currency above.
    #[must_use]
    pub fn parsed_allocation(&self) -> Allocation {
        if self.allocation <= Decimal::ONE {
            Allocation::Fraction(self.allocation)
        } else {
            Allocation::Notional(self.allocation)
        }
    }

    fn resolved_id(&self) -> StrategyId {
        match &self.strategy_id {
            Some(id) if !id.trim().is_empty() => StrategyId::new(id.trim()),
            _ => {
                let stem = Path::new(&self.strategy)
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or("strategy");
                StrategyId::new(stem)
            }
        }
    }
}

/// Full view of one strategy for the statistics endpoint.
#[derive(Clone, Debug)]
pub struct StrategySnapshot {
    pub record: StrategyRecord,
    pub stats: Option<Arc<StrategyStats>>,
    pub ledger: Option<LedgerSnapshot>,
}

/// Supervisor tunables.
#[derive(Clone)]
pub struct SupervisorConfig {
    pub runner: RunnerConfig,
    pub gateway: GatewayConfig,
    /// Account equity assumed for allocation checks in `signals` mode.
    pub default_account_equity: Price,
    pub short_selling: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            gateway: GatewayConfig::default(),
            default_account_equity: Decimal::from(100_000),
            short_selling: false,
        }
    }
}

/// External collaborators handed to the supervisor at startup.
pub struct SupervisorDeps {
    pub data: DataManagerHandle,
    pub providers: Vec<String>,
    pub brokers: HashMap<String, Arc<dyn BrokerAdapter>>,
    pub stats: Arc<StatisticsManager>,
    pub clock: Arc<dyn Clock>,
    pub config: SupervisorConfig,
    pub shutdown: ShutdownSignal,
}

enum Request {
    Deploy {
        spec: Box<DeploySpec>,
        respond_to: oneshot::Sender<Result<StrategyId, SupervisorError>>,
    },
    Validate {
        spec: Box<DeploySpec>,
        respond_to: oneshot::Sender<Vec<String>>,
    },
    Pause {
        id: StrategyId,
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Resume {
        id: StrategyId,
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Stop {
        id: StrategyId,
        opts: StopOptions,
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Remove {
        id: StrategyId,
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },
    List {
        respond_to: oneshot::Sender<Vec<StrategyRecord>>,
    },
    Get {
        id: StrategyId,
        respond_to: oneshot::Sender<Option<StrategyRecord>>,
    },
    Snapshot {
        id: StrategyId,
        respond_to: oneshot::Sender<Option<StrategySnapshot>>,
    },
}

/// Cheap cloneable front-end to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Request>,
    registry_tx: broadcast::Sender<StrategyRecord>,
    fatal_rx: watch::Receiver<bool>,
    stats: Arc<StatisticsManager>,
}

impl SupervisorHandle {
    pub async fn deploy(&self, spec: DeploySpec) -> Result<StrategyId, SupervisorError> {
        self.request(|respond_to| Request::Deploy {
            spec: Box::new(spec),
            respond_to,
        })
        .await?
    }

    pub async fn validate(&self, spec: DeploySpec) -> Result<Vec<String>, SupervisorError> {
        self.request(|respond_to| Request::Validate {
            spec: Box::new(spec),
            respond_to,
        })
        .await
    }

    pub async fn pause(&self, id: StrategyId) -> Result<(), SupervisorError> {
        self.request(|respond_to| Request::Pause { id, respond_to })
            .await?
    }

    pub async fn resume(&self, id: StrategyId) -> Result<(), SupervisorError> {
        self.request(|respond_to| Request::Resume { id, respond_to })
            .await?
    }

    pub async fn stop(&self, id: StrategyId, opts: StopOptions) -> Result<(), SupervisorError> {
        self.request(|respond_to| Request::Stop {
            id,
            opts,
            respond_to,
        })
        .await?
    }

    pub async fn remove(&self, id: StrategyId) -> Result<(), SupervisorError> {
        self.request(|respond_to| Request::Remove { id, respond_to })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<StrategyRecord>, SupervisorError> {
        self.request(|respond_to| Request::List { respond_to }).await
    }

    pub async fn get(&self, id: StrategyId) -> Result<Option<StrategyRecord>, SupervisorError> {
        self.request(|respond_to| Request::Get { id, respond_to })
            .await
    }

    pub async fn snapshot(
        &self,
        id: StrategyId,
    ) -> Result<Option<StrategySnapshot>, SupervisorError> {
        self.request(|respond_to| Request::Snapshot { id, respond_to })
            .await
    }

    /// Names of every registered signal engine.
    #[must_use]
    pub fn engines(&self) -> Vec<&'static str> {
        registered_engines()
    }

    /// Subscribe to registry updates. Each message is the updated record.
    #[must_use]
    pub fn subscribe_registry(&self) -> broadcast::Receiver<StrategyRecord> {
        self.registry_tx.subscribe()
    }

    /// Statistics access for read-only consumers.
    #[must_use]
    pub fn stats(&self) -> Arc<StatisticsManager> {
        self.stats.clone()
    }

    /// True once an invariant violation forced a process-fatal shutdown.
    #[must_use]
    pub fn fatal(&self) -> bool {
        *self.fatal_rx.borrow()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)
    }
}

/// The supervisor actor. Spawn with [`Supervisor::spawn`].
pub struct Supervisor {
    deps: SupervisorDeps,
    registry: HashMap<StrategyId, StrategyRecord>,
    deploy_order: Vec<StrategyId>,
    runners: HashMap<StrategyId, RunnerHandle>,
    allocations: HashMap<StrategyId, Price>,
    gateways: HashMap<String, GatewayHandle>,
    final_ledgers: HashMap<StrategyId, LedgerSnapshot>,
    rx: mpsc::Receiver<Request>,
    runner_events_tx: mpsc::Sender<RunnerEvent>,
    runner_events_rx: mpsc::Receiver<RunnerEvent>,
    registry_tx: broadcast::Sender<StrategyRecord>,
    fatal_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn spawn(deps: SupervisorDeps) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let (runner_events_tx, runner_events_rx) = mpsc::channel(1024);
        let (registry_tx, _) = broadcast::channel(256);
        let (fatal_tx, fatal_rx) = watch::channel(false);
        let handle = SupervisorHandle {
            tx,
            registry_tx: registry_tx.clone(),
            fatal_rx,
            stats: deps.stats.clone(),
        };
        let supervisor = Self {
            deps,
            registry: HashMap::new(),
            deploy_order: Vec::new(),
            runners: HashMap::new(),
            allocations: HashMap::new(),
            gateways: HashMap::new(),
            final_ledgers: HashMap::new(),
            rx,
            runner_events_tx,
            runner_events_rx,
            registry_tx,
            fatal_tx,
        };
        let task = tokio::spawn(supervisor.run());
        (handle, task)
    }

    async fn run(mut self) {
        let shutdown = self.deps.shutdown.clone();
        loop {
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(event) = self.runner_events_rx.recv() => self.handle_runner_event(event),
                _ = shutdown.wait() => break,
            }
        }
        // Global shutdown: runners observe the same signal; drain their
        // terminal events so final snapshots land in the registry.
        while !self.runners.is_empty() {
            match tokio::time::timeout(
                std::time::Duration::from_secs(10),
                self.runner_events_rx.recv(),
            )
            .await
            {
                Ok(Some(event)) => self.handle_runner_event(event),
                _ => break,
            }
        }
        info!("supervisor stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Deploy { spec, respond_to } => {
                let _ = respond_to.send(self.deploy(*spec).await);
            }
            Request::Validate { spec, respond_to } => {
                let _ = respond_to.send(self.validate(&spec).await.err().unwrap_or_default());
            }
            Request::Pause { id, respond_to } => {
                let _ = respond_to.send(self.pause(id).await);
            }
            Request::Resume { id, respond_to } => {
                let _ = respond_to.send(self.resume(id).await);
            }
            Request::Stop {
                id,
                opts,
                respond_to,
            } => {
                let _ = respond_to.send(self.stop(id, opts).await);
            }
            Request::Remove { id, respond_to } => {
                let _ = respond_to.send(self.remove(&id));
            }
            Request::List { respond_to } => {
                let records = self
                    .deploy_order
                    .iter()
                    .filter_map(|id| self.registry.get(id).cloned())
                    .collect();
                let _ = respond_to.send(records);
            }
            Request::Get { id, respond_to } => {
                let _ = respond_to.send(self.registry.get(&id).cloned());
            }
            Request::Snapshot { id, respond_to } => {
                let snapshot = self.registry.get(&id).map(|record| StrategySnapshot {
                    record: record.clone(),
                    stats: self.deps.stats.snapshot(&id),
                    ledger: self.final_ledgers.get(&id).cloned(),
                });
                let _ = respond_to.send(snapshot);
            }
        }
    }

    /// Validate a deploy spec, returning the resolved engine name and the
    /// allocation in absolute cash.
    async fn validate(&self, spec: &DeploySpec) -> Result<(String, Price), Vec<String>> {
        let mut errors = Vec::new();
        if spec.symbols.is_empty() {
            errors.push("at least one symbol is required".to_string());
        }
        if spec.lookback == 0 {
            errors.push("lookback must be at least 1".to_string());
        }
        if spec.allocation <= Decimal::ZERO {
            errors.push("allocation must be positive".to_string());
        }
        if !self.deps.providers.contains(&spec.data_source) {
            errors.push(format!("unknown data source: {}", spec.data_source));
        }

        let engine = match &spec.engine {
            Some(engine) => {
                if evaluator_registry().contains(engine) {
                    Some(engine.clone())
                } else {
                    errors.push(format!("unknown engine: {engine}"));
                    None
                }
            }
            None => match std::fs::read_to_string(&spec.strategy) {
                Ok(source) => match detect_engine(&source) {
                    Some(engine) => Some(engine.to_string()),
                    None => {
                        errors.push(format!(
                            "could not detect engine for {}; pass one explicitly",
                            spec.strategy
                        ));
                        None
                    }
                },
                Err(err) => {
                    errors.push(format!("strategy file {}: {err}", spec.strategy));
                    None
                }
            },
        };
        if spec.engine.is_some()
            && !spec.strategy.is_empty()
            && !Path::new(&spec.strategy).exists()
        {
            errors.push(format!("strategy file not found: {}", spec.strategy));
        }

        let account_equity = match self.account_equity(spec).await {
            Ok(equity) => Some(equity),
            Err(reason) => {
                errors.push(reason);
                None
            }
        };

        let mut resolved_cash = None;
        if let Some(equity) = account_equity {
            let cash = spec.parsed_allocation().resolve(equity);
            let allocated: Price = self.allocations.values().copied().sum();
            if allocated + cash > equity {
                errors.push(format!(
                    "allocation {cash} exceeds unallocated equity {}",
                    equity - allocated
                ));
            }
            resolved_cash = Some(cash);
        }

        match (errors.is_empty(), engine, resolved_cash) {
            (true, Some(engine), Some(cash)) => Ok((engine, cash)),
            _ => Err(errors),
        }
    }

    async fn account_equity(&self, spec: &DeploySpec) -> Result<Price, String> {
        if matches!(spec.mode, TradingMode::Signals) {
            return Ok(self.deps.config.default_account_equity);
        }
        let Some(broker) = self.deps.brokers.get(&spec.broker) else {
            return Err(format!("unknown broker: {}", spec.broker));
        };
        broker
            .account_equity()
            .await
            .map_err(|err| format!("broker {} unavailable: {err}", spec.broker))
    }

    async fn deploy(&mut self, spec: DeploySpec) -> Result<StrategyId, SupervisorError> {
        let (engine_name, cash) = self
            .validate(&spec)
            .await
            .map_err(SupervisorError::Validation)?;
        let id = spec.resolved_id();
        if let Some(existing) = self.registry.get(&id) {
            if !existing.status.is_terminal() {
                return Err(SupervisorError::InvalidState(format!(
                    "strategy {id} is already deployed"
                )));
            }
            // Redeploying over a terminal record replaces it.
            self.remove(&id).ok();
        }

        let engine = SignalEngine::load(&engine_name, &spec.params)
            .map_err(|err| SupervisorError::Validation(vec![err.to_string()]))?;

        let broker = if matches!(spec.mode, TradingMode::Signals) {
            None
        } else {
            self.deps.brokers.get(&spec.broker).cloned()
        };
        let capabilities = broker
            .as_ref()
            .map(|broker| broker.capabilities())
            .unwrap_or_else(BrokerCapabilities::default);
        let portfolio = StrategyPortfolio::new(id.clone(), cash, capabilities)
            .with_short_selling(self.deps.config.short_selling);

        let (gateway, gateway_rx) = match (&broker, spec.mode) {
            (Some(broker), TradingMode::Paper | TradingMode::Live) => {
                let gateway = self.gateway_for(&spec.broker, broker.clone());
                let (tx, rx) = mpsc::channel(256);
                gateway
                    .register_events(id.clone(), tx)
                    .await
                    .map_err(|_| SupervisorError::ChannelClosed)?;
                (Some(gateway), Some(rx))
            }
            _ => (None, None),
        };

        let record = StrategyRecord {
            id: id.clone(),
            name: id.to_string(),
            source_path: spec.strategy.clone(),
            engine: engine_name,
            data_source: spec.data_source.clone(),
            symbols: spec.symbols.clone(),
            granularity: spec.granularity,
            lookback: spec.lookback,
            allocation: spec.parsed_allocation(),
            mode: spec.mode,
            status: StrategyStatus::Initializing,
            created_at: self.deps.clock.now(),
            started_at: None,
            last_signal_ts: None,
            last_signal_type: None,
            params: spec.params.clone(),
        };
        self.deps.stats.register(&id, cash);
        self.allocations.insert(id.clone(), cash);
        self.registry.insert(id.clone(), record.clone());
        self.deploy_order.push(id.clone());
        self.broadcast(&record);

        let runner = spawn_runner(RunnerSpec {
            id: id.clone(),
            provider: spec.data_source.clone(),
            symbols: spec.symbols.clone(),
            granularity: spec.granularity,
            lookback: spec.lookback,
            mode: spec.mode,
            duration: spec.duration_minutes.map(chrono::Duration::minutes),
            engine,
            portfolio,
            broker,
            gateway,
            gateway_rx,
            stats: self.deps.stats.clone(),
            data: self.deps.data.clone(),
            clock: self.deps.clock.clone(),
            config: self.deps.config.runner.clone(),
            shutdown: self.deps.shutdown.clone(),
            events_tx: self.runner_events_tx.clone(),
        });
        self.runners.insert(id.clone(), runner);
        info!(strategy = %id, "strategy deployed");
        Ok(id)
    }

    fn gateway_for(&mut self, name: &str, broker: Arc<dyn BrokerAdapter>) -> GatewayHandle {
        if let Some(gateway) = self.gateways.get(name) {
            return gateway.clone();
        }
        let (gateway, _task) = OrderGateway::spawn(broker, self.deps.config.gateway.clone());
        self.gateways.insert(name.to_string(), gateway.clone());
        gateway
    }

    async fn pause(&mut self, id: StrategyId) -> Result<(), SupervisorError> {
        match self.status_of(&id)? {
            StrategyStatus::Running => {
                self.send_to_runner(&id, RunnerCommand::Pause).await;
                Ok(())
            }
            StrategyStatus::Paused => Ok(()),
            status => Err(SupervisorError::InvalidState(format!(
                "cannot pause strategy in {status:?}"
            ))),
        }
    }

    async fn resume(&mut self, id: StrategyId) -> Result<(), SupervisorError> {
        match self.status_of(&id)? {
            StrategyStatus::Paused => {
                self.send_to_runner(&id, RunnerCommand::Resume).await;
                Ok(())
            }
            StrategyStatus::Running => Ok(()),
            status => Err(SupervisorError::InvalidState(format!(
                "cannot resume strategy in {status:?}"
            ))),
        }
    }

    async fn stop(&mut self, id: StrategyId, opts: StopOptions) -> Result<(), SupervisorError> {
        let status = self.status_of(&id)?;
        if status.is_terminal() {
            // Stopping an already-stopped strategy is idempotent.
            return Ok(());
        }
        self.send_to_runner(&id, RunnerCommand::Stop(opts)).await;
        Ok(())
    }

    fn remove(&mut self, id: &StrategyId) -> Result<(), SupervisorError> {
        let Some(record) = self.registry.get(id) else {
            return Err(SupervisorError::UnknownStrategy(id.to_string()));
        };
        if !record.status.is_terminal() {
            return Err(SupervisorError::InvalidState(format!(
                "strategy {id} is still {:?}",
                record.status
            )));
        }
        self.registry.remove(id);
        self.deploy_order.retain(|existing| existing != id);
        self.allocations.remove(id);
        self.final_ledgers.remove(id);
        self.runners.remove(id);
        self.deps.stats.remove(id);
        Ok(())
    }

    fn status_of(&self, id: &StrategyId) -> Result<StrategyStatus, SupervisorError> {
        self.registry
            .get(id)
            .map(|record| record.status)
            .ok_or_else(|| SupervisorError::UnknownStrategy(id.to_string()))
    }

    async fn send_to_runner(&mut self, id: &StrategyId, command: RunnerCommand) {
        if let Some(runner) = self.runners.get(id) {
            if !runner.send(command).await {
                warn!(strategy = %id, "runner command channel closed");
            }
        }
    }

    fn handle_runner_event(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::Status { id, status } => {
                if let Some(record) = self.registry.get_mut(&id) {
                    record.status = status;
                    if status == StrategyStatus::Running && record.started_at.is_none() {
                        record.started_at = Some(self.deps.clock.now());
                    }
                    let record = record.clone();
                    if status.is_terminal() {
                        self.allocations.remove(&id);
                    }
                    self.broadcast(&record);
                }
            }
            RunnerEvent::Signal {
                id,
                ts,
                signal_type,
            } => {
                if let Some(record) = self.registry.get_mut(&id) {
                    record.last_signal_ts = Some(ts);
                    record.last_signal_type = Some(signal_type);
                }
            }
            RunnerEvent::Fatal { id, reason } => {
                error!(
                    strategy = %id,
                    reason = %reason,
                    "invariant violation; shutting the process down"
                );
                let _ = self.fatal_tx.send(true);
                self.deps.shutdown.trigger();
            }
            RunnerEvent::Terminated { id, ledger } => {
                self.final_ledgers.insert(id.clone(), ledger);
                self.runners.remove(&id);
                if let Some(record) = self.registry.get_mut(&id) {
                    if !record.status.is_terminal() {
                        record.status = StrategyStatus::Stopped;
                    }
                    let record = record.clone();
                    self.allocations.remove(&id);
                    self.broadcast(&record);
                }
            }
        }
    }

    fn broadcast(&self, record: &StrategyRecord) {
        // Lagging or absent subscribers are fine.
        let _ = self.registry_tx.send(record.clone());
    }
}
