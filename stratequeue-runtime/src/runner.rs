//! Per-strategy state machine driving the tick loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stratequeue_broker::BrokerAdapter;
use stratequeue_core::{
    Bar, Granularity, OrderId, OrderState, Signal, SignalType, StrategyId, StrategyStatus, Symbol,
    TradingMode,
};
use stratequeue_data::{DataManagerHandle, SnapshotState, SubscriptionHandle};
use stratequeue_engine::{EngineError, SignalEngine};
use stratequeue_gateway::{GatewayEvent, GatewayHandle};
use stratequeue_portfolio::{LedgerSnapshot, PortfolioError, SizeOutcome, StrategyPortfolio};
use stratequeue_stats::StatisticsManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{spawn_tick_stream, Clock, Tick};
use crate::shutdown::ShutdownSignal;

/// Runner tunables; defaults follow the runtime contract (5 s evaluator
/// timeout, 60 s warmup timeout, 5 consecutive errors, 2 s settle delay).
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub evaluator_timeout: Duration,
    pub warmup_timeout: Duration,
    pub settle_delay: Duration,
    pub max_consecutive_errors: u32,
    pub stop_drain_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            evaluator_timeout: Duration::from_secs(5),
            warmup_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(2),
            max_consecutive_errors: 5,
            stop_drain_timeout: Duration::from_secs(30),
        }
    }
}

/// How a strategy should be stopped.
#[derive(Clone, Copy, Debug, Default)]
pub struct StopOptions {
    /// Submit closing market orders for every open position.
    pub liquidate: bool,
    /// Cancel working orders instead of waiting for them to terminate.
    pub force: bool,
}

/// Commands the supervisor sends to a runner.
#[derive(Debug)]
pub enum RunnerCommand {
    Pause,
    Resume,
    Stop(StopOptions),
}

/// Notifications a runner sends back to the supervisor.
#[derive(Debug)]
pub enum RunnerEvent {
    Status {
        id: StrategyId,
        status: StrategyStatus,
    },
    Signal {
        id: StrategyId,
        ts: DateTime<Utc>,
        signal_type: SignalType,
    },
    /// An invariant broke; the supervisor escalates to process shutdown.
    Fatal {
        id: StrategyId,
        reason: String,
    },
    /// The runner finished its cleanup; carries the final ledger snapshot.
    Terminated {
        id: StrategyId,
        ledger: LedgerSnapshot,
    },
}

/// Front-end the supervisor keeps per runner.
pub struct RunnerHandle {
    pub id: StrategyId,
    cmd_tx: mpsc::Sender<RunnerCommand>,
    pub task: JoinHandle<()>,
}

impl RunnerHandle {
    pub async fn send(&self, command: RunnerCommand) -> bool {
        self.cmd_tx.send(command).await.is_ok()
    }
}

/// Everything a runner needs, assembled by the supervisor.
pub struct RunnerSpec {
    pub id: StrategyId,
    pub provider: String,
    pub symbols: Vec<Symbol>,
    pub granularity: Granularity,
    pub lookback: usize,
    pub mode: TradingMode,
    pub duration: Option<chrono::Duration>,
    pub engine: SignalEngine,
    pub portfolio: StrategyPortfolio,
    pub broker: Option<Arc<dyn BrokerAdapter>>,
    pub gateway: Option<GatewayHandle>,
    pub gateway_rx: Option<mpsc::Receiver<GatewayEvent>>,
    pub stats: Arc<StatisticsManager>,
    pub data: DataManagerHandle,
    pub clock: Arc<dyn Clock>,
    pub config: RunnerConfig,
    pub shutdown: ShutdownSignal,
    pub events_tx: mpsc::Sender<RunnerEvent>,
}

/// Spawn the runner task for a validated deploy.
pub fn spawn_runner(spec: RunnerSpec) -> RunnerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let id = spec.id.clone();
    let runner = StrategyRunner {
        id: spec.id,
        provider: spec.provider,
        symbols: spec.symbols,
        granularity: spec.granularity,
        lookback: spec.lookback,
        mode: spec.mode,
        duration: spec.duration,
        engine: Arc::new(std::sync::Mutex::new(spec.engine)),
        portfolio: spec.portfolio,
        broker: spec.broker,
        gateway: spec.gateway,
        gateway_rx: spec.gateway_rx,
        stats: spec.stats,
        data: spec.data,
        clock: spec.clock,
        config: spec.config,
        shutdown: spec.shutdown,
        events_tx: spec.events_tx,
        cmd_rx,
        status: StrategyStatus::Initializing,
        consecutive_errors: 0,
        open_orders: HashMap::new(),
        fatal: false,
    };
    let task = tokio::spawn(runner.run());
    RunnerHandle { id, cmd_tx, task }
}

enum EvalResult {
    Done(Result<Signal, EngineError>),
    Busy,
}

struct StrategyRunner {
    id: StrategyId,
    provider: String,
    symbols: Vec<Symbol>,
    granularity: Granularity,
    lookback: usize,
    mode: TradingMode,
    duration: Option<chrono::Duration>,
    engine: Arc<std::sync::Mutex<SignalEngine>>,
    portfolio: StrategyPortfolio,
    broker: Option<Arc<dyn BrokerAdapter>>,
    gateway: Option<GatewayHandle>,
    gateway_rx: Option<mpsc::Receiver<GatewayEvent>>,
    stats: Arc<StatisticsManager>,
    data: DataManagerHandle,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
    shutdown: ShutdownSignal,
    events_tx: mpsc::Sender<RunnerEvent>,
    cmd_rx: mpsc::Receiver<RunnerCommand>,
    status: StrategyStatus,
    consecutive_errors: u32,
    open_orders: HashMap<OrderId, OrderState>,
    fatal: bool,
}

impl StrategyRunner {
    async fn run(mut self) {
        self.set_status(StrategyStatus::Initializing).await;
        let handles = match self.subscribe_all().await {
            Ok(handles) => handles,
            Err(reason) => {
                self.finish_errored(reason, Vec::new()).await;
                return;
            }
        };

        let stop_opts = match self.warmup(&handles).await {
            WarmupOutcome::Ready => None,
            WarmupOutcome::Stop(opts) => Some(opts),
            WarmupOutcome::Failed(reason) => {
                self.finish_errored(reason, handles).await;
                return;
            }
        };
        if let Some(opts) = stop_opts {
            self.shutdown_sequence(opts, handles).await;
            return;
        }

        let tick_shutdown = ShutdownSignal::new();
        let (mut tick_rx, _dropped_ticks, tick_task) = spawn_tick_stream(
            self.clock.clone(),
            self.granularity,
            self.config.settle_delay,
            tick_shutdown.clone(),
        );
        self.set_status(StrategyStatus::Running).await;
        info!(strategy = %self.id, symbols = ?self.symbols, "strategy running");

        let deadline = self.duration.map(|duration| self.clock.now() + duration);
        let opts = loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(RunnerCommand::Pause) => {
                        if self.status == StrategyStatus::Running {
                            self.set_status(StrategyStatus::Paused).await;
                        }
                    }
                    Some(RunnerCommand::Resume) => {
                        if self.status == StrategyStatus::Paused {
                            self.set_status(StrategyStatus::Running).await;
                        }
                    }
                    Some(RunnerCommand::Stop(opts)) => break opts,
                    None => break StopOptions::default(),
                },
                Some(tick) = tick_rx.recv() => {
                    // Ticks that land while paused are dropped by design.
                    if self.status == StrategyStatus::Running {
                        self.process_tick(tick, &handles).await;
                        if self.fatal || self.status == StrategyStatus::Errored {
                            break StopOptions::default();
                        }
                    }
                }
                Some(event) = recv_opt(&mut self.gateway_rx) => {
                    self.handle_gateway_event(event).await;
                    if self.fatal {
                        break StopOptions::default();
                    }
                }
                _ = sleep_until_opt(self.clock.as_ref(), deadline) => {
                    info!(strategy = %self.id, "configured duration elapsed; stopping");
                    break StopOptions::default();
                }
                _ = self.shutdown.wait() => break StopOptions::default(),
            }
        };
        tick_shutdown.trigger();
        let _ = tick_task.await;
        self.shutdown_sequence(opts, handles).await;
    }

    async fn subscribe_all(&mut self) -> Result<Vec<SubscriptionHandle>, String> {
        let mut handles = Vec::with_capacity(self.symbols.len());
        for symbol in self.symbols.clone() {
            match self
                .data
                .subscribe(&self.provider, &symbol, self.granularity, self.lookback)
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(err) => return Err(format!("subscription for {symbol} failed: {err}")),
            }
        }
        Ok(handles)
    }

    async fn warmup(&mut self, handles: &[SubscriptionHandle]) -> WarmupOutcome {
        let started = tokio::time::Instant::now();
        loop {
            if self.shutdown.triggered() {
                return WarmupOutcome::Stop(StopOptions::default());
            }
            match self.cmd_rx.try_recv() {
                Ok(RunnerCommand::Stop(opts)) => return WarmupOutcome::Stop(opts),
                Ok(_) => {} // pause/resume are meaningless before RUNNING
                Err(_) => {}
            }
            let mut ready = true;
            for handle in handles {
                match handle.snapshot().await {
                    Ok(SnapshotState::Ready { .. }) => {}
                    Ok(SnapshotState::NotReady { have, need }) => {
                        debug!(strategy = %self.id, have, need, "warmup in progress");
                        ready = false;
                    }
                    Ok(SnapshotState::Failed { reason }) => {
                        return WarmupOutcome::Failed(reason);
                    }
                    Err(err) => return WarmupOutcome::Failed(err.to_string()),
                }
            }
            if ready {
                return WarmupOutcome::Ready;
            }
            if started.elapsed() > self.config.warmup_timeout {
                return WarmupOutcome::Failed("warmup timed out".to_string());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn process_tick(&mut self, tick: Tick, handles: &[SubscriptionHandle]) {
        for (index, symbol) in self.symbols.clone().into_iter().enumerate() {
            let snapshot = match handles[index].snapshot().await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    self.fail(format!("data manager unavailable: {err}")).await;
                    return;
                }
            };
            match snapshot {
                SnapshotState::Ready { window, stale } => {
                    if stale {
                        warn!(strategy = %self.id, symbol = %symbol, "buffer stale; skipping tick");
                        self.note_strategy_error().await;
                        continue;
                    }
                    let last = window.last().expect("ready window is non-empty").clone();
                    if let Some(broker) = &self.broker {
                        broker.on_market_data(&last);
                    }
                    let mark = self.portfolio.mark(&symbol, last.close);
                    self.stats.on_event(&mark);
                    self.evaluate_and_dispatch(&symbol, window.bars().to_vec(), tick)
                        .await;
                    if self.fatal || self.status == StrategyStatus::Errored {
                        return;
                    }
                }
                SnapshotState::NotReady { .. } => {
                    debug!(strategy = %self.id, symbol = %symbol, "window not ready; skipping");
                }
                SnapshotState::Failed { reason } => {
                    self.fail(format!("data subscription failed: {reason}")).await;
                    return;
                }
            }
        }
    }

    async fn evaluate_and_dispatch(&mut self, symbol: &str, bars: Vec<Bar>, tick: Tick) {
        let engine = self.engine.clone();
        let eval = tokio::task::spawn_blocking(move || match engine.try_lock() {
            Ok(mut engine) => EvalResult::Done(engine.evaluate(&bars)),
            Err(_) => EvalResult::Busy,
        });
        match tokio::time::timeout(self.config.evaluator_timeout, eval).await {
            Ok(Ok(EvalResult::Done(Ok(signal)))) => {
                self.consecutive_errors = 0;
                self.handle_signal(symbol, signal).await;
            }
            Ok(Ok(EvalResult::Done(Err(EngineError::NotEnoughData { have, need })))) => {
                debug!(strategy = %self.id, have, need, "evaluator warming up");
            }
            Ok(Ok(EvalResult::Done(Err(err)))) => {
                warn!(strategy = %self.id, symbol = %symbol, error = %err, "evaluator failed");
                self.note_strategy_error().await;
            }
            Ok(Ok(EvalResult::Busy)) => {
                debug!(
                    strategy = %self.id,
                    scheduled_for = %tick.scheduled_for,
                    "previous evaluation still running; tick skipped"
                );
            }
            Ok(Err(join_err)) => {
                warn!(strategy = %self.id, error = %join_err, "evaluator panicked");
                self.note_strategy_error().await;
            }
            Err(_) => {
                warn!(
                    strategy = %self.id,
                    timeout_ms = self.config.evaluator_timeout.as_millis() as u64,
                    "evaluator timed out; tick skipped"
                );
                self.note_strategy_error().await;
            }
        }
    }

    async fn handle_signal(&mut self, symbol: &str, signal: Signal) {
        self.stats.record_signal(
            &self.id,
            symbol,
            signal.signal_type,
            signal.price,
            signal.timestamp,
        );
        let _ = self
            .events_tx
            .send(RunnerEvent::Signal {
                id: self.id.clone(),
                ts: signal.timestamp,
                signal_type: signal.signal_type,
            })
            .await;
        if matches!(signal.signal_type, SignalType::Hold) {
            return;
        }
        if matches!(self.mode, TradingMode::Signals) {
            // Observe-only: the signal is recorded, the gateway is bypassed.
            return;
        }
        match self.portfolio.size_signal(symbol, &signal) {
            SizeOutcome::Order(order) => {
                info!(
                    strategy = %self.id,
                    symbol = %symbol,
                    side = ?order.side,
                    qty = %order.qty,
                    "submitting order"
                );
                self.open_orders.insert(order.id, order.state);
                if let Some(gateway) = &self.gateway {
                    if gateway.submit(order).await.is_err() {
                        warn!(strategy = %self.id, "gateway unavailable; order not submitted");
                    }
                }
            }
            SizeOutcome::Rejected(rejection) => {
                info!(
                    strategy = %self.id,
                    symbol = %symbol,
                    reason = ?rejection.reason,
                    detail = %rejection.detail,
                    "order proposal rejected"
                );
                self.stats.record_rejection(&self.id);
            }
            SizeOutcome::NoAction => {}
        }
    }

    async fn handle_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Fill(fill) => match self.portfolio.apply_fill(&fill) {
                Ok((application, event)) => {
                    debug!(
                        strategy = %self.id,
                        symbol = %fill.symbol,
                        qty = %fill.qty,
                        realized = %application.realized_delta,
                        "fill applied"
                    );
                    self.stats.on_event(&event);
                }
                Err(PortfolioError::InvariantViolation(reason)) => {
                    error!(strategy = %self.id, reason = %reason, "ledger invariant violation");
                    self.fatal = true;
                    let _ = self
                        .events_tx
                        .send(RunnerEvent::Fatal {
                            id: self.id.clone(),
                            reason,
                        })
                        .await;
                }
                Err(err) => {
                    warn!(strategy = %self.id, error = %err, "fill not applied");
                }
            },
            GatewayEvent::OrderUpdate(order) => {
                if order.state.is_terminal() {
                    self.open_orders.remove(&order.id);
                } else {
                    self.open_orders.insert(order.id, order.state);
                }
            }
            GatewayEvent::Rejected { order, reason } => {
                warn!(
                    strategy = %self.id,
                    order_id = %order.id,
                    reason = %reason,
                    "order rejected"
                );
                self.open_orders.remove(&order.id);
                self.stats.record_rejection(&self.id);
            }
        }
    }

    async fn shutdown_sequence(mut self, opts: StopOptions, handles: Vec<SubscriptionHandle>) {
        let errored = self.status == StrategyStatus::Errored || self.fatal;
        self.set_status(StrategyStatus::Stopping).await;
        if let Some(gateway) = self.gateway.clone() {
            if opts.force {
                for order_id in self.open_orders.keys().copied().collect::<Vec<_>>() {
                    let _ = gateway.cancel(order_id).await;
                }
            }
            if opts.liquidate {
                self.submit_liquidations(&gateway).await;
            }
            self.drain_open_orders().await;
            let _ = gateway.deregister(self.id.clone()).await;
        }
        for handle in handles {
            handle.release().await;
        }
        let final_status = if errored {
            StrategyStatus::Errored
        } else {
            StrategyStatus::Stopped
        };
        self.set_status(final_status).await;
        let ledger = self.portfolio.snapshot();
        info!(
            strategy = %self.id,
            status = ?final_status,
            equity = %ledger.equity,
            realized = %ledger.realized_pnl,
            "strategy terminated"
        );
        let _ = self
            .events_tx
            .send(RunnerEvent::Terminated {
                id: self.id.clone(),
                ledger,
            })
            .await;
    }

    /// Submit a closing market order for every open position.
    async fn submit_liquidations(&mut self, gateway: &GatewayHandle) {
        for (symbol, qty) in self.portfolio.open_positions() {
            let price = match self.portfolio.last_mark(&symbol) {
                Some(price) => price,
                None => {
                    warn!(strategy = %self.id, symbol = %symbol, "no mark price; cannot liquidate");
                    continue;
                }
            };
            let close = Signal::new(SignalType::Close, price, self.clock.now());
            match self.portfolio.size_signal(&symbol, &close) {
                SizeOutcome::Order(order) => {
                    info!(
                        strategy = %self.id,
                        symbol = %symbol,
                        qty = %qty,
                        "liquidating position"
                    );
                    self.open_orders.insert(order.id, order.state);
                    if gateway.submit(order).await.is_err() {
                        warn!(strategy = %self.id, "gateway unavailable during liquidation");
                    }
                }
                SizeOutcome::Rejected(rejection) => {
                    warn!(
                        strategy = %self.id,
                        symbol = %symbol,
                        reason = ?rejection.reason,
                        "liquidation order rejected"
                    );
                }
                SizeOutcome::NoAction => {}
            }
        }
    }

    /// Wait for every outstanding order to reach a terminal state, applying
    /// fills as they land, bounded by the drain timeout.
    async fn drain_open_orders(&mut self) {
        let deadline = tokio::time::Instant::now() + self.config.stop_drain_timeout;
        while !self.open_orders.is_empty() {
            let Some(rx) = self.gateway_rx.as_mut() else {
                break;
            };
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => self.handle_gateway_event(event).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        strategy = %self.id,
                        outstanding = self.open_orders.len(),
                        "stop drain timed out with orders still open"
                    );
                    break;
                }
            }
        }
    }

    async fn note_strategy_error(&mut self) {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.config.max_consecutive_errors {
            self.fail(format!(
                "{} consecutive strategy errors",
                self.consecutive_errors
            ))
            .await;
        }
    }

    async fn fail(&mut self, reason: String) {
        error!(strategy = %self.id, reason = %reason, "strategy errored");
        self.set_status(StrategyStatus::Errored).await;
    }

    async fn finish_errored(mut self, reason: String, handles: Vec<SubscriptionHandle>) {
        self.fail(reason).await;
        self.shutdown_sequence(StopOptions::default(), handles).await;
    }

    async fn set_status(&mut self, status: StrategyStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        let _ = self
            .events_tx
            .send(RunnerEvent::Status {
                id: self.id.clone(),
                status,
            })
            .await;
    }
}

enum WarmupOutcome {
    Ready,
    Stop(StopOptions),
    Failed(String),
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(clock: &dyn Clock, deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => clock.sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
