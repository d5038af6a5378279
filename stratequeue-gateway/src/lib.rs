//! Order lifecycle tracking and broker I/O.
//!
//! The gateway is the single owner of the open-order table. Runners submit
//! sized orders and receive attributed events back over their registered
//! channels; pushed broker fills are authoritative, a polling sweep backstops
//! brokers that go quiet, and the `(broker_order_id, sequence)` key makes
//! fill application at-most-once regardless of delivery path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stratequeue_broker::{
    BrokerAdapter, BrokerError, BrokerEvent, BrokerFill, BrokerOrderStatus, OrderAck, OrderRequest,
};
use stratequeue_core::{BrokerOrderId, Fill, FillKey, Order, OrderId, OrderState, StrategyId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures surfaced by the gateway handle.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("order gateway stopped")]
    ChannelClosed,
}

/// Terminal orders retained for observability after release.
const RECENT_ORDERS_CAP: usize = 256;

/// Attributed event delivered to the owning strategy's runner.
#[derive(Clone, Debug)]
pub enum GatewayEvent {
    /// A deduplicated, attributed fill. The synchronisation edge for ledger
    /// updates.
    Fill(Fill),
    /// Any order state change, including terminal states.
    OrderUpdate(Order),
    /// The broker refused the order outright.
    Rejected { order: Order, reason: String },
}

/// Tunables; defaults follow the runtime's contract (10 s broker RPC
/// timeout, 1 s polling for working orders).
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub submit_timeout: Duration,
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

enum Command {
    Submit(Box<Order>),
    Cancel(OrderId),
    OpenOrders {
        respond_to: oneshot::Sender<Vec<Order>>,
    },
    RegisterEvents {
        strategy_id: StrategyId,
        tx: mpsc::Sender<GatewayEvent>,
    },
    Deregister {
        strategy_id: StrategyId,
    },
    Submitted {
        order_id: OrderId,
        result: Result<OrderAck, SubmitFailure>,
    },
    SweepResult(SweepResult),
    Shutdown,
}

enum SubmitFailure {
    Rejected(String),
    TimedOut,
    Transport(String),
}

#[derive(Default)]
struct SweepResult {
    polled: Vec<(OrderId, Result<BrokerOrderStatus, BrokerError>)>,
    adoptions: Vec<(OrderId, Result<Option<BrokerOrderStatus>, BrokerError>)>,
}

/// Cheap cloneable front-end to the gateway actor.
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<Command>,
}

impl GatewayHandle {
    /// Queue an order for submission. Updates arrive as [`GatewayEvent`]s on
    /// the owning strategy's registered channel.
    pub async fn submit(&self, order: Order) -> GatewayResult<()> {
        self.tx
            .send(Command::Submit(Box::new(order)))
            .await
            .map_err(|_| GatewayError::ChannelClosed)
    }

    /// Request cancellation of a tracked order.
    pub async fn cancel(&self, order_id: OrderId) -> GatewayResult<()> {
        self.tx
            .send(Command::Cancel(order_id))
            .await
            .map_err(|_| GatewayError::ChannelClosed)
    }

    /// Snapshot of every order still in the open table.
    pub async fn open_orders(&self) -> GatewayResult<Vec<Order>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::OpenOrders { respond_to: tx })
            .await
            .map_err(|_| GatewayError::ChannelClosed)?;
        rx.await.map_err(|_| GatewayError::ChannelClosed)
    }

    /// Route this strategy's events to `tx`.
    pub async fn register_events(
        &self,
        strategy_id: StrategyId,
        tx: mpsc::Sender<GatewayEvent>,
    ) -> GatewayResult<()> {
        self.tx
            .send(Command::RegisterEvents { strategy_id, tx })
            .await
            .map_err(|_| GatewayError::ChannelClosed)
    }

    /// Stop routing events for this strategy.
    pub async fn deregister(&self, strategy_id: StrategyId) -> GatewayResult<()> {
        self.tx
            .send(Command::Deregister { strategy_id })
            .await
            .map_err(|_| GatewayError::ChannelClosed)
    }

    /// Ask the actor to stop after draining queued commands.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// The gateway actor. Spawn with [`OrderGateway::spawn`].
pub struct OrderGateway {
    broker: Arc<dyn BrokerAdapter>,
    config: GatewayConfig,
    rx: mpsc::Receiver<Command>,
    tx: mpsc::Sender<Command>,
    open: HashMap<OrderId, Order>,
    by_broker: HashMap<BrokerOrderId, OrderId>,
    /// Orders whose submission acknowledgement timed out; reconciliation
    /// adopts the broker's state or rejects them.
    needs_adoption: HashSet<OrderId>,
    applied_fills: HashSet<FillKey>,
    recent: VecDeque<Order>,
    subscribers: HashMap<StrategyId, mpsc::Sender<GatewayEvent>>,
    sweep_in_flight: bool,
}

impl OrderGateway {
    pub fn spawn(
        broker: Arc<dyn BrokerAdapter>,
        config: GatewayConfig,
    ) -> (GatewayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(512);
        let gateway = Self {
            broker,
            config,
            rx,
            tx: tx.clone(),
            open: HashMap::new(),
            by_broker: HashMap::new(),
            needs_adoption: HashSet::new(),
            applied_fills: HashSet::new(),
            recent: VecDeque::new(),
            subscribers: HashMap::new(),
            sweep_in_flight: false,
        };
        let task = tokio::spawn(gateway.run());
        (GatewayHandle { tx }, task)
    }

    async fn run(mut self) {
        let mut poll_timer = tokio::time::interval(self.config.poll_interval);
        let mut reconcile_timer = tokio::time::interval(self.config.reconcile_interval);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        reconcile_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = self.broker.next_event() => {
                    match event {
                        Ok(Some(event)) => self.handle_broker_event(event).await,
                        Ok(None) => {
                            // Pull-only broker; yield to the timers.
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                        Err(err) => {
                            warn!(error = %err, "broker event stream error");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = poll_timer.tick() => self.start_sweep(false),
                _ = reconcile_timer.tick() => self.start_sweep(true),
            }
        }
        debug!("order gateway stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(order) => self.handle_submit(*order),
            Command::Cancel(order_id) => self.handle_cancel(order_id).await,
            Command::OpenOrders { respond_to } => {
                let _ = respond_to.send(self.open.values().cloned().collect());
            }
            Command::RegisterEvents { strategy_id, tx } => {
                self.subscribers.insert(strategy_id, tx);
            }
            Command::Deregister { strategy_id } => {
                self.subscribers.remove(&strategy_id);
            }
            Command::Submitted { order_id, result } => {
                self.handle_submitted(order_id, result).await;
            }
            Command::SweepResult(result) => {
                self.sweep_in_flight = false;
                self.apply_sweep(result).await;
            }
            Command::Shutdown => {}
        }
    }

    fn handle_submit(&mut self, order: Order) {
        let request = OrderRequest {
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.qty,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
            time_in_force: order.time_in_force,
            client_order_id: Some(order.id.to_string()),
        };
        let order_id = order.id;
        self.open.insert(order_id, order);
        let broker = self.broker.clone();
        let tx = self.tx.clone();
        let timeout = self.config.submit_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, broker.place_order(request)).await {
                Ok(Ok(ack)) => Ok(ack),
                Ok(Err(BrokerError::Rejected(reason))) => Err(SubmitFailure::Rejected(reason)),
                Ok(Err(BrokerError::InvalidRequest(reason))) => {
                    Err(SubmitFailure::Rejected(reason))
                }
                Ok(Err(err)) => Err(SubmitFailure::Transport(err.to_string())),
                Err(_) => Err(SubmitFailure::TimedOut),
            };
            let _ = tx.send(Command::Submitted { order_id, result }).await;
        });
    }

    async fn handle_submitted(&mut self, order_id: OrderId, result: Result<OrderAck, SubmitFailure>) {
        let Some(mut order) = self.open.remove(&order_id) else {
            return;
        };
        match result {
            Ok(ack) => {
                info!(
                    order_id = %order_id,
                    broker_order_id = %ack.broker_order_id,
                    symbol = %order.symbol,
                    "order acknowledged by broker"
                );
                order.broker_order_id = Some(ack.broker_order_id.clone());
                order.state = if ack.state.is_open() {
                    ack.state
                } else {
                    OrderState::Working
                };
                self.by_broker.insert(ack.broker_order_id, order_id);
                self.open.insert(order_id, order.clone());
                self.emit(&order.strategy_id.clone(), GatewayEvent::OrderUpdate(order))
                    .await;
                // Terminal-on-ack (e.g. immediate paper fills) resolves via
                // the broker's event stream or the next poll sweep.
            }
            Err(SubmitFailure::Rejected(reason)) => {
                warn!(order_id = %order_id, reason = %reason, "order rejected by broker");
                order.state = OrderState::Rejected;
                order.terminal_ts = Some(Utc::now());
                self.retain_terminal(order.clone());
                self.emit(
                    &order.strategy_id.clone(),
                    GatewayEvent::Rejected { order, reason },
                )
                .await;
            }
            Err(SubmitFailure::TimedOut) => {
                warn!(order_id = %order_id, "submission timed out; scheduling reconciliation");
                self.open.insert(order_id, order);
                self.needs_adoption.insert(order_id);
            }
            Err(SubmitFailure::Transport(reason)) => {
                warn!(
                    order_id = %order_id,
                    reason = %reason,
                    "submission transport failure; scheduling reconciliation"
                );
                self.open.insert(order_id, order);
                self.needs_adoption.insert(order_id);
            }
        }
    }

    async fn handle_cancel(&mut self, order_id: OrderId) {
        let Some(order) = self.open.get(&order_id).cloned() else {
            return;
        };
        match &order.broker_order_id {
            Some(broker_id) => {
                let broker = self.broker.clone();
                let broker_id = broker_id.clone();
                let symbol = order.symbol.clone();
                // The resulting Canceled state arrives via events or polling.
                tokio::spawn(async move {
                    if let Err(err) = broker.cancel_order(&broker_id, &symbol).await {
                        warn!(broker_order_id = %broker_id, error = %err, "cancel request failed");
                    }
                });
            }
            None => {
                // Never reached the broker; cancel locally.
                let mut order = self.open.remove(&order_id).expect("order present");
                self.needs_adoption.remove(&order_id);
                order.state = OrderState::Canceled;
                order.terminal_ts = Some(Utc::now());
                self.retain_terminal(order.clone());
                self.emit(&order.strategy_id.clone(), GatewayEvent::OrderUpdate(order))
                    .await;
            }
        }
    }

    async fn handle_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Fill(fill) => self.ingest_fill(fill).await,
            BrokerEvent::OrderUpdate {
                broker_order_id,
                state,
                reason,
            } => self.apply_remote_state(&broker_order_id, state, reason).await,
        }
    }

    /// At-most-once fill application keyed by `(broker_order_id, sequence)`.
    async fn ingest_fill(&mut self, broker_fill: BrokerFill) {
        let Some(&order_id) = self.by_broker.get(&broker_fill.broker_order_id) else {
            debug!(
                broker_order_id = %broker_fill.broker_order_id,
                "fill for unknown order; ignoring"
            );
            return;
        };
        let key = FillKey(broker_fill.broker_order_id.clone(), broker_fill.sequence);
        if !self.applied_fills.insert(key) {
            debug!(
                broker_order_id = %broker_fill.broker_order_id,
                sequence = broker_fill.sequence,
                "duplicate fill dropped"
            );
            return;
        }
        let Some(order) = self.open.get_mut(&order_id) else {
            return;
        };
        order.record_fill(broker_fill.qty, broker_fill.price);
        let fill = Fill {
            order_id,
            broker_order_id: broker_fill.broker_order_id,
            sequence: broker_fill.sequence,
            strategy_id: order.strategy_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: broker_fill.qty,
            price: broker_fill.price,
            fee: broker_fill.fee,
            ts: broker_fill.ts,
        };
        let mut order = order.clone();
        let strategy_id = order.strategy_id.clone();
        self.emit(&strategy_id, GatewayEvent::Fill(fill)).await;
        if order.state.is_terminal() {
            order.terminal_ts = Some(Utc::now());
            self.release(order_id);
            self.retain_terminal(order.clone());
        } else {
            self.open.insert(order_id, order.clone());
        }
        self.emit(&strategy_id, GatewayEvent::OrderUpdate(order)).await;
    }

    async fn apply_remote_state(
        &mut self,
        broker_order_id: &BrokerOrderId,
        state: OrderState,
        reason: Option<String>,
    ) {
        let Some(&order_id) = self.by_broker.get(broker_order_id) else {
            return;
        };
        let Some(order) = self.open.get_mut(&order_id) else {
            return;
        };
        // Filled is only reached through fill accumulation; other terminal
        // states are adopted from the broker directly.
        if order.state == state || (state == OrderState::Filled && !order.state.is_terminal()) {
            return;
        }
        // A stale poll must not rewind partial-fill progress.
        if !state.is_terminal() && order.state == OrderState::Partial {
            return;
        }
        order.state = state;
        let mut order = order.clone();
        let strategy_id = order.strategy_id.clone();
        if state.is_terminal() {
            order.terminal_ts = Some(Utc::now());
            self.release(order_id);
            self.retain_terminal(order.clone());
        } else {
            self.open.insert(order_id, order.clone());
        }
        match (state, reason) {
            (OrderState::Rejected, Some(reason)) => {
                self.emit(&strategy_id, GatewayEvent::Rejected { order, reason })
                    .await;
            }
            _ => {
                self.emit(&strategy_id, GatewayEvent::OrderUpdate(order)).await;
            }
        }
    }

    /// Collect work for the periodic sweep and run it off the actor loop.
    /// `full` also reconciles orders the push stream has gone silent on.
    fn start_sweep(&mut self, full: bool) {
        if self.sweep_in_flight {
            return;
        }
        let mut poll_targets = Vec::new();
        for order in self.open.values() {
            if !order.state.is_open() {
                continue;
            }
            if let Some(broker_id) = &order.broker_order_id {
                if full || matches!(order.state, OrderState::Working | OrderState::Partial) {
                    poll_targets.push((order.id, broker_id.clone()));
                }
            }
        }
        let adoption_targets: Vec<OrderId> = self.needs_adoption.iter().copied().collect();
        if poll_targets.is_empty() && adoption_targets.is_empty() {
            return;
        }
        self.sweep_in_flight = true;
        let broker = self.broker.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut result = SweepResult::default();
            for (order_id, broker_id) in poll_targets {
                result
                    .polled
                    .push((order_id, broker.order_status(&broker_id).await));
            }
            for order_id in adoption_targets {
                result.adoptions.push((
                    order_id,
                    broker.order_by_client_id(&order_id.to_string()).await,
                ));
            }
            let _ = tx.send(Command::SweepResult(result)).await;
        });
    }

    async fn apply_sweep(&mut self, result: SweepResult) {
        for (order_id, outcome) in result.polled {
            match outcome {
                Ok(status) => {
                    for fill in status.fills {
                        self.ingest_fill(fill).await;
                    }
                    if !matches!(status.state, OrderState::Filled) {
                        self.apply_remote_state(&status.broker_order_id, status.state, None)
                            .await;
                    }
                }
                Err(err) if err.is_transient() => {
                    debug!(order_id = %order_id, error = %err, "poll failed; will retry");
                }
                Err(err) => {
                    warn!(order_id = %order_id, error = %err, "poll failed permanently");
                }
            }
        }
        for (order_id, outcome) in result.adoptions {
            match outcome {
                Ok(Some(status)) => {
                    // The broker has the order after all: adopt its identity
                    // and state, then let fills flow normally.
                    self.needs_adoption.remove(&order_id);
                    if let Some(order) = self.open.get_mut(&order_id) {
                        info!(
                            order_id = %order_id,
                            broker_order_id = %status.broker_order_id,
                            state = ?status.state,
                            "adopting order state from broker"
                        );
                        order.broker_order_id = Some(status.broker_order_id.clone());
                        order.state = OrderState::Working;
                        self.by_broker.insert(status.broker_order_id.clone(), order_id);
                        for fill in status.fills {
                            self.ingest_fill(fill).await;
                        }
                        if !matches!(status.state, OrderState::Filled) {
                            self.apply_remote_state(&status.broker_order_id, status.state, None)
                                .await;
                        }
                    }
                }
                Ok(None) => {
                    // The broker never saw it: reject locally.
                    self.needs_adoption.remove(&order_id);
                    if let Some(mut order) = self.open.remove(&order_id) {
                        warn!(order_id = %order_id, "broker has no record of order; rejecting");
                        order.state = OrderState::Rejected;
                        order.terminal_ts = Some(Utc::now());
                        self.retain_terminal(order.clone());
                        self.emit(
                            &order.strategy_id.clone(),
                            GatewayEvent::Rejected {
                                order,
                                reason: "submission unconfirmed and unknown to broker".to_string(),
                            },
                        )
                        .await;
                    }
                }
                Err(err) => {
                    debug!(order_id = %order_id, error = %err, "adoption query failed; will retry");
                }
            }
        }
    }

    /// Remove a terminal order from the open table and its broker index.
    fn release(&mut self, order_id: OrderId) {
        if let Some(order) = self.open.remove(&order_id) {
            if let Some(broker_id) = &order.broker_order_id {
                self.by_broker.remove(broker_id);
            }
        }
        self.needs_adoption.remove(&order_id);
    }

    fn retain_terminal(&mut self, order: Order) {
        if self.recent.len() >= RECENT_ORDERS_CAP {
            if let Some(evicted) = self.recent.pop_front() {
                if let Some(broker_id) = &evicted.broker_order_id {
                    self.applied_fills
                        .retain(|FillKey(id, _)| id != broker_id);
                }
            }
        }
        self.recent.push_back(order);
    }

    async fn emit(&self, strategy_id: &StrategyId, event: GatewayEvent) {
        match self.subscribers.get(strategy_id) {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    debug!(strategy = %strategy_id, "event receiver dropped");
                }
            }
            None => debug!(strategy = %strategy_id, "no event subscriber registered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::any::Any;
    use std::sync::Mutex;
    use stratequeue_broker::BrokerResult;
    use stratequeue_core::{
        BrokerCapabilities, OrderType, Position, Price, Side, TimeInForce,
    };

    struct MockBroker {
        acks: Mutex<Vec<BrokerResult<OrderAck>>>,
        events: Mutex<VecDeque<BrokerEvent>>,
        statuses: Mutex<HashMap<BrokerOrderId, BrokerOrderStatus>>,
        by_client: Mutex<HashMap<String, BrokerOrderStatus>>,
        hang_submissions: bool,
    }

    impl MockBroker {
        fn new() -> Self {
            Self {
                acks: Mutex::new(Vec::new()),
                events: Mutex::new(VecDeque::new()),
                statuses: Mutex::new(HashMap::new()),
                by_client: Mutex::new(HashMap::new()),
                hang_submissions: false,
            }
        }

        fn push_ack(&self, ack: BrokerResult<OrderAck>) {
            self.acks.lock().unwrap().push(ack);
        }

        fn push_event(&self, event: BrokerEvent) {
            self.events.lock().unwrap().push_back(event);
        }
    }

    #[async_trait]
    impl BrokerAdapter for MockBroker {
        fn name(&self) -> &str {
            "mock"
        }

        fn capabilities(&self) -> BrokerCapabilities {
            BrokerCapabilities::default()
        }

        async fn account_equity(&self) -> BrokerResult<Price> {
            Ok(dec!(10000))
        }

        async fn place_order(&self, _request: OrderRequest) -> BrokerResult<OrderAck> {
            if self.hang_submissions {
                std::future::pending::<()>().await;
            }
            self.acks
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(BrokerError::Other("no scripted ack".into())))
        }

        async fn cancel_order(
            &self,
            _broker_order_id: &BrokerOrderId,
            _symbol: &str,
        ) -> BrokerResult<()> {
            Ok(())
        }

        async fn order_status(
            &self,
            broker_order_id: &BrokerOrderId,
        ) -> BrokerResult<BrokerOrderStatus> {
            self.statuses
                .lock()
                .unwrap()
                .get(broker_order_id)
                .cloned()
                .ok_or_else(|| BrokerError::Other("unknown order".into()))
        }

        async fn order_by_client_id(
            &self,
            client_order_id: &str,
        ) -> BrokerResult<Option<BrokerOrderStatus>> {
            Ok(self.by_client.lock().unwrap().get(client_order_id).cloned())
        }

        async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrderStatus>> {
            Ok(Vec::new())
        }

        async fn positions(&self) -> BrokerResult<Vec<Position>> {
            Ok(Vec::new())
        }

        async fn next_event(&self) -> BrokerResult<Option<BrokerEvent>> {
            Ok(self.events.lock().unwrap().pop_front())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn sample_order(strategy: &str) -> Order {
        Order {
            id: OrderId::generate(),
            strategy_id: strategy.into(),
            symbol: "SYM".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: dec!(10),
            limit_price: None,
            stop_price: None,
            time_in_force: Some(TimeInForce::GoodTilCanceled),
            state: OrderState::Pending,
            filled_qty: dec!(0),
            avg_fill_price: None,
            broker_order_id: None,
            submit_ts: Utc::now(),
            terminal_ts: None,
        }
    }

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            submit_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(25),
            reconcile_interval: Duration::from_millis(50),
        }
    }

    async fn expect_event(
        rx: &mut mpsc::Receiver<GatewayEvent>,
        predicate: impl Fn(&GatewayEvent) -> bool,
    ) -> GatewayEvent {
        for _ in 0..200 {
            match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(event)) if predicate(&event) => return event,
                Ok(Some(_)) => continue,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        panic!("expected event never arrived");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pushed_fill_reaches_subscriber_and_releases_order() {
        let broker = Arc::new(MockBroker::new());
        let broker_id = BrokerOrderId::new("b-1");
        broker.push_ack(Ok(OrderAck {
            broker_order_id: broker_id.clone(),
            state: OrderState::Working,
        }));
        let (handle, _task) = OrderGateway::spawn(broker.clone(), fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        handle.register_events("s1".into(), tx).await.unwrap();
        let order = sample_order("s1");
        handle.submit(order.clone()).await.unwrap();

        expect_event(&mut rx, |event| matches!(event, GatewayEvent::OrderUpdate(_))).await;
        broker.push_event(BrokerEvent::Fill(BrokerFill {
            broker_order_id: broker_id.clone(),
            sequence: 1,
            qty: dec!(10),
            price: dec!(100),
            fee: dec!(0),
            ts: Utc::now(),
        }));

        let fill = expect_event(&mut rx, |event| matches!(event, GatewayEvent::Fill(_))).await;
        let GatewayEvent::Fill(fill) = fill else {
            unreachable!()
        };
        assert_eq!(fill.order_id, order.id);
        assert_eq!(fill.strategy_id, order.strategy_id);
        assert_eq!(fill.qty, dec!(10));

        expect_event(&mut rx, |event| {
            matches!(event, GatewayEvent::OrderUpdate(order) if order.state == OrderState::Filled)
        })
        .await;
        assert!(handle.open_orders().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_fill_is_applied_at_most_once() {
        let broker = Arc::new(MockBroker::new());
        let broker_id = BrokerOrderId::new("b-dup");
        broker.push_ack(Ok(OrderAck {
            broker_order_id: broker_id.clone(),
            state: OrderState::Working,
        }));
        let (handle, _task) = OrderGateway::spawn(broker.clone(), fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        handle.register_events("s1".into(), tx).await.unwrap();
        handle.submit(sample_order("s1")).await.unwrap();
        expect_event(&mut rx, |event| matches!(event, GatewayEvent::OrderUpdate(_))).await;

        let fill = BrokerFill {
            broker_order_id: broker_id.clone(),
            sequence: 1,
            qty: dec!(4),
            price: dec!(100),
            fee: dec!(0),
            ts: Utc::now(),
        };
        broker.push_event(BrokerEvent::Fill(fill.clone()));
        broker.push_event(BrokerEvent::Fill(fill));

        expect_event(&mut rx, |event| matches!(event, GatewayEvent::Fill(_))).await;
        // The duplicate must not surface. The next event for this order is a
        // state update, never a second fill with the same sequence.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut extra_fills = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, GatewayEvent::Fill(_)) {
                extra_fills += 1;
            }
        }
        assert_eq!(extra_fills, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn polling_backstop_discovers_fills() {
        let broker = Arc::new(MockBroker::new());
        let broker_id = BrokerOrderId::new("b-poll");
        broker.push_ack(Ok(OrderAck {
            broker_order_id: broker_id.clone(),
            state: OrderState::Working,
        }));
        // No push events; only the status endpoint reports the fill.
        broker.statuses.lock().unwrap().insert(
            broker_id.clone(),
            BrokerOrderStatus {
                broker_order_id: broker_id.clone(),
                state: OrderState::Filled,
                fills: vec![BrokerFill {
                    broker_order_id: broker_id.clone(),
                    sequence: 1,
                    qty: dec!(10),
                    price: dec!(99),
                    fee: dec!(0),
                    ts: Utc::now(),
                }],
            },
        );
        let (handle, _task) = OrderGateway::spawn(broker.clone(), fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        handle.register_events("s1".into(), tx).await.unwrap();
        handle.submit(sample_order("s1")).await.unwrap();

        let fill = expect_event(&mut rx, |event| matches!(event, GatewayEvent::Fill(_))).await;
        let GatewayEvent::Fill(fill) = fill else {
            unreachable!()
        };
        assert_eq!(fill.price, dec!(99));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broker_rejection_surfaces_with_reason() {
        let broker = Arc::new(MockBroker::new());
        broker.push_ack(Err(BrokerError::Rejected("insufficient margin".into())));
        let (handle, _task) = OrderGateway::spawn(broker, fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        handle.register_events("s1".into(), tx).await.unwrap();
        handle.submit(sample_order("s1")).await.unwrap();

        let event = expect_event(&mut rx, |event| {
            matches!(event, GatewayEvent::Rejected { .. })
        })
        .await;
        let GatewayEvent::Rejected { order, reason } = event else {
            unreachable!()
        };
        assert_eq!(order.state, OrderState::Rejected);
        assert!(reason.contains("margin"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unconfirmed_submission_unknown_to_broker_is_rejected() {
        let broker = Arc::new(MockBroker {
            hang_submissions: true,
            ..MockBroker::new()
        });
        let (handle, _task) = OrderGateway::spawn(broker, fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        handle.register_events("s1".into(), tx).await.unwrap();
        handle.submit(sample_order("s1")).await.unwrap();

        let event = expect_event(&mut rx, |event| {
            matches!(event, GatewayEvent::Rejected { .. })
        })
        .await;
        let GatewayEvent::Rejected { reason, .. } = event else {
            unreachable!()
        };
        assert!(reason.contains("unconfirmed"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsubmitted_order_cancels_locally() {
        let broker = Arc::new(MockBroker {
            hang_submissions: true,
            ..MockBroker::new()
        });
        let (handle, _task) = OrderGateway::spawn(broker, fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        handle.register_events("s1".into(), tx).await.unwrap();
        let order = sample_order("s1");
        handle.submit(order.clone()).await.unwrap();
        handle.cancel(order.id).await.unwrap();

        expect_event(&mut rx, |event| {
            matches!(
                event,
                GatewayEvent::OrderUpdate(order) if order.state == OrderState::Canceled
            )
        })
        .await;
    }
}
