//! Simple paper-trading broker used by demos, tests, and `paper` mode.
//!
//! Market and limit orders fill immediately and fully at the last observed
//! price (with optional slippage and fees); stop orders rest in a trigger
//! book that is checked against each incoming bar.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stratequeue_broker::{
    BrokerAdapter, BrokerError, BrokerEvent, BrokerFactory, BrokerFill, BrokerOrderStatus,
    BrokerResult, OrderAck, OrderRequest,
};
use stratequeue_core::{
    Bar, BrokerCapabilities, BrokerOrderId, OrderState, OrderType, Position, Price, Side, Symbol,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Simulation parameters for the paper endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PaperConfig {
    pub initial_cash: Decimal,
    pub slippage_bps: Decimal,
    pub fee_bps: Decimal,
    pub min_notional: Decimal,
    pub min_lot_size: Decimal,
    pub step_size: Decimal,
    pub fractional_shares: bool,
    pub max_position_size: Option<Decimal>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_cash: Decimal::from(100_000),
            slippage_bps: Decimal::ZERO,
            fee_bps: Decimal::ZERO,
            min_notional: Decimal::ONE,
            min_lot_size: Decimal::ZERO,
            step_size: Decimal::ZERO,
            fractional_shares: true,
            max_position_size: None,
        }
    }
}

#[derive(Default)]
struct PaperState {
    cash: Decimal,
    positions: HashMap<Symbol, Position>,
    last_prices: HashMap<Symbol, Price>,
    orders: HashMap<BrokerOrderId, BrokerOrderStatus>,
    by_client: HashMap<String, BrokerOrderId>,
    pending_triggers: Vec<(BrokerOrderId, OrderRequest)>,
    events: VecDeque<BrokerEvent>,
}

/// In-memory broker that fills orders against the last observed price.
pub struct PaperBroker {
    name: String,
    config: PaperConfig,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(name: impl Into<String>, config: PaperConfig) -> Self {
        let state = PaperState {
            cash: config.initial_cash,
            ..PaperState::default()
        };
        Self {
            name: name.into(),
            config,
            state: Mutex::new(state),
        }
    }

    /// Record the latest market price for a symbol and run the trigger book.
    /// The runtime calls this for every admitted bar.
    pub fn on_bar(&self, bar: &Bar) {
        let mut state = self.state.lock().expect("paper state poisoned");
        state.last_prices.insert(bar.symbol.clone(), bar.close);
        self.check_triggers(&mut state, bar);
        if let Some(position) = state.positions.get_mut(&bar.symbol) {
            position.mark(bar.close);
        }
    }

    /// Latest known price for a symbol.
    #[must_use]
    pub fn last_price(&self, symbol: &str) -> Option<Price> {
        let state = self.state.lock().expect("paper state poisoned");
        state.last_prices.get(symbol).copied()
    }

    fn check_triggers(&self, state: &mut PaperState, bar: &Bar) {
        let mut resting = Vec::new();
        let mut triggered = Vec::new();
        for (broker_id, request) in state.pending_triggers.drain(..) {
            if request.symbol != bar.symbol {
                resting.push((broker_id, request));
                continue;
            }
            let trigger = request.stop_price.unwrap_or(bar.close);
            let hit = match request.side {
                Side::Buy => bar.high >= trigger,
                Side::Sell => bar.low <= trigger,
            };
            if hit {
                triggered.push((broker_id, request, trigger));
            } else {
                resting.push((broker_id, request));
            }
        }
        state.pending_triggers = resting;
        for (broker_id, request, trigger) in triggered {
            // Stop-limits fill at the limit; plain stops at the trigger.
            let price = match request.order_type {
                OrderType::StopLimit => request.limit_price.unwrap_or(trigger),
                _ => trigger,
            };
            debug!(
                symbol = %request.symbol,
                trigger = %trigger,
                "paper conditional order triggered"
            );
            self.execute(state, &broker_id, &request, price);
        }
    }

    fn fill_price(&self, side: Side, base: Price) -> Price {
        if self.config.slippage_bps.is_zero() {
            return base;
        }
        let rate = self.config.slippage_bps / Decimal::from(10_000);
        match side {
            Side::Buy => base * (Decimal::ONE + rate),
            Side::Sell => base * (Decimal::ONE - rate),
        }
    }

    fn execute(
        &self,
        state: &mut PaperState,
        broker_id: &BrokerOrderId,
        request: &OrderRequest,
        base_price: Price,
    ) {
        let price = self.fill_price(request.side, base_price);
        let notional = price * request.quantity;
        let fee = notional.abs() * self.config.fee_bps / Decimal::from(10_000);
        let fill = BrokerFill {
            broker_order_id: broker_id.clone(),
            sequence: 1,
            qty: request.quantity,
            price,
            fee,
            ts: Utc::now(),
        };
        match request.side {
            Side::Buy => state.cash -= notional + fee,
            Side::Sell => state.cash += notional - fee,
        }
        let position = state
            .positions
            .entry(request.symbol.clone())
            .or_insert_with(|| Position::flat(request.symbol.clone()));
        position.quantity += request.side.sign() * request.quantity;
        position.mark(price);
        if position.is_flat() {
            state.positions.remove(&request.symbol);
        }
        if let Some(status) = state.orders.get_mut(broker_id) {
            status.state = OrderState::Filled;
            status.fills.push(fill.clone());
        }
        info!(
            symbol = %request.symbol,
            qty = %request.quantity,
            price = %price,
            side = ?request.side,
            "paper order filled"
        );
        state.events.push_back(BrokerEvent::Fill(fill));
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BrokerCapabilities {
        BrokerCapabilities {
            min_notional: self.config.min_notional,
            max_position_size: self.config.max_position_size,
            min_lot_size: self.config.min_lot_size,
            step_size: self.config.step_size,
            fractional_shares: self.config.fractional_shares,
            supported_order_types: vec![
                OrderType::Market,
                OrderType::Limit,
                OrderType::Stop,
                OrderType::StopLimit,
            ],
        }
    }

    async fn account_equity(&self) -> BrokerResult<Price> {
        let state = self.state.lock().expect("paper state poisoned");
        let positions: Price = state.positions.values().map(|p| p.market_value).sum();
        Ok(state.cash + positions)
    }

    async fn place_order(&self, request: OrderRequest) -> BrokerResult<OrderAck> {
        if request.quantity <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest(
                "quantity must be positive".into(),
            ));
        }
        let broker_id = BrokerOrderId::new(Uuid::new_v4().to_string());
        let mut state = self.state.lock().expect("paper state poisoned");
        state.orders.insert(
            broker_id.clone(),
            BrokerOrderStatus {
                broker_order_id: broker_id.clone(),
                state: OrderState::Working,
                fills: Vec::new(),
            },
        );
        if let Some(client_id) = &request.client_order_id {
            state.by_client.insert(client_id.clone(), broker_id.clone());
        }
        match request.order_type {
            OrderType::Market | OrderType::Limit => {
                let base = match request.order_type {
                    // Market orders need an observed price; the limit price
                    // doubles as one for limit orders.
                    OrderType::Market => state
                        .last_prices
                        .get(&request.symbol)
                        .copied()
                        .or(request.limit_price),
                    _ => request
                        .limit_price
                        .or_else(|| state.last_prices.get(&request.symbol).copied()),
                };
                let Some(base) = base else {
                    state.orders.remove(&broker_id);
                    return Err(BrokerError::InvalidRequest(format!(
                        "no market price observed for {}",
                        request.symbol
                    )));
                };
                self.execute(&mut state, &broker_id, &request, base);
            }
            OrderType::Stop | OrderType::StopLimit => {
                if request.stop_price.is_none() {
                    state.orders.remove(&broker_id);
                    return Err(BrokerError::InvalidRequest(
                        "stop orders require a stop price".into(),
                    ));
                }
                debug!(
                    symbol = %request.symbol,
                    trigger = ?request.stop_price,
                    "paper conditional order resting"
                );
                state
                    .pending_triggers
                    .push((broker_id.clone(), request.clone()));
            }
        }
        Ok(OrderAck {
            broker_order_id: broker_id,
            state: OrderState::Working,
        })
    }

    async fn cancel_order(
        &self,
        broker_order_id: &BrokerOrderId,
        _symbol: &str,
    ) -> BrokerResult<()> {
        let mut state = self.state.lock().expect("paper state poisoned");
        state
            .pending_triggers
            .retain(|(id, _)| id != broker_order_id);
        if let Some(status) = state.orders.get_mut(broker_order_id) {
            if !status.state.is_terminal() {
                status.state = OrderState::Canceled;
                state.events.push_back(BrokerEvent::OrderUpdate {
                    broker_order_id: broker_order_id.clone(),
                    state: OrderState::Canceled,
                    reason: None,
                });
            }
        }
        Ok(())
    }

    async fn order_status(
        &self,
        broker_order_id: &BrokerOrderId,
    ) -> BrokerResult<BrokerOrderStatus> {
        let state = self.state.lock().expect("paper state poisoned");
        state
            .orders
            .get(broker_order_id)
            .cloned()
            .ok_or_else(|| BrokerError::InvalidRequest("unknown order".into()))
    }

    async fn order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> BrokerResult<Option<BrokerOrderStatus>> {
        let state = self.state.lock().expect("paper state poisoned");
        Ok(state
            .by_client
            .get(client_order_id)
            .and_then(|broker_id| state.orders.get(broker_id))
            .cloned())
    }

    async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrderStatus>> {
        let state = self.state.lock().expect("paper state poisoned");
        Ok(state
            .orders
            .values()
            .filter(|status| status.state.is_open())
            .cloned()
            .collect())
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        let state = self.state.lock().expect("paper state poisoned");
        Ok(state.positions.values().cloned().collect())
    }

    async fn next_event(&self) -> BrokerResult<Option<BrokerEvent>> {
        let mut state = self.state.lock().expect("paper state poisoned");
        Ok(state.events.pop_front())
    }

    fn on_market_data(&self, bar: &Bar) {
        self.on_bar(bar);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory registered under the name `paper`.
#[derive(Default)]
pub struct PaperFactory;

#[async_trait]
impl BrokerFactory for PaperFactory {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn create(
        &self,
        config: &serde_json::Value,
    ) -> BrokerResult<std::sync::Arc<dyn BrokerAdapter>> {
        let config: PaperConfig = serde_json::from_value(config.clone())
            .map_err(|err| BrokerError::Serialization(format!("paper config: {err}")))?;
        Ok(std::sync::Arc::new(PaperBroker::new("paper", config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stratequeue_core::Granularity;

    fn bar(symbol: &str, low: Decimal, high: Decimal, close: Decimal) -> Bar {
        Bar {
            symbol: symbol.into(),
            granularity: Granularity::OneMinute,
            open: close,
            high,
            low,
            close,
            volume: dec!(100),
            ts: Utc::now(),
            final_of_period: true,
        }
    }

    fn market_buy(symbol: &str, qty: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: symbol.into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: qty,
            limit_price: None,
            stop_price: None,
            time_in_force: None,
            client_order_id: Some("client-1".into()),
        }
    }

    #[tokio::test]
    async fn market_order_fills_at_last_price() {
        let broker = PaperBroker::new("paper", PaperConfig::default());
        broker.on_bar(&bar("SYM", dec!(99), dec!(101), dec!(100)));
        let ack = broker.place_order(market_buy("SYM", dec!(5))).await.unwrap();

        let event = broker.next_event().await.unwrap().unwrap();
        let BrokerEvent::Fill(fill) = event else {
            panic!("expected fill event");
        };
        assert_eq!(fill.broker_order_id, ack.broker_order_id);
        assert_eq!(fill.price, dec!(100));
        assert_eq!(fill.qty, dec!(5));

        let status = broker.order_status(&ack.broker_order_id).await.unwrap();
        assert_eq!(status.state, OrderState::Filled);
        assert_eq!(broker.account_equity().await.unwrap(), dec!(100000));
    }

    #[tokio::test]
    async fn market_order_without_price_is_rejected() {
        let broker = PaperBroker::new("paper", PaperConfig::default());
        let err = broker
            .place_order(market_buy("SYM", dec!(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn slippage_and_fees_apply() {
        let config = PaperConfig {
            slippage_bps: dec!(10),
            fee_bps: dec!(5),
            ..PaperConfig::default()
        };
        let broker = PaperBroker::new("paper", config);
        broker.on_bar(&bar("SYM", dec!(99), dec!(101), dec!(100)));
        broker.place_order(market_buy("SYM", dec!(10))).await.unwrap();
        let BrokerEvent::Fill(fill) = broker.next_event().await.unwrap().unwrap() else {
            panic!("expected fill");
        };
        assert_eq!(fill.price, dec!(100.10));
        assert_eq!(fill.fee, dec!(0.50050));
    }

    #[tokio::test]
    async fn stop_order_rests_until_triggered() {
        let broker = PaperBroker::new("paper", PaperConfig::default());
        broker.on_bar(&bar("SYM", dec!(99), dec!(101), dec!(100)));
        let request = OrderRequest {
            order_type: OrderType::Stop,
            side: Side::Sell,
            stop_price: Some(dec!(95)),
            ..market_buy("SYM", dec!(5))
        };
        let ack = broker.place_order(request).await.unwrap();
        assert!(broker.next_event().await.unwrap().is_none());

        // A bar that never reaches the trigger leaves the order resting.
        broker.on_bar(&bar("SYM", dec!(98), dec!(102), dec!(100)));
        assert!(broker.next_event().await.unwrap().is_none());

        // Trading through the stop fires it at the trigger price.
        broker.on_bar(&bar("SYM", dec!(94), dec!(100), dec!(95)));
        let BrokerEvent::Fill(fill) = broker.next_event().await.unwrap().unwrap() else {
            panic!("expected fill");
        };
        assert_eq!(fill.price, dec!(95));
        let status = broker.order_status(&ack.broker_order_id).await.unwrap();
        assert_eq!(status.state, OrderState::Filled);
    }

    #[tokio::test]
    async fn cancel_removes_resting_trigger() {
        let broker = PaperBroker::new("paper", PaperConfig::default());
        broker.on_bar(&bar("SYM", dec!(99), dec!(101), dec!(100)));
        let request = OrderRequest {
            order_type: OrderType::Stop,
            side: Side::Sell,
            stop_price: Some(dec!(95)),
            ..market_buy("SYM", dec!(5))
        };
        let ack = broker.place_order(request).await.unwrap();
        broker.cancel_order(&ack.broker_order_id, "SYM").await.unwrap();

        let event = broker.next_event().await.unwrap().unwrap();
        assert!(matches!(
            event,
            BrokerEvent::OrderUpdate {
                state: OrderState::Canceled,
                ..
            }
        ));
        // The trigger is gone; trading through it produces nothing.
        broker.on_bar(&bar("SYM", dec!(90), dec!(100), dec!(92)));
        assert!(broker.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn client_id_lookup_supports_adoption() {
        let broker = PaperBroker::new("paper", PaperConfig::default());
        broker.on_bar(&bar("SYM", dec!(99), dec!(101), dec!(100)));
        let ack = broker.place_order(market_buy("SYM", dec!(5))).await.unwrap();
        let found = broker.order_by_client_id("client-1").await.unwrap().unwrap();
        assert_eq!(found.broker_order_id, ack.broker_order_id);
        assert!(broker.order_by_client_id("missing").await.unwrap().is_none());
    }
}
