//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod identifiers;

pub use identifiers::{BrokerOrderId, OrderId, StrategyId};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `AAPL`, `BTC-USD`).
pub type Symbol = String;

/// Bar period used when aggregating trades into OHLCV records.
/// Serializes as its short code (`1m`, `1h`, ...).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Granularity {
    OneSecond,
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    FourHours,
    OneDay,
}

impl Granularity {
    /// Convert the granularity into a chrono `Duration`.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        match self {
            Self::OneSecond => Duration::seconds(1),
            Self::OneMinute => Duration::minutes(1),
            Self::FiveMinutes => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::ThirtyMinutes => Duration::minutes(30),
            Self::OneHour => Duration::hours(1),
            Self::FourHours => Duration::hours(4),
            Self::OneDay => Duration::days(1),
        }
    }

    /// Number of whole seconds in one bar period.
    #[must_use]
    pub fn seconds(self) -> i64 {
        self.as_duration().num_seconds()
    }

    /// Canonical short spelling (`1m`, `1h`, ...).
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::OneSecond => "1s",
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "1s" | "1sec" | "1second" => Ok(Self::OneSecond),
            "1m" | "1min" | "1minute" => Ok(Self::OneMinute),
            "5m" | "5min" | "5minutes" => Ok(Self::FiveMinutes),
            "15m" | "15min" | "15minutes" => Ok(Self::FifteenMinutes),
            "30m" | "30min" | "30minutes" => Ok(Self::ThirtyMinutes),
            "1h" | "60m" | "1hour" => Ok(Self::OneHour),
            "4h" | "240m" | "4hours" => Ok(Self::FourHours),
            "1d" | "day" | "d" => Ok(Self::OneDay),
            other => Err(format!("unsupported granularity '{other}'")),
        }
    }
}

impl Serialize for Granularity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for Granularity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    /// Buy the instrument.
    Buy,
    /// Sell the instrument.
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed direction multiplier (+1 buy, -1 sell).
    #[must_use]
    pub fn sign(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Raised when a bar fails its structural invariants.
#[derive(Debug, Error, PartialEq)]
pub enum InvalidBar {
    #[error("low {low} exceeds high {high}")]
    LowAboveHigh { low: Price, high: Price },
    #[error("{field} {value} is outside [{low}, {high}]")]
    OutsideRange {
        field: &'static str,
        value: Price,
        low: Price,
        high: Price,
    },
    #[error("volume {0} is negative")]
    NegativeVolume(Quantity),
}

/// One OHLCV record at a given granularity. Immutable once admitted to a buffer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub granularity: Granularity,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Quantity,
    pub ts: DateTime<Utc>,
    /// Marks the canonical close of the bar period. Providers that stream
    /// partial bars set this only on the last update for a period.
    #[serde(default = "default_final")]
    pub final_of_period: bool,
}

fn default_final() -> bool {
    true
}

impl Bar {
    /// Check `low <= {open, close} <= high`, `low <= high`, `volume >= 0`.
    pub fn validate(&self) -> Result<(), InvalidBar> {
        if self.low > self.high {
            return Err(InvalidBar::LowAboveHigh {
                low: self.low,
                high: self.high,
            });
        }
        for (field, value) in [("open", self.open), ("close", self.close)] {
            if value < self.low || value > self.high {
                return Err(InvalidBar::OutsideRange {
                    field,
                    value,
                    low: self.low,
                    high: self.high,
                });
            }
        }
        if self.volume < Decimal::ZERO {
            return Err(InvalidBar::NegativeVolume(self.volume));
        }
        Ok(())
    }
}

/// Engine-agnostic trading intent produced by a signal evaluator.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Buy,
    Sell,
    Hold,
    Close,
    LimitBuy,
    LimitSell,
    StopBuy,
    StopSell,
    StopLimitBuy,
    StopLimitSell,
}

impl SignalType {
    /// Order side implied by the signal, if it trades at all.
    #[must_use]
    pub fn side(self) -> Option<Side> {
        match self {
            Self::Buy | Self::LimitBuy | Self::StopBuy | Self::StopLimitBuy => Some(Side::Buy),
            Self::Sell | Self::LimitSell | Self::StopSell | Self::StopLimitSell => Some(Side::Sell),
            Self::Close => Some(Side::Sell),
            Self::Hold => None,
        }
    }

    /// Execution style implied by the signal, if it trades at all.
    #[must_use]
    pub fn order_type(self) -> Option<OrderType> {
        match self {
            Self::Buy | Self::Sell | Self::Close => Some(OrderType::Market),
            Self::LimitBuy | Self::LimitSell => Some(OrderType::Limit),
            Self::StopBuy | Self::StopSell => Some(OrderType::Stop),
            Self::StopLimitBuy | Self::StopLimitSell => Some(OrderType::StopLimit),
            Self::Hold => None,
        }
    }

    #[must_use]
    pub fn requires_limit_price(self) -> bool {
        matches!(
            self,
            Self::LimitBuy | Self::LimitSell | Self::StopLimitBuy | Self::StopLimitSell
        )
    }

    #[must_use]
    pub fn requires_stop_price(self) -> bool {
        matches!(
            self,
            Self::StopBuy | Self::StopSell | Self::StopLimitBuy | Self::StopLimitSell
        )
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
            Self::Close => "CLOSE",
            Self::LimitBuy => "LIMIT_BUY",
            Self::LimitSell => "LIMIT_SELL",
            Self::StopBuy => "STOP_BUY",
            Self::StopSell => "STOP_SELL",
            Self::StopLimitBuy => "STOP_LIMIT_BUY",
            Self::StopLimitSell => "STOP_LIMIT_SELL",
        };
        f.write_str(label)
    }
}

/// Abstract quantity specification resolved to a concrete order quantity by
/// the portfolio manager. At most one intent per signal by construction.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingIntent {
    /// Trade exactly this many units.
    Units(Quantity),
    /// Trade this notional amount of the reporting currency.
    Notional(Price),
    /// Trade a fraction of current strategy equity.
    EquityPct(Decimal),
    /// Bring the position to exactly this many units.
    TargetUnits(Quantity),
    /// Bring the position value to this notional amount.
    TargetNotional(Price),
    /// Bring the position value to this fraction of strategy equity.
    TargetEquityPct(Decimal),
    /// Backward-compatible fraction; treated as a fraction of equity.
    LegacyFraction(Decimal),
    /// No explicit intent; the portfolio manager applies its default.
    #[default]
    None,
}

/// Optional time-in-force constraints forwarded to the broker.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    GoodTilCanceled,
    ImmediateOrCancel,
    FillOrKill,
    Day,
}

/// Raised when a signal fails its structural invariants.
#[derive(Debug, Error, PartialEq)]
pub enum InvalidSignal {
    #[error("signal price {0} is not positive")]
    NonPositivePrice(Price),
    #[error("{0} signal requires a limit price")]
    MissingLimitPrice(SignalType),
    #[error("{0} signal requires a stop price")]
    MissingStopPrice(SignalType),
}

/// Trading signal with optional sizing and execution-style hints.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub price: Price,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sizing: SizingIntent,
    #[serde(default)]
    pub limit_price: Option<Price>,
    #[serde(default)]
    pub stop_price: Option<Price>,
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
    /// Free-form evaluator payload (indicator values, diagnostics).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Signal {
    /// Convenience constructor for plain market-style signals.
    #[must_use]
    pub fn new(signal_type: SignalType, price: Price, timestamp: DateTime<Utc>) -> Self {
        Self {
            signal_type,
            price,
            timestamp,
            sizing: SizingIntent::None,
            limit_price: None,
            stop_price: None,
            time_in_force: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// A HOLD at the given mark price.
    #[must_use]
    pub fn hold(price: Price, timestamp: DateTime<Utc>) -> Self {
        Self::new(SignalType::Hold, price, timestamp)
    }

    /// Attach a sizing intent.
    #[must_use]
    pub fn with_sizing(mut self, sizing: SizingIntent) -> Self {
        self.sizing = sizing;
        self
    }

    /// Attach a limit price.
    #[must_use]
    pub fn with_limit_price(mut self, price: Price) -> Self {
        self.limit_price = Some(price);
        self
    }

    /// Attach a stop price.
    #[must_use]
    pub fn with_stop_price(mut self, price: Price) -> Self {
        self.stop_price = Some(price);
        self
    }

    /// Check price positivity and limit/stop presence for the signal type.
    pub fn validate(&self) -> Result<(), InvalidSignal> {
        if self.price <= Decimal::ZERO {
            return Err(InvalidSignal::NonPositivePrice(self.price));
        }
        if self.signal_type.requires_limit_price() && self.limit_price.is_none() {
            return Err(InvalidSignal::MissingLimitPrice(self.signal_type));
        }
        if self.signal_type.requires_stop_price() && self.stop_price.is_none() {
            return Err(InvalidSignal::MissingStopPrice(self.signal_type));
        }
        Ok(())
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

/// Order lifecycle states maintained by the gateway.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    Working,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    /// Whether the broker may still produce fills for the order.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Working | Self::Partial)
    }
}

/// Sized, risk-checked order tracked from submission to terminal state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub strategy_id: StrategyId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Quantity,
    pub limit_price: Option<Price>,
    pub stop_price: Option<Price>,
    pub time_in_force: Option<TimeInForce>,
    pub state: OrderState,
    pub filled_qty: Quantity,
    pub avg_fill_price: Option<Price>,
    pub broker_order_id: Option<BrokerOrderId>,
    pub submit_ts: DateTime<Utc>,
    pub terminal_ts: Option<DateTime<Utc>>,
}

impl Order {
    /// Fold a fill into the order's running totals, keeping `avg_fill_price`
    /// the quantity-weighted mean of all fill prices.
    pub fn record_fill(&mut self, qty: Quantity, price: Price) {
        let prev_notional = self
            .avg_fill_price
            .map(|avg| avg * self.filled_qty)
            .unwrap_or(Decimal::ZERO);
        self.filled_qty += qty;
        if self.filled_qty > Decimal::ZERO {
            self.avg_fill_price = Some((prev_notional + price * qty) / self.filled_qty);
        }
        self.state = if self.filled_qty >= self.qty {
            OrderState::Filled
        } else {
            OrderState::Partial
        };
    }

    #[must_use]
    pub fn remaining_qty(&self) -> Quantity {
        (self.qty - self.filled_qty).max(Decimal::ZERO)
    }
}

/// Dedup key identifying a fill exactly once across push and poll delivery.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct FillKey(pub BrokerOrderId, pub u64);

/// Execution information emitted whenever an order is (partially) filled.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub broker_order_id: BrokerOrderId,
    /// Broker-assigned sequence number within the order.
    pub sequence: u64,
    pub strategy_id: StrategyId,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Quantity,
    pub price: Price,
    pub fee: Price,
    pub ts: DateTime<Utc>,
}

impl Fill {
    #[must_use]
    pub fn key(&self) -> FillKey {
        FillKey(self.broker_order_id.clone(), self.sequence)
    }
}

/// Snapshot of a per-symbol position. Quantity sign encodes long/short.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: Quantity,
    pub average_cost: Price,
    pub market_value: Price,
}

impl Position {
    #[must_use]
    pub fn flat(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            average_cost: Decimal::ZERO,
            market_value: Decimal::ZERO,
        }
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    #[must_use]
    pub fn side(&self) -> Option<Side> {
        if self.quantity > Decimal::ZERO {
            Some(Side::Buy)
        } else if self.quantity < Decimal::ZERO {
            Some(Side::Sell)
        } else {
            None
        }
    }

    /// Refresh `market_value` from the latest mark price.
    pub fn mark(&mut self, price: Price) {
        self.market_value = self.quantity * price;
    }

    /// Unrealized profit relative to the average cost.
    #[must_use]
    pub fn unrealized_pnl(&self, price: Price) -> Price {
        (price - self.average_cost) * self.quantity
    }
}

/// Static trading constraints advertised by a broker instance.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerCapabilities {
    pub min_notional: Price,
    pub max_position_size: Option<Quantity>,
    pub min_lot_size: Quantity,
    pub step_size: Quantity,
    pub fractional_shares: bool,
    pub supported_order_types: Vec<OrderType>,
}

impl BrokerCapabilities {
    #[must_use]
    pub fn supports(&self, order_type: OrderType) -> bool {
        self.supported_order_types.contains(&order_type)
    }

    /// Round a raw quantity down to the broker's step size, flooring to a
    /// whole number when fractional shares are unsupported.
    #[must_use]
    pub fn round_quantity(&self, qty: Quantity) -> Quantity {
        let sign = if qty.is_sign_negative() {
            Decimal::NEGATIVE_ONE
        } else {
            Decimal::ONE
        };
        let mut magnitude = qty.abs();
        if self.step_size > Decimal::ZERO {
            magnitude = (magnitude / self.step_size).floor() * self.step_size;
        }
        if !self.fractional_shares {
            magnitude = magnitude.floor();
        }
        sign * magnitude
    }
}

impl Default for BrokerCapabilities {
    fn default() -> Self {
        Self {
            min_notional: Decimal::ONE,
            max_position_size: None,
            min_lot_size: Decimal::ZERO,
            step_size: Decimal::ZERO,
            fractional_shares: true,
            supported_order_types: vec![
                OrderType::Market,
                OrderType::Limit,
                OrderType::Stop,
                OrderType::StopLimit,
            ],
        }
    }
}

/// Execution mode of a deployed strategy.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    /// Observe only; signals are recorded but never submitted.
    Signals,
    /// Orders routed to a simulated broker endpoint.
    Paper,
    /// Orders routed to a live broker endpoint.
    Live,
}

impl FromStr for TradingMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "signals" => Ok(Self::Signals),
            "paper" => Ok(Self::Paper),
            "live" => Ok(Self::Live),
            other => Err(format!("unsupported trading mode '{other}'")),
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Signals => "signals",
            Self::Paper => "paper",
            Self::Live => "live",
        };
        f.write_str(label)
    }
}

/// Lifecycle states of a strategy runner.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Errored,
}

impl StrategyStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }
}

/// Capital assigned to a strategy, either as a fraction of account equity or
/// an absolute amount of the reporting currency.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Allocation {
    Fraction(Decimal),
    Notional(Price),
}

impl Allocation {
    /// Resolve to an absolute cash amount against the account equity known
    /// at deploy time. Held constant thereafter.
    #[must_use]
    pub fn resolve(self, account_equity: Price) -> Price {
        match self {
            Self::Fraction(fraction) => fraction * account_equity,
            Self::Notional(amount) => amount,
        }
    }
}

/// Authoritative registry entry for a deployed strategy.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategyRecord {
    pub id: StrategyId,
    pub name: String,
    pub source_path: String,
    pub engine: String,
    pub data_source: String,
    pub symbols: Vec<Symbol>,
    pub granularity: Granularity,
    pub lookback: usize,
    pub allocation: Allocation,
    pub mode: TradingMode,
    pub status: StrategyStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_signal_ts: Option<DateTime<Utc>>,
    pub last_signal_type: Option<SignalType>,
    pub params: serde_json::Value,
}

/// Render a price with full significant digits and no trailing zeros.
#[must_use]
pub fn display_price(value: Price) -> String {
    value.normalize().to_string()
}

/// Render a quantity with full significant digits and no trailing zeros.
#[must_use]
pub fn display_quantity(value: Quantity) -> String {
    value.normalize().to_string()
}
