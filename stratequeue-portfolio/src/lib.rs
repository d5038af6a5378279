//! Per-strategy ledger accounting and signal sizing.
//!
//! Each strategy runner owns one [`StrategyPortfolio`]: the sub-ledger is
//! written by exactly one task, and the aggregate view is folded from
//! snapshots. Sizing converts abstract intents into concrete order proposals
//! gated against the broker's capabilities and the ledger's bounds.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stratequeue_core::{
    BrokerCapabilities, Fill, Order, OrderId, OrderState, Position, Price, Quantity, Side, Signal,
    SignalType, SizingIntent, StrategyId, Symbol,
};
use thiserror::Error;
use tracing::debug;

/// Result alias for portfolio operations.
pub type PortfolioResult<T> = Result<T, PortfolioError>;

/// Portfolio-specific error type.
#[derive(Debug, Error)]
pub enum PortfolioError {
    /// A fill arrived for a symbol the ledger has never seen a sell-side
    /// position or cash flow for; indicates mis-attribution upstream.
    #[error("fill attribution mismatch: {0}")]
    Attribution(String),
    /// Ledger arithmetic broke an identity that must always hold. Callers
    /// treat this as fatal to the whole process.
    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),
}

/// Default sizing applied to BUY/SELL signals that carry no intent.
const DEFAULT_EQUITY_PCT: Decimal = Decimal::from_parts(1, 0, 0, false, 1); // 0.1

/// Newest fills retained per sub-ledger.
const FILL_LOG_CAP: usize = 1024;

/// Structured reason an order proposal was rejected by the gate chain.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    ZeroQuantity,
    UnsupportedOrderType,
    BelowMinNotional,
    InsufficientCash,
    InsufficientPosition,
    ShortingDisabled,
    ExceedsMaxPosition,
    BelowMinLot,
}

/// Rejections are observability events, not errors.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SizeRejection {
    pub reason: RejectReason,
    pub detail: String,
}

/// Outcome of sizing a signal.
#[derive(Debug)]
pub enum SizeOutcome {
    /// A concrete order proposal passed every gate.
    Order(Order),
    /// The proposal failed a gate.
    Rejected(SizeRejection),
    /// Nothing to do (HOLD, CLOSE while flat, target already met).
    NoAction,
}

/// Event emitted by the ledger for the statistics consumer.
#[derive(Clone, Debug)]
pub enum LedgerEvent {
    Fill {
        strategy_id: StrategyId,
        fill: Fill,
        realized_delta: Price,
        equity: Price,
        cash: Price,
    },
    Mark {
        strategy_id: StrategyId,
        symbol: Symbol,
        price: Price,
        equity: Price,
    },
}

/// Serializable point-in-time view of a sub-ledger.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct LedgerSnapshot {
    pub initial_cash: Price,
    pub cash: Price,
    pub realized_pnl: Price,
    pub unrealized_pnl: Price,
    pub equity: Price,
    pub positions: Vec<Position>,
    pub fill_count: usize,
    pub taken_at: DateTime<Utc>,
}

/// Aggregate view over every strategy's sub-ledger. The surplus between this
/// and the broker account is unallocated house cash.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AggregateSnapshot {
    pub cash: Price,
    pub equity: Price,
    pub realized_pnl: Price,
    pub positions: HashMap<Symbol, Quantity>,
}

/// Fold sub-ledger snapshots into the aggregate view.
pub fn aggregate<'a>(snapshots: impl IntoIterator<Item = &'a LedgerSnapshot>) -> AggregateSnapshot {
    let mut out = AggregateSnapshot::default();
    for snapshot in snapshots {
        out.cash += snapshot.cash;
        out.equity += snapshot.equity;
        out.realized_pnl += snapshot.realized_pnl;
        for position in &snapshot.positions {
            *out.positions.entry(position.symbol.clone()).or_default() += position.quantity;
        }
    }
    out
}

/// Result of applying one fill to the ledger.
#[derive(Clone, Debug)]
pub struct FillApplication {
    pub realized_delta: Price,
    pub position_qty: Quantity,
    pub cash: Price,
    pub equity: Price,
}

/// Per-strategy slice of the overall portfolio: cash, positions, realised
/// P&L, and a bounded fill log. Single writer.
pub struct StrategyPortfolio {
    strategy_id: StrategyId,
    capabilities: BrokerCapabilities,
    initial_cash: Price,
    cash: Price,
    positions: HashMap<Symbol, Position>,
    marks: HashMap<Symbol, Price>,
    realized_pnl: Price,
    fills: Vec<Fill>,
    short_selling: bool,
}

impl StrategyPortfolio {
    pub fn new(
        strategy_id: StrategyId,
        initial_cash: Price,
        capabilities: BrokerCapabilities,
    ) -> Self {
        Self {
            strategy_id,
            capabilities,
            initial_cash,
            cash: initial_cash,
            positions: HashMap::new(),
            marks: HashMap::new(),
            realized_pnl: Decimal::ZERO,
            fills: Vec::new(),
            short_selling: false,
        }
    }

    /// Allow exposure below zero. Off by default.
    #[must_use]
    pub fn with_short_selling(mut self, enabled: bool) -> Self {
        self.short_selling = enabled;
        self
    }

    #[must_use]
    pub fn strategy_id(&self) -> &StrategyId {
        &self.strategy_id
    }

    #[must_use]
    pub fn cash(&self) -> Price {
        self.cash
    }

    #[must_use]
    pub fn realized_pnl(&self) -> Price {
        self.realized_pnl
    }

    /// Signed position quantity for a symbol (zero when flat).
    #[must_use]
    pub fn position_qty(&self, symbol: &str) -> Quantity {
        self.positions
            .get(symbol)
            .map(|position| position.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    /// Last mark price observed for a symbol.
    #[must_use]
    pub fn last_mark(&self, symbol: &str) -> Option<Price> {
        self.marks.get(symbol).copied()
    }

    /// Symbols with a non-flat position and their signed quantities.
    #[must_use]
    pub fn open_positions(&self) -> Vec<(Symbol, Quantity)> {
        let mut positions: Vec<(Symbol, Quantity)> = self
            .positions
            .iter()
            .filter(|(_, position)| !position.is_flat())
            .map(|(symbol, position)| (symbol.clone(), position.quantity))
            .collect();
        positions.sort();
        positions
    }

    /// Cash plus marked position value.
    #[must_use]
    pub fn equity(&self) -> Price {
        let positions: Price = self.positions.values().map(|p| p.market_value).sum();
        self.cash + positions
    }

    /// Refresh the mark price for a symbol, returning a statistics event.
    pub fn mark(&mut self, symbol: &str, price: Price) -> LedgerEvent {
        self.marks.insert(symbol.to_string(), price);
        if let Some(position) = self.positions.get_mut(symbol) {
            position.mark(price);
        }
        LedgerEvent::Mark {
            strategy_id: self.strategy_id.clone(),
            symbol: symbol.to_string(),
            price,
            equity: self.equity(),
        }
    }

    /// Convert a signal into an order proposal for `symbol`, applying the
    /// intent table and then the gate chain in order. First failure rejects.
    #[must_use]
    pub fn size_signal(&self, symbol: &str, signal: &Signal) -> SizeOutcome {
        if matches!(signal.signal_type, SignalType::Hold) {
            return SizeOutcome::NoAction;
        }
        let price = signal.price;
        let current_qty = self.position_qty(symbol);

        // CLOSE flattens whatever is held, ignoring any sizing intent.
        let (side, qty) = if matches!(signal.signal_type, SignalType::Close) {
            if current_qty.is_zero() {
                return SizeOutcome::NoAction;
            }
            let side = if current_qty > Decimal::ZERO {
                Side::Sell
            } else {
                Side::Buy
            };
            (side, current_qty.abs())
        } else {
            let declared = signal
                .signal_type
                .side()
                .expect("non-hold signal has a side");
            match self.intent_quantity(signal, price, current_qty) {
                IntentQuantity::Directed(qty) => (declared, qty),
                IntentQuantity::SignedDelta(delta) => {
                    if delta.is_zero() {
                        return SizeOutcome::NoAction;
                    }
                    let side = if delta > Decimal::ZERO {
                        Side::Buy
                    } else {
                        Side::Sell
                    };
                    (side, delta.abs())
                }
            }
        };

        let qty = self.capabilities.round_quantity(qty);
        if qty <= Decimal::ZERO {
            return SizeOutcome::Rejected(SizeRejection {
                reason: RejectReason::ZeroQuantity,
                detail: "quantity rounds to zero".to_string(),
            });
        }

        let order_type = signal
            .signal_type
            .order_type()
            .expect("non-hold signal maps to an order type");

        // Gate 1: order type supported by the broker.
        if !self.capabilities.supports(order_type) {
            return SizeOutcome::Rejected(SizeRejection {
                reason: RejectReason::UnsupportedOrderType,
                detail: format!("{order_type:?} not supported by broker"),
            });
        }

        // Gate 2: absolute notional above the broker minimum.
        let notional = (qty * price).abs();
        if notional < self.capabilities.min_notional {
            return SizeOutcome::Rejected(SizeRejection {
                reason: RejectReason::BelowMinNotional,
                detail: format!(
                    "notional {notional} below minimum {}",
                    self.capabilities.min_notional
                ),
            });
        }

        // Gate 3: cash for buys, position (or short permission) for sells.
        match side {
            Side::Buy => {
                let cost = qty * price;
                if cost > self.cash {
                    return SizeOutcome::Rejected(SizeRejection {
                        reason: RejectReason::InsufficientCash,
                        detail: format!("cost {cost} exceeds cash {}", self.cash),
                    });
                }
            }
            Side::Sell => {
                let resulting = current_qty - qty;
                if resulting < Decimal::ZERO && !self.short_selling {
                    let reason = if current_qty <= Decimal::ZERO {
                        RejectReason::ShortingDisabled
                    } else {
                        RejectReason::InsufficientPosition
                    };
                    return SizeOutcome::Rejected(SizeRejection {
                        reason,
                        detail: format!("sell {qty} against position {current_qty}"),
                    });
                }
            }
        }

        // Gate 4: resulting exposure within the broker's position cap.
        if let Some(max_position) = self.capabilities.max_position_size {
            let resulting = (current_qty + side.sign() * qty).abs();
            if resulting > max_position {
                return SizeOutcome::Rejected(SizeRejection {
                    reason: RejectReason::ExceedsMaxPosition,
                    detail: format!("resulting position {resulting} above cap {max_position}"),
                });
            }
        }

        // Gate 5: lot floor after rounding.
        if qty < self.capabilities.min_lot_size {
            return SizeOutcome::Rejected(SizeRejection {
                reason: RejectReason::BelowMinLot,
                detail: format!(
                    "quantity {qty} below lot minimum {}",
                    self.capabilities.min_lot_size
                ),
            });
        }

        SizeOutcome::Order(Order {
            id: OrderId::generate(),
            strategy_id: self.strategy_id.clone(),
            symbol: symbol.to_string(),
            side,
            order_type,
            qty,
            limit_price: signal.limit_price,
            stop_price: signal.stop_price,
            time_in_force: signal.time_in_force,
            state: OrderState::Pending,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            broker_order_id: None,
            submit_ts: signal.timestamp,
            terminal_ts: None,
        })
    }

    fn intent_quantity(
        &self,
        signal: &Signal,
        price: Price,
        current_qty: Quantity,
    ) -> IntentQuantity {
        let equity = self.equity();
        let position_value = current_qty * price;
        match signal.sizing {
            SizingIntent::Units(units) => IntentQuantity::Directed(units),
            SizingIntent::Notional(notional) => IntentQuantity::Directed(notional / price),
            SizingIntent::EquityPct(pct) | SizingIntent::LegacyFraction(pct) => {
                IntentQuantity::Directed(pct * equity / price)
            }
            SizingIntent::TargetUnits(target) => IntentQuantity::SignedDelta(target - current_qty),
            SizingIntent::TargetNotional(target) => {
                IntentQuantity::SignedDelta((target - position_value) / price)
            }
            SizingIntent::TargetEquityPct(pct) => {
                IntentQuantity::SignedDelta((pct * equity - position_value) / price)
            }
            SizingIntent::None => IntentQuantity::Directed(DEFAULT_EQUITY_PCT * equity / price),
        }
    }

    /// Apply a fill atomically: cash, position quantity, average cost, and
    /// realised P&L (average-cost method) move together.
    pub fn apply_fill(&mut self, fill: &Fill) -> PortfolioResult<(FillApplication, LedgerEvent)> {
        if fill.strategy_id != self.strategy_id {
            return Err(PortfolioError::Attribution(format!(
                "fill for {} applied to ledger {}",
                fill.strategy_id, self.strategy_id
            )));
        }
        let entry = self
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::flat(fill.symbol.clone()));

        let signed_fill = fill.side.sign() * fill.qty;
        let prev_qty = entry.quantity;
        let mut realized_delta = Decimal::ZERO;

        if prev_qty.is_zero() || prev_qty.signum() == signed_fill.signum() {
            // Increasing exposure: recompute the average cost.
            let total = prev_qty + signed_fill;
            if !total.is_zero() {
                entry.average_cost = (entry.average_cost * prev_qty.abs()
                    + fill.price * fill.qty)
                    / total.abs();
            }
            entry.quantity = total;
        } else {
            // Reducing (or flipping) exposure: realise P&L on the closed part.
            let closing = fill.qty.min(prev_qty.abs());
            realized_delta = (fill.price - entry.average_cost) * closing * prev_qty.signum();
            let total = prev_qty + signed_fill;
            if total.signum() != prev_qty.signum() && !total.is_zero() {
                // Flipped through flat; the remainder opens at the fill price.
                entry.average_cost = fill.price;
            } else if total.is_zero() {
                entry.average_cost = Decimal::ZERO;
            }
            entry.quantity = total;
        }

        let mark = self.marks.get(&fill.symbol).copied().unwrap_or(fill.price);
        entry.mark(mark);
        if entry.quantity.is_zero() {
            self.positions.remove(&fill.symbol);
        }

        self.cash -= signed_fill * fill.price + fill.fee;
        self.realized_pnl += realized_delta;
        self.marks.insert(fill.symbol.clone(), mark);

        self.fills.push(fill.clone());
        if self.fills.len() > FILL_LOG_CAP {
            let excess = self.fills.len() - FILL_LOG_CAP;
            self.fills.drain(..excess);
        }

        self.check_identity()?;

        let equity = self.equity();
        debug!(
            strategy = %self.strategy_id,
            symbol = %fill.symbol,
            qty = %fill.qty,
            price = %fill.price,
            realized = %realized_delta,
            cash = %self.cash,
            "fill applied to ledger"
        );
        let application = FillApplication {
            realized_delta,
            position_qty: self.position_qty(&fill.symbol),
            cash: self.cash,
            equity,
        };
        let event = LedgerEvent::Fill {
            strategy_id: self.strategy_id.clone(),
            fill: fill.clone(),
            realized_delta,
            equity,
            cash: self.cash,
        };
        Ok((application, event))
    }

    /// `cash + Σ market_value == initial_cash + realised + unrealised - fees`
    /// within 1e-9 relative tolerance (average-cost division can leave a
    /// remainder in the last of Decimal's 28 digits).
    fn check_identity(&self) -> PortfolioResult<()> {
        let fees: Price = self.fills.iter().map(|fill| fill.fee).sum();
        let unrealized: Price = self
            .positions
            .values()
            .map(|position| {
                let mark = self
                    .marks
                    .get(&position.symbol)
                    .copied()
                    .unwrap_or(position.average_cost);
                position.unrealized_pnl(mark)
            })
            .sum();
        let lhs = self.equity();
        let rhs = self.initial_cash + self.realized_pnl + unrealized - fees;
        let tolerance = Decimal::new(1, 9) * lhs.abs().max(Decimal::ONE);
        if (lhs - rhs).abs() > tolerance {
            return Err(PortfolioError::InvariantViolation(format!(
                "ledger identity broke for {}: {lhs} != {rhs}",
                self.strategy_id
            )));
        }
        Ok(())
    }

    /// Point-in-time view for the supervisor and statistics endpoint.
    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        let unrealized: Price = self
            .positions
            .values()
            .map(|position| {
                let mark = self
                    .marks
                    .get(&position.symbol)
                    .copied()
                    .unwrap_or(position.average_cost);
                position.unrealized_pnl(mark)
            })
            .sum();
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        LedgerSnapshot {
            initial_cash: self.initial_cash,
            cash: self.cash,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: unrealized,
            equity: self.equity(),
            positions,
            fill_count: self.fills.len(),
            taken_at: Utc::now(),
        }
    }
}

enum IntentQuantity {
    /// Magnitude on the side the signal declared.
    Directed(Quantity),
    /// Signed delta toward a target; the sign picks the side.
    SignedDelta(Quantity),
}
