//! Rolling per-strategy performance accounting.
//!
//! A pure consumer of the ledger event stream: fills and mark-price updates
//! flow in, bounded-memory snapshots flow out. Readers always get a
//! consistent snapshot and never block writers; the writer publishes a fresh
//! `Arc` after every update.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stratequeue_core::{Price, SignalType, StrategyId, Symbol};
use stratequeue_portfolio::LedgerEvent;
use tracing::debug;

/// Realized-trade deltas retained for the rolling averages.
const TRADE_WINDOW_CAP: usize = 256;
/// Latest signals retained for the statistics endpoint.
const SIGNAL_HISTORY_CAP: usize = 64;

/// One recorded signal, newest last.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignalRecord {
    pub ts: DateTime<Utc>,
    pub symbol: Symbol,
    pub signal_type: SignalType,
    pub price: Price,
}

/// Immutable snapshot of a strategy's performance.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategyStats {
    pub strategy_id: StrategyId,
    pub initial_equity: Price,
    pub equity: Price,
    pub peak_equity: Price,
    /// Largest peak-to-trough equity fraction observed.
    pub max_drawdown: Decimal,
    pub realized_pnl: Price,
    /// Net P&L including open positions, net of fees.
    pub net_pnl: Price,
    pub total_return: Decimal,
    pub trade_count: u64,
    pub win_count: u64,
    pub loss_count: u64,
    pub win_rate: Option<Decimal>,
    pub avg_win: Option<Price>,
    pub avg_loss: Option<Price>,
    pub signal_count: u64,
    pub rejection_count: u64,
    pub last_signal: Option<SignalRecord>,
    pub recent_signals: Vec<SignalRecord>,
    pub updated_at: DateTime<Utc>,
}

struct StatsState {
    initial_equity: Price,
    equity: Price,
    peak_equity: Price,
    max_drawdown: Decimal,
    realized_pnl: Price,
    trade_count: u64,
    win_count: u64,
    loss_count: u64,
    wins: VecDeque<Price>,
    losses: VecDeque<Price>,
    signal_count: u64,
    rejection_count: u64,
    signals: VecDeque<SignalRecord>,
}

impl StatsState {
    fn new(initial_equity: Price) -> Self {
        Self {
            initial_equity,
            equity: initial_equity,
            peak_equity: initial_equity,
            max_drawdown: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            trade_count: 0,
            win_count: 0,
            loss_count: 0,
            wins: VecDeque::new(),
            losses: VecDeque::new(),
            signal_count: 0,
            rejection_count: 0,
            signals: VecDeque::new(),
        }
    }

    fn update_equity(&mut self, equity: Price) {
        self.equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        if self.peak_equity > Decimal::ZERO {
            let drawdown = (self.peak_equity - equity) / self.peak_equity;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
    }

    fn record_trade(&mut self, realized_delta: Price) {
        self.trade_count += 1;
        if realized_delta > Decimal::ZERO {
            self.win_count += 1;
            push_capped(&mut self.wins, realized_delta, TRADE_WINDOW_CAP);
        } else if realized_delta < Decimal::ZERO {
            self.loss_count += 1;
            push_capped(&mut self.losses, realized_delta, TRADE_WINDOW_CAP);
        }
    }

    fn snapshot(&self, strategy_id: &StrategyId) -> StrategyStats {
        let closed = self.win_count + self.loss_count;
        let win_rate = (closed > 0)
            .then(|| Decimal::from(self.win_count) / Decimal::from(closed));
        StrategyStats {
            strategy_id: strategy_id.clone(),
            initial_equity: self.initial_equity,
            equity: self.equity,
            peak_equity: self.peak_equity,
            max_drawdown: self.max_drawdown,
            realized_pnl: self.realized_pnl,
            net_pnl: self.equity - self.initial_equity,
            total_return: if self.initial_equity.is_zero() {
                Decimal::ZERO
            } else {
                (self.equity - self.initial_equity) / self.initial_equity
            },
            trade_count: self.trade_count,
            win_count: self.win_count,
            loss_count: self.loss_count,
            win_rate,
            avg_win: mean(&self.wins),
            avg_loss: mean(&self.losses),
            signal_count: self.signal_count,
            rejection_count: self.rejection_count,
            last_signal: self.signals.back().cloned(),
            recent_signals: self.signals.iter().cloned().collect(),
            updated_at: Utc::now(),
        }
    }
}

fn push_capped<T>(queue: &mut VecDeque<T>, value: T, cap: usize) {
    if queue.len() >= cap {
        queue.pop_front();
    }
    queue.push_back(value);
}

fn mean(values: &VecDeque<Price>) -> Option<Price> {
    if values.is_empty() {
        return None;
    }
    let sum: Price = values.iter().copied().sum();
    Some(sum / Decimal::from(values.len() as u64))
}

struct StatsCell {
    state: Mutex<StatsState>,
    published: RwLock<Arc<StrategyStats>>,
}

/// Tracks performance for every registered strategy.
#[derive(Default)]
pub struct StatisticsManager {
    cells: RwLock<HashMap<StrategyId, Arc<StatsCell>>>,
}

impl StatisticsManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a strategy. Idempotent; re-registering resets nothing.
    pub fn register(&self, strategy_id: &StrategyId, initial_equity: Price) {
        let mut cells = self.cells.write().expect("stats registry poisoned");
        cells.entry(strategy_id.clone()).or_insert_with(|| {
            let state = StatsState::new(initial_equity);
            let snapshot = Arc::new(state.snapshot(strategy_id));
            Arc::new(StatsCell {
                state: Mutex::new(state),
                published: RwLock::new(snapshot),
            })
        });
    }

    /// Drop a strategy's statistics. The snapshot survives only in whatever
    /// the supervisor retained.
    pub fn remove(&self, strategy_id: &StrategyId) -> Option<Arc<StrategyStats>> {
        let mut cells = self.cells.write().expect("stats registry poisoned");
        cells
            .remove(strategy_id)
            .map(|cell| cell.published.read().expect("stats cell poisoned").clone())
    }

    /// Fold one ledger event into the owning strategy's state.
    pub fn on_event(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::Fill {
                strategy_id,
                realized_delta,
                equity,
                ..
            } => {
                self.with_state(strategy_id, |state| {
                    state.realized_pnl += *realized_delta;
                    state.update_equity(*equity);
                    state.record_trade(*realized_delta);
                });
            }
            LedgerEvent::Mark {
                strategy_id,
                equity,
                ..
            } => {
                self.with_state(strategy_id, |state| state.update_equity(*equity));
            }
        }
    }

    /// Record an emitted signal.
    pub fn record_signal(
        &self,
        strategy_id: &StrategyId,
        symbol: &str,
        signal_type: SignalType,
        price: Price,
        ts: DateTime<Utc>,
    ) {
        self.with_state(strategy_id, |state| {
            state.signal_count += 1;
            push_capped(
                &mut state.signals,
                SignalRecord {
                    ts,
                    symbol: symbol.to_string(),
                    signal_type,
                    price,
                },
                SIGNAL_HISTORY_CAP,
            );
        });
    }

    /// Record a gate rejection.
    pub fn record_rejection(&self, strategy_id: &StrategyId) {
        self.with_state(strategy_id, |state| state.rejection_count += 1);
    }

    /// Latest published snapshot for one strategy.
    #[must_use]
    pub fn snapshot(&self, strategy_id: &StrategyId) -> Option<Arc<StrategyStats>> {
        let cells = self.cells.read().expect("stats registry poisoned");
        cells
            .get(strategy_id)
            .map(|cell| cell.published.read().expect("stats cell poisoned").clone())
    }

    /// Latest snapshots for every tracked strategy.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<StrategyStats>> {
        let cells = self.cells.read().expect("stats registry poisoned");
        cells
            .values()
            .map(|cell| cell.published.read().expect("stats cell poisoned").clone())
            .collect()
    }

    fn with_state(&self, strategy_id: &StrategyId, f: impl FnOnce(&mut StatsState)) {
        let cell = {
            let cells = self.cells.read().expect("stats registry poisoned");
            match cells.get(strategy_id) {
                Some(cell) => cell.clone(),
                None => {
                    debug!(strategy = %strategy_id, "statistics event for unregistered strategy");
                    return;
                }
            }
        };
        let snapshot = {
            let mut state = cell.state.lock().expect("stats cell poisoned");
            f(&mut state);
            Arc::new(state.snapshot(strategy_id))
        };
        *cell.published.write().expect("stats cell poisoned") = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stratequeue_core::{BrokerOrderId, Fill, OrderId, Side};

    fn fill_event(
        strategy: &StrategyId,
        realized: Price,
        equity: Price,
        sequence: u64,
    ) -> LedgerEvent {
        LedgerEvent::Fill {
            strategy_id: strategy.clone(),
            fill: Fill {
                order_id: OrderId::generate(),
                broker_order_id: BrokerOrderId::new("b-1"),
                sequence,
                strategy_id: strategy.clone(),
                symbol: "SYM".into(),
                side: Side::Sell,
                qty: dec!(1),
                price: dec!(100),
                fee: Decimal::ZERO,
                ts: Utc::now(),
            },
            realized_delta: realized,
            equity,
            cash: equity,
        }
    }

    #[test]
    fn drawdown_tracks_peak_to_trough() {
        let stats = StatisticsManager::new();
        let id: StrategyId = "dd".into();
        stats.register(&id, dec!(1000));
        stats.on_event(&fill_event(&id, Decimal::ZERO, dec!(1200), 1));
        stats.on_event(&fill_event(&id, Decimal::ZERO, dec!(900), 2));
        let snapshot = stats.snapshot(&id).unwrap();
        assert_eq!(snapshot.peak_equity, dec!(1200));
        assert_eq!(snapshot.max_drawdown, dec!(0.25));
        // Recovery does not shrink the recorded maximum.
        stats.on_event(&fill_event(&id, Decimal::ZERO, dec!(1300), 3));
        let snapshot = stats.snapshot(&id).unwrap();
        assert_eq!(snapshot.max_drawdown, dec!(0.25));
    }

    #[test]
    fn win_loss_accounting() {
        let stats = StatisticsManager::new();
        let id: StrategyId = "wl".into();
        stats.register(&id, dec!(1000));
        stats.on_event(&fill_event(&id, dec!(50), dec!(1050), 1));
        stats.on_event(&fill_event(&id, dec!(-20), dec!(1030), 2));
        stats.on_event(&fill_event(&id, dec!(30), dec!(1060), 3));
        let snapshot = stats.snapshot(&id).unwrap();
        assert_eq!(snapshot.trade_count, 3);
        assert_eq!(snapshot.win_count, 2);
        assert_eq!(snapshot.loss_count, 1);
        assert_eq!(snapshot.realized_pnl, dec!(60));
        assert_eq!(snapshot.net_pnl, dec!(60));
        assert_eq!(snapshot.avg_win, Some(dec!(40)));
        assert_eq!(snapshot.avg_loss, Some(dec!(-20)));
        assert_eq!(snapshot.win_rate, Some(dec!(2) / dec!(3)));
    }

    #[test]
    fn signal_history_is_bounded() {
        let stats = StatisticsManager::new();
        let id: StrategyId = "sig".into();
        stats.register(&id, dec!(1000));
        for index in 0..(SIGNAL_HISTORY_CAP + 10) {
            stats.record_signal(
                &id,
                "SYM",
                SignalType::Hold,
                Decimal::from(index as u64),
                Utc::now(),
            );
        }
        let snapshot = stats.snapshot(&id).unwrap();
        assert_eq!(snapshot.recent_signals.len(), SIGNAL_HISTORY_CAP);
        assert_eq!(snapshot.signal_count, (SIGNAL_HISTORY_CAP + 10) as u64);
        assert_eq!(
            snapshot.last_signal.clone().unwrap().price,
            Decimal::from((SIGNAL_HISTORY_CAP + 9) as u64)
        );
    }

    #[test]
    fn events_for_unknown_strategies_are_ignored() {
        let stats = StatisticsManager::new();
        let id: StrategyId = "ghost".into();
        stats.on_event(&fill_event(&id, dec!(1), dec!(1), 1));
        assert!(stats.snapshot(&id).is_none());
    }
}
