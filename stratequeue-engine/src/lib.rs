//! Signal evaluator interface, registry, and reference evaluators.
//!
//! The runtime stays engine-agnostic: a backtesting library is plugged in as
//! a [`SignalEvaluator`] built by a registered [`EvaluatorFactory`]. Factories
//! register statically at startup and are resolved by name at deploy time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratequeue_core::{Bar, InvalidSignal, Signal, SignalType, SizingIntent};
use thiserror::Error;

/// Result alias used within evaluator implementations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure variants surfaced by evaluators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The evaluator's configuration cannot be parsed or is invalid.
    #[error("configuration is invalid: {0}")]
    InvalidConfig(String),
    /// The window is shorter than the evaluator's minimum.
    #[error("not enough bars to evaluate (have {have}, need {need})")]
    NotEnoughData { have: usize, need: usize },
    /// The evaluator produced a structurally invalid signal.
    #[error("evaluator produced an invalid signal: {0}")]
    InvalidSignal(#[from] InvalidSignal),
    /// Used for all other errors that should bubble up to the runner.
    #[error("evaluator error: {0}")]
    Internal(String),
}

/// Evaluates a window of bars into a trading signal.
///
/// Calls for a single strategy are serial; implementations carry whatever
/// per-strategy state their backing engine needs between calls.
pub trait SignalEvaluator: Send {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Minimum number of bars required before the first meaningful signal.
    fn warmup_bars(&self) -> usize {
        1
    }

    /// Produce a signal for the newest window. The last bar is the most
    /// recent closed bar.
    fn evaluate(&mut self, window: &[Bar]) -> EngineResult<Signal>;

    /// Opaque state snapshot for persistence. Defaults to nothing.
    fn snapshot(&self) -> EngineResult<Value> {
        Ok(Value::Null)
    }

    /// Restore from an opaque state snapshot. Defaults to a no-op.
    fn restore(&mut self, _state: Value) -> EngineResult<()> {
        Ok(())
    }
}

/// Thin dispatcher owning one evaluator instance. Validates every produced
/// signal before it reaches the portfolio manager.
pub struct SignalEngine {
    evaluator: Box<dyn SignalEvaluator>,
}

impl SignalEngine {
    #[must_use]
    pub fn new(evaluator: Box<dyn SignalEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Build an engine by resolving `engine` in the registry.
    pub fn load(engine: &str, params: &Value) -> EngineResult<Self> {
        Ok(Self::new(load_evaluator(engine, params)?))
    }

    #[must_use]
    pub fn evaluator_name(&self) -> String {
        self.evaluator.name().to_string()
    }

    #[must_use]
    pub fn warmup_bars(&self) -> usize {
        self.evaluator.warmup_bars()
    }

    pub fn evaluate(&mut self, window: &[Bar]) -> EngineResult<Signal> {
        let need = self.evaluator.warmup_bars();
        if window.len() < need {
            return Err(EngineError::NotEnoughData {
                have: window.len(),
                need,
            });
        }
        let signal = self.evaluator.evaluate(window)?;
        signal.validate()?;
        Ok(signal)
    }

    pub fn snapshot(&self) -> EngineResult<Value> {
        self.evaluator.snapshot()
    }

    pub fn restore(&mut self, state: Value) -> EngineResult<()> {
        self.evaluator.restore(state)
    }
}

// -------------------------------------------------------------------------------------------------
// Evaluator registry
// -------------------------------------------------------------------------------------------------

static EVALUATOR_REGISTRY: Lazy<EvaluatorRegistry> = Lazy::new(EvaluatorRegistry::new);

/// Returns a handle to the global registry.
pub fn evaluator_registry() -> &'static EvaluatorRegistry {
    &EVALUATOR_REGISTRY
}

/// Registers an evaluator factory with the global registry.
pub fn register_evaluator_factory(factory: Arc<dyn EvaluatorFactory>) {
    evaluator_registry().register(factory);
}

/// Builds an evaluator by engine name using the registered factories.
pub fn load_evaluator(name: &str, params: &Value) -> EngineResult<Box<dyn SignalEvaluator>> {
    evaluator_registry().build(name, params)
}

/// Returns the registered engine identifiers in sorted order.
pub fn registered_engines() -> Vec<&'static str> {
    evaluator_registry().names()
}

/// Guess the engine for a strategy source file from registered markers.
pub fn detect_engine(source: &str) -> Option<&'static str> {
    evaluator_registry().detect(source)
}

/// Factory contract used to construct evaluators from deploy parameters.
pub trait EvaluatorFactory: Send + Sync {
    /// Canonical, user-facing engine identifier (e.g. `sma-cross`).
    fn canonical_name(&self) -> &'static str;

    /// Additional aliases that should resolve to the same engine.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Substrings in a strategy source file that identify this engine.
    fn source_markers(&self) -> &'static [&'static str] {
        &[]
    }

    /// Builds and configures an evaluator with the provided parameters.
    fn build(&self, params: &Value) -> EngineResult<Box<dyn SignalEvaluator>>;
}

#[derive(Default)]
struct RegistryInner {
    by_canonical: HashMap<&'static str, Arc<dyn EvaluatorFactory>>,
    by_alias: HashMap<String, Arc<dyn EvaluatorFactory>>,
}

/// Thread-safe registry used to manage available engines.
pub struct EvaluatorRegistry {
    inner: RwLock<RegistryInner>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    fn register(&self, factory: Arc<dyn EvaluatorFactory>) {
        let mut inner = self.inner.write().expect("registry poisoned");
        let canonical = factory.canonical_name();
        if inner
            .by_canonical
            .insert(canonical, factory.clone())
            .is_some()
        {
            tracing::warn!(
                engine = canonical,
                "duplicate engine registration detected; overriding previous factory"
            );
        }
        inner
            .by_alias
            .insert(normalize_name(canonical), factory.clone());
        for alias in factory.aliases() {
            inner.by_alias.insert(normalize_name(alias), factory.clone());
        }
    }

    fn build(&self, name: &str, params: &Value) -> EngineResult<Box<dyn SignalEvaluator>> {
        let factory = self
            .get(name)
            .ok_or_else(|| EngineError::InvalidConfig(format!("unknown engine: {name}")))?;
        factory.build(params)
    }

    fn get(&self, name: &str) -> Option<Arc<dyn EvaluatorFactory>> {
        let inner = self.inner.read().expect("registry poisoned");
        inner.by_alias.get(&normalize_name(name)).cloned()
    }

    /// Whether the engine name resolves.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn names(&self) -> Vec<&'static str> {
        let inner = self.inner.read().expect("registry poisoned");
        let mut names: Vec<&'static str> = inner.by_canonical.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn detect(&self, source: &str) -> Option<&'static str> {
        let inner = self.inner.read().expect("registry poisoned");
        inner
            .by_canonical
            .values()
            .find(|factory| {
                factory
                    .source_markers()
                    .iter()
                    .any(|marker| source.contains(marker))
            })
            .map(|factory| factory.canonical_name())
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Register the evaluators that ship with the engine crate.
pub fn register_builtin_evaluators() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        register_evaluator_factory(Arc::new(SmaCrossFactory));
        register_evaluator_factory(Arc::new(RsiReversionFactory));
    });
}

// -------------------------------------------------------------------------------------------------
// Helpers
// -------------------------------------------------------------------------------------------------

fn closes(window: &[Bar]) -> impl Iterator<Item = Decimal> + '_ {
    window.iter().map(|bar| bar.close)
}

fn sma(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let len = Decimal::from(values.len() as u64);
    Some(values.iter().copied().sum::<Decimal>() / len)
}

// -------------------------------------------------------------------------------------------------
// Reference evaluators
// -------------------------------------------------------------------------------------------------

/// Double moving-average crossover evaluator.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SmaCrossConfig {
    pub fast_period: usize,
    pub slow_period: usize,
    pub equity_pct: Decimal,
}

impl Default for SmaCrossConfig {
    fn default() -> Self {
        Self {
            fast_period: 5,
            slow_period: 20,
            equity_pct: Decimal::new(1, 1),
        }
    }
}

pub struct SmaCrossEvaluator {
    cfg: SmaCrossConfig,
    long: bool,
}

impl SmaCrossEvaluator {
    pub fn new(cfg: SmaCrossConfig) -> EngineResult<Self> {
        if cfg.fast_period == 0 || cfg.slow_period == 0 {
            return Err(EngineError::InvalidConfig(
                "period values must be greater than zero".into(),
            ));
        }
        if cfg.fast_period >= cfg.slow_period {
            return Err(EngineError::InvalidConfig(
                "`fast_period` must be smaller than `slow_period`".into(),
            ));
        }
        Ok(Self { cfg, long: false })
    }

    fn averages_at(&self, closes: &[Decimal], offset: usize) -> Option<(Decimal, Decimal)> {
        let end = closes.len().checked_sub(offset)?;
        let fast = sma(&closes[end.checked_sub(self.cfg.fast_period)?..end])?;
        let slow = sma(&closes[end.checked_sub(self.cfg.slow_period)?..end])?;
        Some((fast, slow))
    }
}

impl SignalEvaluator for SmaCrossEvaluator {
    fn name(&self) -> &str {
        "sma-cross"
    }

    fn warmup_bars(&self) -> usize {
        self.cfg.slow_period + 1
    }

    fn evaluate(&mut self, window: &[Bar]) -> EngineResult<Signal> {
        let last = window.last().expect("window is non-empty");
        let values: Vec<Decimal> = closes(window).collect();
        let (Some((fast_prev, slow_prev)), Some((fast_curr, slow_curr))) =
            (self.averages_at(&values, 1), self.averages_at(&values, 0))
        else {
            return Err(EngineError::NotEnoughData {
                have: window.len(),
                need: self.warmup_bars(),
            });
        };
        let signal = if fast_prev <= slow_prev && fast_curr > slow_curr && !self.long {
            self.long = true;
            Signal::new(SignalType::Buy, last.close, last.ts)
                .with_sizing(SizingIntent::EquityPct(self.cfg.equity_pct))
        } else if fast_prev >= slow_prev && fast_curr < slow_curr && self.long {
            self.long = false;
            Signal::new(SignalType::Close, last.close, last.ts)
        } else {
            Signal::hold(last.close, last.ts)
        };
        Ok(signal)
    }

    fn snapshot(&self) -> EngineResult<Value> {
        Ok(serde_json::json!({ "long": self.long }))
    }

    fn restore(&mut self, state: Value) -> EngineResult<()> {
        if let Some(long) = state.get("long").and_then(Value::as_bool) {
            self.long = long;
        }
        Ok(())
    }
}

struct SmaCrossFactory;

impl EvaluatorFactory for SmaCrossFactory {
    fn canonical_name(&self) -> &'static str {
        "sma-cross"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["smacross", "sma"]
    }

    fn source_markers(&self) -> &'static [&'static str] {
        &["sma_cross", "SmaCross"]
    }

    fn build(&self, params: &Value) -> EngineResult<Box<dyn SignalEvaluator>> {
        let cfg: SmaCrossConfig = serde_json::from_value(params.clone())
            .map_err(|err| EngineError::InvalidConfig(format!("sma-cross params: {err}")))?;
        Ok(Box::new(SmaCrossEvaluator::new(cfg)?))
    }
}

/// Relative Strength Index mean-reversion evaluator.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RsiReversionConfig {
    pub period: usize,
    pub oversold: Decimal,
    pub overbought: Decimal,
    pub equity_pct: Decimal,
}

impl Default for RsiReversionConfig {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: Decimal::from(30),
            overbought: Decimal::from(70),
            equity_pct: Decimal::new(1, 1),
        }
    }
}

pub struct RsiReversionEvaluator {
    cfg: RsiReversionConfig,
    long: bool,
}

impl RsiReversionEvaluator {
    pub fn new(cfg: RsiReversionConfig) -> EngineResult<Self> {
        if cfg.period == 0 {
            return Err(EngineError::InvalidConfig(
                "period must be greater than zero".into(),
            ));
        }
        if cfg.oversold >= cfg.overbought {
            return Err(EngineError::InvalidConfig(
                "`oversold` must be below `overbought`".into(),
            ));
        }
        Ok(Self { cfg, long: false })
    }

    fn rsi(&self, values: &[Decimal]) -> Option<Decimal> {
        if values.len() < self.cfg.period + 1 {
            return None;
        }
        let tail = &values[values.len() - self.cfg.period - 1..];
        let mut gains = Decimal::ZERO;
        let mut losses = Decimal::ZERO;
        for pair in tail.windows(2) {
            let change = pair[1] - pair[0];
            if change >= Decimal::ZERO {
                gains += change;
            } else {
                losses -= change;
            }
        }
        if losses.is_zero() {
            return Some(Decimal::from(100));
        }
        let rs = gains / losses;
        Some(Decimal::from(100) - Decimal::from(100) / (Decimal::ONE + rs))
    }
}

impl SignalEvaluator for RsiReversionEvaluator {
    fn name(&self) -> &str {
        "rsi-reversion"
    }

    fn warmup_bars(&self) -> usize {
        self.cfg.period + 1
    }

    fn evaluate(&mut self, window: &[Bar]) -> EngineResult<Signal> {
        let last = window.last().expect("window is non-empty");
        let values: Vec<Decimal> = closes(window).collect();
        let Some(rsi) = self.rsi(&values) else {
            return Err(EngineError::NotEnoughData {
                have: window.len(),
                need: self.warmup_bars(),
            });
        };
        let signal = if rsi <= self.cfg.oversold && !self.long {
            self.long = true;
            Signal::new(SignalType::Buy, last.close, last.ts)
                .with_sizing(SizingIntent::EquityPct(self.cfg.equity_pct))
        } else if rsi >= self.cfg.overbought && self.long {
            self.long = false;
            Signal::new(SignalType::Close, last.close, last.ts)
        } else {
            Signal::hold(last.close, last.ts)
        };
        Ok(signal)
    }
}

struct RsiReversionFactory;

impl EvaluatorFactory for RsiReversionFactory {
    fn canonical_name(&self) -> &'static str {
        "rsi-reversion"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["rsi"]
    }

    fn source_markers(&self) -> &'static [&'static str] {
        &["rsi_reversion", "RsiReversion"]
    }

    fn build(&self, params: &Value) -> EngineResult<Box<dyn SignalEvaluator>> {
        let cfg: RsiReversionConfig = serde_json::from_value(params.clone())
            .map_err(|err| EngineError::InvalidConfig(format!("rsi-reversion params: {err}")))?;
        Ok(Box::new(RsiReversionEvaluator::new(cfg)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn window_from_closes(values: &[i64]) -> Vec<Bar> {
        let base = Utc::now() - Duration::minutes(values.len() as i64);
        values
            .iter()
            .enumerate()
            .map(|(index, close)| {
                let close = Decimal::from(*close);
                Bar {
                    symbol: "AAPL".into(),
                    granularity: stratequeue_core::Granularity::OneMinute,
                    open: close,
                    high: close + dec!(1),
                    low: close - dec!(1),
                    close,
                    volume: dec!(100),
                    ts: base + Duration::minutes(index as i64),
                    final_of_period: true,
                }
            })
            .collect()
    }

    #[test]
    fn registry_resolves_aliases_case_insensitively() {
        register_builtin_evaluators();
        assert!(evaluator_registry().contains("SMA-Cross"));
        assert!(evaluator_registry().contains("rsi"));
        assert!(!evaluator_registry().contains("vectorbt"));
        assert!(registered_engines().contains(&"sma-cross"));
    }

    #[test]
    fn engine_detection_matches_source_markers() {
        register_builtin_evaluators();
        assert_eq!(
            detect_engine("from strategies import SmaCross"),
            Some("sma-cross")
        );
        assert_eq!(detect_engine("print('hello')"), None);
    }

    #[test]
    fn sma_cross_emits_buy_on_upward_cross() {
        let cfg = SmaCrossConfig {
            fast_period: 2,
            slow_period: 4,
            equity_pct: dec!(0.1),
        };
        // Downtrend keeps fast below slow, then a sharp rally crosses it above
        // on the final bar.
        let window = window_from_closes(&[110, 108, 106, 104, 102, 100, 99, 140]);
        let mut engine = SignalEngine::new(Box::new(SmaCrossEvaluator::new(cfg).unwrap()));
        let signal = engine.evaluate(&window).unwrap();
        assert_eq!(signal.signal_type, SignalType::Buy);
        assert_eq!(signal.sizing, SizingIntent::EquityPct(dec!(0.1)));
    }

    #[test]
    fn sma_cross_holds_without_cross() {
        let cfg = SmaCrossConfig {
            fast_period: 2,
            slow_period: 4,
            equity_pct: dec!(0.1),
        };
        let mut engine = SignalEngine::new(Box::new(SmaCrossEvaluator::new(cfg).unwrap()));
        let window = window_from_closes(&[100, 100, 100, 100, 100, 100]);
        let signal = engine.evaluate(&window).unwrap();
        assert_eq!(signal.signal_type, SignalType::Hold);
    }

    #[test]
    fn engine_rejects_short_windows() {
        let cfg = SmaCrossConfig::default();
        let mut engine = SignalEngine::new(Box::new(SmaCrossEvaluator::new(cfg).unwrap()));
        let window = window_from_closes(&[100, 101]);
        assert!(matches!(
            engine.evaluate(&window),
            Err(EngineError::NotEnoughData { .. })
        ));
    }

    #[test]
    fn rsi_flags_oversold_windows() {
        let cfg = RsiReversionConfig {
            period: 5,
            oversold: dec!(40),
            overbought: dec!(60),
            equity_pct: dec!(0.2),
        };
        let mut engine = SignalEngine::new(Box::new(RsiReversionEvaluator::new(cfg).unwrap()));
        let window = window_from_closes(&[110, 108, 106, 104, 102, 100]);
        let signal = engine.evaluate(&window).unwrap();
        assert_eq!(signal.signal_type, SignalType::Buy);
    }

    #[test]
    fn evaluator_state_round_trips() {
        let mut evaluator = SmaCrossEvaluator::new(SmaCrossConfig::default()).unwrap();
        evaluator.long = true;
        let state = evaluator.snapshot().unwrap();
        let mut restored = SmaCrossEvaluator::new(SmaCrossConfig::default()).unwrap();
        restored.restore(state).unwrap();
        assert!(restored.long);
    }
}
