//! End-to-end runtime flows against the demo provider and paper broker.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Once};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::json;
use stratequeue_broker::DataProviderAdapter;
use stratequeue_core::{
    Bar, Signal, SignalType, SizingIntent, StrategyId, StrategyStatus, TradingMode,
};
use stratequeue_data::DataManager;
use stratequeue_demo::{DemoConfig, DemoProvider};
use stratequeue_engine::{
    register_evaluator_factory, EngineResult, EvaluatorFactory, SignalEvaluator,
};
use stratequeue_gateway::GatewayConfig;
use stratequeue_paper::{PaperBroker, PaperConfig};
use stratequeue_runtime::{
    DeploySpec, ManualClock, RunnerConfig, ShutdownSignal, StopOptions, Supervisor,
    SupervisorConfig, SupervisorDeps, SupervisorHandle,
};
use stratequeue_stats::StatisticsManager;

// -------------------------------------------------------------------------------------------------
// Scripted evaluator driven by deploy params
// -------------------------------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
struct ScriptedParams {
    action: String,
    #[serde(default)]
    value: Option<Decimal>,
}

struct ScriptedEvaluator {
    params: ScriptedParams,
    fired: bool,
}

impl SignalEvaluator for ScriptedEvaluator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn evaluate(&mut self, window: &[Bar]) -> EngineResult<Signal> {
        let last = window.last().expect("non-empty window");
        let signal = match self.params.action.as_str() {
            "buy_equity_pct" if !self.fired => {
                self.fired = true;
                Signal::new(SignalType::Buy, last.close, last.ts)
                    .with_sizing(SizingIntent::EquityPct(self.params.value.unwrap_or(dec!(0.1))))
            }
            "buy_notional" => Signal::new(SignalType::Buy, last.close, last.ts)
                .with_sizing(SizingIntent::Notional(self.params.value.unwrap_or(dec!(9)))),
            _ => Signal::hold(last.close, last.ts),
        };
        Ok(signal)
    }
}

struct ScriptedFactory;

impl EvaluatorFactory for ScriptedFactory {
    fn canonical_name(&self) -> &'static str {
        "scripted"
    }

    fn build(&self, params: &serde_json::Value) -> EngineResult<Box<dyn SignalEvaluator>> {
        let params: ScriptedParams = serde_json::from_value(params.clone()).map_err(|err| {
            stratequeue_engine::EngineError::InvalidConfig(format!("scripted params: {err}"))
        })?;
        Ok(Box::new(ScriptedEvaluator {
            params,
            fired: false,
        }))
    }
}

fn register_scripted() {
    static INIT: Once = Once::new();
    INIT.call_once(|| register_evaluator_factory(Arc::new(ScriptedFactory)));
}

// -------------------------------------------------------------------------------------------------
// Harness
// -------------------------------------------------------------------------------------------------

struct Harness {
    supervisor: SupervisorHandle,
    clock: Arc<ManualClock>,
    shutdown: ShutdownSignal,
    _strategy_file: tempfile::NamedTempFile,
    strategy_path: String,
}

fn flat_price_provider() -> Arc<dyn DataProviderAdapter> {
    Arc::new(DemoProvider::new(DemoConfig {
        seed: 1,
        start_price: dec!(100),
        volatility_bps: 0,
        max_history: 500,
        feed_interval_ms: Some(2),
    }))
}

async fn harness_with_broker(paper: PaperConfig) -> Harness {
    register_scripted();
    let _ = tracing_subscriber::fmt::try_init();

    let mut providers: HashMap<String, Arc<dyn DataProviderAdapter>> = HashMap::new();
    providers.insert("demo".to_string(), flat_price_provider());
    let (data, _data_task) = DataManager::spawn(providers);

    let broker = Arc::new(PaperBroker::new("paper", paper));
    let mut brokers: HashMap<String, Arc<dyn stratequeue_broker::BrokerAdapter>> = HashMap::new();
    brokers.insert("paper".to_string(), broker);

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap(),
    ));
    let shutdown = ShutdownSignal::new();
    let config = SupervisorConfig {
        runner: RunnerConfig {
            evaluator_timeout: Duration::from_secs(2),
            warmup_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(0),
            max_consecutive_errors: 5,
            stop_drain_timeout: Duration::from_secs(2),
        },
        gateway: GatewayConfig {
            submit_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            reconcile_interval: Duration::from_millis(500),
        },
        default_account_equity: dec!(100000),
        short_selling: false,
    };
    let stats = Arc::new(StatisticsManager::new());
    let (supervisor, _task) = Supervisor::spawn(SupervisorDeps {
        data,
        providers: vec!["demo".to_string()],
        brokers,
        stats,
        clock: clock.clone(),
        config,
        shutdown: shutdown.clone(),
    });

    let mut strategy_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(strategy_file, "# scripted strategy placeholder").unwrap();
    let strategy_path = strategy_file.path().to_string_lossy().to_string();
    Harness {
        supervisor,
        clock,
        shutdown,
        _strategy_file: strategy_file,
        strategy_path,
    }
}

fn spec(harness: &Harness, id: &str, action: serde_json::Value) -> DeploySpec {
    DeploySpec {
        strategy: harness.strategy_path.clone(),
        strategy_id: Some(id.to_string()),
        engine: Some("scripted".to_string()),
        symbols: vec!["AAPL".to_string()],
        granularity: stratequeue_core::Granularity::OneMinute,
        lookback: 5,
        duration_minutes: None,
        allocation: dec!(10000),
        data_source: "demo".to_string(),
        broker: "paper".to_string(),
        mode: TradingMode::Paper,
        params: action,
    }
}

async fn wait_status(harness: &Harness, id: &StrategyId, status: StrategyStatus) {
    for _ in 0..300 {
        if let Ok(Some(record)) = harness.supervisor.get(id.clone()).await {
            if record.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("strategy never reached {status:?}");
}

/// Advance the manual clock a bar at a time until the strategy's statistics
/// satisfy `predicate`.
async fn drive_until_stats(
    harness: &Harness,
    id: &StrategyId,
    predicate: impl Fn(&stratequeue_stats::StrategyStats) -> bool,
) {
    for _ in 0..100 {
        harness.clock.advance(chrono::Duration::minutes(1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        let satisfied = harness
            .supervisor
            .stats()
            .snapshot(id)
            .map(|stats| predicate(&stats))
            .unwrap_or(false);
        if satisfied {
            return;
        }
    }
    panic!("condition never reached while driving ticks");
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn deploy_roundtrip_pause_resume_stop() {
    let harness = harness_with_broker(PaperConfig::default()).await;
    let mut registry_rx = harness.supervisor.subscribe_registry();
    let deploy = spec(&harness, "lifecycle", json!({"action": "hold"}));
    let id = harness.supervisor.deploy(deploy.clone()).await.unwrap();
    assert_eq!(id.as_str(), "lifecycle");

    // Deploy -> get returns the submitted fields.
    let record = harness.supervisor.get(id.clone()).await.unwrap().unwrap();
    assert_eq!(record.symbols, deploy.symbols);
    assert_eq!(record.lookback, deploy.lookback);
    assert_eq!(record.engine, "scripted");
    assert_eq!(record.mode, TradingMode::Paper);
    assert_eq!(record.source_path, deploy.strategy);

    wait_status(&harness, &id, StrategyStatus::Running).await;
    assert!(registry_rx.recv().await.is_ok());

    // Deploying the same id twice is refused while active.
    let err = harness.supervisor.deploy(deploy).await.unwrap_err();
    assert!(matches!(
        err,
        stratequeue_runtime::SupervisorError::InvalidState(_)
    ));

    harness.supervisor.pause(id.clone()).await.unwrap();
    wait_status(&harness, &id, StrategyStatus::Paused).await;
    // Pausing a paused strategy is a no-op.
    harness.supervisor.pause(id.clone()).await.unwrap();

    harness.supervisor.resume(id.clone()).await.unwrap();
    wait_status(&harness, &id, StrategyStatus::Running).await;

    harness
        .supervisor
        .stop(id.clone(), StopOptions::default())
        .await
        .unwrap();
    wait_status(&harness, &id, StrategyStatus::Stopped).await;
    // Stopping an already-stopped strategy is idempotent.
    harness
        .supervisor
        .stop(id.clone(), StopOptions::default())
        .await
        .unwrap();

    let snapshot = harness.supervisor.snapshot(id.clone()).await.unwrap().unwrap();
    assert!(snapshot.ledger.is_some());
    assert_eq!(snapshot.record.status, StrategyStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn equity_pct_buy_is_sized_filled_and_accounted() {
    let harness = harness_with_broker(PaperConfig::default()).await;
    let deploy = spec(
        &harness,
        "s1",
        json!({"action": "buy_equity_pct", "value": 0.1}),
    );
    let id = harness.supervisor.deploy(deploy).await.unwrap();
    wait_status(&harness, &id, StrategyStatus::Running).await;

    drive_until_stats(&harness, &id, |stats| stats.trade_count >= 1).await;

    let record = harness.supervisor.get(id.clone()).await.unwrap().unwrap();
    assert_eq!(record.last_signal_type, Some(SignalType::Buy));

    harness
        .supervisor
        .stop(id.clone(), StopOptions::default())
        .await
        .unwrap();
    wait_status(&harness, &id, StrategyStatus::Stopped).await;

    // 10% of 10_000 at a flat price of 100 buys exactly 10 units.
    let snapshot = harness.supervisor.snapshot(id.clone()).await.unwrap().unwrap();
    let ledger = snapshot.ledger.unwrap();
    assert_eq!(ledger.cash, dec!(9000));
    assert_eq!(ledger.positions.len(), 1);
    assert_eq!(ledger.positions[0].quantity, dec!(10));
    assert_eq!(ledger.positions[0].average_cost, dec!(100));
    assert_eq!(ledger.equity, dec!(10000));

    let stats = snapshot.stats.unwrap();
    assert_eq!(stats.equity, dec!(10000));
    assert!(stats.signal_count >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn below_min_notional_rejects_without_ledger_change() {
    let harness = harness_with_broker(PaperConfig {
        min_notional: dec!(10),
        ..PaperConfig::default()
    })
    .await;
    let deploy = spec(
        &harness,
        "s2",
        json!({"action": "buy_notional", "value": 9.0}),
    );
    let id = harness.supervisor.deploy(deploy).await.unwrap();
    wait_status(&harness, &id, StrategyStatus::Running).await;

    drive_until_stats(&harness, &id, |stats| stats.rejection_count >= 1).await;

    let record = harness.supervisor.get(id.clone()).await.unwrap().unwrap();
    assert_eq!(record.last_signal_type, Some(SignalType::Buy));

    harness
        .supervisor
        .stop(id.clone(), StopOptions::default())
        .await
        .unwrap();
    wait_status(&harness, &id, StrategyStatus::Stopped).await;
    let ledger = harness
        .supervisor
        .snapshot(id.clone())
        .await
        .unwrap()
        .unwrap()
        .ledger
        .unwrap();
    assert_eq!(ledger.cash, dec!(10000));
    assert!(ledger.positions.is_empty());
    assert_eq!(ledger.fill_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_with_liquidate_flattens_positions() {
    let harness = harness_with_broker(PaperConfig::default()).await;
    let deploy = spec(
        &harness,
        "s6",
        json!({"action": "buy_equity_pct", "value": 0.1}),
    );
    let id = harness.supervisor.deploy(deploy).await.unwrap();
    wait_status(&harness, &id, StrategyStatus::Running).await;

    drive_until_stats(&harness, &id, |stats| stats.trade_count >= 1).await;

    harness
        .supervisor
        .stop(
            id.clone(),
            StopOptions {
                liquidate: true,
                force: false,
            },
        )
        .await
        .unwrap();
    wait_status(&harness, &id, StrategyStatus::Stopped).await;

    let snapshot = harness.supervisor.snapshot(id.clone()).await.unwrap().unwrap();
    let ledger = snapshot.ledger.unwrap();
    assert!(ledger.positions.is_empty());
    // Bought 10 @ 100 and sold 10 @ 100: flat, cash restored.
    assert_eq!(ledger.cash, dec!(10000));
    assert_eq!(ledger.equity, dec!(10000));
    assert_eq!(ledger.fill_count, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn duration_expiry_stops_the_strategy() {
    let harness = harness_with_broker(PaperConfig::default()).await;
    let mut deploy = spec(&harness, "timed", json!({"action": "hold"}));
    deploy.duration_minutes = Some(3);
    let id = harness.supervisor.deploy(deploy).await.unwrap();
    wait_status(&harness, &id, StrategyStatus::Running).await;

    harness.clock.advance(chrono::Duration::minutes(5));
    wait_status(&harness, &id, StrategyStatus::Stopped).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_rejects_bad_specs() {
    let harness = harness_with_broker(PaperConfig::default()).await;
    let mut bad = spec(&harness, "bad", json!({"action": "hold"}));
    bad.symbols.clear();
    bad.engine = Some("no-such-engine".to_string());
    bad.data_source = "no-such-source".to_string();
    let errors = harness.supervisor.validate(bad).await.unwrap();
    assert!(errors.iter().any(|e| e.contains("symbol")));
    assert!(errors.iter().any(|e| e.contains("no-such-engine")));
    assert!(errors.iter().any(|e| e.contains("no-such-source")));

    // A valid spec validates cleanly.
    let good = spec(&harness, "good", json!({"action": "hold"}));
    assert!(harness.supervisor.validate(good).await.unwrap().is_empty());
    harness.shutdown.trigger();
}
