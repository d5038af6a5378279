//! Deterministic synthetic market data for demos and tests.
//!
//! Bars follow a seeded random walk, so the same configuration always
//! produces the same series. The realtime feed continues the walk exactly
//! where the historical fetch left off; `feed_interval_ms` compresses wall
//! time so tests do not wait out real bar periods.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stratequeue_broker::{
    BarFeed, DataProviderAdapter, DataProviderFactory, ProviderError, ProviderResult,
};
use stratequeue_core::{Bar, Granularity, Symbol};

/// Generator parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DemoConfig {
    pub seed: u64,
    pub start_price: Decimal,
    /// Maximum per-bar move in basis points.
    pub volatility_bps: u32,
    /// Bars the provider pretends to retain; history requests are capped here.
    pub max_history: usize,
    /// Wall-clock pacing of the live feed. `None` paces at the granularity.
    pub feed_interval_ms: Option<u64>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            start_price: Decimal::from(100),
            volatility_bps: 50,
            max_history: 10_000,
            feed_interval_ms: None,
        }
    }
}

struct WalkState {
    rng: StdRng,
    last_close: Decimal,
    next_ts: DateTime<Utc>,
}

type WalkKey = (Symbol, Granularity);

/// Synthetic provider; one independent walk per `(symbol, granularity)`.
pub struct DemoProvider {
    config: DemoConfig,
    walks: Arc<Mutex<HashMap<WalkKey, WalkState>>>,
}

impl DemoProvider {
    #[must_use]
    pub fn new(config: DemoConfig) -> Self {
        Self {
            config,
            walks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn seed_for(&self, symbol: &str, granularity: Granularity) -> u64 {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        granularity.code().hash(&mut hasher);
        self.config.seed ^ hasher.finish()
    }

    fn next_bar_from(config: &DemoConfig, state: &mut WalkState, key: &WalkKey) -> Bar {
        let span = i64::from(config.volatility_bps);
        let step_bps = state.rng.gen_range(-span..=span);
        let factor = Decimal::ONE + Decimal::new(step_bps, 4);
        let open = state.last_close;
        let close = (open * factor).round_dp(8);
        let high = open.max(close) * (Decimal::ONE + Decimal::new(span, 5));
        let low = open.min(close) * (Decimal::ONE - Decimal::new(span, 5));
        let volume = Decimal::from(state.rng.gen_range(100u64..10_000));
        let bar = Bar {
            symbol: key.0.clone(),
            granularity: key.1,
            open,
            high: high.round_dp(8),
            low: low.round_dp(8),
            close,
            volume,
            ts: state.next_ts,
            final_of_period: true,
        };
        state.last_close = close;
        state.next_ts += key.1.as_duration();
        bar
    }
}

#[async_trait]
impl DataProviderAdapter for DemoProvider {
    fn name(&self) -> &str {
        "demo"
    }

    async fn fetch_history(
        &self,
        symbol: &str,
        granularity: Granularity,
        lookback: usize,
    ) -> ProviderResult<Vec<Bar>> {
        let key = (symbol.to_string(), granularity);
        let count = lookback.min(self.config.max_history);
        let mut walks = self.walks.lock().expect("demo walks poisoned");
        let state = walks.entry(key.clone()).or_insert_with(|| {
            let period = granularity.as_duration();
            let aligned = Utc::now()
                .duration_trunc(period)
                .unwrap_or_else(|_| Utc::now());
            WalkState {
                rng: StdRng::seed_from_u64(self.seed_for(symbol, granularity)),
                last_close: self.config.start_price,
                // The walk starts far enough back that the largest allowed
                // history request ends at the current period.
                next_ts: aligned - period * self.config.max_history as i32,
            }
        });
        let now = Utc::now();
        let mut bars = Vec::new();
        // Advance the walk up to the present, keeping only the requested tail.
        while state.next_ts <= now {
            let bar = Self::next_bar_from(&self.config, state, &key);
            bars.push(bar);
            if bars.len() > count {
                bars.remove(0);
            }
        }
        Ok(bars)
    }

    async fn subscribe(
        &self,
        symbol: &str,
        granularity: Granularity,
    ) -> ProviderResult<Box<dyn BarFeed>> {
        if symbol.is_empty() {
            return Err(ProviderError::RejectedSymbol(symbol.to_string()));
        }
        let pace = self
            .config
            .feed_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| {
                Duration::from_secs(granularity.seconds().max(1) as u64)
            });
        Ok(Box::new(DemoFeed {
            config: self.config.clone(),
            walks: self.walks.clone(),
            key: (symbol.to_string(), granularity),
            pace,
        }))
    }
}

struct DemoFeed {
    config: DemoConfig,
    walks: Arc<Mutex<HashMap<WalkKey, WalkState>>>,
    key: WalkKey,
    pace: Duration,
}

#[async_trait]
impl BarFeed for DemoFeed {
    async fn next_bar(&mut self) -> ProviderResult<Option<Bar>> {
        tokio::time::sleep(self.pace).await;
        let mut walks = self.walks.lock().expect("demo walks poisoned");
        let state = walks.entry(self.key.clone()).or_insert_with(|| WalkState {
            rng: StdRng::seed_from_u64(self.config.seed),
            last_close: self.config.start_price,
            next_ts: Utc::now()
                .duration_trunc(self.key.1.as_duration())
                .unwrap_or_else(|_| Utc::now()),
        });
        Ok(Some(DemoProvider::next_bar_from(
            &self.config,
            state,
            &self.key,
        )))
    }
}

/// Factory registered under the name `demo`.
#[derive(Default)]
pub struct DemoFactory;

#[async_trait]
impl DataProviderFactory for DemoFactory {
    fn name(&self) -> &'static str {
        "demo"
    }

    async fn create(
        &self,
        config: &serde_json::Value,
    ) -> ProviderResult<Arc<dyn DataProviderAdapter>> {
        let config: DemoConfig = serde_json::from_value(config.clone())
            .map_err(|err| ProviderError::Other(format!("demo config: {err}")))?;
        Ok(Arc::new(DemoProvider::new(config)))
    }
}
