//! Market-data subscription management.
//!
//! The data manager owns the provider pool and one [`BarBuffer`] per
//! `(provider, symbol, granularity)`. Strategies subscribing to the same key
//! share a buffer and a feed; the manager seeds each buffer from a historical
//! fetch and keeps it current from the provider's realtime feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stratequeue_broker::{DataProviderAdapter, ProviderError};
use stratequeue_core::{Bar, Granularity, Symbol};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod buffer;

pub use buffer::{BarAdmission, BarBuffer, BarWindow};

/// Result alias for data-manager operations.
pub type DataResult<T> = Result<T, DataError>;

/// Failures surfaced by the data manager.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("unknown data provider: {0}")]
    UnknownProvider(String),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("data manager stopped")]
    ChannelClosed,
}

/// No bar within this many expected intervals marks a buffer stale.
const STALE_INTERVALS: i64 = 3;
const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);
const SEED_ATTEMPTS: usize = 3;

/// Identifies one shared buffer.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BufferKey {
    pub provider: String,
    pub symbol: Symbol,
    pub granularity: Granularity,
}

/// Result of a snapshot request.
#[derive(Clone, Debug)]
pub enum SnapshotState {
    /// At least the effective lookback is buffered.
    Ready { window: BarWindow, stale: bool },
    /// Warmup still in progress.
    NotReady { have: usize, need: usize },
    /// The subscription failed permanently (e.g. rejected symbol).
    Failed { reason: String },
}

type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

enum Command {
    Subscribe {
        provider: String,
        symbol: Symbol,
        granularity: Granularity,
        lookback: usize,
        respond_to: oneshot::Sender<DataResult<SubscriptionHandle>>,
    },
    Snapshot {
        key: BufferKey,
        lookback: usize,
        respond_to: oneshot::Sender<SnapshotState>,
    },
    Ingest {
        key: BufferKey,
        bar: Bar,
    },
    Seeded {
        key: BufferKey,
        bars: Vec<Bar>,
        requested: usize,
    },
    FeedFailed {
        key: BufferKey,
        reason: String,
    },
    Release {
        key: BufferKey,
    },
}

struct BufferSlot {
    buffer: BarBuffer,
    granularity: Granularity,
    seeded: bool,
    /// Set when the provider returned fewer bars than requested; warmup
    /// completes against this smaller count so runners never block forever.
    provider_limit: Option<usize>,
    requested_lookback: Arc<AtomicUsize>,
    refcount: usize,
    failed: Option<String>,
    feed_task: Option<JoinHandle<()>>,
    seed_task: Option<JoinHandle<()>>,
}

impl BufferSlot {
    fn effective_lookback(&self, lookback: usize) -> usize {
        match self.provider_limit {
            Some(limit) => lookback.min(limit).max(1),
            None => lookback,
        }
    }
}

/// Cheap cloneable front-end to the data manager actor.
#[derive(Clone)]
pub struct DataManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl DataManagerHandle {
    /// Subscribe to bars for `(provider, symbol, granularity)`. Idempotent:
    /// a matching buffer is shared and grown to the larger lookback.
    pub async fn subscribe(
        &self,
        provider: &str,
        symbol: &str,
        granularity: Granularity,
        lookback: usize,
    ) -> DataResult<SubscriptionHandle> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe {
                provider: provider.to_string(),
                symbol: symbol.to_string(),
                granularity,
                lookback,
                respond_to: tx,
            })
            .await
            .map_err(|_| DataError::ChannelClosed)?;
        rx.await.map_err(|_| DataError::ChannelClosed)?
    }
}

/// Handle owned by one subscriber. Releasing it decrements the buffer
/// refcount; the last release stops the feed.
pub struct SubscriptionHandle {
    key: BufferKey,
    lookback: usize,
    tx: mpsc::Sender<Command>,
    released: bool,
}

impl SubscriptionHandle {
    /// Snapshot the newest `lookback` bars.
    pub async fn snapshot(&self) -> DataResult<SnapshotState> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot {
                key: self.key.clone(),
                lookback: self.lookback,
                respond_to: tx,
            })
            .await
            .map_err(|_| DataError::ChannelClosed)?;
        rx.await.map_err(|_| DataError::ChannelClosed)
    }

    #[must_use]
    pub fn key(&self) -> &BufferKey {
        &self.key
    }

    #[must_use]
    pub fn lookback(&self) -> usize {
        self.lookback
    }

    /// Release the subscription explicitly.
    pub async fn release(mut self) {
        self.released = true;
        let _ = self
            .tx
            .send(Command::Release {
                key: self.key.clone(),
            })
            .await;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.tx.try_send(Command::Release {
                key: self.key.clone(),
            });
        }
    }
}

/// Owns every buffer and the provider pool. Runs as a single task so there
/// is exactly one writer per buffer.
pub struct DataManager {
    providers: HashMap<String, Arc<dyn DataProviderAdapter>>,
    slots: HashMap<BufferKey, BufferSlot>,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    now: NowFn,
}

impl DataManager {
    /// Spawn the manager over the given provider pool.
    pub fn spawn(
        providers: HashMap<String, Arc<dyn DataProviderAdapter>>,
    ) -> (DataManagerHandle, JoinHandle<()>) {
        Self::spawn_with_now(providers, Arc::new(Utc::now))
    }

    /// Variant taking an injectable time source so staleness is testable.
    pub fn spawn_with_now(
        providers: HashMap<String, Arc<dyn DataProviderAdapter>>,
        now: NowFn,
    ) -> (DataManagerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let manager = Self {
            providers,
            slots: HashMap::new(),
            tx: tx.clone(),
            rx,
            now,
        };
        let task = tokio::spawn(manager.run());
        (DataManagerHandle { tx }, task)
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Subscribe {
                    provider,
                    symbol,
                    granularity,
                    lookback,
                    respond_to,
                } => {
                    let result = self.handle_subscribe(provider, symbol, granularity, lookback);
                    let _ = respond_to.send(result);
                }
                Command::Snapshot {
                    key,
                    lookback,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_snapshot(&key, lookback));
                }
                Command::Ingest { key, bar } => self.handle_ingest(&key, bar),
                Command::Seeded {
                    key,
                    bars,
                    requested,
                } => self.handle_seeded(&key, bars, requested),
                Command::FeedFailed { key, reason } => {
                    if let Some(slot) = self.slots.get_mut(&key) {
                        warn!(
                            symbol = %key.symbol,
                            provider = %key.provider,
                            reason = %reason,
                            "subscription failed permanently"
                        );
                        slot.failed = Some(reason);
                    }
                }
                Command::Release { key } => self.handle_release(&key),
            }
        }
        // Manager dropped: stop every feed.
        for slot in self.slots.values_mut() {
            if let Some(task) = slot.feed_task.take() {
                task.abort();
            }
            if let Some(task) = slot.seed_task.take() {
                task.abort();
            }
        }
    }

    fn handle_subscribe(
        &mut self,
        provider: String,
        symbol: Symbol,
        granularity: Granularity,
        lookback: usize,
    ) -> DataResult<SubscriptionHandle> {
        let adapter = self
            .providers
            .get(&provider)
            .cloned()
            .ok_or_else(|| DataError::UnknownProvider(provider.clone()))?;
        let key = BufferKey {
            provider,
            symbol: symbol.clone(),
            granularity,
        };
        let slot = self.slots.entry(key.clone()).or_insert_with(|| {
            info!(symbol = %key.symbol, provider = %key.provider, granularity = %granularity, "opening bar buffer");
            BufferSlot {
                buffer: BarBuffer::new(lookback),
                granularity,
                seeded: false,
                provider_limit: None,
                requested_lookback: Arc::new(AtomicUsize::new(lookback)),
                refcount: 0,
                failed: None,
                feed_task: None,
                seed_task: None,
            }
        });
        slot.refcount += 1;
        slot.buffer.ensure_capacity(lookback);
        let current = slot.requested_lookback.load(Ordering::Relaxed);
        if lookback > current {
            slot.requested_lookback.store(lookback, Ordering::Relaxed);
        }
        // The live feed starts only after seeding: bars streamed ahead of the
        // historical fetch would make the seed look out-of-order.
        if slot.seed_task.is_none() && !slot.seeded {
            slot.seed_task = Some(spawn_seed_task(
                adapter,
                key.clone(),
                lookback,
                self.tx.clone(),
            ));
        } else if slot.seeded && slot.feed_task.is_none() {
            slot.feed_task = Some(spawn_feed_task(
                adapter,
                key.clone(),
                slot.requested_lookback.clone(),
                self.tx.clone(),
            ));
        }
        Ok(SubscriptionHandle {
            key,
            lookback,
            tx: self.tx.clone(),
            released: false,
        })
    }

    fn handle_snapshot(&self, key: &BufferKey, lookback: usize) -> SnapshotState {
        let Some(slot) = self.slots.get(key) else {
            return SnapshotState::Failed {
                reason: "subscription released".to_string(),
            };
        };
        if let Some(reason) = &slot.failed {
            return SnapshotState::Failed {
                reason: reason.clone(),
            };
        }
        let need = if slot.seeded {
            slot.effective_lookback(lookback)
        } else {
            lookback
        };
        let have = slot.buffer.len();
        // Once warm, serve as much of the requested lookback as is buffered.
        let take = lookback.min(have);
        match (have >= need).then(|| slot.buffer.window(take)).flatten() {
            Some(window) => SnapshotState::Ready {
                stale: slot
                    .buffer
                    .is_stale(slot.granularity, (self.now)(), STALE_INTERVALS),
                window,
            },
            None => SnapshotState::NotReady { have, need },
        }
    }

    fn handle_ingest(&mut self, key: &BufferKey, bar: Bar) {
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        if let Err(err) = bar.validate() {
            warn!(symbol = %key.symbol, error = %err, "dropping malformed bar");
            return;
        }
        match slot.buffer.push(bar) {
            BarAdmission::Appended | BarAdmission::ReplacedTail => {}
            BarAdmission::DuplicateDropped => {
                debug!(symbol = %key.symbol, "duplicate bar dropped");
            }
            BarAdmission::OutOfOrderRejected => {
                debug!(symbol = %key.symbol, "out-of-order bar rejected");
            }
        }
    }

    fn handle_seeded(&mut self, key: &BufferKey, bars: Vec<Bar>, requested: usize) {
        let adapter = self.providers.get(&key.provider).cloned();
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        let returned = bars.len();
        for bar in bars {
            if bar.validate().is_ok() {
                slot.buffer.push(bar);
            }
        }
        slot.seeded = true;
        slot.seed_task = None;
        if returned < requested {
            slot.provider_limit = Some(returned);
            info!(
                symbol = %key.symbol,
                requested,
                returned,
                "provider returned less history than requested; warmup completes with what is available"
            );
        }
        debug!(symbol = %key.symbol, bars = returned, "buffer seeded from history");
        if slot.feed_task.is_none() {
            if let Some(adapter) = adapter {
                slot.feed_task = Some(spawn_feed_task(
                    adapter,
                    key.clone(),
                    slot.requested_lookback.clone(),
                    self.tx.clone(),
                ));
            }
        }
    }

    fn handle_release(&mut self, key: &BufferKey) {
        let remove = match self.slots.get_mut(key) {
            Some(slot) => {
                slot.refcount = slot.refcount.saturating_sub(1);
                slot.refcount == 0
            }
            None => false,
        };
        if remove {
            if let Some(mut slot) = self.slots.remove(key) {
                info!(symbol = %key.symbol, provider = %key.provider, "last subscriber gone; stopping feed");
                if let Some(task) = slot.feed_task.take() {
                    task.abort();
                }
                if let Some(task) = slot.seed_task.take() {
                    task.abort();
                }
            }
        }
    }
}

fn spawn_seed_task(
    provider: Arc<dyn DataProviderAdapter>,
    key: BufferKey,
    lookback: usize,
    tx: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        for attempt in 1..=SEED_ATTEMPTS {
            match provider
                .fetch_history(&key.symbol, key.granularity, lookback)
                .await
            {
                Ok(bars) => {
                    let _ = tx
                        .send(Command::Seeded {
                            key,
                            bars,
                            requested: lookback,
                        })
                        .await;
                    return;
                }
                Err(err) if err.is_transient() && attempt < SEED_ATTEMPTS => {
                    warn!(symbol = %key.symbol, error = %err, attempt, "history fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                }
                Err(err) => {
                    let _ = tx
                        .send(Command::FeedFailed {
                            key,
                            reason: err.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
    })
}

fn spawn_feed_task(
    provider: Arc<dyn DataProviderAdapter>,
    key: BufferKey,
    requested_lookback: Arc<AtomicUsize>,
    tx: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        let mut reconnecting = false;
        loop {
            match provider.subscribe(&key.symbol, key.granularity).await {
                Ok(mut feed) => {
                    if reconnecting {
                        // Backfill whatever the outage dropped; the buffer
                        // dedups the overlap.
                        let lookback = requested_lookback.load(Ordering::Relaxed);
                        match provider
                            .fetch_history(&key.symbol, key.granularity, lookback)
                            .await
                        {
                            Ok(bars) => {
                                info!(symbol = %key.symbol, bars = bars.len(), "backfilling gap after reconnect");
                                for bar in bars {
                                    if tx
                                        .send(Command::Ingest {
                                            key: key.clone(),
                                            bar,
                                        })
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(symbol = %key.symbol, error = %err, "gap backfill failed");
                            }
                        }
                    }
                    backoff = RECONNECT_BACKOFF_INITIAL;
                    loop {
                        match feed.next_bar().await {
                            Ok(Some(bar)) => {
                                if tx
                                    .send(Command::Ingest {
                                        key: key.clone(),
                                        bar,
                                    })
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Ok(None) => {
                                debug!(symbol = %key.symbol, "feed ended; reconnecting");
                                break;
                            }
                            Err(err) if err.is_transient() => {
                                warn!(symbol = %key.symbol, error = %err, "feed error; reconnecting");
                                break;
                            }
                            Err(err) => {
                                let _ = tx
                                    .send(Command::FeedFailed {
                                        key,
                                        reason: err.to_string(),
                                    })
                                    .await;
                                return;
                            }
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!(symbol = %key.symbol, error = %err, "subscribe failed; retrying");
                }
                Err(err) => {
                    let _ = tx
                        .send(Command::FeedFailed {
                            key,
                            reason: err.to_string(),
                        })
                        .await;
                    return;
                }
            }
            reconnecting = true;
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
        }
    })
}
