//! Injected time source and the per-strategy tick scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use stratequeue_core::Granularity;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::shutdown::ShutdownSignal;

/// Single source of truth for "now". Tests substitute [`ManualClock`] to
/// make the runtime deterministic.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Sleep until the clock reads `deadline` or later.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// Wall-clock implementation.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let now = Utc::now();
        if let Ok(delta) = (deadline - now).to_std() {
            tokio::time::sleep(delta).await;
        }
    }
}

/// Manually advanced clock for deterministic tests. Backed by a watch
/// channel so sleepers never miss an advance.
pub struct ManualClock {
    tx: watch::Sender<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        let (tx, _) = watch::channel(start);
        Self { tx }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        self.tx.send_modify(|now| *now += delta);
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        self.tx.send_modify(|now| *now = instant);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.tx.borrow()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One scheduler tick. `scheduled_for` is the bar boundary the tick follows.
#[derive(Clone, Copy, Debug)]
pub struct Tick {
    pub scheduled_for: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

/// Periodic tick emitter for one strategy: fires once per bar boundary plus
/// a settle delay that gives the provider time to deliver the closing bar.
///
/// The channel has capacity one; a tick arriving while the runner is still
/// busy with the previous one is dropped and counted. Cancelling is the
/// caller's shutdown signal.
pub fn spawn_tick_stream(
    clock: Arc<dyn Clock>,
    granularity: Granularity,
    settle_delay: Duration,
    shutdown: ShutdownSignal,
) -> (mpsc::Receiver<Tick>, Arc<AtomicU64>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1);
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_out = dropped.clone();
    let task = tokio::spawn(async move {
        let period = granularity.as_duration();
        let settle = chrono::Duration::from_std(settle_delay).unwrap_or_else(|_| {
            chrono::Duration::seconds(2)
        });
        loop {
            let now = clock.now();
            let boundary = match now.duration_trunc(period) {
                Ok(aligned) => aligned + period,
                Err(_) => now + period,
            };
            let target = boundary + settle;
            tokio::select! {
                _ = clock.sleep_until(target) => {}
                _ = shutdown.wait() => break,
            }
            if shutdown.triggered() {
                break;
            }
            let tick = Tick {
                scheduled_for: boundary,
                fired_at: clock.now(),
            };
            match tx.try_send(tick) {
                Ok(()) => trace!(boundary = %boundary, "tick emitted"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(boundary = %boundary, "tick dropped; runner busy");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    });
    (rx, dropped_out, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn manual_clock_wakes_sleepers_on_advance() {
        let clock = Arc::new(ManualClock::new(start()));
        let deadline = start() + chrono::Duration::minutes(1);
        let sleeper = clock.clone();
        let task = tokio::spawn(async move { sleeper.sleep_until(deadline).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());
        clock.advance(chrono::Duration::minutes(2));
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn ticks_fire_after_boundary_plus_settle() {
        let clock = Arc::new(ManualClock::new(start() + chrono::Duration::seconds(30)));
        let shutdown = ShutdownSignal::new();
        let (mut rx, _dropped, task) = spawn_tick_stream(
            clock.clone(),
            Granularity::OneMinute,
            Duration::from_secs(2),
            shutdown.clone(),
        );
        // Not yet: boundary 13:01 + 2s settle.
        clock.advance(chrono::Duration::seconds(31));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
        clock.advance(chrono::Duration::seconds(2));
        let tick = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick.scheduled_for, start() + chrono::Duration::minutes(1));
        shutdown.trigger();
        let _ = task.await;
    }

    #[tokio::test]
    async fn busy_runner_drops_ticks_with_count() {
        let clock = Arc::new(ManualClock::new(start()));
        let shutdown = ShutdownSignal::new();
        let (mut rx, dropped, task) = spawn_tick_stream(
            clock.clone(),
            Granularity::OneMinute,
            Duration::from_secs(0),
            shutdown.clone(),
        );
        // Never consume; fire several boundaries.
        for _ in 0..3 {
            clock.advance(chrono::Duration::minutes(1));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(dropped.load(Ordering::Relaxed) >= 1);
        // The single buffered tick is still there.
        assert!(rx.try_recv().is_ok());
        shutdown.trigger();
        let _ = task.await;
    }
}
