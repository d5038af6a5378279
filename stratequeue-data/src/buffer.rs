//! Bounded, strictly ordered bar storage with copy-on-write snapshots.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use stratequeue_core::{Bar, Granularity};

/// Outcome of offering a bar to the buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BarAdmission {
    /// Appended at the tail.
    Appended,
    /// Replaced the tail bar with the canonical close of the same period.
    ReplacedTail,
    /// Same timestamp as the tail but not a canonical close; dropped.
    DuplicateDropped,
    /// Older than the tail; rejected.
    OutOfOrderRejected,
}

/// Ordered sequence of bars bounded by a capacity. Single writer; readers
/// receive stable `Arc` snapshots, so the writer clones the backing vector
/// only while a snapshot is outstanding.
#[derive(Debug)]
pub struct BarBuffer {
    bars: Arc<Vec<Bar>>,
    capacity: usize,
}

impl BarBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            bars: Arc::new(Vec::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Grow capacity to cover a larger subscriber lookback. Never shrinks.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.capacity {
            self.capacity = capacity;
        }
    }

    /// Timestamp of the newest admitted bar.
    #[must_use]
    pub fn last_ts(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|bar| bar.ts)
    }

    /// Offer a bar. Timestamps must be strictly increasing; a bar carrying
    /// the tail's timestamp replaces the tail only when it is the canonical
    /// close of that period.
    pub fn push(&mut self, bar: Bar) -> BarAdmission {
        match self.bars.last().map(|tail| tail.ts) {
            Some(tail_ts) if bar.ts < tail_ts => BarAdmission::OutOfOrderRejected,
            Some(tail_ts) if bar.ts == tail_ts => {
                if bar.final_of_period {
                    let bars = Arc::make_mut(&mut self.bars);
                    *bars.last_mut().expect("tail exists") = bar;
                    BarAdmission::ReplacedTail
                } else {
                    BarAdmission::DuplicateDropped
                }
            }
            _ => {
                let capacity = self.capacity;
                let bars = Arc::make_mut(&mut self.bars);
                bars.push(bar);
                if bars.len() > capacity {
                    let excess = bars.len() - capacity;
                    bars.drain(..excess);
                }
                BarAdmission::Appended
            }
        }
    }

    /// Stable snapshot of the newest `lookback` bars, or `None` while fewer
    /// are buffered. The returned window shares storage with the buffer
    /// until the next write.
    #[must_use]
    pub fn window(&self, lookback: usize) -> Option<BarWindow> {
        if self.bars.len() < lookback || lookback == 0 {
            return None;
        }
        let start = self.bars.len() - lookback;
        Some(BarWindow {
            bars: self.bars.clone(),
            start,
        })
    }

    /// Whether no bar arrived within `intervals` expected bar periods.
    #[must_use]
    pub fn is_stale(&self, granularity: Granularity, now: DateTime<Utc>, intervals: i64) -> bool {
        match self.last_ts() {
            Some(last) => now - last > granularity.as_duration() * intervals as i32,
            None => false,
        }
    }
}

/// Read-only view over the tail of a buffer.
#[derive(Clone, Debug)]
pub struct BarWindow {
    bars: Arc<Vec<Bar>>,
    start: usize,
}

impl BarWindow {
    #[must_use]
    pub fn bars(&self) -> &[Bar] {
        &self.bars[self.start..]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len() - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn last(&self) -> Option<&Bar> {
        self.bars().last()
    }
}
