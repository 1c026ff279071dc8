//! The epoch clock.
//!
//! Epochs partition wall-clock time:
//! `epoch(t) = floor((t - genesis - adjustment) / epoch_ms)`. The
//! adjustment is a bounded correction refreshed every `probe_interval`
//! epochs from a [`TimeSource`] offset probe. Both each probe's delta and
//! the accumulated total are clamped to `max_adjustment_ms`, so a
//! misbehaving probe cannot walk the clock off no matter how long it keeps
//! reporting an offset.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Clock seam: wall time plus an optional offset probe (NTP-style).
pub trait TimeSource: Send + Sync {
    /// Current unix time in milliseconds.
    fn now_ms(&self) -> u64;

    /// Measured clock offset in milliseconds, if a probe is available.
    fn offset_ms(&self) -> Option<i64> {
        None
    }
}

/// The system clock without an offset probe.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A hand-driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
    offset: Mutex<Option<i64>>,
}

impl ManualTimeSource {
    /// Creates a clock frozen at `now`.
    pub fn starting_at(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
            offset: Mutex::new(None),
        }
    }

    /// Moves the clock to an absolute time.
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Advances the clock.
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Sets the offset the next probe reports.
    pub fn set_offset(&self, offset: Option<i64>) {
        *self.offset.lock() = offset;
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn offset_ms(&self) -> Option<i64> {
        *self.offset.lock()
    }
}

/// Deterministic wall-clock partition into epochs.
pub struct EpochClock {
    genesis_timestamp: u64,
    epoch_ms: u64,
    probe_interval: u64,
    max_adjustment_ms: i64,
    adjustment_ms: Mutex<i64>,
    last_probe_epoch: AtomicU64,
    source: Arc<dyn TimeSource>,
}

impl EpochClock {
    /// Creates a clock anchored at the genesis timestamp.
    pub fn new(
        genesis_timestamp: u64,
        epoch_ms: u64,
        probe_interval: u64,
        max_adjustment_ms: u64,
        source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            genesis_timestamp,
            epoch_ms,
            probe_interval: probe_interval.max(1),
            max_adjustment_ms: max_adjustment_ms as i64,
            adjustment_ms: Mutex::new(0),
            last_probe_epoch: AtomicU64::new(0),
            source,
        }
    }

    /// Current wall time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.source.now_ms()
    }

    /// The epoch the clock is in right now. A late tick merges: the epoch
    /// snaps to the floor division, it never increments one-by-one.
    pub fn current_epoch(&self) -> u64 {
        self.epoch_at(self.source.now_ms())
    }

    /// The epoch at an arbitrary timestamp.
    pub fn epoch_at(&self, now_ms: u64) -> u64 {
        let adjustment = *self.adjustment_ms.lock();
        let shifted = (now_ms as i128) - (self.genesis_timestamp as i128) - (adjustment as i128);
        if shifted < 0 {
            return 0;
        }
        (shifted as u64) / self.epoch_ms
    }

    /// Epoch length in milliseconds.
    pub fn epoch_ms(&self) -> u64 {
        self.epoch_ms
    }

    /// Every `probe_interval` epochs, folds the time source's measured
    /// offset into the adjustment. Each probe's delta is clamped, and so is
    /// the accumulated total, keeping the correction inside
    /// `[-max_adjustment_ms, max_adjustment_ms]` over any probe history.
    pub fn maybe_probe(&self, epoch: u64) {
        let last = self.last_probe_epoch.load(Ordering::SeqCst);
        if epoch < last + self.probe_interval {
            return;
        }
        self.last_probe_epoch.store(epoch, Ordering::SeqCst);
        match self.source.offset_ms() {
            Some(offset) => {
                let clamped = offset.clamp(-self.max_adjustment_ms, self.max_adjustment_ms);
                if clamped != offset {
                    warn!(offset, clamped, "clock offset probe exceeded clamp");
                }
                let mut adjustment = self.adjustment_ms.lock();
                *adjustment = (*adjustment + clamped)
                    .clamp(-self.max_adjustment_ms, self.max_adjustment_ms);
                debug!(epoch, adjustment = *adjustment, "applied clock adjustment");
            }
            None => debug!(epoch, "clock offset probe unavailable"),
        }
    }

    /// The current adjustment, for inspection.
    pub fn adjustment_ms(&self) -> i64 {
        *self.adjustment_ms.lock()
    }
}
