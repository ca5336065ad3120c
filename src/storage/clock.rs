//! Time source for expiry decisions.
//!
//! Expiry deadlines are absolute unix timestamps in milliseconds. Shards read the
//! clock once per scheduling iteration and hand the sampled value to every hop in that
//! iteration, so a single command never observes time moving under it.
//!
//! Tests use a virtual clock that only moves when told to:
//!
//! ```
//! use shardkv::storage::Clock;
//!
//! let clock = Clock::manual(1_000);
//! assert_eq!(clock.now_ms(), 1_000);
//! clock.set_virtual_now(5_000);
//! assert_eq!(clock.now_ms(), 5_000);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// A cloneable handle to either wall-clock time or a shared virtual time.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    virtual_now: Option<Arc<AtomicU64>>,
}

impl Clock {
    /// Wall-clock time.
    pub fn system() -> Self {
        Self { virtual_now: None }
    }

    /// A virtual clock frozen at `now_ms` until [`set_virtual_now`](Self::set_virtual_now)
    /// or [`advance`](Self::advance) moves it.
    pub fn manual(now_ms: u64) -> Self {
        Self {
            virtual_now: Some(Arc::new(AtomicU64::new(now_ms))),
        }
    }

    /// Returns true if this is a virtual clock.
    pub fn is_virtual(&self) -> bool {
        self.virtual_now.is_some()
    }

    /// Current time in unix milliseconds.
    pub fn now_ms(&self) -> u64 {
        match &self.virtual_now {
            Some(now) => now.load(Ordering::Acquire),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64,
        }
    }

    /// Moves a virtual clock to `now_ms`. Ignored (with a warning) on the system clock.
    pub fn set_virtual_now(&self, now_ms: u64) {
        match &self.virtual_now {
            Some(now) => now.store(now_ms, Ordering::Release),
            None => warn!(now_ms, "set_virtual_now called on the system clock, ignoring"),
        }
    }

    /// Advances a virtual clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        if let Some(now) = &self.virtual_now {
            now.fetch_add(delta.as_millis() as u64, Ordering::AcqRel);
        }
    }
}
