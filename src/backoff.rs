//! Escalating panic sleep.
//!
//! A battery device that keeps failing (server down, bad credentials,
//! brownouts) must not hot-loop.  The policy persists a signed duration:
//!
//! ```text
//!   < 0   Normal      ── on_failure ──▶ Panicking(initial)
//!   >= 0  Panicking(d) ── on_failure ──▶ Panicking(min(d * factor, max))
//!   any               ── on_success ──▶ Normal (-1)
//! ```
//!
//! Every failure is followed by a panic-flagged deep sleep for the
//! returned duration; the first clean cycle resets the episode.

use core::time::Duration;

use log::{info, warn};

use crate::app::ports::StorageError;
use crate::persistent::{PersistentCell, Storage};

/// Persisted marker for "no active panic episode".
pub const NORMAL: i32 = -1;

/// Escalation parameters, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    pub initial_s: i32,
    pub factor: i32,
    pub max_s: i32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_s: 60,
            factor: 2,
            max_s: 24 * 60 * 60,
        }
    }
}

impl BackoffSettings {
    /// Clamp remotely supplied values into a usable range:
    /// `initial >= 0`, `factor >= 1`, `max >= initial`.
    pub fn sanitized(self) -> Self {
        let initial_s = self.initial_s.max(0);
        Self {
            initial_s,
            factor: self.factor.max(1),
            max_s: self.max_s.max(initial_s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffState {
    Normal,
    Panicking(Duration),
}

/// Next persisted duration after a failure.
pub fn next_duration(current: i32, settings: &BackoffSettings) -> i32 {
    let s = settings.sanitized();
    if current < 0 {
        s.initial_s
    } else {
        current.saturating_mul(s.factor).min(s.max_s)
    }
}

pub struct EscalatingBackoffPolicy {
    cell: PersistentCell<i32>,
}

impl EscalatingBackoffPolicy {
    /// Backed by a fast-memory cell at `(namespace, key)`.
    pub fn new(namespace: &'static str, key: &'static str) -> Self {
        Self {
            cell: PersistentCell::fast_memory(namespace, key, NORMAL),
        }
    }

    pub fn init(&mut self, storage: &Storage) {
        self.cell.init(storage);
    }

    /// Raw persisted duration in seconds (`-1` when normal).
    pub fn raw(&self) -> i32 {
        self.cell.get()
    }

    pub fn state(&self) -> BackoffState {
        match self.cell.get() {
            d if d < 0 => BackoffState::Normal,
            d => BackoffState::Panicking(Duration::from_secs(d as u64)),
        }
    }

    pub fn is_panicking(&self) -> bool {
        matches!(self.state(), BackoffState::Panicking(_))
    }

    pub fn on_success(&mut self, storage: &mut Storage) -> Result<(), StorageError> {
        if self.cell.set(storage, NORMAL)? {
            info!("Backoff: panic episode cleared");
        }
        Ok(())
    }

    /// Escalate and return the sleep duration for this failure.
    ///
    /// A persistence error is logged; the computed duration is still
    /// returned so the device sleeps instead of looping.
    pub fn on_failure(&mut self, storage: &mut Storage, settings: &BackoffSettings) -> Duration {
        let next = next_duration(self.cell.get(), settings);
        if let Err(e) = self.cell.set(storage, next) {
            warn!("Backoff: failed to persist panic duration {} s: {}", next, e);
        }
        info!("Backoff: panic sleep {} s", next);
        Duration::from_secs(next as u64)
    }
}
