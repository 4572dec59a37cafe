//! Call duration bookkeeping and presentation state.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Wall-clock duration of a call.
///
/// Starts on the first `Connected` and keeps running through transient
/// `Disconnected` phases; it only freezes when the session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallClock {
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl CallClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `Connected` report. Only the first one starts the clock.
    pub fn mark_connected(&mut self, now: Instant) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Freeze the clock. No-op if it never started or is already stopped.
    pub fn stop(&mut self, now: Instant) {
        if self.started_at.is_some() && self.stopped_at.is_none() {
            self.stopped_at = Some(now);
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.stopped_at.is_none()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        match self.started_at {
            None => Duration::ZERO,
            Some(start) => self.stopped_at.unwrap_or(now).saturating_duration_since(start),
        }
    }
}

/// `m:ss`, minutes unbounded.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// How the call surface is shown. Independent of negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum Presentation {
    #[default]
    Expanded,
    Minimized,
}

impl Presentation {
    pub fn toggled(self) -> Self {
        match self {
            Self::Expanded => Self::Minimized,
            Self::Minimized => Self::Expanded,
        }
    }

    pub fn is_minimized(&self) -> bool {
        matches!(self, Self::Minimized)
    }
}
