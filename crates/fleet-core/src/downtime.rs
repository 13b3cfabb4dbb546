//! Scheduled downtime windows.
//!
//! While a window is active the autoscaler does not scale pools out, and
//! queue-driven strategies treat the queue as empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single `[start, finish)` downtime window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DowntimeWindow {
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl DowntimeWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.finish
    }
}

/// Source of truth for whether downtime is currently in effect.
pub trait DowntimeSource: Send + Sync {
    fn is_active(&self, now: DateTime<Utc>) -> bool;
}

/// A fixed list of downtime windows, typically loaded from `fleet.toml`.
#[derive(Debug, Clone, Default)]
pub struct DowntimeSchedule {
    windows: Vec<DowntimeWindow>,
}

impl DowntimeSchedule {
    pub fn new(windows: Vec<DowntimeWindow>) -> Self {
        Self { windows }
    }

    /// The window covering `now`, if any.
    pub fn active_window(&self, now: DateTime<Utc>) -> Option<&DowntimeWindow> {
        self.windows.iter().find(|w| w.contains(now))
    }
}

impl DowntimeSource for DowntimeSchedule {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.active_window(now).is_some()
    }
}
