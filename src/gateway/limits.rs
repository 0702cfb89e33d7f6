//! Fixed rate windows and the per-subject cooldown mark.
//!
//! Windows are aligned to wall-clock buckets (`epoch_seconds / 60` for the
//! minute window, `epoch_seconds / 3600` for the hour window). The same bucket
//! numbers are used by the counter store keys, so a window observed from the
//! store can be merged into the local one by comparing buckets.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Minute,
    Hour,
}

impl WindowKind {
    pub fn seconds(self) -> u64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 60 * 60,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
        }
    }

    pub fn bucket(self, now_ms: u64) -> u64 {
        now_ms / 1000 / self.seconds()
    }
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request counter for one subject over one fixed window.
///
/// The reset at the window boundary is lazy: every read first rolls the
/// window forward to the bucket containing `now`. Rolling twice for the same
/// `now` is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateWindow {
    kind: WindowKind,
    window_start_ms: u64,
    expires_at_ms: u64,
    count: u64,
}

impl RateWindow {
    pub fn new(kind: WindowKind, now_ms: u64) -> Self {
        let span_ms = kind.seconds() * 1000;
        let window_start_ms = kind.bucket(now_ms) * span_ms;
        Self {
            kind,
            window_start_ms,
            expires_at_ms: window_start_ms.saturating_add(span_ms),
            count: 0,
        }
    }

    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    pub fn window_start_ms(&self) -> u64 {
        self.window_start_ms
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    pub fn bucket(&self) -> u64 {
        self.kind.bucket(self.window_start_ms)
    }

    /// Count as seen at `now_ms`, without mutating the window.
    pub fn peek(&self, now_ms: u64) -> u64 {
        if now_ms >= self.expires_at_ms {
            0
        } else {
            self.count
        }
    }

    pub fn count(&mut self, now_ms: u64) -> u64 {
        self.roll(now_ms);
        self.count
    }

    pub fn increment(&mut self, now_ms: u64) -> u64 {
        self.roll(now_ms);
        self.count = self.count.saturating_add(1);
        self.count
    }

    /// Undo one increment made in the bucket that contains `at_ms`.
    pub fn decrement(&mut self, at_ms: u64) {
        if self.kind.bucket(at_ms) == self.bucket() {
            self.count = self.count.saturating_sub(1);
        }
    }

    /// Merge a count read from the counter store. Counts for other buckets
    /// are stale and ignored; within the current bucket the larger count wins,
    /// so the local count never goes backwards.
    pub fn observe(&mut self, now_ms: u64, bucket: u64, count: u64) {
        self.roll(now_ms);
        if bucket == self.bucket() {
            self.count = self.count.max(count);
        }
    }

    /// Time until the window resets.
    pub fn retry_after(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms))
    }

    fn roll(&mut self, now_ms: u64) {
        if now_ms >= self.expires_at_ms {
            *self = Self::new(self.kind, now_ms);
        }
    }
}

/// Time of the last accepted request for a subject.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CooldownMark {
    last_request_at_ms: Option<u64>,
}

impl CooldownMark {
    pub fn last_request_at_ms(&self) -> Option<u64> {
        self.last_request_at_ms
    }

    /// Remaining cooldown, or `None` once the subject may send again.
    pub fn remaining(&self, now_ms: u64, cooldown: Duration) -> Option<Duration> {
        let last = self.last_request_at_ms?;
        let elapsed = Duration::from_millis(now_ms.saturating_sub(last));
        if elapsed < cooldown {
            Some(cooldown - elapsed)
        } else {
            None
        }
    }

    pub fn mark(&mut self, now_ms: u64) {
        self.last_request_at_ms = Some(now_ms);
    }

    pub fn observe(&mut self, at_ms: u64) {
        self.last_request_at_ms = Some(self.last_request_at_ms.map_or(at_ms, |ts| ts.max(at_ms)));
    }

    /// Put back the previous mark if `marked_at_ms` is still the latest one.
    pub fn restore(&mut self, marked_at_ms: u64, previous: Option<u64>) {
        if self.last_request_at_ms == Some(marked_at_ms) {
            self.last_request_at_ms = previous;
        }
    }
}
