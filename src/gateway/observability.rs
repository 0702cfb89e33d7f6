use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub throttled: u64,
    pub content_rejected: u64,
    pub circuit_open: u64,
    pub upstream_calls: u64,
    pub upstream_failures: u64,
    pub timeouts: u64,
    pub completed: u64,
}

/// Process-wide gateway counters. Shared by `&self` across request tasks.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    throttled: AtomicU64,
    content_rejected: AtomicU64,
    circuit_open: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_failures: AtomicU64,
    timeouts: AtomicU64,
    completed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn bump_by(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_throttled(&self) {
        bump(&self.throttled);
    }

    pub fn record_content_rejected(&self) {
        bump(&self.content_rejected);
    }

    pub fn record_circuit_open(&self) {
        bump(&self.circuit_open);
    }

    pub fn record_upstream_calls(&self, attempts: u32) {
        bump_by(&self.upstream_calls, u64::from(attempts));
    }

    pub fn record_upstream_failure(&self) {
        bump(&self.upstream_failures);
    }

    pub fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    pub fn record_completed(&self) {
        bump(&self.completed);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            content_rejected: self.content_rejected.load(Ordering::Relaxed),
            circuit_open: self.circuit_open.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}
