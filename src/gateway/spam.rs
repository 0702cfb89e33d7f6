use std::collections::VecDeque;

/// Fingerprints are compared after lowercasing, trimming and truncation.
pub const FINGERPRINT_MAX_CHARS: usize = 100;

pub const DEFAULT_SPAM_THRESHOLD: usize = 5;

pub fn fingerprint(text: &str) -> String {
    text.to_lowercase()
        .trim()
        .chars()
        .take(FINGERPRINT_MAX_CHARS)
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpamVerdict {
    pub fingerprint: String,
    pub flagged: bool,
    /// Oldest fingerprint pushed out of the ring by this message, if any.
    pub evicted: Option<String>,
}

/// Ring of the last `threshold` message fingerprints for one subject.
///
/// Eviction is FIFO only; there is no time decay, so identical messages sent
/// far apart still fill the ring.
#[derive(Clone, Debug)]
pub struct SpamDetector {
    threshold: usize,
    recent: VecDeque<String>,
}

impl SpamDetector {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            recent: VecDeque::with_capacity(threshold),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn push(&mut self, text: &str) -> SpamVerdict {
        let fingerprint = fingerprint(text);
        let evicted = self.push_fingerprint(fingerprint.clone());
        SpamVerdict {
            fingerprint,
            flagged: self.is_flagged(),
            evicted,
        }
    }

    /// Undo the most recent `push`, restoring the entry it evicted.
    pub fn unpush(&mut self, fingerprint: &str, evicted: Option<String>) {
        if self.recent.back().map(String::as_str) != Some(fingerprint) {
            return;
        }
        self.recent.pop_back();
        if let Some(evicted) = evicted {
            self.recent.push_front(evicted);
        }
    }

    pub fn is_flagged(&self) -> bool {
        if self.recent.len() < self.threshold {
            return false;
        }
        let mut iter = self.recent.iter();
        let Some(first) = iter.next() else {
            return false;
        };
        iter.all(|entry| entry == first)
    }

    /// Seed an empty ring from persisted fingerprints (oldest first).
    pub fn seed(&mut self, fingerprints: &[String]) {
        if !self.recent.is_empty() {
            return;
        }
        for entry in fingerprints {
            self.push_fingerprint(entry.clone());
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }

    fn push_fingerprint(&mut self, fingerprint: String) -> Option<String> {
        self.recent.push_back(fingerprint);
        let mut evicted = None;
        while self.recent.len() > self.threshold {
            evicted = self.recent.pop_front();
        }
        evicted
    }
}

impl Default for SpamDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SPAM_THRESHOLD)
    }
}
