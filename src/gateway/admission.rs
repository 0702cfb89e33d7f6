//! Per-subject admission: cooldown, hour and minute windows, repeated-message
//! detection.
//!
//! The decision for one subject runs under that subject's mutex. Counter
//! store reads happen before the lock is taken and write-through happens
//! after it is released, so no lock is held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::Plan;
use super::counter_store::{CounterStoreError, DualBackendCounterStore, SubjectSnapshot};
use super::limits::{CooldownMark, RateWindow, WindowKind};
use super::spam::{DEFAULT_SPAM_THRESHOLD, SpamDetector};
use super::{Clock, ModerationSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Cooldown,
    HourlyLimit,
    MinuteLimit,
    Spam,
    StoreUnavailable,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cooldown => "COOLDOWN",
            Self::HourlyLimit => "HOURLY_LIMIT",
            Self::MinuteLimit => "MINUTE_LIMIT",
            Self::Spam => "SPAM",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Decide from local state and log the outage.
    #[default]
    FailOpen,
    /// Reject with `STORE_UNAVAILABLE` while the store cannot be reached.
    FailClosed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_spam_threshold")]
    pub spam_threshold: usize,
    #[serde(default = "default_local_cache_ttl_ms")]
    pub local_cache_ttl_ms: u64,
    #[serde(default)]
    pub store_failure_policy: StoreFailurePolicy,
}

fn default_spam_threshold() -> usize {
    DEFAULT_SPAM_THRESHOLD
}

fn default_local_cache_ttl_ms() -> u64 {
    5_000
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            spam_threshold: default_spam_threshold(),
            local_cache_ttl_ms: default_local_cache_ttl_ms(),
            store_failure_policy: StoreFailurePolicy::default(),
        }
    }
}

impl AdmissionConfig {
    pub fn local_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.local_cache_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.spam_threshold == 0 {
            return Err("admission.spam_threshold must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allow: bool,
    pub reason: Option<ReasonCode>,
    pub retry_after: Option<Duration>,
    pub remaining_minute: u32,
    pub remaining_hour: u32,
}

impl AdmissionDecision {
    fn allowed(remaining_minute: u32, remaining_hour: u32) -> Self {
        Self {
            allow: true,
            reason: None,
            retry_after: None,
            remaining_minute,
            remaining_hour,
        }
    }

    fn rejected(
        reason: ReasonCode,
        retry_after: Option<Duration>,
        remaining_minute: u32,
        remaining_hour: u32,
    ) -> Self {
        Self {
            allow: false,
            reason: Some(reason),
            retry_after,
            remaining_minute,
            remaining_hour,
        }
    }
}

fn remaining(limit: u32, used: u64) -> u32 {
    u32::try_from(u64::from(limit).saturating_sub(used)).unwrap_or(u32::MAX)
}

#[derive(Debug)]
struct SubjectState {
    minute: RateWindow,
    hour: RateWindow,
    cooldown: CooldownMark,
    spam: SpamDetector,
}

enum Verdict {
    Accepted {
        decision: AdmissionDecision,
        fingerprint: String,
        evicted: Option<String>,
        previous_mark: Option<u64>,
    },
    Rejected {
        decision: AdmissionDecision,
        fingerprint: Option<String>,
        strike: bool,
    },
}

impl SubjectState {
    fn new(now_ms: u64, spam_threshold: usize) -> Self {
        Self {
            minute: RateWindow::new(WindowKind::Minute, now_ms),
            hour: RateWindow::new(WindowKind::Hour, now_ms),
            cooldown: CooldownMark::default(),
            spam: SpamDetector::new(spam_threshold),
        }
    }

    fn absorb(&mut self, snapshot: &SubjectSnapshot, now_ms: u64) {
        self.minute
            .observe(now_ms, snapshot.minute_bucket, snapshot.minute_count);
        self.hour
            .observe(now_ms, snapshot.hour_bucket, snapshot.hour_count);
        if let Some(at_ms) = snapshot.last_request_at_ms {
            self.cooldown.observe(at_ms);
        }
        self.spam.seed(&snapshot.recent_fingerprints);
    }

    fn decide(&mut self, now_ms: u64, text: &str, plan: &Plan) -> Verdict {
        let minute_used = self.minute.count(now_ms);
        let hour_used = self.hour.count(now_ms);
        let remaining_minute = remaining(plan.max_per_minute, minute_used);
        let remaining_hour = remaining(plan.max_per_hour, hour_used);
        let reject = |reason, retry_after| Verdict::Rejected {
            decision: AdmissionDecision::rejected(
                reason,
                retry_after,
                remaining_minute,
                remaining_hour,
            ),
            fingerprint: None,
            strike: false,
        };

        if let Some(wait) = self.cooldown.remaining(now_ms, plan.cooldown()) {
            return reject(ReasonCode::Cooldown, Some(wait));
        }
        if hour_used >= u64::from(plan.max_per_hour) {
            return reject(ReasonCode::HourlyLimit, Some(self.hour.retry_after(now_ms)));
        }
        if minute_used >= u64::from(plan.max_per_minute) {
            return reject(ReasonCode::MinuteLimit, Some(self.minute.retry_after(now_ms)));
        }

        let spam = self.spam.push(text);
        if spam.flagged {
            return Verdict::Rejected {
                decision: AdmissionDecision::rejected(
                    ReasonCode::Spam,
                    None,
                    remaining_minute,
                    remaining_hour,
                ),
                fingerprint: Some(spam.fingerprint),
                strike: true,
            };
        }

        let previous_mark = self.cooldown.last_request_at_ms();
        let minute_used = self.minute.increment(now_ms);
        let hour_used = self.hour.increment(now_ms);
        self.cooldown.mark(now_ms);
        Verdict::Accepted {
            decision: AdmissionDecision::allowed(
                remaining(plan.max_per_minute, minute_used),
                remaining(plan.max_per_hour, hour_used),
            ),
            fingerprint: spam.fingerprint,
            evicted: spam.evicted,
            previous_mark,
        }
    }

    /// Undo an accept that could not be written through.
    fn roll_back(
        &mut self,
        at_ms: u64,
        previous_mark: Option<u64>,
        fingerprint: &str,
        evicted: Option<String>,
    ) {
        self.minute.decrement(at_ms);
        self.hour.decrement(at_ms);
        self.cooldown.restore(at_ms, previous_mark);
        self.spam.unpush(fingerprint, evicted);
    }
}

pub struct AdmissionControl {
    config: AdmissionConfig,
    counters: Arc<DualBackendCounterStore>,
    moderation: Arc<dyn ModerationSink>,
    clock: Arc<dyn Clock>,
    subjects: RwLock<HashMap<String, Arc<Mutex<SubjectState>>>>,
}

impl std::fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("config", &self.config)
            .field("counters", &self.counters)
            .field("subjects", &self.tracked_subjects())
            .finish()
    }
}

impl AdmissionControl {
    pub fn new(
        config: AdmissionConfig,
        counters: Arc<DualBackendCounterStore>,
        moderation: Arc<dyn ModerationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            counters,
            moderation,
            clock,
            subjects: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn counters(&self) -> &Arc<DualBackendCounterStore> {
        &self.counters
    }

    pub fn tracked_subjects(&self) -> usize {
        self.subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn check(&self, subject: &str, text: &str, plan: &Plan) -> AdmissionDecision {
        if plan.is_privileged {
            return AdmissionDecision::allowed(plan.max_per_minute, plan.max_per_hour);
        }

        let fail_closed = self.config.store_failure_policy == StoreFailurePolicy::FailClosed;
        let snapshot = match self.counters.snapshot(subject).await {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!(
                    subject,
                    backend = self.counters.backend_name(),
                    error = %err,
                    fail_closed,
                    "counter store read failed"
                );
                if fail_closed {
                    return AdmissionDecision::rejected(
                        ReasonCode::StoreUnavailable,
                        None,
                        0,
                        0,
                    );
                }
                None
            }
        };

        let now_ms = self.clock.now_epoch_millis();
        let state = self.subject_state(subject, now_ms);
        let verdict = {
            let mut state = lock(&state);
            if let Some(snapshot) = snapshot.as_ref() {
                state.absorb(snapshot, now_ms);
            }
            state.decide(now_ms, text, plan)
        };

        match verdict {
            Verdict::Rejected {
                decision,
                fingerprint,
                strike,
            } => {
                if let Some(fingerprint) = fingerprint {
                    self.persist_fingerprint(subject, &fingerprint).await;
                }
                if strike {
                    self.moderation.report_strike(subject, ReasonCode::Spam);
                }
                tracing::info!(
                    subject,
                    reason = ?decision.reason,
                    retry_after_ms = decision.retry_after.map(|d| d.as_millis() as u64),
                    "admission rejected"
                );
                decision
            }
            Verdict::Accepted {
                decision,
                fingerprint,
                evicted,
                previous_mark,
            } => {
                match self.counters.record_accept(subject, now_ms).await {
                    Ok(_) => {
                        self.persist_fingerprint(subject, &fingerprint).await;
                        decision
                    }
                    Err(err) => {
                        tracing::warn!(
                            subject,
                            backend = self.counters.backend_name(),
                            error = %err,
                            fail_closed,
                            "counter store write failed"
                        );
                        if !fail_closed {
                            self.persist_fingerprint(subject, &fingerprint).await;
                            return decision;
                        }
                        lock(&state).roll_back(now_ms, previous_mark, &fingerprint, evicted);
                        AdmissionDecision::rejected(
                            ReasonCode::StoreUnavailable,
                            None,
                            decision.remaining_minute.saturating_add(1),
                            decision.remaining_hour.saturating_add(1),
                        )
                    }
                }
            }
        }
    }

    /// Forget everything known about `subject`, locally and in the store.
    pub async fn reset_subject(&self, subject: &str) -> Result<(), CounterStoreError> {
        self.subjects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject);
        self.counters.clear_subject(subject).await?;
        tracing::info!(subject, "admission state reset");
        Ok(())
    }

    async fn persist_fingerprint(&self, subject: &str, fingerprint: &str) {
        if let Err(err) = self
            .counters
            .record_fingerprint(subject, fingerprint, self.config.spam_threshold)
            .await
        {
            tracing::debug!(subject, error = %err, "failed to persist message fingerprint");
        }
    }

    fn subject_state(&self, subject: &str, now_ms: u64) -> Arc<Mutex<SubjectState>> {
        if let Some(state) = self
            .subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
        {
            return state.clone();
        }
        self.subjects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(subject.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SubjectState::new(
                    now_ms,
                    self.config.spam_threshold,
                )))
            })
            .clone()
    }
}

fn lock(state: &Mutex<SubjectState>) -> MutexGuard<'_, SubjectState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
