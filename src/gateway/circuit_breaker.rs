//! Per-dependency circuit breaker with a bounded half-open probe budget.
//!
//! State lives behind one `std::sync::Mutex` per breaker. The lock is only
//! held for bookkeeping; upstream calls, backoff sleeps and transition
//! listeners all run outside of it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::retry::RetryPolicy;
use super::{Clock, RandomSource};

pub const TRANSITION_LOG_LEN: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_half_open_probes")]
    pub max_half_open_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_half_open_probes() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_timeout_ms(),
            max_half_open_probes: default_max_half_open_probes(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("circuit_breaker.failure_threshold must be > 0".to_string());
        }
        if self.success_threshold == 0 {
            return Err("circuit_breaker.success_threshold must be > 0".to_string());
        }
        if self.max_half_open_probes == 0 {
            return Err("circuit_breaker.max_half_open_probes must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at_ms: u64,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("circuit '{name}' is {state}")]
pub struct CircuitOpenError {
    pub name: String,
    pub state: CircuitState,
    pub retry_after: Option<Duration>,
}

/// Observer for state changes. Errors and panics are logged and swallowed.
pub trait TransitionListener: Send + Sync {
    fn on_transition(
        &self,
        name: &str,
        from: CircuitState,
        to: CircuitState,
        at_ms: u64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

impl CircuitStats {
    /// Percentage of attempts that succeeded; 100 when nothing ran yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 100.0;
        }
        self.successful_calls as f64 * 100.0 / self.total_calls as f64
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stats: CircuitStats,
    pub success_rate: f64,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_transition_at_ms: Option<u64>,
    half_open_in_flight: u32,
    episode: u64,
    last_error: Option<String>,
    stats: CircuitStats,
    transitions: VecDeque<Transition>,
}

impl BreakerInner {
    fn state(&self) -> CircuitState {
        self.state
    }

    fn transition(&mut self, to: CircuitState, now_ms: u64) -> Transition {
        let transition = Transition {
            from: self.state(),
            to,
            at_ms: now_ms,
        };
        self.state = to;
        self.last_transition_at_ms = Some(now_ms);
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.episode = self.episode.wrapping_add(1);
        self.transitions.push_back(transition);
        while self.transitions.len() > TRANSITION_LOG_LEN {
            self.transitions.pop_front();
        }
        transition
    }
}

/// Slot held by a call admitted through the breaker.
///
/// Half-open probes carry the episode they were admitted in; dropping the
/// permit frees the probe slot only if the breaker is still in that episode.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe_episode: Option<u64>,
}

impl CallPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe_episode.is_some()
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if let Some(episode) = self.probe_episode {
            self.breaker.release_probe(episode);
        }
    }
}

/// Why a guarded attempt failed.
#[derive(Debug)]
pub enum AttemptFailure<E> {
    Error(E),
    Timeout(Duration),
}

impl<E: std::fmt::Display> std::fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(err) => write!(f, "{err}"),
            Self::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
        }
    }
}

#[derive(Debug)]
pub enum CallError<E> {
    /// Rejected without calling the dependency.
    Open(CircuitOpenError),
    /// Every permitted attempt failed; carries the last failure.
    Exhausted {
        last: AttemptFailure<E>,
        attempts: u32,
    },
}

#[derive(Debug)]
pub struct CallOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn TransitionListener>>,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            listener: None,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransitionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state()
    }

    /// Admit one call or reject it as if open.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open here and
    /// the caller becomes its first probe.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let now_ms = self.clock.now_epoch_millis();
        let timeout_ms = self.config.timeout_ms;
        let mut transition = None;
        let result = {
            let mut inner = self.lock();
            match inner.state() {
                CircuitState::Closed => Ok(None),
                CircuitState::Open => {
                    let opened_at = inner.last_transition_at_ms.unwrap_or(0);
                    let elapsed = now_ms.saturating_sub(opened_at);
                    if elapsed >= timeout_ms {
                        transition = Some(inner.transition(CircuitState::HalfOpen, now_ms));
                        inner.half_open_in_flight = 1;
                        Ok(Some(inner.episode))
                    } else {
                        inner.stats.rejected_calls = inner.stats.rejected_calls.saturating_add(1);
                        Err(self.open_error(
                            CircuitState::Open,
                            Some(Duration::from_millis(timeout_ms - elapsed)),
                        ))
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.max_half_open_probes.max(1) {
                        inner.half_open_in_flight += 1;
                        Ok(Some(inner.episode))
                    } else {
                        inner.stats.rejected_calls = inner.stats.rejected_calls.saturating_add(1);
                        Err(self.open_error(CircuitState::HalfOpen, None))
                    }
                }
            }
        };
        self.notify(transition);
        result.map(|probe_episode| CallPermit {
            breaker: self,
            probe_episode,
        })
    }

    pub fn record_success(&self) {
        let now_ms = self.clock.now_epoch_millis();
        let mut transition = None;
        {
            let mut inner = self.lock();
            inner.stats.total_calls = inner.stats.total_calls.saturating_add(1);
            inner.stats.successful_calls = inner.stats.successful_calls.saturating_add(1);
            match inner.state() {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                }
                CircuitState::HalfOpen => {
                    inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                    if inner.consecutive_successes >= self.config.success_threshold {
                        transition = Some(inner.transition(CircuitState::Closed, now_ms));
                        inner.last_error = None;
                    }
                }
                // Late result of an attempt admitted before the breaker opened.
                CircuitState::Open => {}
            }
        }
        self.notify(transition);
    }

    pub fn record_failure(&self, message: impl Into<String>) {
        let now_ms = self.clock.now_epoch_millis();
        let mut transition = None;
        {
            let mut inner = self.lock();
            inner.stats.total_calls = inner.stats.total_calls.saturating_add(1);
            inner.stats.failed_calls = inner.stats.failed_calls.saturating_add(1);
            inner.last_error = Some(message.into());
            match inner.state() {
                CircuitState::Closed => {
                    inner.consecutive_successes = 0;
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        transition = Some(inner.transition(CircuitState::Open, now_ms));
                    }
                }
                CircuitState::HalfOpen => {
                    transition = Some(inner.transition(CircuitState::Open, now_ms));
                }
                CircuitState::Open => {}
            }
        }
        self.notify(transition);
    }

    /// Run `op` through the breaker with retries.
    ///
    /// An open breaker rejects before the first attempt. Each attempt runs
    /// under the policy's call timeout. Retries stop early once the breaker
    /// opens; the last attempt's failure is returned.
    pub async fn call<T, E, F, Fut>(
        &self,
        policy: &RetryPolicy,
        random: &dyn RandomSource,
        op: F,
    ) -> Result<CallOutcome<T>, CallError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(policy, random, op, |_| true).await
    }

    /// Like [`CircuitBreaker::call`], but errors for which `retryable`
    /// returns false end the loop after being recorded. Timeouts are always
    /// retryable.
    pub async fn call_classified<T, E, F, Fut, R>(
        &self,
        policy: &RetryPolicy,
        random: &dyn RandomSource,
        mut op: F,
        retryable: R,
    ) -> Result<CallOutcome<T>, CallError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let _permit = self.try_acquire().map_err(CallError::Open)?;
        let mut attempt: u32 = 0;
        loop {
            let failure = match tokio::time::timeout(policy.call_timeout(), op(attempt)).await {
                Ok(Ok(value)) => {
                    self.record_success();
                    return Ok(CallOutcome {
                        value,
                        attempts: attempt + 1,
                    });
                }
                Ok(Err(err)) => AttemptFailure::Error(err),
                Err(_) => AttemptFailure::Timeout(policy.call_timeout()),
            };
            self.record_failure(failure.to_string());

            let permanent = matches!(&failure, AttemptFailure::Error(err) if !retryable(err));
            if permanent || !policy.should_retry(attempt) || self.state() == CircuitState::Open {
                return Err(CallError::Exhausted {
                    last: failure,
                    attempts: attempt + 1,
                });
            }

            let delay = policy.next_delay(attempt, random.next_f64());
            tracing::debug!(
                breaker = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying after failed attempt"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state(),
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_in_flight: inner.half_open_in_flight,
            last_transition_at_ms: inner.last_transition_at_ms,
            last_error: inner.last_error.clone(),
            stats: inner.stats.clone(),
            success_rate: inner.stats.success_rate(),
            transitions: inner.transitions.iter().copied().collect(),
        }
    }

    /// Force the breaker back to closed and clear its statistics.
    pub fn reset(&self) {
        let now_ms = self.clock.now_epoch_millis();
        let transition = {
            let mut inner = self.lock();
            let transition = (inner.state() != CircuitState::Closed)
                .then(|| inner.transition(CircuitState::Closed, now_ms));
            inner.stats = CircuitStats::default();
            inner.last_error = None;
            transition
        };
        self.notify(transition);
    }

    fn release_probe(&self, episode: u64) {
        let mut inner = self.lock();
        if inner.state() == CircuitState::HalfOpen && inner.episode == episode {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn open_error(&self, state: CircuitState, retry_after: Option<Duration>) -> CircuitOpenError {
        CircuitOpenError {
            name: self.name.clone(),
            state,
            retry_after,
        }
    }

    fn notify(&self, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        if transition.to == CircuitState::Open {
            tracing::warn!(
                target: "breaker",
                breaker = %self.name,
                from = %transition.from,
                to = %transition.to,
                at_ms = transition.at_ms,
                "circuit opened"
            );
        } else {
            tracing::info!(
                target: "breaker",
                breaker = %self.name,
                from = %transition.from,
                to = %transition.to,
                at_ms = transition.at_ms,
                "circuit transition"
            );
        }

        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            listener.on_transition(&self.name, transition.from, transition.to, transition.at_ms)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(
                    target: "breaker",
                    breaker = %self.name,
                    error = %err,
                    "transition listener failed"
                );
            }
            Err(_) => {
                tracing::warn!(target: "breaker", breaker = %self.name, "transition listener panicked");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Named breakers shared across request tasks.
pub struct CircuitRegistry {
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn TransitionListener>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl std::fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitRegistry")
            .field("defaults", &self.defaults)
            .field("breakers", &self.names())
            .finish()
    }
}

impl CircuitRegistry {
    pub fn new(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            clock,
            listener: None,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransitionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.defaults.clone())
    }

    /// `config` only applies if this call creates the breaker.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }
        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut breaker = CircuitBreaker::new(name, config, self.clock.clone());
                if let Some(listener) = self.listener.clone() {
                    breaker = breaker.with_listener(listener);
                }
                Arc::new(breaker)
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<CircuitSnapshot> =
            breakers.iter().map(|breaker| breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}
