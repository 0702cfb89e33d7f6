//! Chat gateway: admission control, content checks, tier routing and a
//! circuit-broken, retried upstream call per submitted message.

pub mod admission;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod costing;
pub mod counter_store;
pub mod guardrails;
pub mod http_upstream;
pub mod limits;
pub mod logging;
pub mod observability;
#[cfg(feature = "store-redis")]
pub mod redis_store;
pub mod retry;
pub mod router;
pub mod spam;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use admission::AdmissionControl;
use circuit_breaker::{
    AttemptFailure, CallError, CircuitRegistry, CircuitSnapshot, CircuitState, TransitionListener,
};
use context::{ContextEntry, ConversationContext, Prompt};
use counter_store::DualBackendCounterStore;
use observability::{Observability, ObservabilitySnapshot};
use retry::RetryPolicy;
use router::ModelRouter;

pub use admission::{AdmissionConfig, AdmissionDecision, ReasonCode, StoreFailurePolicy};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError};
pub use config::{ConfigError, GatewayConfig, Plan};
pub use context::{ContextConfig, ContextStats, Role};
pub use costing::{ModelTier, TierPricing, TierTable};
pub use counter_store::{
    CounterBackendConfig, CounterStore, CounterStoreError, MemoryCounterStore,
};
pub use guardrails::{Guardrails, GuardrailsConfig};
pub use http_upstream::OpenAiCompatibleUpstream;
pub use logging::init_tracing;
pub use retry::RetryConfig;
pub use router::TierRatios;

/// Wall-clock source in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Clock moved by hand; for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.fetch_add(by, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Uniform draws in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// OS randomness. Falls back to a time-seeded mix if the OS source fails.
#[derive(Debug, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn next_f64(&self) -> f64 {
        let mut bytes = [0u8; 8];
        let bits = if getrandom::fill(&mut bytes).is_ok() {
            u64::from_le_bytes(bytes)
        } else {
            static SEQ: AtomicU64 = AtomicU64::new(0);
            let seq = SEQ.fetch_add(1, Ordering::Relaxed);
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            splitmix64(nanos ^ seq.rotate_left(32))
        };
        (bits >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Always returns the same draw.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(f64);

impl FixedRandom {
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }
}

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

pub trait PlanLookup: Send + Sync {
    fn plan(&self, subject: &str) -> Option<Plan>;
}

/// Map-backed plan lookup.
#[derive(Clone, Debug, Default)]
pub struct StaticPlans {
    plans: HashMap<String, Plan>,
}

impl StaticPlans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, subject: impl Into<String>, plan: Plan) -> Self {
        self.plans.insert(subject.into(), plan);
        self
    }

    pub fn insert(&mut self, subject: impl Into<String>, plan: Plan) -> Option<Plan> {
        self.plans.insert(subject.into(), plan)
    }
}

impl PlanLookup for StaticPlans {
    fn plan(&self, subject: &str) -> Option<Plan> {
        self.plans.get(subject).cloned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamReply {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub message: String,
    pub retryable: bool,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// An error that retrying cannot fix, such as a rejected request.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn invoke(
        &self,
        tier: ModelTier,
        prompt: &Prompt,
    ) -> Result<UpstreamReply, UpstreamError>;
}

/// Receives repeated-message strikes. Implementations must not block.
pub trait ModerationSink: Send + Sync {
    fn report_strike(&self, subject: &str, reason: ReasonCode);
}

#[derive(Debug, Default)]
pub struct TracingModerationSink;

impl ModerationSink for TracingModerationSink {
    fn report_strike(&self, subject: &str, reason: ReasonCode) {
        tracing::warn!(target: "moderation", subject, %reason, "strike reported");
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageOutcome {
    #[default]
    Ok,
    Throttled {
        reason: ReasonCode,
    },
    CircuitOpen,
    Upstream,
    Timeout,
    ContentRejected,
    Store,
}

impl From<&GatewayError> for UsageOutcome {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::Throttled { reason, .. } => Self::Throttled { reason: *reason },
            GatewayError::CircuitOpen { .. } => Self::CircuitOpen,
            GatewayError::Upstream { .. } => Self::Upstream,
            GatewayError::Timeout { .. } => Self::Timeout,
            GatewayError::ContentRejected { .. } => Self::ContentRejected,
            GatewayError::Store(_) | GatewayError::Config(_) => Self::Store,
        }
    }
}

/// One record per `submit`, whatever its outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<ModelTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd_micros: u64,
    pub success: bool,
    pub outcome: UsageOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<CircuitState>,
    pub privileged: bool,
    pub attempts: u32,
    pub at_ms: u64,
}

pub trait TelemetrySink: Send + Sync {
    fn record_usage(&self, record: UsageRecord);
}

#[derive(Debug, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn record_usage(&self, record: UsageRecord) {
        tracing::info!(
            target: "telemetry",
            subject = %record.subject,
            tier = record.tier.map(ModelTier::as_str),
            model = record.model.as_deref(),
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost_usd_micros = record.cost_usd_micros,
            success = record.success,
            outcome = ?record.outcome,
            circuit_state = record.circuit_state.map(CircuitState::as_str),
            attempts = record.attempts,
            "usage"
        );
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("throttled: {reason}")]
    Throttled {
        reason: ReasonCode,
        retry_after: Option<Duration>,
    },
    #[error("dependency temporarily unavailable: {dependency}")]
    CircuitOpen {
        dependency: String,
        retry_after: Option<Duration>,
    },
    #[error("upstream failed after {attempts} attempt(s): {cause}")]
    Upstream { cause: String, attempts: u32 },
    #[error("upstream timed out after {}ms ({attempts} attempt(s))", .after.as_millis())]
    Timeout { after: Duration, attempts: u32 },
    #[error("content rejected: {reason}")]
    ContentRejected { reason: String },
    #[error(transparent)]
    Store(#[from] CounterStoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Throttled { .. } => "throttled",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Upstream { .. } => "upstream",
            Self::Timeout { .. } => "timeout",
            Self::ContentRejected { .. } => "content_rejected",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// Text safe to show the caller. Upstream causes are never included.
    pub fn user_message(&self) -> String {
        match self {
            Self::Throttled {
                reason,
                retry_after,
            } => {
                let secs = retry_after.map_or(0, |d| d.as_secs_f64().ceil() as u64);
                match reason {
                    ReasonCode::Cooldown => {
                        format!("Please wait {secs}s before sending another message.")
                    }
                    ReasonCode::HourlyLimit => format!(
                        "Hourly message limit reached. Try again in {} min.",
                        secs.div_ceil(60).max(1)
                    ),
                    ReasonCode::MinuteLimit => {
                        format!("Too many messages this minute. Try again in {secs}s.")
                    }
                    ReasonCode::Spam => "Please don't repeat the same message.".to_string(),
                    ReasonCode::StoreUnavailable => {
                        "The service is busy. Please retry shortly.".to_string()
                    }
                }
            }
            Self::CircuitOpen { .. } => {
                "The assistant is temporarily unavailable. Please try again in a minute."
                    .to_string()
            }
            Self::Upstream { .. } | Self::Timeout { .. } => {
                "The service is unavailable right now. Please try again later.".to_string()
            }
            Self::ContentRejected { .. } => "This message can't be processed.".to_string(),
            Self::Store(_) | Self::Config(_) => {
                "The service is busy. Please retry shortly.".to_string()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub text: String,
    pub tier: ModelTier,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd_micros: u64,
    pub attempts: u32,
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    upstream: Arc<dyn Upstream>,
    plans: Option<Arc<dyn PlanLookup>>,
    counters: Option<Arc<DualBackendCounterStore>>,
    moderation: Option<Arc<dyn ModerationSink>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    transitions: Option<Arc<dyn TransitionListener>>,
    random: Option<Arc<dyn RandomSource>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GatewayBuilder {
    pub fn plans(mut self, plans: Arc<dyn PlanLookup>) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn counters(mut self, counters: Arc<DualBackendCounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn moderation(mut self, moderation: Arc<dyn ModerationSink>) -> Self {
        self.moderation = Some(moderation);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn transition_listener(mut self, listener: Arc<dyn TransitionListener>) -> Self {
        self.transitions = Some(listener);
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Open `config.counter_backend` unless counters were supplied, then build.
    pub async fn connect(mut self) -> Result<Gateway, GatewayError> {
        if self.counters.is_none() {
            let clock = self.resolved_clock();
            let counters = DualBackendCounterStore::open(&self.config.counter_backend, clock)
                .await?
                .with_cache_ttl(self.config.admission.local_cache_ttl());
            self.counters = Some(Arc::new(counters));
        }
        Ok(self.build()?)
    }

    /// Build with in-memory counters unless counters were supplied.
    pub fn build(self) -> Result<Gateway, ConfigError> {
        self.config.validate()?;
        let guardrails =
            Guardrails::compile(&self.config.guardrails).map_err(ConfigError::Invalid)?;
        let clock = self.resolved_clock();
        let counters = self.counters.unwrap_or_else(|| {
            Arc::new(
                DualBackendCounterStore::in_memory(clock.clone())
                    .with_cache_ttl(self.config.admission.local_cache_ttl()),
            )
        });
        let moderation = self
            .moderation
            .unwrap_or_else(|| Arc::new(TracingModerationSink));
        let mut breakers = CircuitRegistry::new(self.config.circuit_breaker.clone(), clock.clone());
        if let Some(listener) = self.transitions {
            breakers = breakers.with_listener(listener);
        }

        Ok(Gateway {
            admission: AdmissionControl::new(
                self.config.admission.clone(),
                counters,
                moderation,
                clock.clone(),
            ),
            router: ModelRouter::new(),
            guardrails,
            retry: RetryPolicy::from_config(&self.config.retry),
            breakers: Arc::new(breakers),
            context: ConversationContext::new(self.config.context.clone()),
            upstream: self.upstream,
            plans: self.plans.unwrap_or_else(|| Arc::new(StaticPlans::new())),
            telemetry: self
                .telemetry
                .unwrap_or_else(|| Arc::new(TracingTelemetrySink)),
            random: self.random.unwrap_or_else(|| Arc::new(OsRandom)),
            observability: Observability::default(),
            clock,
            config: self.config,
        })
    }

    fn resolved_clock(&self) -> Arc<dyn Clock> {
        self.clock
            .clone()
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>)
    }
}

pub struct Gateway {
    config: GatewayConfig,
    admission: AdmissionControl,
    router: ModelRouter,
    guardrails: Guardrails,
    retry: RetryPolicy,
    breakers: Arc<CircuitRegistry>,
    context: ConversationContext,
    upstream: Arc<dyn Upstream>,
    plans: Arc<dyn PlanLookup>,
    telemetry: Arc<dyn TelemetrySink>,
    random: Arc<dyn RandomSource>,
    observability: Observability,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("admission", &self.admission)
            .field("breakers", &self.breakers)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn builder(config: GatewayConfig, upstream: Arc<dyn Upstream>) -> GatewayBuilder {
        GatewayBuilder {
            config,
            upstream,
            plans: None,
            counters: None,
            moderation: None,
            telemetry: None,
            transitions: None,
            random: None,
            clock: None,
        }
    }

    pub fn new(config: GatewayConfig, upstream: Arc<dyn Upstream>) -> Result<Self, ConfigError> {
        Self::builder(config, upstream).build()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn circuit_registry(&self) -> &Arc<CircuitRegistry> {
        &self.breakers
    }

    pub async fn submit(&self, subject: &str, text: &str) -> Result<SubmitResponse, GatewayError> {
        let plan = self
            .plans
            .plan(subject)
            .unwrap_or_else(|| self.config.default_plan.clone());
        self.submit_with_plan(subject, text, &plan).await
    }

    pub async fn submit_with_plan(
        &self,
        subject: &str,
        text: &str,
        plan: &Plan,
    ) -> Result<SubmitResponse, GatewayError> {
        self.observability.record_request();
        let mut usage = UsageRecord {
            subject: subject.to_string(),
            privileged: plan.is_privileged,
            at_ms: self.clock.now_epoch_millis(),
            ..UsageRecord::default()
        };

        let result = self.process(subject, text, plan, &mut usage).await;

        usage.success = result.is_ok();
        usage.outcome = match &result {
            Ok(_) => UsageOutcome::Ok,
            Err(err) => UsageOutcome::from(err),
        };
        self.telemetry.record_usage(usage);
        result
    }

    async fn process(
        &self,
        subject: &str,
        text: &str,
        plan: &Plan,
        usage: &mut UsageRecord,
    ) -> Result<SubmitResponse, GatewayError> {
        let decision = self.admission.check(subject, text, plan).await;
        if !decision.allow {
            self.observability.record_throttled();
            return Err(GatewayError::Throttled {
                reason: decision.reason.unwrap_or(ReasonCode::StoreUnavailable),
                retry_after: decision.retry_after,
            });
        }

        if let Err(err) = self.guardrails.check(text) {
            self.observability.record_content_rejected();
            tracing::info!(subject, error = %err, "message rejected by guardrails");
            return Err(err);
        }

        let route = self
            .router
            .route(text, &plan.tier_ratios, self.random.as_ref());
        let model = self.config.tiers.model_name(route.tier).to_string();
        usage.tier = Some(route.tier);
        usage.model = Some(model.clone());
        tracing::debug!(
            subject,
            tier = %route.tier,
            score = route.score,
            model = %model,
            "routed message"
        );

        let breaker = self.breakers.get_or_create(&self.config.upstream_name);
        self.load_context(subject).await;
        let prompt = self.context.build_prompt(subject, text);
        let upstream = self.upstream.as_ref();
        let tier = route.tier;
        let prompt_ref = &prompt;
        let result = breaker
            .call_classified(
                &self.retry,
                self.random.as_ref(),
                move |_| upstream.invoke(tier, prompt_ref),
                |err: &UpstreamError| err.retryable,
            )
            .await;
        usage.circuit_state = Some(breaker.state());

        match result {
            Ok(outcome) => {
                let reply = outcome.value;
                self.observability.record_upstream_calls(outcome.attempts);
                let cost = self.config.tiers.estimate_cost_usd_micros(
                    tier,
                    reply.input_tokens,
                    reply.output_tokens,
                );
                usage.attempts = outcome.attempts;
                usage.input_tokens = reply.input_tokens;
                usage.output_tokens = reply.output_tokens;
                usage.cost_usd_micros = cost;

                let at_ms = self.clock.now_epoch_millis();
                self.context
                    .append_exchange(subject, text, &reply.text, at_ms);
                self.persist_exchange(subject, text, &reply.text, at_ms).await;
                self.observability.record_completed();
                Ok(SubmitResponse {
                    text: reply.text,
                    tier,
                    model,
                    input_tokens: reply.input_tokens,
                    output_tokens: reply.output_tokens,
                    cost_usd_micros: cost,
                    attempts: outcome.attempts,
                })
            }
            Err(CallError::Open(err)) => {
                self.observability.record_circuit_open();
                tracing::info!(subject, breaker = %err.name, state = %err.state, "circuit open");
                Err(GatewayError::CircuitOpen {
                    dependency: err.name,
                    retry_after: err.retry_after,
                })
            }
            Err(CallError::Exhausted { last, attempts }) => {
                self.observability.record_upstream_calls(attempts);
                usage.attempts = attempts;
                match last {
                    AttemptFailure::Error(err) => {
                        self.observability.record_upstream_failure();
                        tracing::warn!(
                            subject,
                            attempts,
                            retryable = err.retryable,
                            error = %err,
                            "upstream call failed"
                        );
                        Err(GatewayError::Upstream {
                            cause: err.message,
                            attempts,
                        })
                    }
                    AttemptFailure::Timeout(after) => {
                        self.observability.record_timeout();
                        tracing::warn!(
                            subject,
                            attempts,
                            timeout_ms = after.as_millis() as u64,
                            "upstream call timed out"
                        );
                        Err(GatewayError::Timeout { after, attempts })
                    }
                }
            }
        }
    }

    /// Fill the local context from the counter store the first time a
    /// subject is seen by this process.
    async fn load_context(&self, subject: &str) {
        if self.context.is_loaded(subject) {
            return;
        }
        match self.admission.counters().history(subject).await {
            Ok(entries) => {
                let loaded = entries.len();
                if self.context.restore(subject, entries) && loaded > 0 {
                    tracing::debug!(subject, loaded, "restored conversation history");
                }
            }
            Err(err) => {
                tracing::warn!(subject, error = %err, "failed to load conversation history");
            }
        }
    }

    async fn persist_exchange(
        &self,
        subject: &str,
        caller_text: &str,
        model_text: &str,
        at_ms: u64,
    ) {
        let counters = self.admission.counters();
        let keep = self.config.context.max_history;
        for (role, text) in [(Role::Caller, caller_text), (Role::Model, model_text)] {
            let entry = ContextEntry {
                role,
                text: text.to_string(),
                timestamp_ms: at_ms,
            };
            if let Err(err) = counters.record_history(subject, &entry, keep).await {
                tracing::warn!(subject, error = %err, "failed to persist conversation entry");
                return;
            }
        }
    }

    /// History held by this process for `subject`. Persisted history is
    /// loaded on the subject's next submit or `context_stats` call.
    pub fn context(&self, subject: &str) -> Vec<ContextEntry> {
        self.context.entries(subject)
    }

    pub async fn context_stats(&self, subject: &str) -> ContextStats {
        self.load_context(subject).await;
        self.context.stats(subject)
    }

    /// Drop the subject's history locally and in the counter store. Returns
    /// whether this process held any history for it.
    pub async fn clear_context(&self, subject: &str) -> Result<bool, GatewayError> {
        self.admission.counters().clear_history(subject).await?;
        Ok(self.context.clear(subject))
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshots()
    }

    /// Clear a subject's limiter, spam history and conversation.
    pub async fn reset_subject(&self, subject: &str) -> Result<(), GatewayError> {
        self.clear_context(subject).await?;
        self.admission.reset_subject(subject).await?;
        Ok(())
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }
}
