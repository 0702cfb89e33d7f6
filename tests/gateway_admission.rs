use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ditto_chat_gateway::gateway::context::Prompt;
use ditto_chat_gateway::gateway::counter_store::DualBackendCounterStore;
use ditto_chat_gateway::gateway::{
    CounterStore, CounterStoreError, FixedRandom, Gateway, GatewayConfig, GatewayError,
    ManualClock, MemoryCounterStore, ModelTier, ModerationSink, Plan, ReasonCode, StaticPlans, StoreFailurePolicy,
    TelemetrySink, Upstream, UpstreamError, UpstreamReply, UsageOutcome, UsageRecord,
};

#[derive(Default)]
struct EchoUpstream {
    calls: AtomicUsize,
}

#[async_trait]
impl Upstream for EchoUpstream {
    async fn invoke(
        &self,
        _tier: ModelTier,
        prompt: &Prompt,
    ) -> Result<UpstreamReply, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(UpstreamReply {
            text: format!("echo: {}", prompt.message),
            input_tokens: 10,
            output_tokens: 5,
        })
    }
}

#[derive(Default)]
struct CountingModeration {
    strikes: Mutex<Vec<(String, ReasonCode)>>,
}

impl ModerationSink for CountingModeration {
    fn report_strike(&self, subject: &str, reason: ReasonCode) {
        self.strikes
            .lock()
            .expect("strikes")
            .push((subject.to_string(), reason));
    }
}

#[derive(Default)]
struct RecordingTelemetry {
    records: Mutex<Vec<UsageRecord>>,
}

impl TelemetrySink for RecordingTelemetry {
    fn record_usage(&self, record: UsageRecord) {
        self.records.lock().expect("records").push(record);
    }
}

struct UnreachableStore;

#[async_trait]
impl CounterStore for UnreachableStore {
    fn backend_name(&self) -> &'static str {
        "unreachable"
    }

    async fn incr_and_expire(&self, _key: &str, _window: u64) -> Result<u64, CounterStoreError> {
        Err(CounterStoreError::Unavailable("connection refused".to_string()))
    }

    async fn get(&self, _key: &str) -> Result<Option<u64>, CounterStoreError> {
        Err(CounterStoreError::Unavailable("connection refused".to_string()))
    }

    async fn set_with_expiry(
        &self,
        _key: &str,
        _value: u64,
        _ttl: u64,
    ) -> Result<(), CounterStoreError> {
        Err(CounterStoreError::Unavailable("connection refused".to_string()))
    }

    async fn push_recent(
        &self,
        _key: &str,
        _value: &str,
        _keep: usize,
        _ttl: u64,
    ) -> Result<(), CounterStoreError> {
        Err(CounterStoreError::Unavailable("connection refused".to_string()))
    }

    async fn recent(&self, _key: &str) -> Result<Vec<String>, CounterStoreError> {
        Err(CounterStoreError::Unavailable("connection refused".to_string()))
    }

    async fn delete(&self, _keys: &[String]) -> Result<(), CounterStoreError> {
        Err(CounterStoreError::Unavailable("connection refused".to_string()))
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<u64, CounterStoreError> {
        Err(CounterStoreError::Unavailable("connection refused".to_string()))
    }
}

/// Memory store whose writes fail while `writes_down` is set.
struct WriteOutageStore {
    inner: MemoryCounterStore,
    writes_down: AtomicBool,
}

impl WriteOutageStore {
    fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: MemoryCounterStore::new(clock),
            writes_down: AtomicBool::new(false),
        }
    }

    fn check_writes(&self) -> Result<(), CounterStoreError> {
        if self.writes_down.load(Ordering::SeqCst) {
            return Err(CounterStoreError::Unavailable("read-only replica".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for WriteOutageStore {
    fn backend_name(&self) -> &'static str {
        "write-outage"
    }

    async fn incr_and_expire(&self, key: &str, window: u64) -> Result<u64, CounterStoreError> {
        self.check_writes()?;
        self.inner.incr_and_expire(key, window).await
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError> {
        self.inner.get(key).await
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl: u64,
    ) -> Result<(), CounterStoreError> {
        self.check_writes()?;
        self.inner.set_with_expiry(key, value, ttl).await
    }

    async fn push_recent(
        &self,
        key: &str,
        value: &str,
        keep: usize,
        ttl: u64,
    ) -> Result<(), CounterStoreError> {
        self.check_writes()?;
        self.inner.push_recent(key, value, keep, ttl).await
    }

    async fn recent(&self, key: &str) -> Result<Vec<String>, CounterStoreError> {
        self.inner.recent(key).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CounterStoreError> {
        self.check_writes()?;
        self.inner.delete(keys).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CounterStoreError> {
        self.check_writes()?;
        self.inner.delete_prefix(prefix).await
    }
}

fn u1_plan() -> Plan {
    Plan {
        max_per_minute: 10,
        max_per_hour: 100,
        cooldown_ms: 3_000,
        ..Plan::default()
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    upstream: Arc<EchoUpstream>,
    moderation: Arc<CountingModeration>,
    telemetry: Arc<RecordingTelemetry>,
    gateway: Arc<Gateway>,
}

fn harness(config: GatewayConfig) -> Harness {
    // Start on a minute boundary so windows do not roll mid-scenario.
    let clock = Arc::new(ManualClock::new(1_700_000_040_000));
    let upstream = Arc::new(EchoUpstream::default());
    let moderation = Arc::new(CountingModeration::default());
    let telemetry = Arc::new(RecordingTelemetry::default());
    let gateway = Gateway::builder(config, upstream.clone())
        .clock(clock.clone())
        .moderation(moderation.clone())
        .telemetry(telemetry.clone())
        .random(Arc::new(FixedRandom::new(0.5)))
        .build()
        .expect("gateway");
    Harness {
        clock,
        upstream,
        moderation,
        telemetry,
        gateway: Arc::new(gateway),
    }
}

fn throttle_reason(result: &Result<impl std::fmt::Debug, GatewayError>) -> Option<ReasonCode> {
    match result {
        Err(GatewayError::Throttled { reason, .. }) => Some(*reason),
        _ => None,
    }
}

#[tokio::test]
async fn scenario_cooldown_then_minute_limit() {
    let mut config = GatewayConfig::default();
    config.default_plan = u1_plan();
    let h = harness(config);

    let first = h.gateway.submit("u1", "message 0").await;
    assert!(first.is_ok(), "{first:?}");

    h.clock.advance(Duration::from_secs(1));
    let early = h.gateway.submit("u1", "too soon").await;
    assert_eq!(throttle_reason(&early), Some(ReasonCode::Cooldown));
    match early {
        Err(GatewayError::Throttled { retry_after, .. }) => {
            assert_eq!(retry_after, Some(Duration::from_secs(2)));
        }
        other => panic!("unexpected: {other:?}"),
    }

    h.clock.advance(Duration::from_secs(2));
    for i in 1..10 {
        let result = h.gateway.submit("u1", &format!("message {i}")).await;
        assert!(result.is_ok(), "message {i}: {result:?}");
        h.clock.advance(Duration::from_secs(3));
    }
    let eleventh = h.gateway.submit("u1", "message 10").await;
    assert_eq!(throttle_reason(&eleventh), Some(ReasonCode::MinuteLimit));
    assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn scenario_repeated_message_strikes_once() {
    let mut config = GatewayConfig::default();
    config.default_plan = Plan {
        cooldown_ms: 0,
        ..u1_plan()
    };
    let h = harness(config);

    for i in 0..4 {
        let result = h.gateway.submit("u2", "hi").await;
        assert!(result.is_ok(), "message {i}: {result:?}");
        h.clock.advance(Duration::from_millis(100));
    }
    let fifth = h.gateway.submit("u2", "hi").await;
    assert_eq!(throttle_reason(&fifth), Some(ReasonCode::Spam));

    let strikes = h.moderation.strikes.lock().expect("strikes").clone();
    assert_eq!(strikes, vec![("u2".to_string(), ReasonCode::Spam)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_within_cooldown_admit_one() {
    let mut config = GatewayConfig::default();
    config.default_plan = u1_plan();
    let h = harness(config);

    let mut tasks = Vec::new();
    for i in 0..32 {
        let gateway = h.gateway.clone();
        tasks.push(tokio::spawn(async move {
            gateway.submit("burst", &format!("message {i}")).await
        }));
    }

    let mut accepted = 0;
    let mut cooldowns = 0;
    for task in tasks {
        let result = task.await.expect("join");
        match throttle_reason(&result) {
            None => {
                assert!(result.is_ok(), "{result:?}");
                accepted += 1;
            }
            Some(ReasonCode::Cooldown) => cooldowns += 1,
            Some(other) => panic!("unexpected reason {other}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(cooldowns, 31);
    assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejections_never_reach_upstream_or_context() {
    let mut config = GatewayConfig::default();
    config.default_plan = u1_plan();
    config.guardrails.banned_phrases = vec!["forbidden".to_string()];
    let h = harness(config);

    assert!(h.gateway.submit("u1", "hello").await.is_ok());
    assert_eq!(h.gateway.context("u1").len(), 2);

    let throttled = h.gateway.submit("u1", "again").await;
    assert!(throttled.is_err());

    h.clock.advance(Duration::from_secs(5));
    let rejected = h.gateway.submit("u1", "say the FORBIDDEN word").await;
    assert!(matches!(
        rejected,
        Err(GatewayError::ContentRejected { ref reason }) if reason == "banned_phrase:forbidden"
    ));

    assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.context("u1").len(), 2);

    let counters = h.gateway.observability();
    assert_eq!(counters.requests, 3);
    assert_eq!(counters.throttled, 1);
    assert_eq!(counters.content_rejected, 1);
    assert_eq!(counters.completed, 1);
}

#[tokio::test]
async fn telemetry_is_recorded_once_per_submit() {
    let mut config = GatewayConfig::default();
    config.default_plan = u1_plan();
    let h = harness(config);

    assert!(h.gateway.submit("u1", "hello").await.is_ok());
    assert!(h.gateway.submit("u1", "again").await.is_err());

    let records = h.telemetry.records.lock().expect("records").clone();
    assert_eq!(records.len(), 2);

    let ok = &records[0];
    assert!(ok.success);
    assert_eq!(ok.outcome, UsageOutcome::Ok);
    assert_eq!(ok.tier, Some(ModelTier::Low));
    assert_eq!(ok.model.as_deref(), Some("gemini-2.5-flash-lite"));
    assert_eq!((ok.input_tokens, ok.output_tokens), (10, 5));
    assert_eq!(ok.attempts, 1);
    assert!(ok.circuit_state.is_some());

    let throttled = &records[1];
    assert!(!throttled.success);
    assert_eq!(
        throttled.outcome,
        UsageOutcome::Throttled {
            reason: ReasonCode::Cooldown
        }
    );
    assert_eq!(throttled.tier, None);
}

#[tokio::test]
async fn privileged_subjects_skip_admission() {
    let clock = Arc::new(ManualClock::new(1_700_000_040_000));
    let upstream = Arc::new(EchoUpstream::default());
    let plans = StaticPlans::new().with_plan(
        "admin",
        Plan {
            is_privileged: true,
            max_per_minute: 0,
            max_per_hour: 0,
            ..u1_plan()
        },
    );
    let gateway = Gateway::builder(GatewayConfig::default(), upstream.clone())
        .clock(clock)
        .plans(Arc::new(plans))
        .build()
        .expect("gateway");

    for _ in 0..6 {
        assert!(gateway.submit("admin", "same text").await.is_ok());
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 6);

    // Subjects without an entry get the default plan.
    assert!(gateway.submit("guest", "hi").await.is_ok());
    assert!(gateway.submit("guest", "hi again").await.is_err());
}

#[tokio::test]
async fn store_outage_follows_failure_policy() {
    for (policy, expect_ok) in [
        (StoreFailurePolicy::FailOpen, true),
        (StoreFailurePolicy::FailClosed, false),
    ] {
        let clock = Arc::new(ManualClock::new(1_700_000_040_000));
        let mut config = GatewayConfig::default();
        config.admission.store_failure_policy = policy;
        let counters = Arc::new(DualBackendCounterStore::new(
            Arc::new(UnreachableStore),
            clock.clone(),
        ));
        let upstream = Arc::new(EchoUpstream::default());
        let gateway = Gateway::builder(config, upstream.clone())
            .clock(clock)
            .counters(counters)
            .build()
            .expect("gateway");

        let result = gateway.submit("u1", "hello").await;
        if expect_ok {
            assert!(result.is_ok(), "{policy:?}: {result:?}");
            // Local state still enforces the cooldown while the store is down.
            let second = gateway.submit("u1", "again").await;
            assert_eq!(throttle_reason(&second), Some(ReasonCode::Cooldown));
        } else {
            assert_eq!(
                throttle_reason(&result),
                Some(ReasonCode::StoreUnavailable),
                "{policy:?}"
            );
            assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
        }
    }
}

#[tokio::test]
async fn messages_rejected_during_write_outage_do_not_count_as_spam() {
    let clock = Arc::new(ManualClock::new(1_700_000_040_000));
    let mut config = GatewayConfig::default();
    config.default_plan = Plan {
        cooldown_ms: 0,
        ..u1_plan()
    };
    config.admission.store_failure_policy = StoreFailurePolicy::FailClosed;
    let spam_threshold = config.admission.spam_threshold;

    let store = Arc::new(WriteOutageStore::new(clock.clone()));
    let counters = Arc::new(DualBackendCounterStore::new(store.clone(), clock.clone()));
    let upstream = Arc::new(EchoUpstream::default());
    let moderation = Arc::new(CountingModeration::default());
    let gateway = Gateway::builder(config, upstream.clone())
        .clock(clock.clone())
        .counters(counters)
        .moderation(moderation.clone())
        .build()
        .expect("gateway");

    store.writes_down.store(true, Ordering::SeqCst);
    for i in 0..spam_threshold {
        let result = gateway.submit("u1", "same text").await;
        assert_eq!(
            throttle_reason(&result),
            Some(ReasonCode::StoreUnavailable),
            "message {i}"
        );
        clock.advance(Duration::from_millis(10));
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

    store.writes_down.store(false, Ordering::SeqCst);
    let recovered = gateway.submit("u1", "same text").await;
    assert!(recovered.is_ok(), "{recovered:?}");
    assert!(moderation.strikes.lock().expect("strikes").is_empty());
}

#[tokio::test]
async fn reset_subject_clears_limits_and_context() {
    let mut config = GatewayConfig::default();
    config.default_plan = u1_plan();
    let h = harness(config);

    assert!(h.gateway.submit("u1", "hello").await.is_ok());
    assert!(h.gateway.submit("u1", "again").await.is_err());

    h.gateway.reset_subject("u1").await.expect("reset");
    assert!(h.gateway.context("u1").is_empty());
    assert!(h.gateway.submit("u1", "after reset").await.is_ok());
}
