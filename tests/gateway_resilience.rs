use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ditto_chat_gateway::gateway::circuit_breaker::CircuitState;
use ditto_chat_gateway::gateway::context::{Prompt, Role};
use ditto_chat_gateway::gateway::{
    FixedRandom, Gateway, GatewayConfig, GatewayError, ManualClock, ModelTier, OsRandom, Plan,
    TierRatios, Upstream, UpstreamError, UpstreamReply,
};

/// Fails while `failing` is set; records when each call started.
#[derive(Default)]
struct SwitchableUpstream {
    failing: AtomicBool,
    calls: AtomicUsize,
    started_at: Mutex<Vec<tokio::time::Instant>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl SwitchableUpstream {
    fn failing() -> Self {
        let upstream = Self::default();
        upstream.failing.store(true, Ordering::SeqCst);
        upstream
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Upstream for SwitchableUpstream {
    async fn invoke(
        &self,
        _tier: ModelTier,
        prompt: &Prompt,
    ) -> Result<UpstreamReply, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started_at
            .lock()
            .expect("started_at")
            .push(tokio::time::Instant::now());
        self.prompts.lock().expect("prompts").push(prompt.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::new("503 service unavailable: internal detail"));
        }
        Ok(UpstreamReply {
            text: format!("reply to {}", prompt.message),
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
        })
    }
}

struct StallingUpstream;

#[async_trait]
impl Upstream for StallingUpstream {
    async fn invoke(
        &self,
        _tier: ModelTier,
        _prompt: &Prompt,
    ) -> Result<UpstreamReply, UpstreamError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Err(UpstreamError::new("unreachable"))
    }
}

fn open_plan() -> Plan {
    Plan {
        max_per_minute: 1_000,
        max_per_hour: 10_000,
        cooldown_ms: 0,
        ..Plan::default()
    }
}

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.default_plan = open_plan();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 10;
    config
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_then_admits_probe_after_timeout() {
    let mut config = config();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.timeout_ms = 60_000;
    config.retry.max_retries = 0;

    let clock = Arc::new(ManualClock::new(1_700_000_040_000));
    let upstream = Arc::new(SwitchableUpstream::failing());
    let gateway = Gateway::builder(config, upstream.clone())
        .clock(clock.clone())
        .random(Arc::new(FixedRandom::new(0.5)))
        .build()
        .expect("gateway");

    for i in 0..3 {
        let result = gateway.submit("u1", &format!("attempt {i}")).await;
        assert!(
            matches!(result, Err(GatewayError::Upstream { attempts: 1, .. })),
            "{result:?}"
        );
    }
    assert_eq!(gateway.circuit_snapshots()[0].state, CircuitState::Open);

    let rejected = gateway.submit("u1", "while open").await;
    match &rejected {
        Err(err @ GatewayError::CircuitOpen { dependency, .. }) => {
            assert_eq!(dependency, "model_api");
            assert!(err.user_message().contains("temporarily unavailable"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);

    clock.advance(Duration::from_secs(61));
    upstream.set_failing(false);
    let probe = gateway.submit("u1", "probe").await;
    assert!(probe.is_ok(), "{probe:?}");
    let snapshots = gateway.circuit_snapshots();
    let snapshot = &snapshots[0];
    assert_eq!(snapshot.state, CircuitState::HalfOpen);
    assert_eq!(snapshot.consecutive_successes, 1);

    upstream.set_failing(true);
    let failed_probe = gateway.submit("u1", "probe 2").await;
    assert!(failed_probe.is_err());
    assert_eq!(gateway.circuit_snapshots()[0].state, CircuitState::Open);

    let counters = gateway.observability();
    assert_eq!(counters.circuit_open, 1);
    assert_eq!(counters.upstream_failures, 4);
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded_and_backed_off_with_jitter() {
    let mut config = config();
    config.retry.max_retries = 2;
    config.retry.base_delay_ms = 1_000;
    config.retry.max_delay_ms = 30_000;
    config.retry.exponential_base = 2.0;
    config.circuit_breaker.failure_threshold = 10;

    let upstream = Arc::new(SwitchableUpstream::failing());
    let gateway = Gateway::builder(config, upstream.clone())
        .random(Arc::new(OsRandom))
        .build()
        .expect("gateway");

    let result = gateway.submit("u1", "hello").await;
    match &result {
        Err(err @ GatewayError::Upstream { attempts, .. }) => {
            assert_eq!(*attempts, 3);
            assert!(!err.user_message().contains("internal detail"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);

    let started = upstream.started_at.lock().expect("started_at").clone();
    for (i, pair) in started.windows(2).enumerate() {
        let gap = pair[1].duration_since(pair[0]).as_secs_f64();
        let nominal = (1.0 * 2f64.powi(i as i32)).min(30.0);
        assert!(
            gap >= 0.75 * nominal - 0.001 && gap <= 1.25 * nominal + 0.001,
            "gap {i} = {gap}s, nominal {nominal}s"
        );
    }
    assert!(gateway.context("u1").is_empty());
    assert_eq!(gateway.observability().upstream_calls, 3);
}

#[tokio::test(start_paused = true)]
async fn stalled_calls_time_out_and_count_as_failures() {
    let mut config = config();
    config.retry.max_retries = 1;
    config.retry.call_timeout_ms = 500;

    let gateway = Gateway::builder(config, Arc::new(StallingUpstream))
        .build()
        .expect("gateway");

    let result = gateway.submit("u1", "hello").await;
    match result {
        Err(GatewayError::Timeout { after, attempts }) => {
            assert_eq!(after, Duration::from_millis(500));
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected: {other:?}"),
    }
    let snapshots = gateway.circuit_snapshots();
    let snapshot = &snapshots[0];
    assert_eq!(snapshot.consecutive_failures, 2);
    assert_eq!(gateway.observability().timeouts, 1);
}

#[tokio::test]
async fn context_keeps_newest_entries_and_feeds_prompts() {
    let mut config = config();
    config.context.max_history = 10;
    let upstream = Arc::new(SwitchableUpstream::default());
    let gateway = Gateway::builder(config, upstream.clone())
        .build()
        .expect("gateway");

    for i in 0..8 {
        gateway
            .submit("u1", &format!("question {i}"))
            .await
            .expect("submit");
    }

    let entries = gateway.context("u1");
    assert_eq!(entries.len(), 10);
    assert_eq!(entries[0].text, "question 3");
    assert_eq!(entries[0].role, Role::Caller);
    assert_eq!(entries[9].text, "reply to question 7");
    assert_eq!(entries[9].role, Role::Model);

    let prompts = upstream.prompts.lock().expect("prompts").clone();
    assert!(prompts[0].history.is_empty());
    assert_eq!(prompts[1].history.len(), 2);
    assert_eq!(prompts[7].message, "question 7");

    assert!(gateway.clear_context("u1").await.expect("clear"));
    assert!(gateway.context("u1").is_empty());
}

#[tokio::test]
async fn routing_and_cost_follow_the_plan() {
    let config = config();
    let upstream = Arc::new(SwitchableUpstream::default());
    let gateway = Gateway::builder(config, upstream.clone())
        .random(Arc::new(OsRandom))
        .build()
        .expect("gateway");

    let plan = Plan {
        tier_ratios: TierRatios::only(ModelTier::High),
        ..open_plan()
    };
    let complex = "Explain why this `fn f(x: u32) -> u32 { x * 2 + 1 }` algorithm is slow, \
                   and compare it with the alternative. "
        .repeat(12);
    let response = gateway
        .submit_with_plan("u1", &complex, &plan)
        .await
        .expect("submit");
    assert_eq!(response.tier, ModelTier::High);
    assert_eq!(response.model, "gemini-2.5-pro");
    // One million tokens each way at $0.60 / $10.00 per million.
    assert_eq!(response.cost_usd_micros, 10_600_000);

    let simple = gateway
        .submit_with_plan("u2", "hi", &plan)
        .await
        .expect("submit");
    assert_eq!(simple.tier, ModelTier::Low);
}
