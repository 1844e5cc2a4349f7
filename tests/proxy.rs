use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use keygate::client::Client;
use keygate::concurrency::{AdaptiveConfig, AdaptiveLimits, LimiterMode};
use keygate::config::{Config, KeyFile};
use keygate::keys::KeyManager;
use keygate::pool::{BackoffConfig, PoolManager};
use keygate::proxy::{Admission, RequestHandler};
use keygate::replay::{ReplayConfig, ReplayQueue};
use keygate::router::{ModelRouter, RouteRule, RoutingConfig, Tier, TierName, TierStrategy};
use keygate::stats::StatsStore;
use keygate::telemetry::metrics::Metrics;
use keygate::trace::TraceStore;
use keygate::{ProxyInputs, strng};
use prometheus_client::registry::Registry;
use secrecy::SecretString;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
	handler: RequestHandler,
	inputs: Arc<ProxyInputs>,
}

fn routing_to_medium() -> RoutingConfig {
	RoutingConfig {
		enabled: true,
		shadow_mode: false,
		rules: vec![RouteRule {
			model: "claude-*".to_string(),
			token_range: None,
			tier: TierName::Medium,
		}],
		tiers: HashMap::from([(
			TierName::Medium,
			Tier {
				targets: vec![strng::new("glm-4.5")],
				strategy: TierStrategy::FirstAvailable,
				max_concurrency: None,
			},
		)]),
	}
}

fn harness(base_url: &str, api_keys: &[&str], mutate: impl FnOnce(&mut Config)) -> Harness {
	let mut cfg = Config::default();
	cfg.routing = routing_to_medium();
	cfg.handler.retry_backoff = BackoffConfig {
		base: Duration::from_millis(1),
		cap: Duration::from_millis(5),
		jitter: 0.0,
	};
	mutate(&mut cfg);
	let cfg = Arc::new(cfg);

	let key_file = KeyFile {
		keys: api_keys
			.iter()
			.map(|k| SecretString::from(k.to_string()))
			.collect(),
		base_url: base_url.to_string(),
	};
	let keys = Arc::new(KeyManager::new(cfg.keys.clone(), &key_file));
	let pool = Arc::new(PoolManager::new(cfg.pool.clone()));
	let limits = Arc::new(AdaptiveLimits::new(cfg.concurrency.clone()));
	let router = ModelRouter::new(cfg.routing.clone(), pool.clone(), limits.clone());
	let mut registry = Registry::default();
	let inputs = Arc::new(ProxyInputs {
		keys,
		pool,
		limits,
		router,
		traces: Arc::new(TraceStore::new(cfg.traces.capacity)),
		replay: Arc::new(ReplayQueue::new(cfg.replay.clone())),
		stats: Arc::new(StatsStore::new(cfg.stats.clone()).unwrap()),
		metrics: Arc::new(Metrics::new(&mut registry)),
		upstream: Client::new(&cfg.client).unwrap(),
		admission: Admission::new(cfg.handler.queue_size),
		cfg,
	});
	Harness {
		handler: RequestHandler::new(inputs.clone()),
		inputs,
	}
}

fn messages_request(model: &str) -> http::Request<axum::body::Body> {
	let body = serde_json::json!({
		"model": model,
		"max_tokens": 64,
		"messages": [{ "role": "user", "content": "hello" }],
	});
	http::Request::builder()
		.method("POST")
		.uri("/v1/messages")
		.header("content-type", "application/json")
		.body(axum::body::Body::from(body.to_string()))
		.unwrap()
}

fn ok_response() -> ResponseTemplate {
	ResponseTemplate::new(200).set_body_json(serde_json::json!({
		"id": "msg_1",
		"model": "glm-4.5",
		"content": [{ "type": "text", "text": "hi" }],
		"usage": { "input_tokens": 9, "output_tokens": 3 },
	}))
}

async fn body_json(resp: http::Response<axum::body::Body>) -> serde_json::Value {
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn happy_path_routes_and_records() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ok_response())
		.expect(1)
		.mount(&server)
		.await;

	let h = harness(&server.uri(), &["sk-only"], |_| {});
	let resp = h.handler.handle(messages_request("claude-sonnet-4")).await;
	assert_eq!(resp.status(), 200);
	let body = body_json(resp).await;
	assert_eq!(body["id"], "msg_1");

	// The upstream saw the rewritten model.
	let requests = server.received_requests().await.unwrap();
	let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
	assert_eq!(sent["model"], "glm-4.5");
	// The pool credential replaced client auth.
	assert_eq!(requests[0].headers.get("x-api-key").unwrap(), "sk-only");

	let traces = h.inputs.traces.recent(1);
	let trace = &traces[0];
	assert_eq!(trace.success, Some(true));
	assert_eq!(trace.attempts.len(), 1);
	assert!(trace.attempts[0].success);
	assert_eq!(trace.mapped_model.as_ref().unwrap().as_str(), "glm-4.5");

	let keys = h.inputs.keys.snapshot();
	assert_eq!(keys.keys[0].counters.total, 1);
	assert_eq!(keys.keys[0].counters.successes, 1);
	assert_eq!(keys.keys[0].in_flight, 0);

	// Usage was observed for cost accounting.
	let usage = h.inputs.stats.usage();
	assert_eq!(usage[&strng::new("glm-4.5")].input_tokens, 9);
}

#[tokio::test]
async fn key_level_429_retries_on_second_key() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(429))
		.up_to_n_times(1)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ok_response())
		.mount(&server)
		.await;

	let h = harness(&server.uri(), &["sk-a", "sk-b"], |_| {});
	let resp = h.handler.handle(messages_request("claude-sonnet-4")).await;
	assert_eq!(resp.status(), 200);

	let traces = h.inputs.traces.recent(1);
	let trace = &traces[0];
	assert_eq!(trace.success, Some(true));
	assert_eq!(trace.attempts.len(), 2);
	assert!(!trace.attempts[0].success);
	assert!(trace.attempts[1].success);
	assert_ne!(trace.attempts[0].key_index, trace.attempts[1].key_index);

	let keys = h.inputs.keys.snapshot();
	let limited: Vec<_> = keys.keys.iter().filter(|k| k.counters.rate_limited == 1).collect();
	assert_eq!(limited.len(), 1);
	assert!(limited[0].cooldown_remaining.is_some());
}

#[tokio::test]
async fn account_level_429_cools_the_model_pool() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(
			ResponseTemplate::new(429).insert_header("x-ratelimit-scope", "account"),
		)
		.mount(&server)
		.await;

	let h = harness(&server.uri(), &["sk-a"], |cfg| {
		cfg.handler.max_attempts = 1;
	});
	let resp = h.handler.handle(messages_request("claude-sonnet-4")).await;
	assert_eq!(resp.status(), 429);

	let model = strng::new("glm-4.5");
	assert!(h.inputs.pool.cooldown_remaining(Some(&model)).is_some());
	assert!(!h.inputs.pool.is_available(&model));
	let keys = h.inputs.keys.snapshot();
	assert_eq!(
		keys.keys[0].excluded_reason,
		keygate::keys::ExcludedReason::AccountLevel429
	);

	// While the pool cools, routing skips the model entirely and the request
	// goes out with the original model name.
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ok_response())
		.mount(&server)
		.await;
	// The key itself is still cooling; this request cannot use it.
	let resp = h.handler.handle(messages_request("claude-sonnet-4")).await;
	assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn non_retriable_client_error_passes_through_verbatim() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
			"type": "error",
			"error": { "type": "invalid_request_error", "message": "bad max_tokens" },
		})))
		.expect(1)
		.mount(&server)
		.await;

	let h = harness(&server.uri(), &["sk-a", "sk-b"], |_| {});
	let resp = h.handler.handle(messages_request("claude-sonnet-4")).await;
	assert_eq!(resp.status(), 400);
	let body = body_json(resp).await;
	assert_eq!(body["error"]["message"], "bad max_tokens");

	// No retry happened: one attempt, and the second key was never touched.
	let trace = &h.inputs.traces.recent(1)[0];
	assert_eq!(trace.attempts.len(), 1);
	let keys = h.inputs.keys.snapshot();
	assert_eq!(keys.keys.iter().map(|k| k.counters.total).sum::<u64>(), 1);
}

#[tokio::test]
async fn auth_error_excludes_the_key() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(401))
		.mount(&server)
		.await;

	let h = harness(&server.uri(), &["sk-bad"], |_| {});
	let resp = h.handler.handle(messages_request("claude-sonnet-4")).await;
	assert_eq!(resp.status(), 401);
	let keys = h.inputs.keys.snapshot();
	assert!(!keys.keys[0].eligible);
}

#[tokio::test]
async fn exhausted_attempts_enqueue_replay_and_replay_succeeds() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(500))
		.up_to_n_times(2)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ok_response())
		.mount(&server)
		.await;

	let h = harness(&server.uri(), &["sk-a", "sk-b"], |cfg| {
		cfg.handler.max_attempts = 2;
		cfg.replay = ReplayConfig {
			enabled: true,
			..Default::default()
		};
	});
	let resp = h.handler.handle(messages_request("claude-sonnet-4")).await;
	assert_eq!(resp.status(), 500);

	assert_eq!(h.inputs.replay.len(), 1);
	let entry = h.inputs.replay.dequeue().unwrap();
	assert_eq!(entry.method, "POST");
	assert_eq!(entry.path, "/v1/messages");

	let trace_id = entry.trace_id.clone();
	let success = h.handler.replay(trace_id.as_str(), false).await.unwrap();
	assert!(success);
	assert!(h.inputs.replay.dequeue().is_none());
}

#[tokio::test]
async fn streaming_response_passes_through_unbuffered() {
	let sse_body = concat!(
		"event: message_start\ndata: {\"type\":\"message_start\"}\n\n",
		"event: content_block_delta\ndata: {\"type\":\"content_block_delta\"}\n\n",
		"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
	);
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(
			ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
		)
		.mount(&server)
		.await;

	let h = harness(&server.uri(), &["sk-a"], |_| {});
	let resp = h.handler.handle(messages_request("claude-sonnet-4")).await;
	assert_eq!(resp.status(), 200);
	assert_eq!(
		resp.headers().get("content-type").unwrap(),
		"text/event-stream"
	);
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(bytes.as_ref(), sse_body.as_bytes());

	let trace = &h.inputs.traces.recent(1)[0];
	assert!(trace.streaming);
	assert!(trace.stream_started_at.is_some());
	assert_eq!(trace.success, Some(true));
	assert_eq!(trace.attempts.len(), 1);
	// The key was released once the stream completed.
	assert_eq!(h.inputs.keys.snapshot().keys[0].in_flight, 0);
}

#[tokio::test]
async fn enforce_mode_caps_concurrent_dispatches() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ok_response().set_delay(Duration::from_millis(200)))
		.mount(&server)
		.await;

	let h = harness(&server.uri(), &["sk-a"], |cfg| {
		cfg.concurrency = AdaptiveConfig {
			mode: LimiterMode::Enforce,
			initial_limit: 4,
			..Default::default()
		};
	});

	let mut tasks = Vec::new();
	for _ in 0..8 {
		let handler = h.handler.clone();
		tasks.push(tokio::spawn(async move {
			handler.handle(messages_request("claude-sonnet-4")).await
		}));
	}
	// Sample the in-flight gauge while requests are running.
	let model = strng::new("glm-4.5");
	let mut max_seen = 0;
	for _ in 0..20 {
		tokio::time::sleep(Duration::from_millis(20)).await;
		max_seen = max_seen.max(h.inputs.limits.in_flight(&model));
	}
	for t in tasks {
		let _ = t.await.unwrap();
	}
	assert!(max_seen <= 4, "observed {max_seen} in flight, limit was 4");
	assert!(max_seen > 0);
}

#[tokio::test]
async fn queue_full_returns_503_with_retry_after() {
	let server = MockServer::start().await;
	let h = harness(&server.uri(), &["sk-a"], |cfg| {
		cfg.handler.queue_size = 1;
	});
	let _held = h.inputs.admission.try_admit().unwrap();
	let resp = h.handler.handle(messages_request("claude-sonnet-4")).await;
	assert_eq!(resp.status(), 503);
	assert!(resp.headers().get("retry-after").is_some());
}

#[tokio::test]
async fn shadow_mode_records_decision_but_sends_original_model() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ok_response())
		.mount(&server)
		.await;

	let h = harness(&server.uri(), &["sk-a"], |cfg| {
		cfg.routing.shadow_mode = true;
	});
	let resp = h.handler.handle(messages_request("claude-sonnet-4")).await;
	assert_eq!(resp.status(), 200);

	let requests = server.received_requests().await.unwrap();
	let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
	assert_eq!(sent["model"], "claude-sonnet-4");

	let trace = &h.inputs.traces.recent(1)[0];
	let shadow = trace.shadow_decision.as_ref().unwrap();
	assert_eq!(shadow.model.as_str(), "glm-4.5");
}
