use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use secrecy::ExposeSecret;

use crate::client::Call;
use crate::http::{
	Body, HOP_HEADERS, HeaderMap, Method, Request, Response, StatusCode, header, is_streaming_response,
	x_headers,
};
use crate::keys::{KeyHandle, Outcome};
use crate::pool::backoff;
use crate::proxy::classify::{ErrorKind, classify_status};
use crate::proxy::{ProxyError, classify};
use crate::replay::{ReplayEntry, ReplayStatus, redact_headers};
use crate::router::RouteRequest;
use crate::sse::observed_body;
use crate::trace::{Attempt, RequestTrace, new_trace_id};
use crate::*;

/// The attempt loop: select a model and a key, dispatch, classify, retry or
/// surface. One instance serves every connection.
#[derive(Clone)]
pub struct RequestHandler {
	inputs: Arc<ProxyInputs>,
}

/// A request reduced to what the loop needs; replays are rebuilt into this
/// same shape.
struct RequestContext {
	method: Method,
	path_and_query: String,
	headers: HeaderMap,
	body: Bytes,
	original_model: Option<String>,
	token_estimate: Option<u64>,
	override_model: Option<String>,
}

/// Trace shared between the request future and a streaming body's completion
/// callback. Finalisation happens exactly once, wherever the request
/// actually ends.
#[derive(Clone)]
struct ActiveTrace {
	inner: Arc<Mutex<Option<RequestTrace>>>,
	started: Instant,
	inputs: Arc<ProxyInputs>,
}

impl ActiveTrace {
	fn new(trace: RequestTrace, inputs: Arc<ProxyInputs>) -> Self {
		ActiveTrace {
			inner: Arc::new(Mutex::new(Some(trace))),
			started: Instant::now(),
			inputs,
		}
	}

	fn with(&self, f: impl FnOnce(&mut RequestTrace)) {
		if let Some(t) = self.inner.lock().as_mut() {
			f(t)
		}
	}

	fn finalize(&self, success: bool) {
		let Some(mut trace) = self.inner.lock().take() else {
			return;
		};
		trace.finalize(success, self.started);
		let attempts = trace.attempts.len();
		let streamed = trace.streaming;
		self.inputs.stats.record_request(success, attempts, streamed);
		self
			.inputs
			.metrics
			.record_request_outcome(if success { "success" } else { "failure" });
		self.inputs.traces.push(trace);
	}

	fn finalize_disconnect(&self) {
		let Some(mut trace) = self.inner.lock().take() else {
			return;
		};
		trace.client_disconnect = true;
		trace.finalize(false, self.started);
		self.inputs.stats.record_disconnect();
		self.inputs.metrics.record_request_outcome("disconnect");
		self.inputs.traces.push(trace);
	}
}

/// Finalises an abandoned trace as a client disconnect when the request
/// future is dropped mid-flight.
struct DisconnectGuard {
	trace: ActiveTrace,
	armed: bool,
}

impl DisconnectGuard {
	fn disarm(&mut self) {
		self.armed = false;
	}
}

impl Drop for DisconnectGuard {
	fn drop(&mut self) {
		if self.armed {
			self.trace.finalize_disconnect();
		}
	}
}

enum AttemptResult {
	/// Response ready to return to the client. For streams, trace
	/// finalisation is owned by the body.
	Done(Response),
	Retry {
		kind: ErrorKind,
		response: Option<(StatusCode, HeaderMap, Bytes)>,
	},
	Fatal {
		kind: ErrorKind,
		response: Option<(StatusCode, HeaderMap, Bytes)>,
	},
}

impl RequestHandler {
	pub fn new(inputs: Arc<ProxyInputs>) -> Self {
		RequestHandler { inputs }
	}

	pub async fn handle(&self, req: Request) -> Response {
		let permit = match self.inputs.admission.try_admit() {
			Ok(p) => p,
			Err(e) => {
				self.inputs.metrics.queue_rejections.inc();
				return e.into_response();
			},
		};
		self
			.inputs
			.metrics
			.queue_depth
			.set(self.inputs.admission.depth() as i64);
		let res = self.handle_admitted(req, permit.queued_for).await;
		drop(permit);
		self
			.inputs
			.metrics
			.queue_depth
			.set(self.inputs.admission.depth() as i64);
		res.unwrap_or_else(|e| e.into_response())
	}

	async fn handle_admitted(
		&self,
		req: Request,
		queued_for: Duration,
	) -> Result<Response, ProxyError> {
		let (parts, body) = req.into_parts();
		let body = axum::body::to_bytes(body, self.inputs.cfg.handler.max_body_bytes)
			.await
			.map_err(|_| ProxyError::BodyTooLarge)?;

		let trace_id = parts
			.headers
			.get(x_headers::X_TRACE_ID)
			.and_then(|v| v.to_str().ok())
			.map(strng::new)
			.unwrap_or_else(new_trace_id);
		let tenant = parts
			.headers
			.get(x_headers::X_TENANT_ID)
			.and_then(|v| v.to_str().ok())
			.map(strng::new);
		let override_model = self.trusted_override(&parts.headers);

		let parsed: Option<serde_json::Value> = serde_json::from_slice(&body).ok();
		let original_model = parsed
			.as_ref()
			.and_then(|v| v.get("model"))
			.and_then(|m| m.as_str())
			.map(str::to_string);

		let path_and_query = parts
			.uri
			.path_and_query()
			.map(|pq| pq.as_str().to_string())
			.unwrap_or_else(|| "/".to_string());

		let mut trace = RequestTrace::new(
			trace_id,
			original_model.as_deref().map(strng::new).unwrap_or(strng::EMPTY),
			queued_for,
		);
		trace.tenant = tenant;

		let ctx = RequestContext {
			method: parts.method,
			path_and_query,
			headers: parts.headers,
			token_estimate: Some(body.len() as u64 / 4),
			body,
			original_model,
			override_model,
		};
		self.run_attempts(ctx, trace).await
	}

	/// Honour x-model-override only when admin auth passes (or is disabled).
	fn trusted_override(&self, headers: &HeaderMap) -> Option<String> {
		let requested = headers
			.get(x_headers::X_MODEL_OVERRIDE)
			.and_then(|v| v.to_str().ok())?;
		match &self.inputs.cfg.admin_token {
			None => Some(requested.to_string()),
			Some(expected) => {
				let presented = headers
					.get(x_headers::X_ADMIN_TOKEN)
					.and_then(|v| v.to_str().ok());
				if presented == Some(expected.expose_secret()) {
					Some(requested.to_string())
				} else {
					debug!("x-model-override ignored: admin auth failed");
					None
				}
			},
		}
	}

	async fn run_attempts(
		&self,
		ctx: RequestContext,
		trace: RequestTrace,
	) -> Result<Response, ProxyError> {
		let inputs = self.inputs.clone();
		let cfg = &inputs.cfg.handler;
		let active = ActiveTrace::new(trace, inputs.clone());
		let mut guard = DisconnectGuard {
			trace: active.clone(),
			armed: true,
		};

		let trace_id = {
			let inner = active.inner.lock();
			inner
				.as_ref()
				.map(|t| t.trace_id.clone())
				.unwrap_or_else(new_trace_id)
		};
		let mut attempted_keys: HashSet<usize> = HashSet::new();
		let mut attempted_models: HashSet<Strng> = HashSet::new();
		let mut last: Option<AttemptResult> = None;
		let max_attempts = cfg.max_attempts.max(1);

		for attempt_n in 1..=max_attempts {
			let result = self
				.attempt(&ctx, &active, &mut attempted_keys, &mut attempted_models)
				.await;
			match result {
				Ok(AttemptResult::Done(resp)) => {
					guard.disarm();
					return Ok(resp);
				},
				Ok(AttemptResult::Fatal { kind, response }) => {
					debug!(kind = %kind, "attempt failed, not retriable");
					active.finalize(false);
					guard.disarm();
					return Ok(self.error_response(kind, response));
				},
				Ok(AttemptResult::Retry { kind, response }) => {
					debug!(attempt = attempt_n, kind = %kind, "attempt failed, retrying");
					last = Some(AttemptResult::Retry {
						kind,
						response,
					});
					if attempt_n < max_attempts {
						tokio::time::sleep(backoff(&cfg.retry_backoff, attempt_n)).await;
					}
				},
				Err(e) => {
					// No key was available: the loop cannot make progress.
					let error = e.to_string();
					active.finalize(false);
					self.maybe_enqueue_replay(&ctx, trace_id.clone(), &error);
					guard.disarm();
					return Err(e);
				},
			}
		}

		active.finalize(false);
		guard.disarm();
		match last {
			Some(AttemptResult::Retry { kind, response }) => {
				self.maybe_enqueue_replay(&ctx, trace_id, kind.as_str());
				Ok(self.error_response(kind, response))
			},
			_ => Err(ProxyError::NoHealthyKey),
		}
	}

	async fn attempt(
		&self,
		ctx: &RequestContext,
		active: &ActiveTrace,
		attempted_keys: &mut HashSet<usize>,
		attempted_models: &mut HashSet<Strng>,
	) -> Result<AttemptResult, ProxyError> {
		let inputs = &self.inputs;

		let routing = match &ctx.original_model {
			Some(model) => {
				let outcome = inputs.router.select_model(&RouteRequest {
					original_model: model,
					token_estimate: ctx.token_estimate,
					attempted_models,
					override_model: ctx.override_model.as_deref(),
				});
				if let Some(shadow) = outcome.shadow {
					active.with(|t| {
						if t.shadow_decision.is_none() {
							t.shadow_decision = Some(shadow.clone());
						}
					});
				}
				outcome.decision
			},
			None => None,
		};
		let physical: Option<Strng> = routing
			.as_ref()
			.map(|d| d.model.clone())
			.or_else(|| ctx.original_model.as_deref().map(strng::new));

		let handle = inputs.keys.acquire(attempted_keys)?;
		inputs
			.metrics
			.keys_available
			.set(inputs.keys.available_count() as i64);

		if let Some(model) = &physical {
			active.with(|t| t.mapped_model = Some(model.clone()));
			// Pacing: the upstream told us it is close to the limit.
			if let Some(delay) = inputs.pool.pacing_delay(model) {
				trace!(model = %model, ?delay, "pacing before dispatch");
				tokio::time::sleep(delay).await;
			}
			if !inputs.limits.try_begin(model) {
				// Saturated in enforce mode: this model is not an option
				// right now, try routing elsewhere.
				handle.release_unused();
				attempted_models.insert(model.clone());
				return Ok(AttemptResult::Retry {
					kind: ErrorKind::RateLimitedKey,
					response: None,
				});
			}
		}

		let body = match (&routing, &ctx.original_model) {
			(Some(decision), Some(_)) => rewrite_model(&ctx.body, decision.model.as_str())
				.unwrap_or_else(|| ctx.body.clone()),
			_ => ctx.body.clone(),
		};

		let timeout = self.attempt_timeout(physical.as_ref());
		let started_at = Utc::now();
		let attempt_start = Instant::now();
		let result = inputs
			.upstream
			.call(Call {
				method: ctx.method.clone(),
				path_and_query: ctx.path_and_query.clone(),
				headers: ctx.headers.clone(),
				body,
				base_url: inputs.keys.base_url(),
				api_key: handle.secret().clone(),
				timeout,
			})
			.await;
		if let Some(model) = &physical {
			inputs.limits.end(model);
		}
		let latency = attempt_start.elapsed();

		let mut attempt = Attempt {
			key_index: handle.index(),
			key_id: handle.id(),
			model: physical.clone().unwrap_or(strng::EMPTY),
			started_at,
			duration: latency,
			success: false,
			status: None,
			error: None,
			selection_reason: handle.reason,
			retry_reason: None,
		};

		match result {
			Err(kind) => {
				attempt.error = Some(kind);
				attempt.retry_reason = Some(kind.as_str().to_string());
				active.with(|t| t.attempts.push(attempt));
				inputs.stats.record_error(kind);
				inputs.metrics.record_attempt(physical.as_ref(), kind.as_str());
				attempted_keys.insert(handle.index());
				handle.release(Outcome::Failure { kind, latency });
				if let Some(model) = &physical {
					attempted_models.insert(model.clone());
				}
				Ok(AttemptResult::Retry {
					kind,
					response: None,
				})
			},
			Ok(resp) => {
				let status = StatusCode::from_u16(resp.status().as_u16())
					.unwrap_or(StatusCode::BAD_GATEWAY);
				let headers = resp.headers().clone();
				attempt.status = Some(status.as_u16());
				if let Some(model) = &physical {
					inputs
						.pool
						.record_rate_limit_headers(model, remaining_tokens(&headers));
				}
				let account_scope = self.scope_is_account(&headers);
				match classify_status(status, account_scope) {
					None => {
						self
							.complete_success(active, attempt, attempt_start, handle, physical, resp, status, headers)
							.await
					},
					Some(kind) => {
						let body = resp.bytes().await.unwrap_or_default();
						attempt.success = false;
						attempt.error = Some(kind);
						attempt.retry_reason = kind.is_retriable().then(|| kind.as_str().to_string());
						active.with(|t| t.attempts.push(attempt));
						inputs.stats.record_error(kind);
						inputs.metrics.record_attempt(physical.as_ref(), kind.as_str());
						attempted_keys.insert(handle.index());
						handle.release(Outcome::Failure { kind, latency });
						if kind.cools_key() {
							if let Some(model) = &physical {
								inputs.limits.record_rate_limited(model);
							}
						}
						if kind.cools_pool() {
							inputs.pool.record_rate_limit_hit(physical.as_ref());
						}
						if let Some(model) = &physical {
							attempted_models.insert(model.clone());
						}
						let response = Some((status, headers, body));
						if kind.is_retriable() {
							Ok(AttemptResult::Retry { kind, response })
						} else {
							Ok(AttemptResult::Fatal { kind, response })
						}
					},
				}
			},
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn complete_success(
		&self,
		active: &ActiveTrace,
		mut attempt: Attempt,
		attempt_start: Instant,
		handle: KeyHandle,
		physical: Option<Strng>,
		resp: reqwest::Response,
		status: StatusCode,
		headers: HeaderMap,
	) -> Result<AttemptResult, ProxyError> {
		let inputs = self.inputs.clone();
		if let Some(model) = &physical {
			inputs.pool.clear_rate_limit(model);
		}
		attempt.success = true;
		inputs
			.metrics
			.record_attempt(physical.as_ref(), "success");

		if is_streaming_response(&headers) {
			// Forward bytes as they arrive. From here on the stream owns the
			// key and the trace; retries are no longer possible.
			active.with(|t| {
				t.streaming = true;
				t.stream_started_at = Some(Utc::now());
				t.attempts.push(attempt);
			});
			let active = active.clone();
			let model = physical.clone();
			let on_end = move |end: crate::sse::StreamEnd| {
				let latency = attempt_start.elapsed();
				if end.client_disconnect {
					handle.release(Outcome::Disconnect { latency });
					active.finalize_disconnect();
					return;
				}
				if end.success {
					if let Some(model) = &model {
						active.inputs.pool.record_latency(model, latency);
					}
					handle.release(Outcome::Success { latency });
				} else {
					handle.release(Outcome::Failure {
						kind: ErrorKind::StreamPrematureClose,
						latency,
					});
					active
						.inputs
						.stats
						.record_error(ErrorKind::StreamPrematureClose);
					active.with(|t| {
						if let Some(a) = t.attempts.last_mut() {
							a.success = false;
							a.error = Some(ErrorKind::StreamPrematureClose);
						}
					});
				}
				active.finalize(end.success);
			};
			let body = observed_body(resp.bytes_stream(), on_end);
			return Ok(AttemptResult::Done(forward_response(status, headers, body)));
		}

		// Non-streaming: buffer the whole upstream body so the bytes are
		// preserved verbatim (and inspectable for usage accounting).
		match resp.bytes().await {
			Ok(body) => {
				let latency = attempt_start.elapsed();
				attempt.duration = latency;
				active.with(|t| t.attempts.push(attempt));
				if let Some(model) = &physical {
					inputs.pool.record_latency(model, latency);
					if let Some((input_tokens, output_tokens)) = extract_usage(&body) {
						inputs.stats.record_usage(model, input_tokens, output_tokens);
					}
				}
				handle.release(Outcome::Success { latency });
				active.finalize(true);
				Ok(AttemptResult::Done(forward_response(
					status,
					headers,
					Body::from(body),
				)))
			},
			Err(e) => {
				// The response died while we buffered it; since nothing was
				// forwarded yet this attempt is still retriable.
				let kind = classify::classify_transport(&e);
				let latency = attempt_start.elapsed();
				attempt.success = false;
				attempt.error = Some(kind);
				attempt.duration = latency;
				attempt.retry_reason = Some(kind.as_str().to_string());
				active.with(|t| t.attempts.push(attempt));
				inputs.stats.record_error(kind);
				handle.release(Outcome::Failure { kind, latency });
				Ok(AttemptResult::Retry {
					kind,
					response: None,
				})
			},
		}
	}

	fn attempt_timeout(&self, model: Option<&Strng>) -> Duration {
		let t = &self.inputs.cfg.handler.timeout;
		match t.mode {
			config::TimeoutMode::Fixed => t.fixed,
			config::TimeoutMode::Adaptive => {
				let p95 = model.and_then(|m| self.inputs.pool.p95_latency(m));
				match p95 {
					Some(p95) => p95.mul_f64(t.multiplier).clamp(t.min, t.max),
					None => t.fixed.clamp(t.min, t.max),
				}
			},
		}
	}

	fn scope_is_account(&self, headers: &HeaderMap) -> bool {
		let scope = &self.inputs.cfg.rate_limit_scope;
		headers
			.get(scope.header.as_str())
			.and_then(|v| v.to_str().ok())
			.map(|v| v.eq_ignore_ascii_case(&scope.account_value))
			.unwrap_or(false)
	}

	fn error_response(
		&self,
		kind: ErrorKind,
		upstream: Option<(StatusCode, HeaderMap, Bytes)>,
	) -> Response {
		match upstream {
			// Upstream error bodies are preserved verbatim.
			Some((status, headers, body)) => forward_response(status, headers, Body::from(body)),
			None => ProxyError::UpstreamCallFailed(kind).into_response(),
		}
	}

	fn maybe_enqueue_replay(&self, ctx: &RequestContext, trace_id: Strng, error: &str) {
		let inputs = &self.inputs;
		if !inputs.replay.enabled() {
			return;
		}
		inputs.replay.enqueue(ReplayEntry {
			trace_id,
			method: ctx.method.to_string(),
			path: ctx.path_and_query.clone(),
			headers: redact_headers(
				ctx
					.headers
					.iter()
					.filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v))),
			),
			body: ctx.body.clone(),
			original_error: error.to_string(),
			timestamp: Utc::now(),
			priority: 0,
			retry_count: 0,
			last_retry_at: None,
			status: ReplayStatus::Pending,
		});
		inputs.stats.record_replay_enqueued();
		inputs.metrics.replay_events.get_or_create(&crate::telemetry::metrics::ReplayLabels {
			event: "enqueued".into(),
		})
		.inc();
	}

	/// Re-dispatches a stored failure through the normal attempt loop.
	pub async fn replay(&self, trace_id: &str, dry_run: bool) -> Result<bool, ProxyError> {
		let entry = self.inputs.replay.begin_replay(trace_id)?;
		if dry_run {
			self.inputs.replay.abort_replay(trace_id);
			return Ok(false);
		}
		let mut headers = HeaderMap::new();
		for (name, value) in &entry.headers {
			if value == "<redacted>" {
				continue;
			}
			if let (Ok(name), Ok(value)) = (
				name.parse::<crate::http::HeaderName>(),
				value.parse::<crate::http::HeaderValue>(),
			) {
				headers.insert(name, value);
			}
		}
		let parsed: Option<serde_json::Value> = serde_json::from_slice(&entry.body).ok();
		let original_model = parsed
			.as_ref()
			.and_then(|v| v.get("model"))
			.and_then(|m| m.as_str())
			.map(str::to_string);
		let trace = RequestTrace::new(
			new_trace_id(),
			original_model.as_deref().map(strng::new).unwrap_or(strng::EMPTY),
			Duration::ZERO,
		);
		let ctx = RequestContext {
			method: entry.method.parse().unwrap_or(Method::POST),
			path_and_query: entry.path.clone(),
			token_estimate: Some(entry.body.len() as u64 / 4),
			headers,
			body: entry.body.clone(),
			original_model,
			override_model: None,
		};
		let success = match self.run_attempts(ctx, trace).await {
			Ok(resp) => resp.status().is_success(),
			Err(_) => false,
		};
		self.inputs.replay.complete_replay(trace_id, success);
		let event = if success { "succeeded" } else { "failed" };
		self
			.inputs
			.metrics
			.replay_events
			.get_or_create(&crate::telemetry::metrics::ReplayLabels {
				event: event.into(),
			})
			.inc();
		Ok(success)
	}
}

fn forward_response(status: StatusCode, mut headers: HeaderMap, body: Body) -> Response {
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
	headers.remove(header::CONTENT_LENGTH);
	let mut builder = ::http::Response::builder().status(status);
	if let Some(hm) = builder.headers_mut() {
		*hm = headers;
	}
	builder
		.body(body)
		.expect("builder with known status code should not fail")
}

/// Rewrites only the body's `model` field, byte-for-byte otherwise
/// re-serialised JSON.
fn rewrite_model(body: &Bytes, model: &str) -> Option<Bytes> {
	let mut value: serde_json::Value = serde_json::from_slice(body).ok()?;
	let obj = value.as_object_mut()?;
	obj.insert(
		"model".to_string(),
		serde_json::Value::String(model.to_string()),
	);
	serde_json::to_vec(&value).ok().map(Bytes::from)
}

fn remaining_tokens(headers: &HeaderMap) -> Option<u64> {
	headers
		.get(x_headers::X_RATELIMIT_REMAINING)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse().ok())
}

/// Anthropic responses carry usage as `{"usage":{"input_tokens":..,
/// "output_tokens":..}}`.
fn extract_usage(body: &Bytes) -> Option<(u64, u64)> {
	let value: serde_json::Value = serde_json::from_slice(body).ok()?;
	let usage = value.get("usage")?;
	Some((
		usage.get("input_tokens")?.as_u64()?,
		usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rewrite_model_touches_only_the_model_field() {
		let body = Bytes::from_static(
			br#"{"model":"claude-sonnet-4","max_tokens":100,"messages":[{"role":"user","content":"hi"}]}"#,
		);
		let out = rewrite_model(&body, "glm-4.5").unwrap();
		let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
		assert_eq!(v["model"], "glm-4.5");
		assert_eq!(v["max_tokens"], 100);
		assert_eq!(v["messages"][0]["content"], "hi");
	}

	#[test]
	fn rewrite_model_rejects_non_objects() {
		assert!(rewrite_model(&Bytes::from_static(b"[1,2]"), "x").is_none());
		assert!(rewrite_model(&Bytes::from_static(b"not json"), "x").is_none());
	}

	#[test]
	fn usage_extraction() {
		let body = Bytes::from_static(
			br#"{"id":"msg_1","usage":{"input_tokens":17,"output_tokens":42}}"#,
		);
		assert_eq!(extract_usage(&body), Some((17, 42)));
		assert_eq!(extract_usage(&Bytes::from_static(b"{}")), None);
	}

	#[test]
	fn remaining_tokens_header() {
		let mut headers = HeaderMap::new();
		headers.insert(
			x_headers::X_RATELIMIT_REMAINING,
			crate::http::HeaderValue::from_static("3"),
		);
		assert_eq!(remaining_tokens(&headers), Some(3));
	}
}
