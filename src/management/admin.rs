use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use chrono::{DateTime, Utc};
use keygate_core::readiness::Ready;
use keygate_core::signal::ShutdownTrigger;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::config::load_key_file;
use crate::proxy::RequestHandler;
use crate::router::RoutingConfig;
use crate::trace::TraceQuery;
use crate::*;

#[derive(Clone)]
pub struct AdminState {
	pub inputs: Arc<ProxyInputs>,
	pub handler: RequestHandler,
	pub registry: Arc<Registry>,
	pub ready: Ready,
	pub shutdown: ShutdownTrigger,
}

pub fn router(state: AdminState) -> Router {
	Router::new()
		.route("/health", get(handle_health))
		.route("/stats", get(handle_stats))
		.route("/traces", get(handle_traces))
		.route("/traces/{id}", get(handle_trace_detail))
		.route("/dashboard/stream", get(super::dashboard::handle_stream))
		.route("/model-routing", get(handle_routing_get).put(handle_routing_put))
		.route("/model-routing/enable-safe", put(handle_routing_enable_safe))
		.route("/reload", post(handle_reload))
		.route("/replay", get(handle_replay_list))
		.route("/replay/{id}", post(handle_replay_trigger))
		.route("/keys/{index}/exclude", post(handle_key_exclude))
		.route("/keys/{index}/include", post(handle_key_include))
		.route("/metrics", get(handle_metrics))
		.route("/logging", post(handle_logging))
		.route("/quitquitquit", post(handle_shutdown))
		.layer(CorsLayer::permissive())
		.with_state(state)
}

/// Mutating operations require the shared admin token when one is
/// configured.
fn authorize(state: &AdminState, headers: &axum::http::HeaderMap) -> Result<(), Response> {
	let Some(expected) = &state.inputs.cfg.admin_token else {
		return Ok(());
	};
	let presented = headers
		.get(crate::http::x_headers::X_ADMIN_TOKEN)
		.and_then(|v| v.to_str().ok());
	if presented == Some(expected.expose_secret()) {
		Ok(())
	} else {
		Err((StatusCode::UNAUTHORIZED, "admin token required\n").into_response())
	}
}

async fn handle_health(State(state): State<AdminState>) -> Response {
	let keys = state.inputs.keys.snapshot();
	let available = keys.keys.iter().filter(|k| k.eligible).count();
	let ready = state.ready.is_ready();
	let status = if ready && available > 0 { "ok" } else { "degraded" };
	let body = serde_json::json!({
		"status": status,
		"ready": ready,
		"pendingTasks": state.ready.pending(),
		"keys": {
			"total": keys.keys.len(),
			"available": available,
			"detail": keys.keys,
		},
	});
	axum::Json(body).into_response()
}

async fn handle_stats(State(state): State<AdminState>) -> Response {
	let inputs = &state.inputs;
	let body = serde_json::json!({
		"totals": inputs.stats.totals(),
		"errorsByKind": inputs.stats.errors_by_kind(),
		"keys": inputs.keys.snapshot(),
		"models": inputs.pool.snapshot(),
		"concurrency": inputs.limits.snapshot(),
		"usage": inputs.stats.usage(),
		"estimatedCost": inputs.stats.estimated_cost(),
		"queue": {
			"depth": inputs.admission.depth(),
			"capacity": inputs.admission.capacity(),
		},
		"replay": inputs.replay.counters(),
	});
	axum::Json(body).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceParams {
	since: Option<DateTime<Utc>>,
	min_duration_ms: Option<u64>,
	model: Option<String>,
	success: Option<bool>,
	has_retries: Option<bool>,
	limit: Option<usize>,
}

async fn handle_traces(
	State(state): State<AdminState>,
	Query(params): Query<TraceParams>,
) -> Response {
	let query = TraceQuery {
		since: params.since,
		min_duration: params.min_duration_ms.map(Duration::from_millis),
		model: params.model,
		success: params.success,
		has_retries: params.has_retries,
	};
	let mut traces = state.inputs.traces.query(&query);
	traces.truncate(params.limit.unwrap_or(100));
	axum::Json(traces).into_response()
}

async fn handle_trace_detail(
	State(state): State<AdminState>,
	Path(id): Path<String>,
) -> Response {
	match state.inputs.traces.get(&id) {
		Some(trace) => axum::Json(trace).into_response(),
		None => (StatusCode::NOT_FOUND, "trace not found\n").into_response(),
	}
}

async fn handle_routing_get(State(state): State<AdminState>) -> Response {
	axum::Json(state.inputs.router.config().as_ref().clone()).into_response()
}

async fn handle_routing_put(
	State(state): State<AdminState>,
	headers: axum::http::HeaderMap,
	axum::Json(cfg): axum::Json<RoutingConfig>,
) -> Response {
	if let Err(resp) = authorize(&state, &headers) {
		return resp;
	}
	match state.inputs.router.update_config(cfg) {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(e) => (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response(),
	}
}

async fn handle_routing_enable_safe(
	State(state): State<AdminState>,
	headers: axum::http::HeaderMap,
) -> Response {
	if let Err(resp) = authorize(&state, &headers) {
		return resp;
	}
	match state.inputs.router.update_config(RoutingConfig::safe()) {
		Ok(()) => axum::Json(state.inputs.router.config().as_ref().clone()).into_response(),
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")).into_response(),
	}
}

async fn handle_reload(
	State(state): State<AdminState>,
	headers: axum::http::HeaderMap,
) -> Response {
	if let Err(resp) = authorize(&state, &headers) {
		return resp;
	}
	let cfg = &state.inputs.cfg;
	match load_key_file(&cfg.keys_file, &cfg.base_url) {
		Ok(file) => {
			state.inputs.keys.reload(&file);
			let snap = state.inputs.keys.snapshot();
			axum::Json(serde_json::json!({
				"keys": snap.keys.len(),
				"baseUrl": snap.base_url,
			}))
			.into_response()
		},
		Err(e) => {
			warn!("key reload failed: {e:#}");
			(StatusCode::BAD_REQUEST, format!("{e}\n")).into_response()
		},
	}
}

async fn handle_replay_list(State(state): State<AdminState>) -> Response {
	axum::Json(serde_json::json!({
		"counters": state.inputs.replay.counters(),
		"entries": state.inputs.replay.snapshot(),
	}))
	.into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplayParams {
	#[serde(default)]
	dry_run: bool,
}

async fn handle_replay_trigger(
	State(state): State<AdminState>,
	Path(id): Path<String>,
	headers: axum::http::HeaderMap,
	Query(params): Query<ReplayParams>,
) -> Response {
	if let Err(resp) = authorize(&state, &headers) {
		return resp;
	}
	match state.handler.replay(&id, params.dry_run).await {
		Ok(success) => axum::Json(serde_json::json!({
			"traceId": id,
			"dryRun": params.dry_run,
			"success": success,
		}))
		.into_response(),
		Err(e) => e.into_response(),
	}
}

async fn handle_key_exclude(
	State(state): State<AdminState>,
	Path(index): Path<usize>,
	headers: axum::http::HeaderMap,
) -> Response {
	if let Err(resp) = authorize(&state, &headers) {
		return resp;
	}
	set_exclusion(&state, index, true)
}

async fn handle_key_include(
	State(state): State<AdminState>,
	Path(index): Path<usize>,
	headers: axum::http::HeaderMap,
) -> Response {
	if let Err(resp) = authorize(&state, &headers) {
		return resp;
	}
	set_exclusion(&state, index, false)
}

fn set_exclusion(state: &AdminState, index: usize, excluded: bool) -> Response {
	if state.inputs.keys.set_manual_exclusion(index, excluded) {
		StatusCode::NO_CONTENT.into_response()
	} else {
		(StatusCode::NOT_FOUND, "no such key\n").into_response()
	}
}

async fn handle_metrics(State(state): State<AdminState>) -> Response {
	let mut buffer = String::new();
	match encode(&mut buffer, state.registry.as_ref()) {
		Ok(()) => (
			[(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
			buffer,
		)
			.into_response(),
		Err(e) => {
			error!("error encoding metrics: {e:?}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		},
	}
}

#[derive(Debug, Default, Deserialize)]
struct LoggingParams {
	level: Option<String>,
	reset: Option<String>,
}

async fn handle_logging(Query(params): Query<LoggingParams>) -> Response {
	let reset = params.reset.is_some();
	let level = params.level.unwrap_or_default();
	if !reset && level.is_empty() {
		return match crate::telemetry::log::get_current_loglevel() {
			Ok(current) => (StatusCode::OK, format!("current log level is {current}\n")).into_response(),
			Err(e) => (
				StatusCode::INTERNAL_SERVER_ERROR,
				format!("failed to get the log level: {e}\n"),
			)
				.into_response(),
		};
	}
	match crate::telemetry::log::set_level(reset, &level) {
		Ok(applied) => (StatusCode::OK, format!("log level set to {applied}\n")).into_response(),
		Err(e) => (StatusCode::BAD_REQUEST, format!("invalid level {level}: {e}\n")).into_response(),
	}
}

async fn handle_shutdown(
	State(state): State<AdminState>,
	headers: axum::http::HeaderMap,
) -> Response {
	if let Err(resp) = authorize(&state, &headers) {
		return resp;
	}
	state.shutdown.shutdown_now().await;
	(StatusCode::OK, "shutdown now\n").into_response()
}
