use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde::Serialize;

use super::admin::AdminState;
use crate::*;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);
const RECENT_TRACES: usize = 20;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionEvent {
	server: &'static str,
	version: &'static str,
	now: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KpiEvent {
	totals: crate::stats::Totals,
	keys: crate::keys::PoolSnapshot,
	models: Vec<crate::pool::ModelPoolSnapshot>,
	concurrency: Vec<crate::concurrency::LimiterSnapshot>,
	queue_depth: usize,
	queue_capacity: usize,
	replay: crate::replay::ReplayCounters,
}

fn json_event(name: &str, data: &impl Serialize) -> Event {
	match serde_json::to_string(data) {
		Ok(json) => Event::default().event(name).data(json),
		Err(e) => Event::default()
			.event("error")
			.data(format!("{{\"message\":\"{e}\"}}")),
	}
}

/// Server-Sent Events feed of point-in-time snapshots: one `connection`
/// event on subscribe, then `kpis` and `requests` every interval. This is
/// the dashboard's entire contract with the core.
pub async fn handle_stream(
	State(state): State<AdminState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
	let stream = async_stream::stream! {
		yield Ok(json_event(
			"connection",
			&ConnectionEvent {
				server: "keygate",
				version: env!("CARGO_PKG_VERSION"),
				now: chrono::Utc::now(),
			},
		));
		let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
		loop {
			interval.tick().await;
			let inputs = &state.inputs;
			yield Ok(json_event(
				"kpis",
				&KpiEvent {
					totals: inputs.stats.totals(),
					keys: inputs.keys.snapshot(),
					models: inputs.pool.snapshot(),
					concurrency: inputs.limits.snapshot(),
					queue_depth: inputs.admission.depth(),
					queue_capacity: inputs.admission.capacity(),
					replay: inputs.replay.counters(),
				},
			));
			yield Ok(json_event("requests", &inputs.traces.recent(RECENT_TRACES)));
		}
	};
	Sse::new(stream).keep_alive(KeepAlive::default())
}
