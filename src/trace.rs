use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;

use crate::keys::SelectionReason;
use crate::proxy::ErrorKind;
use crate::router::RouteDecision;
use crate::*;

pub fn new_trace_id() -> Strng {
	let mut bytes = [0u8; 16];
	rand::rng().fill_bytes(&mut bytes);
	strng::new(&hex::encode(bytes))
}

/// One dispatch of the request to one upstream with one key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
	pub key_index: usize,
	pub key_id: Strng,
	pub model: Strng,
	pub started_at: DateTime<Utc>,
	#[serde(serialize_with = "ser_millis")]
	pub duration: Duration,
	pub success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorKind>,
	pub selection_reason: SelectionReason,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub retry_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTrace {
	pub trace_id: Strng,
	pub start_time: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub end_time: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub success: Option<bool>,
	pub original_model: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mapped_model: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tenant: Option<Strng>,
	pub attempts: Vec<Attempt>,
	#[serde(serialize_with = "ser_millis")]
	pub queue_duration: Duration,
	#[serde(serialize_with = "ser_millis_option")]
	pub total_duration: Option<Duration>,
	pub streaming: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream_started_at: Option<DateTime<Utc>>,
	pub client_disconnect: bool,
	/// What the router would have chosen, when running in shadow mode.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub shadow_decision: Option<RouteDecision>,
}

impl RequestTrace {
	pub fn new(trace_id: Strng, original_model: Strng, queue_duration: Duration) -> Self {
		RequestTrace {
			trace_id,
			start_time: Utc::now(),
			end_time: None,
			success: None,
			original_model,
			mapped_model: None,
			tenant: None,
			attempts: Vec::new(),
			queue_duration,
			total_duration: None,
			streaming: false,
			stream_started_at: None,
			client_disconnect: false,
			shadow_decision: None,
		}
	}

	pub fn finalize(&mut self, success: bool, started: Instant) {
		self.end_time = Some(Utc::now());
		self.success = Some(success);
		self.total_duration = Some(started.elapsed());
	}

	pub fn has_retries(&self) -> bool {
		self.attempts.len() > 1
	}
}

#[derive(Debug, Default, Clone)]
pub struct TraceQuery {
	pub since: Option<DateTime<Utc>>,
	pub min_duration: Option<Duration>,
	pub model: Option<String>,
	pub success: Option<bool>,
	pub has_retries: Option<bool>,
}

/// Bounded ring of the most recent traces. Small enough that queries are a
/// linear scan over a locked copy.
pub struct TraceStore {
	inner: Mutex<VecDeque<Arc<RequestTrace>>>,
	capacity: usize,
}

impl TraceStore {
	pub fn new(capacity: usize) -> Self {
		TraceStore {
			inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
			capacity: capacity.max(1),
		}
	}

	pub fn push(&self, trace: RequestTrace) {
		let mut inner = self.inner.lock();
		if inner.len() >= self.capacity {
			inner.pop_front();
		}
		inner.push_back(Arc::new(trace));
	}

	pub fn get(&self, trace_id: &str) -> Option<Arc<RequestTrace>> {
		self
			.inner
			.lock()
			.iter()
			.rev()
			.find(|t| t.trace_id.as_str() == trace_id)
			.cloned()
	}

	pub fn query(&self, q: &TraceQuery) -> Vec<Arc<RequestTrace>> {
		let inner = self.inner.lock();
		inner
			.iter()
			.rev()
			.filter(|t| {
				if let Some(since) = q.since
					&& t.start_time < since
				{
					return false;
				}
				if let Some(min) = q.min_duration
					&& t.total_duration.map(|d| d < min).unwrap_or(true)
				{
					return false;
				}
				if let Some(model) = &q.model {
					let matches_mapped = t.mapped_model.as_ref().map(|m| m.as_str() == model);
					if t.original_model.as_str() != model && matches_mapped != Some(true) {
						return false;
					}
				}
				if let Some(success) = q.success
					&& t.success != Some(success)
				{
					return false;
				}
				if let Some(has_retries) = q.has_retries
					&& t.has_retries() != has_retries
				{
					return false;
				}
				true
			})
			.cloned()
			.collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}

	/// The most recent traces, newest first, for the dashboard stream.
	pub fn recent(&self, n: usize) -> Vec<Arc<RequestTrace>> {
		self.inner.lock().iter().rev().take(n).cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::keys::SelectionReason;

	fn trace(id: &str, model: &str, success: bool, attempts: usize, total_ms: u64) -> RequestTrace {
		let mut t = RequestTrace::new(strng::new(id), strng::new(model), Duration::ZERO);
		for _ in 0..attempts {
			t.attempts.push(Attempt {
				key_index: 0,
				key_id: strng::new("abcd1234"),
				model: strng::new("glm-4.5"),
				started_at: Utc::now(),
				duration: Duration::from_millis(total_ms / attempts.max(1) as u64),
				success,
				status: Some(if success { 200 } else { 500 }),
				error: (!success).then_some(ErrorKind::ServerError),
				selection_reason: SelectionReason::Weighted,
				retry_reason: None,
			});
		}
		t.success = Some(success);
		t.end_time = Some(Utc::now());
		t.total_duration = Some(Duration::from_millis(total_ms));
		t
	}

	#[test]
	fn ring_evicts_oldest() {
		let store = TraceStore::new(3);
		for i in 0..5 {
			store.push(trace(&format!("t{i}"), "claude-sonnet-4", true, 1, 100));
		}
		assert_eq!(store.len(), 3);
		assert!(store.get("t0").is_none());
		assert!(store.get("t4").is_some());
	}

	#[test]
	fn query_filters_compose() {
		let store = TraceStore::new(100);
		store.push(trace("a", "claude-sonnet-4", true, 1, 50));
		store.push(trace("b", "claude-sonnet-4", false, 3, 900));
		store.push(trace("c", "claude-haiku-3", true, 2, 400));

		let failures = store.query(&TraceQuery {
			success: Some(false),
			..Default::default()
		});
		assert_eq!(failures.len(), 1);
		assert_eq!(failures[0].trace_id.as_str(), "b");

		let retried = store.query(&TraceQuery {
			has_retries: Some(true),
			..Default::default()
		});
		assert_eq!(retried.len(), 2);

		let slow = store.query(&TraceQuery {
			min_duration: Some(Duration::from_millis(300)),
			model: Some("claude-haiku-3".to_string()),
			..Default::default()
		});
		assert_eq!(slow.len(), 1);
		assert_eq!(slow[0].trace_id.as_str(), "c");
	}

	#[test]
	fn attempt_durations_fit_inside_total() {
		let t = trace("a", "claude-sonnet-4", false, 3, 900);
		let sum: Duration = t.attempts.iter().map(|a| a.duration).sum();
		assert!(sum <= t.total_duration.unwrap());
	}
}
