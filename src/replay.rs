use std::collections::VecDeque;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::proxy::ProxyError;
use crate::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ReplayConfig {
	pub enabled: bool,
	pub max_queue_size: usize,
	pub max_retries: u32,
	#[serde(with = "serde_dur")]
	pub retention: Duration,
	#[serde(with = "serde_dur")]
	pub cleanup_interval: Duration,
}

impl Default for ReplayConfig {
	fn default() -> Self {
		ReplayConfig {
			enabled: false,
			max_queue_size: 100,
			max_retries: 3,
			retention: Duration::from_secs(24 * 3600),
			cleanup_interval: Duration::from_secs(300),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
	Pending,
	Replaying,
	Succeeded,
	Failed,
}

/// A failed request retained for at-least-once replay. Sensitive headers are
/// redacted before the entry is stored.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayEntry {
	pub trace_id: Strng,
	pub method: String,
	pub path: String,
	pub headers: Vec<(String, String)>,
	#[serde(skip)]
	pub body: Bytes,
	pub original_error: String,
	pub timestamp: DateTime<Utc>,
	pub priority: i32,
	pub retry_count: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_retry_at: Option<DateTime<Utc>>,
	pub status: ReplayStatus,
}

const REDACTED_HEADERS: &[&str] = &["authorization", "x-api-key", "cookie", "x-admin-token"];

pub fn redact_headers<'a>(
	headers: impl Iterator<Item = (&'a str, &'a str)>,
) -> Vec<(String, String)> {
	headers
		.map(|(name, value)| {
			let value = if REDACTED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
				"<redacted>".to_string()
			} else {
				value.to_string()
			};
			(name.to_string(), value)
		})
		.collect()
}

struct Inner {
	entries: HashMap<Strng, ReplayEntry>,
	order: VecDeque<Strng>,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayCounters {
	pub enqueued: u64,
	pub queue_full_evictions: u64,
	pub expired: u64,
	pub succeeded: u64,
	pub failed: u64,
}

/// Bounded FIFO of failed requests, keyed by trace id. Enqueue evicts the
/// oldest entry when full; a periodic sweep drops entries past retention.
pub struct ReplayQueue {
	inner: Mutex<Inner>,
	counters: Mutex<ReplayCounters>,
	cfg: ReplayConfig,
}

impl ReplayQueue {
	pub fn new(cfg: ReplayConfig) -> Self {
		ReplayQueue {
			inner: Mutex::new(Inner {
				entries: HashMap::new(),
				order: VecDeque::new(),
			}),
			counters: Mutex::new(ReplayCounters::default()),
			cfg,
		}
	}

	pub fn enabled(&self) -> bool {
		self.cfg.enabled
	}

	pub fn cleanup_interval(&self) -> Duration {
		self.cfg.cleanup_interval
	}

	pub fn enqueue(&self, entry: ReplayEntry) {
		let mut inner = self.inner.lock();
		let mut counters = self.counters.lock();
		if inner.entries.contains_key(&entry.trace_id) {
			// Re-enqueue of the same trace replaces the payload in place.
			inner.entries.insert(entry.trace_id.clone(), entry);
			return;
		}
		while inner.order.len() >= self.cfg.max_queue_size {
			if let Some(oldest) = inner.order.pop_front() {
				inner.entries.remove(&oldest);
				counters.queue_full_evictions += 1;
				warn!(trace = %oldest, "replay queue full, evicting oldest entry");
			}
		}
		counters.enqueued += 1;
		inner.order.push_back(entry.trace_id.clone());
		inner.entries.insert(entry.trace_id.clone(), entry);
	}

	/// The oldest pending entry, without removing it.
	pub fn dequeue(&self) -> Option<ReplayEntry> {
		let inner = self.inner.lock();
		inner
			.order
			.iter()
			.filter_map(|id| inner.entries.get(id))
			.find(|e| e.status == ReplayStatus::Pending)
			.cloned()
	}

	/// Transitions an entry to `replaying`, guarding against concurrent
	/// replays and retry exhaustion.
	pub fn begin_replay(&self, trace_id: &str) -> Result<ReplayEntry, ProxyError> {
		let mut inner = self.inner.lock();
		let entry = inner
			.entries
			.get_mut(trace_id)
			.ok_or(ProxyError::ReplayNotFound)?;
		match entry.status {
			ReplayStatus::Replaying => return Err(ProxyError::ReplayInProgress),
			ReplayStatus::Succeeded | ReplayStatus::Failed => {
				return Err(ProxyError::ReplayNotFound);
			},
			ReplayStatus::Pending => {},
		}
		entry.status = ReplayStatus::Replaying;
		entry.retry_count += 1;
		entry.last_retry_at = Some(Utc::now());
		Ok(entry.clone())
	}

	/// Records the result of a replay attempt. Non-final failures return the
	/// entry to `pending`; the last permitted attempt moves it to `failed`.
	pub fn complete_replay(&self, trace_id: &str, success: bool) {
		let mut inner = self.inner.lock();
		let Some(entry) = inner.entries.get_mut(trace_id) else {
			return;
		};
		if entry.status != ReplayStatus::Replaying {
			return;
		}
		let mut counters = self.counters.lock();
		entry.status = if success {
			counters.succeeded += 1;
			ReplayStatus::Succeeded
		} else if entry.retry_count >= self.cfg.max_retries {
			counters.failed += 1;
			ReplayStatus::Failed
		} else {
			ReplayStatus::Pending
		};
	}

	/// Returns an interrupted replay to `pending` without consuming a retry
	/// outcome (used for dry runs).
	pub fn abort_replay(&self, trace_id: &str) {
		let mut inner = self.inner.lock();
		if let Some(entry) = inner.entries.get_mut(trace_id)
			&& entry.status == ReplayStatus::Replaying
		{
			entry.status = ReplayStatus::Pending;
			entry.retry_count = entry.retry_count.saturating_sub(1);
		}
	}

	/// Drops entries older than the retention period.
	pub fn cleanup(&self) -> usize {
		let cutoff = chrono::TimeDelta::from_std(self.cfg.retention)
			.ok()
			.and_then(|d| Utc::now().checked_sub_signed(d));
		let Some(cutoff) = cutoff else { return 0 };
		let mut inner = self.inner.lock();
		let expired: Vec<Strng> = inner
			.entries
			.iter()
			.filter(|(_, e)| e.timestamp < cutoff && e.status != ReplayStatus::Replaying)
			.map(|(id, _)| id.clone())
			.collect();
		let Inner { entries, order } = &mut *inner;
		for id in &expired {
			entries.remove(id);
		}
		order.retain(|id| entries.contains_key(id));
		let n = expired.len();
		if n > 0 {
			self.counters.lock().expired += n as u64;
			info!(expired = n, "replay retention sweep");
		}
		n
	}

	pub fn len(&self) -> usize {
		self.inner.lock().order.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().order.is_empty()
	}

	pub fn counters(&self) -> ReplayCounters {
		self.counters.lock().clone()
	}

	/// Entries in FIFO order, for the admin API.
	pub fn snapshot(&self) -> Vec<ReplayEntry> {
		let inner = self.inner.lock();
		inner
			.order
			.iter()
			.filter_map(|id| inner.entries.get(id))
			.cloned()
			.collect()
	}

	/// Background sweep until drain.
	pub async fn run_cleanup(self: Arc<Self>, drain: keygate_core::drain::DrainWatcher) {
		let mut interval = tokio::time::interval(self.cfg.cleanup_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let drained = drain.wait_for_drain();
		tokio::pin!(drained);
		loop {
			tokio::select! {
				_ = interval.tick() => { self.cleanup(); },
				_ = &mut drained => return,
			}
		}
	}
}
