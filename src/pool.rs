use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::keys::ring::LatencyRing;
use crate::*;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BackoffConfig {
	#[serde(with = "serde_dur")]
	pub base: Duration,
	#[serde(with = "serde_dur")]
	pub cap: Duration,
	pub jitter: f64,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		BackoffConfig {
			base: Duration::from_secs(1),
			cap: Duration::from_secs(60),
			jitter: 0.2,
		}
	}
}

/// Exponential backoff with symmetric jitter:
/// `min(base * 2^(attempt-1), cap) * (1 + U(-jitter, +jitter))`.
pub fn backoff(cfg: &BackoffConfig, attempt: u32) -> Duration {
	let exp = attempt.saturating_sub(1).min(32);
	let raw = cfg
		.base
		.saturating_mul(1u32 << exp.min(31))
		.min(cfg.cap);
	if cfg.jitter <= 0.0 {
		return raw;
	}
	let factor = 1.0 + rand::rng().random_range(-cfg.jitter..=cfg.jitter);
	raw.mul_f64(factor.max(0.0))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PoolConfig {
	pub backoff: BackoffConfig,
	/// The consecutive-429 counter resets after this long without a hit.
	#[serde(with = "serde_dur")]
	pub hit_decay: Duration,
	/// Pacing engages when the upstream advertises this many remaining
	/// rate-limit tokens or fewer.
	pub remaining_threshold: u64,
	#[serde(with = "serde_dur")]
	pub pacing_delay: Duration,
	/// Latency samples retained per model for the adaptive timeout.
	pub latency_window: usize,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			backoff: BackoffConfig {
				base: Duration::from_secs(2),
				cap: Duration::from_secs(120),
				jitter: 0.2,
			},
			hit_decay: Duration::from_secs(120),
			remaining_threshold: 5,
			pacing_delay: Duration::from_millis(500),
			latency_window: 200,
		}
	}
}

#[derive(Debug)]
struct ModelEntry {
	cooldown_until: Option<Instant>,
	consecutive_429s: u32,
	last_hit: Option<Instant>,
	pacing: Option<Duration>,
	latency: LatencyRing,
}

impl ModelEntry {
	fn new(latency_window: usize) -> Self {
		ModelEntry {
			cooldown_until: None,
			consecutive_429s: 0,
			last_hit: None,
			pacing: None,
			latency: LatencyRing::new(latency_window),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPoolSnapshot {
	pub model: Strng,
	#[serde(serialize_with = "ser_millis_option")]
	pub cooldown_remaining: Option<Duration>,
	pub consecutive429s: u32,
	#[serde(serialize_with = "ser_millis_option")]
	pub pacing_delay: Option<Duration>,
	#[serde(serialize_with = "ser_millis_option")]
	pub p95_latency: Option<Duration>,
	pub available: bool,
}

/// Per-upstream-model rate-limit state. A separate "global" entry covers
/// account-wide 429s that are not attributable to a single model.
pub struct PoolManager {
	models: Mutex<HashMap<Strng, ModelEntry>>,
	global: Mutex<ModelEntry>,
	cfg: PoolConfig,
}

impl PoolManager {
	pub fn new(cfg: PoolConfig) -> Self {
		let window = cfg.latency_window;
		PoolManager {
			models: Mutex::new(HashMap::new()),
			global: Mutex::new(ModelEntry::new(window)),
			cfg,
		}
	}

	fn with_entry<R>(&self, model: Option<&Strng>, f: impl FnOnce(&mut ModelEntry, &PoolConfig) -> R) -> R {
		match model {
			Some(m) => {
				let mut models = self.models.lock();
				let entry = models
					.entry(m.clone())
					.or_insert_with(|| ModelEntry::new(self.cfg.latency_window));
				f(entry, &self.cfg)
			},
			None => f(&mut self.global.lock(), &self.cfg),
		}
	}

	/// Records a 429 for the model (or the account when `model` is None),
	/// bumping the decaying consecutive counter and extending the cooldown.
	/// Cooldowns only ever move forward within a burst.
	pub fn record_rate_limit_hit(&self, model: Option<&Strng>) -> Duration {
		let now = Instant::now();
		self.with_entry(model, |entry, cfg| {
			if let Some(last) = entry.last_hit
				&& now.duration_since(last) > cfg.hit_decay
			{
				entry.consecutive_429s = 0;
			}
			entry.consecutive_429s += 1;
			entry.last_hit = Some(now);
			let delay = backoff(&cfg.backoff, entry.consecutive_429s);
			let until = now + delay;
			entry.cooldown_until = Some(match entry.cooldown_until {
				Some(existing) if existing > until => existing,
				_ => until,
			});
			delay
		})
	}

	/// A success clears the burst counter (the cooldown, if any, still runs
	/// out on its own).
	pub fn clear_rate_limit(&self, model: &Strng) {
		let mut models = self.models.lock();
		if let Some(entry) = models.get_mut(model) {
			entry.consecutive_429s = 0;
			entry.last_hit = None;
		}
	}

	/// Engages pacing when the upstream advertises few remaining tokens.
	pub fn record_rate_limit_headers(&self, model: &Strng, remaining: Option<u64>) {
		self.with_entry(Some(model), |entry, cfg| {
			entry.pacing = match remaining {
				Some(r) if r <= cfg.remaining_threshold => Some(cfg.pacing_delay),
				_ => None,
			};
		})
	}

	pub fn cooldown_remaining(&self, model: Option<&Strng>) -> Option<Duration> {
		let now = Instant::now();
		let check = |entry: &ModelEntry| {
			entry
				.cooldown_until
				.and_then(|until| until.checked_duration_since(now))
		};
		match model {
			Some(m) => self.models.lock().get(m).and_then(check),
			None => check(&self.global.lock()),
		}
	}

	/// A model is available when neither it nor the account is cooling down.
	pub fn is_available(&self, model: &Strng) -> bool {
		self.cooldown_remaining(Some(model)).is_none() && self.cooldown_remaining(None).is_none()
	}

	pub fn pacing_delay(&self, model: &Strng) -> Option<Duration> {
		self.models.lock().get(model).and_then(|e| e.pacing)
	}

	pub fn record_latency(&self, model: &Strng, latency: Duration) {
		self.with_entry(Some(model), |entry, _| entry.latency.push(latency));
	}

	pub fn p95_latency(&self, model: &Strng) -> Option<Duration> {
		self.models.lock().get(model).and_then(|e| e.latency.p95())
	}

	pub fn snapshot(&self) -> Vec<ModelPoolSnapshot> {
		let now = Instant::now();
		let models = self.models.lock();
		let mut out: Vec<ModelPoolSnapshot> = models
			.iter()
			.map(|(model, entry)| {
				let cooldown = entry
					.cooldown_until
					.and_then(|until| until.checked_duration_since(now));
				ModelPoolSnapshot {
					model: model.clone(),
					cooldown_remaining: cooldown,
					consecutive429s: entry.consecutive_429s,
					pacing_delay: entry.pacing,
					p95_latency: entry.latency.p95(),
					available: cooldown.is_none(),
				}
			})
			.collect();
		out.sort_by(|a, b| a.model.cmp(&b.model));
		out
	}
}
