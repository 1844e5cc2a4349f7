pub mod breaker;
pub mod ring;
pub mod scheduler;

use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
pub use scheduler::{ScoreWeights, SelectionReason};
use self::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use self::ring::LatencyRing;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::KeyFile;
use crate::pool::{BackoffConfig, backoff};
use crate::proxy::{ErrorKind, ProxyError};
use crate::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct KeysConfig {
	pub breaker: BreakerConfig,
	/// Backoff applied to a key after a 429, indexed by the burst counter.
	pub cooldown: BackoffConfig,
	/// The burst counter resets after this long without a 429.
	#[serde(with = "serde_dur")]
	pub cooldown_decay: Duration,
	pub latency_window: usize,
	/// p95 above this scores zero on the latency term.
	#[serde(with = "serde_dur")]
	pub max_acceptable_latency: Duration,
	#[serde(with = "serde_dur")]
	pub recency_half_life: Duration,
	pub weights: ScoreWeights,
	pub use_weighted_selection: bool,
}

impl Default for KeysConfig {
	fn default() -> Self {
		KeysConfig {
			breaker: BreakerConfig::default(),
			cooldown: BackoffConfig {
				base: Duration::from_secs(1),
				cap: Duration::from_secs(60),
				jitter: 0.2,
			},
			cooldown_decay: Duration::from_secs(120),
			latency_window: 200,
			max_acceptable_latency: Duration::from_secs(10),
			recency_half_life: Duration::from_secs(60),
			weights: ScoreWeights::default(),
			use_weighted_selection: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExcludedReason {
	CircuitBreaker,
	RateLimit,
	HighLatency,
	Manual,
	AccountLevel429,
	None,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyCounters {
	pub total: u64,
	pub successes: u64,
	pub failures: u64,
	pub rate_limited: u64,
	pub last_error: Option<ErrorKind>,
}

#[derive(Debug)]
struct KeyInner {
	counters: KeyCounters,
	latency: LatencyRing,
	breaker: CircuitBreaker,
	cooldown_until: Option<Instant>,
	consecutive_429s: u32,
	last_429_at: Option<Instant>,
	last_failure_at: Option<Instant>,
	last_success_at: Option<Instant>,
	/// Explicit exclusion: account-level 429 (timed) or manual (until
	/// re-included). Circuit and cooldown exclusions are derived state.
	excluded: Option<(ExcludedReason, Option<Instant>)>,
}

/// One credential and everything we know about it. Shared via Arc so a hot
/// reload never invalidates state held by in-flight requests.
#[derive(Debug)]
pub struct KeyState {
	index: AtomicUsize,
	pub id: Strng,
	secret: SecretString,
	in_flight: AtomicUsize,
	inner: Mutex<KeyInner>,
}

/// The terminal outcome of one attempt on one key.
#[derive(Debug)]
pub enum Outcome {
	Success { latency: Duration },
	Failure { kind: ErrorKind, latency: Duration },
	/// Client went away; latency is recorded but the key is not penalised.
	Disconnect { latency: Duration },
}

impl KeyState {
	fn new(index: usize, secret: SecretString, cfg: &KeysConfig) -> Arc<Self> {
		let id = key_id(&secret);
		Arc::new(KeyState {
			index: AtomicUsize::new(index),
			id,
			secret,
			in_flight: AtomicUsize::new(0),
			inner: Mutex::new(KeyInner {
				counters: KeyCounters::default(),
				latency: LatencyRing::new(cfg.latency_window),
				breaker: CircuitBreaker::new(cfg.breaker.clone()),
				cooldown_until: None,
				consecutive_429s: 0,
				last_429_at: None,
				last_failure_at: None,
				last_success_at: None,
				excluded: None,
			}),
		})
	}

	pub fn index(&self) -> usize {
		self.index.load(Ordering::Relaxed)
	}

	pub fn in_flight(&self) -> usize {
		self.in_flight.load(Ordering::Relaxed)
	}

	pub fn secret(&self) -> &SecretString {
		&self.secret
	}

	fn is_eligible(&self, now: Instant, attempted: &HashSet<usize>) -> bool {
		if attempted.contains(&self.index()) {
			return false;
		}
		let inner = self.inner.lock();
		if let Some(until) = inner.cooldown_until
			&& now < until
		{
			return false;
		}
		if let Some((_, until)) = inner.excluded {
			match until {
				Some(until) if now >= until => {},
				_ => return false,
			}
		}
		inner.breaker.would_allow(now)
	}

	pub fn health_score(&self, cfg: &KeysConfig, now: Instant) -> f64 {
		let inner = self.inner.lock();
		let since_error = inner.last_failure_at.map(|at| now.duration_since(at));
		scheduler::health_score(
			&cfg.weights,
			inner.latency.p95(),
			cfg.max_acceptable_latency,
			inner.counters.successes,
			inner.counters.total,
			since_error,
			cfg.recency_half_life,
		)
	}

	fn release(&self, outcome: &Outcome, cooldown: &BackoffConfig, decay: Duration) {
		let now = Instant::now();
		let mut inner = self.inner.lock();
		inner.counters.total += 1;
		match outcome {
			Outcome::Success { latency } => {
				inner.counters.successes += 1;
				inner.latency.push(*latency);
				inner.last_success_at = Some(now);
				inner.consecutive_429s = 0;
				inner.breaker.record_success(now);
				// A timed exclusion that has run out is cleared on success.
				if let Some((_, Some(until))) = inner.excluded
					&& now >= until
				{
					inner.excluded = None;
				}
			},
			Outcome::Failure { kind, .. } => {
				inner.counters.last_error = Some(*kind);
				inner.last_failure_at = Some(now);
				if kind.cools_key() {
					inner.counters.rate_limited += 1;
					if let Some(last) = inner.last_429_at
						&& now.duration_since(last) > decay
					{
						inner.consecutive_429s = 0;
					}
					inner.consecutive_429s += 1;
					inner.last_429_at = Some(now);
					let delay = backoff(cooldown, inner.consecutive_429s);
					let until = now + delay;
					inner.cooldown_until = Some(match inner.cooldown_until {
						Some(existing) if existing > until => existing,
						_ => until,
					});
					if *kind == ErrorKind::RateLimitedAccount {
						inner.excluded = Some((ExcludedReason::AccountLevel429, Some(until)));
					}
					// A 429 aborts a half-open probe without re-opening.
					inner.breaker.release_probe();
				} else if kind.opens_circuit() {
					inner.counters.failures += 1;
					inner.breaker.record_failure(now);
				} else if *kind == ErrorKind::AuthError {
					inner.counters.failures += 1;
					inner.excluded = Some((ExcludedReason::Manual, None));
					inner.breaker.release_probe();
				} else {
					inner.counters.failures += 1;
					inner.breaker.release_probe();
				}
			},
			Outcome::Disconnect { latency } => {
				inner.latency.push(*latency);
				inner.breaker.release_probe();
			},
		}
	}

	fn snapshot(&self, cfg: &KeysConfig, now: Instant) -> KeySnapshot {
		let score = self.health_score(cfg, now);
		let inner = self.inner.lock();
		let cooldown_remaining = inner
			.cooldown_until
			.and_then(|until| until.checked_duration_since(now));
		let circuit = inner.breaker.state();
		let excluded_reason = if let Some((reason, until)) = inner.excluded {
			match until {
				Some(until) if now >= until => ExcludedReason::None,
				_ => reason,
			}
		} else if circuit == CircuitState::Open {
			ExcludedReason::CircuitBreaker
		} else if cooldown_remaining.is_some() {
			ExcludedReason::RateLimit
		} else if inner
			.latency
			.p95()
			.map(|p| p > cfg.max_acceptable_latency)
			.unwrap_or(false)
		{
			ExcludedReason::HighLatency
		} else {
			ExcludedReason::None
		};
		let eligible = matches!(
			excluded_reason,
			ExcludedReason::None | ExcludedReason::HighLatency
		) && inner.breaker.would_allow(now);
		KeySnapshot {
			index: self.index(),
			id: self.id.clone(),
			in_flight: self.in_flight(),
			counters: inner.counters.clone(),
			circuit,
			cooldown_remaining,
			excluded_reason,
			eligible,
			p50_latency: inner.latency.p50(),
			p95_latency: inner.latency.p95(),
			health_score: score,
		}
	}
}

fn key_id(secret: &SecretString) -> Strng {
	let digest = ::ring::digest::digest(&::ring::digest::SHA256, secret.expose_secret().as_bytes());
	strng::new(&hex::encode(&digest.as_ref()[..4]))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySnapshot {
	pub index: usize,
	pub id: Strng,
	pub in_flight: usize,
	#[serde(flatten)]
	pub counters: KeyCounters,
	pub circuit: CircuitState,
	#[serde(serialize_with = "ser_millis_option")]
	pub cooldown_remaining: Option<Duration>,
	pub excluded_reason: ExcludedReason,
	pub eligible: bool,
	#[serde(serialize_with = "ser_millis_option")]
	pub p50_latency: Option<Duration>,
	#[serde(serialize_with = "ser_millis_option")]
	pub p95_latency: Option<Duration>,
	pub health_score: f64,
}

struct KeyPool {
	keys: Vec<Arc<KeyState>>,
	base_url: Strng,
}

/// Owns the credential pool: selection, in-flight accounting, cooldowns and
/// hot reload. Selection itself is delegated to the scheduler.
pub struct KeyManager {
	pool: ArcSwap<KeyPool>,
	cfg: KeysConfig,
	rr: AtomicUsize,
}

/// A successfully acquired key. Dropping the handle without an explicit
/// release counts as a client disconnect: the slot is returned and latency
/// recorded, with no effect on health.
#[derive(Debug)]
pub struct KeyHandle {
	state: Arc<KeyState>,
	cooldown: BackoffConfig,
	cooldown_decay: Duration,
	pub reason: SelectionReason,
	pub acquired_at: Instant,
	released: bool,
}

impl KeyHandle {
	pub fn index(&self) -> usize {
		self.state.index()
	}

	pub fn id(&self) -> Strng {
		self.state.id.clone()
	}

	pub fn secret(&self) -> &SecretString {
		self.state.secret()
	}

	pub fn release(mut self, outcome: Outcome) {
		self.released = true;
		self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
		self
			.state
			.release(&outcome, &self.cooldown, self.cooldown_decay);
	}

	/// Returns the slot without recording anything (the attempt was never
	/// dispatched, e.g. admission was refused after selection).
	pub fn release_unused(mut self) {
		self.released = true;
		self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
		self.state.inner.lock().breaker.release_probe();
	}
}

impl Drop for KeyHandle {
	fn drop(&mut self) {
		if !self.released {
			self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
			self.state.release(
				&Outcome::Disconnect {
					latency: self.acquired_at.elapsed(),
				},
				&self.cooldown,
				self.cooldown_decay,
			);
		}
	}
}

impl KeyManager {
	pub fn new(cfg: KeysConfig, file: &KeyFile) -> Self {
		let keys = file
			.keys
			.iter()
			.enumerate()
			.map(|(i, secret)| KeyState::new(i, secret.clone(), &cfg))
			.collect();
		KeyManager {
			pool: ArcSwap::from_pointee(KeyPool {
				keys,
				base_url: strng::new(&file.base_url),
			}),
			cfg,
			rr: AtomicUsize::new(0),
		}
	}

	pub fn base_url(&self) -> Strng {
		self.pool.load().base_url.clone()
	}

	pub fn key_count(&self) -> usize {
		self.pool.load().keys.len()
	}

	pub fn available_count(&self) -> usize {
		let now = Instant::now();
		let empty = HashSet::new();
		self
			.pool
			.load()
			.keys
			.iter()
			.filter(|k| k.is_eligible(now, &empty))
			.count()
	}

	/// Picks one eligible key and takes an in-flight slot on it.
	pub fn acquire(&self, attempted: &HashSet<usize>) -> Result<KeyHandle, ProxyError> {
		let pool = self.pool.load();
		let now = Instant::now();
		let mut eligible: Vec<Arc<KeyState>> = pool
			.keys
			.iter()
			.filter(|k| k.is_eligible(now, attempted))
			.cloned()
			.collect();
		// A candidate can lose its half-open probe slot between scoring and
		// acquisition; retry against the remaining set.
		while !eligible.is_empty() {
			let Some((key, reason)) = scheduler::select(&eligible, &self.cfg, &self.rr, now) else {
				break;
			};
			if key.inner.lock().breaker.can_attempt(now) {
				key.in_flight.fetch_add(1, Ordering::Relaxed);
				trace!(key = %key.id, reason = ?reason, "key acquired");
				return Ok(KeyHandle {
					state: key,
					cooldown: self.cfg.cooldown,
					cooldown_decay: self.cfg.cooldown_decay,
					reason,
					acquired_at: now,
					released: false,
				});
			}
			eligible.retain(|k| !Arc::ptr_eq(k, &key));
		}
		Err(ProxyError::NoHealthyKey)
	}

	/// Hot-replaces the pool. Keys whose secret is unchanged keep their state
	/// (counters, circuit, in-flight); removed keys live on until their last
	/// in-flight request releases its handle.
	pub fn reload(&self, file: &KeyFile) {
		let old = self.pool.load();
		let keys: Vec<Arc<KeyState>> = file
			.keys
			.iter()
			.enumerate()
			.map(|(i, secret)| {
				match old
					.keys
					.iter()
					.find(|k| k.secret.expose_secret() == secret.expose_secret())
				{
					Some(existing) => {
						existing.index.store(i, Ordering::Relaxed);
						existing.clone()
					},
					None => KeyState::new(i, secret.clone(), &self.cfg),
				}
			})
			.collect();
		info!(
			keys = keys.len(),
			base_url = %file.base_url,
			"key pool reloaded"
		);
		self.pool.store(Arc::new(KeyPool {
			keys,
			base_url: strng::new(&file.base_url),
		}));
	}

	/// Manually excludes or re-includes a key, e.g. from the admin API.
	pub fn set_manual_exclusion(&self, index: usize, excluded: bool) -> bool {
		let pool = self.pool.load();
		let Some(key) = pool.keys.get(index) else {
			return false;
		};
		let mut inner = key.inner.lock();
		inner.excluded = excluded.then_some((ExcludedReason::Manual, None));
		true
	}

	/// Seeds counters from a persisted stats snapshot, matched by key id.
	pub fn apply_persisted(&self, counters: &HashMap<Strng, crate::stats::PersistedKey>) {
		let pool = self.pool.load();
		for key in &pool.keys {
			if let Some(saved) = counters.get(&key.id) {
				let mut inner = key.inner.lock();
				inner.counters.total = saved.total;
				inner.counters.successes = saved.successes;
				inner.counters.failures = saved.failures;
				inner.counters.rate_limited = saved.rate_limited;
			}
		}
	}

	pub fn snapshot(&self) -> PoolSnapshot {
		let now = Instant::now();
		let pool = self.pool.load();
		PoolSnapshot {
			base_url: pool.base_url.clone(),
			keys: pool.keys.iter().map(|k| k.snapshot(&self.cfg, now)).collect(),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
	pub base_url: Strng,
	pub keys: Vec<KeySnapshot>,
}
