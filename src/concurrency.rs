use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterMode {
	/// Publish the computed limit but never refuse dispatch.
	#[default]
	ObserveOnly,
	/// Refuse dispatch once a model's in-flight count reaches its limit.
	Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AdaptiveConfig {
	pub mode: LimiterMode,
	pub initial_limit: usize,
	pub min_limit: usize,
	pub max_limit: usize,
	pub increase_step: usize,
	pub decrease_factor: f64,
	/// Utilisation (inFlight / limit) required before a tick grows the limit.
	pub growth_threshold: f64,
	/// No growth until this long has passed since the last decrease.
	#[serde(with = "serde_dur")]
	pub recovery_delay: Duration,
	#[serde(with = "serde_dur")]
	pub tick_interval: Duration,
}

impl Default for AdaptiveConfig {
	fn default() -> Self {
		AdaptiveConfig {
			mode: LimiterMode::ObserveOnly,
			initial_limit: 8,
			min_limit: 1,
			max_limit: 64,
			increase_step: 1,
			decrease_factor: 0.5,
			growth_threshold: 0.8,
			recovery_delay: Duration::from_secs(10),
			tick_interval: Duration::from_secs(2),
		}
	}
}

#[derive(Debug)]
struct ModelLimiter {
	limit: usize,
	in_flight: usize,
	last_decrease_at: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterSnapshot {
	pub model: Strng,
	pub limit: usize,
	pub in_flight: usize,
}

/// Additive-increase / multiplicative-decrease concurrency control, one
/// limiter per physical model. 429s shrink the limit immediately; a
/// background tick grows it once the model has been quiet and busy.
pub struct AdaptiveLimits {
	models: Mutex<HashMap<Strng, ModelLimiter>>,
	cfg: AdaptiveConfig,
}

impl AdaptiveLimits {
	pub fn new(cfg: AdaptiveConfig) -> Self {
		AdaptiveLimits {
			models: Mutex::new(HashMap::new()),
			cfg,
		}
	}

	pub fn mode(&self) -> LimiterMode {
		self.cfg.mode
	}

	pub fn tick_interval(&self) -> Duration {
		self.cfg.tick_interval
	}

	fn with_model<R>(&self, model: &Strng, f: impl FnOnce(&mut ModelLimiter, &AdaptiveConfig) -> R) -> R {
		let mut models = self.models.lock();
		let entry = models.entry(model.clone()).or_insert_with(|| ModelLimiter {
			limit: self.cfg.initial_limit,
			in_flight: 0,
			last_decrease_at: None,
		});
		f(entry, &self.cfg)
	}

	pub fn limit(&self, model: &Strng) -> usize {
		self.with_model(model, |m, _| m.limit)
	}

	pub fn in_flight(&self, model: &Strng) -> usize {
		self.with_model(model, |m, _| m.in_flight)
	}

	/// Whether a dispatch would currently be admitted. Always true in
	/// observe-only mode.
	pub fn has_capacity(&self, model: &Strng) -> bool {
		if self.cfg.mode == LimiterMode::ObserveOnly {
			return true;
		}
		self.with_model(model, |m, _| m.in_flight < m.limit)
	}

	/// Attempts to take an in-flight slot. In observe-only mode the slot is
	/// always granted (the count is still tracked for utilisation).
	pub fn try_begin(&self, model: &Strng) -> bool {
		self.with_model(model, |m, cfg| {
			if cfg.mode == LimiterMode::Enforce && m.in_flight >= m.limit {
				return false;
			}
			m.in_flight += 1;
			true
		})
	}

	pub fn end(&self, model: &Strng) {
		self.with_model(model, |m, _| {
			m.in_flight = m.in_flight.saturating_sub(1);
		})
	}

	/// Multiplicative decrease on an observed 429.
	pub fn record_rate_limited(&self, model: &Strng) {
		self.with_model(model, |m, cfg| {
			let next = ((m.limit as f64) * cfg.decrease_factor).floor() as usize;
			m.limit = next.max(cfg.min_limit);
			m.last_decrease_at = Some(Instant::now());
			debug!(model = %model, limit = m.limit, "concurrency limit decreased");
		})
	}

	/// One additive-increase pass over every model.
	pub fn tick(&self) {
		let now = Instant::now();
		let mut models = self.models.lock();
		for (model, m) in models.iter_mut() {
			let recovered = m
				.last_decrease_at
				.map(|at| now.duration_since(at) >= self.cfg.recovery_delay)
				.unwrap_or(true);
			if !recovered || m.limit >= self.cfg.max_limit {
				continue;
			}
			let utilisation = m.in_flight as f64 / m.limit.max(1) as f64;
			if utilisation >= self.cfg.growth_threshold {
				m.limit = (m.limit + self.cfg.increase_step).min(self.cfg.max_limit);
				trace!(model = %model, limit = m.limit, "concurrency limit increased");
			}
		}
	}

	pub fn snapshot(&self) -> Vec<LimiterSnapshot> {
		let models = self.models.lock();
		let mut out: Vec<LimiterSnapshot> = models
			.iter()
			.map(|(model, m)| LimiterSnapshot {
				model: model.clone(),
				limit: m.limit,
				in_flight: m.in_flight,
			})
			.collect();
		out.sort_by(|a, b| a.model.cmp(&b.model));
		out
	}

	/// Background loop driving additive increase until drain.
	pub async fn run(self: Arc<Self>, drain: keygate_core::drain::DrainWatcher) {
		let mut interval = tokio::time::interval(self.cfg.tick_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let drained = drain.wait_for_drain();
		tokio::pin!(drained);
		loop {
			tokio::select! {
				_ = interval.tick() => self.tick(),
				_ = &mut drained => {
					debug!("adaptive concurrency loop drained");
					return;
				},
			}
		}
	}
}
