use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::serdes::serde_dur;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BreakerConfig {
	/// Error ratio over the sliding window at which the circuit opens.
	pub error_threshold: f64,
	/// Minimum calls in the window before the ratio is meaningful.
	pub min_calls: usize,
	#[serde(with = "serde_dur")]
	pub window: Duration,
	#[serde(with = "serde_dur")]
	pub open_duration: Duration,
	/// Cap for the doubling applied after a failed half-open probe.
	#[serde(with = "serde_dur")]
	pub max_open_duration: Duration,
}

impl Default for BreakerConfig {
	fn default() -> Self {
		BreakerConfig {
			error_threshold: 0.5,
			min_calls: 5,
			window: Duration::from_secs(10),
			open_duration: Duration::from_secs(30),
			max_open_duration: Duration::from_secs(300),
		}
	}
}

#[derive(Debug, Clone)]
struct CallRecord {
	at: Instant,
	failure: bool,
}

/// Per-key three-state circuit breaker. Failures counted here are only the
/// kinds the taxonomy marks circuit-eligible; 429s and auth errors have their
/// own handling and never trip the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
	state: State,
	records: VecDeque<CallRecord>,
	current_open_duration: Duration,
	cfg: BreakerConfig,
}

#[derive(Debug)]
enum State {
	Closed,
	Open { until: Instant },
	HalfOpen { probe_in_flight: bool },
}

impl CircuitBreaker {
	pub fn new(cfg: BreakerConfig) -> Self {
		CircuitBreaker {
			state: State::Closed,
			records: VecDeque::new(),
			current_open_duration: cfg.open_duration,
			cfg,
		}
	}

	pub fn state(&self) -> CircuitState {
		match self.state {
			State::Closed => CircuitState::Closed,
			State::Open { .. } => CircuitState::Open,
			State::HalfOpen { .. } => CircuitState::HalfOpen,
		}
	}

	/// Whether a new attempt may be dispatched on this key. In the open state
	/// this flips to half-open once the open period has elapsed, admitting a
	/// single probe.
	pub fn can_attempt(&mut self, now: Instant) -> bool {
		match &mut self.state {
			State::Closed => true,
			State::Open { until } => {
				if now >= *until {
					self.state = State::HalfOpen {
						probe_in_flight: true,
					};
					true
				} else {
					false
				}
			},
			State::HalfOpen { probe_in_flight } => {
				if *probe_in_flight {
					false
				} else {
					*probe_in_flight = true;
					true
				}
			},
		}
	}

	pub fn record_success(&mut self, now: Instant) {
		match self.state {
			State::HalfOpen { .. } => {
				// Probe succeeded: fully reset.
				self.records.clear();
				self.current_open_duration = self.cfg.open_duration;
				self.state = State::Closed;
			},
			State::Closed => {
				self.push_record(now, false);
			},
			State::Open { .. } => {},
		}
	}

	pub fn record_failure(&mut self, now: Instant) {
		match self.state {
			State::HalfOpen { .. } => {
				// Probe failed: back to open, with a longer period.
				self.current_open_duration =
					(self.current_open_duration * 2).min(self.cfg.max_open_duration);
				self.state = State::Open {
					until: now + self.current_open_duration,
				};
			},
			State::Closed => {
				self.push_record(now, true);
				let (total, failures) = self.window_stats(now);
				if total >= self.cfg.min_calls
					&& failures as f64 / total as f64 >= self.cfg.error_threshold
				{
					self.state = State::Open {
						until: now + self.current_open_duration,
					};
				}
			},
			State::Open { .. } => {},
		}
	}

	/// Releases a half-open probe slot without an outcome (client went away
	/// before the attempt resolved). The next selection may probe again.
	pub fn release_probe(&mut self) {
		if let State::HalfOpen { probe_in_flight } = &mut self.state {
			*probe_in_flight = false;
		}
	}

	/// Non-mutating eligibility check used while scoring candidates; the
	/// open→half-open transition itself happens in `can_attempt`.
	pub fn would_allow(&self, now: Instant) -> bool {
		match &self.state {
			State::Closed => true,
			State::Open { until } => now >= *until,
			State::HalfOpen { probe_in_flight } => !probe_in_flight,
		}
	}

	fn push_record(&mut self, now: Instant, failure: bool) {
		self.records.push_back(CallRecord { at: now, failure });
		self.evict(now);
	}

	fn evict(&mut self, now: Instant) {
		while let Some(front) = self.records.front() {
			if now.duration_since(front.at) > self.cfg.window {
				self.records.pop_front();
			} else {
				break;
			}
		}
	}

	fn window_stats(&mut self, now: Instant) -> (usize, usize) {
		self.evict(now);
		let failures = self.records.iter().filter(|r| r.failure).count();
		(self.records.len(), failures)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn breaker() -> CircuitBreaker {
		CircuitBreaker::new(BreakerConfig::default())
	}

	#[test]
	fn opens_after_error_ratio_in_window() {
		let mut cb = breaker();
		let now = Instant::now();
		for _ in 0..5 {
			assert!(cb.can_attempt(now));
			cb.record_failure(now);
		}
		assert_eq!(cb.state(), CircuitState::Open);
		assert!(!cb.can_attempt(now));
	}

	#[test]
	fn successes_keep_ratio_below_threshold() {
		let mut cb = breaker();
		let now = Instant::now();
		for _ in 0..8 {
			cb.record_success(now);
		}
		for _ in 0..4 {
			cb.record_failure(now);
		}
		// 4 failures / 12 calls = 0.33 < 0.5
		assert_eq!(cb.state(), CircuitState::Closed);
	}

	#[test]
	fn half_open_probe_success_closes_and_resets() {
		let mut cb = breaker();
		let start = Instant::now();
		for _ in 0..5 {
			cb.record_failure(start);
		}
		assert_eq!(cb.state(), CircuitState::Open);

		let after = start + Duration::from_secs(31);
		assert!(cb.can_attempt(after), "one probe after openDuration");
		assert_eq!(cb.state(), CircuitState::HalfOpen);
		// No second concurrent probe.
		assert!(!cb.can_attempt(after));

		cb.record_success(after);
		assert_eq!(cb.state(), CircuitState::Closed);
		// Counters were reset; a single failure must not re-open.
		cb.record_failure(after);
		assert_eq!(cb.state(), CircuitState::Closed);
	}

	#[test]
	fn half_open_probe_failure_doubles_open_duration() {
		let mut cb = breaker();
		let start = Instant::now();
		for _ in 0..5 {
			cb.record_failure(start);
		}
		let probe_at = start + Duration::from_secs(31);
		assert!(cb.can_attempt(probe_at));
		cb.record_failure(probe_at);
		assert_eq!(cb.state(), CircuitState::Open);
		// Doubled to 60s: still open at +59s, half-open at +61s.
		assert!(!cb.can_attempt(probe_at + Duration::from_secs(59)));
		assert!(cb.can_attempt(probe_at + Duration::from_secs(61)));
	}

	#[test]
	fn stale_records_fall_out_of_the_window() {
		let mut cb = breaker();
		let start = Instant::now();
		for _ in 0..4 {
			cb.record_failure(start);
		}
		// A burst of old failures followed by fresh ones outside the window
		// must not open the circuit.
		let later = start + Duration::from_secs(11);
		cb.record_failure(later);
		assert_eq!(cb.state(), CircuitState::Closed);
	}
}
