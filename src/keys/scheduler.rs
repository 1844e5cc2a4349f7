use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use super::{KeyState, KeysConfig};
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
	Weighted,
	RoundRobin,
	Fallback,
	Forced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ScoreWeights {
	pub latency: f64,
	pub success: f64,
	pub recency: f64,
}

impl Default for ScoreWeights {
	fn default() -> Self {
		ScoreWeights {
			latency: 40.0,
			success: 40.0,
			recency: 20.0,
		}
	}
}

/// Picks one key out of the eligible subset. Weighted sampling over the
/// composite health score by default; strict round-robin when weighted
/// selection is disabled; lowest in-flight when the scores don't
/// discriminate.
pub fn select(
	eligible: &[Arc<KeyState>],
	cfg: &KeysConfig,
	rr: &AtomicUsize,
	now: Instant,
) -> Option<(Arc<KeyState>, SelectionReason)> {
	match eligible {
		[] => None,
		[only] => Some((only.clone(), SelectionReason::Forced)),
		_ if !cfg.use_weighted_selection => {
			let n = rr.fetch_add(1, Ordering::Relaxed);
			Some((eligible[n % eligible.len()].clone(), SelectionReason::RoundRobin))
		},
		_ => {
			let scored: Vec<(Arc<KeyState>, f64)> = eligible
				.iter()
				.map(|k| (k.clone(), k.health_score(cfg, now)))
				.collect();
			let max = scored.iter().map(|(_, s)| *s).fold(0.0f64, f64::max);
			let min = scored.iter().map(|(_, s)| *s).fold(100.0f64, f64::min);
			if max <= f64::EPSILON || (max - min) < 1e-6 {
				// Scores carry no signal; fall back to the least loaded key.
				let key = scored
					.iter()
					.min_by_key(|(k, _)| k.in_flight())
					.map(|(k, _)| k.clone())?;
				return Some((key, SelectionReason::Fallback));
			}
			scored
				.choose_weighted(&mut rand::rng(), |(_, score)| *score)
				.ok()
				.map(|(k, _)| (k.clone(), SelectionReason::Weighted))
		},
	}
}

/// Composite health score in [0, 100]:
/// a latency term (p95 normalised against the acceptable maximum), a success
/// ratio term, and a recency term that recovers as the last error ages.
pub fn health_score(
	weights: &ScoreWeights,
	p95: Option<Duration>,
	max_acceptable: Duration,
	successes: u64,
	total: u64,
	time_since_last_error: Option<Duration>,
	half_life: Duration,
) -> f64 {
	let latency_norm = match p95 {
		Some(p) => (p.as_secs_f64() / max_acceptable.as_secs_f64().max(f64::EPSILON)).clamp(0.0, 1.0),
		None => 0.0,
	};
	let success_ratio = if total == 0 {
		1.0
	} else {
		successes as f64 / total as f64
	};
	let recency = match time_since_last_error {
		None => 1.0,
		Some(t) => {
			let hl = half_life.as_secs_f64().max(f64::EPSILON);
			1.0 - 0.5f64.powf(t.as_secs_f64() / hl)
		},
	};
	weights.latency * (1.0 - latency_norm) + weights.success * success_ratio + weights.recency * recency
}

#[cfg(test)]
mod tests {
	use super::*;

	const HL: Duration = Duration::from_secs(60);
	const MAX: Duration = Duration::from_secs(10);

	#[test]
	fn fresh_key_scores_full_marks() {
		let w = ScoreWeights::default();
		let score = health_score(&w, None, MAX, 0, 0, None, HL);
		assert!((score - 100.0).abs() < 1e-9);
	}

	#[test]
	fn slow_keys_lose_latency_weight() {
		let w = ScoreWeights::default();
		let fast = health_score(&w, Some(Duration::from_millis(100)), MAX, 10, 10, None, HL);
		let slow = health_score(&w, Some(Duration::from_secs(10)), MAX, 10, 10, None, HL);
		assert!(fast > slow);
		// A fully saturated p95 zeroes the latency term.
		assert!((slow - 60.0).abs() < 1e-9);
	}

	#[test]
	fn recent_errors_suppress_recency_weight() {
		let w = ScoreWeights::default();
		let just_failed = health_score(&w, None, MAX, 5, 10, Some(Duration::ZERO), HL);
		let recovered = health_score(&w, None, MAX, 5, 10, Some(Duration::from_secs(3600)), HL);
		assert!(just_failed < recovered);
		// At exactly one half-life the recency term is worth half its weight.
		let halfway = health_score(&w, None, MAX, 5, 10, Some(HL), HL);
		assert!((halfway - (40.0 + 20.0 + 10.0)).abs() < 1e-6);
	}

	#[test]
	fn score_stays_in_range() {
		let w = ScoreWeights::default();
		for (p95, s, t, since) in [
			(None, 0, 0, None),
			(Some(Duration::from_secs(100)), 0, 100, Some(Duration::ZERO)),
			(Some(Duration::from_millis(1)), 100, 100, None),
		] {
			let score = health_score(&w, p95, MAX, s, t, since, HL);
			assert!((0.0..=100.0).contains(&score), "score {score} out of range");
		}
	}
}
