use std::time::Duration;

/// Fixed-capacity ring of observed latencies. Push is O(1); percentile sorts
/// a copy, which is fine at the capacities we use (a few hundred samples).
#[derive(Debug, Clone)]
pub struct LatencyRing {
	samples: Vec<Duration>,
	capacity: usize,
	next: usize,
	filled: bool,
}

impl LatencyRing {
	pub fn new(capacity: usize) -> Self {
		LatencyRing {
			samples: Vec::with_capacity(capacity.max(1)),
			capacity: capacity.max(1),
			next: 0,
			filled: false,
		}
	}

	pub fn push(&mut self, sample: Duration) {
		if self.samples.len() < self.capacity {
			self.samples.push(sample);
		} else {
			self.samples[self.next] = sample;
			self.filled = true;
		}
		self.next = (self.next + 1) % self.capacity;
	}

	pub fn len(&self) -> usize {
		self.samples.len()
	}

	pub fn is_empty(&self) -> bool {
		self.samples.is_empty()
	}

	/// The `ceil(p * n) - 1`-th smallest of the retained samples.
	pub fn percentile(&self, p: f64) -> Option<Duration> {
		if self.samples.is_empty() {
			return None;
		}
		let mut sorted = self.samples.clone();
		sorted.sort_unstable();
		let n = sorted.len();
		let rank = (p * n as f64).ceil() as usize;
		Some(sorted[rank.clamp(1, n) - 1])
	}

	pub fn p50(&self) -> Option<Duration> {
		self.percentile(0.50)
	}

	pub fn p95(&self) -> Option<Duration> {
		self.percentile(0.95)
	}

	pub fn p99(&self) -> Option<Duration> {
		self.percentile(0.99)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ms(v: u64) -> Duration {
		Duration::from_millis(v)
	}

	#[test]
	fn empty_ring_has_no_percentiles() {
		let ring = LatencyRing::new(8);
		assert!(ring.is_empty());
		assert_eq!(ring.percentile(0.95), None);
	}

	#[test]
	fn percentile_rank_is_ceil_minus_one() {
		let mut ring = LatencyRing::new(100);
		for v in 1..=10 {
			ring.push(ms(v * 10));
		}
		// ceil(0.95 * 10) - 1 = 9 -> the largest sample
		assert_eq!(ring.p95(), Some(ms(100)));
		// ceil(0.5 * 10) - 1 = 4 -> the 5th smallest
		assert_eq!(ring.p50(), Some(ms(50)));
		assert_eq!(ring.percentile(1.0), Some(ms(100)));
	}

	#[test]
	fn overwrites_oldest_when_full() {
		let mut ring = LatencyRing::new(4);
		for v in [10, 20, 30, 40, 500, 600] {
			ring.push(ms(v));
		}
		assert_eq!(ring.len(), 4);
		// 10 and 20 have been evicted.
		assert_eq!(ring.percentile(1.0), Some(ms(600)));
		assert_eq!(ring.percentile(0.25), Some(ms(30)));
	}
}
