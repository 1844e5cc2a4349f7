use keygate_core::metrics::DefaultedUnknown;
use keygate_core::strng::RichStrng;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::Strng;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub outcome: RichStrng,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct AttemptLabels {
	pub model: DefaultedUnknown<RichStrng>,
	pub result: RichStrng,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ReplayLabels {
	pub event: RichStrng,
}

#[derive(Debug)]
pub struct Metrics {
	pub requests: Family<RequestLabels, Counter>,
	pub attempts: Family<AttemptLabels, Counter>,
	pub queue_depth: Gauge,
	pub queue_rejections: Counter,
	pub keys_available: Gauge,
	pub replay_events: Family<ReplayLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests = Family::default();
		registry.register(
			"requests",
			"Requests handled, by terminal outcome",
			requests.clone(),
		);
		let attempts = Family::default();
		registry.register(
			"upstream_attempts",
			"Upstream dispatch attempts, by model and result",
			attempts.clone(),
		);
		let queue_depth = Gauge::default();
		registry.register(
			"request_queue_depth",
			"Requests currently admitted and in flight",
			queue_depth.clone(),
		);
		let queue_rejections = Counter::default();
		registry.register(
			"request_queue_rejections",
			"Requests rejected because the admission queue was full",
			queue_rejections.clone(),
		);
		let keys_available = Gauge::default();
		registry.register(
			"keys_available",
			"Keys currently eligible for selection",
			keys_available.clone(),
		);
		let replay_events = Family::default();
		registry.register(
			"replay_events",
			"Replay queue events",
			replay_events.clone(),
		);
		Metrics {
			requests,
			attempts,
			queue_depth,
			queue_rejections,
			keys_available,
			replay_events,
		}
	}

	pub fn record_attempt(&self, model: Option<&Strng>, result: &str) {
		self
			.attempts
			.get_or_create(&AttemptLabels {
				model: model.cloned().map(RichStrng::from).into(),
				result: result.into(),
			})
			.inc();
	}

	pub fn record_request_outcome(&self, outcome: &str) {
		self
			.requests
			.get_or_create(&RequestLabels {
				outcome: outcome.into(),
			})
			.inc();
	}
}
