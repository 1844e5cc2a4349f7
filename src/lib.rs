pub mod app;
pub mod client;
pub mod concurrency;
pub mod config;
pub mod http;
pub mod keys;
pub mod management;
pub mod pool;
pub mod proxy;
pub mod replay;
pub mod router;
pub mod serdes;
pub mod sse;
pub mod stats;
pub mod telemetry;
pub mod trace;

pub use std::collections::{HashMap, HashSet};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use config::Config;
pub use keygate_core::prelude::*;
pub use serde::{Deserialize, Deserializer, Serialize, Serializer};
pub use serdes::{ser_millis, ser_millis_option, ser_redact, serde_dur, serde_dur_option};

use crate::client::Client;
use crate::concurrency::AdaptiveLimits;
use crate::keys::KeyManager;
use crate::pool::PoolManager;
use crate::proxy::Admission;
use crate::replay::ReplayQueue;
use crate::router::ModelRouter;
use crate::stats::StatsStore;
use crate::telemetry::metrics::Metrics;
use crate::trace::TraceStore;

/// Everything the request path needs, constructed once at startup and shared
/// by every connection.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub keys: Arc<KeyManager>,
	pub pool: Arc<PoolManager>,
	pub limits: Arc<AdaptiveLimits>,
	pub router: ModelRouter,
	pub traces: Arc<TraceStore>,
	pub replay: Arc<ReplayQueue>,
	pub stats: Arc<StatsStore>,
	pub metrics: Arc<Metrics>,
	pub upstream: Client,
	pub admission: Admission,
}
