use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::keys::KeyManager;
use crate::proxy::ErrorKind;
use crate::*;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct StatsConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub persist_path: Option<PathBuf>,
	#[serde(with = "serde_dur")]
	pub persist_interval: Duration,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pricing_file: Option<PathBuf>,
}

impl Default for StatsConfig {
	fn default() -> Self {
		StatsConfig {
			persist_path: None,
			persist_interval: Duration::from_secs(60),
			pricing_file: None,
		}
	}
}

/// Per-model price points, `$ per 1k tokens`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelPrice {
	pub input_per1k: f64,
	pub output_per1k: f64,
}

pub type Pricing = HashMap<Strng, ModelPrice>;

pub fn load_pricing(path: &Path) -> anyhow::Result<Pricing> {
	let raw = std::fs::read_to_string(path)?;
	Ok(serde_json::from_str(&raw)?)
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Totals {
	pub requests: u64,
	pub successes: u64,
	pub failures: u64,
	pub retries: u64,
	pub streamed: u64,
	pub client_disconnects: u64,
	pub replays_enqueued: u64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelUsage {
	pub requests: u64,
	pub input_tokens: u64,
	pub output_tokens: u64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedKey {
	pub total: u64,
	pub successes: u64,
	pub failures: u64,
	pub rate_limited: u64,
}

/// On-disk snapshot. A newer schemaVersion is tolerated best-effort: known
/// fields load, unknown fields are ignored.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedStats {
	pub schema_version: u32,
	pub keys: HashMap<Strng, PersistedKey>,
	pub totals: Totals,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_updated: Option<DateTime<Utc>>,
	#[serde(flatten)]
	pub unknown: HashMap<String, serde_json::Value>,
}

/// Aggregate counters shared by the handler, the admin API and the
/// dashboard. Key-level state lives in the key manager; this store holds
/// what isn't attributable to a single key object lifetime.
pub struct StatsStore {
	totals: Mutex<Totals>,
	errors_by_kind: Mutex<HashMap<ErrorKind, u64>>,
	usage: Mutex<HashMap<Strng, ModelUsage>>,
	pricing: Pricing,
	cfg: StatsConfig,
}

impl StatsStore {
	pub fn new(cfg: StatsConfig) -> anyhow::Result<Self> {
		let pricing = match &cfg.pricing_file {
			Some(path) => load_pricing(path)?,
			None => Pricing::new(),
		};
		Ok(StatsStore {
			totals: Mutex::new(Totals::default()),
			errors_by_kind: Mutex::new(HashMap::new()),
			usage: Mutex::new(HashMap::new()),
			pricing,
			cfg,
		})
	}

	pub fn persist_interval(&self) -> Duration {
		self.cfg.persist_interval
	}

	pub fn record_request(&self, success: bool, attempts: usize, streamed: bool) {
		let mut totals = self.totals.lock();
		totals.requests += 1;
		if success {
			totals.successes += 1;
		} else {
			totals.failures += 1;
		}
		totals.retries += attempts.saturating_sub(1) as u64;
		if streamed {
			totals.streamed += 1;
		}
	}

	pub fn record_disconnect(&self) {
		self.totals.lock().client_disconnects += 1;
	}

	pub fn record_replay_enqueued(&self) {
		self.totals.lock().replays_enqueued += 1;
	}

	pub fn record_error(&self, kind: ErrorKind) {
		*self.errors_by_kind.lock().entry(kind).or_insert(0) += 1;
	}

	pub fn record_usage(&self, model: &Strng, input_tokens: u64, output_tokens: u64) {
		let mut usage = self.usage.lock();
		let entry = usage.entry(model.clone()).or_default();
		entry.requests += 1;
		entry.input_tokens += input_tokens;
		entry.output_tokens += output_tokens;
	}

	pub fn totals(&self) -> Totals {
		self.totals.lock().clone()
	}

	pub fn errors_by_kind(&self) -> HashMap<String, u64> {
		self
			.errors_by_kind
			.lock()
			.iter()
			.map(|(k, v)| (k.as_str().to_string(), *v))
			.collect()
	}

	pub fn usage(&self) -> HashMap<Strng, ModelUsage> {
		self.usage.lock().clone()
	}

	/// Estimated spend per model from observed usage and the pricing table.
	pub fn estimated_cost(&self) -> HashMap<Strng, f64> {
		let usage = self.usage.lock();
		usage
			.iter()
			.filter_map(|(model, u)| {
				let price = self.pricing.get(model)?;
				let cost = u.input_tokens as f64 / 1000.0 * price.input_per1k
					+ u.output_tokens as f64 / 1000.0 * price.output_per1k;
				Some((model.clone(), cost))
			})
			.collect()
	}

	pub fn to_persisted(&self, keys: &KeyManager) -> PersistedStats {
		let key_counters = keys
			.snapshot()
			.keys
			.into_iter()
			.map(|k| {
				(
					k.id,
					PersistedKey {
						total: k.counters.total,
						successes: k.counters.successes,
						failures: k.counters.failures,
						rate_limited: k.counters.rate_limited,
					},
				)
			})
			.collect();
		PersistedStats {
			schema_version: SCHEMA_VERSION,
			keys: key_counters,
			totals: self.totals(),
			last_updated: Some(Utc::now()),
			unknown: HashMap::new(),
		}
	}

	pub fn save(&self, keys: &KeyManager) -> anyhow::Result<()> {
		let Some(path) = &self.cfg.persist_path else {
			return Ok(());
		};
		let snapshot = self.to_persisted(keys);
		let tmp = path.with_extension("tmp");
		std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
		std::fs::rename(&tmp, path)?;
		debug!(path = %path.display(), "stats snapshot persisted");
		Ok(())
	}

	/// Loads a previously persisted snapshot and seeds totals and per-key
	/// counters from it. Missing file is not an error.
	pub fn load(&self, keys: &KeyManager) -> anyhow::Result<()> {
		let Some(path) = &self.cfg.persist_path else {
			return Ok(());
		};
		let raw = match std::fs::read_to_string(path) {
			Ok(raw) => raw,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e.into()),
		};
		let persisted: PersistedStats = serde_json::from_str(&raw)?;
		if persisted.schema_version > SCHEMA_VERSION {
			warn!(
				found = persisted.schema_version,
				supported = SCHEMA_VERSION,
				"stats snapshot is from a newer version; loading best-effort"
			);
		}
		*self.totals.lock() = persisted.totals;
		keys.apply_persisted(&persisted.keys);
		info!(path = %path.display(), "stats snapshot loaded");
		Ok(())
	}

	/// Periodic persistence until drain; a final save happens at shutdown.
	pub async fn run_persist(
		self: Arc<Self>,
		keys: Arc<KeyManager>,
		drain: keygate_core::drain::DrainWatcher,
	) {
		if self.cfg.persist_path.is_none() {
			return;
		}
		let mut interval = tokio::time::interval(self.cfg.persist_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let drained = drain.wait_for_drain();
		tokio::pin!(drained);
		loop {
			tokio::select! {
				_ = interval.tick() => {
					if let Err(e) = self.save(&keys) {
						warn!("failed to persist stats: {e:#}");
					}
				},
				_ = &mut drained => {
					if let Err(e) = self.save(&keys) {
						warn!("failed to persist stats at shutdown: {e:#}");
					}
					return;
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use secrecy::SecretString;

	use super::*;
	use crate::config::KeyFile;
	use crate::keys::KeysConfig;

	fn key_manager() -> KeyManager {
		KeyManager::new(
			KeysConfig::default(),
			&KeyFile {
				keys: vec![SecretString::from("sk-a".to_string())],
				base_url: "https://api.example.com".to_string(),
			},
		)
	}

	#[test]
	fn persist_then_load_round_trips_counters() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("stats.json");
		let cfg = StatsConfig {
			persist_path: Some(path.clone()),
			..Default::default()
		};

		let keys = key_manager();
		let store = StatsStore::new(cfg.clone()).unwrap();
		store.record_request(true, 1, false);
		store.record_request(false, 3, false);
		{
			let h = keys.acquire(&HashSet::new()).unwrap();
			h.release(crate::keys::Outcome::Success {
				latency: Duration::from_millis(42),
			});
		}
		store.save(&keys).unwrap();

		let keys2 = key_manager();
		let store2 = StatsStore::new(cfg).unwrap();
		store2.load(&keys2).unwrap();
		let totals = store2.totals();
		assert_eq!(totals.requests, 2);
		assert_eq!(totals.retries, 2);
		let snap = keys2.snapshot();
		assert_eq!(snap.keys[0].counters.total, 1);
		assert_eq!(snap.keys[0].counters.successes, 1);
	}

	#[test]
	fn newer_schema_loads_best_effort() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("stats.json");
		std::fs::write(
			&path,
			serde_json::json!({
				"schemaVersion": 2,
				"keys": {},
				"totals": { "requests": 7 },
				"futureField": { "x": 1 },
			})
			.to_string(),
		)
		.unwrap();
		let store = StatsStore::new(StatsConfig {
			persist_path: Some(path),
			..Default::default()
		})
		.unwrap();
		let keys = key_manager();
		store.load(&keys).unwrap();
		assert_eq!(store.totals().requests, 7);
	}

	#[test]
	fn cost_estimation_uses_pricing() {
		let store = StatsStore::new(StatsConfig::default()).unwrap();
		let mut store = store;
		store.pricing.insert(
			strng::new("glm-4.5"),
			ModelPrice {
				input_per1k: 0.5,
				output_per1k: 1.5,
			},
		);
		let model = strng::new("glm-4.5");
		store.record_usage(&model, 2000, 1000);
		let cost = store.estimated_cost();
		assert!((cost[&model] - (1.0 + 1.5)).abs() < 1e-9);
	}

	#[test]
	fn missing_snapshot_is_not_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let store = StatsStore::new(StatsConfig {
			persist_path: Some(dir.path().join("absent.json")),
			..Default::default()
		})
		.unwrap();
		store.load(&key_manager()).unwrap();
	}
}
