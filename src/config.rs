use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::concurrency::AdaptiveConfig;
use crate::keys::KeysConfig;
use crate::pool::{BackoffConfig, PoolConfig};
use crate::replay::ReplayConfig;
use crate::router::RoutingConfig;
use crate::stats::StatsConfig;
use crate::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutMode {
	#[default]
	Fixed,
	Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TimeoutConfig {
	pub mode: TimeoutMode,
	#[serde(with = "serde_dur")]
	pub fixed: Duration,
	/// Adaptive mode: `clamp(multiplier * p95(model latency), min, max)`.
	pub multiplier: f64,
	#[serde(with = "serde_dur")]
	pub min: Duration,
	#[serde(with = "serde_dur")]
	pub max: Duration,
}

impl Default for TimeoutConfig {
	fn default() -> Self {
		TimeoutConfig {
			mode: TimeoutMode::Fixed,
			fixed: Duration::from_secs(120),
			multiplier: 3.0,
			min: Duration::from_secs(10),
			max: Duration::from_secs(300),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HandlerConfig {
	pub max_attempts: u32,
	/// Backoff between attempts inside one request, separate from any
	/// key or pool cooldown.
	pub retry_backoff: BackoffConfig,
	/// Bounded admission between the front-end and the attempt loop.
	pub queue_size: usize,
	pub max_body_bytes: usize,
	pub timeout: TimeoutConfig,
}

impl Default for HandlerConfig {
	fn default() -> Self {
		HandlerConfig {
			max_attempts: 3,
			retry_backoff: BackoffConfig {
				base: Duration::from_millis(250),
				cap: Duration::from_secs(5),
				jitter: 0.2,
			},
			queue_size: 512,
			max_body_bytes: 10 * 1024 * 1024,
			timeout: TimeoutConfig::default(),
		}
	}
}

/// Provider-specific predicate deciding whether a 429 was account-wide
/// rather than key-scoped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RateLimitScopeConfig {
	pub header: String,
	pub account_value: String,
}

impl Default for RateLimitScopeConfig {
	fn default() -> Self {
		RateLimitScopeConfig {
			header: "x-ratelimit-scope".to_string(),
			account_value: "account".to_string(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TracesConfig {
	pub capacity: usize,
}

impl Default for TracesConfig {
	fn default() -> Self {
		TracesConfig { capacity: 1000 }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Config {
	pub listen_addr: SocketAddr,
	pub admin_addr: SocketAddr,
	pub keys_file: PathBuf,
	/// Fallback upstream when the key file does not carry a baseUrl.
	pub base_url: String,
	/// Shared secret gating x-model-override and mutating admin operations.
	/// When unset, admin auth is disabled.
	#[serde(serialize_with = "ser_redact", skip_serializing_if = "Option::is_none")]
	pub admin_token: Option<SecretString>,
	pub handler: HandlerConfig,
	pub keys: KeysConfig,
	pub pool: PoolConfig,
	pub concurrency: AdaptiveConfig,
	pub routing: RoutingConfig,
	pub replay: ReplayConfig,
	pub stats: StatsConfig,
	pub traces: TracesConfig,
	pub client: ClientConfig,
	pub rate_limit_scope: RateLimitScopeConfig,
	#[serde(with = "serde_dur")]
	pub termination_deadline: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
			admin_addr: SocketAddr::from(([127, 0, 0, 1], 15000)),
			keys_file: PathBuf::from("api-keys.json"),
			base_url: "https://api.anthropic.com".to_string(),
			admin_token: None,
			handler: HandlerConfig::default(),
			keys: KeysConfig::default(),
			pool: PoolConfig::default(),
			concurrency: AdaptiveConfig::default(),
			routing: RoutingConfig::default(),
			replay: ReplayConfig::default(),
			stats: StatsConfig::default(),
			traces: TracesConfig::default(),
			client: ClientConfig::default(),
			rate_limit_scope: RateLimitScopeConfig::default(),
			termination_deadline: Duration::from_secs(30),
		}
	}
}

/// On-disk credential pool: `{ "keys": [...], "baseUrl": "..." }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KeyFile {
	pub keys: Vec<SecretString>,
	#[serde(default)]
	pub base_url: String,
}

pub fn load_key_file(path: &Path, fallback_base_url: &str) -> anyhow::Result<KeyFile> {
	let raw = std::fs::read_to_string(path)
		.map_err(|e| anyhow::anyhow!("reading key file {}: {e}", path.display()))?;
	let mut file: KeyFile = serde_json::from_str(&raw)
		.map_err(|e| anyhow::anyhow!("parsing key file {}: {e}", path.display()))?;
	if file.keys.is_empty() {
		anyhow::bail!("key file {} contains no keys", path.display());
	}
	if file.base_url.is_empty() {
		file.base_url = fallback_base_url.to_string();
	}
	Ok(file)
}

/// Environment override helper: empty values count as unset.
fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
	match std::env::var(env) {
		Ok(val) if !val.is_empty() => Ok(Some(
			val
				.parse()
				.map_err(|e| anyhow::anyhow!("invalid {env} ({val}): {e}"))?,
		)),
		_ => Ok(None),
	}
}

fn is_yaml(path: &Path) -> bool {
	matches!(
		path.extension().and_then(|e| e.to_str()),
		Some("yaml") | Some("yml")
	)
}

pub fn parse_config(filename: Option<PathBuf>) -> anyhow::Result<Config> {
	let mut config = match &filename {
		Some(path) => {
			let raw = std::fs::read_to_string(path)
				.map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
			let parsed = if is_yaml(path) {
				serdes::yamlviajson::from_str(&raw)
			} else {
				serde_json::from_str(&raw).map_err(Into::into)
			};
			parsed.map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?
		},
		None => Config::default(),
	};
	if let Some(addr) = parse::<SocketAddr>("LISTEN_ADDR")? {
		config.listen_addr = addr;
	}
	if let Some(addr) = parse::<SocketAddr>("ADMIN_ADDR")? {
		config.admin_addr = addr;
	}
	if let Some(path) = parse::<PathBuf>("KEYS_FILE")? {
		config.keys_file = path;
	}
	if let Some(token) = parse::<String>("ADMIN_TOKEN")? {
		config.admin_token = Some(SecretString::from(token));
	}
	config.routing.validate()?;
	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_file_parses_on_disk_format() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("api-keys.json");
		std::fs::write(
			&path,
			r#"{ "keys": ["sk-one", "sk-two"], "baseUrl": "https://open.bigmodel.cn/api/anthropic" }"#,
		)
		.unwrap();
		let file = load_key_file(&path, "https://fallback.example").unwrap();
		assert_eq!(file.keys.len(), 2);
		assert_eq!(file.base_url, "https://open.bigmodel.cn/api/anthropic");
	}

	#[test]
	fn key_file_base_url_falls_back() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("api-keys.json");
		std::fs::write(&path, r#"{ "keys": ["sk-one"] }"#).unwrap();
		let file = load_key_file(&path, "https://fallback.example").unwrap();
		assert_eq!(file.base_url, "https://fallback.example");
	}

	#[test]
	fn empty_key_file_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("api-keys.json");
		std::fs::write(&path, r#"{ "keys": [] }"#).unwrap();
		assert!(load_key_file(&path, "x").is_err());
	}

	#[test]
	fn config_defaults_round_trip() {
		let cfg = Config::default();
		let json = serde_json::to_string(&cfg).unwrap();
		let parsed: Config = serde_json::from_str(&json).unwrap();
		assert_eq!(parsed.listen_addr, cfg.listen_addr);
		assert_eq!(parsed.handler.max_attempts, cfg.handler.max_attempts);
	}

	#[test]
	fn partial_config_uses_defaults() {
		let cfg: Config =
			serde_json::from_str(r#"{ "handler": { "maxAttempts": 7 } }"#).unwrap();
		assert_eq!(cfg.handler.max_attempts, 7);
		assert_eq!(cfg.traces.capacity, 1000);
	}

	#[test]
	fn yaml_config_parses_like_json() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("keygate.yaml");
		std::fs::write(
			&path,
			concat!(
				"listenAddr: 127.0.0.1:9100\n",
				"handler:\n",
				"  maxAttempts: 5\n",
				"keys:\n",
				"  maxAcceptableLatency: 8s\n",
			),
		)
		.unwrap();
		let cfg = parse_config(Some(path)).unwrap();
		assert_eq!(cfg.listen_addr, SocketAddr::from(([127, 0, 0, 1], 9100)));
		assert_eq!(cfg.handler.max_attempts, 5);
		assert_eq!(cfg.keys.max_acceptable_latency, Duration::from_secs(8));
		// Unrecognised extensions still parse as JSON.
		let json_path = dir.path().join("keygate.conf");
		std::fs::write(&json_path, r#"{ "handler": { "maxAttempts": 2 } }"#).unwrap();
		assert_eq!(parse_config(Some(json_path)).unwrap().handler.max_attempts, 2);
	}
}
