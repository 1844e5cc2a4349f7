use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::concurrency::AdaptiveLimits;
use crate::pool::PoolManager;
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierName {
	Light,
	Medium,
	Heavy,
}

impl std::fmt::Display for TierName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			TierName::Light => "light",
			TierName::Medium => "medium",
			TierName::Heavy => "heavy",
		})
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierStrategy {
	#[default]
	RoundRobin,
	/// Least in-flight first.
	Balanced,
	FirstAvailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Tier {
	pub targets: Vec<Strng>,
	#[serde(default)]
	pub strategy: TierStrategy,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TokenRange {
	#[serde(default)]
	pub min: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max: Option<u64>,
}

impl TokenRange {
	fn contains(&self, estimate: u64) -> bool {
		estimate >= self.min && self.max.map(|max| estimate <= max).unwrap_or(true)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteRule {
	/// Wildcard or exact match on the client-requested model.
	pub model: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token_range: Option<TokenRange>,
	pub tier: TierName,
}

impl RouteRule {
	fn matches(&self, model: &str, token_estimate: Option<u64>) -> bool {
		if !wildcard_match(&self.model, model) {
			return false;
		}
		match (&self.token_range, token_estimate) {
			(Some(range), Some(estimate)) => range.contains(estimate),
			(Some(_), None) => false,
			(None, _) => true,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RoutingConfig {
	pub enabled: bool,
	/// Record the decision that would have been made, but route nothing.
	pub shadow_mode: bool,
	pub rules: Vec<RouteRule>,
	pub tiers: HashMap<TierName, Tier>,
}

impl Default for RoutingConfig {
	fn default() -> Self {
		RoutingConfig {
			enabled: true,
			shadow_mode: false,
			rules: Vec::new(),
			tiers: HashMap::new(),
		}
	}
}

impl RoutingConfig {
	/// Conservative defaults used by the enable-safe admin operation: shadow
	/// mode on, catch-all only.
	pub fn safe() -> Self {
		RoutingConfig {
			enabled: true,
			shadow_mode: true,
			..Default::default()
		}
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		for rule in &self.rules {
			if rule.model.is_empty() {
				anyhow::bail!("rule has empty model pattern");
			}
			if rule.model != "*" && !self.tiers.contains_key(&rule.tier) {
				anyhow::bail!("rule for {:?} references undefined tier {}", rule.model, rule.tier);
			}
			if let Some(range) = &rule.token_range
				&& let Some(max) = range.max
				&& max < range.min
			{
				anyhow::bail!("rule for {:?} has inverted token range", rule.model);
			}
		}
		for (name, tier) in &self.tiers {
			if tier.targets.is_empty() {
				anyhow::bail!("tier {name} has no targets");
			}
		}
		Ok(())
	}
}

/// The first '*'-delimited pattern segment must anchor at the start, the last
/// at the end; everything between matches in order.
fn wildcard_match(pattern: &str, value: &str) -> bool {
	if pattern == "*" {
		return true;
	}
	if !pattern.contains('*') {
		return pattern == value;
	}
	let mut rest = value;
	let segments: Vec<&str> = pattern.split('*').collect();
	for (i, seg) in segments.iter().enumerate() {
		if seg.is_empty() {
			continue;
		}
		if i == 0 {
			let Some(r) = rest.strip_prefix(seg) else {
				return false;
			};
			rest = r;
		} else if i == segments.len() - 1 {
			return rest.ends_with(seg);
		} else {
			let Some(pos) = rest.find(seg) else {
				return false;
			};
			rest = &rest[pos + seg.len()..];
		}
	}
	true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteSource {
	Override,
	Rule,
	Tier,
	CatchAll,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
	pub model: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tier: Option<TierName>,
	pub source: RouteSource,
	pub reason: String,
}

pub struct RouteRequest<'a> {
	pub original_model: &'a str,
	pub token_estimate: Option<u64>,
	pub attempted_models: &'a HashSet<Strng>,
	/// A trusted x-model-override value; only set once admin auth passed.
	pub override_model: Option<&'a str>,
}

#[derive(Debug, Default)]
pub struct RouterOutcome {
	pub decision: Option<RouteDecision>,
	/// In shadow mode, what would have been routed.
	pub shadow: Option<RouteDecision>,
}

/// Maps logical (client) models to physical (upstream) models through the
/// ordered rule list, skipping cooled or saturated targets. Reads are
/// lock-free; the admin API swaps the whole config at once.
pub struct ModelRouter {
	cfg: ArcSwap<RoutingConfig>,
	pool: Arc<PoolManager>,
	limits: Arc<AdaptiveLimits>,
	rr: AtomicUsize,
}

impl ModelRouter {
	pub fn new(cfg: RoutingConfig, pool: Arc<PoolManager>, limits: Arc<AdaptiveLimits>) -> Self {
		ModelRouter {
			cfg: ArcSwap::from_pointee(cfg),
			pool,
			limits,
			rr: AtomicUsize::new(0),
		}
	}

	pub fn config(&self) -> Arc<RoutingConfig> {
		self.cfg.load_full()
	}

	pub fn update_config(&self, cfg: RoutingConfig) -> anyhow::Result<()> {
		cfg.validate()?;
		info!(
			rules = cfg.rules.len(),
			tiers = cfg.tiers.len(),
			shadow = cfg.shadow_mode,
			"routing config updated"
		);
		self.cfg.store(Arc::new(cfg));
		Ok(())
	}

	pub fn select_model(&self, req: &RouteRequest) -> RouterOutcome {
		let cfg = self.cfg.load();
		if let Some(forced) = req.override_model {
			return RouterOutcome {
				decision: Some(RouteDecision {
					model: strng::new(forced),
					tier: None,
					source: RouteSource::Override,
					reason: "x-model-override".to_string(),
				}),
				shadow: None,
			};
		}
		if !cfg.enabled {
			return RouterOutcome::default();
		}
		let decision = self.route(&cfg, req);
		if cfg.shadow_mode {
			if let Some(d) = &decision {
				debug!(model = %req.original_model, mapped = %d.model, "shadow routing decision");
			}
			return RouterOutcome {
				decision: None,
				shadow: decision,
			};
		}
		RouterOutcome {
			decision,
			shadow: None,
		}
	}

	fn route(&self, cfg: &RoutingConfig, req: &RouteRequest) -> Option<RouteDecision> {
		let mut matched_any = false;
		for rule in &cfg.rules {
			if !rule.matches(req.original_model, req.token_estimate) {
				continue;
			}
			matched_any = true;
			let Some(tier) = cfg.tiers.get(&rule.tier) else {
				continue;
			};
			if let Some(model) = self.pick_target(tier, req.attempted_models) {
				let source = if rule.model == "*" {
					RouteSource::Tier
				} else {
					RouteSource::Rule
				};
				return Some(RouteDecision {
					model,
					tier: Some(rule.tier),
					source,
					reason: format!("rule {:?} -> tier {}", rule.model, rule.tier),
				});
			}
			// All tier targets cooled or saturated; fall through to the next
			// matching rule.
		}
		// The catch-all maps everything left onto the medium tier.
		if let Some(tier) = cfg.tiers.get(&TierName::Medium)
			&& let Some(model) = self.pick_target(tier, req.attempted_models)
		{
			return Some(RouteDecision {
				model,
				tier: Some(TierName::Medium),
				source: RouteSource::CatchAll,
				reason: if matched_any {
					"matched rules exhausted; catch-all".to_string()
				} else {
					"no rule matched; catch-all".to_string()
				},
			});
		}
		None
	}

	fn pick_target(&self, tier: &Tier, attempted: &HashSet<Strng>) -> Option<Strng> {
		if let Some(cap) = tier.max_concurrency {
			let tier_in_flight: usize = tier.targets.iter().map(|t| self.limits.in_flight(t)).sum();
			if tier_in_flight >= cap {
				return None;
			}
		}
		let candidates: Vec<&Strng> = tier
			.targets
			.iter()
			.filter(|t| !attempted.contains(*t))
			.filter(|t| self.pool.is_available(t))
			.filter(|t| self.limits.has_capacity(t))
			.collect();
		if candidates.is_empty() {
			return None;
		}
		let chosen = match tier.strategy {
			TierStrategy::RoundRobin => {
				let n = self.rr.fetch_add(1, Ordering::Relaxed);
				candidates[n % candidates.len()]
			},
			TierStrategy::Balanced => candidates
				.iter()
				.min_by_key(|t| self.limits.in_flight(t))
				.copied()?,
			TierStrategy::FirstAvailable => candidates[0],
		};
		Some(chosen.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::concurrency::{AdaptiveConfig, LimiterMode};
	use crate::pool::PoolConfig;

	fn tier(targets: &[&str]) -> Tier {
		Tier {
			targets: targets.iter().map(strng::new).collect(),
			strategy: TierStrategy::FirstAvailable,
			max_concurrency: None,
		}
	}

	fn router(cfg: RoutingConfig) -> ModelRouter {
		ModelRouter::new(
			cfg,
			Arc::new(PoolManager::new(PoolConfig::default())),
			Arc::new(AdaptiveLimits::new(AdaptiveConfig::default())),
		)
	}

	fn routing_config() -> RoutingConfig {
		RoutingConfig {
			enabled: true,
			shadow_mode: false,
			rules: vec![
				RouteRule {
					model: "claude-haiku-*".to_string(),
					token_range: None,
					tier: TierName::Light,
				},
				RouteRule {
					model: "claude-*".to_string(),
					token_range: Some(TokenRange {
						min: 0,
						max: Some(50_000),
					}),
					tier: TierName::Medium,
				},
				RouteRule {
					model: "claude-*".to_string(),
					token_range: None,
					tier: TierName::Heavy,
				},
			],
			tiers: HashMap::from([
				(TierName::Light, tier(&["glm-4.5-air"])),
				(TierName::Medium, tier(&["glm-4.5"])),
				(TierName::Heavy, tier(&["glm-4.6"])),
			]),
		}
	}

	fn req<'a>(model: &'a str, attempted: &'a HashSet<Strng>) -> RouteRequest<'a> {
		RouteRequest {
			original_model: model,
			token_estimate: Some(1000),
			attempted_models: attempted,
			override_model: None,
		}
	}

	#[test]
	fn wildcard_patterns() {
		assert!(wildcard_match("*", "anything"));
		assert!(wildcard_match("claude-*", "claude-sonnet-4"));
		assert!(!wildcard_match("claude-*", "gpt-4"));
		assert!(wildcard_match("*sonnet*", "claude-sonnet-4"));
		assert!(wildcard_match("claude-sonnet-4", "claude-sonnet-4"));
		assert!(!wildcard_match("claude-sonnet-4", "claude-sonnet-45"));
		assert!(wildcard_match("claude-*-4", "claude-sonnet-4"));
		assert!(!wildcard_match("claude-*-4", "claude-sonnet-5"));
	}

	#[test]
	fn rules_evaluated_in_order() {
		let r = router(routing_config());
		let none = HashSet::new();
		let out = r.select_model(&req("claude-haiku-3", &none));
		let d = out.decision.unwrap();
		assert_eq!(d.model.as_str(), "glm-4.5-air");
		assert_eq!(d.source, RouteSource::Rule);
		assert_eq!(d.tier, Some(TierName::Light));
	}

	#[test]
	fn token_range_selects_heavier_tier() {
		let r = router(routing_config());
		let none = HashSet::new();
		let small = RouteRequest {
			token_estimate: Some(1000),
			..req("claude-sonnet-4", &none)
		};
		assert_eq!(
			r.select_model(&small).decision.unwrap().model.as_str(),
			"glm-4.5"
		);
		let large = RouteRequest {
			token_estimate: Some(80_000),
			..req("claude-sonnet-4", &none)
		};
		assert_eq!(
			r.select_model(&large).decision.unwrap().model.as_str(),
			"glm-4.6"
		);
	}

	#[test]
	fn catch_all_applies_when_no_rule_matches() {
		let r = router(routing_config());
		let none = HashSet::new();
		let out = r.select_model(&req("gpt-4o", &none));
		let d = out.decision.unwrap();
		assert_eq!(d.model.as_str(), "glm-4.5");
		assert_eq!(d.source, RouteSource::CatchAll);
	}

	#[test]
	fn attempted_models_are_never_rechosen() {
		let r = router(routing_config());
		let mut attempted = HashSet::new();
		attempted.insert(strng::new("glm-4.5-air"));
		// Light tier exhausted; haiku falls through to the catch-all.
		let out = r.select_model(&req("claude-haiku-3", &attempted));
		let d = out.decision.unwrap();
		assert_eq!(d.model.as_str(), "glm-4.5");
		attempted.insert(strng::new("glm-4.5"));
		attempted.insert(strng::new("glm-4.6"));
		assert!(r.select_model(&req("claude-haiku-3", &attempted)).decision.is_none());
	}

	#[test]
	fn cooled_models_are_skipped() {
		let pool = Arc::new(PoolManager::new(PoolConfig::default()));
		let limits = Arc::new(AdaptiveLimits::new(AdaptiveConfig::default()));
		let r = ModelRouter::new(routing_config(), pool.clone(), limits);
		pool.record_rate_limit_hit(Some(&strng::new("glm-4.5")));
		let none = HashSet::new();
		// Medium is cooling; sonnet falls through its matched rule to heavy.
		let out = r.select_model(&req("claude-sonnet-4", &none));
		assert_eq!(out.decision.unwrap().model.as_str(), "glm-4.6");
	}

	#[test]
	fn enforce_mode_saturation_skips_target() {
		let pool = Arc::new(PoolManager::new(PoolConfig::default()));
		let limits = Arc::new(AdaptiveLimits::new(AdaptiveConfig {
			mode: LimiterMode::Enforce,
			initial_limit: 1,
			..Default::default()
		}));
		let r = ModelRouter::new(routing_config(), pool, limits.clone());
		let model = strng::new("glm-4.5");
		assert!(limits.try_begin(&model));
		let none = HashSet::new();
		let out = r.select_model(&req("claude-sonnet-4", &none));
		// The medium target is saturated; heavy takes over.
		assert_eq!(out.decision.unwrap().model.as_str(), "glm-4.6");
	}

	#[test]
	fn shadow_mode_records_but_does_not_route() {
		let mut cfg = routing_config();
		cfg.shadow_mode = true;
		let r = router(cfg);
		let none = HashSet::new();
		let out = r.select_model(&req("claude-sonnet-4", &none));
		assert!(out.decision.is_none());
		assert_eq!(out.shadow.unwrap().model.as_str(), "glm-4.5");
	}

	#[test]
	fn override_wins_over_rules() {
		let r = router(routing_config());
		let none = HashSet::new();
		let mut rr = req("claude-sonnet-4", &none);
		rr.override_model = Some("glm-4.6");
		let out = r.select_model(&rr);
		let d = out.decision.unwrap();
		assert_eq!(d.model.as_str(), "glm-4.6");
		assert_eq!(d.source, RouteSource::Override);
	}

	#[test]
	fn disabled_router_passes_through() {
		let mut cfg = routing_config();
		cfg.enabled = false;
		let r = router(cfg);
		let none = HashSet::new();
		let out = r.select_model(&req("claude-sonnet-4", &none));
		assert!(out.decision.is_none());
		assert!(out.shadow.is_none());
	}

	#[test]
	fn validation_rejects_dangling_tiers() {
		let mut cfg = routing_config();
		cfg.tiers.remove(&TierName::Heavy);
		assert!(cfg.validate().is_err());
	}
}
