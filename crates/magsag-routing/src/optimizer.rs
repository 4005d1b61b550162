//! SLA-driven execution planning: mode, model tier, cache strategy, and
//! batching, with deterministic decisions and cost/latency estimates.

use std::path::Path;

use serde::{Deserialize, Serialize};

use magsag_types::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Realtime,
    Batch,
}

/// Model tiers in ascending cost order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Local,
    Mini,
    Standard,
    Premium,
}

impl ModelTier {
    pub const ALL: [ModelTier; 4] = [
        ModelTier::Local,
        ModelTier::Mini,
        ModelTier::Standard,
        ModelTier::Premium,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Local => "local",
            ModelTier::Mini => "mini",
            ModelTier::Standard => "standard",
            ModelTier::Premium => "premium",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    None,
    Conservative,
    Aggressive,
}

/// Service-level objectives for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
    pub min_quality: f64,
    pub realtime_required: bool,
    pub allow_cache: bool,
    pub allow_batch: bool,
}

impl Default for SlaParameters {
    fn default() -> Self {
        Self {
            max_latency_ms: None,
            max_cost_usd: None,
            min_quality: 0.7,
            realtime_required: true,
            allow_cache: true,
            allow_batch: true,
        }
    }
}

/// The optimizer's decision tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub mode: ExecutionMode,
    pub model_tier: ModelTier,
    pub cache_strategy: CacheStrategy,
    pub enable_batch: bool,
    pub estimated_cost_usd: f64,
    pub estimated_latency_ms: u64,
    pub reasoning: String,
}

/// Per-tier cost/quality/latency assumptions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierSpec {
    pub cost: f64,
    pub quality: f64,
    pub latency_ms: u64,
}

/// All decision constants live here so deployments can tune them without
/// touching the algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub local: TierSpec,
    pub mini: TierSpec,
    pub standard: TierSpec,
    pub premium: TierSpec,
    /// Budgets below this trigger aggressive caching.
    pub aggressive_cache_threshold: f64,
    pub aggressive_cache_multiplier: f64,
    pub conservative_cache_multiplier: f64,
    pub batch_overhead_ms: u64,
    pub realtime_factor: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            local: TierSpec { cost: 0.0, quality: 0.5, latency_ms: 500 },
            mini: TierSpec { cost: 0.002, quality: 0.8, latency_ms: 1000 },
            standard: TierSpec { cost: 0.01, quality: 0.9, latency_ms: 2000 },
            premium: TierSpec { cost: 0.03, quality: 0.95, latency_ms: 3000 },
            aggressive_cache_threshold: 0.005,
            aggressive_cache_multiplier: 0.3,
            conservative_cache_multiplier: 0.6,
            batch_overhead_ms: 5000,
            realtime_factor: 0.8,
        }
    }
}

impl OptimizerConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ValidationError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ValidationError::new(format!("cannot read {}: {err}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|err| ValidationError::new(format!("invalid optimizer config: {err}")))
    }

    fn tier(&self, tier: ModelTier) -> TierSpec {
        match tier {
            ModelTier::Local => self.local,
            ModelTier::Mini => self.mini,
            ModelTier::Standard => self.standard,
            ModelTier::Premium => self.premium,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CostOptimizer {
    config: OptimizerConfig,
}

impl CostOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Identical SLAs always yield identical plans.
    pub fn optimize(&self, sla: &SlaParameters) -> ExecutionPlan {
        let mode = if sla.realtime_required {
            ExecutionMode::Realtime
        } else {
            ExecutionMode::Batch
        };

        let model_tier = self.select_model_tier(sla);
        let cache_strategy = self.select_cache_strategy(sla, model_tier);
        let enable_batch = sla.allow_batch && mode == ExecutionMode::Batch;

        let estimated_cost_usd = self.estimate_cost(model_tier, cache_strategy);
        let estimated_latency_ms = self.estimate_latency(mode, model_tier, enable_batch);
        let reasoning = self.build_reasoning(sla, mode, model_tier, cache_strategy, enable_batch);

        ExecutionPlan {
            mode,
            model_tier,
            cache_strategy,
            enable_batch,
            estimated_cost_usd,
            estimated_latency_ms,
            reasoning,
        }
    }

    /// Cost uses the uncached (worst-case) tier price so a budget holds even
    /// when caching is disabled. Among affordable tiers the cheapest that
    /// meets the quality floor wins; a hard budget beats the quality floor
    /// when both cannot hold.
    fn select_model_tier(&self, sla: &SlaParameters) -> ModelTier {
        let affordable: Vec<ModelTier> = ModelTier::ALL
            .into_iter()
            .filter(|tier| match sla.max_cost_usd {
                Some(budget) => self.config.tier(*tier).cost <= budget,
                None => true,
            })
            .collect();

        for tier in &affordable {
            if self.config.tier(*tier).quality >= sla.min_quality {
                return *tier;
            }
        }

        if sla.max_cost_usd.is_some() {
            if let Some(best) = affordable.last() {
                return *best;
            }
        }

        for tier in ModelTier::ALL {
            if self.config.tier(tier).quality >= sla.min_quality {
                return tier;
            }
        }

        ModelTier::Local
    }

    fn select_cache_strategy(&self, sla: &SlaParameters, model_tier: ModelTier) -> CacheStrategy {
        if !sla.allow_cache {
            return CacheStrategy::None;
        }
        if sla
            .max_cost_usd
            .is_some_and(|budget| budget < self.config.aggressive_cache_threshold)
        {
            return CacheStrategy::Aggressive;
        }
        if matches!(model_tier, ModelTier::Standard | ModelTier::Premium) {
            return CacheStrategy::Conservative;
        }
        CacheStrategy::Aggressive
    }

    fn estimate_cost(&self, model_tier: ModelTier, cache_strategy: CacheStrategy) -> f64 {
        let base = self.config.tier(model_tier).cost;
        match cache_strategy {
            CacheStrategy::Aggressive => base * self.config.aggressive_cache_multiplier,
            CacheStrategy::Conservative => base * self.config.conservative_cache_multiplier,
            CacheStrategy::None => base,
        }
    }

    fn estimate_latency(
        &self,
        mode: ExecutionMode,
        model_tier: ModelTier,
        enable_batch: bool,
    ) -> u64 {
        let base = self.config.tier(model_tier).latency_ms as f64;
        let factor = if mode == ExecutionMode::Realtime {
            self.config.realtime_factor
        } else {
            1.0
        };
        let overhead = if enable_batch {
            self.config.batch_overhead_ms
        } else {
            0
        };
        (base * factor) as u64 + overhead
    }

    fn build_reasoning(
        &self,
        sla: &SlaParameters,
        mode: ExecutionMode,
        model_tier: ModelTier,
        cache_strategy: CacheStrategy,
        enable_batch: bool,
    ) -> String {
        let mut parts = Vec::new();
        parts.push(match mode {
            ExecutionMode::Batch => "Non-realtime workload -> BATCH mode".to_string(),
            ExecutionMode::Realtime => "Realtime required -> REALTIME mode".to_string(),
        });

        let tier = model_tier.as_str().to_uppercase();
        if let Some(budget) = sla.max_cost_usd.filter(|b| *b < 0.001) {
            parts.push(format!("Low cost budget (${budget}) -> {tier}"));
        } else if sla.min_quality >= 0.9 {
            parts.push(format!(
                "High quality requirement ({}) -> {tier}",
                sla.min_quality
            ));
        } else {
            parts.push(format!("Quality requirement ({}) -> {tier}", sla.min_quality));
        }

        if cache_strategy != CacheStrategy::None {
            let strategy = match cache_strategy {
                CacheStrategy::Aggressive => "AGGRESSIVE",
                CacheStrategy::Conservative => "CONSERVATIVE",
                CacheStrategy::None => unreachable!(),
            };
            parts.push(format!("Caching enabled -> {strategy}"));
        }
        if enable_batch {
            parts.push("Batch processing enabled for cost optimization".to_string());
        }

        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimize(sla: SlaParameters) -> ExecutionPlan {
        CostOptimizer::default().optimize(&sla)
    }

    #[test]
    fn sla_switches_tier_with_budget() {
        let premium = optimize(SlaParameters {
            max_cost_usd: Some(0.05),
            min_quality: 0.95,
            ..SlaParameters::default()
        });
        assert_eq!(premium.model_tier, ModelTier::Premium);

        let local = optimize(SlaParameters {
            max_cost_usd: Some(0.0005),
            min_quality: 0.95,
            ..SlaParameters::default()
        });
        assert_eq!(local.model_tier, ModelTier::Local);

        assert!(premium.estimated_cost_usd > local.estimated_cost_usd);
    }

    #[test]
    fn tight_budget_batch_stays_cheap() {
        // realtime_required=false and a sub-millicent budget must land on a
        // cheap tier in batch mode.
        for budget in [0.0, 0.0005, 0.0009] {
            let plan = optimize(SlaParameters {
                max_cost_usd: Some(budget),
                realtime_required: false,
                min_quality: 0.9,
                ..SlaParameters::default()
            });
            assert_eq!(plan.mode, ExecutionMode::Batch);
            assert!(matches!(plan.model_tier, ModelTier::Local | ModelTier::Mini));
        }
    }

    #[test]
    fn high_quality_unconstrained_budget_goes_premium() {
        let plan = optimize(SlaParameters {
            min_quality: 0.95,
            ..SlaParameters::default()
        });
        assert_eq!(plan.model_tier, ModelTier::Premium);
    }

    #[test]
    fn identical_slas_yield_identical_plans() {
        let sla = SlaParameters {
            max_cost_usd: Some(0.01),
            min_quality: 0.85,
            realtime_required: false,
            ..SlaParameters::default()
        };
        let a = optimize(sla.clone());
        let b = optimize(sla);
        assert_eq!(a.model_tier, b.model_tier);
        assert_eq!(a.cache_strategy, b.cache_strategy);
        assert_eq!(a.estimated_cost_usd, b.estimated_cost_usd);
        assert_eq!(a.estimated_latency_ms, b.estimated_latency_ms);
        assert_eq!(a.reasoning, b.reasoning);
    }

    #[test]
    fn cache_strategy_rules() {
        let none = optimize(SlaParameters {
            allow_cache: false,
            ..SlaParameters::default()
        });
        assert_eq!(none.cache_strategy, CacheStrategy::None);

        let aggressive = optimize(SlaParameters {
            max_cost_usd: Some(0.004),
            min_quality: 0.5,
            ..SlaParameters::default()
        });
        assert_eq!(aggressive.cache_strategy, CacheStrategy::Aggressive);

        let conservative = optimize(SlaParameters {
            min_quality: 0.9,
            ..SlaParameters::default()
        });
        assert_eq!(conservative.cache_strategy, CacheStrategy::Conservative);
    }

    #[test]
    fn batch_requires_allowance_and_batch_mode() {
        let plan = optimize(SlaParameters {
            realtime_required: false,
            allow_batch: true,
            ..SlaParameters::default()
        });
        assert!(plan.enable_batch);
        assert!(plan.estimated_latency_ms >= 5000);

        let no_batch = optimize(SlaParameters {
            realtime_required: false,
            allow_batch: false,
            ..SlaParameters::default()
        });
        assert!(!no_batch.enable_batch);

        let realtime = optimize(SlaParameters::default());
        assert!(!realtime.enable_batch);
    }

    #[test]
    fn estimates_follow_multipliers() {
        // standard tier, conservative cache: 0.01 * 0.6.
        let plan = optimize(SlaParameters {
            min_quality: 0.9,
            ..SlaParameters::default()
        });
        assert_eq!(plan.model_tier, ModelTier::Standard);
        assert!((plan.estimated_cost_usd - 0.006).abs() < 1e-9);
        // realtime: 2000 * 0.8.
        assert_eq!(plan.estimated_latency_ms, 1600);
    }
}
