//! Resource profiles per billing tier.
//!
//! A profile supplies the run budget and scheduling priority when the caller
//! leaves them unset. Explicit constraints always win.

use serde::{Deserialize, Serialize};

use crate::domain::{ImpactTier, RunConstraints};

/// Tier a run's resources are drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceTier {
    Impact,
    Commercial,
    Free,
    Internal,
}

impl ResourceTier {
    /// Tier used when the caller names none
    pub fn for_impact(tier: ImpactTier) -> Self {
        match tier {
            ImpactTier::Impact => ResourceTier::Impact,
            ImpactTier::Standard => ResourceTier::Commercial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceTier::Impact => "impact",
            ResourceTier::Commercial => "commercial",
            ResourceTier::Free => "free",
            ResourceTier::Internal => "internal",
        }
    }

    pub fn profile(self) -> ResourceProfile {
        let (max_tokens, max_cost, target_latency_ms, priority) = match self {
            ResourceTier::Impact => (32_000, 5.00, 5_000, 1),
            ResourceTier::Commercial => (16_000, 2.00, 10_000, 2),
            ResourceTier::Free => (4_000, 0.10, 30_000, 3),
            ResourceTier::Internal => (64_000, 10.00, 2_000, 0),
        };
        ResourceProfile {
            tier: self,
            max_tokens,
            max_cost,
            target_latency_ms,
            priority,
        }
    }
}

/// Default budget and priority for a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub tier: ResourceTier,
    pub max_tokens: u64,
    pub max_cost: f64,
    pub target_latency_ms: u64,
    /// Scheduling priority; above 2 every task runs sequentially
    pub priority: u32,
}

impl ResourceProfile {
    /// Fill the unset fields of `constraints` from this profile
    pub fn apply(&self, constraints: RunConstraints) -> RunConstraints {
        RunConstraints {
            max_tokens: constraints.max_tokens.or(Some(self.max_tokens)),
            max_cost: constraints.max_cost.or(Some(self.max_cost)),
            target_latency_ms: constraints.target_latency_ms.or(Some(self.target_latency_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_table() {
        let impact = ResourceTier::Impact.profile();
        assert_eq!((impact.max_tokens, impact.max_cost, impact.target_latency_ms, impact.priority), (32_000, 5.00, 5_000, 1));

        let commercial = ResourceTier::Commercial.profile();
        assert_eq!(
            (commercial.max_tokens, commercial.max_cost, commercial.target_latency_ms, commercial.priority),
            (16_000, 2.00, 10_000, 2)
        );

        let free = ResourceTier::Free.profile();
        assert_eq!((free.max_tokens, free.max_cost, free.target_latency_ms, free.priority), (4_000, 0.10, 30_000, 3));

        let internal = ResourceTier::Internal.profile();
        assert_eq!(
            (internal.max_tokens, internal.max_cost, internal.target_latency_ms, internal.priority),
            (64_000, 10.00, 2_000, 0)
        );
    }

    #[test]
    fn test_impact_tier_picks_default_profile() {
        assert_eq!(ResourceTier::for_impact(ImpactTier::Impact), ResourceTier::Impact);
        assert_eq!(ResourceTier::for_impact(ImpactTier::Standard), ResourceTier::Commercial);
    }

    #[test]
    fn test_explicit_constraints_win() {
        let constraints = RunConstraints {
            max_tokens: Some(900),
            ..Default::default()
        };
        let applied = ResourceTier::Free.profile().apply(constraints);
        assert_eq!(applied.max_tokens, Some(900));
        assert_eq!(applied.max_cost, Some(0.10));
        assert_eq!(applied.target_latency_ms, Some(30_000));
    }
}
