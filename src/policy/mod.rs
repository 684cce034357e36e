//! Policy Store (C2): budget and routing policy types, matching, and
//! specificity ordering.

pub mod source;
pub mod store;

pub use source::{PolicySource, StaticPolicySource};
pub use store::PolicyStore;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::pricing::{ModelPricing, ToolPricing};

/// One of the three match fields on a `BudgetSpec`/`RoutingPolicy`: either a
/// literal string or the wildcard `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchPattern {
    Wildcard,
    Literal(String),
}

impl MatchPattern {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            MatchPattern::Wildcard => true,
            MatchPattern::Literal(s) => s == value,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, MatchPattern::Wildcard)
    }
}

impl Default for MatchPattern {
    fn default() -> Self {
        MatchPattern::Wildcard
    }
}

impl<'de> Deserialize<'de> for MatchPattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Ok(if s == "*" {
            MatchPattern::Wildcard
        } else {
            MatchPattern::Literal(s)
        })
    }
}

impl Serialize for MatchPattern {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            MatchPattern::Wildcard => serializer.serialize_str("*"),
            MatchPattern::Literal(s) => serializer.serialize_str(s),
        }
    }
}

/// The three context fields a policy can be scoped to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchFields {
    pub tenant_id: MatchPattern,
    pub strand_id: MatchPattern,
    pub workflow_id: MatchPattern,
}

impl MatchFields {
    pub fn matches(&self, tenant_id: &str, strand_id: &str, workflow_id: &str) -> bool {
        self.tenant_id.matches(tenant_id)
            && self.strand_id.matches(strand_id)
            && self.workflow_id.matches(workflow_id)
    }

    /// Specificity contribution from matched fields:
    /// `workflow(4) + strand(2) + tenant(1)`, combined with a scope
    /// weight computed separately from `Scope`.
    fn field_score(&self) -> u32 {
        let mut score = 0;
        if !self.tenant_id.is_wildcard() {
            score += 1;
        }
        if !self.strand_id.is_wildcard() {
            score += 2;
        }
        if !self.workflow_id.is_wildcard() {
            score += 4;
        }
        score
    }
}

/// Aggregation scope for a `BudgetSpec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Tenant,
    Strand,
    Workflow,
}

impl Scope {
    /// `global(0) < tenant(10) < strand(20) < workflow(30)`.
    fn weight(self) -> u32 {
        match self {
            Scope::Global => 0,
            Scope::Tenant => 10,
            Scope::Strand => 20,
            Scope::Workflow => 30,
        }
    }
}

/// Budget accounting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

/// Action taken when a soft threshold is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SoftThresholdAction {
    LogOnly,
    DowngradeModel,
    LimitCapabilities,
    HaltNewRuns,
}

/// Action taken when the hard limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HardLimitAction {
    HaltRun,
    RejectNewRuns,
}

/// Per-run constraints enforced independent of period accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConstraints {
    pub max_iterations_per_run: Option<u32>,
    pub max_tool_calls_per_run: Option<u32>,
    pub max_model_tokens_per_run: Option<u64>,
    pub max_cost_per_run: Option<f64>,
}

fn default_soft_thresholds() -> Vec<f64> {
    vec![0.7, 0.9, 1.0]
}

/// An immutable budget policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSpec {
    pub id: String,
    pub scope: Scope,
    #[serde(rename = "match")]
    pub match_fields: MatchFields,
    pub period: Period,
    pub max_cost: Option<f64>,
    pub soft_thresholds: Vec<f64>,
    pub hard_limit: bool,
    pub on_soft_threshold_exceeded: SoftThresholdAction,
    pub on_hard_limit_exceeded: HardLimitAction,
    pub max_runs_per_period: Option<u64>,
    pub max_concurrent_runs: Option<u64>,
    pub constraints: RunConstraints,
    pub enabled: bool,
    /// Free-text annotation, ignored by matching/enforcement.
    pub description: Option<String>,
}

impl Default for BudgetSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            scope: Scope::Global,
            match_fields: MatchFields::default(),
            period: Period::Daily,
            max_cost: None,
            soft_thresholds: default_soft_thresholds(),
            hard_limit: false,
            on_soft_threshold_exceeded: SoftThresholdAction::LogOnly,
            on_hard_limit_exceeded: HardLimitAction::HaltRun,
            max_runs_per_period: None,
            max_concurrent_runs: None,
            constraints: RunConstraints::default(),
            enabled: true,
            description: None,
        }
    }
}

impl BudgetSpec {
    /// Combined scope weight and matched-field score; higher wins ties.
    pub fn specificity(&self) -> u32 {
        self.scope.weight() + self.match_fields.field_score()
    }

    pub fn matches(&self, tenant_id: &str, strand_id: &str, workflow_id: &str) -> bool {
        self.enabled && self.match_fields.matches(tenant_id, strand_id, workflow_id)
    }
}

/// Stage label attached to a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    ToolSelection,
    Synthesis,
    Other,
}

/// Sufficient-condition trigger set for a routing stage's downgrade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DowngradeTrigger {
    pub soft_threshold_exceeded: Option<bool>,
    pub remaining_budget_below: Option<f64>,
    pub iteration_count_above: Option<u32>,
    pub latency_above_ms: Option<f64>,
}

/// Per-stage routing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub stage: Option<Stage>,
    pub default_model: String,
    pub fallback_model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub trigger_downgrade_on: DowngradeTrigger,
}

/// An immutable routing policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    pub id: String,
    #[serde(rename = "match")]
    pub match_fields: MatchFields,
    pub stages: Vec<StageConfig>,
    pub default_model: String,
}

impl RoutingPolicy {
    pub fn specificity(&self) -> u32 {
        // Routing policies are not scope-tagged; only the match-field score applies.
        self.match_fields.field_score()
    }

    pub fn matches(&self, tenant_id: &str, strand_id: &str, workflow_id: &str) -> bool {
        self.match_fields.matches(tenant_id, strand_id, workflow_id)
    }

    pub fn stage_config(&self, stage: Stage) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.stage == Some(stage))
    }
}

/// Dictionary shape of the `pricing:` block re-exported for callers that
/// only need budgets/routing; pricing parsing lives in `crate::pricing`.
pub use crate::pricing::PricingDict;

/// An immutable, atomically-published snapshot of all three document sets.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub budgets: Vec<BudgetSpec>,
    pub routing_policies: Vec<RoutingPolicy>,
    pub pricing: crate::pricing::PricingTable,
}

impl PolicySnapshot {
    /// Budgets applicable to a context, ordered by descending specificity,
    /// ties broken by stable input order.
    pub fn matching_budgets(&self, tenant_id: &str, strand_id: &str, workflow_id: &str) -> Vec<&BudgetSpec> {
        let mut matched: Vec<(usize, &BudgetSpec)> = self
            .budgets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.matches(tenant_id, strand_id, workflow_id))
            .collect();
        matched.sort_by(|(ia, a), (ib, b)| {
            b.specificity()
                .cmp(&a.specificity())
                .then(ia.cmp(ib))
        });
        matched.into_iter().map(|(_, b)| b).collect()
    }

    /// The single most specific matching routing policy, if any.
    pub fn matching_routing_policy(
        &self,
        tenant_id: &str,
        strand_id: &str,
        workflow_id: &str,
    ) -> Option<&RoutingPolicy> {
        self.routing_policies
            .iter()
            .enumerate()
            .filter(|(_, p)| p.matches(tenant_id, strand_id, workflow_id))
            .max_by(|(ia, a), (ib, b)| {
                a.specificity()
                    .cmp(&b.specificity())
                    .then(ib.cmp(ia))
            })
            .map(|(_, p)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(id: &str, scope: Scope, tenant: &str, strand: &str, workflow: &str) -> BudgetSpec {
        BudgetSpec {
            id: id.to_string(),
            scope,
            match_fields: MatchFields {
                tenant_id: if tenant == "*" {
                    MatchPattern::Wildcard
                } else {
                    MatchPattern::Literal(tenant.to_string())
                },
                strand_id: if strand == "*" {
                    MatchPattern::Wildcard
                } else {
                    MatchPattern::Literal(strand.to_string())
                },
                workflow_id: if workflow == "*" {
                    MatchPattern::Wildcard
                } else {
                    MatchPattern::Literal(workflow.to_string())
                },
            },
            ..BudgetSpec::default()
        }
    }

    #[test]
    fn test_s6_specificity_ordering() {
        // spec.md S6: B_global(0), B_tenant(11), B_workflow(37) all match.
        let b_global = budget("B_global", Scope::Global, "*", "*", "*");
        let b_tenant = budget("B_tenant", Scope::Tenant, "t1", "*", "*");
        let b_workflow = budget("B_workflow", Scope::Workflow, "t1", "s1", "w1");

        assert_eq!(b_global.specificity(), 0);
        assert_eq!(b_tenant.specificity(), 11);
        assert_eq!(b_workflow.specificity(), 37);

        let snapshot = PolicySnapshot {
            budgets: vec![b_global.clone(), b_tenant.clone(), b_workflow.clone()],
            routing_policies: vec![],
            pricing: crate::pricing::PricingTable::empty(),
        };

        let matched = snapshot.matching_budgets("t1", "s1", "w1");
        let ids: Vec<&str> = matched.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["B_workflow", "B_tenant", "B_global"]);
    }

    #[test]
    fn test_wildcard_match() {
        let b = budget("any", Scope::Global, "*", "*", "*");
        assert!(b.matches("t1", "s1", "w1"));
        assert!(b.matches("t2", "s2", "w2"));
    }

    #[test]
    fn test_literal_mismatch_excludes() {
        let b = budget("t1-only", Scope::Tenant, "t1", "*", "*");
        assert!(b.matches("t1", "s1", "w1"));
        assert!(!b.matches("t2", "s1", "w1"));
    }

    #[test]
    fn test_disabled_budget_never_matches() {
        let mut b = budget("off", Scope::Global, "*", "*", "*");
        b.enabled = false;
        assert!(!b.matches("t1", "s1", "w1"));
    }

    #[test]
    fn test_stable_tie_break_on_equal_specificity() {
        let b1 = budget("first", Scope::Tenant, "t1", "*", "*");
        let b2 = budget("second", Scope::Tenant, "t1", "*", "*");
        let snapshot = PolicySnapshot {
            budgets: vec![b1, b2],
            routing_policies: vec![],
            pricing: crate::pricing::PricingTable::empty(),
        };
        let matched = snapshot.matching_budgets("t1", "s1", "w1");
        assert_eq!(matched[0].id, "first");
        assert_eq!(matched[1].id, "second");
    }

    #[test]
    fn test_default_soft_thresholds() {
        let b = BudgetSpec::default();
        assert_eq!(b.soft_thresholds, vec![0.7, 0.9, 1.0]);
    }

    #[test]
    fn test_routing_policy_single_most_specific_wins() {
        let general = RoutingPolicy {
            id: "general".to_string(),
            match_fields: MatchFields::default(),
            stages: vec![],
            default_model: "general-model".to_string(),
        };
        let specific = RoutingPolicy {
            id: "specific".to_string(),
            match_fields: MatchFields {
                tenant_id: MatchPattern::Literal("t1".to_string()),
                strand_id: MatchPattern::Wildcard,
                workflow_id: MatchPattern::Wildcard,
            },
            stages: vec![],
            default_model: "specific-model".to_string(),
        };
        let snapshot = PolicySnapshot {
            budgets: vec![],
            routing_policies: vec![general, specific],
            pricing: crate::pricing::PricingTable::empty(),
        };
        let picked = snapshot.matching_routing_policy("t1", "s1", "w1").unwrap();
        assert_eq!(picked.id, "specific");
    }
}
