//! `PolicySource`: the abstract collaborator the Policy Store reloads from.
//!
//! The core never parses YAML/env files itself; it
//! only knows how to turn already-deserialized dictionaries into typed
//! specs. `StaticPolicySource` is the one concrete implementation this
//! crate ships: a test/embedding double over in-memory documents, built
//! from a flat `budgets`/`routing_policies`/`pricing` dictionary shape for
//! convenience.

use crate::error::PolicyLoadError;
use crate::policy::{BudgetSpec, RoutingPolicy};
use crate::pricing::PricingDict;

/// Abstract collaborator that produces the three document sets the Policy
/// Store needs. A host adapts its own config pipeline (YAML, env, a
/// database) to this trait.
pub trait PolicySource: Send + Sync {
    fn load_budgets(&self) -> Result<Vec<BudgetSpec>, PolicyLoadError>;
    fn load_routing_policies(&self) -> Result<Vec<RoutingPolicy>, PolicyLoadError>;
    fn load_pricing(&self) -> Result<PricingDict, PolicyLoadError>;
}

/// Top-level shape of the combined configuration dictionary.
#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(default)]
struct PolicyDocument {
    budgets: Vec<BudgetSpec>,
    routing_policies: Vec<RoutingPolicy>,
    pricing: PricingDict,
}

/// A `PolicySource` backed by pre-parsed in-memory documents.
///
/// Construct with [`StaticPolicySource::new`] for programmatic assembly
/// (tests), or [`StaticPolicySource::from_yaml_str`] to parse a
/// `budgets`/`routing_policies`/`pricing` document.
pub struct StaticPolicySource {
    budgets: Vec<BudgetSpec>,
    routing_policies: Vec<RoutingPolicy>,
    pricing: PricingDict,
}

impl StaticPolicySource {
    pub fn new(
        budgets: Vec<BudgetSpec>,
        routing_policies: Vec<RoutingPolicy>,
        pricing: PricingDict,
    ) -> Self {
        Self {
            budgets,
            routing_policies,
            pricing,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), PricingDict::default())
    }

    /// Parse the combined `budgets:` / `routing_policies:` / `pricing:`
    /// document from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyLoadError> {
        let doc: PolicyDocument =
            serde_yaml::from_str(yaml).map_err(|e| PolicyLoadError::InvalidDictionary(e.to_string()))?;
        Ok(Self::new(doc.budgets, doc.routing_policies, doc.pricing))
    }
}

impl PolicySource for StaticPolicySource {
    fn load_budgets(&self) -> Result<Vec<BudgetSpec>, PolicyLoadError> {
        Ok(self.budgets.clone())
    }

    fn load_routing_policies(&self) -> Result<Vec<RoutingPolicy>, PolicyLoadError> {
        Ok(self.routing_policies.clone())
    }

    fn load_pricing(&self) -> Result<PricingDict, PolicyLoadError> {
        Ok(self.pricing.clone())
    }
}
