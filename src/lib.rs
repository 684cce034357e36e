//! Tollgate - Cost-admission and adaptive-routing control plane
//!
//! A library the host agent runtime embeds directly: it decides whether a
//! run, iteration, model call, or tool call may proceed under configured
//! spending limits, picks an effective model per stage under budget
//! pressure, accrues cost against scoped time-windowed budgets, and emits
//! usage/event metrics. It does not execute model or tool calls itself, and
//! it carries no network transport, CLI, or concrete provider clients.

pub mod budget;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod pricing;
pub mod router;

pub use budget::{BudgetTracker, RunContext, RunState, RunStatus};
pub use config::TollgateConfig;
pub use error::{PolicyLoadError, StoreError};
pub use lifecycle::{AdmissionDecision, IterationDecision, LifecycleEngine, ModelDecision, ToolDecision};
pub use policy::{BudgetSpec, PolicySnapshot, PolicySource, PolicyStore, RoutingPolicy, Scope, Stage};
pub use pricing::{ModelUsage, PricingTable, ToolUsage};
pub use router::{select_model, RoutingSignals};
