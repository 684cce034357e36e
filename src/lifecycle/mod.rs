//! Lifecycle Engine (C5): the glue layer exposing hook operations that
//! consult the Policy Store, Budget Tracker, Router, and Pricing Table and
//! return decision values.
//!
//! Every decision type is a plain value — none of these methods raise on a
//! business-rule outcome (a rejection is `AdmissionDecision { allowed:
//! false, .. }`, not an `Err`). The only failure surface left is an unknown
//! `run_id`, which is logged and treated permissively.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::budget::{BudgetTracker, RunContext, RunStatus};
use crate::config::TollgateConfig;
use crate::metrics::{MetricLabels, Metrics, MetricsEmitter};
use crate::policy::{BudgetSpec, HardLimitAction, PolicyStore, SoftThresholdAction, Stage};
use crate::pricing::{ModelUsage, ToolUsage};
use crate::router::{select_model, RoutingSignals};

const DEFAULT_MAX_ITERATIONS: u32 = 1_000;
const DEFAULT_MAX_TOOL_CALLS: u32 = 1_000;

#[derive(Debug, Clone, Default)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub remaining_budget: Option<f64>,
    pub budget_utilization: Option<f64>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IterationDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub remaining_iterations: Option<u32>,
    pub warnings: Vec<String>,
    pub force_terminate_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ModelDecision {
    pub allowed: bool,
    pub effective_model: Option<String>,
    pub max_tokens: Option<u32>,
    pub was_downgraded: bool,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub remaining_tool_calls: Option<u32>,
    pub warnings: Vec<String>,
    pub skip_tool_call: bool,
}

fn labels(tenant_id: &str, strand_id: &str, workflow_id: &str, run_id: &str, config: &TollgateConfig) -> MetricLabels {
    MetricLabels {
        tenant_id: tenant_id.to_string(),
        strand_id: strand_id.to_string(),
        workflow_id: workflow_id.to_string(),
        run_id: config.metrics.emit_run_id.then(|| run_id.to_string()),
    }
}

/// Find the first budget (in the caller's specificity order) whose check
/// satisfies `predicate`.
fn first_triggered<'a>(
    budgets: &[&'a BudgetSpec],
    checks: &[crate::budget::BudgetCheck],
    predicate: impl Fn(&crate::budget::BudgetCheck) -> bool,
) -> Option<(&'a BudgetSpec, crate::budget::BudgetCheck)> {
    budgets
        .iter()
        .zip(checks.iter())
        .find(|(_, check)| predicate(check))
        .map(|(b, c)| (*b, c.clone()))
}

/// C5 — Lifecycle Engine.
pub struct LifecycleEngine {
    policy_store: Arc<PolicyStore>,
    budget_tracker: Arc<BudgetTracker>,
    metrics: Arc<dyn MetricsEmitter>,
    config: TollgateConfig,
}

impl LifecycleEngine {
    pub fn new(policy_store: Arc<PolicyStore>, budget_tracker: Arc<BudgetTracker>, metrics: Arc<dyn MetricsEmitter>, config: TollgateConfig) -> Self {
        Self {
            policy_store,
            budget_tracker,
            metrics,
            config,
        }
    }

    pub fn admit_run(&self, tenant_id: &str, strand_id: &str, workflow_id: &str, run_id: &str, metadata: Option<HashMap<String, String>>) -> AdmissionDecision {
        let snapshot = self.policy_store.current();
        let matching = snapshot.matching_budgets(tenant_id, strand_id, workflow_id);
        let metric_labels = labels(tenant_id, strand_id, workflow_id, run_id, &self.config);
        let metrics = Metrics::new(self.metrics.as_ref());

        let context = RunContext {
            tenant_id: tenant_id.to_string(),
            strand_id: strand_id.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            started_at: chrono::Utc::now(),
            metadata: metadata.unwrap_or_default(),
        };

        if !self.config.enable_budget_enforcement {
            self.budget_tracker.register_run(context, &matching);
            metrics.run_started(&metric_labels);
            return AdmissionDecision {
                allowed: true,
                ..Default::default()
            };
        }

        let checks = self.budget_tracker.check_budget_limits(tenant_id, strand_id, workflow_id, &matching);

        let rejection = first_triggered(&matching, &checks, |check| {
            check.limit_exceeded()
        })
        .filter(|(budget, _)| budget.on_hard_limit_exceeded == HardLimitAction::RejectNewRuns);

        if let Some((budget, _)) = rejection {
            let reason = format!("budget '{}' hard limit exceeded", budget.id);
            metrics.rejection_event(&metric_labels, &reason);
            return AdmissionDecision {
                allowed: false,
                reason: Some(reason),
                ..Default::default()
            };
        }

        self.budget_tracker.register_run(context, &matching);
        metrics.run_started(&metric_labels);

        let remaining_budget = checks.iter().filter_map(|c| c.remaining_cost).fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a: f64| a.min(r))));
        let budget_utilization = checks
            .iter()
            .map(|c| c.fraction_used)
            .filter(|f| f.is_finite())
            .fold(None, |acc: Option<f64>, f| Some(acc.map_or(f, |a: f64| a.max(f))));

        let warnings: Vec<String> = matching
            .iter()
            .zip(checks.iter())
            .filter(|(budget, check)| check.soft_threshold_crossed.is_some() && budget.on_soft_threshold_exceeded != SoftThresholdAction::LogOnly)
            .map(|(budget, check)| {
                format!(
                    "budget '{}' crossed soft threshold {:.2}",
                    budget.id,
                    check.soft_threshold_crossed.unwrap_or(0.0)
                )
            })
            .collect();

        AdmissionDecision {
            allowed: true,
            reason: None,
            remaining_budget,
            budget_utilization,
            warnings,
        }
    }

    pub fn before_iteration(&self, tenant_id: &str, strand_id: &str, workflow_id: &str, run_id: &str, iteration_idx: u32) -> IterationDecision {
        let Some(run) = self.budget_tracker.run_state(run_id) else {
            warn!(run_id, "before_iteration on unknown run_id");
            return IterationDecision {
                allowed: true,
                ..Default::default()
            };
        };

        let snapshot = self.policy_store.current();
        let matching = snapshot.matching_budgets(tenant_id, strand_id, workflow_id);
        let _ = run;

        let max_iterations = matching
            .iter()
            .filter_map(|b| b.constraints.max_iterations_per_run)
            .min()
            .unwrap_or(DEFAULT_MAX_ITERATIONS);

        if iteration_idx >= max_iterations {
            return IterationDecision {
                allowed: false,
                reason: Some(format!("max iterations ({}) reached at iteration {}", max_iterations, iteration_idx)),
                force_terminate_run: true,
                ..Default::default()
            };
        }

        if self.config.enable_budget_enforcement {
            let checks = self.budget_tracker.check_budget_limits(tenant_id, strand_id, workflow_id, &matching);
            let halt = first_triggered(&matching, &checks, |check| check.hard_limit_exceeded)
                .filter(|(budget, _)| budget.on_hard_limit_exceeded == HardLimitAction::HaltRun);

            if let Some((budget, _)) = halt {
                let metric_labels = labels(tenant_id, strand_id, workflow_id, run_id, &self.config);
                Metrics::new(self.metrics.as_ref()).halt_event(&metric_labels, &format!("budget '{}' hard limit reached", budget.id));
                return IterationDecision {
                    allowed: false,
                    reason: Some(format!("budget '{}' hard limit reached", budget.id)),
                    force_terminate_run: true,
                    ..Default::default()
                };
            }
        }

        IterationDecision {
            allowed: true,
            remaining_iterations: Some(max_iterations - iteration_idx),
            ..Default::default()
        }
    }

    pub fn after_iteration(&self, tenant_id: &str, strand_id: &str, workflow_id: &str, run_id: &str, _iteration_idx: u32) {
        self.budget_tracker.advance_iteration(run_id);
        let metric_labels = labels(tenant_id, strand_id, workflow_id, run_id, &self.config);
        Metrics::new(self.metrics.as_ref()).iteration(&metric_labels);
    }

    pub fn before_model_call(
        &self,
        tenant_id: &str,
        strand_id: &str,
        workflow_id: &str,
        run_id: &str,
        requested_model: &str,
        stage: Stage,
        prompt_tokens_estimate: u64,
    ) -> ModelDecision {
        let Some(run) = self.budget_tracker.run_state(run_id) else {
            warn!(run_id, "before_model_call on unknown run_id");
            return ModelDecision {
                allowed: true,
                effective_model: Some(requested_model.to_string()),
                ..Default::default()
            };
        };

        let snapshot = self.policy_store.current();
        let matching = snapshot.matching_budgets(tenant_id, strand_id, workflow_id);

        let token_budget = matching.iter().filter_map(|b| b.constraints.max_model_tokens_per_run).min();
        if self.config.enable_budget_enforcement {
            if let Some(max_tokens) = token_budget {
                let used = run.total_input_tokens + run.total_output_tokens;
                if used >= max_tokens {
                    return ModelDecision {
                        allowed: false,
                        reason: Some("run token budget exhausted".to_string()),
                        ..Default::default()
                    };
                }
            }
        }

        let checks = self.budget_tracker.check_budget_limits(tenant_id, strand_id, workflow_id, &matching);
        let soft_threshold_exceeded = checks.iter().any(|c| c.soft_threshold_crossed.is_some());
        let remaining_budget = checks.iter().filter_map(|c| c.remaining_cost).fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a: f64| a.min(r))));

        let routing_decision = if self.config.enable_routing {
            snapshot.matching_routing_policy(tenant_id, strand_id, workflow_id).map(|policy| {
                select_model(
                    policy,
                    stage,
                    RoutingSignals {
                        soft_threshold_exceeded,
                        remaining_budget,
                        iteration_count: run.current_iteration,
                        latency_ms: None,
                    },
                )
            })
        } else {
            None
        };

        let remaining_tokens = token_budget.map(|max| max.saturating_sub(run.total_input_tokens + run.total_output_tokens) as u32);

        match routing_decision {
            Some(decision) if decision.was_downgraded => {
                let metric_labels = labels(tenant_id, strand_id, workflow_id, run_id, &self.config);
                Metrics::new(self.metrics.as_ref()).downgrade_event(&metric_labels, decision.reason.as_deref().unwrap_or("downgraded"));
                ModelDecision {
                    allowed: true,
                    effective_model: Some(decision.model),
                    max_tokens: tighter(decision.max_tokens, remaining_tokens),
                    was_downgraded: true,
                    reason: decision.reason,
                    warnings: estimate_warning(&snapshot.pricing, requested_model, prompt_tokens_estimate, remaining_budget),
                }
            }
            Some(decision) => ModelDecision {
                allowed: true,
                effective_model: Some(decision.model),
                max_tokens: tighter(decision.max_tokens, remaining_tokens),
                was_downgraded: false,
                reason: None,
                warnings: estimate_warning(&snapshot.pricing, requested_model, prompt_tokens_estimate, remaining_budget),
            },
            None => ModelDecision {
                allowed: true,
                effective_model: Some(requested_model.to_string()),
                max_tokens: remaining_tokens,
                was_downgraded: false,
                reason: None,
                warnings: estimate_warning(&snapshot.pricing, requested_model, prompt_tokens_estimate, remaining_budget),
            },
        }
    }

    pub fn after_model_call(
        &self,
        tenant_id: &str,
        strand_id: &str,
        workflow_id: &str,
        run_id: &str,
        model: &str,
        usage: ModelUsage,
        reported_cost: Option<f64>,
    ) {
        let snapshot = self.policy_store.current();
        let cost = match reported_cost {
            Some(c) if c != 0.0 => c,
            _ => snapshot.pricing.cost_of_model_call(model, usage),
        };

        self.budget_tracker
            .update_run_cost(run_id, Some(model), None, cost, usage.prompt_tokens, usage.completion_tokens);

        let metric_labels = labels(tenant_id, strand_id, workflow_id, run_id, &self.config);
        let metrics = Metrics::new(self.metrics.as_ref());
        metrics.cost_total(cost, &metric_labels);
        metrics.cost_model(cost, &metric_labels);
        metrics.tokens_input(usage.prompt_tokens, &metric_labels);
        metrics.tokens_output(usage.completion_tokens, &metric_labels);
    }

    pub fn before_tool_call(&self, tenant_id: &str, strand_id: &str, workflow_id: &str, run_id: &str, _tool_name: &str) -> ToolDecision {
        let Some(run) = self.budget_tracker.run_state(run_id) else {
            warn!(run_id, "before_tool_call on unknown run_id");
            return ToolDecision {
                allowed: true,
                ..Default::default()
            };
        };

        let snapshot = self.policy_store.current();
        let matching = snapshot.matching_budgets(tenant_id, strand_id, workflow_id);
        let max_tool_calls = matching
            .iter()
            .filter_map(|b| b.constraints.max_tool_calls_per_run)
            .min()
            .unwrap_or(DEFAULT_MAX_TOOL_CALLS);

        if self.config.enable_budget_enforcement && run.total_tool_calls >= max_tool_calls {
            return ToolDecision {
                allowed: false,
                reason: Some(format!("tool call {} at or past limit {}", run.total_tool_calls, max_tool_calls)),
                skip_tool_call: true,
                ..Default::default()
            };
        }

        ToolDecision {
            allowed: true,
            remaining_tool_calls: Some(max_tool_calls - run.total_tool_calls),
            ..Default::default()
        }
    }

    pub fn after_tool_call(
        &self,
        tenant_id: &str,
        strand_id: &str,
        workflow_id: &str,
        run_id: &str,
        tool_name: &str,
        usage: ToolUsage,
        reported_cost: Option<f64>,
    ) {
        let snapshot = self.policy_store.current();
        let cost = match reported_cost {
            Some(c) if c != 0.0 => c,
            _ => snapshot.pricing.cost_of_tool_call(tool_name, usage),
        };

        self.budget_tracker.update_run_cost(run_id, None, Some(tool_name), cost, 0, 0);

        let metric_labels = labels(tenant_id, strand_id, workflow_id, run_id, &self.config);
        let metrics = Metrics::new(self.metrics.as_ref());
        metrics.cost_total(cost, &metric_labels);
        metrics.cost_tool(cost, &metric_labels);
        metrics.tool_call(&metric_labels);
    }

    pub fn end_run(&self, tenant_id: &str, strand_id: &str, workflow_id: &str, run_id: &str, status: RunStatus) {
        let snapshot = self.policy_store.current();
        let matching = snapshot.matching_budgets(tenant_id, strand_id, workflow_id);

        self.budget_tracker.set_status(run_id, status);
        let final_state = self.budget_tracker.unregister_run(run_id, &matching);

        if let Some(state) = final_state {
            let metric_labels = labels(tenant_id, strand_id, workflow_id, run_id, &self.config);
            let metrics = Metrics::new(self.metrics.as_ref());
            metrics.cost_total(state.total_cost, &metric_labels);
            metrics.tokens_input(state.total_input_tokens, &metric_labels);
            metrics.tokens_output(state.total_output_tokens, &metric_labels);
        }
    }
}

fn tighter(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Pre-flight advisory: compare an estimated cost against remaining budget.
/// Never recorded against any budget.
fn estimate_warning(pricing: &crate::pricing::PricingTable, model: &str, prompt_tokens_estimate: u64, remaining_budget: Option<f64>) -> Vec<String> {
    let Some(remaining) = remaining_budget else {
        return Vec::new();
    };
    let estimate = pricing.estimate_model_call(
        model,
        ModelUsage {
            prompt_tokens: prompt_tokens_estimate,
            cached_tokens: 0,
            completion_tokens: 0,
            reasoning_tokens: 0,
        },
    );
    if estimate > remaining {
        vec![format!("estimated cost {:.4} exceeds remaining budget {:.4}", estimate, remaining)]
    } else {
        Vec::new()
    }
}
