//! Budget Tracker (C3): in-memory run and period-usage bookkeeping.
//!
//! Every accumulator lives behind a `DashMap`, striped by key, so concurrent
//! runs touching different scopes never contend. Two keyspaces exist: one
//! entry per in-flight run (`RunState`, keyed by `run_id`), and one entry per
//! `(budget_id, scope_key, period_start)` (`PeriodUsage`), which rolls over
//! lazily on access.
//!
//! Mid-run cost lives only on `RunState`; it lands on `PeriodUsage` at
//! `unregister_run`. Admission decisions therefore never see an in-flight
//! run's partial spend — period totals are monotonic between run endings,
//! and each run's hot path only ever contends on its own `run_id` entry.

pub mod period;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::config::FailureMode;
use crate::policy::{BudgetSpec, Period, Scope};
use store::{retry_on_conflict, BudgetStore, StoredPeriodUsage};

/// Identifying context for a single agent run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub tenant_id: String,
    pub strand_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Halted,
    Rejected,
}

/// Live accounting for a single run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub context: RunContext,
    pub current_iteration: u32,
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tool_calls: u32,
    pub model_costs: std::collections::HashMap<String, f64>,
    pub tool_costs: std::collections::HashMap<String, f64>,
    pub status: RunStatus,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunState {
    fn new(context: RunContext) -> Self {
        Self {
            context,
            current_iteration: 0,
            total_cost: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_tool_calls: 0,
            model_costs: Default::default(),
            tool_costs: Default::default(),
            status: RunStatus::Running,
            ended_at: None,
        }
    }
}

/// Period-scoped accumulator for one `(budget_id, scope_key)` pair. Rolls over to a fresh accumulator whenever `now` has moved
/// past `period_end`; the concurrent-run set survives the rollover since
/// those runs are still in flight.
#[derive(Debug, Clone)]
pub struct PeriodUsage {
    pub budget_id: String,
    pub scope_key: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_cost: f64,
    pub total_runs: u64,
    pub concurrent_runs: HashSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl PeriodUsage {
    fn new(budget_id: &str, scope_key: &str, period: Period, now: DateTime<Utc>) -> Self {
        let (period_start, period_end) = period::window_containing(period, now);
        Self {
            budget_id: budget_id.to_string(),
            scope_key: scope_key.to_string(),
            period_start,
            period_end,
            total_cost: 0.0,
            total_runs: 0,
            concurrent_runs: HashSet::new(),
            updated_at: now,
        }
    }

    fn roll_if_expired(&mut self, period: Period, now: DateTime<Utc>) {
        if now < self.period_end {
            return;
        }
        let (period_start, period_end) = period::window_containing(period, now);
        self.period_start = period_start;
        self.period_end = period_end;
        self.total_cost = 0.0;
        self.total_runs = 0;
        // concurrent_runs carries over: those runs are still in flight.
        self.updated_at = now;
    }

    fn from_stored(stored: StoredPeriodUsage, now: DateTime<Utc>) -> Self {
        Self {
            budget_id: stored.budget_id,
            scope_key: stored.scope_key,
            period_start: stored.period_start,
            period_end: stored.period_end,
            total_cost: stored.total_cost,
            total_runs: stored.total_runs,
            concurrent_runs: stored.concurrent_run_ids,
            updated_at: now,
        }
    }
}

/// Derive the scope key a `BudgetSpec` of a given `Scope` accumulates under.
pub fn scope_key(scope: Scope, budget_id: &str, tenant_id: &str, strand_id: &str, workflow_id: &str) -> String {
    match scope {
        Scope::Global => format!("global:{}", budget_id),
        Scope::Tenant => format!("tenant:{}:{}", tenant_id, budget_id),
        Scope::Strand => format!("strand:{}:{}:{}", tenant_id, strand_id, budget_id),
        Scope::Workflow => format!("workflow:{}:{}:{}:{}", tenant_id, strand_id, workflow_id, budget_id),
    }
}

/// Result of a read-only evaluation of one `BudgetSpec`'s current
/// `PeriodUsage`.
#[derive(Debug, Clone)]
pub struct BudgetCheck {
    pub budget_id: String,
    pub fraction_used: f64,
    pub hard_limit_exceeded: bool,
    pub runs_exceeded: bool,
    pub concurrent_exceeded: bool,
    pub soft_threshold_crossed: Option<f64>,
    pub remaining_cost: Option<f64>,
}

impl BudgetCheck {
    /// Any of the three limit conditions `check_budget_limits` assigns:
    /// `utilization ≥ 1.0 && hard_limit`,
    /// `total_runs ≥ max_runs_per_period`, `|concurrent_runs| ≥
    /// max_concurrent_runs`.
    pub fn limit_exceeded(&self) -> bool {
        self.hard_limit_exceeded || self.runs_exceeded || self.concurrent_exceeded
    }
}

/// C3 — Budget Tracker. Keyed `DashMap`s give each run and each scope its own
/// lock, so unrelated tenants/strands never block one another.
///
/// A `BudgetStore` is optional: without one, everything lives in the two
/// `DashMap`s and is lost on restart. With one, a scope's first access
/// hydrates from the durable record instead of starting fresh, and
/// `unregister_run` writes the commit through.
#[derive(Default)]
pub struct BudgetTracker {
    runs: DashMap<String, RunState>,
    usage: DashMap<String, PeriodUsage>,
    store: Option<Arc<dyn BudgetStore>>,
    failure_mode: FailureMode,
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// As [`Self::new`], backed by a durable `BudgetStore`. `failure_mode`
    /// governs what happens to a scope's in-memory state when a write-through
    /// to the store fails: `FailOpen` keeps serving the (now possibly
    /// store-divergent) in-memory value, `FailClosed` evicts it so the next
    /// access re-hydrates from the store rather than trusting an unconfirmed
    /// local commit.
    pub fn with_store(store: Arc<dyn BudgetStore>, failure_mode: FailureMode) -> Self {
        Self {
            store: Some(store),
            failure_mode,
            ..Self::default()
        }
    }

    fn usage_entry(&self, budget: &BudgetSpec, tenant_id: &str, strand_id: &str, workflow_id: &str, now: DateTime<Utc>) -> String {
        let key = scope_key(budget.scope, &budget.id, tenant_id, strand_id, workflow_id);
        let mut usage = self.usage.entry(key.clone()).or_insert_with(|| {
            let (period_start, period_end) = period::window_containing(budget.period, now);
            match &self.store {
                Some(store) => match store.get_or_create(&key, &budget.id, period_start, period_end) {
                    Ok((stored, _token)) => PeriodUsage::from_stored(stored, now),
                    Err(e) => {
                        tracing::warn!(scope_key = %key, error = %e, "durable store hydrate failed, starting from a fresh in-memory accumulator");
                        PeriodUsage::new(&budget.id, &key, budget.period, now)
                    }
                },
                None => PeriodUsage::new(&budget.id, &key, budget.period, now),
            }
        });
        usage.roll_if_expired(budget.period, now);
        key
    }

    /// Write the per-run commit (`cost_delta`, a run-count increment, and
    /// the `run_id`'s removal from the concurrent set) through to the
    /// durable store, retrying on optimistic-concurrency conflict. On
    /// failure, logs and, under `FailureMode::FailClosed`, evicts the
    /// scope's cached `PeriodUsage` so the next access re-hydrates.
    fn commit_to_store(&self, key: &str, cost_delta: f64, run_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let store = store.as_ref();

        let result = retry_on_conflict(store, key, || {
            store.increment_cost(key, cost_delta)?;
            store.increment_run_count(key)?;
            store.remove_concurrent_run(key, run_id)?;
            Ok(())
        });

        if let Err(e) = result {
            tracing::error!(scope_key = key, run_id, error = %e, "durable store commit failed");
            if self.failure_mode == FailureMode::FailClosed {
                self.usage.remove(key);
            }
        }
    }

    /// Create the `RunState` and add `run_id` to every matching budget's
    /// concurrent-run set. Period totals are
    /// untouched.
    pub fn register_run(&self, context: RunContext, matching_budgets: &[&BudgetSpec]) {
        let run_id = context.run_id.clone();
        let (tenant_id, strand_id, workflow_id, now) = (
            context.tenant_id.clone(),
            context.strand_id.clone(),
            context.workflow_id.clone(),
            context.started_at,
        );

        self.runs.insert(run_id.clone(), RunState::new(context));

        for budget in matching_budgets {
            let key = self.usage_entry(budget, &tenant_id, &strand_id, &workflow_id, now);
            self.usage.get_mut(&key).unwrap().concurrent_runs.insert(run_id.clone());
        }
    }

    /// Remove `run_id` from every matching budget's concurrent set, commit
    /// its accrued totals into each matching `PeriodUsage`, increment
    /// `total_runs`, and drop the `RunState`.
    /// Returns the final `RunState` if one existed.
    pub fn unregister_run(&self, run_id: &str, matching_budgets: &[&BudgetSpec]) -> Option<RunState> {
        self.unregister_run_at(run_id, matching_budgets, Utc::now())
    }

    /// As [`Self::unregister_run`], evaluating rollover against an explicit
    /// `now` instead of the wall clock (used by tests that exercise period
    /// boundaries).
    pub fn unregister_run_at(&self, run_id: &str, matching_budgets: &[&BudgetSpec], now: DateTime<Utc>) -> Option<RunState> {
        let (_, state) = self.runs.remove(run_id)?;

        for budget in matching_budgets {
            let key = self.usage_entry(
                budget,
                &state.context.tenant_id,
                &state.context.strand_id,
                &state.context.workflow_id,
                now,
            );
            {
                let mut usage = self.usage.get_mut(&key).unwrap();
                usage.concurrent_runs.remove(run_id);
                usage.total_cost += state.total_cost;
                usage.total_runs += 1;
                usage.updated_at = now;
            }
            self.commit_to_store(&key, state.total_cost, run_id);
        }

        Some(state)
    }

    /// Accrue a cost delta into the `RunState` only.
    pub fn update_run_cost(&self, run_id: &str, model: Option<&str>, tool: Option<&str>, cost: f64, input_tokens: u64, output_tokens: u64) {
        if let Some(mut run) = self.runs.get_mut(run_id) {
            run.total_cost += cost;
            run.total_input_tokens += input_tokens;
            run.total_output_tokens += output_tokens;
            if let Some(model) = model {
                *run.model_costs.entry(model.to_string()).or_insert(0.0) += cost;
            }
            if let Some(tool) = tool {
                run.total_tool_calls += 1;
                *run.tool_costs.entry(tool.to_string()).or_insert(0.0) += cost;
            }
        }
    }

    pub fn advance_iteration(&self, run_id: &str) -> Option<u32> {
        self.runs.get_mut(run_id).map(|mut run| {
            run.current_iteration += 1;
            run.current_iteration
        })
    }

    pub fn set_status(&self, run_id: &str, status: RunStatus) {
        if let Some(mut run) = self.runs.get_mut(run_id) {
            run.status = status;
            run.ended_at = Some(Utc::now());
        }
    }

    pub fn run_state(&self, run_id: &str) -> Option<RunState> {
        self.runs.get(run_id).map(|r| r.clone())
    }

    /// Read-only evaluation of each matching budget's current `PeriodUsage`.
    /// Budgets without a configured
    /// `max_cost` always report `fraction_used = 0.0` and never hard-limit.
    pub fn check_budget_limits(&self, tenant_id: &str, strand_id: &str, workflow_id: &str, matching_budgets: &[&BudgetSpec]) -> Vec<BudgetCheck> {
        self.check_budget_limits_at(tenant_id, strand_id, workflow_id, matching_budgets, Utc::now())
    }

    /// As [`Self::check_budget_limits`], evaluating rollover against an
    /// explicit `now`.
    pub fn check_budget_limits_at(
        &self,
        tenant_id: &str,
        strand_id: &str,
        workflow_id: &str,
        matching_budgets: &[&BudgetSpec],
        now: DateTime<Utc>,
    ) -> Vec<BudgetCheck> {
        matching_budgets
            .iter()
            .map(|budget| {
                let key = self.usage_entry(budget, tenant_id, strand_id, workflow_id, now);
                let usage = self.usage.get(&key).unwrap();

                let (fraction_used, remaining_cost) = match budget.max_cost {
                    Some(max_cost) if max_cost > 0.0 => (usage.total_cost / max_cost, Some((max_cost - usage.total_cost).max(0.0))),
                    Some(_) => (f64::INFINITY, Some(0.0)),
                    None => (0.0, None),
                };

                let soft_threshold_crossed = budget
                    .soft_thresholds
                    .iter()
                    .copied()
                    .filter(|t| fraction_used >= *t)
                    .fold(None, |acc: Option<f64>, t| match acc {
                        Some(a) if a >= t => Some(a),
                        _ => Some(t),
                    });

                let runs_exceeded = budget
                    .max_runs_per_period
                    .is_some_and(|max_runs| usage.total_runs >= max_runs);
                let concurrent_exceeded = budget
                    .max_concurrent_runs
                    .is_some_and(|max_concurrent| usage.concurrent_runs.len() as u64 >= max_concurrent);

                BudgetCheck {
                    budget_id: budget.id.clone(),
                    fraction_used,
                    hard_limit_exceeded: budget.hard_limit && fraction_used >= 1.0,
                    runs_exceeded,
                    concurrent_exceeded,
                    soft_threshold_crossed,
                    remaining_cost,
                }
            })
            .collect()
    }

    pub fn period_usage(&self, tenant_id: &str, strand_id: &str, workflow_id: &str, budget: &BudgetSpec) -> Option<PeriodUsage> {
        let key = scope_key(budget.scope, &budget.id, tenant_id, strand_id, workflow_id);
        self.usage.get(&key).map(|u| u.clone())
    }
}
