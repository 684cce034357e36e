//! Optional durable backing store for `PeriodUsage`.
//!
//! The core only requires one primitive from a durable store: optimistic
//! concurrency via a compare-and-set. The crate ships an in-memory
//! implementation (a test/no-op double); a host backs this with Redis,
//! Postgres, etc. by implementing `BudgetStore`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;

use crate::error::StoreError;

/// Opaque optimistic-concurrency version counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareToken(pub u64);

/// Durable representation of a `PeriodUsage`.
#[derive(Debug, Clone)]
pub struct StoredPeriodUsage {
    pub budget_id: String,
    pub scope_key: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_cost: f64,
    pub total_runs: u64,
    pub concurrent_run_ids: HashSet<String>,
}

impl StoredPeriodUsage {
    fn new(scope_key: &str, budget_id: &str, period_start: DateTime<Utc>, period_end: DateTime<Utc>) -> Self {
        Self {
            budget_id: budget_id.to_string(),
            scope_key: scope_key.to_string(),
            period_start,
            period_end,
            total_cost: 0.0,
            total_runs: 0,
            concurrent_run_ids: HashSet::new(),
        }
    }
}

/// The six operations a durable backing store must provide.
pub trait BudgetStore: Send + Sync {
    fn get(&self, scope_key: &str) -> Result<Option<(StoredPeriodUsage, CompareToken)>, StoreError>;

    fn set(
        &self,
        scope_key: &str,
        state: StoredPeriodUsage,
        expected: Option<CompareToken>,
    ) -> Result<CompareToken, StoreError>;

    fn get_or_create(
        &self,
        scope_key: &str,
        budget_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<(StoredPeriodUsage, CompareToken), StoreError>;

    fn increment_cost(&self, scope_key: &str, amount: f64) -> Result<(), StoreError>;

    fn increment_run_count(&self, scope_key: &str) -> Result<(), StoreError>;

    fn remove_concurrent_run(&self, scope_key: &str, run_id: &str) -> Result<(), StoreError>;

    fn list_budgets(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// `BudgetStore` backed by an in-process `DashMap`. Serves as a no-op
/// implementation so tests don't need a real backend.
#[derive(Default)]
pub struct InMemoryBudgetStore {
    entries: DashMap<String, (StoredPeriodUsage, CompareToken)>,
}

impl InMemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BudgetStore for InMemoryBudgetStore {
    fn get(&self, scope_key: &str) -> Result<Option<(StoredPeriodUsage, CompareToken)>, StoreError> {
        Ok(self.entries.get(scope_key).map(|e| e.value().clone()))
    }

    fn set(
        &self,
        scope_key: &str,
        state: StoredPeriodUsage,
        expected: Option<CompareToken>,
    ) -> Result<CompareToken, StoreError> {
        let mut entry = self
            .entries
            .entry(scope_key.to_string())
            .or_insert_with(|| (state.clone(), CompareToken(0)));

        if let Some(expected) = expected {
            if entry.1 != expected {
                return Err(StoreError::ConflictExhausted);
            }
        }

        let next = CompareToken(entry.1 .0 + 1);
        *entry = (state, next);
        Ok(next)
    }

    fn get_or_create(
        &self,
        scope_key: &str,
        budget_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<(StoredPeriodUsage, CompareToken), StoreError> {
        let entry = self.entries.entry(scope_key.to_string()).or_insert_with(|| {
            (
                StoredPeriodUsage::new(scope_key, budget_id, period_start, period_end),
                CompareToken(0),
            )
        });
        Ok(entry.value().clone())
    }

    fn increment_cost(&self, scope_key: &str, amount: f64) -> Result<(), StoreError> {
        let mut entry = self
            .entries
            .get_mut(scope_key)
            .ok_or_else(|| StoreError::Unavailable(format!("no entry for {}", scope_key)))?;
        entry.0.total_cost += amount;
        entry.1 = CompareToken(entry.1 .0 + 1);
        Ok(())
    }

    fn increment_run_count(&self, scope_key: &str) -> Result<(), StoreError> {
        let mut entry = self
            .entries
            .get_mut(scope_key)
            .ok_or_else(|| StoreError::Unavailable(format!("no entry for {}", scope_key)))?;
        entry.0.total_runs += 1;
        entry.1 = CompareToken(entry.1 .0 + 1);
        Ok(())
    }

    fn remove_concurrent_run(&self, scope_key: &str, run_id: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.entries.get_mut(scope_key) {
            entry.0.concurrent_run_ids.remove(run_id);
            entry.1 = CompareToken(entry.1 .0 + 1);
        }
        Ok(())
    }

    fn list_budgets(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let prefix = pattern.trim_end_matches('*');
        Ok(self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

/// Apply `mutate` to the store entry at `scope_key` with up to 3 retries on
/// optimistic-concurrency conflict. Returns the last error
/// if all retries are exhausted.
pub fn retry_on_conflict<F>(store: &dyn BudgetStore, scope_key: &str, mut mutate: F) -> Result<(), StoreError>
where
    F: FnMut() -> Result<(), StoreError>,
{
    let mut attempts = 0;
    loop {
        match mutate() {
            Ok(()) => return Ok(()),
            Err(StoreError::ConflictExhausted) if attempts < 3 => {
                attempts += 1;
                tracing::warn!(scope_key, attempts, "retrying store mutation after conflict");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}
