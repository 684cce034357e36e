//! Crate-wide error taxonomy.
//!
//! Decisions returned by the lifecycle hooks are values, never exceptions
//! (see `lifecycle`); the only conditions that raise are policy-load-time
//! and store-call-time failures, modeled here.

use thiserror::Error;

/// Errors raised while loading or reloading a policy snapshot.
#[derive(Debug, Error)]
pub enum PolicyLoadError {
    #[error("policy source failed: {0}")]
    Source(String),

    #[error("ambiguous pricing prefix: '{0}' is a prefix of another configured model name")]
    AmbiguousPricingPrefix(String),

    #[error("invalid policy dictionary: {0}")]
    InvalidDictionary(String),
}

/// Errors raised by the durable `BudgetStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out")]
    Timeout,

    #[error("optimistic concurrency conflict exhausted retries")]
    ConflictExhausted,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
