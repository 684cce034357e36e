//! Metrics Emitter (C6): stateless record-only sink for usage and event
//! counters.
//!
//! Dimensional attributes are `tenant`, `strand`, `workflow`; `run_id` is
//! attached only when `MetricsConfig.emit_run_id` opts in, since it is
//! high-cardinality. Reasons are truncated to 100 characters once, here,
//! so every caller gets the guarantee for free.

const MAX_REASON_LEN: usize = 100;

/// Dimensional attributes shared by every emitted metric.
#[derive(Debug, Clone)]
pub struct MetricLabels {
    pub tenant_id: String,
    pub strand_id: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
}

/// Stable metric names.
pub mod names {
    pub const COST_TOTAL: &str = "cost.total";
    pub const COST_MODEL: &str = "cost.model";
    pub const COST_TOOL: &str = "cost.tool";
    pub const TOKENS_INPUT: &str = "tokens.input";
    pub const TOKENS_OUTPUT: &str = "tokens.output";
    pub const AGENT_ITERATIONS: &str = "agent.iterations";
    pub const AGENT_TOOL_CALLS: &str = "agent.tool_calls";
    pub const AGENT_RUNS: &str = "agent.runs";
    pub const COST_DOWNGRADE_EVENTS: &str = "cost.downgrade_events";
    pub const COST_REJECTION_EVENTS: &str = "cost.rejection_events";
    pub const COST_HALT_EVENTS: &str = "cost.halt_events";
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_REASON_LEN {
        reason.to_string()
    } else {
        reason.chars().take(MAX_REASON_LEN).collect()
    }
}

/// Sink for the lifecycle engine's usage and event counters.
///
/// Implementations must not fail — a metrics backend outage must never
/// affect an admission decision.
pub trait MetricsEmitter: Send + Sync {
    /// Record a monetary or token-count observation (backed by a histogram:
    /// these are continuous amounts, not integer tallies).
    fn record_amount(&self, name: &str, value: f64, labels: &MetricLabels);
    /// Increment an integer event tally by one.
    fn record_counter(&self, name: &str, labels: &MetricLabels);
    /// Increment an integer event tally by one, with an attached reason.
    fn record_event(&self, name: &str, labels: &MetricLabels, reason: Option<&str>);
}

/// Convenience helpers layered over the raw `MetricsEmitter` trait so
/// lifecycle call sites don't repeat the dimension plumbing.
pub struct Metrics<'a> {
    emitter: &'a dyn MetricsEmitter,
}

impl<'a> Metrics<'a> {
    pub fn new(emitter: &'a dyn MetricsEmitter) -> Self {
        Self { emitter }
    }

    pub fn cost_total(&self, amount: f64, labels: &MetricLabels) {
        self.emitter.record_amount(names::COST_TOTAL, amount, labels);
    }

    pub fn cost_model(&self, amount: f64, labels: &MetricLabels) {
        self.emitter.record_amount(names::COST_MODEL, amount, labels);
    }

    pub fn cost_tool(&self, amount: f64, labels: &MetricLabels) {
        self.emitter.record_amount(names::COST_TOOL, amount, labels);
    }

    pub fn tokens_input(&self, count: u64, labels: &MetricLabels) {
        self.emitter.record_amount(names::TOKENS_INPUT, count as f64, labels);
    }

    pub fn tokens_output(&self, count: u64, labels: &MetricLabels) {
        self.emitter.record_amount(names::TOKENS_OUTPUT, count as f64, labels);
    }

    pub fn iteration(&self, labels: &MetricLabels) {
        self.emitter.record_counter(names::AGENT_ITERATIONS, labels);
    }

    pub fn tool_call(&self, labels: &MetricLabels) {
        self.emitter.record_counter(names::AGENT_TOOL_CALLS, labels);
    }

    pub fn run_started(&self, labels: &MetricLabels) {
        self.emitter.record_counter(names::AGENT_RUNS, labels);
    }

    pub fn downgrade_event(&self, labels: &MetricLabels, reason: &str) {
        self.emitter
            .record_event(names::COST_DOWNGRADE_EVENTS, labels, Some(reason));
    }

    pub fn rejection_event(&self, labels: &MetricLabels, reason: &str) {
        self.emitter
            .record_event(names::COST_REJECTION_EVENTS, labels, Some(reason));
    }

    pub fn halt_event(&self, labels: &MetricLabels, reason: &str) {
        self.emitter.record_event(names::COST_HALT_EVENTS, labels, Some(reason));
    }
}

/// `MetricsEmitter` backed by the process-global `metrics` recorder
/// (installed separately via `metrics_exporter_prometheus`).
pub struct PrometheusMetricsEmitter {
    emit_run_id: bool,
}

impl PrometheusMetricsEmitter {
    pub fn new(emit_run_id: bool) -> Self {
        Self { emit_run_id }
    }

    /// `run_id` only when opted in.
    fn run_id_label(&self, labels: &MetricLabels) -> String {
        if self.emit_run_id {
            labels.run_id.clone().unwrap_or_default()
        } else {
            String::new()
        }
    }
}

impl MetricsEmitter for PrometheusMetricsEmitter {
    fn record_amount(&self, name: &str, value: f64, labels: &MetricLabels) {
        metrics::histogram!(
            name.to_string(),
            "tenant" => labels.tenant_id.clone(),
            "strand" => labels.strand_id.clone(),
            "workflow" => labels.workflow_id.clone(),
            "run_id" => self.run_id_label(labels)
        )
        .record(value);
    }

    fn record_counter(&self, name: &str, labels: &MetricLabels) {
        metrics::counter!(
            name.to_string(),
            "tenant" => labels.tenant_id.clone(),
            "strand" => labels.strand_id.clone(),
            "workflow" => labels.workflow_id.clone(),
            "run_id" => self.run_id_label(labels)
        )
        .increment(1);
    }

    fn record_event(&self, name: &str, labels: &MetricLabels, reason: Option<&str>) {
        metrics::counter!(
            name.to_string(),
            "tenant" => labels.tenant_id.clone(),
            "strand" => labels.strand_id.clone(),
            "workflow" => labels.workflow_id.clone(),
            "run_id" => self.run_id_label(labels),
            "reason" => reason.map(truncate_reason).unwrap_or_default()
        )
        .increment(1);
    }
}

/// In-memory recording fake for tests: captures every call instead of
/// talking to a real backend.
#[derive(Default)]
pub struct RecordingMetricsEmitter {
    pub counters: dashmap::DashMap<String, Vec<f64>>,
    pub events: dashmap::DashMap<String, Vec<Option<String>>>,
}

impl RecordingMetricsEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_calls(&self, name: &str) -> usize {
        self.counters.get(name).map(|v| v.len()).unwrap_or(0)
    }

    pub fn event_reasons(&self, name: &str) -> Vec<Option<String>> {
        self.events.get(name).map(|v| v.clone()).unwrap_or_default()
    }
}

impl MetricsEmitter for RecordingMetricsEmitter {
    fn record_amount(&self, name: &str, value: f64, _labels: &MetricLabels) {
        self.counters.entry(name.to_string()).or_default().push(value);
    }

    fn record_counter(&self, name: &str, _labels: &MetricLabels) {
        self.counters.entry(name.to_string()).or_default().push(1.0);
    }

    fn record_event(&self, name: &str, _labels: &MetricLabels, reason: Option<&str>) {
        self.events
            .entry(name.to_string())
            .or_default()
            .push(reason.map(truncate_reason));
    }
}
