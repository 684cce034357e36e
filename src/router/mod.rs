//! Adaptive Router (C4): picks an effective model per stage from budget,
//! iteration, and latency signals.

use crate::policy::{RoutingPolicy, Stage};

/// Signals a caller supplies so the router can evaluate
/// `trigger_downgrade_on` conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingSignals {
    pub soft_threshold_exceeded: bool,
    pub remaining_budget: Option<f64>,
    pub iteration_count: u32,
    pub latency_ms: Option<f64>,
}

/// Result of `select_model`.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub model: String,
    pub max_tokens: Option<u32>,
    pub was_downgraded: bool,
    pub reason: Option<String>,
}

/// Select an effective model for `stage` given `signals`.
///
/// If the policy has a stage config for `stage` with a `fallback_model`,
/// each `trigger_downgrade_on` condition is checked in a fixed order; the
/// first one satisfied wins and returns the fallback. Otherwise the stage's
/// `default_model` is used. If there is no stage config at all, the
/// policy's top-level `default_model` is returned with no `max_tokens` and
/// `was_downgraded = false`.
pub fn select_model(policy: &RoutingPolicy, stage: Stage, signals: RoutingSignals) -> RoutingDecision {
    let Some(stage_config) = policy.stage_config(stage) else {
        return RoutingDecision {
            model: policy.default_model.clone(),
            max_tokens: None,
            was_downgraded: false,
            reason: None,
        };
    };

    let Some(fallback) = &stage_config.fallback_model else {
        return RoutingDecision {
            model: stage_config.default_model.clone(),
            max_tokens: stage_config.max_tokens,
            was_downgraded: false,
            reason: None,
        };
    };

    let trigger = &stage_config.trigger_downgrade_on;

    // Each condition is checked independently in turn; a condition that is
    // configured but not currently satisfied falls through to the next one
    // instead of short-circuiting the whole chain.
    let mut downgrade_reason = None;

    if trigger.soft_threshold_exceeded == Some(true) && signals.soft_threshold_exceeded {
        downgrade_reason = Some("soft threshold exceeded".to_string());
    }

    if downgrade_reason.is_none() {
        if let Some(floor) = trigger.remaining_budget_below {
            if let Some(remaining) = signals.remaining_budget.filter(|remaining| *remaining < floor) {
                downgrade_reason = Some(format!("remaining budget {:.4} below threshold {:.4}", remaining, floor));
            }
        }
    }

    if downgrade_reason.is_none() {
        if let Some(max_iter) = trigger.iteration_count_above {
            if signals.iteration_count > max_iter {
                downgrade_reason = Some(format!("iteration {} above threshold {}", signals.iteration_count, max_iter));
            }
        }
    }

    if downgrade_reason.is_none() {
        if let Some(max_latency) = trigger.latency_above_ms {
            if let Some(latency) = signals.latency_ms.filter(|latency| *latency > max_latency) {
                downgrade_reason = Some(format!("latency {:.1}ms above threshold {:.1}ms", latency, max_latency));
            }
        }
    }

    match downgrade_reason {
        Some(reason) => RoutingDecision {
            model: fallback.clone(),
            max_tokens: stage_config.max_tokens,
            was_downgraded: true,
            reason: Some(truncate_reason(&reason)),
        },
        None => RoutingDecision {
            model: stage_config.default_model.clone(),
            max_tokens: stage_config.max_tokens,
            was_downgraded: false,
            reason: None,
        },
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= 100 {
        reason.to_string()
    } else {
        reason.chars().take(100).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{DowngradeTrigger, MatchFields, StageConfig};

    fn policy_with_stage(config: StageConfig) -> RoutingPolicy {
        RoutingPolicy {
            id: "p1".to_string(),
            match_fields: MatchFields::default(),
            stages: vec![config],
            default_model: "top-level-default".to_string(),
        }
    }

    #[test]
    fn test_no_stage_config_returns_top_level_default() {
        let policy = RoutingPolicy {
            id: "p1".to_string(),
            match_fields: MatchFields::default(),
            stages: vec![],
            default_model: "top-level-default".to_string(),
        };
        let decision = select_model(&policy, Stage::Synthesis, RoutingSignals::default());
        assert_eq!(decision.model, "top-level-default");
        assert!(!decision.was_downgraded);
        assert_eq!(decision.max_tokens, None);
    }

    #[test]
    fn test_stage_with_no_fallback_returns_default() {
        let policy = policy_with_stage(StageConfig {
            stage: Some(Stage::Synthesis),
            default_model: "gpt-4o".to_string(),
            fallback_model: None,
            max_tokens: Some(4096),
            temperature: None,
            trigger_downgrade_on: DowngradeTrigger::default(),
        });
        let decision = select_model(&policy, Stage::Synthesis, RoutingSignals::default());
        assert_eq!(decision.model, "gpt-4o");
        assert!(!decision.was_downgraded);
        assert_eq!(decision.max_tokens, Some(4096));
    }

    #[test]
    fn test_soft_threshold_triggers_downgrade() {
        let policy = policy_with_stage(StageConfig {
            stage: Some(Stage::Synthesis),
            default_model: "gpt-4o".to_string(),
            fallback_model: Some("gpt-4o-mini".to_string()),
            max_tokens: Some(2048),
            temperature: None,
            trigger_downgrade_on: DowngradeTrigger {
                soft_threshold_exceeded: Some(true),
                ..DowngradeTrigger::default()
            },
        });
        let signals = RoutingSignals {
            soft_threshold_exceeded: true,
            ..RoutingSignals::default()
        };
        let decision = select_model(&policy, Stage::Synthesis, signals);
        assert_eq!(decision.model, "gpt-4o-mini");
        assert!(decision.was_downgraded);
        assert!(decision.reason.is_some());
    }

    #[test]
    fn test_remaining_budget_below_triggers_downgrade() {
        let policy = policy_with_stage(StageConfig {
            stage: Some(Stage::Planning),
            default_model: "gpt-4o".to_string(),
            fallback_model: Some("gpt-4o-mini".to_string()),
            max_tokens: None,
            temperature: None,
            trigger_downgrade_on: DowngradeTrigger {
                remaining_budget_below: Some(5.0),
                ..DowngradeTrigger::default()
            },
        });
        let signals = RoutingSignals {
            remaining_budget: Some(1.0),
            ..RoutingSignals::default()
        };
        let decision = select_model(&policy, Stage::Planning, signals);
        assert_eq!(decision.model, "gpt-4o-mini");
        assert!(decision.was_downgraded);
    }

    #[test]
    fn test_iteration_count_above_triggers_downgrade() {
        let policy = policy_with_stage(StageConfig {
            stage: Some(Stage::ToolSelection),
            default_model: "gpt-4o".to_string(),
            fallback_model: Some("gpt-4o-mini".to_string()),
            max_tokens: None,
            temperature: None,
            trigger_downgrade_on: DowngradeTrigger {
                iteration_count_above: Some(3),
                ..DowngradeTrigger::default()
            },
        });
        let signals = RoutingSignals {
            iteration_count: 5,
            ..RoutingSignals::default()
        };
        let decision = select_model(&policy, Stage::ToolSelection, signals);
        assert!(decision.was_downgraded);
    }

    #[test]
    fn test_later_condition_triggers_when_earlier_configured_condition_not_met() {
        let policy = policy_with_stage(StageConfig {
            stage: Some(Stage::Synthesis),
            default_model: "gpt-4o".to_string(),
            fallback_model: Some("gpt-4o-mini".to_string()),
            max_tokens: None,
            temperature: None,
            trigger_downgrade_on: DowngradeTrigger {
                remaining_budget_below: Some(5.0),
                iteration_count_above: Some(10),
                ..DowngradeTrigger::default()
            },
        });
        let signals = RoutingSignals {
            remaining_budget: Some(50.0),
            iteration_count: 20,
            ..RoutingSignals::default()
        };
        let decision = select_model(&policy, Stage::Synthesis, signals);
        assert!(decision.was_downgraded);
        assert_eq!(decision.model, "gpt-4o-mini");
        assert!(decision.reason.unwrap().contains("iteration"));
    }

    #[test]
    fn test_condition_not_met_keeps_default() {
        let policy = policy_with_stage(StageConfig {
            stage: Some(Stage::Synthesis),
            default_model: "gpt-4o".to_string(),
            fallback_model: Some("gpt-4o-mini".to_string()),
            max_tokens: None,
            temperature: None,
            trigger_downgrade_on: DowngradeTrigger {
                iteration_count_above: Some(10),
                ..DowngradeTrigger::default()
            },
        });
        let signals = RoutingSignals {
            iteration_count: 2,
            ..RoutingSignals::default()
        };
        let decision = select_model(&policy, Stage::Synthesis, signals);
        assert_eq!(decision.model, "gpt-4o");
        assert!(!decision.was_downgraded);
    }

    #[test]
    fn test_reason_truncated_to_100_chars() {
        let policy = policy_with_stage(StageConfig {
            stage: Some(Stage::Planning),
            default_model: "gpt-4o".to_string(),
            fallback_model: Some("gpt-4o-mini".to_string()),
            max_tokens: None,
            temperature: None,
            trigger_downgrade_on: DowngradeTrigger {
                remaining_budget_below: Some(999999999.123456789),
                ..DowngradeTrigger::default()
            },
        });
        let signals = RoutingSignals {
            remaining_budget: Some(0.0),
            ..RoutingSignals::default()
        };
        let decision = select_model(&policy, Stage::Planning, signals);
        assert!(decision.reason.unwrap().len() <= 100);
    }
}
