//! Rule registry and the built-in pipeline rule set

use std::collections::BTreeMap;
use std::time::Duration;

use super::condition::{CompareOp, Condition, ConditionError, Operand};
use super::types::{AlertRule, EscalationPolicy, Severity};

/// Named rule definitions keyed by rule id
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: BTreeMap<String, AlertRule>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with [`builtin_rules`]
    pub fn with_builtin_rules() -> Self {
        Self::from_rules(builtin_rules())
    }

    /// Registry holding every valid rule of `rules`; invalid ones are logged and skipped
    pub fn from_rules(rules: impl IntoIterator<Item = AlertRule>) -> Self {
        let mut registry = Self::new();
        for rule in rules {
            let rule_id = rule.id.clone();
            if let Err(e) = registry.insert(rule) {
                tracing::error!(rule_id = %rule_id, error = %e, "Skipping invalid rule");
            }
        }
        registry
    }

    /// Insert or replace a rule; returns the replaced rule, if any
    pub fn insert(&mut self, rule: AlertRule) -> Result<Option<AlertRule>, RuleError> {
        validate_rule(&rule)?;
        Ok(self.rules.insert(rule.id.clone(), rule))
    }

    pub fn remove(&mut self, id: &str) -> Option<AlertRule> {
        self.rules.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&AlertRule> {
        self.rules.get(id)
    }

    /// Enable/disable a rule; false if unknown
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.rules.get_mut(id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Rules in id order
    pub fn iter(&self) -> impl Iterator<Item = &AlertRule> {
        self.rules.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &AlertRule> {
        self.rules.values().filter(|r| r.enabled)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Rule definition errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("Rule id must not be empty")]
    EmptyId,

    #[error("Invalid condition: {0}")]
    InvalidCondition(ConditionError),

    #[error("Invalid auto-resolve condition: {0}")]
    InvalidAutoResolve(ConditionError),

    #[error("Rule {0} uses threshold but defines none")]
    MissingThreshold(String),

    #[error("Invalid escalation policy: {0}")]
    InvalidEscalation(String),
}

/// Check a rule before it enters the registry
pub fn validate_rule(rule: &AlertRule) -> Result<(), RuleError> {
    if rule.id.trim().is_empty() {
        return Err(RuleError::EmptyId);
    }

    rule.condition
        .validate()
        .map_err(RuleError::InvalidCondition)?;

    if let Some(auto_resolve) = &rule.auto_resolve {
        auto_resolve
            .validate()
            .map_err(RuleError::InvalidAutoResolve)?;
    }

    let uses_threshold = rule.condition.uses_threshold()
        || rule
            .auto_resolve
            .as_ref()
            .map_or(false, Condition::uses_threshold);
    if uses_threshold && rule.threshold.is_none() {
        return Err(RuleError::MissingThreshold(rule.id.clone()));
    }

    if let Some(policy) = &rule.escalation {
        if policy.steps.is_empty() {
            return Err(RuleError::InvalidEscalation("no steps".to_string()));
        }
        if policy.steps.iter().any(|s| s.channels.is_empty()) {
            return Err(RuleError::InvalidEscalation(
                "every step needs at least one channel".to_string(),
            ));
        }
    }

    Ok(())
}

/// Rules shipped for a long-running collection pipeline
pub fn builtin_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "memory_high",
            "High memory usage",
            Severity::Warning,
            Condition::metric_vs_threshold("system.memory_percent", CompareOp::Gt),
        )
        .with_description("Process memory usage is above the configured threshold")
        .with_threshold(80.0)
        .with_cooldown(Duration::from_secs(20 * 60))
        .with_auto_resolve(Condition::metric_below("system.memory_percent", 70.0))
        .with_tag("system"),
        AlertRule::new(
            "cpu_high",
            "High CPU usage",
            Severity::Warning,
            Condition::metric_vs_threshold("system.cpu_percent", CompareOp::Gt),
        )
        .with_description("CPU usage stayed above the threshold for several checks")
        .with_threshold(90.0)
        .with_cooldown(Duration::from_secs(15 * 60))
        .with_min_triggers(3, Duration::from_secs(10 * 60))
        .with_auto_resolve(Condition::metric_below("system.cpu_percent", 75.0))
        .with_tag("system"),
        AlertRule::new(
            "disk_space_low",
            "Low disk space",
            Severity::Error,
            Condition::metric_vs_threshold("system.disk_percent", CompareOp::Ge),
        )
        .with_description("Disk usage is close to capacity; collected data may be lost")
        .with_threshold(90.0)
        .with_cooldown(Duration::from_secs(60 * 60))
        .with_auto_resolve(Condition::metric_below("system.disk_percent", 85.0))
        .with_escalation(EscalationPolicy::new(
            Duration::from_secs(30 * 60),
            vec!["log".to_string()],
            2,
        ))
        .with_tag("system"),
        AlertRule::new(
            "api_error_rate_high",
            "High API error rate",
            Severity::Error,
            Condition::all(vec![
                Condition::metric_above("api.requests", 0.0),
                Condition::metric_vs_threshold("api.error_rate", CompareOp::Gt),
            ]),
        )
        .with_description("Upstream API requests are failing above the threshold rate")
        .with_threshold(0.1)
        .with_cooldown(Duration::from_secs(10 * 60))
        .with_auto_resolve(Condition::metric_below("api.error_rate", 0.05))
        .with_tag("api"),
        AlertRule::new(
            "api_down",
            "All API sources down",
            Severity::Critical,
            Condition::all(vec![
                Condition::metric_above("api.sources", 0.0),
                Condition::compare(
                    Operand::Metric("api.healthy_sources".to_string()),
                    CompareOp::Eq,
                    Operand::Value(0.0),
                ),
            ]),
        )
        .with_description("No upstream API source is reachable")
        .with_cooldown(Duration::from_secs(5 * 60))
        .with_auto_resolve(Condition::metric_above("api.healthy_sources", 0.0))
        .with_escalation(
            EscalationPolicy::new(Duration::from_secs(10 * 60), vec!["log".to_string()], 1)
                .then(Duration::from_secs(30 * 60), vec!["webhook".to_string()]),
        )
        .with_tag("api"),
        AlertRule::new(
            "collection_stalled",
            "Collection stalled",
            Severity::Error,
            Condition::metric_vs_threshold("collection.seconds_since_progress", CompareOp::Gt),
        )
        .with_description("No collector has made progress within the threshold")
        .with_threshold(15.0 * 60.0)
        .with_cooldown(Duration::from_secs(30 * 60))
        .with_auto_resolve(Condition::metric_below("collection.seconds_since_progress", 60.0))
        .with_tag("collection"),
        AlertRule::new(
            "processing_backlog",
            "Processing backlog",
            Severity::Warning,
            Condition::metric_vs_threshold("processing.queue_depth", CompareOp::Gt),
        )
        .with_description("Items are queueing faster than they are processed")
        .with_threshold(10_000.0)
        .with_cooldown(Duration::from_secs(15 * 60))
        .with_min_triggers(2, Duration::from_secs(5 * 60))
        .with_auto_resolve(Condition::metric_below("processing.queue_depth", 1_000.0))
        .with_tag("processing"),
        AlertRule::new(
            "venue_failures",
            "Venue collection failing",
            Severity::Warning,
            Condition::metric_vs_threshold("venues.max_consecutive_failures", CompareOp::Ge),
        )
        .with_description("At least one venue has failed repeatedly")
        .with_threshold(5.0)
        .with_cooldown(Duration::from_secs(30 * 60))
        .with_auto_resolve(Condition::compare(
            Operand::Metric("venues.max_consecutive_failures".to_string()),
            CompareOp::Eq,
            Operand::Value(0.0),
        ))
        .with_tag("collection"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rules_are_valid_and_unique() {
        let rules = builtin_rules();
        for rule in &rules {
            validate_rule(rule).unwrap();
        }
        let registry = RuleRegistry::with_builtin_rules();
        assert_eq!(registry.len(), rules.len());
        assert!(registry.get("memory_high").is_some());
    }

    #[test]
    fn test_from_rules_skips_invalid() {
        let valid = AlertRule::new("ok", "Ok", Severity::Info, Condition::Literal { value: true });
        let invalid = AlertRule::new("", "No id", Severity::Info, Condition::Literal { value: true });
        let registry = RuleRegistry::from_rules(vec![invalid, valid]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("ok").is_some());
    }

    #[test]
    fn test_insert_overwrites_existing_id() {
        let mut registry = RuleRegistry::new();
        let rule = AlertRule::new("r1", "First", Severity::Info, Condition::Literal { value: true });
        assert_eq!(registry.insert(rule).unwrap(), None);

        let replacement = AlertRule::new("r1", "Second", Severity::Error, Condition::Literal { value: true });
        let previous = registry.insert(replacement).unwrap().unwrap();
        assert_eq!(previous.name, "First");
        assert_eq!(registry.get("r1").unwrap().name, "Second");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_set_enabled_and_remove() {
        let mut registry = RuleRegistry::with_builtin_rules();
        let total = registry.len();

        assert!(registry.set_enabled("cpu_high", false));
        assert_eq!(registry.enabled().count(), total - 1);
        assert!(!registry.set_enabled("nonexistent", false));

        assert!(registry.remove("cpu_high").is_some());
        assert!(registry.remove("cpu_high").is_none());
    }

    #[test]
    fn test_validate_rejects_bad_rules() {
        let rule = AlertRule::new(" ", "Blank", Severity::Info, Condition::Literal { value: true });
        assert_eq!(validate_rule(&rule), Err(RuleError::EmptyId));

        let rule = AlertRule::new(
            "t",
            "Threshold",
            Severity::Info,
            Condition::metric_vs_threshold("system.cpu_percent", CompareOp::Gt),
        );
        assert_eq!(validate_rule(&rule), Err(RuleError::MissingThreshold("t".into())));

        let rule = AlertRule::new("e", "Esc", Severity::Info, Condition::Literal { value: true })
            .with_escalation(EscalationPolicy {
                steps: vec![],
                max_escalations: 1,
            });
        assert!(matches!(validate_rule(&rule), Err(RuleError::InvalidEscalation(_))));
    }
}
