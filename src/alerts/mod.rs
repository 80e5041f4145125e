//! Alert rules, lifecycle and suppression
//!
//! Rules are evaluated against metric snapshots by the [`AlertingEngine`],
//! which creates alerts, consults the [`SuppressionManager`] and hands
//! delivered alerts to the notification channels. The [`Scheduler`] drives
//! the engine periodically.

pub mod condition;
pub mod engine;
pub mod parser;
pub mod rules;
pub mod scheduler;
pub mod summary;
pub mod suppression;
pub mod types;

pub use condition::{CompareOp, Condition, ConditionError, EvalContext, Operand};
pub use engine::AlertingEngine;
pub use parser::{parse_condition, ParseError};
pub use rules::{builtin_rules, validate_rule, RuleError, RuleRegistry};
pub use scheduler::{CycleReport, Scheduler};
pub use summary::{AlertSummary, RuleCount};
pub use suppression::{
    SuppressionDecision, SuppressionEntry, SuppressionError, SuppressionManager, SuppressionMatcher,
    SuppressionOrigin, SuppressionReason, SuppressionSettings, SuppressionStats,
};
pub use types::{
    Alert, AlertNotification, AlertRule, AlertStatus, EscalationPolicy, EscalationStep,
    NotificationResult, Severity, TransitionOutcome,
};
