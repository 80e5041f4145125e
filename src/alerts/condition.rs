//! Typed boolean expressions over metric snapshots
//!
//! Rule conditions are small ASTs: metric comparisons combined with
//! AND/OR/NOT. Evaluation is pure, bounded by the size limits enforced in
//! [`Condition::validate`], and cannot reach anything outside the snapshot and
//! the [`EvalContext`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;

/// Maximum nesting depth of a condition
pub const MAX_DEPTH: usize = 16;

/// Maximum number of nodes in a condition
pub const MAX_NODES: usize = 128;

/// Longest `recent_alerts` window, one year
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CompareOp {
    pub fn apply(&self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Eq => (left - right).abs() < f64::EPSILON,
            CompareOp::Ne => (left - right).abs() >= f64::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }
}

/// Value on either side of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Dotted metric path resolved against the snapshot
    Metric(String),
    /// Numeric literal
    Value(f64),
    /// The rule's configured threshold
    Threshold,
}

/// Boolean condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
    /// Compare the number of alerts this rule raised in the trailing window
    RecentAlerts {
        window_secs: u64,
        op: CompareOp,
        count: u32,
    },
    Literal {
        value: bool,
    },
}

/// Inputs available to a condition besides the snapshot
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub now: DateTime<Utc>,
    pub threshold: Option<f64>,
    /// Creation times of this rule's recent alerts
    pub recent_alerts: &'a [DateTime<Utc>],
}

impl<'a> EvalContext<'a> {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            threshold: None,
            recent_alerts: &[],
        }
    }

    pub fn with_threshold(mut self, threshold: Option<f64>) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_recent_alerts(mut self, recent_alerts: &'a [DateTime<Utc>]) -> Self {
        self.recent_alerts = recent_alerts;
        self
    }
}

/// Condition evaluation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Metric {0} is not a finite number")]
    NonFinite(String),

    #[error("Condition references threshold but the rule has none")]
    MissingThreshold,

    #[error("Empty {0} group")]
    EmptyGroup(&'static str),

    #[error("Condition nested deeper than {} levels", MAX_DEPTH)]
    TooDeep,

    #[error("Condition has more than {} nodes", MAX_NODES)]
    TooLarge,

    #[error("Alert window of {0}s exceeds {max} seconds", max = MAX_WINDOW_SECS)]
    WindowTooLarge(u64),
}

impl Condition {
    /// `metric > value`
    pub fn metric_above(metric: impl Into<String>, value: f64) -> Self {
        Self::compare(Operand::Metric(metric.into()), CompareOp::Gt, Operand::Value(value))
    }

    /// `metric < value`
    pub fn metric_below(metric: impl Into<String>, value: f64) -> Self {
        Self::compare(Operand::Metric(metric.into()), CompareOp::Lt, Operand::Value(value))
    }

    /// `metric <op> threshold`
    pub fn metric_vs_threshold(metric: impl Into<String>, op: CompareOp) -> Self {
        Self::compare(Operand::Metric(metric.into()), op, Operand::Threshold)
    }

    pub fn compare(left: Operand, op: CompareOp, right: Operand) -> Self {
        Condition::Compare { left, op, right }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::And { conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Or { conditions }
    }

    pub fn negate(condition: Condition) -> Self {
        Condition::Not {
            condition: Box::new(condition),
        }
    }

    /// Evaluate against a snapshot.
    ///
    /// Errors mean the condition could not be decided for this snapshot
    /// (missing metric, NaN, no threshold); callers treat that as false.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot, ctx: &EvalContext<'_>) -> Result<bool, ConditionError> {
        match self {
            Condition::Compare { left, op, right } => {
                let l = resolve(left, snapshot, ctx)?;
                let r = resolve(right, snapshot, ctx)?;
                Ok(op.apply(l, r))
            }
            Condition::And { conditions } => {
                if conditions.is_empty() {
                    return Err(ConditionError::EmptyGroup("and"));
                }
                for c in conditions {
                    if !c.evaluate(snapshot, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or { conditions } => {
                if conditions.is_empty() {
                    return Err(ConditionError::EmptyGroup("or"));
                }
                for c in conditions {
                    if c.evaluate(snapshot, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { condition } => Ok(!condition.evaluate(snapshot, ctx)?),
            Condition::RecentAlerts {
                window_secs,
                op,
                count,
            } => {
                let since = window_start(ctx.now, *window_secs)?;
                let recent = ctx
                    .recent_alerts
                    .iter()
                    .filter(|t| **t >= since && **t <= ctx.now)
                    .count();
                Ok(op.apply(recent as f64, *count as f64))
            }
            Condition::Literal { value } => Ok(*value),
        }
    }

    /// Check structural limits so evaluation stays cheap
    pub fn validate(&self) -> Result<(), ConditionError> {
        let mut nodes = 0;
        self.walk(1, &mut nodes)
    }

    fn walk(&self, depth: usize, nodes: &mut usize) -> Result<(), ConditionError> {
        if depth > MAX_DEPTH {
            return Err(ConditionError::TooDeep);
        }
        *nodes += 1;
        if *nodes > MAX_NODES {
            return Err(ConditionError::TooLarge);
        }
        match self {
            Condition::And { conditions } | Condition::Or { conditions } => {
                if conditions.is_empty() {
                    let kind = if matches!(self, Condition::And { .. }) { "and" } else { "or" };
                    return Err(ConditionError::EmptyGroup(kind));
                }
                for c in conditions {
                    c.walk(depth + 1, nodes)?;
                }
                Ok(())
            }
            Condition::Not { condition } => condition.walk(depth + 1, nodes),
            Condition::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Value(v) = operand {
                        if !v.is_finite() {
                            return Err(ConditionError::NonFinite(v.to_string()));
                        }
                    }
                }
                Ok(())
            }
            Condition::RecentAlerts { window_secs, .. } => {
                if *window_secs > MAX_WINDOW_SECS {
                    return Err(ConditionError::WindowTooLarge(*window_secs));
                }
                Ok(())
            }
            Condition::Literal { .. } => Ok(()),
        }
    }

    /// Whether any comparison uses the rule threshold
    pub fn uses_threshold(&self) -> bool {
        match self {
            Condition::Compare { left, right, .. } => {
                matches!(left, Operand::Threshold) || matches!(right, Operand::Threshold)
            }
            Condition::And { conditions } | Condition::Or { conditions } => {
                conditions.iter().any(Condition::uses_threshold)
            }
            Condition::Not { condition } => condition.uses_threshold(),
            Condition::RecentAlerts { .. } | Condition::Literal { .. } => false,
        }
    }

    /// Metric paths referenced anywhere in the tree, deduplicated
    pub fn metric_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        self.collect_paths(&mut paths);
        paths.sort_unstable();
        paths.dedup();
        paths
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Metric(path) = operand {
                        out.push(path);
                    }
                }
            }
            Condition::And { conditions } | Condition::Or { conditions } => {
                for c in conditions {
                    c.collect_paths(out);
                }
            }
            Condition::Not { condition } => condition.collect_paths(out),
            Condition::RecentAlerts { .. } | Condition::Literal { .. } => {}
        }
    }
}

fn window_start(now: DateTime<Utc>, window_secs: u64) -> Result<DateTime<Utc>, ConditionError> {
    chrono::Duration::from_std(std::time::Duration::from_secs(window_secs))
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or(ConditionError::WindowTooLarge(window_secs))
}

fn resolve(operand: &Operand, snapshot: &MetricsSnapshot, ctx: &EvalContext<'_>) -> Result<f64, ConditionError> {
    match operand {
        Operand::Value(v) => Ok(*v),
        Operand::Threshold => ctx.threshold.ok_or(ConditionError::MissingThreshold),
        Operand::Metric(path) => {
            let value = snapshot
                .value(path, ctx.now)
                .ok_or_else(|| ConditionError::UnknownMetric(path.clone()))?;
            if value.is_finite() {
                Ok(value)
            } else {
                Err(ConditionError::NonFinite(path.clone()))
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Metric(path) => f.write_str(path),
            Operand::Value(v) => write!(f, "{}", v),
            Operand::Threshold => f.write_str("threshold"),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { left, op, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Condition::And { conditions } => write_group(f, conditions, "and"),
            Condition::Or { conditions } => write_group(f, conditions, "or"),
            Condition::Not { condition } => write!(f, "not ({})", condition),
            Condition::RecentAlerts {
                window_secs,
                op,
                count,
            } => write!(f, "recent_alerts({}) {} {}", window_secs, op.symbol(), count),
            Condition::Literal { value } => write!(f, "{}", value),
        }
    }
}

fn write_group(f: &mut fmt::Formatter<'_>, conditions: &[Condition], joiner: &str) -> fmt::Result {
    for (i, c) in conditions.iter().enumerate() {
        if i > 0 {
            write!(f, " {} ", joiner)?;
        }
        write!(f, "({})", c)?;
    }
    Ok(())
}
