//! Alert, rule and notification type definitions

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::condition::Condition;

/// Canonical severity scale, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Lifecycle state of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Suppressed,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Suppressed => "suppressed",
            AlertStatus::Resolved => "resolved",
        }
    }

    /// Active or acknowledged: the alert still needs attention
    pub fn is_open(&self) -> bool {
        matches!(self, AlertStatus::Active | AlertStatus::Acknowledged)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a lifecycle transition request.
///
/// Missing alerts and repeated transitions are routine races between the
/// scheduler and operators, so they are outcomes rather than errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied,
    NotFound,
    AlreadyAcknowledged,
    AlreadyResolved,
    /// The alert exists but its current state does not allow the transition
    InvalidState(AlertStatus),
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

/// One escalation level: wait `delay`, then also notify `channels`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationStep {
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    pub channels: Vec<String>,
}

/// Ordered escalation levels with a hard cap on escalations.
///
/// Once all steps are used, the last step repeats until `max_escalations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub steps: Vec<EscalationStep>,
    pub max_escalations: u32,
}

impl EscalationPolicy {
    /// Single-step policy escalating up to `max_escalations` times
    pub fn new(delay: Duration, channels: Vec<String>, max_escalations: u32) -> Self {
        Self {
            steps: vec![EscalationStep { delay, channels }],
            max_escalations,
        }
    }

    /// Add another step; raises the cap to cover every step
    pub fn then(mut self, delay: Duration, channels: Vec<String>) -> Self {
        self.steps.push(EscalationStep { delay, channels });
        self.max_escalations = self.max_escalations.max(self.steps.len() as u32);
        self
    }

    pub fn with_max_escalations(mut self, max: u32) -> Self {
        self.max_escalations = max;
        self
    }

    /// Step that applies after `escalation_count` escalations already happened
    pub fn step_for(&self, escalation_count: u32) -> Option<&EscalationStep> {
        if escalation_count >= self.max_escalations || self.steps.is_empty() {
            return None;
        }
        let idx = (escalation_count as usize).min(self.steps.len() - 1);
        self.steps.get(idx)
    }
}

/// A named condition plus delivery policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    /// Tree form, or an expression string such as `"system.cpu_percent > threshold"`
    #[serde(deserialize_with = "super::parser::deserialize_condition")]
    pub condition: Condition,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Minimum spacing between alerts created by this rule
    #[serde(default, with = "duration_secs")]
    pub cooldown: Duration,
    /// Window used to count condition hits for `min_trigger_count`
    #[serde(default = "default_time_window", with = "duration_secs")]
    pub time_window: Duration,
    #[serde(default = "default_min_trigger_count")]
    pub min_trigger_count: u32,
    /// Target channels; empty means the engine's default channels
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub escalation: Option<EscalationPolicy>,
    #[serde(default, deserialize_with = "super::parser::deserialize_optional_condition")]
    pub auto_resolve: Option<Condition>,
    /// Value bound to `threshold` inside conditions
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_time_window() -> Duration {
    Duration::from_secs(300)
}

fn default_min_trigger_count() -> u32 {
    1
}

impl AlertRule {
    /// Create an enabled rule with no cooldown that fires on the first hit
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        severity: Severity,
        condition: Condition,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            severity,
            condition,
            enabled: true,
            cooldown: Duration::ZERO,
            time_window: default_time_window(),
            min_trigger_count: 1,
            channels: Vec::new(),
            escalation: None,
            auto_resolve: None,
            threshold: None,
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Require `count` condition hits within `window` before firing
    pub fn with_min_triggers(mut self, count: u32, window: Duration) -> Self {
        self.min_trigger_count = count;
        self.time_window = window;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn with_escalation(mut self, policy: EscalationPolicy) -> Self {
        self.escalation = Some(policy);
        self
    }

    pub fn with_auto_resolve(mut self, condition: Condition) -> Self {
        self.auto_resolve = Some(condition);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Outcome of one delivery attempt on one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResult {
    pub channel: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl NotificationResult {
    pub fn success(channel: impl Into<String>, latency: Duration) -> Self {
        Self {
            channel: channel.into(),
            success: true,
            timestamp: Utc::now(),
            latency_ms: latency.as_millis() as u64,
            error: None,
        }
    }

    pub fn failure(channel: impl Into<String>, latency: Duration, error: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            success: false,
            timestamp: Utc::now(),
            latency_ms: latency.as_millis() as u64,
            error: Some(error.into()),
        }
    }
}

/// One instance of a rule firing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub message: String,
    pub description: String,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_reason: Option<String>,
    pub suppression_reason: Option<String>,
    pub escalation_count: u32,
    pub last_escalation_at: Option<DateTime<Utc>>,
    /// Channels this alert has been routed to so far
    pub channels: Vec<String>,
    pub notifications: Vec<NotificationResult>,
    /// Metric values captured when the alert fired
    pub context: BTreeMap<String, f64>,
    pub tags: Vec<String>,
}

impl Alert {
    /// Create an active alert for a rule
    pub fn new(rule: &AlertRule, message: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            message: message.into(),
            description: rule.description.clone(),
            status: AlertStatus::Active,
            created_at,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolution_reason: None,
            suppression_reason: None,
            escalation_count: 0,
            last_escalation_at: None,
            channels: rule.channels.clone(),
            notifications: Vec::new(),
            context: BTreeMap::new(),
            tags: rule.tags.clone(),
        }
    }

    pub fn acknowledge(&mut self, user: &str, now: DateTime<Utc>) -> TransitionOutcome {
        match self.status {
            AlertStatus::Active => {
                self.status = AlertStatus::Acknowledged;
                self.acknowledged_at = Some(now);
                self.acknowledged_by = Some(user.to_string());
                TransitionOutcome::Applied
            }
            AlertStatus::Acknowledged => TransitionOutcome::AlreadyAcknowledged,
            AlertStatus::Resolved => TransitionOutcome::AlreadyResolved,
            AlertStatus::Suppressed => TransitionOutcome::InvalidState(self.status),
        }
    }

    pub fn resolve(&mut self, reason: &str, now: DateTime<Utc>) -> TransitionOutcome {
        match self.status {
            AlertStatus::Active | AlertStatus::Acknowledged => {
                self.status = AlertStatus::Resolved;
                self.resolved_at = Some(now);
                self.resolution_reason = Some(reason.to_string());
                TransitionOutcome::Applied
            }
            AlertStatus::Resolved => TransitionOutcome::AlreadyResolved,
            AlertStatus::Suppressed => TransitionOutcome::InvalidState(self.status),
        }
    }

    /// Mark a freshly created alert as suppressed
    pub fn suppress(&mut self, reason: impl Into<String>) -> TransitionOutcome {
        if self.status != AlertStatus::Active {
            return TransitionOutcome::InvalidState(self.status);
        }
        self.status = AlertStatus::Suppressed;
        self.suppression_reason = Some(reason.into());
        TransitionOutcome::Applied
    }

    /// Time the current escalation delay is measured from
    pub fn escalation_reference(&self) -> DateTime<Utc> {
        self.last_escalation_at.unwrap_or(self.created_at)
    }

    /// Channels with at least one successful delivery
    pub fn delivered_channels(&self) -> Vec<&str> {
        let mut channels: Vec<&str> = self
            .notifications
            .iter()
            .filter(|n| n.success)
            .map(|n| n.channel.as_str())
            .collect();
        channels.sort_unstable();
        channels.dedup();
        channels
    }

    pub fn to_notification(&self) -> AlertNotification {
        AlertNotification::from(self)
    }
}

/// Stable, serializable view of an alert handed to channel adapters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub escalation_count: u32,
    pub context: BTreeMap<String, f64>,
    pub tags: Vec<String>,
}

impl From<&Alert> for AlertNotification {
    fn from(alert: &Alert) -> Self {
        Self {
            id: alert.id.clone(),
            rule_id: alert.rule_id.clone(),
            rule_name: alert.rule_name.clone(),
            severity: alert.severity,
            status: alert.status,
            message: alert.message.clone(),
            description: alert.description.clone(),
            created_at: alert.created_at,
            escalation_count: alert.escalation_count,
            context: alert.context.clone(),
            tags: alert.tags.clone(),
        }
    }
}

/// Serialize `Duration` as whole seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
