//! Alert lifecycle orchestration
//!
//! [`AlertingEngine`] owns the rule registry, the active alert set, the
//! bounded alert history and the suppression state behind one mutex. Every
//! mutation happens under that lock; channel I/O never does. Alerts are
//! copied out, the lock is released, deliveries run concurrently and the
//! results are written back under the lock afterwards.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::condition::{Condition, EvalContext};
use super::rules::{RuleError, RuleRegistry};
use super::summary::AlertSummary;
use super::suppression::{
    SuppressionDecision, SuppressionEntry, SuppressionError, SuppressionManager, SuppressionMatcher,
};
use super::types::{
    Alert, AlertNotification, AlertRule, AlertStatus, NotificationResult, Severity, TransitionOutcome,
};
use crate::config::{AlertingConfig, ConfigError};
use crate::metrics::{MetricsHistory, MetricsSnapshot};
use crate::notify::{ChannelStats, NotificationChannel, NotificationChannelManager};

/// Cycle duration above which a warning is logged
const EVALUATION_TARGET: Duration = Duration::from_millis(500);

/// Alert timestamps kept per rule for `recent_alerts` conditions
const RECENT_ALERTS_KEPT: usize = 64;

/// Per-rule evaluation state
#[derive(Debug, Default)]
struct RuleRuntime {
    last_alert_at: Option<DateTime<Utc>>,
    /// Condition-true evaluations inside the rule's time window
    hits: VecDeque<DateTime<Utc>>,
    recent_alerts: VecDeque<DateTime<Utc>>,
    consecutive_errors: u32,
}

impl RuleRuntime {
    fn in_cooldown(&self, cooldown: Duration, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_alert_at else {
            return false;
        };
        if now < last {
            // Out-of-order snapshot; never create an alert before the last one
            return true;
        }
        match chrono::Duration::from_std(cooldown) {
            Ok(cooldown) => now - last < cooldown,
            Err(_) => true,
        }
    }

    fn record_hit(&mut self, now: DateTime<Utc>, window: Duration) {
        self.hits.push_back(now);
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window));
        if let Some(cutoff) = cutoff {
            while self.hits.front().map_or(false, |t| *t < cutoff) {
                self.hits.pop_front();
            }
        }
    }

    fn record_alert(&mut self, now: DateTime<Utc>) {
        self.hits.clear();
        self.last_alert_at = Some(now);
        self.recent_alerts.push_back(now);
        while self.recent_alerts.len() > RECENT_ALERTS_KEPT {
            self.recent_alerts.pop_front();
        }
    }
}

/// An alert copy waiting for delivery outside the lock
struct PendingDelivery {
    alert_id: String,
    notification: AlertNotification,
    channels: Vec<String>,
}

/// Everything guarded by the engine lock
struct EngineState {
    rules: RuleRegistry,
    active: HashMap<String, Alert>,
    history: VecDeque<Alert>,
    max_history: usize,
    runtime: HashMap<String, RuleRuntime>,
    suppression: SuppressionManager,
}

impl EngineState {
    fn evaluate_rules(
        &mut self,
        snapshot: &MetricsSnapshot,
        default_channels: &[String],
    ) -> (Vec<Alert>, Vec<PendingDelivery>) {
        let now = snapshot.timestamp;
        let rules: Vec<AlertRule> = self.rules.enabled().cloned().collect();

        let mut created = Vec::new();
        let mut pending = Vec::new();

        for rule in &rules {
            let Some(mut alert) = self.evaluate_rule(rule, snapshot, now) else {
                continue;
            };

            match self.suppression.decide(&rule.id, rule.severity, now) {
                SuppressionDecision::Suppress(reason) => {
                    alert.suppress(reason.to_string());
                    tracing::info!(
                        alert_id = %alert.id,
                        rule_id = %rule.id,
                        severity = %rule.severity,
                        reason = %reason,
                        "Alert suppressed"
                    );
                    self.push_history(alert.clone());
                }
                SuppressionDecision::Deliver => {
                    if alert.channels.is_empty() {
                        alert.channels = default_channels.to_vec();
                    }
                    tracing::warn!(
                        alert_id = %alert.id,
                        rule_id = %rule.id,
                        severity = %rule.severity,
                        "Alert created: {}",
                        alert.message
                    );
                    pending.push(PendingDelivery {
                        alert_id: alert.id.clone(),
                        notification: alert.to_notification(),
                        channels: alert.channels.clone(),
                    });
                    self.active.insert(alert.id.clone(), alert.clone());
                    self.push_history(alert.clone());
                }
            }
            created.push(alert);
        }

        (created, pending)
    }

    /// Evaluate one rule; returns a candidate alert when it should fire
    fn evaluate_rule(&mut self, rule: &AlertRule, snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> Option<Alert> {
        let runtime = self.runtime.entry(rule.id.clone()).or_default();
        if runtime.in_cooldown(rule.cooldown, now) {
            tracing::trace!(rule_id = %rule.id, "Rule in cooldown");
            return None;
        }

        let outcome = {
            let ctx = EvalContext::new(now)
                .with_threshold(rule.threshold)
                .with_recent_alerts(runtime.recent_alerts.make_contiguous());
            rule.condition.evaluate(snapshot, &ctx)
        };

        match outcome {
            Ok(true) => runtime.consecutive_errors = 0,
            Ok(false) => {
                runtime.consecutive_errors = 0;
                return None;
            }
            Err(e) => {
                runtime.consecutive_errors += 1;
                tracing::warn!(
                    rule_id = %rule.id,
                    error = %e,
                    consecutive_errors = runtime.consecutive_errors,
                    "Rule evaluation failed, treating as false"
                );
                return None;
            }
        }

        runtime.record_hit(now, rule.time_window);
        let hits = runtime.hits.len() as u32;
        if hits < rule.min_trigger_count.max(1) {
            tracing::debug!(
                rule_id = %rule.id,
                hits,
                required = rule.min_trigger_count,
                "Rule condition true, waiting for more triggers"
            );
            return None;
        }
        runtime.record_alert(now);

        let context = capture_context(&rule.condition, snapshot, now);
        let mut alert = Alert::new(rule, format_message(rule, &context), now);
        alert.context = context;
        Some(alert)
    }

    fn auto_resolve(&mut self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let now = snapshot.timestamp;
        let candidates: Vec<String> = self
            .active
            .values()
            .filter(|a| a.status.is_open() && a.created_at <= now)
            .map(|a| a.id.clone())
            .collect();

        let mut resolved = Vec::new();
        for id in candidates {
            let Some(alert) = self.active.get(&id) else {
                continue;
            };
            let Some(rule) = self.rules.get(&alert.rule_id) else {
                continue;
            };
            let Some(condition) = rule.auto_resolve.as_ref() else {
                continue;
            };

            let ctx = EvalContext::new(now).with_threshold(rule.threshold);
            match condition.evaluate(snapshot, &ctx) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::debug!(rule_id = %rule.id, error = %e, "Auto-resolve check failed");
                    continue;
                }
            }
            let reason = format!("auto-resolved: {}", condition);

            if let Some(mut alert) = self.active.remove(&id) {
                alert.resolve(&reason, now);
                tracing::info!(alert_id = %alert.id, rule_id = %alert.rule_id, "Alert auto-resolved");
                self.update_history(&alert);
                resolved.push(alert);
            }
        }
        resolved
    }

    fn escalate(&mut self, now: DateTime<Utc>) -> (Vec<Alert>, Vec<PendingDelivery>) {
        let mut escalated = Vec::new();
        let mut pending = Vec::new();

        for alert in self.active.values_mut() {
            if alert.status != AlertStatus::Active {
                continue;
            }
            let Some(policy) = self.rules.get(&alert.rule_id).and_then(|r| r.escalation.as_ref()) else {
                continue;
            };
            let Some(step) = policy.step_for(alert.escalation_count) else {
                continue;
            };
            let Ok(delay) = chrono::Duration::from_std(step.delay) else {
                continue;
            };
            if now - alert.escalation_reference() < delay {
                continue;
            }

            alert.escalation_count += 1;
            alert.last_escalation_at = Some(now);
            let added: Vec<String> = step
                .channels
                .iter()
                .filter(|c| !alert.channels.contains(c))
                .cloned()
                .collect();
            alert.channels.extend(added.iter().cloned());

            tracing::warn!(
                alert_id = %alert.id,
                rule_id = %alert.rule_id,
                escalation = alert.escalation_count,
                added_channels = ?added,
                "Alert escalated"
            );

            if !added.is_empty() {
                pending.push(PendingDelivery {
                    alert_id: alert.id.clone(),
                    notification: alert.to_notification(),
                    channels: added,
                });
            }
            escalated.push(alert.clone());
        }

        for alert in &escalated {
            self.update_history(alert);
        }
        (escalated, pending)
    }

    fn acknowledge(&mut self, alert_id: &str, user: &str, now: DateTime<Utc>) -> TransitionOutcome {
        if let Some(alert) = self.active.get_mut(alert_id) {
            let outcome = alert.acknowledge(user, now);
            if outcome.is_applied() {
                let snapshot = alert.clone();
                tracing::info!(alert_id = %alert_id, user = %user, "Alert acknowledged");
                self.update_history(&snapshot);
            }
            return outcome;
        }
        self.closed_outcome(alert_id)
    }

    fn resolve(&mut self, alert_id: &str, reason: &str, now: DateTime<Utc>) -> TransitionOutcome {
        let Some(mut alert) = self.active.remove(alert_id) else {
            return self.closed_outcome(alert_id);
        };
        let outcome = alert.resolve(reason, now);
        if outcome.is_applied() {
            tracing::info!(alert_id = %alert_id, reason = %reason, "Alert resolved");
            self.update_history(&alert);
        } else {
            self.active.insert(alert.id.clone(), alert);
        }
        outcome
    }

    /// Outcome for an id that is not in the active set
    fn closed_outcome(&self, alert_id: &str) -> TransitionOutcome {
        match self.history.iter().rev().find(|a| a.id == alert_id) {
            Some(alert) if alert.status == AlertStatus::Resolved => TransitionOutcome::AlreadyResolved,
            Some(alert) if alert.status == AlertStatus::Suppressed => {
                TransitionOutcome::InvalidState(AlertStatus::Suppressed)
            }
            _ => {
                tracing::debug!(alert_id = %alert_id, "Alert not found");
                TransitionOutcome::NotFound
            }
        }
    }

    fn record_notifications(&mut self, alert_id: &str, results: Vec<NotificationResult>) {
        if let Some(alert) = self.active.get_mut(alert_id) {
            alert.notifications.extend(results);
            let snapshot = alert.clone();
            self.update_history(&snapshot);
        } else if let Some(alert) = self.history.iter_mut().rev().find(|a| a.id == alert_id) {
            // Resolved while the send was in flight
            alert.notifications.extend(results);
        }
    }

    fn find(&self, alert_id: &str) -> Option<&Alert> {
        self.active
            .get(alert_id)
            .or_else(|| self.history.iter().rev().find(|a| a.id == alert_id))
    }

    fn push_history(&mut self, alert: Alert) {
        while self.history.len() >= self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(alert);
    }

    /// Replace the history copy of an alert; no-op once it has been evicted
    fn update_history(&mut self, alert: &Alert) {
        if let Some(slot) = self.history.iter_mut().rev().find(|a| a.id == alert.id) {
            *slot = alert.clone();
        }
    }
}

/// Evaluates rules against metric snapshots and manages alert lifecycles.
///
/// Construct once and share behind an `Arc`; every method takes `&self`.
pub struct AlertingEngine {
    config: AlertingConfig,
    state: Mutex<EngineState>,
    metrics: MetricsHistory,
    channels: NotificationChannelManager,
}

impl AlertingEngine {
    /// Create an engine; loads the built-in rules unless disabled in config
    pub fn new(config: AlertingConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let rules = if config.builtin_rules {
            RuleRegistry::with_builtin_rules()
        } else {
            RuleRegistry::new()
        };

        let mut suppression = SuppressionManager::new(config.suppression_settings());
        if config.maintenance_mode {
            suppression
                .set_maintenance(true, None, Utc::now())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        tracing::info!(
            rules = rules.len(),
            maintenance_mode = config.maintenance_mode,
            "Alerting engine initialized"
        );

        Ok(Self {
            metrics: MetricsHistory::new(config.metrics_history_capacity),
            channels: NotificationChannelManager::new(config.delivery_settings()),
            state: Mutex::new(EngineState {
                rules,
                active: HashMap::new(),
                history: VecDeque::new(),
                max_history: config.max_alert_history_size.max(1),
                runtime: HashMap::new(),
                suppression,
            }),
            config,
        })
    }

    pub fn config(&self) -> &AlertingConfig {
        &self.config
    }

    // Metrics

    /// Store a snapshot pushed by the collection pipeline
    pub fn add_metrics(&self, snapshot: MetricsSnapshot) -> Arc<MetricsSnapshot> {
        self.metrics.append(snapshot)
    }

    pub fn latest_metrics(&self) -> Option<Arc<MetricsSnapshot>> {
        self.metrics.latest()
    }

    pub fn metrics_history(&self) -> &MetricsHistory {
        &self.metrics
    }

    // Evaluation cycle

    /// Evaluate every enabled rule against `snapshot`.
    ///
    /// Returns the alerts created in this cycle, delivered ones carrying their
    /// notification results. `snapshot.timestamp` is the evaluation time.
    pub async fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let started = Instant::now();

        let (created, pending) = {
            let mut state = self.state.lock();
            state.evaluate_rules(snapshot, &self.config.default_channels)
        };

        if !pending.is_empty() {
            self.dispatch(pending).await;
        }

        let alerts = self.refresh(created);

        let elapsed = started.elapsed();
        if elapsed > EVALUATION_TARGET {
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "Slow evaluation cycle");
        }
        tracing::debug!(
            created = alerts.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Evaluation cycle complete"
        );
        alerts
    }

    /// Resolve open alerts whose auto-resolve condition holds for `snapshot`
    pub fn check_auto_resolve(&self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        self.state.lock().auto_resolve(snapshot)
    }

    /// Escalate active alerts whose current step delay has elapsed.
    ///
    /// Only channels added by the escalation are notified.
    pub async fn check_escalations(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let (escalated, pending) = self.state.lock().escalate(now);
        if !pending.is_empty() {
            self.dispatch(pending).await;
        }
        self.refresh(escalated)
    }

    /// Purge expired suppression entries; returns how many were removed
    pub fn sweep_suppressions(&self, now: DateTime<Utc>) -> usize {
        let removed = self.state.lock().suppression.purge_expired(now);
        if removed > 0 {
            tracing::debug!(removed, "Expired suppressions purged");
        }
        removed
    }

    async fn dispatch(&self, pending: Vec<PendingDelivery>) {
        let deliveries = pending
            .iter()
            .map(|p| self.channels.deliver(&p.notification, &p.channels));
        let results = futures::future::join_all(deliveries).await;

        let mut state = self.state.lock();
        for (delivery, results) in pending.iter().zip(results) {
            state.record_notifications(&delivery.alert_id, results);
        }
    }

    /// Current copies of the given alerts, falling back to the passed copy
    fn refresh(&self, alerts: Vec<Alert>) -> Vec<Alert> {
        let state = self.state.lock();
        alerts
            .into_iter()
            .map(|alert| state.find(&alert.id).cloned().unwrap_or(alert))
            .collect()
    }

    // Rules

    /// Add or replace a rule; replacing an existing id is logged
    pub fn add_rule(&self, rule: AlertRule) -> Result<Option<AlertRule>, RuleError> {
        let id = rule.id.clone();
        let mut state = self.state.lock();
        let previous = state.rules.insert(rule)?;
        if let Some(runtime) = state.runtime.get_mut(&id) {
            runtime.hits.clear();
        }
        match &previous {
            Some(_) => tracing::warn!(rule_id = %id, "Rule replaced existing definition"),
            None => tracing::info!(rule_id = %id, "Rule added"),
        }
        Ok(previous)
    }

    /// Remove a rule; open alerts it created stay until resolved
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut state = self.state.lock();
        state.runtime.remove(rule_id);
        let removed = state.rules.remove(rule_id).is_some();
        if removed {
            tracing::info!(rule_id = %rule_id, "Rule removed");
        }
        removed
    }

    pub fn enable_rule(&self, rule_id: &str) -> bool {
        self.set_rule_enabled(rule_id, true)
    }

    pub fn disable_rule(&self, rule_id: &str) -> bool {
        self.set_rule_enabled(rule_id, false)
    }

    fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let mut state = self.state.lock();
        if !state.rules.set_enabled(rule_id, enabled) {
            return false;
        }
        if let Some(runtime) = state.runtime.get_mut(rule_id) {
            runtime.hits.clear();
        }
        tracing::info!(rule_id = %rule_id, enabled, "Rule toggled");
        true
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.state.lock().rules.get(rule_id).cloned()
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.state.lock().rules.iter().cloned().collect()
    }

    // Alert lifecycle

    pub fn acknowledge(&self, alert_id: &str, user: &str) -> TransitionOutcome {
        self.state.lock().acknowledge(alert_id, user, Utc::now())
    }

    pub fn resolve(&self, alert_id: &str, reason: &str) -> TransitionOutcome {
        self.state.lock().resolve(alert_id, reason, Utc::now())
    }

    pub fn get_alert(&self, alert_id: &str) -> Option<Alert> {
        self.state.lock().find(alert_id).cloned()
    }

    /// Open alerts, most severe first, then newest first
    pub fn get_active_alerts(&self, severity: Option<Severity>) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = {
            let state = self.state.lock();
            state
                .active
                .values()
                .filter(|a| severity.map_or(true, |s| a.severity == s))
                .cloned()
                .collect()
        };
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        alerts
    }

    /// Alerts created within the last `hours` of wall-clock time, newest first.
    ///
    /// `created_at` is the timestamp of the snapshot that raised the alert, so
    /// replayed historical snapshots need [`Self::alert_history_since`].
    pub fn get_alert_history(&self, hours: u64) -> Vec<Alert> {
        self.alert_history_since(hours_before(Utc::now(), hours))
    }

    pub fn alert_history_since(&self, since: DateTime<Utc>) -> Vec<Alert> {
        let state = self.state.lock();
        state
            .history
            .iter()
            .rev()
            .filter(|a| a.created_at >= since)
            .cloned()
            .collect()
    }

    /// Summary of alerts created within the last `hours` of wall-clock time
    pub fn get_summary(&self, hours: u64) -> AlertSummary {
        let now = Utc::now();
        self.summary_between(hours, hours_before(now, hours), now)
    }

    /// Summary of alerts whose snapshot timestamp is at or after `since`.
    ///
    /// Suppression state is still reported as of the wall clock.
    pub fn get_summary_since(&self, since: DateTime<Utc>) -> AlertSummary {
        let now = Utc::now();
        let hours = now.signed_duration_since(since).num_hours().max(0) as u64;
        self.summary_between(hours, since, now)
    }

    fn summary_between(&self, hours: u64, since: DateTime<Utc>, now: DateTime<Utc>) -> AlertSummary {
        let summary = {
            let state = self.state.lock();
            let mut summary = AlertSummary::from_alerts(
                hours,
                now,
                state.history.iter().filter(|a| a.created_at >= since),
            );
            summary.open_alerts = state.active.len();
            summary.rules_total = state.rules.len();
            summary.rules_enabled = state.rules.enabled().count();
            summary.maintenance_mode = state.suppression.is_maintenance_active(now);
            summary.global_suppression = state.suppression.is_global_active(now);
            summary.active_suppressions = state.suppression.active_entries(now).len();
            summary.suppression = state.suppression.stats().clone();
            summary
        };

        // Channel stats have their own lock; never taken under the engine lock
        summary.with_channel_stats(self.channels.stats())
    }

    /// Deliver a synthetic alert to check channel wiring.
    ///
    /// Test alerts bypass rules and suppression and are recorded in history
    /// as resolved.
    pub async fn send_test_alert(&self, severity: Severity, channels: Option<Vec<String>>) -> Alert {
        let rule = AlertRule::new("test_alert", "Test alert", severity, Condition::Literal { value: true })
            .with_description("Manually triggered test alert")
            .with_tag("test");
        let mut alert = Alert::new(&rule, format!("Test alert ({})", severity), Utc::now());
        alert.channels = channels.unwrap_or_else(|| self.config.default_channels.clone());

        alert.notifications = self.channels.deliver(&alert.to_notification(), &alert.channels).await;
        alert.resolve("test alert delivered", Utc::now());

        tracing::info!(
            alert_id = %alert.id,
            delivered = ?alert.delivered_channels(),
            "Test alert sent"
        );
        self.state.lock().push_history(alert.clone());
        alert
    }

    // Suppression

    /// Add a manual suppression; returns the entry id
    pub fn add_suppression(
        &self,
        matcher: SuppressionMatcher,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<String, SuppressionError> {
        let entry = SuppressionEntry::manual(matcher, reason, Utc::now(), duration)?;
        Ok(self.add_suppression_entry(entry))
    }

    pub fn add_suppression_entry(&self, entry: SuppressionEntry) -> String {
        self.state.lock().suppression.add_entry(entry)
    }

    pub fn remove_suppression(&self, id: &str) -> bool {
        self.state.lock().suppression.remove_entry(id)
    }

    pub fn list_suppressions(&self) -> Vec<SuppressionEntry> {
        self.state.lock().suppression.entries()
    }

    pub fn set_maintenance_mode(&self, enabled: bool, duration: Option<Duration>) -> Result<(), SuppressionError> {
        self.state.lock().suppression.set_maintenance(enabled, duration, Utc::now())
    }

    pub fn set_global_suppression(&self, enabled: bool, duration: Option<Duration>) -> Result<(), SuppressionError> {
        self.state.lock().suppression.set_global(enabled, duration, Utc::now())
    }

    // Channels

    pub fn register_channel(&self, channel: Arc<dyn NotificationChannel>) {
        self.channels.register(channel);
    }

    pub fn unregister_channel(&self, name: &str) -> bool {
        self.channels.unregister(name)
    }

    pub fn channel_stats(&self) -> HashMap<String, ChannelStats> {
        self.channels.stats()
    }

    pub fn channels(&self) -> &NotificationChannelManager {
        &self.channels
    }
}

fn hours_before(now: DateTime<Utc>, hours: u64) -> DateTime<Utc> {
    let hours = chrono::Duration::try_hours(hours.min(i64::MAX as u64) as i64);
    hours
        .and_then(|h| now.checked_sub_signed(h))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Values of every metric the condition reads
fn capture_context(condition: &Condition, snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> BTreeMap<String, f64> {
    condition
        .metric_paths()
        .into_iter()
        .filter_map(|path| snapshot.value(path, now).map(|v| (path.to_string(), v)))
        .collect()
}

fn format_message(rule: &AlertRule, context: &BTreeMap<String, f64>) -> String {
    if context.is_empty() {
        return rule.name.clone();
    }
    let values: Vec<String> = context
        .iter()
        .map(|(path, value)| format!("{}={}", path, format_value(*value)))
        .collect();
    match rule.threshold {
        Some(threshold) => format!(
            "{}: {} (threshold {})",
            rule.name,
            values.join(", "),
            format_value(threshold)
        ),
        None => format!("{}: {}", rule.name, values.join(", ")),
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::rules::builtin_rules;
    use crate::alerts::{CompareOp, EscalationPolicy, Operand, SuppressionOrigin};
    use crate::metrics::{ApiMetrics, SystemMetrics};
    use crate::notify::RecordingChannel;
    use std::sync::atomic::Ordering;

    fn config() -> AlertingConfig {
        AlertingConfig {
            builtin_rules: false,
            default_channels: vec!["recorder".to_string()],
            max_alerts_per_minute: 100,
            ..Default::default()
        }
    }

    fn engine_with(config: AlertingConfig) -> (AlertingEngine, Arc<RecordingChannel>) {
        let engine = AlertingEngine::new(config).unwrap();
        let recorder = RecordingChannel::new("recorder");
        engine.register_channel(recorder.clone());
        (engine, recorder)
    }

    fn memory(ts: DateTime<Utc>, percent: f64) -> MetricsSnapshot {
        MetricsSnapshot::new(ts).with_system(SystemMetrics {
            memory_percent: percent,
            ..Default::default()
        })
    }

    fn always(id: &str, severity: Severity) -> AlertRule {
        AlertRule::new(id, id, severity, Condition::Literal { value: true })
    }

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    fn builtin(id: &str) -> AlertRule {
        builtin_rules().into_iter().find(|r| r.id == id).unwrap()
    }

    #[tokio::test]
    async fn test_memory_high_cooldown_and_auto_resolve() {
        let (engine, recorder) = engine_with(config());
        engine.add_rule(builtin("memory_high")).unwrap();
        let t0 = Utc::now();

        let created = engine.evaluate(&memory(t0, 85.0)).await;
        assert_eq!(created.len(), 1);
        let alert = &created[0];
        assert_eq!(alert.status, AlertStatus::Active);
        assert_eq!(alert.context["system.memory_percent"], 85.0);
        assert_eq!(alert.notifications.len(), 1);
        assert!(alert.notifications[0].success);
        assert_eq!(recorder.count(), 1);

        // Within the 20 minute cooldown
        assert!(engine.evaluate(&memory(t0 + minutes(5), 90.0)).await.is_empty());
        assert!(engine.check_auto_resolve(&memory(t0 + minutes(5), 90.0)).is_empty());

        let resolved = engine.check_auto_resolve(&memory(t0 + minutes(30), 65.0));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, alert.id);
        assert_eq!(resolved[0].status, AlertStatus::Resolved);
        assert_eq!(resolved[0].resolved_at, Some(t0 + minutes(30)));

        assert!(engine.get_active_alerts(None).is_empty());
        let stored = engine.get_alert(&alert.id).unwrap();
        assert_eq!(stored.status, AlertStatus::Resolved);
        assert_eq!(stored.notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_burst_suppresses_third_api_down_alert() {
        let (engine, recorder) = engine_with(AlertingConfig {
            burst_threshold: 2,
            burst_window_seconds: 60,
            ..config()
        });
        engine
            .add_rule(
                AlertRule::new(
                    "api_down",
                    "All API sources down",
                    Severity::Critical,
                    Condition::compare(
                        Operand::Metric("api.healthy_sources".into()),
                        CompareOp::Eq,
                        Operand::Value(0.0),
                    ),
                )
                .with_cooldown(Duration::ZERO),
            )
            .unwrap();

        let t0 = Utc::now();
        let down = |ts| {
            MetricsSnapshot::new(ts).with_api(
                "exchange",
                ApiMetrics {
                    available: false,
                    ..Default::default()
                },
            )
        };

        let mut statuses = Vec::new();
        for secs in [0, 20, 40] {
            let created = engine.evaluate(&down(t0 + chrono::Duration::seconds(secs))).await;
            assert_eq!(created.len(), 1);
            statuses.push(created[0].status);
        }

        assert_eq!(
            statuses,
            vec![AlertStatus::Active, AlertStatus::Active, AlertStatus::Suppressed]
        );
        assert_eq!(recorder.count(), 2);
        assert_eq!(engine.get_active_alerts(None).len(), 2);

        let entries = engine.list_suppressions();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin, SuppressionOrigin::Burst);
        assert_eq!(engine.get_alert_history(1).len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_alert_is_not_found_and_lock_released() {
        let (engine, _recorder) = engine_with(config());
        assert_eq!(engine.acknowledge("no-such-alert", "ops"), TransitionOutcome::NotFound);
        assert_eq!(engine.resolve("no-such-alert", "gone"), TransitionOutcome::NotFound);

        engine.add_rule(always("r1", Severity::Info)).unwrap();
        let created = engine.evaluate(&MetricsSnapshot::now()).await;
        assert_eq!(engine.acknowledge(&created[0].id, "ops"), TransitionOutcome::Applied);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let (engine, _recorder) = engine_with(config());
        engine.add_rule(always("r1", Severity::Error)).unwrap();
        let id = engine.evaluate(&MetricsSnapshot::now()).await[0].id.clone();

        assert_eq!(engine.resolve(&id, "fixed"), TransitionOutcome::Applied);
        let before = engine.get_alert(&id).unwrap();

        assert_eq!(engine.resolve(&id, "again"), TransitionOutcome::AlreadyResolved);
        assert_eq!(engine.acknowledge(&id, "ops"), TransitionOutcome::AlreadyResolved);
        assert_eq!(engine.get_alert(&id).unwrap(), before);
        assert_eq!(before.resolution_reason.as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn test_cooldown_spacing_holds() {
        let (engine, _recorder) = engine_with(config());
        engine
            .add_rule(always("r1", Severity::Warning).with_cooldown(Duration::from_secs(600)))
            .unwrap();

        let t0 = Utc::now();
        let mut created_at = Vec::new();
        for minute in 0..60 {
            for alert in engine.evaluate(&MetricsSnapshot::new(t0 + minutes(minute))).await {
                created_at.push(alert.created_at);
            }
        }
        // Out-of-order snapshot inside the sequence must not slip through
        assert!(engine.evaluate(&MetricsSnapshot::new(t0 - minutes(30))).await.is_empty());

        assert_eq!(created_at.len(), 6);
        for pair in created_at.windows(2) {
            assert!(pair[1] - pair[0] >= minutes(10));
        }
    }

    #[tokio::test]
    async fn test_min_trigger_count_uses_sliding_window() {
        let (engine, _recorder) = engine_with(config());
        engine
            .add_rule(
                AlertRule::new(
                    "mem",
                    "Memory",
                    Severity::Warning,
                    Condition::metric_above("system.memory_percent", 80.0),
                )
                .with_min_triggers(3, Duration::from_secs(600)),
            )
            .unwrap();
        let t0 = Utc::now();

        assert!(engine.evaluate(&memory(t0, 90.0)).await.is_empty());
        // A false evaluation does not count
        assert!(engine.evaluate(&memory(t0 + minutes(2), 50.0)).await.is_empty());
        assert!(engine.evaluate(&memory(t0 + minutes(9), 90.0)).await.is_empty());
        // First hit falls out of the 10 minute window
        assert!(engine.evaluate(&memory(t0 + minutes(11), 90.0)).await.is_empty());
        assert_eq!(engine.evaluate(&memory(t0 + minutes(12), 90.0)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_faulty_rule_is_isolated() {
        let (engine, _recorder) = engine_with(config());
        engine
            .add_rule(AlertRule::new(
                "broken",
                "Broken",
                Severity::Error,
                Condition::metric_above("system.no_such_metric", 1.0),
            ))
            .unwrap();
        engine.add_rule(always("healthy", Severity::Info)).unwrap();

        let created = engine.evaluate(&MetricsSnapshot::now()).await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].rule_id, "healthy");
    }

    #[tokio::test]
    async fn test_huge_windows_do_not_break_evaluation() {
        let (engine, _recorder) = engine_with(config());
        let flapping = |window_secs| {
            AlertRule::new(
                "flapping",
                "Flapping",
                Severity::Warning,
                Condition::RecentAlerts {
                    window_secs,
                    op: CompareOp::Ge,
                    count: 1,
                },
            )
        };
        assert!(matches!(
            engine.add_rule(flapping(100_000_000_000_000)),
            Err(RuleError::InvalidCondition(_))
        ));
        engine.add_rule(flapping(crate::alerts::condition::MAX_WINDOW_SECS)).unwrap();
        engine
            .add_rule(always("forever", Severity::Info).with_min_triggers(2, Duration::from_secs(u64::MAX)))
            .unwrap();
        engine.add_rule(always("healthy", Severity::Error)).unwrap();

        let t0 = Utc::now();
        let created = engine.evaluate(&MetricsSnapshot::new(t0)).await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].rule_id, "healthy");

        let created = engine.evaluate(&MetricsSnapshot::new(t0 + minutes(1))).await;
        let mut ids: Vec<_> = created.iter().map(|a| a.rule_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["forever", "healthy"]);
    }

    #[tokio::test]
    async fn test_summary_since_covers_replayed_snapshots() {
        let (engine, _recorder) = engine_with(config());
        engine.add_rule(always("replayed", Severity::Warning)).unwrap();
        let past = Utc::now() - chrono::Duration::days(30);

        engine.evaluate(&MetricsSnapshot::new(past)).await;

        assert!(engine.get_alert_history(24).is_empty());
        assert_eq!(engine.get_summary(24).total_alerts, 0);
        assert_eq!(engine.alert_history_since(past - minutes(1)).len(), 1);

        let summary = engine.get_summary_since(past - minutes(1));
        assert_eq!(summary.total_alerts, 1);
        assert!(summary.period_hours >= 30 * 24);
        assert_eq!(summary.open_alerts, 1);
        assert_eq!(engine.get_summary_since(past + minutes(1)).total_alerts, 0);

        // Unbounded lookback clamps instead of overflowing
        assert_eq!(engine.get_alert_history(u64::MAX).len(), 1);
        assert_eq!(engine.get_summary(u64::MAX).total_alerts, 1);
    }

    #[tokio::test]
    async fn test_escalation_is_bounded_and_widens_channels() {
        let (engine, recorder) = engine_with(config());
        let pager = RecordingChannel::new("pager");
        engine.register_channel(pager.clone());
        engine
            .add_rule(always("disk", Severity::Error).with_escalation(EscalationPolicy::new(
                Duration::from_secs(60),
                vec!["pager".to_string()],
                2,
            )))
            .unwrap();

        let t0 = Utc::now();
        let id = engine.evaluate(&MetricsSnapshot::new(t0)).await[0].id.clone();

        assert!(engine.check_escalations(t0 + chrono::Duration::seconds(30)).await.is_empty());

        let escalated = engine.check_escalations(t0 + chrono::Duration::seconds(60)).await;
        assert_eq!(escalated.len(), 1);
        assert_eq!(escalated[0].escalation_count, 1);
        assert_eq!(escalated[0].channels, vec!["recorder".to_string(), "pager".to_string()]);
        assert_eq!(pager.count(), 1);
        assert_eq!(pager.received.lock()[0].escalation_count, 1);

        // Second escalation adds no new channel, so nothing is sent
        let escalated = engine.check_escalations(t0 + chrono::Duration::seconds(120)).await;
        assert_eq!(escalated[0].escalation_count, 2);
        assert_eq!(pager.count(), 1);

        for hours in [1, 10, 100] {
            engine.check_escalations(t0 + chrono::Duration::hours(hours)).await;
        }
        assert_eq!(engine.get_alert(&id).unwrap().escalation_count, 2);
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn test_acknowledged_alerts_do_not_escalate() {
        let (engine, _recorder) = engine_with(config());
        engine
            .add_rule(always("disk", Severity::Error).with_escalation(EscalationPolicy::new(
                Duration::from_secs(60),
                vec!["pager".to_string()],
                3,
            )))
            .unwrap();
        let t0 = Utc::now();
        let id = engine.evaluate(&MetricsSnapshot::new(t0)).await[0].id.clone();
        assert!(engine.acknowledge(&id, "ops").is_applied());

        assert!(engine.check_escalations(t0 + chrono::Duration::hours(1)).await.is_empty());
        assert_eq!(engine.get_alert(&id).unwrap().escalation_count, 0);
    }

    #[tokio::test]
    async fn test_acknowledged_alert_auto_resolves() {
        let (engine, _recorder) = engine_with(config());
        engine.add_rule(builtin("memory_high")).unwrap();
        let t0 = Utc::now();
        let id = engine.evaluate(&memory(t0, 95.0)).await[0].id.clone();
        assert!(engine.acknowledge(&id, "ops").is_applied());

        // Stale snapshot from before the alert does not resolve it
        assert!(engine.check_auto_resolve(&memory(t0 - minutes(1), 10.0)).is_empty());
        assert_eq!(engine.check_auto_resolve(&memory(t0 + minutes(1), 10.0)).len(), 1);
        assert_eq!(engine.get_alert(&id).unwrap().status, AlertStatus::Resolved);
    }

    #[tokio::test]
    async fn test_suppressed_alerts_are_recorded_not_delivered() {
        let (engine, recorder) = engine_with(config());
        engine.add_rule(always("r1", Severity::Critical)).unwrap();
        engine.set_global_suppression(true, None).unwrap();

        let created = engine.evaluate(&MetricsSnapshot::now()).await;
        assert_eq!(created[0].status, AlertStatus::Suppressed);
        assert!(created[0].suppression_reason.is_some());
        assert!(created[0].notifications.is_empty());
        assert_eq!(recorder.count(), 0);
        assert!(engine.get_active_alerts(None).is_empty());
        assert_eq!(engine.get_alert_history(1).len(), 1);
        assert_eq!(
            engine.acknowledge(&created[0].id, "ops"),
            TransitionOutcome::InvalidState(AlertStatus::Suppressed)
        );
    }

    #[tokio::test]
    async fn test_maintenance_mode_lets_emergencies_through() {
        let (engine, recorder) = engine_with(AlertingConfig {
            maintenance_mode: true,
            ..config()
        });
        engine.add_rule(always("warn", Severity::Warning)).unwrap();
        engine.add_rule(always("crit", Severity::Critical)).unwrap();

        let created = engine.evaluate(&MetricsSnapshot::now()).await;
        let status = |rule: &str| created.iter().find(|a| a.rule_id == rule).unwrap().status;
        assert_eq!(status("warn"), AlertStatus::Suppressed);
        assert_eq!(status("crit"), AlertStatus::Active);
        assert_eq!(recorder.count(), 1);

        engine.set_maintenance_mode(false, None).unwrap();
        assert!(!engine.get_summary(1).maintenance_mode);
    }

    #[tokio::test]
    async fn test_channel_failure_does_not_block_others() {
        let (engine, _recorder) = engine_with(config());
        let bad = RecordingChannel::new("bad");
        bad.fail.store(true, Ordering::SeqCst);
        let good = RecordingChannel::new("good");
        engine.register_channel(bad.clone());
        engine.register_channel(good.clone());
        engine
            .add_rule(always("r1", Severity::Error).with_channel("bad").with_channel("good"))
            .unwrap();

        let created = engine.evaluate(&MetricsSnapshot::now()).await;
        let alert = &created[0];
        assert_eq!(alert.notifications.len(), 2);
        assert_eq!(alert.delivered_channels(), vec!["good"]);
        assert_eq!(good.count(), 1);
        assert_eq!(engine.channel_stats()["bad"].failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_lock_not_held_during_delivery() {
        let engine = Arc::new(AlertingEngine::new(config()).unwrap());
        let slow = RecordingChannel::slow("recorder", Duration::from_secs(5));
        engine.register_channel(slow.clone());
        engine.add_rule(always("r1", Severity::Error)).unwrap();

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.evaluate(&MetricsSnapshot::now()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Delivery still in flight; the engine stays usable
        let active = engine.get_active_alerts(None);
        assert_eq!(active.len(), 1);
        assert!(active[0].notifications.is_empty());
        assert_eq!(engine.acknowledge(&active[0].id, "ops"), TransitionOutcome::Applied);

        let created = task.await.unwrap();
        assert_eq!(created[0].notifications.len(), 1);
        assert_eq!(created[0].status, AlertStatus::Acknowledged);
        assert_eq!(slow.count(), 1);
    }

    #[tokio::test]
    async fn test_send_test_alert() {
        let (engine, recorder) = engine_with(config());
        let other = RecordingChannel::new("other");
        engine.register_channel(other.clone());

        let alert = engine.send_test_alert(Severity::Info, None).await;
        assert_eq!(alert.status, AlertStatus::Resolved);
        assert_eq!(alert.delivered_channels(), vec!["recorder"]);
        assert_eq!(other.count(), 0);

        let alert = engine
            .send_test_alert(Severity::Critical, Some(vec!["other".to_string(), "missing".to_string()]))
            .await;
        assert_eq!(alert.notifications.len(), 2);
        assert_eq!(other.count(), 1);
        assert_eq!(recorder.count(), 1);
        assert_eq!(engine.get_alert_history(1).len(), 2);
        assert!(engine.get_active_alerts(None).is_empty());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (engine, _recorder) = engine_with(AlertingConfig {
            max_alert_history_size: 3,
            ..config()
        });
        engine.add_rule(always("r1", Severity::Info)).unwrap();
        let t0 = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(engine.evaluate(&MetricsSnapshot::new(t0 + minutes(i))).await[0].id.clone());
        }

        let history = engine.alert_history_since(t0 - minutes(1));
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, ids[4]);
        // Evicted from history but still active
        assert_eq!(engine.get_active_alerts(None).len(), 5);
    }

    #[tokio::test]
    async fn test_active_alerts_filter_and_order() {
        let (engine, _recorder) = engine_with(config());
        engine.add_rule(always("info", Severity::Info)).unwrap();
        engine.add_rule(always("crit", Severity::Critical)).unwrap();
        engine.add_rule(always("warn", Severity::Warning)).unwrap();
        engine.evaluate(&MetricsSnapshot::now()).await;

        let severities: Vec<Severity> = engine.get_active_alerts(None).iter().map(|a| a.severity).collect();
        assert_eq!(severities, vec![Severity::Critical, Severity::Warning, Severity::Info]);
        assert_eq!(engine.get_active_alerts(Some(Severity::Warning)).len(), 1);
        assert!(engine.get_active_alerts(Some(Severity::Error)).is_empty());
    }

    #[tokio::test]
    async fn test_rule_administration() {
        let (engine, _recorder) = engine_with(config());
        assert!(engine.add_rule(always("r1", Severity::Info)).unwrap().is_none());
        let previous = engine.add_rule(always("r1", Severity::Error)).unwrap();
        assert_eq!(previous.unwrap().severity, Severity::Info);
        assert_eq!(engine.rules().len(), 1);

        assert!(engine.disable_rule("r1"));
        assert!(engine.evaluate(&MetricsSnapshot::now()).await.is_empty());
        assert!(engine.enable_rule("r1"));
        assert_eq!(engine.evaluate(&MetricsSnapshot::now()).await[0].severity, Severity::Error);

        assert!(!engine.disable_rule("missing"));
        assert!(engine.remove_rule("r1"));
        assert!(!engine.remove_rule("r1"));
        assert!(engine.get_rule("r1").is_none());

        let invalid = AlertRule::new(
            "t",
            "Threshold",
            Severity::Info,
            Condition::metric_vs_threshold("system.cpu_percent", CompareOp::Gt),
        );
        assert!(engine.add_rule(invalid).is_err());
    }

    #[tokio::test]
    async fn test_summary_and_manual_suppression() {
        let (engine, _recorder) = engine_with(config());
        engine.add_rule(always("noisy", Severity::Warning)).unwrap();
        engine.add_rule(always("quiet", Severity::Error)).unwrap();
        let id = engine
            .add_suppression(SuppressionMatcher::RuleId("noisy".into()), "known issue", None)
            .unwrap();

        engine.evaluate(&MetricsSnapshot::now()).await;
        let summary = engine.get_summary(24);
        assert_eq!(summary.total_alerts, 2);
        assert_eq!(summary.count_for_status(AlertStatus::Suppressed), 1);
        assert_eq!(summary.open_alerts, 1);
        assert_eq!(summary.rules_total, 2);
        assert_eq!(summary.active_suppressions, 1);
        assert_eq!(summary.suppression.manual, 1);
        assert_eq!(summary.channels["recorder"].successes, 1);

        assert!(engine.remove_suppression(&id));
        assert!(engine.list_suppressions().is_empty());
    }

    #[test]
    fn test_builtin_rules_loaded_by_default() {
        let engine = AlertingEngine::new(AlertingConfig::default()).unwrap();
        assert!(engine.get_rule("memory_high").is_some());
        assert!(engine.get_rule("api_down").is_some());

        let invalid = AlertingConfig {
            evaluation_interval_seconds: 0,
            ..Default::default()
        };
        assert!(AlertingEngine::new(invalid).is_err());
    }

    #[test]
    fn test_message_formatting() {
        let rule = builtin("memory_high");
        let mut context = BTreeMap::new();
        context.insert("system.memory_percent".to_string(), 85.5);
        assert_eq!(
            format_message(&rule, &context),
            "High memory usage: system.memory_percent=85.50 (threshold 80)"
        );
        assert_eq!(format_message(&rule, &BTreeMap::new()), "High memory usage");
    }
}
