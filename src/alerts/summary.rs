//! Aggregated alert statistics over a reporting period

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::suppression::SuppressionStats;
use super::types::{Alert, AlertStatus};
use crate::notify::ChannelStats;

/// Rules reported in [`AlertSummary::top_rules`]
const TOP_RULES: usize = 5;

/// Alert count for a single rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleCount {
    pub rule_id: String,
    pub count: usize,
}

/// Point-in-time report over the alerts of the last `period_hours`
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertSummary {
    pub period_hours: u64,
    pub generated_at: DateTime<Utc>,
    /// Alerts created within the period, suppressed ones included
    pub total_alerts: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub by_rule: BTreeMap<String, usize>,
    pub top_rules: Vec<RuleCount>,
    /// Open alerts right now, regardless of period
    pub open_alerts: usize,
    pub mean_time_to_resolve_secs: Option<f64>,
    pub notifications_sent: usize,
    pub notification_failures: usize,
    pub rules_total: usize,
    pub rules_enabled: usize,
    pub maintenance_mode: bool,
    pub global_suppression: bool,
    pub active_suppressions: usize,
    pub suppression: SuppressionStats,
    pub channels: BTreeMap<String, ChannelStats>,
    pub degraded_channels: Vec<String>,
}

impl AlertSummary {
    /// Build the alert-derived part of the summary
    pub fn from_alerts<'a>(
        period_hours: u64,
        generated_at: DateTime<Utc>,
        alerts: impl IntoIterator<Item = &'a Alert>,
    ) -> Self {
        let mut summary = Self {
            period_hours,
            generated_at,
            ..Default::default()
        };

        let mut resolve_secs = Vec::new();
        for alert in alerts {
            summary.total_alerts += 1;
            *summary.by_status.entry(alert.status.to_string()).or_default() += 1;
            *summary.by_severity.entry(alert.severity.to_string()).or_default() += 1;
            *summary.by_rule.entry(alert.rule_id.clone()).or_default() += 1;

            for n in &alert.notifications {
                if n.success {
                    summary.notifications_sent += 1;
                } else {
                    summary.notification_failures += 1;
                }
            }

            if alert.status == AlertStatus::Resolved {
                if let Some(resolved_at) = alert.resolved_at {
                    let secs = (resolved_at - alert.created_at).num_milliseconds() as f64 / 1000.0;
                    resolve_secs.push(secs.max(0.0));
                }
            }
        }

        if !resolve_secs.is_empty() {
            summary.mean_time_to_resolve_secs = Some(resolve_secs.iter().sum::<f64>() / resolve_secs.len() as f64);
        }

        let mut ranked: Vec<RuleCount> = summary
            .by_rule
            .iter()
            .map(|(rule_id, count)| RuleCount {
                rule_id: rule_id.clone(),
                count: *count,
            })
            .collect();
        // BTreeMap order keeps ties stable by rule id
        ranked.sort_by(|a, b| b.count.cmp(&a.count));
        ranked.truncate(TOP_RULES);
        summary.top_rules = ranked;

        summary
    }

    pub fn with_channel_stats(mut self, stats: HashMap<String, ChannelStats>) -> Self {
        self.degraded_channels = stats
            .iter()
            .filter(|(_, s)| s.degraded)
            .map(|(name, _)| name.clone())
            .collect();
        self.degraded_channels.sort();
        self.channels = stats.into_iter().collect();
        self
    }

    pub fn count_for_status(&self, status: AlertStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}
