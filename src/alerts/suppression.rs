//! Alert suppression: kill-switch, maintenance, manual patterns, burst and rate caps
//!
//! [`SuppressionManager::decide`] checks, in order:
//!
//! 1. the global kill-switch
//! 2. maintenance mode (alerts at or above the emergency severity bypass it)
//! 3. manual pattern entries
//! 4. automatic burst suppression per (rule, severity) signature
//! 5. the per-rule rate cap
//!
//! The first match wins. Expired entries never suppress; they are dropped
//! lazily on every decision and by [`SuppressionManager::purge_expired`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use super::types::Severity;

/// What a suppression entry applies to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SuppressionMatcher {
    All,
    RuleId(String),
    Severity(Severity),
    /// Exact (rule, severity) pair, used by burst detection
    Signature { rule_id: String, severity: Severity },
    /// Shell-style glob over rule ids (`*` and `?`)
    Glob(String),
}

impl fmt::Display for SuppressionMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuppressionMatcher::All => f.write_str("*"),
            SuppressionMatcher::RuleId(id) => write!(f, "rule={}", id),
            SuppressionMatcher::Severity(s) => write!(f, "severity={}", s),
            SuppressionMatcher::Signature { rule_id, severity } => {
                write!(f, "rule={} severity={}", rule_id, severity)
            }
            SuppressionMatcher::Glob(pattern) => write!(f, "rule~{}", pattern),
        }
    }
}

/// Where a suppression entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressionOrigin {
    Manual,
    Burst,
    Maintenance,
    Global,
}

/// A time-boxed suppression rule
#[derive(Debug, Clone, Serialize)]
pub struct SuppressionEntry {
    pub id: String,
    pub matcher: SuppressionMatcher,
    pub origin: SuppressionOrigin,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// Start of the active window; `None` means active immediately
    pub starts_at: Option<DateTime<Utc>>,
    /// End of the active window (exclusive); `None` means until removed
    pub expires_at: Option<DateTime<Utc>>,
    /// Alerts at or above this severity are not suppressed by this entry
    pub override_severity: Option<Severity>,
    /// Alerts suppressed by this entry
    pub hits: u64,
    #[serde(skip)]
    glob: Option<Regex>,
}

impl SuppressionEntry {
    /// Create a manual entry.
    ///
    /// Glob matchers are compiled here; an invalid pattern is an error.
    pub fn manual(
        matcher: SuppressionMatcher,
        reason: impl Into<String>,
        created_at: DateTime<Utc>,
        duration: Option<Duration>,
    ) -> Result<Self, SuppressionError> {
        Self::build(matcher, SuppressionOrigin::Manual, reason, created_at, duration)
    }

    fn build(
        matcher: SuppressionMatcher,
        origin: SuppressionOrigin,
        reason: impl Into<String>,
        created_at: DateTime<Utc>,
        duration: Option<Duration>,
    ) -> Result<Self, SuppressionError> {
        let glob = match &matcher {
            SuppressionMatcher::Glob(pattern) => Some(compile_glob(pattern)?),
            _ => None,
        };
        let expires_at = match duration {
            Some(d) => Some(
                created_at
                    .checked_add_signed(to_chrono(d)?)
                    .ok_or(SuppressionError::DurationOutOfRange(d))?,
            ),
            None => None,
        };
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            matcher,
            origin,
            reason: reason.into(),
            created_at,
            starts_at: None,
            expires_at,
            override_severity: None,
            hits: 0,
            glob,
        })
    }

    /// Only become active at `starts_at`
    pub fn starting_at(mut self, starts_at: DateTime<Utc>) -> Self {
        self.starts_at = Some(starts_at);
        self
    }

    /// Let alerts at or above `severity` through
    pub fn with_override(mut self, severity: Severity) -> Self {
        self.override_severity = Some(severity);
        self
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.starts_at.map_or(true, |s| now >= s) && !self.is_expired(now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |e| now >= e)
    }

    pub fn matches(&self, rule_id: &str, severity: Severity) -> bool {
        match &self.matcher {
            SuppressionMatcher::All => true,
            SuppressionMatcher::RuleId(id) => id == rule_id,
            SuppressionMatcher::Severity(s) => *s == severity,
            SuppressionMatcher::Signature {
                rule_id: id,
                severity: s,
            } => id == rule_id && *s == severity,
            SuppressionMatcher::Glob(_) => self.glob.as_ref().map_or(false, |re| re.is_match(rule_id)),
        }
    }

    /// Whether this entry would suppress an alert right now
    pub fn applies_to(&self, rule_id: &str, severity: Severity, now: DateTime<Utc>) -> bool {
        self.is_active(now)
            && self.matches(rule_id, severity)
            && !self.override_severity.map_or(false, |t| severity >= t)
    }
}

/// Why an alert was suppressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "entry_id", rename_all = "snake_case")]
pub enum SuppressionReason {
    Global,
    Maintenance,
    Manual(String),
    Burst(String),
    RateLimit,
}

impl fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuppressionReason::Global => f.write_str("global suppression active"),
            SuppressionReason::Maintenance => f.write_str("maintenance mode"),
            SuppressionReason::Manual(id) => write!(f, "manual suppression {}", id),
            SuppressionReason::Burst(id) => write!(f, "burst suppression {}", id),
            SuppressionReason::RateLimit => f.write_str("alert rate limit exceeded"),
        }
    }
}

/// Outcome of a suppression check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressionDecision {
    Deliver,
    Suppress(SuppressionReason),
}

impl SuppressionDecision {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, SuppressionDecision::Suppress(_))
    }
}

/// Tunables for automatic suppression
#[derive(Debug, Clone)]
pub struct SuppressionSettings {
    pub enable_auto_suppression: bool,
    /// More than this many alerts per signature within `burst_window` is a burst
    pub burst_threshold: usize,
    pub burst_window: Duration,
    /// Lifetime of an automatically created burst entry
    pub suppression_duration: Duration,
    /// Delivered alerts allowed per rule within `rate_window`
    pub max_alerts_per_window: usize,
    pub rate_window: Duration,
    /// Alerts at or above this severity bypass maintenance mode
    pub emergency_severity_threshold: Severity,
}

impl Default for SuppressionSettings {
    fn default() -> Self {
        Self {
            enable_auto_suppression: true,
            burst_threshold: 5,
            burst_window: Duration::from_secs(300),
            suppression_duration: Duration::from_secs(1800),
            max_alerts_per_window: 10,
            rate_window: Duration::from_secs(60),
            emergency_severity_threshold: Severity::Critical,
        }
    }
}

/// Suppression counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuppressionStats {
    pub checked: u64,
    pub suppressed: u64,
    pub global: u64,
    pub maintenance: u64,
    pub manual: u64,
    pub burst: u64,
    pub rate_limited: u64,
    pub burst_entries_created: u64,
}

/// Decides whether candidate alerts are delivered or suppressed.
///
/// Not internally synchronized; the engine keeps it under its state lock.
#[derive(Debug)]
pub struct SuppressionManager {
    settings: SuppressionSettings,
    global: Option<SuppressionEntry>,
    maintenance: Option<SuppressionEntry>,
    entries: Vec<SuppressionEntry>,
    burst_tracker: HashMap<(String, Severity), VecDeque<DateTime<Utc>>>,
    rate_tracker: HashMap<String, VecDeque<DateTime<Utc>>>,
    stats: SuppressionStats,
}

impl SuppressionManager {
    pub fn new(settings: SuppressionSettings) -> Self {
        Self {
            settings,
            global: None,
            maintenance: None,
            entries: Vec::new(),
            burst_tracker: HashMap::new(),
            rate_tracker: HashMap::new(),
            stats: SuppressionStats::default(),
        }
    }

    pub fn settings(&self) -> &SuppressionSettings {
        &self.settings
    }

    /// Decide whether an alert for `rule_id` at `severity` is suppressed.
    ///
    /// Delivered alerts are counted toward the rate cap; every alert that
    /// reaches the burst check counts toward burst detection.
    pub fn decide(&mut self, rule_id: &str, severity: Severity, now: DateTime<Utc>) -> SuppressionDecision {
        self.stats.checked += 1;
        let decision = self.evaluate(rule_id, severity, now);

        if let SuppressionDecision::Suppress(reason) = &decision {
            self.stats.suppressed += 1;
            match reason {
                SuppressionReason::Global => self.stats.global += 1,
                SuppressionReason::Maintenance => self.stats.maintenance += 1,
                SuppressionReason::Manual(_) => self.stats.manual += 1,
                SuppressionReason::Burst(_) => self.stats.burst += 1,
                SuppressionReason::RateLimit => self.stats.rate_limited += 1,
            }
            tracing::debug!(rule_id = %rule_id, severity = %severity, reason = %reason, "Alert suppressed");
        }

        decision
    }

    fn evaluate(&mut self, rule_id: &str, severity: Severity, now: DateTime<Utc>) -> SuppressionDecision {
        self.purge_expired(now);

        if let Some(global) = self.global.as_mut() {
            if global.applies_to(rule_id, severity, now) {
                global.hits += 1;
                return SuppressionDecision::Suppress(SuppressionReason::Global);
            }
        }

        if let Some(maintenance) = self.maintenance.as_mut() {
            if maintenance.applies_to(rule_id, severity, now) {
                maintenance.hits += 1;
                return SuppressionDecision::Suppress(SuppressionReason::Maintenance);
            }
        }

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.origin == SuppressionOrigin::Manual && e.applies_to(rule_id, severity, now))
        {
            entry.hits += 1;
            return SuppressionDecision::Suppress(SuppressionReason::Manual(entry.id.clone()));
        }

        if self.settings.enable_auto_suppression {
            if let Some(reason) = self.check_burst(rule_id, severity, now) {
                return SuppressionDecision::Suppress(reason);
            }
        }

        self.check_rate(rule_id, now)
    }

    fn check_burst(&mut self, rule_id: &str, severity: Severity, now: DateTime<Utc>) -> Option<SuppressionReason> {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.origin == SuppressionOrigin::Burst && e.applies_to(rule_id, severity, now))
        {
            entry.hits += 1;
            return Some(SuppressionReason::Burst(entry.id.clone()));
        }

        let cutoff = window_start(now, self.settings.burst_window)?;
        let times = self
            .burst_tracker
            .entry((rule_id.to_string(), severity))
            .or_default();
        times.push_back(now);
        while times.front().map_or(false, |t| *t < cutoff) {
            times.pop_front();
        }

        if times.len() <= self.settings.burst_threshold {
            return None;
        }

        let count = times.len();
        times.clear();

        let entry = SuppressionEntry::build(
            SuppressionMatcher::Signature {
                rule_id: rule_id.to_string(),
                severity,
            },
            SuppressionOrigin::Burst,
            format!(
                "{} alerts within {}s",
                count,
                self.settings.burst_window.as_secs()
            ),
            now,
            Some(self.settings.suppression_duration),
        );

        match entry {
            Ok(mut entry) => {
                entry.hits = 1;
                let id = entry.id.clone();
                tracing::warn!(
                    rule_id = %rule_id,
                    severity = %severity,
                    alerts = count,
                    duration_secs = self.settings.suppression_duration.as_secs(),
                    "Alert burst detected, suppressing signature"
                );
                self.entries.push(entry);
                self.stats.burst_entries_created += 1;
                Some(SuppressionReason::Burst(id))
            }
            Err(e) => {
                tracing::error!(rule_id = %rule_id, error = %e, "Failed to create burst suppression");
                None
            }
        }
    }

    fn check_rate(&mut self, rule_id: &str, now: DateTime<Utc>) -> SuppressionDecision {
        let max = self.settings.max_alerts_per_window;
        let Some(cutoff) = window_start(now, self.settings.rate_window) else {
            return SuppressionDecision::Deliver;
        };

        let times = self.rate_tracker.entry(rule_id.to_string()).or_default();
        while times.front().map_or(false, |t| *t <= cutoff) {
            times.pop_front();
        }

        if max > 0 && times.len() >= max {
            return SuppressionDecision::Suppress(SuppressionReason::RateLimit);
        }

        times.push_back(now);
        SuppressionDecision::Deliver
    }

    /// Add a manual entry; returns its id
    pub fn add_entry(&mut self, entry: SuppressionEntry) -> String {
        let id = entry.id.clone();
        tracing::info!(
            suppression_id = %id,
            matcher = %entry.matcher,
            reason = %entry.reason,
            "Suppression added"
        );
        self.entries.push(entry);
        id
    }

    /// Remove any entry by id (manual or burst); false if unknown
    pub fn remove_entry(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        before != self.entries.len()
    }

    /// Turn the global kill-switch on (optionally for a fixed time) or off
    pub fn set_global(&mut self, enabled: bool, duration: Option<Duration>, now: DateTime<Utc>) -> Result<(), SuppressionError> {
        self.global = if enabled {
            Some(SuppressionEntry::build(
                SuppressionMatcher::All,
                SuppressionOrigin::Global,
                "global suppression",
                now,
                duration,
            )?)
        } else {
            None
        };
        tracing::warn!(enabled, "Global alert suppression changed");
        Ok(())
    }

    /// Turn maintenance mode on (optionally for a fixed time) or off
    pub fn set_maintenance(&mut self, enabled: bool, duration: Option<Duration>, now: DateTime<Utc>) -> Result<(), SuppressionError> {
        self.maintenance = if enabled {
            Some(
                SuppressionEntry::build(
                    SuppressionMatcher::All,
                    SuppressionOrigin::Maintenance,
                    "maintenance mode",
                    now,
                    duration,
                )?
                .with_override(self.settings.emergency_severity_threshold),
            )
        } else {
            None
        };
        tracing::info!(enabled, "Maintenance mode changed");
        Ok(())
    }

    pub fn is_global_active(&self, now: DateTime<Utc>) -> bool {
        self.global.as_ref().map_or(false, |g| g.is_active(now))
    }

    pub fn is_maintenance_active(&self, now: DateTime<Utc>) -> bool {
        self.maintenance.as_ref().map_or(false, |m| m.is_active(now))
    }

    /// Drop expired entries and stale tracking state; returns entries removed
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_expired(now));
        let mut removed = before - self.entries.len();

        if self.global.as_ref().map_or(false, |g| g.is_expired(now)) {
            self.global = None;
            removed += 1;
        }
        if self.maintenance.as_ref().map_or(false, |m| m.is_expired(now)) {
            self.maintenance = None;
            removed += 1;
        }

        if let Some(cutoff) = window_start(now, self.settings.burst_window) {
            self.burst_tracker
                .retain(|_, times| times.back().map_or(false, |t| *t >= cutoff));
        }
        if let Some(cutoff) = window_start(now, self.settings.rate_window) {
            self.rate_tracker
                .retain(|_, times| times.back().map_or(false, |t| *t > cutoff));
        }

        removed
    }

    /// Every entry, including the global and maintenance switches
    pub fn entries(&self) -> Vec<SuppressionEntry> {
        self.global
            .iter()
            .chain(self.maintenance.iter())
            .chain(self.entries.iter())
            .cloned()
            .collect()
    }

    pub fn active_entries(&self, now: DateTime<Utc>) -> Vec<SuppressionEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.is_active(now))
            .collect()
    }

    pub fn stats(&self) -> &SuppressionStats {
        &self.stats
    }
}

/// Suppression errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SuppressionError {
    #[error("Invalid glob pattern {0}: {1}")]
    InvalidPattern(String, String),

    #[error("Duration out of range: {0:?}")]
    DurationOutOfRange(Duration),
}

fn compile_glob(pattern: &str) -> Result<Regex, SuppressionError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| SuppressionError::InvalidPattern(pattern.to_string(), e.to_string()))
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, SuppressionError> {
    chrono::Duration::from_std(duration).map_err(|_| SuppressionError::DurationOutOfRange(duration))
}

/// `now - window`, or `None` when it is not representable
fn window_start(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(to_chrono(window).ok()?)
}
