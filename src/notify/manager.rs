//! Routing of alerts to channels with per-channel health statistics

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;

use super::channel::{ChannelError, NotificationChannel};
use crate::alerts::{AlertNotification, NotificationResult};

/// Latency samples kept per channel for the rolling average
const LATENCY_SAMPLES: usize = 100;

/// Opt-in bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retries
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn exponential(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay before retry number `retry` (1-based), with up to 10% jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let base = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Delivery settings shared by all channels
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Per-attempt send timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Consecutive failures before a channel is reported as degraded
    pub degraded_after: u32,
}

impl DeliverySettings {
    /// Longest a single `deliver` call can take: every attempt timing out
    /// plus the capped backoff, jitter included, between attempts
    pub fn max_delivery_time(&self) -> Duration {
        let attempts = self.retry.max_attempts.max(1);
        let backoff = self.retry.max_backoff.saturating_add(self.retry.max_backoff / 10);
        self.timeout
            .saturating_mul(attempts)
            .saturating_add(backoff.saturating_mul(attempts - 1))
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::none(),
            degraded_after: 3,
        }
    }
}

/// Rolling delivery statistics for one channel
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    /// Mean latency over the most recent deliveries
    pub avg_latency_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Health flag only; degraded channels still receive alerts
    pub degraded: bool,
}

impl ChannelStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 1.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

#[derive(Debug, Default)]
struct StatsEntry {
    stats: ChannelStats,
    latencies: VecDeque<u64>,
}

impl StatsEntry {
    fn record(&mut self, result: &NotificationResult, degraded_after: u32) -> Option<bool> {
        let was_degraded = self.stats.degraded;
        let stats = &mut self.stats;
        stats.attempts += 1;

        if result.success {
            stats.successes += 1;
            stats.consecutive_failures = 0;
            stats.last_success_at = Some(result.timestamp);
            stats.degraded = false;
        } else {
            stats.failures += 1;
            stats.consecutive_failures += 1;
            stats.last_failure_at = Some(result.timestamp);
            stats.last_error = result.error.clone();
            stats.degraded = degraded_after > 0 && stats.consecutive_failures >= degraded_after;
        }

        self.latencies.push_back(result.latency_ms);
        while self.latencies.len() > LATENCY_SAMPLES {
            self.latencies.pop_front();
        }
        let total: u64 = self.latencies.iter().sum();
        self.stats.avg_latency_ms = total as f64 / self.latencies.len() as f64;

        // Some(new_state) when the degraded flag flipped
        (was_degraded != self.stats.degraded).then_some(self.stats.degraded)
    }
}

/// Routes alerts to registered channels.
///
/// Every channel is sent to independently on its own task; a slow or failing
/// channel only affects its own [`NotificationResult`].
pub struct NotificationChannelManager {
    channels: RwLock<HashMap<String, Arc<dyn NotificationChannel>>>,
    stats: Mutex<HashMap<String, StatsEntry>>,
    settings: DeliverySettings,
}

impl NotificationChannelManager {
    pub fn new(settings: DeliverySettings) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    /// Register a channel under its name, replacing any previous one
    pub fn register(&self, channel: Arc<dyn NotificationChannel>) -> Option<Arc<dyn NotificationChannel>> {
        let name = channel.name().to_string();
        tracing::info!(channel = %name, "Notification channel registered");
        self.stats.lock().entry(name.clone()).or_default();
        self.channels.write().insert(name, channel)
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.stats.lock().remove(name);
        self.channels.write().remove(name).is_some()
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.read().contains_key(name)
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Deliver to every named channel concurrently.
    ///
    /// Returns one result per distinct channel name, in request order.
    /// Unknown channels, unavailable channels, timeouts and panics inside a
    /// channel all come back as failed results.
    pub async fn deliver(&self, alert: &AlertNotification, channel_names: &[String]) -> Vec<NotificationResult> {
        let mut names: Vec<&String> = Vec::with_capacity(channel_names.len());
        for name in channel_names {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let tasks = names.into_iter().map(|name| {
            let channel = self.channels.read().get(name.as_str()).cloned();
            let name = name.clone();
            let alert = alert.clone();
            let timeout = self.settings.timeout;
            let retry = self.settings.retry.clone();

            async move {
                let Some(channel) = channel else {
                    tracing::warn!(channel = %name, alert_id = %alert.id, "Alert routed to unregistered channel");
                    return (
                        name.clone(),
                        false,
                        NotificationResult::failure(name.clone(), Duration::ZERO, ChannelError::NotRegistered(name).to_string()),
                    );
                };

                let started = Instant::now();
                let handle = tokio::spawn(async move { send_with_retry(channel, &alert, timeout, &retry).await });
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => Err(ChannelError::Cancelled("channel panicked".to_string())),
                    Err(_) => Err(ChannelError::Cancelled("send task cancelled".to_string())),
                };
                let latency = started.elapsed();

                let result = match outcome {
                    Ok(()) => NotificationResult::success(name.clone(), latency),
                    Err(e) => NotificationResult::failure(name.clone(), latency, e.to_string()),
                };
                (name, true, result)
            }
        });

        let outcomes = futures::future::join_all(tasks).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (name, registered, result) in outcomes {
            if registered {
                self.record(&name, &result);
            }
            if !result.success {
                tracing::warn!(
                    channel = %name,
                    alert_id = %alert.id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Notification delivery failed"
                );
            }
            results.push(result);
        }
        results
    }

    fn record(&self, name: &str, result: &NotificationResult) {
        let flipped = {
            let mut stats = self.stats.lock();
            stats
                .entry(name.to_string())
                .or_default()
                .record(result, self.settings.degraded_after)
        };
        match flipped {
            Some(true) => tracing::warn!(channel = %name, "Notification channel degraded"),
            Some(false) => tracing::info!(channel = %name, "Notification channel recovered"),
            None => {}
        }
    }

    pub fn channel_stats(&self, name: &str) -> Option<ChannelStats> {
        self.stats.lock().get(name).map(|e| e.stats.clone())
    }

    /// Statistics for every registered channel
    pub fn stats(&self) -> HashMap<String, ChannelStats> {
        self.stats
            .lock()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.stats.clone()))
            .collect()
    }

    /// Names of channels currently flagged as degraded
    pub fn degraded_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stats
            .lock()
            .iter()
            .filter(|(_, e)| e.stats.degraded)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for NotificationChannelManager {
    fn default() -> Self {
        Self::new(DeliverySettings::default())
    }
}

async fn send_with_retry(
    channel: Arc<dyn NotificationChannel>,
    alert: &AlertNotification,
    timeout: Duration,
    retry: &RetryPolicy,
) -> Result<(), ChannelError> {
    let attempts = retry.max_attempts.max(1);
    let mut last_error = ChannelError::Send("no attempt made".to_string());

    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(retry.backoff(attempt - 1)).await;
        }

        if !channel.is_available() {
            last_error = ChannelError::Unavailable(channel.name().to_string());
        } else {
            match tokio::time::timeout(timeout, channel.send(alert)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = ChannelError::Timeout(timeout),
            }
        }

        if attempt < attempts {
            tracing::debug!(
                channel = %channel.name(),
                attempt,
                error = %last_error,
                "Retrying notification"
            );
        }
    }

    Err(last_error)
}
