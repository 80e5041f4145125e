//! Metric snapshot types produced by the collection pipeline

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable, timestamped aggregate of pipeline metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// When the producer captured this snapshot
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub collection: CollectionMetrics,
    /// Per-source API metrics keyed by source name
    #[serde(default)]
    pub api: HashMap<String, ApiMetrics>,
    #[serde(default)]
    pub processing: ProcessingMetrics,
    #[serde(default)]
    pub system: SystemMetrics,
    /// Per-venue collection progress keyed by venue name
    #[serde(default)]
    pub venues: HashMap<String, VenueProgress>,
}

/// Overall collection progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetrics {
    pub items_collected: u64,
    pub items_per_minute: f64,
    pub errors: u64,
    pub active_collectors: u32,
    /// Last time any collector made progress
    pub last_progress_at: Option<DateTime<Utc>>,
}

/// Metrics for a single upstream API source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiMetrics {
    pub requests: u64,
    pub errors: u64,
    pub rate_limited: u64,
    pub avg_response_ms: f64,
    pub available: bool,
}

impl ApiMetrics {
    /// Error fraction in [0, 1]; zero when no requests were made
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.errors as f64 / self.requests as f64
    }
}

/// Downstream processing metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub queue_depth: u64,
    pub processed: u64,
    pub failed: u64,
    pub avg_processing_ms: f64,
}

impl ProcessingMetrics {
    pub fn failure_rate(&self) -> f64 {
        let total = self.processed + self.failed;
        if total == 0 {
            return 0.0;
        }
        self.failed as f64 / total as f64
    }
}

/// Host resource usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: f64,
    pub disk_percent: f64,
    pub open_connections: u64,
}

/// Collection progress of a single venue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VenueProgress {
    pub collected: u64,
    pub expected: u64,
    pub errors: u64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl VenueProgress {
    pub fn completion_percent(&self) -> f64 {
        if self.expected == 0 {
            return 100.0;
        }
        (self.collected as f64 / self.expected as f64) * 100.0
    }
}

impl MetricsSnapshot {
    /// Create an empty snapshot stamped with the given time
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            collection: CollectionMetrics::default(),
            api: HashMap::new(),
            processing: ProcessingMetrics::default(),
            system: SystemMetrics::default(),
            venues: HashMap::new(),
        }
    }

    /// Empty snapshot stamped now
    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    pub fn with_system(mut self, system: SystemMetrics) -> Self {
        self.system = system;
        self
    }

    pub fn with_collection(mut self, collection: CollectionMetrics) -> Self {
        self.collection = collection;
        self
    }

    pub fn with_processing(mut self, processing: ProcessingMetrics) -> Self {
        self.processing = processing;
        self
    }

    pub fn with_api(mut self, source: impl Into<String>, metrics: ApiMetrics) -> Self {
        self.api.insert(source.into(), metrics);
        self
    }

    pub fn with_venue(mut self, venue: impl Into<String>, progress: VenueProgress) -> Self {
        self.venues.insert(venue.into(), progress);
        self
    }

    /// Resolve a dotted metric path to a numeric value.
    ///
    /// `now` is used by time-relative paths such as
    /// `collection.seconds_since_progress`. Returns `None` for unknown paths,
    /// unknown sources/venues, and time-relative paths with no reference point.
    ///
    /// Supported paths:
    /// - `collection.{items_collected,items_per_minute,errors,active_collectors,seconds_since_progress}`
    /// - `api.{error_rate,requests,errors,rate_limited,max_response_ms,avg_response_ms,healthy_sources,unhealthy_sources,sources}`
    /// - `api.<source>.{error_rate,requests,errors,rate_limited,avg_response_ms,available}`
    /// - `processing.{queue_depth,processed,failed,failure_rate,avg_processing_ms}`
    /// - `system.{cpu_percent,memory_percent,memory_used_mb,disk_percent,open_connections}`
    /// - `venues.{count,failing,min_completion_percent,max_consecutive_failures}`
    /// - `venues.<venue>.{completion_percent,collected,expected,errors,consecutive_failures,seconds_since_success}`
    pub fn value(&self, path: &str, now: DateTime<Utc>) -> Option<f64> {
        let mut parts = path.splitn(2, '.');
        let group = parts.next()?;
        let rest = parts.next()?;

        match group {
            "collection" => self.collection_value(rest, now),
            "api" => self.api_value(rest),
            "processing" => self.processing_value(rest),
            "system" => self.system_value(rest),
            "venues" => self.venue_value(rest, now),
            _ => None,
        }
    }

    fn collection_value(&self, field: &str, now: DateTime<Utc>) -> Option<f64> {
        let c = &self.collection;
        match field {
            "items_collected" => Some(c.items_collected as f64),
            "items_per_minute" => Some(c.items_per_minute),
            "errors" => Some(c.errors as f64),
            "active_collectors" => Some(c.active_collectors as f64),
            "seconds_since_progress" => c.last_progress_at.map(|t| seconds_between(t, now)),
            _ => None,
        }
    }

    /// Counter summed across sources, saturating at `u64::MAX`
    fn api_total(&self, counter: impl Fn(&ApiMetrics) -> u64) -> u64 {
        self.api.values().map(counter).fold(0u64, u64::saturating_add)
    }

    fn api_value(&self, rest: &str) -> Option<f64> {
        match rest {
            "error_rate" => {
                let requests = self.api_total(|a| a.requests);
                let errors = self.api_total(|a| a.errors);
                if requests == 0 {
                    Some(0.0)
                } else {
                    Some(errors as f64 / requests as f64)
                }
            }
            "requests" => Some(self.api_total(|a| a.requests) as f64),
            "errors" => Some(self.api_total(|a| a.errors) as f64),
            "rate_limited" => Some(self.api_total(|a| a.rate_limited) as f64),
            "max_response_ms" => Some(
                self.api
                    .values()
                    .map(|a| a.avg_response_ms)
                    .fold(0.0, f64::max),
            ),
            "avg_response_ms" => {
                if self.api.is_empty() {
                    return Some(0.0);
                }
                let total: f64 = self.api.values().map(|a| a.avg_response_ms).sum();
                Some(total / self.api.len() as f64)
            }
            "healthy_sources" => Some(self.api.values().filter(|a| a.available).count() as f64),
            "unhealthy_sources" => Some(self.api.values().filter(|a| !a.available).count() as f64),
            "sources" => Some(self.api.len() as f64),
            _ => {
                let (source, field) = rest.rsplit_once('.')?;
                let a = self.api.get(source)?;
                match field {
                    "error_rate" => Some(a.error_rate()),
                    "requests" => Some(a.requests as f64),
                    "errors" => Some(a.errors as f64),
                    "rate_limited" => Some(a.rate_limited as f64),
                    "avg_response_ms" => Some(a.avg_response_ms),
                    "available" => Some(if a.available { 1.0 } else { 0.0 }),
                    _ => None,
                }
            }
        }
    }

    fn processing_value(&self, field: &str) -> Option<f64> {
        let p = &self.processing;
        match field {
            "queue_depth" => Some(p.queue_depth as f64),
            "processed" => Some(p.processed as f64),
            "failed" => Some(p.failed as f64),
            "failure_rate" => Some(p.failure_rate()),
            "avg_processing_ms" => Some(p.avg_processing_ms),
            _ => None,
        }
    }

    fn system_value(&self, field: &str) -> Option<f64> {
        let s = &self.system;
        match field {
            "cpu_percent" => Some(s.cpu_percent),
            "memory_percent" => Some(s.memory_percent),
            "memory_used_mb" => Some(s.memory_used_mb),
            "disk_percent" => Some(s.disk_percent),
            "open_connections" => Some(s.open_connections as f64),
            _ => None,
        }
    }

    fn venue_value(&self, rest: &str, now: DateTime<Utc>) -> Option<f64> {
        match rest {
            "count" => Some(self.venues.len() as f64),
            "failing" => Some(
                self.venues
                    .values()
                    .filter(|v| v.consecutive_failures > 0)
                    .count() as f64,
            ),
            "min_completion_percent" => self
                .venues
                .values()
                .map(VenueProgress::completion_percent)
                .reduce(f64::min),
            "max_consecutive_failures" => Some(
                self.venues
                    .values()
                    .map(|v| v.consecutive_failures)
                    .max()
                    .unwrap_or(0) as f64,
            ),
            _ => {
                let (venue, field) = rest.rsplit_once('.')?;
                let v = self.venues.get(venue)?;
                match field {
                    "completion_percent" => Some(v.completion_percent()),
                    "collected" => Some(v.collected as f64),
                    "expected" => Some(v.expected as f64),
                    "errors" => Some(v.errors as f64),
                    "consecutive_failures" => Some(v.consecutive_failures as f64),
                    "seconds_since_success" => v.last_success_at.map(|t| seconds_between(t, now)),
                    _ => None,
                }
            }
        }
    }
}

fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds().max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> MetricsSnapshot {
        let now = Utc::now();
        MetricsSnapshot::new(now)
            .with_system(SystemMetrics {
                memory_percent: 85.0,
                cpu_percent: 40.0,
                ..Default::default()
            })
            .with_api(
                "exchange.v2",
                ApiMetrics {
                    requests: 100,
                    errors: 25,
                    available: true,
                    avg_response_ms: 120.0,
                    ..Default::default()
                },
            )
            .with_api(
                "registry",
                ApiMetrics {
                    requests: 100,
                    errors: 5,
                    available: false,
                    avg_response_ms: 300.0,
                    ..Default::default()
                },
            )
            .with_venue(
                "north",
                VenueProgress {
                    collected: 50,
                    expected: 200,
                    last_success_at: Some(now - Duration::seconds(90)),
                    ..Default::default()
                },
            )
    }

    #[test]
    fn test_system_paths() {
        let snap = sample();
        assert_eq!(snap.value("system.memory_percent", snap.timestamp), Some(85.0));
        assert_eq!(snap.value("system.cpu_percent", snap.timestamp), Some(40.0));
        assert_eq!(snap.value("system.nope", snap.timestamp), None);
        assert_eq!(snap.value("system", snap.timestamp), None);
    }

    #[test]
    fn test_api_aggregate_and_per_source_paths() {
        let snap = sample();
        let now = snap.timestamp;
        assert_eq!(snap.value("api.error_rate", now), Some(0.15));
        assert_eq!(snap.value("api.healthy_sources", now), Some(1.0));
        assert_eq!(snap.value("api.max_response_ms", now), Some(300.0));
        // Source names may themselves contain dots
        assert_eq!(snap.value("api.exchange.v2.error_rate", now), Some(0.25));
        assert_eq!(snap.value("api.registry.available", now), Some(0.0));
        assert_eq!(snap.value("api.unknown.error_rate", now), None);
    }

    #[test]
    fn test_api_totals_saturate() {
        let huge = ApiMetrics {
            requests: u64::MAX,
            errors: u64::MAX,
            rate_limited: u64::MAX,
            ..Default::default()
        };
        let snap = MetricsSnapshot::now()
            .with_api("a", huge.clone())
            .with_api("b", huge);
        let now = snap.timestamp;

        assert_eq!(snap.value("api.requests", now), Some(u64::MAX as f64));
        assert_eq!(snap.value("api.errors", now), Some(u64::MAX as f64));
        assert_eq!(snap.value("api.rate_limited", now), Some(u64::MAX as f64));
        assert_eq!(snap.value("api.error_rate", now), Some(1.0));
    }

    #[test]
    fn test_time_relative_paths() {
        let snap = sample();
        let now = snap.timestamp;
        assert_eq!(snap.value("venues.north.seconds_since_success", now), Some(90.0));
        assert_eq!(snap.value("venues.north.completion_percent", now), Some(25.0));
        // No progress recorded yet
        assert_eq!(snap.value("collection.seconds_since_progress", now), None);
    }

    #[test]
    fn test_snapshot_deserializes_with_defaults() {
        let snap: MetricsSnapshot = serde_json::from_str(
            r#"{"timestamp":"2026-01-01T00:00:00Z","system":{"cpu_percent":1.0,"memory_percent":2.0,"memory_used_mb":0.0,"disk_percent":0.0,"open_connections":0}}"#,
        )
        .unwrap();
        assert!(snap.api.is_empty());
        assert_eq!(snap.system.memory_percent, 2.0);
    }
}
