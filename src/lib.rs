//! Pipewatch: alert evaluation and notification for data-collection pipelines
//!
//! Rules are evaluated against periodic metric snapshots of a long-running
//! collection pipeline. Alerts that fire go through cooldown, burst and
//! maintenance suppression before they are delivered to pluggable channels.
//!
//! # Features
//!
//! - **Typed Conditions**: Metric-path comparisons with AND/OR/NOT, no code execution
//! - **Lifecycle**: Active, acknowledged, suppressed and resolved alerts with auto-resolve
//! - **Escalation**: Delayed, bounded widening of notification channels
//! - **Suppression**: Global kill-switch, maintenance mode, manual patterns, burst and rate caps
//! - **Channels**: Console, tracing log, JSON-lines file, broadcast and webhook adapters
//! - **Channel Health**: Per-channel latency, success counters and degraded flags
//!
//! # Example
//!
//! ```no_run
//! use pipewatch::alerts::{AlertRule, AlertingEngine, Condition, Severity};
//! use pipewatch::config::AlertingConfig;
//! use pipewatch::metrics::{MetricsSnapshot, SystemMetrics};
//! use pipewatch::notify::LogChannel;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = AlertingEngine::new(AlertingConfig::default())?;
//! engine.register_channel(Arc::new(LogChannel::new()));
//! engine.add_rule(AlertRule::new(
//!     "queue_full",
//!     "Queue full",
//!     Severity::Error,
//!     Condition::metric_above("processing.queue_depth", 50_000.0),
//! ))?;
//!
//! let snapshot = engine.add_metrics(MetricsSnapshot::now().with_system(SystemMetrics {
//!     memory_percent: 92.0,
//!     ..Default::default()
//! }));
//! for alert in engine.evaluate(&snapshot).await {
//!     println!("{}: {}", alert.severity, alert.message);
//! }
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod config;
pub mod metrics;
pub mod notify;

// Re-export commonly used types
pub use alerts::{Alert, AlertRule, AlertStatus, AlertingEngine, Condition, Scheduler, Severity};
pub use config::{AlertingConfig, ConfigError};
pub use metrics::{MetricsHistory, MetricsSnapshot};
pub use notify::{NotificationChannel, NotificationChannelManager};
