//! Pipewatch alerting service
//!
//! Reads metric snapshots as JSON lines from stdin and evaluates alert rules
//! against them until stdin closes or Ctrl-C is received.
//!
//! Run with: `collector | cargo run`
//!
//! Environment variables:
//! - PIPEWATCH_CONFIG: JSON config file; `PIPEWATCH_*` variables override it
//! - PIPEWATCH_RULES_FILE: JSON array of additional alert rules
//! - PIPEWATCH_REPLAY: Evaluate every snapshot as it arrives instead of on
//!   the scheduler interval, using snapshot timestamps (default: false)
//! - PIPEWATCH_ALERT_LOG_PATH: Append alerts as JSON lines to this file
//! - PIPEWATCH_WEBHOOK_URL: POST alerts to this URL
//! - RUST_LOG: Log level (default: pipewatch=info)

use std::sync::Arc;

use chrono::{DateTime, Utc};

use pipewatch::alerts::{AlertRule, AlertingEngine, Scheduler};
use pipewatch::config::AlertingConfig;
use pipewatch::metrics::MetricsSnapshot;
use pipewatch::notify::{ConsoleChannel, JsonLinesChannel, LogChannel, WebhookChannel};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so the console channel owns stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipewatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match std::env::var("PIPEWATCH_CONFIG") {
        Ok(path) => AlertingConfig::from_json_file(&path)?.apply_env(|key| std::env::var(key).ok())?,
        Err(_) => AlertingConfig::from_env()?,
    };
    let replay = std::env::var("PIPEWATCH_REPLAY")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let engine = Arc::new(AlertingEngine::new(config.clone())?);
    engine.register_channel(Arc::new(ConsoleChannel::new()));
    engine.register_channel(Arc::new(LogChannel::new()));
    if let Some(path) = &config.alert_log_path {
        engine.register_channel(Arc::new(JsonLinesChannel::new(path)));
    }
    if let Some(url) = &config.webhook_url {
        engine.register_channel(Arc::new(WebhookChannel::new(url)));
    }

    if let Ok(path) = std::env::var("PIPEWATCH_RULES_FILE") {
        let contents = std::fs::read_to_string(&path)?;
        let rules: Vec<AlertRule> = serde_json::from_str(&contents)?;
        for rule in rules {
            engine.add_rule(rule)?;
        }
    }

    tracing::info!("Pipewatch configuration:");
    tracing::info!("  Evaluation interval: {} seconds", config.evaluation_interval_seconds);
    tracing::info!("  Escalation interval: {} seconds", config.escalation_check_interval_seconds);
    tracing::info!("  Rules: {}", engine.rules().len());
    tracing::info!("  Channels: {}", engine.channels().channel_names().join(", "));
    tracing::info!("  Default channels: {}", config.default_channels.join(", "));
    if config.maintenance_mode {
        tracing::info!("  Maintenance mode: ENABLED");
    }
    if replay {
        tracing::info!("  Replay mode: ENABLED");
    }

    let scheduler = Scheduler::new(Arc::clone(&engine));
    if !replay {
        scheduler.start();
    }

    let mut replay_start: Option<DateTime<Utc>> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(snapshot) = parse_snapshot(&line) {
                        let snapshot = engine.add_metrics(snapshot);
                        if replay {
                            let ts = snapshot.timestamp;
                            replay_start = Some(replay_start.map_or(ts, |start| start.min(ts)));
                            engine.evaluate(&snapshot).await;
                            engine.check_auto_resolve(&snapshot);
                            engine.check_escalations(snapshot.timestamp).await;
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!("Metrics input closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read metrics input");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    if !replay {
        // Evaluate whatever arrived since the last tick
        scheduler.run_once().await;
        scheduler.stop().await;
    }

    // Replayed alerts carry their snapshot timestamps
    let summary = match replay_start {
        Some(since) => engine.get_summary_since(since),
        None => engine.get_summary(24),
    };
    tracing::info!(
        total = summary.total_alerts,
        open = summary.open_alerts,
        suppressed = summary.suppression.suppressed,
        "Pipewatch stopped"
    );
    Ok(())
}

fn parse_snapshot(line: &str) -> Option<MetricsSnapshot> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed metrics line");
            None
        }
    }
}
