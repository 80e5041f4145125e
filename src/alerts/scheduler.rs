//! Background worker driving evaluation, auto-resolve, escalation and sweeps

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::engine::AlertingEngine;
use crate::metrics::MetricsProvider;

/// What one evaluation cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// False when there was no snapshot newer than the last evaluated one
    pub evaluated: bool,
    pub snapshot_at: Option<DateTime<Utc>>,
    pub alerts_created: usize,
    pub alerts_resolved: usize,
}

/// Periodic driver for an [`AlertingEngine`].
///
/// Each cycle runs on its own task so a panic inside one cycle is logged
/// and the loop carries on with the next tick.
pub struct Scheduler {
    engine: Arc<AlertingEngine>,
    provider: Option<Arc<dyn MetricsProvider>>,
    evaluation_interval: Duration,
    escalation_interval: Duration,
    sweep_interval: Duration,
    stop_timeout: Duration,
    last_evaluated: Arc<Mutex<Option<DateTime<Utc>>>>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Scheduler using the intervals from the engine's config
    pub fn new(engine: Arc<AlertingEngine>) -> Self {
        let config = engine.config();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            evaluation_interval: config.evaluation_interval(),
            escalation_interval: config.escalation_check_interval(),
            sweep_interval: config.suppression_sweep_interval(),
            stop_timeout: config.stop_timeout(),
            engine,
            provider: None,
            last_evaluated: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Poll `provider` for a snapshot at the start of every cycle
    pub fn with_provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_evaluation_interval(mut self, interval: Duration) -> Self {
        self.evaluation_interval = interval;
        self
    }

    pub fn with_escalation_interval(mut self, interval: Duration) -> Self {
        self.escalation_interval = interval;
        self
    }

    pub fn engine(&self) -> &Arc<AlertingEngine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the background loop; false if it is already running
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let engine = Arc::clone(&self.engine);
        let provider = self.provider.clone();
        let last_evaluated = Arc::clone(&self.last_evaluated);
        let running = Arc::clone(&self.running);
        let evaluation_interval = self.evaluation_interval;
        let escalation_interval = self.escalation_interval;
        let sweep_interval = self.sweep_interval;

        let handle = tokio::spawn(async move {
            tracing::info!(
                evaluation_secs = evaluation_interval.as_secs(),
                escalation_secs = escalation_interval.as_secs(),
                "Alert scheduler started"
            );

            let mut evaluation = time::interval(evaluation_interval);
            evaluation.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut escalation = time::interval(escalation_interval);
            escalation.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sweep = time::interval(sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = evaluation.tick() => {
                        let task = tokio::spawn(run_cycle(
                            Arc::clone(&engine),
                            provider.clone(),
                            Arc::clone(&last_evaluated),
                        ));
                        match task.await {
                            Ok(report) => tracing::debug!(
                                evaluated = report.evaluated,
                                created = report.alerts_created,
                                resolved = report.alerts_resolved,
                                "Scheduler cycle finished"
                            ),
                            Err(e) if e.is_panic() => {
                                tracing::error!(error = ?e, "Evaluation cycle panicked, recovering")
                            }
                            Err(e) => tracing::warn!(error = %e, "Evaluation cycle cancelled"),
                        }
                    }
                    _ = escalation.tick() => {
                        let engine = Arc::clone(&engine);
                        let task = tokio::spawn(async move { engine.check_escalations(Utc::now()).await.len() });
                        match task.await {
                            Ok(0) => {}
                            Ok(escalated) => tracing::debug!(escalated, "Escalation check finished"),
                            Err(e) => tracing::error!(error = ?e, "Escalation check failed, recovering"),
                        }
                    }
                    _ = sweep.tick() => {
                        engine.sweep_suppressions(Utc::now());
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
            tracing::info!("Alert scheduler stopped");
        });

        *self.handle.lock() = Some(handle);
        true
    }

    /// Signal the loop to exit and wait for the cycle in progress.
    ///
    /// The wait is bounded by the stop timeout, which always covers one full
    /// delivery with retries, so in-flight notification results are recorded
    /// before this returns. Returns false if the scheduler was not running.
    pub async fn stop(&self) -> bool {
        let handle = self.handle.lock().take();
        let Some(mut handle) = handle else {
            return false;
        };

        self.shutdown_tx.send_replace(true);
        match time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Alert scheduler task failed"),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.stop_timeout.as_secs(),
                    "Alert scheduler did not stop in time, aborting; in-flight results may be lost"
                );
                handle.abort();
            }
        }
        self.running.store(false, Ordering::SeqCst);
        true
    }

    /// Run one evaluation cycle inline
    pub async fn run_once(&self) -> CycleReport {
        run_cycle(
            Arc::clone(&self.engine),
            self.provider.clone(),
            Arc::clone(&self.last_evaluated),
        )
        .await
    }
}

async fn run_cycle(
    engine: Arc<AlertingEngine>,
    provider: Option<Arc<dyn MetricsProvider>>,
    last_evaluated: Arc<Mutex<Option<DateTime<Utc>>>>,
) -> CycleReport {
    let mut report = CycleReport::default();

    if let Some(provider) = provider {
        match provider.collect().await {
            Ok(Some(snapshot)) => {
                engine.add_metrics(snapshot);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Metrics provider failed, using latest stored snapshot"),
        }
    }

    let Some(snapshot) = engine.latest_metrics() else {
        tracing::debug!("No metrics available yet");
        return report;
    };
    report.snapshot_at = Some(snapshot.timestamp);

    let last = *last_evaluated.lock();
    if last.map_or(true, |last| snapshot.timestamp > last) {
        report.alerts_created = engine.evaluate(&snapshot).await.len();
        report.evaluated = true;
        *last_evaluated.lock() = Some(snapshot.timestamp);
    }

    report.alerts_resolved = engine.check_auto_resolve(&snapshot).len();
    report
}
