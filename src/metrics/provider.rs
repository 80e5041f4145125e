//! Pull-style metric source polled by the scheduler

use async_trait::async_trait;

use super::snapshot::MetricsSnapshot;

/// Supplies a fresh snapshot each scheduler cycle.
///
/// Implemented by the external collection subsystem when it prefers to be
/// polled instead of pushing snapshots through `AlertingEngine::add_metrics`.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Collect the current metrics. `Ok(None)` means nothing new is available.
    async fn collect(&self) -> Result<Option<MetricsSnapshot>, ProviderError>;
}

/// Metrics provider errors
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Metrics source unavailable: {0}")]
    Unavailable(String),

    #[error("Metrics collection failed: {0}")]
    Collection(String),
}
