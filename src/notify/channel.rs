//! Delivery channel capability

use std::time::Duration;

use async_trait::async_trait;

use crate::alerts::AlertNotification;

/// A destination alerts can be delivered to.
///
/// Implementations must be cheap to call concurrently; the manager runs each
/// send on its own task under a timeout.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Unique routing name, e.g. `console` or `webhook`
    fn name(&self) -> &str;

    /// Deliver one alert
    async fn send(&self, alert: &AlertNotification) -> Result<(), ChannelError>;

    /// Whether the channel can currently accept alerts
    fn is_available(&self) -> bool {
        true
    }
}

/// Channel delivery errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {0} is unavailable")]
    Unavailable(String),

    #[error("Channel send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel {0} is not registered")]
    NotRegistered(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Send cancelled: {0}")]
    Cancelled(String),
}
