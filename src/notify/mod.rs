//! Notification channels
//!
//! Channels are pluggable delivery targets behind the [`NotificationChannel`]
//! trait. The [`NotificationChannelManager`] routes an alert to several
//! channels concurrently and keeps per-channel health statistics.

mod adapters;
mod channel;
mod manager;

pub use adapters::{BroadcastChannel, ConsoleChannel, JsonLinesChannel, LogChannel, WebhookChannel};
pub use channel::{ChannelError, NotificationChannel};
pub use manager::{ChannelStats, DeliverySettings, NotificationChannelManager, RetryPolicy};

#[cfg(test)]
pub(crate) use manager::tests::RecordingChannel;
