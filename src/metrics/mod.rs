//! Pipeline metrics consumed by the alerting engine
//!
//! Snapshots are produced externally, either pushed into the engine or pulled
//! through a [`MetricsProvider`], and kept in a bounded [`MetricsHistory`].

pub mod history;
pub mod provider;
pub mod snapshot;

pub use history::{MetricsHistory, MetricsWindow};
pub use provider::{MetricsProvider, ProviderError};
pub use snapshot::{
    ApiMetrics, CollectionMetrics, MetricsSnapshot, ProcessingMetrics, SystemMetrics,
    VenueProgress,
};
