//! Runtime statistics for channels.

pub mod channel_metrics;

pub use channel_metrics::{ChannelMetrics, ChannelStatistics, MetricsContext, Statistics};
