//! Weft integration: in-process channels, correlating aggregation, channel
//! metrics, error recovery and UDP adapters.

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod ip;
pub mod management;
pub mod recovery;
pub mod worker;

pub use aggregator::{BarrierStore, BarrierSweeper, CorrelatingHandler, Disposition};
pub use channel::{
    ChannelError, ChannelRegistry, ChannelResolver, DirectChannel, MessageChannel, MessageHandler,
    MeteredChannel, PollableChannel, QueueChannel,
};
pub use config::{ConfigError, IntegrationConfig};
pub use ip::{DatagramReceivingAdapter, DatagramSender};
pub use management::ChannelMetrics;
pub use recovery::{ErrorRecoveryPublisher, RetryContext};
