//! Configuration for the aggregator, datagram adapters, metrics and recovery.
//!
//! Every struct has a `Default` and deserializes with missing fields taking
//! their default, so a JSON file only needs to name what it overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_core::{headers, MemberContainer, ReleaseStrategy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub aggregator: AggregatorConfig,
    pub receiver: ReceiverConfig,
    pub sender: SenderConfig,
    pub metrics: MetricsConfig,
    pub recovery: RecoveryConfig,
}

impl IntegrationConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Invalid`] when validation fails.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`IntegrationConfig::from_json_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Rejects values that would stall or disable a subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.aggregator.validate()?;
        self.receiver.validate()
    }
}

/// How the aggregator decides that a group is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReleaseConfig {
    /// Group size comes from the `sequenceSize` header.
    #[default]
    SequenceSize,
    FixedSize { size: usize },
    #[serde(rename_all = "camelCase")]
    Timeout { after_ms: u64, threshold: usize },
}

impl ReleaseConfig {
    #[must_use]
    pub fn to_strategy(&self) -> ReleaseStrategy {
        match self {
            Self::SequenceSize => ReleaseStrategy::SequenceSize,
            Self::FixedSize { size } => ReleaseStrategy::FixedSize(*size),
            Self::Timeout {
                after_ms,
                threshold,
            } => ReleaseStrategy::Timeout {
                after_ms: *after_ms,
                threshold: *threshold,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Header holding the correlation key.
    pub correlation_header: String,
    pub release: ReleaseConfig,
    pub container: MemberContainer,
    /// Incomplete groups older than this are evicted by the sweep.
    pub group_timeout_ms: u64,
    /// Interval between timeout sweeps.
    pub sweep_interval_ms: u64,
    /// Timeout for sends to the output, discard and error channels. `None`
    /// waits indefinitely.
    pub send_timeout_ms: Option<u64>,
    /// Released keys remembered for late-arrival detection. 0 disables it.
    pub tracked_key_capacity: usize,
    /// Emit timed-out partial groups to the output channel instead of
    /// discarding them.
    pub send_partial_result_on_timeout: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            correlation_header: headers::CORRELATION_ID.to_string(),
            release: ReleaseConfig::default(),
            container: MemberContainer::List,
            group_timeout_ms: 60_000,
            sweep_interval_ms: 1_000,
            send_timeout_ms: Some(1_000),
            tracked_key_capacity: crate::aggregator::DEFAULT_TRACKED_KEY_CAPACITY,
            send_partial_result_on_timeout: false,
        }
    }
}

impl AggregatorConfig {
    #[must_use]
    pub fn group_timeout(&self) -> Duration {
        Duration::from_millis(self.group_timeout_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.group_timeout_ms == 0 {
            return Err(invalid("aggregator.group_timeout_ms must be > 0"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(invalid("aggregator.sweep_interval_ms must be > 0"));
        }
        match self.release {
            ReleaseConfig::FixedSize { size: 0 } => {
                Err(invalid("aggregator.release.size must be > 0"))
            }
            ReleaseConfig::Timeout { after_ms: 0, .. } => {
                Err(invalid("aggregator.release.afterMs must be > 0"))
            }
            ReleaseConfig::Timeout { threshold: 0, .. } => {
                Err(invalid("aggregator.release.threshold must be > 0"))
            }
            _ => Ok(()),
        }
    }
}

/// Multicast group membership for a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    /// Interface to join on. `None` lets the OS choose.
    #[serde(default)]
    pub interface: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Bind to a specific local address instead of all interfaces.
    pub local_address: Option<IpAddr>,
    /// Largest datagram accepted; longer datagrams are truncated.
    pub receive_buffer_size: usize,
    /// `SO_RCVBUF` for the socket. `None` keeps the OS default.
    pub so_receive_buffer_size: Option<usize>,
    /// Maximum concurrent dispatches.
    pub pool_size: usize,
    /// How long `stop` waits for in-flight dispatches.
    pub shutdown_grace_ms: u64,
    /// Expect a 4-byte big-endian length prefix on every datagram.
    pub check_length: bool,
    /// Timeout for sends to the output channel. `None` waits indefinitely.
    pub send_timeout_ms: Option<u64>,
    pub multicast: Option<MulticastConfig>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: 0,
            local_address: None,
            receive_buffer_size: 2048,
            so_receive_buffer_size: None,
            pool_size: 5,
            shutdown_grace_ms: 5_000,
            check_length: false,
            send_timeout_ms: None,
            multicast: None,
        }
    }
}

impl ReceiverConfig {
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(invalid("receiver.pool_size must be > 0"));
        }
        if self.receive_buffer_size == 0 {
            return Err(invalid("receiver.receive_buffer_size must be > 0"));
        }
        Ok(())
    }
}

/// Where an outbound datagram is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Destination {
    /// Always the same address.
    Fixed { address: SocketAddr },
    /// `host:port` read from the named header.
    Header { name: String },
    /// Back to the sender of the inbound datagram the envelope came from.
    #[default]
    ReplyToSource,
}

/// Outgoing multicast options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastSendConfig {
    /// Interface to send from. `None` lets the OS choose.
    pub interface: Option<Ipv4Addr>,
    pub time_to_live: u32,
    pub loopback: bool,
}

impl Default for MulticastSendConfig {
    fn default() -> Self {
        Self {
            interface: None,
            time_to_live: 1,
            loopback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub destination: Destination,
    /// Local address the sender binds to on first use.
    pub local_address: SocketAddr,
    /// Prefix every datagram with its 4-byte big-endian length.
    pub check_length: bool,
    pub multicast: Option<MulticastSendConfig>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            destination: Destination::default(),
            local_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            check_length: false,
            multicast: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Track durations and rates in addition to counts.
    pub full_stats_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Channel name for error envelopes. `None` uses `errorChannel`.
    pub error_channel: Option<String>,
    pub send_timeout_ms: Option<u64>,
}

impl RecoveryConfig {
    #[must_use]
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
