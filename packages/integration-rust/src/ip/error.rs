use std::io;
use std::net::SocketAddr;

use weft_core::PayloadError;

use crate::channel::ChannelError;

/// Failure converting between datagrams and envelopes.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("datagram of {len} bytes is too short for a length prefix")]
    TooShort { len: usize },
    #[error("length prefix declares {declared} bytes but {actual} followed")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("payload of {len} bytes does not fit a length prefix")]
    TooLong { len: usize },
    #[error("envelope payload cannot be sent as a datagram")]
    Payload(#[from] PayloadError),
}

/// Failure dispatching one received datagram.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to map datagram from {source_addr}")]
    Mapping {
        source_addr: SocketAddr,
        #[source]
        source: MappingError,
    },
    #[error("output channel '{channel}' did not accept the envelope")]
    NotAccepted { channel: String },
    #[error("failed to send envelope to the output channel")]
    Delivery(#[from] ChannelError),
    #[error("dispatch pool is shut down")]
    PoolShutdown,
    #[error("dispatch pool is saturated ({pool_size} in flight)")]
    Saturated { pool_size: usize },
}

/// Lifecycle failure of a receiving adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("adapter is already running")]
    AlreadyRunning,
    #[error("socket error")]
    Io(#[from] io::Error),
    #[error("socket closed while the adapter was listening")]
    UnexpectedClose,
    #[error("receive loop ended abnormally")]
    ReceiveLoop(#[source] tokio::task::JoinError),
}

/// Failure sending an outbound datagram.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("envelope has no destination (missing header '{header}')")]
    NoDestination { header: String },
    #[error("invalid destination address '{value}'")]
    InvalidAddress { value: String },
    #[error("failed to bind sender socket")]
    Bind(#[source] io::Error),
    #[error("failed to send datagram to {destination}")]
    Io {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },
}
