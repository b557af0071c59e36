//! UDP adapters.
//!
//! - [`DatagramReceivingAdapter`]: binds a unicast or multicast socket and
//!   dispatches every datagram as an envelope on a bounded set of tasks
//! - [`DatagramSender`]: sends envelope payloads to a fixed, header-derived
//!   or reply-to-source address
//! - [`DatagramMapper`]: datagram/envelope conversion with optional length
//!   prefix

pub mod dispatch;
pub mod error;
pub mod inbound;
pub mod mapper;
pub mod outbound;
pub mod socket;

pub use dispatch::{Dispatcher, InFlightGuard, InFlightTracker};
pub use error::{AdapterError, DispatchError, MappingError, SendError};
pub use inbound::{AdapterState, DatagramReceivingAdapter};
pub use mapper::DatagramMapper;
pub use outbound::DatagramSender;
pub use socket::DatagramSocket;
