//! Correlation and release of message groups.
//!
//! [`BarrierStore`] owns the key → barrier map and decides release and
//! expiry synchronously. [`CorrelatingHandler`] wraps it with channel
//! routing, and [`BarrierSweeper`] drives the timeout sweep in the
//! background.

pub mod handler;
pub mod store;
pub mod sweeper;

pub use handler::{AggregatorError, CorrelatingHandler, Disposition, SweepReport};
pub use store::{
    Arrival, BarrierStore, ExpiredGroup, ReleasedGroup, Swept, DEFAULT_TRACKED_KEY_CAPACITY,
};
pub use sweeper::{BarrierSweeper, SweepTask};
