//! Host side of the laser controller link.
//!
//! Lines are sent one at a time over a slow, unreliable serial-over-bluetooth link, and
//! each must be acknowledged by the device before the next goes out. [`Link`] is the
//! entry point: it owns the connection and the send queue, and hands out [`Response`]s
//! (or runs [`Callbacks`]) as acknowledgments arrive.

pub mod batch;
pub mod connection;
pub mod error;
pub mod link;
pub mod request;
pub mod sequencer;
pub mod simulator;
pub mod state;
pub mod transport;

pub use batch::Batch;
pub use error::SendError;
pub use link::{Link, LinkConfig};
pub use request::{Callbacks, Response};
pub use state::{ConnectionState, Delegate, LinkEvent};
pub use transport::{Transport, TransportEvent};
