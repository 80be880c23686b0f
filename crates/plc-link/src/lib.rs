//! Fieldbus side of the monitor.
//!
//! [`PlcLink`] owns one connection to one controller on a dedicated thread.
//! Every request from every alarm coordinator sharing the controller goes
//! through that thread in FIFO order, so writes never interleave on the wire.
//! The wire format itself sits behind [`PlcConnector`]/[`PlcTransport`];
//! [`S7Connector`] speaks S7comm over ISO-on-TCP.

mod address;
mod error;
mod link;
pub mod s7;
mod transport;

pub use address::BitAddress;
pub use error::PlcError;
pub use link::{LinkOptions, PlcLink};
pub use s7::S7Connector;
pub use transport::{PlcConnector, PlcTransport};
