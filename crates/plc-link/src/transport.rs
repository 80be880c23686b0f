use link_core::AbortHandle;

use crate::{address::BitAddress, error::PlcError};

/// An open connection to one controller.
pub trait PlcTransport: Send {
    fn read_bit(&mut self, address: BitAddress) -> Result<bool, PlcError>;

    fn read_byte(&mut self, db: u16, byte: u32) -> Result<u8, PlcError>;

    /// Write a single bit without touching its neighbours.
    fn write_bit(&mut self, address: BitAddress, value: bool) -> Result<(), PlcError>;

    /// Hook that makes an in-flight request fail promptly.
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }

    fn close(&mut self) {}
}

/// Opens fresh connections to one controller.
pub trait PlcConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn PlcTransport>, PlcError>;

    fn describe(&self) -> String;
}
