//! Abstract programmer transport interface.
use std::time::Duration;

use crate::error::{Error, Result};

pub use self::dummy::{DummyChip, DummyTransport};
pub use self::serial::SerialTransport;

mod dummy;
mod serial;

/// Abstraction of the byte link to the programmer.
/// A serial port, or the in-memory emulator.
pub trait Transport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;
    /// Read up to `len` bytes, returning whatever arrived before `timeout`.
    fn recv_raw(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>>;
    fn set_dtr(&mut self, level: bool) -> Result<()>;
    /// Discard everything received but not yet read.
    fn clear_input(&mut self) -> Result<()>;

    fn write(&mut self, raw: &[u8]) -> Result<()> {
        log::debug!("=> {}", hex::encode(raw));
        self.send_raw(raw)
    }

    fn read(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let resp = self.recv_raw(len, timeout)?;
        log::debug!("<= {}", hex::encode(&resp));
        Ok(resp)
    }

    /// Read exactly `len` bytes, or fail with a protocol error naming `operation`.
    fn read_exact(&mut self, operation: &'static str, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let resp = self.read(len, timeout)?;
        if resp.len() != len {
            return Err(Error::protocol(operation, format!("{} bytes", len), &resp));
        }
        Ok(resp)
    }

    /// Read one byte and check it is `ack`.
    fn expect(&mut self, operation: &'static str, ack: u8, timeout: Duration) -> Result<()> {
        let resp = self.read(1, timeout)?;
        if resp != [ack] {
            return Err(Error::protocol(operation, ack as char, &resp));
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        (**self).send_raw(raw)
    }

    fn recv_raw(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        (**self).recv_raw(len, timeout)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        (**self).set_dtr(level)
    }

    fn clear_input(&mut self) -> Result<()> {
        (**self).clear_input()
    }
}
