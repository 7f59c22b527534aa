//! Serial Transportation.
use std::{
    io::{ErrorKind, Read, Write},
    time::{Duration, Instant},
};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::Transport;
use crate::constants::{BAUD_RATE, SERIAL_POLL_MS};
use crate::error::{Error, Result};

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, BAUD_RATE);
        let serial_port = serialport::new(port, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(SERIAL_POLL_MS))
            .open()
            .map_err(|e| Error::Connection(format!("unable to open {}: {}", port, e)))?;
        Ok(SerialTransport { serial_port })
    }

    pub fn open_nth(nth: usize) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name),
            None => Err(Error::Connection("No serial ports found!".into())),
        }
    }

    pub fn open_any() -> Result<Self> {
        Self::open_nth(0)
    }
}

impl Transport for SerialTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        // port timeout stays at one poll interval, see SERIAL_POLL_MS
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.serial_port.read(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.serial_port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.serial_port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}
