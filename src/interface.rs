//! Byte transports carrying the ISP protocol
//!
//! The protocol layers only ever talk to a [Transport]. With the `serialport`
//! feature enabled, [SerialInterface] provides one backed by a real serial
//! port; tests provide their own in-memory implementations.

use std::time::Duration;
#[cfg(feature = "serialport")]
use std::{
    io::{self, Read, Write},
    time::Instant,
};

#[cfg(feature = "serialport")]
use log::debug;
#[cfg(feature = "serialport")]
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::error::Error;

/// Default baud rate of the ISP bootloader
pub const DEFAULT_BAUD: u32 = 115_200;

#[cfg(feature = "serialport")]
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An ordered, timeout-bounded byte channel to the target device
pub trait Transport {
    /// Write `data`, returning how many bytes were actually written
    fn write(&mut self, data: &[u8]) -> Result<usize, Error>;

    /// Read into `buf` until at least `min_read` bytes have arrived
    ///
    /// Returns fewer than `min_read` bytes only when `timeout` elapsed first.
    fn read(&mut self, buf: &mut [u8], min_read: usize, timeout: Duration) -> Result<usize, Error>;

    /// Discard any received bytes which have not been read yet
    fn clear_input(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8], min_read: usize, timeout: Duration) -> Result<usize, Error> {
        (**self).read(buf, min_read, timeout)
    }

    fn clear_input(&mut self) -> Result<(), Error> {
        (**self).clear_input()
    }
}

/// Wrapper around a serial port configured for the ISP bootloader
#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
pub struct SerialInterface {
    serial_port: Box<dyn SerialPort>,
}

#[cfg(feature = "serialport")]
impl SerialInterface {
    /// Open `port` as 8N1 with XON/XOFF flow control
    pub fn open(port: &str, baud: u32) -> Result<Self, Error> {
        debug!("Opening serial port {port} at {baud} baud");

        let serial_port = serialport::new(port, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Software)
            .timeout(POLL_INTERVAL)
            .open()?;

        Ok(Self::new(serial_port))
    }

    pub fn new(serial_port: Box<dyn SerialPort>) -> Self {
        Self { serial_port }
    }
}

#[cfg(feature = "serialport")]
impl Transport for SerialInterface {
    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let mut written = 0;

        while written < data.len() {
            match self.serial_port.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.serial_port.flush()?;

        Ok(written)
    }

    fn read(&mut self, buf: &mut [u8], min_read: usize, timeout: Duration) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        let mut received = 0;

        while received < min_read {
            match self.serial_port.read(&mut buf[received..]) {
                Ok(n) => received += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        Ok(received)
    }

    fn clear_input(&mut self) -> Result<(), Error> {
        self.serial_port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
