//! Establish a session with the ISP bootloader of a target device
//!
//! The [Connection] struct owns the transport, runs the synchronization
//! handshake and the exchange of textual commands and status replies, and
//! provides the individual bootloader operations on top of it.

use std::{thread::sleep, time::Duration};

use log::{debug, info, warn};
use strum::Display;

use self::command::{Command, CommandType, ExecutionMode};
use crate::{
    error::{ConnectionError, Error, ResultExt, Status, StatusCode, StatusError},
    hexdump::hexdump,
    interface::Transport,
};

pub mod command;

/// Default crystal frequency reported to the bootloader, in kHz
pub const DEFAULT_CRYSTAL_FREQUENCY: u32 = 10_000;
/// Lowest address the go command may jump to
pub const MIN_JUMP_ADDRESS: u32 = 0x200;

const SYNC_REQUEST: &[u8] = b"?";
const SYNC_REPLY: &[u8] = b"Synchronized\r\n";
const OK_REPLY: &str = "OK";
const COMMAND_SETTLE: Duration = Duration::from_millis(5);
const MAX_LINE_LENGTH: usize = 64;

/// Session configuration, fixed for the lifetime of a [Connection]
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    /// Log every status code and every byte crossing the transport
    pub trace: bool,
    /// How long to wait for a reply before giving up
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            trace: false,
            timeout: Duration::from_millis(500),
        }
    }
}

/// Progress of the synchronization handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SessionState {
    Unsynced,
    SyncSent,
    SyncAcked,
    CrystalAcked,
    EchoOff,
    Ready,
    SyncFailed,
}

/// Result of a blank check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlankCheck {
    Blank,
    /// First word found not blank, and its content
    NotBlank { offset: u32, content: u32 },
}

/// Version of the bootloader code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootVersion {
    pub major: u32,
    pub minor: u32,
}

impl std::fmt::Display for BootVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// An established session with the ISP bootloader
pub struct Connection {
    transport: Box<dyn Transport>,
    config: ConnectionConfig,
    state: SessionState,
    timeout: Duration,
    crystal_frequency: Option<u32>,
    pushback: Option<u8>,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, config: ConnectionConfig) -> Self {
        Connection {
            transport,
            config,
            state: SessionState::Unsynced,
            timeout: config.timeout,
            crystal_frequency: None,
            pushback: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Crystal frequency acknowledged during the handshake, in kHz
    pub fn crystal_frequency(&self) -> Option<u32> {
        self.crystal_frequency
    }

    /// Run the synchronization handshake and disable command echo
    ///
    /// In `quiet` mode a failure is only logged at debug level, which suits
    /// probing a device that may already be synchronized.
    pub fn synchronize(&mut self, crystal_frequency: u32, quiet: bool) -> Result<(), Error> {
        self.state = SessionState::Unsynced;
        self.pushback = None;

        match self.handshake(crystal_frequency) {
            Ok(()) => {
                debug!("Synchronized at {crystal_frequency} kHz");
                Ok(())
            }
            Err(err) => {
                let stage = self.state;
                self.state = SessionState::SyncFailed;

                if quiet {
                    debug!("Synchronization failed in state {stage}: {err}");
                } else {
                    warn!("Synchronization failed in state {stage}");
                }

                Err(err)
            }
        }
    }

    /// Treat the device as synchronized by an earlier session
    pub fn assume_synchronized(&mut self) {
        self.state = SessionState::Ready;
    }

    fn handshake(&mut self, crystal_frequency: u32) -> Result<(), Error> {
        self.write_bytes(SYNC_REQUEST)?;
        self.state = SessionState::SyncSent;

        let reply = self.read_exact(SYNC_REPLY.len())?;
        if reply != SYNC_REPLY {
            return Err(self.handshake_error());
        }
        self.write_bytes(SYNC_REPLY)?;
        self.state = SessionState::SyncAcked;

        self.drain_line()?;
        self.expect_ok()?;

        self.write_bytes(format!("{crystal_frequency}\r\n").as_bytes())?;
        self.drain_line()?;
        self.expect_ok()?;
        self.state = SessionState::CrystalAcked;
        self.crystal_frequency = Some(crystal_frequency);

        // the echo of this command is the last one the device sends
        self.write_bytes(&Command::SetEcho { enabled: false }.to_line())?;
        self.drain_line()?;
        let status = self.read_status()?;
        debug!("Echo disabled with status {status}");
        self.state = SessionState::EchoOff;

        self.state = SessionState::Ready;
        Ok(())
    }

    fn handshake_error(&self) -> Error {
        Error::Connection(ConnectionError::Handshake(self.state))
    }

    fn expect_ok(&mut self) -> Result<(), Error> {
        let line = self.read_line()?;
        if line == OK_REPLY {
            Ok(())
        } else {
            debug!("Expected {OK_REPLY:?}, received {line:?}");
            Err(self.handshake_error())
        }
    }

    /// Run a closure with a different read timeout
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = std::mem::replace(&mut self.timeout, timeout);
        let result = f(self);
        self.timeout = old_timeout;

        result
    }

    /// Write all of `data` to the transport
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.config.trace {
            info!("Sending {} bytes\n{}", data.len(), hexdump(data, 0));
        }

        let written = self.transport.write(data)?;
        if written != data.len() {
            return Err(Error::Connection(ConnectionError::ShortWrite {
                expected: data.len(),
                written,
            }));
        }

        Ok(())
    }

    /// Read exactly `len` bytes, failing with a timeout otherwise
    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; len];
        let mut received = 0;

        if len > 0 {
            if let Some(byte) = self.pushback.take() {
                buf[0] = byte;
                received = 1;
            }
        }

        if received < len {
            received += self
                .transport
                .read(&mut buf[received..], len - received, self.timeout)?;
        }

        // single bytes are traced by the line readers
        if self.config.trace && len > 1 {
            info!("Received {received} bytes\n{}", hexdump(&buf[..received], 0));
        }

        if received < len {
            debug!("Read {received} of {len} bytes before timing out");
            return Err(Error::Connection(ConnectionError::Timeout(
                Default::default(),
            )));
        }

        Ok(buf)
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        Ok(self.read_exact(1)?[0])
    }

    /// Read a line, returning it without its terminator
    pub fn read_line(&mut self) -> Result<String, Error> {
        let mut line = Vec::new();

        loop {
            match self.read_byte()? {
                b'\n' => break,
                b'\r' => {
                    self.finish_line()?;
                    break;
                }
                byte if line.len() >= MAX_LINE_LENGTH => {
                    line.push(byte);
                    return Err(Error::Connection(ConnectionError::MalformedReply(
                        String::from_utf8_lossy(&line).into_owned(),
                    )));
                }
                byte => line.push(byte),
            }
        }

        let line = String::from_utf8_lossy(&line).into_owned();
        if self.config.trace {
            info!("Received line {line:?}");
        }

        Ok(line)
    }

    /// Discard everything up to and including the next line terminator
    pub fn drain_line(&mut self) -> Result<(), Error> {
        loop {
            match self.read_byte()? {
                b'\n' => return Ok(()),
                b'\r' => return self.finish_line(),
                _ => {}
            }
        }
    }

    // After a '\r' a '\n' may follow, anything else belongs to the next reply
    fn finish_line(&mut self) -> Result<(), Error> {
        let next = self.read_byte()?;
        if next != b'\n' {
            self.pushback = Some(next);
        }

        Ok(())
    }

    /// Read a line holding a single decimal number
    pub fn read_number(&mut self) -> Result<u32, Error> {
        let line = self.read_line()?;

        line.trim()
            .parse()
            .map_err(|_| Error::Connection(ConnectionError::MalformedReply(line)))
    }

    fn read_status(&mut self) -> Result<Status, Error> {
        let reply = self.read_exact(3)?;
        let digits = reply.iter().take_while(|b| b.is_ascii_digit()).count();

        let code = std::str::from_utf8(&reply[..digits])
            .ok()
            .and_then(|digits| digits.parse::<u32>().ok())
            .ok_or_else(|| {
                Error::Connection(ConnectionError::MalformedReply(
                    String::from_utf8_lossy(&reply).into_owned(),
                ))
            })?;

        match reply[2] {
            b'\n' => {}
            b'\r' => self.finish_line()?,
            _ => self.drain_line()?,
        }

        Ok(Status::from(code))
    }

    /// Send a command and return the status the device replied with
    pub fn command_status(&mut self, command: Command) -> Result<Status, Error> {
        let ty = command.command_type();
        debug!("Sending command: {:?}", command);

        let timeout = ty.timeout().max(self.config.timeout);
        let status = self
            .with_timeout(timeout, |connection| {
                connection.write_bytes(&command.to_line())?;
                sleep(COMMAND_SETTLE);
                connection.read_status()
            })
            .for_command(ty)?;

        if self.config.trace {
            info!("{ty} returned status {status}");
        }

        Ok(status)
    }

    /// Send a command, failing unless the device reports success
    pub fn command(&mut self, command: Command) -> Result<(), Error> {
        let ty = command.command_type();
        let status = self.command_status(command)?;

        if status.is_success() {
            Ok(())
        } else {
            if !self.config.trace {
                warn!("{ty} returned status {status}");
            }
            Err(StatusError::new(ty, status).into())
        }
    }

    fn command_with_reply(&mut self, command: Command) -> Result<Vec<u32>, Error> {
        let ty = command.command_type();
        self.command(command)?;

        (0..ty.reply_lines())
            .map(|_| self.read_number().for_command(ty))
            .collect()
    }

    /// Unlock flash write, erase and go commands
    pub fn unlock(&mut self) -> Result<(), Error> {
        self.command(Command::Unlock)
    }

    pub fn read_part_id(&mut self) -> Result<u32, Error> {
        let reply = self.command_with_reply(Command::ReadPartId)?;
        Ok(reply[0])
    }

    /// Read the 128-bit unique device serial number, least significant word first
    pub fn read_uid(&mut self) -> Result<[u32; 4], Error> {
        let reply = self.command_with_reply(Command::ReadUid)?;
        Ok([reply[0], reply[1], reply[2], reply[3]])
    }

    pub fn read_boot_version(&mut self) -> Result<BootVersion, Error> {
        let reply = self.command_with_reply(Command::ReadBootVersion)?;

        // the minor number is sent first
        Ok(BootVersion {
            major: reply[1],
            minor: reply[0],
        })
    }

    pub fn prepare_for_write(&mut self, first: u32, last: u32) -> Result<(), Error> {
        check_sector_range(first, last)?;
        self.command(Command::PrepareForWrite { first, last })
    }

    /// Erase sectors, which must have been prepared for write
    pub fn erase(&mut self, first: u32, last: u32) -> Result<(), Error> {
        check_sector_range(first, last)?;
        self.command(Command::Erase { first, last })
    }

    pub fn blank_check(&mut self, first: u32, last: u32) -> Result<BlankCheck, Error> {
        check_sector_range(first, last)?;

        let ty = CommandType::BlankCheck;
        match self.command_status(Command::BlankCheck { first, last })? {
            Status::Known(StatusCode::CmdSuccess) => Ok(BlankCheck::Blank),
            Status::Known(StatusCode::SectorNotBlank) => {
                let offset = self.read_number().for_command(ty)?;
                let content = self.read_number().for_command(ty)?;
                Ok(BlankCheck::NotBlank { offset, content })
            }
            status => Err(StatusError::new(ty, status).into()),
        }
    }

    /// Copy `size` bytes from RAM to flash, which must have been prepared for write
    pub fn copy_ram_to_flash(
        &mut self,
        flash_address: u32,
        ram_address: u32,
        size: u32,
    ) -> Result<(), Error> {
        check_alignment("RAM address", ram_address, 4)?;

        self.command(Command::CopyRamToFlash {
            flash_address,
            ram_address,
            size,
        })
    }

    /// Compare two memory regions, returning the offset of the first difference
    pub fn compare(
        &mut self,
        address1: u32,
        address2: u32,
        size: u32,
    ) -> Result<Option<u32>, Error> {
        check_alignment("First address", address1, 4)?;
        check_alignment("Second address", address2, 4)?;
        check_alignment("Byte count", size, 4)?;

        let ty = CommandType::Compare;
        match self.command_status(Command::Compare {
            address1,
            address2,
            size,
        })? {
            Status::Known(StatusCode::CmdSuccess) => Ok(None),
            Status::Known(StatusCode::CompareError) => {
                Ok(Some(self.read_number().for_command(ty)?))
            }
            status => Err(StatusError::new(ty, status).into()),
        }
    }

    /// Start executing code at `address`
    ///
    /// The vector table occupies the lowest addresses, so anything below
    /// [MIN_JUMP_ADDRESS] is refused without talking to the device.
    pub fn go(&mut self, address: u32, mode: ExecutionMode) -> Result<(), Error> {
        if address < MIN_JUMP_ADDRESS {
            return Err(Error::InvalidJumpAddress(address));
        }

        self.command(Command::Go { address, mode })
    }

    /// Discard pending input, both buffered here and in the transport
    pub fn clear_input(&mut self) -> Result<(), Error> {
        self.pushback = None;
        self.transport.clear_input()
    }

    /// Turn the connection back into its transport
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }
}

fn check_sector_range(first: u32, last: u32) -> Result<(), Error> {
    if last < first {
        return Err(Error::InvalidSectorRange { first, last });
    }

    Ok(())
}

pub(crate) fn check_alignment(name: &'static str, value: u32, alignment: u32) -> Result<(), Error> {
    if value % alignment != 0 {
        return Err(Error::Misaligned {
            name,
            value,
            alignment,
        });
    }

    Ok(())
}

/// Check arguments of a copy to flash against the bootloader's requirements
pub fn check_copy_arguments(flash_address: u32, ram_address: u32, size: u32) -> Result<(), Error> {
    check_alignment("Flash address", flash_address, 256)?;
    check_alignment("RAM address", ram_address, 4)?;

    match size {
        256 | 512 | 1024 | 4096 => Ok(()),
        _ => Err(Error::InvalidCopyLength(size)),
    }
}
