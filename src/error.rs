//! Library and application errors

use std::{
    fmt::{self, Display, Formatter},
    io,
};

use miette::Diagnostic;
use strum::{Display as StrumDisplay, FromRepr};
use thiserror::Error;

use crate::connection::{command::CommandType, SessionState};

/// All possible errors returned by lpcflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    Status(#[from] StatusError),

    #[error("Block {block} still corrupt after {attempts} attempts, transfer aborted")]
    #[diagnostic(
        code(lpcflash::block_checksum),
        help("The serial link is unreliable, try a lower baud rate or a shorter cable")
    )]
    BlockChecksum { block: usize, attempts: u32 },

    #[error("Vector table checksum is {found:#010x}, should be {expected:#010x}")]
    #[diagnostic(
        code(lpcflash::vector_checksum),
        help("Remove the `--no-user-code` option to let lpcflash compute vector 7")
    )]
    VectorChecksum { expected: u32, found: u32 },

    #[error("The image activates code read protection ({0:#010x})")]
    #[diagnostic(
        code(lpcflash::crp_protected),
        help("Images which lock ISP or debug access are refused. Check the licence of the \
              software you are flashing and rebuild it without CRP enabled")
    )]
    CrpProtected(u32),

    #[error("Image of {size}B does not fit in {flash_size}B of flash")]
    #[diagnostic(code(lpcflash::image_too_big))]
    ImageTooBig { size: usize, flash_size: u32 },

    #[error("The supplied image is empty")]
    #[diagnostic(code(lpcflash::empty_image))]
    EmptyImage,

    #[error(
        "No usable write block size for a sector of {sector_size}B and a RAM buffer of {ram_buffer_size}B"
    )]
    #[diagnostic(
        code(lpcflash::invalid_write_size),
        help("Sectors and the RAM scratch buffer must both hold at least 64 bytes")
    )]
    InvalidWriteSize {
        sector_size: u32,
        ram_buffer_size: u32,
    },

    #[error("RAM buffer {start:#010x}..{end:#010x} lies outside of RAM {ram_start:#010x}..{ram_end:#010x}")]
    #[diagnostic(
        code(lpcflash::ram_buffer_out_of_range),
        help("Fix the RAM buffer offset and size of the part description")
    )]
    RamBufferOutOfRange {
        start: u64,
        end: u64,
        ram_start: u64,
        ram_end: u64,
    },

    #[error("{name} {value:#010x} must be a multiple of {alignment}")]
    #[diagnostic(code(lpcflash::misaligned))]
    Misaligned {
        name: &'static str,
        value: u32,
        alignment: u32,
    },

    #[error("Copy length {0} is not supported")]
    #[diagnostic(
        code(lpcflash::invalid_copy_length),
        help("The number of bytes copied to flash must be one of 256, 512, 1024 or 4096")
    )]
    InvalidCopyLength(u32),

    #[error("Jump address {0:#010x} lies inside the vector table")]
    #[diagnostic(
        code(lpcflash::invalid_jump_address),
        help("The go command requires an address of 0x00000200 or greater")
    )]
    InvalidJumpAddress(u32),

    #[error("Invalid sector range {first}..={last}")]
    #[diagnostic(
        code(lpcflash::invalid_sector_range),
        help("The last sector must be greater than or equal to the first sector")
    )]
    InvalidSectorRange { first: u32, last: u32 },

    #[error("Execution mode '{0}' is invalid")]
    #[diagnostic(
        code(lpcflash::invalid_mode),
        help("The accepted values are: thumb, arm")
    )]
    InvalidExecutionMode(String),

    #[error("Part ID {0:#010x} is not described")]
    #[diagnostic(
        code(lpcflash::unknown_part),
        help("Add the part to the parts description file, or pass one with `--parts`")
    )]
    UnknownPart(u64),

    #[error("Malformed parts description at line {line}: {reason}")]
    #[diagnostic(code(lpcflash::parts_file))]
    PartsFile { line: usize, reason: String },

    #[error("Part description of {name} is invalid: {reason}")]
    #[diagnostic(code(lpcflash::invalid_part))]
    InvalidPart { name: String, reason: String },

    #[error("Malformed UU-encoded data at offset {0}")]
    #[diagnostic(code(lpcflash::uu_decode))]
    UuDecode(usize),

    #[error("Verification of flash content failed at offset {0:#x}")]
    #[diagnostic(code(lpcflash::verify_failed))]
    VerifyFailed(usize),

    #[error("Read {received} bytes of memory instead of {expected}")]
    #[diagnostic(code(lpcflash::short_read))]
    ShortRead { expected: usize, received: usize },

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(lpcflash::no_serial),
        help("Make sure the device is connected, or pass the port explicitly")
    )]
    NoSerial,

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(lpcflash::serial_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("Several serial ports were detected: {0}")]
    #[diagnostic(
        code(lpcflash::multiple_serial),
        help("Select one with `--port` or in the configuration file")
    )]
    MultipleSerial(String),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(lpcflash::file_open))]
    FileOpenError(String, #[source] io::Error),

    #[error("Failed to write memory contents")]
    #[diagnostic(code(lpcflash::output))]
    OutputError(#[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to synchronize with the device")]
    #[diagnostic(
        code(lpcflash::connection_failed),
        help("Hold the ISP pin low while resetting the target, then try again")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(lpcflash::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Unexpected reply while in the {0} handshake state")]
    #[diagnostic(
        code(lpcflash::handshake),
        help("The device may already be synchronized, or the baud rate does not match")
    )]
    Handshake(SessionState),

    #[error("Malformed reply received: {0:?}")]
    #[diagnostic(code(lpcflash::malformed_reply))]
    MalformedReply(String),

    #[error("Wrote {written} of {expected} bytes to the serial port")]
    #[diagnostic(code(lpcflash::short_write))]
    ShortWrite { expected: usize, written: usize },

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(lpcflash::timeout))]
    Timeout(TimedOutCommand),

    #[error("End of stream reached on the serial port")]
    #[diagnostic(code(lpcflash::end_of_stream))]
    EndOfStream,

    #[cfg(feature = "serialport")]
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(lpcflash::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(lpcflash::io_error))]
    Io(#[source] io::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
            io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
            io::ErrorKind::UnexpectedEof => ConnectionError::EndOfStream,
            _ => ConnectionError::Io(err),
        }
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(io::ErrorKind::TimedOut) => {
                ConnectionError::Timeout(TimedOutCommand::default())
            }
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Status codes reported by the ISP bootloader, indexed by their wire value
#[derive(Clone, Copy, Debug, PartialEq, Eq, StrumDisplay, FromRepr)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    CmdSuccess = 0,
    InvalidCommand = 1,
    SrcAddrError = 2,
    DstAddrError = 3,
    SrcAddrNotMapped = 4,
    DstAddrNotMapped = 5,
    CountError = 6,
    InvalidSector = 7,
    SectorNotBlank = 8,
    SectorNotPreparedForWriteOperation = 9,
    CompareError = 10,
    Busy = 11,
    ParamError = 12,
    AddrError = 13,
    AddrNotMapped = 14,
    CmdLocked = 15,
    InvalidCode = 16,
    InvalidBaudRate = 17,
    InvalidStopBit = 18,
    CodeReadProtectionEnabled = 19,
}

/// A status value as received from the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Known(StatusCode),
    Unknown(u32),
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Known(StatusCode::CmdSuccess))
    }

    /// The raw numeric value sent by the device
    pub fn code(&self) -> u32 {
        match self {
            Status::Known(code) => *code as u32,
            Status::Unknown(code) => *code,
        }
    }
}

impl From<u32> for Status {
    fn from(raw: u32) -> Self {
        u8::try_from(raw)
            .ok()
            .and_then(StatusCode::from_repr)
            .map_or(Status::Unknown(raw), Status::Known)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Status::Known(code) => write!(f, "{} ({})", *code as u8, code),
            Status::Unknown(code) => write!(f, "{} (unknown status code)", code),
        }
    }
}

/// A non-success status returned for a command
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("The {command} command failed with status {status}")]
#[diagnostic(code(lpcflash::status))]
#[non_exhaustive]
pub struct StatusError {
    pub command: CommandType,
    pub status: Status,
}

impl StatusError {
    pub fn new(command: CommandType, status: Status) -> StatusError {
        StatusError { command, status }
    }
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
