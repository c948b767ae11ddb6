//! Commands understood by the ISP bootloader

use std::{io::Write, time::Duration};

use strum::{Display, EnumString};

/// Code which must accompany the unlock command
pub const UNLOCK_CODE: u32 = 23130;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
const ERASE_TIMEOUT: Duration = Duration::from_secs(2);
const COPY_TIMEOUT: Duration = Duration::from_secs(1);

/// Types of commands that can be sent to the bootloader
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
#[non_exhaustive]
pub enum CommandType {
    Unlock,
    SetEcho,
    WriteToRam,
    ReadMemory,
    PrepareForWrite,
    CopyRamToFlash,
    Go,
    Erase,
    BlankCheck,
    ReadPartId,
    ReadBootVersion,
    Compare,
    ReadUid,
}

impl CommandType {
    /// Single letter identifying the command on the wire
    pub fn letter(&self) -> char {
        match self {
            CommandType::Unlock => 'U',
            CommandType::SetEcho => 'A',
            CommandType::WriteToRam => 'W',
            CommandType::ReadMemory => 'R',
            CommandType::PrepareForWrite => 'P',
            CommandType::CopyRamToFlash => 'C',
            CommandType::Go => 'G',
            CommandType::Erase => 'E',
            CommandType::BlankCheck => 'I',
            CommandType::ReadPartId => 'J',
            CommandType::ReadBootVersion => 'K',
            CommandType::Compare => 'M',
            CommandType::ReadUid => 'N',
        }
    }

    /// Number of decimal lines following a successful status
    pub fn reply_lines(&self) -> usize {
        match self {
            CommandType::ReadPartId => 1,
            CommandType::ReadBootVersion => 2,
            CommandType::ReadUid => 4,
            _ => 0,
        }
    }

    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Erase => ERASE_TIMEOUT,
            CommandType::CopyRamToFlash => COPY_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

/// Instruction set the target starts executing in after a go command
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ExecutionMode {
    #[default]
    Thumb,
    Arm,
}

impl ExecutionMode {
    /// Mode implied by an entry address, and the address with the mode bit removed
    pub fn from_entry(address: u32) -> (ExecutionMode, u32) {
        if address & 1 == 1 {
            (ExecutionMode::Thumb, address & !1)
        } else {
            (ExecutionMode::Arm, address)
        }
    }

    fn letter(&self) -> char {
        match self {
            ExecutionMode::Thumb => 'T',
            ExecutionMode::Arm => 'A',
        }
    }
}

/// A command sent to the bootloader
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Command {
    Unlock,
    SetEcho {
        enabled: bool,
    },
    WriteToRam {
        address: u32,
        size: u32,
    },
    ReadMemory {
        address: u32,
        size: u32,
    },
    PrepareForWrite {
        first: u32,
        last: u32,
    },
    CopyRamToFlash {
        flash_address: u32,
        ram_address: u32,
        size: u32,
    },
    Go {
        address: u32,
        mode: ExecutionMode,
    },
    Erase {
        first: u32,
        last: u32,
    },
    BlankCheck {
        first: u32,
        last: u32,
    },
    ReadPartId,
    ReadBootVersion,
    Compare {
        address1: u32,
        address2: u32,
        size: u32,
    },
    ReadUid,
}

impl Command {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Unlock => CommandType::Unlock,
            Command::SetEcho { .. } => CommandType::SetEcho,
            Command::WriteToRam { .. } => CommandType::WriteToRam,
            Command::ReadMemory { .. } => CommandType::ReadMemory,
            Command::PrepareForWrite { .. } => CommandType::PrepareForWrite,
            Command::CopyRamToFlash { .. } => CommandType::CopyRamToFlash,
            Command::Go { .. } => CommandType::Go,
            Command::Erase { .. } => CommandType::Erase,
            Command::BlankCheck { .. } => CommandType::BlankCheck,
            Command::ReadPartId => CommandType::ReadPartId,
            Command::ReadBootVersion => CommandType::ReadBootVersion,
            Command::Compare { .. } => CommandType::Compare,
            Command::ReadUid => CommandType::ReadUid,
        }
    }

    /// Write the command line, terminator included
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        let letter = self.command_type().letter();

        match *self {
            Command::Unlock => write!(writer, "{letter} {UNLOCK_CODE}")?,
            Command::SetEcho { enabled } => write!(writer, "{letter} {}", u8::from(enabled))?,
            Command::WriteToRam { address, size } | Command::ReadMemory { address, size } => {
                write!(writer, "{letter} {address} {size}")?
            }
            Command::PrepareForWrite { first, last }
            | Command::Erase { first, last }
            | Command::BlankCheck { first, last } => write!(writer, "{letter} {first} {last}")?,
            Command::CopyRamToFlash {
                flash_address,
                ram_address,
                size,
            } => write!(writer, "{letter} {flash_address} {ram_address} {size}")?,
            Command::Compare {
                address1,
                address2,
                size,
            } => write!(writer, "{letter} {address1} {address2} {size}")?,
            Command::Go { address, mode } => write!(writer, "{letter} {address} {}", mode.letter())?,
            Command::ReadPartId | Command::ReadBootVersion | Command::ReadUid => {
                write!(writer, "{letter}")?
            }
        }
        writer.write_all(b"\r\n")?;

        Ok(())
    }

    /// The command line as sent on the wire
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = Vec::with_capacity(32);
        // writing into a Vec cannot fail
        let _ = self.write(&mut line);
        line
    }
}
