//! Descriptions of the supported target devices
//!
//! A [PartDescriptor] holds the memory geometry of one part. Parts are looked
//! up by the identifier the bootloader reports, either in the built-in table
//! or in a parts description file.

use std::{
    borrow::Cow,
    fs,
    ops::Range,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{error::Error, transfer::Encoding};

pub use self::parser::parse_parts;

mod database;
mod parser;

/// Parts description files looked for when none is given explicitly
pub const DEFAULT_PARTS_FILES: &[&str] = &["./lpctools_parts.def", "/etc/lpctools_parts.def"];

/// Memory geometry and identity of a target device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartDescriptor {
    pub part_id: u64,
    pub name: Cow<'static, str>,
    pub flash_base: u32,
    pub flash_size: u32,
    pub flash_sectors: u32,
    pub reset_vector_offset: u32,
    pub ram_base: u32,
    pub ram_size: u32,
    /// Offset within RAM of the buffer used to stage data for flashing
    pub ram_buffer_offset: u32,
    pub ram_buffer_size: u32,
    /// Whether memory transfers use UU-encoding rather than raw bytes
    pub uuencode: bool,
}

impl PartDescriptor {
    pub fn sector_size(&self) -> u32 {
        self.flash_size / self.flash_sectors.max(1)
    }

    /// Sector holding the flash byte at `offset` from the flash base
    pub fn sector_of(&self, offset: u32) -> u32 {
        offset / self.sector_size().max(1)
    }

    /// Absolute address of the RAM staging buffer
    pub fn ram_buffer_address(&self) -> u32 {
        self.ram_base.wrapping_add(self.ram_buffer_offset)
    }

    pub fn encoding(&self) -> Encoding {
        Encoding::from(self.uuencode)
    }

    /// Address of the reset vector in flash
    pub fn reset_vector_address(&self) -> u32 {
        self.flash_base.wrapping_add(self.reset_vector_offset)
    }

    fn ram_range(&self) -> Range<u64> {
        let start = u64::from(self.ram_base);
        start..start + u64::from(self.ram_size)
    }

    fn ram_buffer_range(&self) -> Range<u64> {
        let start = u64::from(self.ram_base) + u64::from(self.ram_buffer_offset);
        start..start + u64::from(self.ram_buffer_size)
    }

    /// Check that the flash fits the address space and divides into equally
    /// sized sectors
    pub fn check_geometry(&self) -> Result<(), Error> {
        let invalid = |reason: String| Error::InvalidPart {
            name: self.name.to_string(),
            reason,
        };

        if self.flash_base.checked_add(self.flash_size).is_none() {
            return Err(invalid(format!(
                "{:#x} bytes of flash at {:#010x} run past the end of the address space",
                self.flash_size, self.flash_base
            )));
        }
        if self.flash_sectors == 0 || self.flash_size % self.flash_sectors != 0 {
            return Err(invalid(format!(
                "{:#x} bytes of flash do not divide into {} sectors",
                self.flash_size, self.flash_sectors
            )));
        }

        Ok(())
    }

    /// Check that the RAM staging buffer lies entirely within RAM
    pub fn check_ram_buffer(&self) -> Result<(), Error> {
        let ram = self.ram_range();
        let buffer = self.ram_buffer_range();

        if buffer.start < ram.start || buffer.end > ram.end {
            return Err(Error::RamBufferOutOfRange {
                start: buffer.start,
                end: buffer.end,
                ram_start: ram.start,
                ram_end: ram.end,
            });
        }

        Ok(())
    }
}

/// Where part descriptions are looked up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartSource {
    Builtin,
    File(PathBuf),
}

impl PartSource {
    /// The first default parts file which exists, or the built-in table
    pub fn locate() -> PartSource {
        DEFAULT_PARTS_FILES
            .iter()
            .map(Path::new)
            .find(|path| path.is_file())
            .map_or(PartSource::Builtin, |path| {
                PartSource::File(path.to_path_buf())
            })
    }

    /// Find the description of the part reporting `part_id`
    pub fn find(&self, part_id: u64) -> Result<PartDescriptor, Error> {
        let part = match self {
            PartSource::Builtin => database::PARTS
                .iter()
                .find(|part| part.part_id == part_id)
                .cloned(),
            PartSource::File(path) => {
                let text = read_parts_file(path)?;
                let mut found = None;

                for part in parse_parts(&text) {
                    let part = part?;
                    if part.part_id == part_id {
                        found = Some(part);
                        break;
                    }
                }

                found
            }
        };

        match part {
            Some(part) => {
                debug!("Part ID {part_id:#010x} is {} ({self})", part.name);
                part.check_geometry()?;
                Ok(part)
            }
            None => Err(Error::UnknownPart(part_id)),
        }
    }

    /// All parts described by this source
    pub fn parts(&self) -> Result<Vec<PartDescriptor>, Error> {
        match self {
            PartSource::Builtin => Ok(database::PARTS.to_vec()),
            PartSource::File(path) => parse_parts(&read_parts_file(path)?).collect(),
        }
    }
}

impl std::fmt::Display for PartSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartSource::Builtin => write!(f, "built-in parts table"),
            PartSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

fn read_parts_file(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))
}
