//! Program, erase and dump the flash of a target device
//!
//! The [Flasher] struct combines a synchronized [Connection] with the
//! [PartDescriptor] of the connected device, and provides the high level
//! operations built from individual bootloader commands.

use std::{fmt, io::Write};

use log::{debug, info, warn};
use strum::Display;

use crate::{
    connection::{
        check_alignment,
        command::ExecutionMode,
        BlankCheck,
        BootVersion,
        Connection,
        ConnectionConfig,
        MIN_JUMP_ADDRESS,
    },
    error::{ConnectionError, Error, ResultExt},
    image_format::{FirmwareImage, UserCode},
    interface::Transport,
    progress::ProgressCallbacks,
    targets::{PartDescriptor, PartSource},
    transfer::{read_memory, write_to_ram},
};

/// Sizes accepted by the copy to flash command, largest first
///
/// 64 bytes is only accepted by the smaller parts, which have no larger
/// staging buffer to offer.
pub const WRITE_SIZES: [u32; 5] = [4096, 1024, 512, 256, 64];

/// The bootloader maps its own vectors over the start of flash
const REMAPPED_BOOT_VECTORS: u32 = 0x200;

/// Largest write block fitting both a sector and the RAM staging buffer
///
/// Returns zero when even the smallest write size does not fit.
pub fn select_write_size(sector_size: u32, ram_buffer_size: u32) -> u32 {
    let limit = sector_size.min(ram_buffer_size);

    WRITE_SIZES
        .into_iter()
        .find(|&size| size <= limit)
        .unwrap_or(0)
}

// Shorter-lived borrow of the callbacks, so they can be handed to each stage
fn reborrow<'a>(
    progress: &'a mut Option<&mut dyn ProgressCallbacks>,
) -> Option<&'a mut dyn ProgressCallbacks> {
    match progress {
        Some(cb) => Some(&mut **cb),
        None => None,
    }
}

/// Stage of a flasher operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FlashStage {
    #[default]
    Idle,
    Validating,
    Erasing,
    Programming,
    Verifying,
    Done,
    Failed,
}

/// Information about the connected device
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub part_id: u32,
    pub part_name: String,
    pub uid: [u32; 4],
    pub boot_version: BootVersion,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Part:          {}", self.part_name)?;
        writeln!(f, "Part ID:       {:#010x}", self.part_id)?;
        writeln!(
            f,
            "UID:           {:08x} {:08x} {:08x} {:08x}",
            self.uid[0], self.uid[1], self.uid[2], self.uid[3]
        )?;
        write!(f, "Boot code:     {}", self.boot_version)
    }
}

/// Connect to the ISP bootloader and program the flash of a device
pub struct Flasher {
    connection: Connection,
    part: PartDescriptor,
    stage: FlashStage,
}

impl Flasher {
    /// Synchronize with a device and identify it
    ///
    /// A device left synchronized by an earlier session does not answer the
    /// handshake, and rejects the first command which follows it. One command
    /// is sacrificed in that case before the device is identified.
    pub fn connect(
        transport: Box<dyn Transport>,
        config: ConnectionConfig,
        crystal_frequency: u32,
        parts: &PartSource,
    ) -> Result<Self, Error> {
        let mut connection = Connection::new(transport, config);

        if connection.synchronize(crystal_frequency, true).is_err() {
            debug!("Handshake failed, probing for an already synchronized device");
            connection.clear_input()?;
            if let Err(err) = connection.read_part_id() {
                debug!("Probe failed: {err}");
            }
            connection.clear_input()?;
        }

        let part_id = connection.read_part_id().map_err(|err| match err {
            Error::Connection(ConnectionError::Timeout(_)) => {
                Error::Connection(ConnectionError::ConnectionFailed)
            }
            err => err,
        })?;
        connection.assume_synchronized();

        let part = parts.find(u64::from(part_id))?;
        info!("Connected to {} (part ID {part_id:#010x})", part.name);

        Ok(Self::new(connection, part))
    }

    pub fn new(connection: Connection, part: PartDescriptor) -> Self {
        Flasher {
            connection,
            part,
            stage: FlashStage::Idle,
        }
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn into_connection(self) -> Connection {
        self.connection
    }

    pub fn part(&self) -> &PartDescriptor {
        &self.part
    }

    /// Stage reached by the last operation
    pub fn stage(&self) -> FlashStage {
        self.stage
    }

    // Record the outcome of an operation in the stage
    fn finish<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if result.is_ok() {
            self.stage = FlashStage::Done;
        } else {
            warn!("Operation failed while {}", self.stage);
            self.stage = FlashStage::Failed;
        }

        result
    }

    /// Read the part ID, serial number and boot code version
    pub fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        let part_id = self.connection.read_part_id()?;
        let uid = self.connection.read_uid()?;
        let boot_version = self.connection.read_boot_version()?;

        Ok(DeviceInfo {
            part_id,
            part_name: self.part.name.to_string(),
            uid,
            boot_version,
        })
    }

    /// Read the whole flash
    pub fn read_flash(
        &mut self,
        progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<Vec<u8>, Error> {
        let data = read_memory(
            &mut self.connection,
            self.part.flash_base,
            self.part.flash_size,
            self.part.encoding(),
            progress,
        )?;

        if data.len() != self.part.flash_size as usize {
            return Err(Error::ShortRead {
                expected: self.part.flash_size as usize,
                received: data.len(),
            });
        }

        Ok(data)
    }

    /// Read the whole flash and write it to `sink`
    pub fn dump<W: Write>(
        &mut self,
        mut sink: W,
        progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let data = self.read_flash(progress)?;

        sink.write_all(&data).map_err(Error::OutputError)?;
        sink.flush().map_err(Error::OutputError)?;
        info!("Dumped {} bytes of flash", data.len());

        Ok(())
    }

    /// Erase every sector which is not blank already
    pub fn erase(&mut self, progress: Option<&mut dyn ProgressCallbacks>) -> Result<(), Error> {
        self.stage = FlashStage::Erasing;
        let result = self.erase_sectors(progress);
        self.finish(result)
    }

    fn erase_sectors(
        &mut self,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let sectors = self.part.flash_sectors;
        self.connection.unlock()?;

        if let Some(cb) = progress.as_mut() {
            cb.init(self.part.flash_base, sectors as usize);
        }

        let mut erased = 0;
        for sector in 0..sectors {
            match self.connection.blank_check(sector, sector)? {
                BlankCheck::Blank => debug!("Sector {sector} is blank"),
                BlankCheck::NotBlank { offset, content } => {
                    debug!("Sector {sector} holds {content:#010x} at offset {offset:#x}");
                    self.connection.prepare_for_write(sector, sector)?;
                    self.connection.erase(sector, sector)?;
                    erased += 1;
                }
            }

            if let Some(cb) = progress.as_mut() {
                cb.update(sector as usize + 1);
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }
        info!("Erased {erased} of {sectors} sectors, flash is now blank");

        Ok(())
    }

    /// Program `image` to the start of flash
    ///
    /// The image is validated before anything is sent to the device. The
    /// flash is then erased, and written one block at a time through the
    /// RAM staging buffer. With `verify` the flash is read back afterwards.
    pub fn flash(
        &mut self,
        image: FirmwareImage,
        user_code: UserCode,
        verify: bool,
        progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        self.stage = FlashStage::Validating;
        let result = self
            .validate(image, user_code)
            .and_then(|(data, write_size)| self.write_image(&data, write_size, verify, progress));

        self.finish(result)
    }

    // Apply the image policies and geometry checks, returning the padded
    // image and the write block size
    fn validate(
        &self,
        mut image: FirmwareImage,
        user_code: UserCode,
    ) -> Result<(Vec<u8>, u32), Error> {
        let part = &self.part;
        image.prepare(user_code)?;

        if image.len() > part.flash_size as usize {
            return Err(Error::ImageTooBig {
                size: image.len(),
                flash_size: part.flash_size,
            });
        }

        part.check_ram_buffer()?;
        check_alignment("RAM buffer address", part.ram_buffer_address(), 4)?;

        let write_size = select_write_size(part.sector_size(), part.ram_buffer_size);
        if write_size == 0 {
            return Err(Error::InvalidWriteSize {
                sector_size: part.sector_size(),
                ram_buffer_size: part.ram_buffer_size,
            });
        }

        let data = image.blocks(write_size as usize);
        if data.len() > part.flash_size as usize {
            return Err(Error::ImageTooBig {
                size: data.len(),
                flash_size: part.flash_size,
            });
        }

        Ok((data, write_size))
    }

    // Erase, program and optionally verify an already validated image
    fn write_image(
        &mut self,
        data: &[u8],
        write_size: u32,
        verify: bool,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        self.stage = FlashStage::Erasing;
        self.erase_sectors(reborrow(&mut progress))?;

        self.stage = FlashStage::Programming;
        self.program(data, write_size, reborrow(&mut progress))
            .flashing()?;

        if verify {
            self.stage = FlashStage::Verifying;
            self.verify(data, progress)?;
        }

        Ok(())
    }

    fn program(
        &mut self,
        data: &[u8],
        write_size: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let ram_address = self.part.ram_buffer_address();
        let encoding = self.part.encoding();
        let blocks = data.chunks(write_size as usize);
        let block_count = blocks.len();

        info!("Writing {block_count} blocks of {write_size} bytes");
        if let Some(cb) = progress.as_mut() {
            cb.init(self.part.flash_base, block_count);
        }

        for (index, block) in blocks.enumerate() {
            let offset = index as u32 * write_size;
            let sector = self.part.sector_of(offset);
            debug!("Writing block {index} to sector {sector}");

            self.connection.prepare_for_write(sector, sector)?;
            write_to_ram(&mut self.connection, ram_address, block, encoding)?;
            self.connection.copy_ram_to_flash(
                self.part.flash_base + offset,
                ram_address,
                write_size,
            )?;

            if let Some(cb) = progress.as_mut() {
                cb.update(index + 1);
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }

        Ok(())
    }

    fn verify(
        &mut self,
        data: &[u8],
        progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let skip = REMAPPED_BOOT_VECTORS as usize;
        if data.len() <= skip {
            debug!("Image lies within the remapped vectors, nothing to verify");
            return Ok(());
        }

        let expected = &data[skip..];
        let actual = read_memory(
            &mut self.connection,
            self.part.flash_base + REMAPPED_BOOT_VECTORS,
            expected.len() as u32,
            self.part.encoding(),
            progress,
        )?;

        match expected.iter().zip(&actual).position(|(a, b)| a != b) {
            Some(offset) => Err(Error::VerifyFailed(skip + offset)),
            None if actual.len() != expected.len() => Err(Error::VerifyFailed(skip + actual.len())),
            None => {
                info!("Flash contents verified");
                Ok(())
            }
        }
    }

    /// Start the program in flash through its reset vector
    ///
    /// Returns the address jumped to and the mode it runs in.
    pub fn execute(&mut self) -> Result<(u32, ExecutionMode), Error> {
        let vector = read_memory(
            &mut self.connection,
            self.part.reset_vector_address(),
            4,
            self.part.encoding(),
            None,
        )?;

        let entry = match vector[..] {
            [b0, b1, b2, b3] => u32::from_le_bytes([b0, b1, b2, b3]),
            _ => {
                return Err(Error::ShortRead {
                    expected: 4,
                    received: vector.len(),
                })
            }
        };

        let (mode, address) = ExecutionMode::from_entry(entry);
        if address < MIN_JUMP_ADDRESS {
            return Err(Error::InvalidJumpAddress(address));
        }

        self.connection.unlock()?;
        self.connection.go(address, mode)?;
        info!("Started execution at {address:#010x} in {mode} mode");

        Ok((address, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_size_selection() {
        assert_eq!(select_write_size(4096, 1024), 1024);
        assert_eq!(select_write_size(200, 4096), 64);
        assert_eq!(select_write_size(10, 10), 0);
        assert_eq!(select_write_size(32768, 8192), 4096);
        assert_eq!(select_write_size(1024, 256), 256);
        assert_eq!(select_write_size(4096, 800), 512);
    }

    #[test]
    fn device_info_display() {
        let info = DeviceInfo {
            part_id: 0x1A40_902B,
            part_name: "LPC1114FN28/102".into(),
            uid: [1, 2, 3, 0xABCD],
            boot_version: BootVersion { major: 7, minor: 1 },
        };

        let text = info.to_string();
        assert!(text.contains("Part ID:       0x1a40902b"));
        assert!(text.contains("00000001 00000002 00000003 0000abcd"));
        assert!(text.ends_with("7.1"));
    }
}
