//! Firmware images and the checks applied before programming them
//!
//! The bootloader only starts user code when the first eight vectors of the
//! image sum to zero, so vector 7 either has to be computed here or already be
//! correct. Images which enable code read protection are refused.

use std::{fs, path::Path};

use log::{debug, info};

use crate::{
    checksum::{vector_checksum, CHECKSUMMED_VECTORS},
    error::Error,
};

/// Offset of the code read protection word
pub const CRP_OFFSET: usize = 0x2FC;
/// Disables ISP entry through the ISP pin
pub const CRP_NO_ISP: u32 = 0x4E69_7370;
pub const CRP_CRP1: u32 = 0x1234_5678;
pub const CRP_CRP2: u32 = 0x8765_4321;
pub const CRP_CRP3: u32 = 0x4321_8765;

const CRP_MAGICS: [u32; 4] = [CRP_NO_ISP, CRP_CRP1, CRP_CRP2, CRP_CRP3];
const CHECKSUM_VECTOR: usize = CHECKSUMMED_VECTORS;
const VECTOR_TABLE_SIZE: usize = (CHECKSUM_VECTOR + 1) * 4;

/// How vector 7 of an image is treated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UserCode {
    /// Write the checksum into vector 7
    #[default]
    Compute,
    /// Require vector 7 to already hold the checksum
    Verify,
}

/// A raw binary image, starting with the vector table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(data: Vec<u8>) -> Result<Self, Error> {
        if data.is_empty() {
            return Err(Error::EmptyImage);
        }

        Ok(Self { data })
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let data =
            fs::read(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;
        debug!("Loaded {} bytes from {}", data.len(), path.display());

        Self::new(data)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    // bytes past the end of the image read as zero, as they are once padded
    fn word(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.data.get(offset + i).copied().unwrap_or(0);
        }

        u32::from_le_bytes(bytes)
    }

    /// Checksum vector 7 must hold
    pub fn expected_checksum(&self) -> u32 {
        let mut vectors = [0u32; CHECKSUMMED_VECTORS];
        for (i, vector) in vectors.iter_mut().enumerate() {
            *vector = self.word(i * 4);
        }

        vector_checksum(&vectors)
    }

    /// Current content of vector 7
    pub fn stored_checksum(&self) -> u32 {
        self.word(CHECKSUM_VECTOR * 4)
    }

    /// Content of the code read protection word
    pub fn crp(&self) -> u32 {
        self.word(CRP_OFFSET)
    }

    /// Apply the user code policy, then refuse code read protected images
    pub fn prepare(&mut self, user_code: UserCode) -> Result<(), Error> {
        let expected = self.expected_checksum();

        match user_code {
            UserCode::Compute => {
                if self.data.len() < VECTOR_TABLE_SIZE {
                    self.data.resize(VECTOR_TABLE_SIZE, 0);
                }
                let offset = CHECKSUM_VECTOR * 4;
                self.data[offset..offset + 4].copy_from_slice(&expected.to_le_bytes());
                debug!("Vector table checksum set to {expected:#010x}");
            }
            UserCode::Verify => {
                let found = self.stored_checksum();
                if found != expected {
                    return Err(Error::VectorChecksum { expected, found });
                }
            }
        }
        info!("Vector table checksum OK");

        self.check_crp()
    }

    /// Refuse images which would lock ISP or debug access
    pub fn check_crp(&self) -> Result<(), Error> {
        let crp = self.crp();

        if CRP_MAGICS.contains(&crp) {
            return Err(Error::CrpProtected(crp));
        }

        Ok(())
    }

    /// Image contents zero-padded to a whole number of `block_size` blocks
    pub fn blocks(&self, block_size: usize) -> Vec<u8> {
        let mut data = self.data.clone();
        data.resize(self.data.len().div_ceil(block_size) * block_size, 0);
        data
    }
}
