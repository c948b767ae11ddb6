//! Block transfers between the host and target memory
//!
//! UU-encoded transfers are split into blocks of up to [BLOCK_SIZE] bytes,
//! each followed by its checksum. The receiving side answers `OK` or
//! `RESEND`, and a block may be resent [MAX_RESENDS] times before the whole
//! transfer is abandoned. Raw transfers carry the bytes as they are, without
//! any block or checksum framing.

use log::{debug, warn};

use crate::{
    checksum::checksum,
    connection::{check_alignment, command::Command, command::CommandType, Connection},
    error::{ConnectionError, Error, ResultExt},
    progress::ProgressCallbacks,
    uuencode::{self, BLOCK_SIZE, LINES_PER_BLOCK, LINE_LENGTH},
};

/// Number of times a corrupted block is resent before giving up
pub const MAX_RESENDS: u32 = 3;

const BLOCK_OK: &[u8] = b"OK\r\n";
const BLOCK_RESEND: &[u8] = b"RESEND\r\n";

/// Framing of memory contents on the wire
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Uuencoded,
    Raw,
}

impl From<bool> for Encoding {
    fn from(uuencode: bool) -> Self {
        if uuencode {
            Encoding::Uuencoded
        } else {
            Encoding::Raw
        }
    }
}

/// Number of checksummed blocks used to transfer `count` bytes
pub fn block_count(count: usize) -> usize {
    count.div_ceil(LINE_LENGTH).div_ceil(LINES_PER_BLOCK)
}

/// Bookkeeping of a single transfer call
#[derive(Debug)]
struct TransferState {
    total: usize,
    transferred: usize,
    block: usize,
    resends: u32,
}

impl TransferState {
    fn new(total: usize) -> Self {
        TransferState {
            total,
            transferred: 0,
            block: 0,
            resends: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.transferred >= self.total
    }

    fn next_block_len(&self) -> usize {
        (self.total - self.transferred).min(BLOCK_SIZE)
    }

    fn accept(&mut self, len: usize) {
        self.transferred += len;
        self.block += 1;
        self.resends = 0;
    }

    /// Count a corrupted block, failing once it exceeded its resends
    fn reject(&mut self) -> Result<(), Error> {
        self.resends += 1;

        if self.resends > MAX_RESENDS {
            return Err(Error::BlockChecksum {
                block: self.block,
                attempts: self.resends,
            });
        }

        warn!(
            "Checksum mismatch on block {}, resending ({}/{MAX_RESENDS})",
            self.block, self.resends
        );
        Ok(())
    }
}

/// Read `count` bytes of target memory starting at `address`
pub fn read_memory(
    connection: &mut Connection,
    address: u32,
    count: u32,
    encoding: Encoding,
    mut progress: Option<&mut dyn ProgressCallbacks>,
) -> Result<Vec<u8>, Error> {
    check_alignment("Address", address, 4)?;
    check_alignment("Byte count", count, 4)?;

    connection.command(Command::ReadMemory {
        address,
        size: count,
    })?;

    if let Some(cb) = progress.as_mut() {
        cb.init(address, count as usize);
    }

    let data = match encoding {
        Encoding::Raw => connection
            .read_exact(count as usize)
            .for_command(CommandType::ReadMemory)?,
        Encoding::Uuencoded => read_blocks(connection, count as usize, &mut progress)?,
    };

    if let Some(cb) = progress.as_mut() {
        cb.finish();
    }

    Ok(data)
}

fn read_blocks(
    connection: &mut Connection,
    count: usize,
    progress: &mut Option<&mut dyn ProgressCallbacks>,
) -> Result<Vec<u8>, Error> {
    let mut state = TransferState::new(count);
    let mut data = Vec::with_capacity(count);

    debug!("Reading {count} bytes in {} blocks", block_count(count));

    while !state.is_complete() {
        let len = state.next_block_len();
        let encoded = connection
            .read_exact(uuencode::encoded_len(len))
            .for_command(CommandType::ReadMemory)?;
        let expected = read_checksum(connection)?;

        match uuencode::decode(&encoded) {
            Ok(block) if block.len() == len && Some(checksum(&block)) == expected => {
                connection.write_bytes(BLOCK_OK)?;
                data.extend_from_slice(&block);
                state.accept(len);

                if let Some(cb) = progress.as_mut() {
                    cb.update(state.transferred);
                }
            }
            result => {
                if let Err(err) = result {
                    debug!("Block {} could not be decoded: {err}", state.block);
                }
                state.reject()?;
                connection.write_bytes(BLOCK_RESEND)?;
            }
        }
    }

    Ok(data)
}

// A garbled checksum line is treated like a checksum mismatch
fn read_checksum(connection: &mut Connection) -> Result<Option<u32>, Error> {
    match connection.read_number() {
        Ok(sum) => Ok(Some(sum)),
        Err(Error::Connection(ConnectionError::MalformedReply(line))) => {
            debug!("Malformed block checksum {line:?}");
            Ok(None)
        }
        Err(err) => Err(err).for_command(CommandType::ReadMemory),
    }
}

/// Write `data` to target RAM starting at `address`
pub fn write_to_ram(
    connection: &mut Connection,
    address: u32,
    data: &[u8],
    encoding: Encoding,
) -> Result<(), Error> {
    check_alignment("Address", address, 4)?;
    check_alignment("Byte count", data.len() as u32, 4)?;

    connection.command(Command::WriteToRam {
        address,
        size: data.len() as u32,
    })?;

    match encoding {
        Encoding::Raw => connection.write_bytes(data),
        Encoding::Uuencoded => write_blocks(connection, data),
    }
}

fn write_blocks(connection: &mut Connection, data: &[u8]) -> Result<(), Error> {
    let mut state = TransferState::new(data.len());

    for chunk in data.chunks(BLOCK_SIZE) {
        let mut frame = uuencode::encode(chunk);
        frame.extend_from_slice(format!("{}\r\n", checksum(chunk)).as_bytes());

        loop {
            connection.write_bytes(&frame)?;

            let reply = connection
                .read_line()
                .for_command(CommandType::WriteToRam)?;
            if reply == "OK" {
                state.accept(chunk.len());
                break;
            }

            debug!("Device answered {reply:?} to block {}", state.block);
            state.reject()?;
        }
    }

    Ok(())
}
