//! UU-style line encoding used by the ISP bootloader for memory transfers
//!
//! Every line starts with a length character (`bytes + 32`), carries groups of
//! three bytes packed into four printable characters and ends with `\r\n`. A
//! six-bit value of zero is sent as a backtick (96) rather than a space.

use crate::error::Error;

/// Maximum number of data bytes carried by one encoded line
pub const LINE_LENGTH: usize = 45;
/// Number of lines sent before a checksum is exchanged
pub const LINES_PER_BLOCK: usize = 20;
/// Maximum number of data bytes covered by one checksum
pub const BLOCK_SIZE: usize = LINE_LENGTH * LINES_PER_BLOCK;

const ZERO_CHAR: u8 = 96;

fn encode_char(value: u8) -> u8 {
    match value & 0x3F {
        0 => ZERO_CHAR,
        v => v + 32,
    }
}

fn decode_char(c: u8) -> u8 {
    c.wrapping_sub(32) & 0x3F
}

/// Encode `data` into as many lines as required
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(data.len()));

    for line in data.chunks(LINE_LENGTH) {
        out.push(encode_char(line.len() as u8));

        for group in line.chunks(3) {
            let b0 = group[0];
            let b1 = group.get(1).copied().unwrap_or(0);
            let b2 = group.get(2).copied().unwrap_or(0);

            out.push(encode_char(b0 >> 2));
            out.push(encode_char((b0 << 4) | (b1 >> 4)));
            out.push(encode_char((b1 << 2) | (b2 >> 6)));
            out.push(encode_char(b2));
        }

        out.extend_from_slice(b"\r\n");
    }

    out
}

/// Number of bytes produced when encoding `len` data bytes
pub fn encoded_len(len: usize) -> usize {
    let lines = len.div_ceil(LINE_LENGTH);

    // full lines hold a whole number of groups, so only the last may be partial
    len.div_ceil(3) * 4 + 3 * lines
}

/// Decode encoded lines back into raw bytes
///
/// Control characters between lines are skipped, and a line with a length of
/// zero ends the data early. A group cut short by the end of the input or by
/// a control character is reported as [Error::UuDecode] with the offset of
/// the offending line.
pub fn decode(encoded: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(encoded.len() / 4 * 3);
    let mut pos = 0;

    while pos < encoded.len() {
        let c = encoded[pos];
        if c < 32 {
            pos += 1;
            continue;
        }

        let line_start = pos;
        let len = decode_char(c) as usize;
        if len == 0 {
            break;
        }
        pos += 1;

        let groups_len = len.div_ceil(3) * 4;
        let groups = encoded
            .get(pos..pos + groups_len)
            .filter(|groups| groups.iter().all(|&c| c >= 32))
            .ok_or(Error::UuDecode(line_start))?;

        let mut remaining = len;
        for group in groups.chunks_exact(4) {
            let c0 = decode_char(group[0]);
            let c1 = decode_char(group[1]);
            let c2 = decode_char(group[2]);
            let c3 = decode_char(group[3]);

            let bytes = [(c0 << 2) | (c1 >> 4), (c1 << 4) | (c2 >> 2), (c2 << 6) | c3];
            let take = remaining.min(3);
            out.extend_from_slice(&bytes[..take]);
            remaining -= take;
        }

        pos += groups_len;
    }

    Ok(out)
}
