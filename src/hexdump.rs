//! `hexdump -C` style rendering of byte buffers

use std::fmt::Write;

/// Render `data` as offset, sixteen hex bytes and their printable characters
pub fn hexdump(data: &[u8], base: u32) -> String {
    let mut out = String::new();

    for (index, row) in data.chunks(16).enumerate() {
        let offset = base.wrapping_add((index * 16) as u32);
        let _ = write!(out, "{offset:08x} ");

        for column in 0..16 {
            if column == 8 {
                out.push(' ');
            }
            match row.get(column) {
                Some(byte) => {
                    let _ = write!(out, " {byte:02x}");
                }
                None => out.push_str("   "),
            }
        }

        out.push_str("  |");
        out.extend(row.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }

    out
}
