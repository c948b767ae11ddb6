//! Parser for parts description files
//!
//! Each record is a single comma separated line:
//!
//! ```text
//! # part_id, name, flash_base, flash_size, sectors, reset_vector_offset,
//! #   ram_base, ram_size, ram_buffer_offset, ram_buffer_size, uuencode
//! 0x1A40902B, LPC1114FN28/102, 0x0, 0x8000, 8, 4, 0x10000000, 0x1000, 0x800, 0x400, 1
//! ```
//!
//! Numbers may be given in decimal or with a `0x`, `0o` or `0b` prefix. Lines
//! starting with `#` and blank lines are ignored.

use std::borrow::Cow;

use super::PartDescriptor;
use crate::error::Error;

const MAX_NAME_LENGTH: usize = 24;
const NAME_PREFIX: &str = "LPC";
const VALUE_NAMES: [&str; 9] = [
    "flash base",
    "flash size",
    "sector count",
    "reset vector offset",
    "RAM base",
    "RAM size",
    "RAM buffer offset",
    "RAM buffer size",
    "uuencode flag",
];

/// Parse every record of a parts description, in file order
pub fn parse_parts(text: &str) -> impl Iterator<Item = Result<PartDescriptor, Error>> + '_ {
    text.lines().enumerate().filter_map(|(index, line)| {
        let record = line.trim();
        if record.is_empty() || record.starts_with('#') {
            None
        } else {
            Some(parse_record(record).map_err(|reason| Error::PartsFile {
                line: index + 1,
                reason,
            }))
        }
    })
}

fn parse_record(record: &str) -> Result<PartDescriptor, String> {
    let mut fields = record.split(',').map(str::trim);

    let part_id = match fields.next() {
        Some(id) => parse_int::parse::<u64>(id).map_err(|_| format!("invalid part ID {id:?}"))?,
        None => return Err("empty record".into()),
    };

    let name = fields
        .next()
        .filter(|name| !name.is_empty())
        .ok_or("nothing after the part ID")?;
    if !name.starts_with(NAME_PREFIX) {
        return Err(format!("part name {name:?} does not start with {NAME_PREFIX}"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(format!("part name {name:?} is too long"));
    }

    let mut values = [0u32; VALUE_NAMES.len()];
    for (value, value_name) in values.iter_mut().zip(VALUE_NAMES) {
        let field = fields
            .next()
            .ok_or_else(|| format!("{value_name} is missing"))?;
        *value = parse_int::parse::<u32>(field)
            .map_err(|_| format!("invalid {value_name} {field:?}"))?;
    }

    let [
        flash_base,
        flash_size,
        flash_sectors,
        reset_vector_offset,
        ram_base,
        ram_size,
        ram_buffer_offset,
        ram_buffer_size,
        uuencode,
    ] = values;

    if flash_sectors == 0 {
        return Err("sector count must not be zero".into());
    }

    Ok(PartDescriptor {
        part_id,
        name: Cow::Owned(name.to_string()),
        flash_base,
        flash_size,
        flash_sectors,
        reset_vector_offset,
        ram_base,
        ram_size,
        ram_buffer_offset,
        ram_buffer_size,
        uuencode: uuencode != 0,
    })
}
