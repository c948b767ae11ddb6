use std::borrow::Cow;

use super::PartDescriptor;

const fn part(
    part_id: u64,
    name: &'static str,
    flash_size: u32,
    flash_sectors: u32,
    ram_size: u32,
    ram_buffer_offset: u32,
    ram_buffer_size: u32,
    uuencode: bool,
) -> PartDescriptor {
    PartDescriptor {
        part_id,
        name: Cow::Borrowed(name),
        flash_base: 0x0000_0000,
        flash_size,
        flash_sectors,
        reset_vector_offset: 0x04,
        ram_base: 0x1000_0000,
        ram_size,
        ram_buffer_offset,
        ram_buffer_size,
        uuencode,
    }
}

/// Parts known without a parts description file
pub(super) static PARTS: &[PartDescriptor] = &[
    // LPC111x
    part(0x0A07_102B, "LPC1110FD20", 0x1000, 1, 0x400, 0x200, 0x100, true),
    part(0x041E_502B, "LPC1111FHN33/101", 0x2000, 2, 0x800, 0x400, 0x400, true),
    part(0x0416_502B, "LPC1112FHN33/101", 0x4000, 4, 0x800, 0x400, 0x400, true),
    part(0x0434_502B, "LPC1113FHN33/201", 0x6000, 6, 0x1000, 0x800, 0x400, true),
    part(0x0444_102B, "LPC1114FHN33/301", 0x8000, 8, 0x2000, 0x800, 0x1000, true),
    part(0x0A40_902B, "LPC1114FN28/102", 0x8000, 8, 0x1000, 0x800, 0x400, true),
    part(0x1A40_902B, "LPC1114FN28/102", 0x8000, 8, 0x1000, 0x800, 0x400, true),
    // LPC13xx
    part(0x3D00_002B, "LPC1343FBD48", 0x8000, 8, 0x2000, 0x800, 0x1000, true),
    // LPC81x
    part(0x0000_8100, "LPC810M021", 0x1000, 4, 0x400, 0x200, 0x100, false),
    part(0x0000_8110, "LPC811M001", 0x2000, 8, 0x800, 0x400, 0x400, false),
    part(0x0000_8120, "LPC812M101", 0x4000, 16, 0x1000, 0x800, 0x400, false),
];
