//! Support for reading of GNU debug link data.
//!
//! From <https://sourceware.org/gdb/current/onlinedocs/gdb.html/Separate-Debug-Files.html>:
//!
//! A debug link is a special section of the executable file named
//! .gnu_debuglink. The section must contain:
//! - A filename, with any leading directory components removed, followed by a
//!   zero byte,
//! - zero to three bytes of padding, as needed to reach the next four-byte
//!   boundary within the section, and
//! - a four-byte CRC checksum, stored in the same endianness used for the
//!   executable file itself. The checksum is computed on the debugging
//!   information file’s full contents by the function given below, passing zero
//!   as the crc argument.

use std::ffi::OsStr;

use crate::elf::ElfParser;
use crate::error::IntoError as _;
use crate::util::bytes_to_os_str;
use crate::util::Endian;
use crate::util::ReadRaw as _;
use crate::Result;


/// The name of the section containing the debug link.
pub(crate) const DEBUG_LINK_SECTION: &str = ".gnu_debuglink";


/// Read the debug link of an ELF file, if it has one.
pub(crate) fn read_debug_link(parser: &ElfParser) -> Result<Option<(&OsStr, u32)>> {
    let idx = if let Some(idx) = parser.find_section(DEBUG_LINK_SECTION)? {
        idx
    } else {
        return Ok(None)
    };

    let data = parser.section_data(idx)?;
    parse_debug_link_section_data(data, parser.endian()).map(Some)
}


fn parse_debug_link_section_data(mut data: &[u8], endian: Endian) -> Result<(&OsStr, u32)> {
    let file = data
        .read_cstr()
        .ok_or_invalid_data(|| "failed to read debug link file name")?;
    let file = bytes_to_os_str(file.to_bytes());

    // The checksum is aligned to the next four byte boundary relative
    // to the start of the section.
    let cur_offset = file.len() + 1;
    let crc_offset = cur_offset.next_multiple_of(4);
    let () = data
        .advance(crc_offset - cur_offset)
        .ok_or_invalid_data(|| {
            "debug link section contains insufficient data: checksum not found"
        })?;
    let crc = data
        .read_u32_e(endian)
        .ok_or_invalid_data(|| "failed to read debug link checksum")?;
    Ok((file, crc))
}


const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                0xedb88320 ^ (crc >> 1)
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();


/// Compute the debug link checksum (the IEEE CRC-32) of `data`.
pub fn debug_link_crc32(data: &[u8]) -> u32 {
    let crc = 0u32;
    let crc = data.iter().fold(!crc, |crc, byte| {
        let idx = (crc ^ u32::from(*byte)) & 0xff;
        CRC32_TABLE[idx as usize] ^ (crc >> 8)
    });

    !crc
}
