//! ELF note parsing and build ID extraction.

use crate::log::warn;
use crate::util::Endian;
use crate::Addr;
use crate::Result;

use super::types::Nhdr;
use super::types::NT_GNU_BUILD_ID;
use super::types::PT_NOTE;
use super::types::SHT_NOTE;
use super::ElfParser;


/// A single ELF note.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Note<'data> {
    /// The note's name, without terminating NUL byte.
    pub name: &'data [u8],
    /// The note type.
    pub n_type: u32,
    /// The note's descriptor.
    pub desc: &'data [u8],
    /// The offset of the descriptor relative to the start of the note
    /// data.
    pub desc_offset: usize,
}


/// An iterator over the notes contained in a `PT_NOTE` segment or
/// `SHT_NOTE` section.
#[derive(Clone, Debug)]
pub struct NoteIter<'data> {
    data: &'data [u8],
    endian: Endian,
    align: usize,
    offset: usize,
}

impl<'data> NoteIter<'data> {
    /// Create a new iterator over `data`. Notes are four byte aligned,
    /// unless the containing segment or section asks for eight.
    pub fn new(data: &'data [u8], endian: Endian, align: u64) -> Self {
        Self {
            data,
            endian,
            align: if align == 8 { 8 } else { 4 },
            offset: 0,
        }
    }

    fn pad(&self, len: usize) -> usize {
        (len + self.align - 1) & !(self.align - 1)
    }

    fn parse_next(&mut self) -> Option<Note<'data>> {
        let mut data = self.data.get(self.offset..)?;
        let nhdr = Nhdr::parse(&mut data, self.endian)?;
        let namesz = nhdr.n_namesz as usize;
        let descsz = nhdr.n_descsz as usize;

        let name_offset = self.offset + 12;
        let desc_offset = name_offset.checked_add(self.pad(namesz))?;
        let next_offset = desc_offset.checked_add(self.pad(descsz))?;

        let name = self.data.get(name_offset..name_offset.checked_add(namesz)?)?;
        let name = name.strip_suffix(b"\0").unwrap_or(name);
        let desc = self.data.get(desc_offset..desc_offset.checked_add(descsz)?)?;

        self.offset = next_offset;
        Some(Note {
            name,
            n_type: nhdr.n_type,
            desc,
            desc_offset,
        })
    }
}

impl<'data> Iterator for NoteIter<'data> {
    type Item = Note<'data>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None
        }

        let note = self.parse_next();
        if note.is_none() {
            warn!("encountered malformed ELF note at offset {}", self.offset);
            // Stop iterating over garbage.
            self.offset = self.data.len();
        }
        note
    }
}


/// Check whether `note` is a GNU build ID note.
#[inline]
fn is_build_id(note: &Note<'_>) -> bool {
    note.n_type == NT_GNU_BUILD_ID && note.name == b"GNU" && !note.desc.is_empty()
}

/// Find a build ID note in raw note data, returning the build ID and
/// the offset of it relative to the start of `data`.
pub fn find_build_id(data: &[u8], endian: Endian, align: u64) -> Option<(&[u8], usize)> {
    NoteIter::new(data, endian, align)
        .find(is_build_id)
        .map(|note| (note.desc, note.desc_offset))
}

/// Read the build ID of an ELF file.
///
/// If the file has section headers, the build ID is taken from the
/// `SHT_NOTE` sections. Otherwise the `PT_NOTE` segments are consulted.
/// Reported next to the build ID is the link-time address of its
/// bytes.
pub fn read_build_id(parser: &ElfParser) -> Result<Option<(&[u8], Addr)>> {
    let endian = parser.endian();

    if parser.shnum() > 0 {
        let shdrs = parser.section_headers()?;
        for (idx, shdr) in shdrs.iter().enumerate() {
            if shdr.sh_type != SHT_NOTE {
                continue
            }
            let data = parser.section_data(idx)?;
            if let Some((build_id, offset)) = find_build_id(data, endian, shdr.sh_addralign) {
                let addr = parser.section_addr(idx)?.wrapping_add(offset as u64);
                return Ok(Some((build_id, addr)))
            }
        }
    } else {
        let phdrs = parser.program_headers()?;
        for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_NOTE) {
            let data = parser.segment_data(phdr)?;
            if let Some((build_id, offset)) = find_build_id(data, endian, phdr.p_align) {
                let addr = phdr.p_vaddr.wrapping_add(offset as u64);
                return Ok(Some((build_id, addr)))
            }
        }
    }
    Ok(None)
}
