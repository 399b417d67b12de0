use gimli::EndianSlice;
use gimli::RelocateReader;
use gimli::RunTimeEndian;
use gimli::SectionId;

use crate::elf::relocations::RelocationMap;
use crate::elf::relocations::SectionRelocations;
use crate::elf::ElfParser;
use crate::util::Endian;
use crate::Result;


/// The gimli reader type we use: a slice of an ELF section in the
/// file's byte order, with relocations applied as values are read.
pub(crate) type R<'dat> = RelocateReader<EndianSlice<'dat, RunTimeEndian>, &'dat RelocationMap>;


pub(super) fn load_section<'dat>(
    parser: &'dat ElfParser,
    relocs: &'dat SectionRelocations,
    id: SectionId,
) -> Result<R<'dat>> {
    let endian = match parser.endian() {
        Endian::Little => RunTimeEndian::Little,
        Endian::Big => RunTimeEndian::Big,
    };

    let result = parser.find_section(id.name())?;
    let (data, relocs) = match result {
        Some(idx) => (parser.section_data(idx)?, relocs.get(idx)),
        // Make sure to return empty data if a section does not exist.
        None => (&[][..], relocs.get(usize::MAX)),
    };

    let reader = RelocateReader::new(EndianSlice::new(data, endian), relocs);
    Ok(reader)
}
