//! Run-time section layout of relocatable (`ET_REL`) modules.
//!
//! Sections of relocatable objects all have a link-time address of
//! zero. Before addresses can be mapped to such a module, its
//! allocated sections have to be assigned run-time addresses. Those
//! are either laid out consecutively, starting at the module's low
//! address, or provided by [`Callbacks::section_address`].

use std::ops::Range;

use crate::callbacks::Callbacks;
use crate::elf::types::ET_DYN;
use crate::elf::types::ET_REL;
use crate::elf::types::SHF_ALLOC;
use crate::elf::types::SHN_ABS;
use crate::elf::types::SHN_COMMON;
use crate::elf::types::SHN_LORESERVE;
use crate::elf::types::SHN_UNDEF;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::log::trace;
use crate::module::Module;
use crate::util::align_up_u64;
use crate::Addr;
use crate::Error;
use crate::ErrorKind;
use crate::IntoError as _;
use crate::Result;


/// A single allocated section and its run-time address range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SectionRecord {
    /// The section's index.
    pub shndx: usize,
    /// The section's name.
    pub name: String,
    /// The run-time address range of the section.
    pub range: Range<Addr>,
}


/// The run-time layout of a relocatable module's sections.
#[derive(Clone, Debug, Default)]
pub(crate) struct SectionTable {
    /// Allocated sections, sorted by address.
    records: Vec<SectionRecord>,
    /// Run-time addresses indexed by section index; zero for
    /// sections not allocated.
    addrs: Box<[Addr]>,
}

impl SectionTable {
    /// Lay out the allocated sections of `elf`, starting at `low`.
    ///
    /// `lookup` is consulted for each section first and may provide an
    /// address to use instead.
    pub fn layout<F>(elf: &ElfParser, low: Addr, mut lookup: F) -> Result<Self>
    where
        F: FnMut(&str, usize) -> Result<Option<Addr>>,
    {
        let shdrs = elf.section_headers()?;
        let mut addrs = vec![0; shdrs.len()].into_boxed_slice();
        let mut records = Vec::new();
        let mut next = low;

        for (idx, shdr) in shdrs.iter().enumerate().skip(1) {
            if shdr.sh_flags & SHF_ALLOC == 0 || shdr.sh_size == 0 {
                continue
            }

            let name = elf.section_name(idx)?;
            let start = match lookup(name, idx)? {
                Some(addr) => addr,
                None => {
                    let start = align_up_u64(next, shdr.sh_addralign);
                    next = start.wrapping_add(shdr.sh_size);
                    start
                }
            };
            trace!("section {name} ({idx}) placed at {start:#x}");

            addrs[idx] = start;
            let () = records.push(SectionRecord {
                shndx: idx,
                name: name.to_string(),
                range: start..start.wrapping_add(shdr.sh_size),
            });
        }

        let () = records.sort_by_key(|record| record.range.start);
        Ok(Self { records, addrs })
    }

    /// The allocated sections, sorted by address.
    #[inline]
    pub fn records(&self) -> &[SectionRecord] {
        &self.records
    }

    /// The address range covered by all allocated sections.
    pub fn extent(&self) -> Option<Range<Addr>> {
        let start = self.records.first()?.range.start;
        let end = self
            .records
            .iter()
            .map(|record| record.range.end)
            .max()
            .unwrap_or(start);
        Some(start..end)
    }

    /// Retrieve the run-time address of the section at `shndx`.
    #[inline]
    pub fn addr(&self, shndx: usize) -> Option<Addr> {
        self.addrs.get(shndx).copied()
    }

    /// Find the section containing `addr`.
    pub fn find(&self, addr: Addr) -> Option<&SectionRecord> {
        let idx = self
            .records
            .partition_point(|record| record.range.start <= addr);
        let record = self.records.get(idx.checked_sub(1)?)?;
        record.range.contains(&addr).then_some(record)
    }

    /// Create the per-section address table to apply to `elf`.
    ///
    /// Sections are matched by index if the section counts agree, and
    /// by name otherwise, as may be the case for separate debug
    /// information files.
    fn addrs_for(&self, elf: &ElfParser) -> Result<Box<[Addr]>> {
        if elf.shnum() == self.addrs.len() {
            return Ok(self.addrs.clone())
        }

        let mut addrs = vec![0; elf.shnum()].into_boxed_slice();
        for idx in 1..elf.shnum() {
            let name = elf.section_name(idx)?;
            if let Some(record) = self.records.iter().find(|record| record.name == name) {
                addrs[idx] = record.range.start;
            }
        }
        Ok(addrs)
    }
}


/// Lay out the sections of a relocatable module's main file.
pub(crate) fn cache_sections(
    module: &Module,
    elf: &ElfParser,
    callbacks: &dyn Callbacks,
) -> Result<SectionTable> {
    let table = SectionTable::layout(elf, module.low(), |name, idx| {
        callbacks.section_address(module, name, idx)
    })?;

    if let Some(extent) = table.extent() {
        debug!(
            "module `{}`: sections span {:#x}-{:#x}",
            module.name(),
            extent.start,
            extent.end
        );
    }
    Ok(table)
}


/// Apply the section layout of a relocatable module to its main and
/// debug files.
///
/// Files that were relocated before are left alone, which also covers
/// the case of an ELF handle shared between files or modules.
pub(crate) fn relocate(module: &mut Module) -> Result<()> {
    let table = if let Some(table) = &module.sections {
        table
    } else {
        return Ok(())
    };

    for file in [module.main.as_mut(), module.debug.as_mut()].into_iter().flatten() {
        if file.relocated {
            continue
        }
        if !file.elf.has_section_addrs() {
            let addrs = table.addrs_for(&file.elf)?;
            let _set = file.elf.set_section_addrs(addrs);
        }
        file.relocated = true;
    }
    Ok(())
}


/// Convert a symbol's section relative value into an absolute
/// run-time address.
pub(crate) fn relocate_value(module: &Module, shndx: u16, value: Addr) -> Result<Addr> {
    if module.e_type() != ET_REL {
        let bias = module.bias().unwrap_or(0);
        return Ok(value.wrapping_add(bias))
    }

    match shndx {
        SHN_ABS => Ok(value),
        SHN_UNDEF | SHN_COMMON => Err(Error::with_invalid_data(format!(
            "cannot relocate value {value:#x} of undefined or common symbol"
        ))),
        shndx if shndx < SHN_LORESERVE => {
            let addr = module
                .sections
                .as_ref()
                .and_then(|table| table.addr(usize::from(shndx)))
                .ok_or_invalid_data(|| format!("section index {shndx} is invalid"))?;
            Ok(addr.wrapping_add(value))
        }
        shndx => Err(Error::with_invalid_data(format!(
            "cannot relocate value relative to reserved section index {shndx:#x}"
        ))),
    }
}


/// Convert a run-time address into a module relative one.
///
/// For relocatable modules, the index of the containing section is
/// reported alongside the address relative to it.
pub(crate) fn relocate_address(module: &Module, addr: Addr) -> Result<(Option<usize>, Addr)> {
    match module.e_type() {
        ET_REL => {
            let record = module
                .sections
                .as_ref()
                .and_then(|table| table.find(addr))
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::AddressRange,
                        format!("address {addr:#x} is not covered by any section"),
                    )
                })?;
            Ok((Some(record.shndx), addr - record.range.start))
        }
        ET_DYN => Ok((None, addr.wrapping_sub(module.low()))),
        _ => Ok((None, addr)),
    }
}


/// Find the index of the section of `elf` containing `addr`, given the
/// file's load bias.
pub(crate) fn section_containing(elf: &ElfParser, bias: Addr, addr: Addr) -> Result<Option<usize>> {
    if elf.shnum() == 0 {
        return Ok(None)
    }

    let shdrs = elf.section_headers()?;
    for (idx, shdr) in shdrs.iter().enumerate().skip(1) {
        if shdr.sh_flags & SHF_ALLOC == 0 || shdr.sh_size == 0 {
            continue
        }
        let start = elf.section_addr(idx)?;
        let start = if elf.has_section_addrs() {
            start
        } else {
            start.wrapping_add(bias)
        };
        if addr >= start && addr - start < shdr.sh_size {
            return Ok(Some(idx))
        }
    }
    Ok(None)
}
