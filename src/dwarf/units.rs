// Based on gimli-rs/addr2line (https://github.com/gimli-rs/addr2line):
// > Copyright (c) 2016-2018 The gimli Developers
// >
// > Permission is hereby granted, free of charge, to any
// > person obtaining a copy of this software and associated
// > documentation files (the "Software"), to deal in the
// > Software without restriction, including without
// > limitation the rights to use, copy, modify, merge,
// > publish, distribute, sublicense, and/or sell copies of
// > the Software, and to permit persons to whom the Software
// > is furnished to do so, subject to the following
// > conditions:
// >
// > The above copyright notice and this permission notice
// > shall be included in all copies or substantial portions
// > of the Software.
// >
// > THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF
// > ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED
// > TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A
// > PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT
// > SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY
// > CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION
// > OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR
// > IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// > DEALINGS IN THE SOFTWARE.

use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::rc::Rc;

use crate::callbacks::Callbacks;
use crate::elf::relocations::SectionRelocations;
use crate::elf::types::ET_REL;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::log::warn;
use crate::module::cached;
use crate::module::FileRecord;
use crate::module::Module;
use crate::once::OnceCell;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::Result;

use super::lines::Lines;
use super::lines::SrcLoc;
use super::reader::load_section;
use super::reader::R;


fn format_offset(offset: gimli::UnitSectionOffset<usize>) -> String {
    match offset {
        gimli::UnitSectionOffset::DebugInfoOffset(o) => {
            format!(".debug_info+0x{:08x}", o.0)
        }
        gimli::UnitSectionOffset::DebugTypesOffset(o) => {
            format!(".debug_types+0x{:08x}", o.0)
        }
    }
}


/// An address range covered by a compilation unit, already biased.
#[derive(Debug)]
struct UnitRange {
    begin: Addr,
    end: Addr,
    /// The largest `end` of this and all preceding ranges.
    max_end: Addr,
    unit_id: usize,
}


#[derive(Debug)]
struct Unit {
    offset: gimli::DebugInfoOffset<usize>,
    lines: OnceCell<Option<Lines>>,
}


/// The compilation units of a module's DWARF data, along with the
/// address ranges they cover.
pub(crate) struct CuCache {
    elf: Rc<ElfParser>,
    relocs: SectionRelocations,
    /// The bias to apply to addresses in the DWARF data.
    bias: Addr,
    ranges: Box<[UnitRange]>,
    units: Box<[Unit]>,
}

impl CuCache {
    fn dwarf<'a>(elf: &'a ElfParser, relocs: &'a SectionRelocations) -> Result<gimli::Dwarf<R<'a>>> {
        gimli::Dwarf::load(|id| load_section(elf, relocs, id))
    }

    /// Index the compilation units of `elf`.
    pub(crate) fn new(elf: Rc<ElfParser>, bias: Addr) -> Result<Self> {
        let relocs = SectionRelocations::from_parser(&elf)?;
        let dwarf = Self::dwarf(&elf, &relocs)?;

        let mut ranges = Vec::new();
        let mut units = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers.next()? {
            let offset = match header.offset().as_debug_info_offset() {
                Some(offset) => offset,
                None => continue,
            };
            // We don't need anything from type units.
            match header.type_() {
                gimli::UnitType::Type { .. } | gimli::UnitType::SplitType { .. } => continue,
                _ => {}
            }
            let dw_unit = dwarf.unit(header.clone()).with_context(|| {
                format!(
                    "failed to retrieve DWARF unit for unit header @ {}",
                    format_offset(header.offset())
                )
            })?;

            let unit_id = units.len();
            let mut have_range = false;
            let mut unit_ranges = dwarf.unit_ranges(&dw_unit)?;
            while let Some(range) = unit_ranges.next()? {
                if range.begin < range.end {
                    let () = ranges.push(UnitRange {
                        begin: range.begin.wrapping_add(bias),
                        end: range.end.wrapping_add(bias),
                        max_end: 0,
                        unit_id,
                    });
                    have_range = true;
                }
            }

            let lines = OnceCell::new();
            if !have_range {
                // The unit did not declare any ranges. Try to get some
                // from the line program sequences.
                if let Some(ilnp) = &dw_unit.line_program {
                    let unit = gimli::UnitRef::new(&dwarf, &dw_unit);
                    match Lines::parse(unit, ilnp.clone(), bias) {
                        Ok(parsed) => {
                            for sequence in parsed.sequences.iter() {
                                let () = ranges.push(UnitRange {
                                    begin: sequence.start,
                                    end: sequence.end,
                                    max_end: 0,
                                    unit_id,
                                });
                            }
                            let _result = lines.set(Some(parsed));
                        }
                        Err(err) => {
                            warn!(
                                "failed to parse line program of unit @ {}: {err}",
                                format_offset(header.offset())
                            );
                        }
                    }
                }
            }

            let () = units.push(Unit { offset, lines });
        }

        let () = ranges.sort_by_key(|range| range.begin);
        let mut max_end = 0;
        for range in ranges.iter_mut() {
            max_end = max_end.max(range.end);
            range.max_end = max_end;
        }

        debug!(
            "indexed {} compilation units with {} address ranges",
            units.len(),
            ranges.len()
        );

        let slf = Self {
            elf,
            relocs,
            bias,
            ranges: ranges.into_boxed_slice(),
            units: units.into_boxed_slice(),
        };
        Ok(slf)
    }

    fn lines<'u>(&self, unit: &'u Unit) -> Result<Option<&'u Lines>> {
        let lines = unit.lines.get_or_try_init(|| {
            let dwarf = Self::dwarf(&self.elf, &self.relocs)?;
            let header = dwarf.debug_info.header_from_offset(unit.offset)?;
            let dw_unit = dwarf.unit(header)?;
            let lines = match &dw_unit.line_program {
                Some(ilnp) => {
                    let unit_ref = gimli::UnitRef::new(&dwarf, &dw_unit);
                    Some(Lines::parse(unit_ref, ilnp.clone(), self.bias)?)
                }
                None => None,
            };
            Result::<_, Error>::Ok(lines)
        })?;
        Ok(lines.as_ref())
    }

    /// Find the source location of the run-time address `addr`.
    pub(crate) fn find_location(&self, addr: Addr) -> Result<Option<SrcLoc>> {
        let end = self.ranges.partition_point(|range| range.begin <= addr);
        for range in self.ranges[..end].iter().rev() {
            if range.max_end <= addr {
                break
            }
            if addr >= range.end {
                continue
            }

            let unit = &self.units[range.unit_id];
            if let Some(location) = self.lines(unit)?.and_then(|lines| lines.find_location(addr)) {
                return Ok(Some(location))
            }
        }
        Ok(None)
    }
}

impl Debug for CuCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("CuCache")
            .field("path", &self.elf.path())
            .field("bias", &format_args!("{:#x}", self.bias))
            .field("units", &self.units.len())
            .finish()
    }
}


/// Check whether `file` carries DWARF data.
fn has_dwarf(file: &FileRecord) -> Result<bool> {
    Ok(file.elf.find_section(".debug_info")?.is_some())
}

fn load_cus(module: &mut Module, callbacks: &dyn Callbacks) -> Result<CuCache> {
    let debug = match module.ensure_debug(callbacks) {
        Ok(debug) if has_dwarf(debug)? => Some(debug.clone()),
        Ok(_) => None,
        Err(err) => {
            debug!("module `{}`: no separate debug information: {err}", module.name());
            None
        }
    };

    let file = match debug {
        Some(debug) => debug,
        None => {
            let main = module.ensure_elf(callbacks)?;
            if !has_dwarf(main)? {
                return Err(Error::new(
                    ErrorKind::NoDwarf,
                    format!("module `{}` has no DWARF data", module.name()),
                ))
            }
            main.clone()
        }
    };

    // Relocatable objects have their DWARF data relocated to run-time
    // addresses directly.
    let bias = if file.elf.elf_type() == ET_REL { 0 } else { file.bias };
    CuCache::new(file.elf, bias)
        .with_context(|| format!("failed to index DWARF data of module `{}`", module.name()))
}

/// Make sure that the compilation units of `module` are indexed.
pub(crate) fn ensure_cus<'module>(
    module: &'module mut Module,
    callbacks: &dyn Callbacks,
) -> Result<&'module CuCache> {
    if module.cus.is_none() {
        let mut slot = module.failures.dwarf;
        let result = cached(&mut slot, || load_cus(module, callbacks));
        module.failures.dwarf = slot;
        module.cus = Some(result?);
    }
    // SANITY: We either had a cache or just created one.
    Ok(module.cus.as_ref().unwrap())
}
