use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::log::debug;
use crate::Result;

use super::types::Rela;
use super::types::Sym;
use super::types::ET_REL;
use super::types::SHN_ABS;
use super::types::SHN_COMMON;
use super::types::SHN_LORESERVE;
use super::types::SHN_UNDEF;
use super::types::SHT_REL;
use super::types::SHT_RELA;
use super::ElfParser;


/// A single pre-resolved relocation entry.
#[derive(Debug, Clone, Copy)]
struct RelocationEntry {
    /// The pre-resolved addend (for `SHT_RELA`: `S + r_addend`, for
    /// `SHT_REL`: `S`).
    addend: u64,
    /// Whether this is an implicit-addend (`SHT_REL`) relocation.
    implicit: bool,
}


/// A map from section offsets to pre-resolved relocation addends.
///
/// For a given section, this maps byte offsets within that section
/// to the relocation that should be applied when reading at that offset.
#[derive(Debug, Clone, Default)]
pub(crate) struct RelocationMap {
    entries: BTreeMap<u64, RelocationEntry>,
}

impl RelocationMap {
    fn insert(&mut self, offset: u64, addend: u64, implicit: bool) {
        let _prev = self
            .entries
            .insert(offset, RelocationEntry { addend, implicit });
    }

    pub(crate) fn relocate(&self, offset: u64, value: u64) -> u64 {
        if let Some(entry) = self.entries.get(&offset) {
            if entry.implicit {
                value.wrapping_add(entry.addend)
            } else {
                entry.addend
            }
        } else {
            value
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}


/// Holds per-section relocation maps for an ELF file.
///
/// For `ET_REL` files, this contains relocation maps keyed by the target
/// section index. For other files, this is empty.
#[derive(Debug)]
pub(crate) struct SectionRelocations {
    /// Relocation maps keyed by target section index.
    maps: HashMap<usize, RelocationMap>,
    /// A shared empty relocation map for sections without relocations.
    empty: RelocationMap,
}

impl SectionRelocations {
    /// Create an empty `SectionRelocations` (for non-relocatable files).
    pub(crate) fn empty() -> Self {
        Self::new(HashMap::new())
    }

    fn new(maps: HashMap<usize, RelocationMap>) -> Self {
        Self {
            maps,
            empty: RelocationMap::default(),
        }
    }

    /// Resolve all `SHT_REL` and `SHT_RELA` sections of `parser`.
    ///
    /// Symbol values are resolved using the parser's section addresses,
    /// so any run-time section layout should be set beforehand.
    pub(crate) fn from_parser(parser: &ElfParser) -> Result<Self> {
        if parser.elf_type() != ET_REL {
            return Ok(Self::empty())
        }

        let class = parser.class();
        let endian = parser.endian();
        let shdrs = parser.section_headers()?;
        let mut maps = HashMap::<usize, RelocationMap>::new();
        let mut symtabs = HashMap::<usize, Vec<Sym>>::new();

        for (idx, shdr) in shdrs.iter().enumerate() {
            let explicit = match shdr.sh_type {
                SHT_RELA => true,
                SHT_REL => false,
                _ => continue,
            };

            let target = shdr.sh_info as usize;
            let symtab_idx = shdr.sh_link as usize;
            if !symtabs.contains_key(&symtab_idx) {
                let syms = parser.symbols(symtab_idx)?;
                let _prev = symtabs.insert(symtab_idx, syms);
            }
            // SANITY: We just made sure the symbol table is present.
            let syms = &symtabs[&symtab_idx];

            let mut data = parser.section_data(idx)?;
            let map = maps.entry(target).or_default();

            while let Some(rela) = Rela::parse(&mut data, class, endian, explicit) {
                let sym = if let Some(sym) = syms.get(rela.r_sym as usize) {
                    sym
                } else {
                    debug!("relocation in section {idx} references invalid symbol {}", rela.r_sym);
                    continue
                };

                let value = match sym.st_shndx {
                    SHN_UNDEF | SHN_COMMON => continue,
                    SHN_ABS => sym.st_value,
                    shndx if shndx < SHN_LORESERVE => parser
                        .section_addr(usize::from(shndx))?
                        .wrapping_add(sym.st_value),
                    _ => continue,
                };

                let () = match rela.r_addend {
                    Some(addend) => {
                        map.insert(rela.r_offset, value.wrapping_add(addend as u64), false)
                    }
                    None => map.insert(rela.r_offset, value, true),
                };
            }
        }

        let () = maps.retain(|_idx, map| !map.is_empty());
        Ok(Self::new(maps))
    }

    /// Get the relocation map for the section at `target_idx`.
    ///
    /// Returns the empty map if no relocations exist for that section.
    pub(crate) fn get(&self, target_idx: usize) -> &RelocationMap {
        self.maps.get(&target_idx).unwrap_or(&self.empty)
    }
}
