//! Per-module symbol tables and nearest symbol lookup.

use std::borrow::Cow;
use std::rc::Rc;

use crate::callbacks::Callbacks;
use crate::elf::types::Class;
use crate::elf::types::Sym as ElfSym;
use crate::elf::types::DT_GNU_HASH;
use crate::elf::types::DT_HASH;
use crate::elf::types::DT_STRSZ;
use crate::elf::types::DT_STRTAB;
use crate::elf::types::DT_SYMENT;
use crate::elf::types::DT_SYMTAB;
use crate::elf::types::ET_REL;
use crate::elf::types::SHN_ABS;
use crate::elf::types::SHN_LORESERVE;
use crate::elf::types::SHN_UNDEF;
use crate::elf::types::SHT_DYNSYM;
use crate::elf::types::SHT_SYMTAB;
use crate::elf::types::STB_GLOBAL;
use crate::elf::types::STB_LOCAL;
use crate::elf::types::STB_WEAK;
use crate::elf::types::STT_FILE;
use crate::elf::types::STT_SECTION;
use crate::elf::types::STT_TLS;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::module::cached;
use crate::module::Module;
use crate::reloc::relocate_value;
use crate::reloc::section_containing;
use crate::util::ReadRaw as _;
use crate::Addr;
use crate::Error;
use crate::ErrorKind;
use crate::IntoError as _;
use crate::Result;


/// A symbol, as reported by a module's symbol table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sym<'module> {
    /// The symbol's name, as stored in the string table.
    pub name: Cow<'module, str>,
    /// The symbol's run-time address.
    pub addr: Addr,
    /// The symbol's size. Zero for labels.
    pub size: u64,
    /// The symbol's type (`STT_*`).
    pub type_: u8,
    /// The symbol's binding (`STB_*`).
    pub bind: u8,
    /// The index of the section the symbol is defined in.
    pub shndx: u16,
    /// The index of the symbol in its table.
    pub index: usize,
}

impl Sym<'_> {
    /// Convert the symbol into one that owns its name.
    pub fn into_owned(self) -> Sym<'static> {
        Sym {
            name: Cow::Owned(self.name.into_owned()),
            addr: self.addr,
            size: self.size,
            type_: self.type_,
            bind: self.bind,
            shndx: self.shndx,
            index: self.index,
        }
    }

    /// Retrieve the symbol's name, demangled if it is a mangled C++ or
    /// Rust name.
    #[cfg(feature = "demangle")]
    #[cfg_attr(docsrs, doc(cfg(feature = "demangle")))]
    pub fn demangled(&self) -> Cow<'_, str> {
        demangle(&self.name)
    }
}


/// Demangle a C++ or Rust symbol name, if it is one.
#[cfg(feature = "demangle")]
fn demangle(name: &str) -> Cow<'_, str> {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return Cow::Owned(format!("{demangled:#}"))
    }

    if name.starts_with("_Z") {
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled) = symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
                return Cow::Owned(demangled)
            }
        }
    }
    Cow::Borrowed(name)
}


/// Rank a symbol binding for the purpose of breaking ties between
/// candidates.
#[inline]
fn binding_rank(bind: u8) -> u8 {
    match bind {
        STB_GLOBAL => 3,
        STB_WEAK => 2,
        STB_LOCAL => 1,
        _ => 0,
    }
}


/// Where a symbol table was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymtabSource {
    /// `SHT_SYMTAB` of the main file.
    MainSymtab,
    /// `SHT_SYMTAB` of the separate debug information file.
    DebugSymtab,
    /// `SHT_DYNSYM` of the main file.
    Dynsym,
    /// The dynamic symbol table, as located through `PT_DYNAMIC`.
    Dynamic,
}


/// The location of the string table backing a symbol table.
#[derive(Clone, Copy, Debug)]
enum Strtab {
    /// The section with the given index.
    Section(usize),
    /// A range of the file.
    Range { offset: usize, len: usize },
}


#[derive(Clone, Debug)]
struct Entry {
    sym: ElfSym,
    /// The symbol's run-time address.
    addr: Addr,
}


/// A decoded symbol table of a module.
#[derive(Debug)]
pub(crate) struct Symtab {
    source: SymtabSource,
    elf: Rc<ElfParser>,
    strtab: Strtab,
    /// All symbols, including the null symbol at index zero.
    entries: Vec<Entry>,
    /// The index of the first non-local symbol.
    first_global: usize,
    /// The load bias of the file the symbols came from.
    bias: Addr,
}

impl Symtab {
    /// Load the symbol table for `module`.
    ///
    /// In order of preference, we use
    /// - the main file's `SHT_SYMTAB`
    /// - the debug file's `SHT_SYMTAB`
    /// - the main file's `SHT_DYNSYM`
    /// - the dynamic symbol table referenced by `PT_DYNAMIC`, if the
    ///   main file lacks section headers
    fn load(module: &mut Module, callbacks: &dyn Callbacks) -> Result<Self> {
        let main = module.ensure_elf(callbacks)?;
        let main_elf = Rc::clone(&main.elf);
        let main_bias = main.bias;

        if let Some(idx) = main_elf.find_section_by_type(SHT_SYMTAB)? {
            return Self::from_section(module, main_elf, main_bias, idx, SymtabSource::MainSymtab)
        }

        match module.ensure_debug(callbacks) {
            Ok(debug) => {
                let debug_elf = Rc::clone(&debug.elf);
                let debug_bias = debug.bias;
                if let Some(idx) = debug_elf.find_section_by_type(SHT_SYMTAB)? {
                    return Self::from_section(
                        module,
                        debug_elf,
                        debug_bias,
                        idx,
                        SymtabSource::DebugSymtab,
                    )
                }
            }
            Err(err) => {
                debug!("module `{}`: no separate debug information: {err}", module.name())
            }
        }

        if let Some(idx) = main_elf.find_section_by_type(SHT_DYNSYM)? {
            return Self::from_section(module, main_elf, main_bias, idx, SymtabSource::Dynsym)
        }

        if main_elf.shnum() == 0 {
            if let Some(symtab) = Self::from_dynamic(module, main_elf, main_bias)? {
                return Ok(symtab)
            }
        }

        Err(Error::new(
            ErrorKind::NoSymtab,
            format!("no symbol table found for module `{}`", module.name()),
        ))
    }

    fn resolve_addrs(module: &Module, syms: Vec<ElfSym>, bias: Addr) -> Vec<Entry> {
        syms.into_iter()
            .map(|sym| {
                let addr = if sym.st_shndx == SHN_UNDEF {
                    sym.st_value
                } else if module.e_type() == ET_REL {
                    relocate_value(module, sym.st_shndx, sym.st_value).unwrap_or(sym.st_value)
                } else {
                    sym.st_value.wrapping_add(bias)
                };
                Entry { sym, addr }
            })
            .collect()
    }

    fn from_section(
        module: &Module,
        elf: Rc<ElfParser>,
        bias: Addr,
        idx: usize,
        source: SymtabSource,
    ) -> Result<Self> {
        let shdr = elf.section_header(idx)?;
        let strtab = Strtab::Section(shdr.sh_link as usize);
        let first_global = shdr.sh_info as usize;
        let syms = elf.symbols(idx)?;
        debug!(
            "module `{}`: using {source:?} with {} symbols",
            module.name(),
            syms.len()
        );

        let entries = Self::resolve_addrs(module, syms, bias);
        let first_global = first_global.clamp(1, entries.len().max(1));
        Ok(Self {
            source,
            elf,
            strtab,
            entries,
            first_global,
            bias,
        })
    }

    /// Determine the number of dynamic symbols from a `DT_GNU_HASH`
    /// table.
    fn gnu_hash_count(data: &[u8], class: Class, elf: &ElfParser) -> Option<usize> {
        let endian = elf.endian();
        let mut data = data;
        let nbuckets = data.read_u32_e(endian)? as usize;
        let symoffset = data.read_u32_e(endian)? as usize;
        let bloom_size = data.read_u32_e(endian)? as usize;
        let _bloom_shift = data.read_u32_e(endian)?;
        let () = data.advance(bloom_size.checked_mul(class.word_size())?)?;

        let mut max_bucket = 0;
        for _ in 0..nbuckets {
            max_bucket = max_bucket.max(data.read_u32_e(endian)? as usize);
        }
        if max_bucket < symoffset {
            return Some(symoffset)
        }

        // Walk the chain of the last bucket to its end.
        let () = data.advance((max_bucket - symoffset).checked_mul(4)?)?;
        let mut idx = max_bucket;
        loop {
            let hash = data.read_u32_e(endian)?;
            if hash & 1 != 0 {
                break Some(idx + 1)
            }
            idx += 1;
        }
    }

    fn from_dynamic(module: &Module, elf: Rc<ElfParser>, bias: Addr) -> Result<Option<Self>> {
        let dynamic = elf.dynamic()?;
        let find = |tag| {
            dynamic
                .iter()
                .find(|dyn_| dyn_.d_tag == tag)
                .map(|dyn_| dyn_.d_val)
        };

        let (symtab, strtab, strsz) = match (find(DT_SYMTAB), find(DT_STRTAB), find(DT_STRSZ)) {
            (Some(symtab), Some(strtab), Some(strsz)) => (symtab, strtab, strsz),
            _ => return Ok(None),
        };
        let class = elf.class();
        let syment = find(DT_SYMENT).unwrap_or(class.sym_size() as u64) as usize;
        if syment < class.sym_size() {
            return Err(Error::with_invalid_data(format!(
                "DT_SYMENT ({syment}) is invalid"
            )))
        }

        let count = if let Some(hash) = find(DT_HASH) {
            let mut data = elf
                .vaddr_data(hash)?
                .ok_or_invalid_data(|| "DT_HASH is not mapped")?;
            let _nbucket = data.read_u32_e(elf.endian());
            data.read_u32_e(elf.endian())
                .ok_or_unexpected_eof(|| "DT_HASH is truncated")? as usize
        } else if let Some(hash) = find(DT_GNU_HASH) {
            let data = elf
                .vaddr_data(hash)?
                .ok_or_invalid_data(|| "DT_GNU_HASH is not mapped")?;
            Self::gnu_hash_count(data, class, &elf)
                .ok_or_unexpected_eof(|| "DT_GNU_HASH is truncated")?
        } else {
            debug!("module `{}`: dynamic symbol table has no hash table", module.name());
            return Ok(None)
        };

        let strtab_offset = elf
            .vaddr_to_offset(strtab)?
            .ok_or_invalid_data(|| "DT_STRTAB is not mapped")? as usize;
        let mut data = elf
            .vaddr_data(symtab)?
            .ok_or_invalid_data(|| "DT_SYMTAB is not mapped")?;

        let mut syms = Vec::with_capacity(count);
        for _ in 0..count {
            let mut entry = data
                .read_slice(syment)
                .ok_or_unexpected_eof(|| "dynamic symbol table is truncated")?;
            let sym = ElfSym::parse(&mut entry, class, elf.endian())
                .ok_or_unexpected_eof(|| "dynamic symbol is truncated")?;
            let () = syms.push(sym);
        }
        debug!(
            "module `{}`: using dynamic symbol table with {count} symbols",
            module.name()
        );

        let entries = Self::resolve_addrs(module, syms, bias);
        let symtab = Self {
            source: SymtabSource::Dynamic,
            elf,
            strtab: Strtab::Range {
                offset: strtab_offset,
                len: strsz as usize,
            },
            entries,
            first_global: 1,
            bias,
        };
        Ok(Some(symtab))
    }

    /// Where the symbols came from.
    #[inline]
    pub fn source(&self) -> SymtabSource {
        self.source
    }

    /// The number of symbols, including the null symbol.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn strtab(&self) -> Result<&[u8]> {
        match self.strtab {
            Strtab::Section(idx) => self.elf.section_data(idx),
            Strtab::Range { offset, len } => self
                .elf
                .data()
                .get(offset..)
                .and_then(|data| data.get(..len))
                .ok_or_unexpected_eof(|| "dynamic string table is out of bounds"),
        }
    }

    fn raw_name(&self, sym: &ElfSym) -> Result<&[u8]> {
        let name = self
            .strtab()?
            .get(sym.st_name as usize..)
            .and_then(|mut data| data.read_cstr())
            .ok_or_invalid_data(|| format!("symbol name offset {} is invalid", sym.st_name))?;
        Ok(name.to_bytes())
    }

    fn make_sym(&self, index: usize) -> Result<Sym<'_>> {
        let entry = self
            .entries
            .get(index)
            .ok_or_invalid_input(|| format!("symbol index {index} is out of bounds"))?;
        let name = String::from_utf8_lossy(self.raw_name(&entry.sym)?);
        Ok(Sym {
            name,
            addr: entry.addr,
            size: entry.sym.st_size,
            type_: entry.sym.type_(),
            bind: entry.sym.bind(),
            shndx: entry.sym.st_shndx,
            index,
        })
    }

    /// Retrieve the symbol at `index`.
    pub fn sym(&self, index: usize) -> Result<Sym<'_>> {
        self.make_sym(index)
    }

    fn is_eligible(&self, entry: &Entry, addr: Addr) -> bool {
        let sym = &entry.sym;
        if sym.st_name == 0 || sym.st_shndx == SHN_UNDEF || entry.addr > addr {
            return false
        }
        if matches!(sym.type_(), STT_SECTION | STT_FILE | STT_TLS) {
            return false
        }
        matches!(self.raw_name(sym), Ok(name) if !name.is_empty())
    }

    /// Find the index of the symbol best describing `addr`.
    ///
    /// `addr_shndx` is the index of the section containing `addr`, if
    /// known; labels (symbols without size) outside of it are not
    /// considered.
    fn find_addr(&self, addr: Addr, addr_shndx: Option<usize>) -> Option<usize> {
        let better = |candidate: &Entry, best: Option<&Entry>, compare_size: bool| -> bool {
            let best = if let Some(best) = best {
                best
            } else {
                return true
            };
            if candidate.addr != best.addr {
                return candidate.addr > best.addr
            }
            let (rank, best_rank) = (binding_rank(candidate.sym.bind()), binding_rank(best.sym.bind()));
            if rank != best_rank {
                return rank > best_rank
            }
            compare_size && candidate.sym.st_size < best.sym.st_size
        };

        let mut sized = None::<usize>;
        let mut sizeless = None::<usize>;
        let mut min_label = 0;

        let globals = self.first_global..self.entries.len();
        let locals = 1..self.first_global.min(self.entries.len());
        for idx in globals.chain(locals) {
            let entry = &self.entries[idx];
            if !self.is_eligible(entry, addr) {
                continue
            }

            let size = entry.sym.st_size;
            let end = entry.addr.wrapping_add(size);
            min_label = min_label.max(end);

            if size > 0 {
                if addr < end && better(entry, sized.map(|idx| &self.entries[idx]), true) {
                    sized = Some(idx);
                }
            } else {
                let shndx = entry.sym.st_shndx;
                let same_section = match addr_shndx {
                    Some(addr_shndx) if shndx != SHN_ABS && shndx < SHN_LORESERVE => {
                        usize::from(shndx) == addr_shndx
                    }
                    _ => true,
                };
                if same_section && better(entry, sizeless.map(|idx| &self.entries[idx]), false) {
                    sizeless = Some(idx);
                }
            }
        }

        sized.or_else(|| sizeless.filter(|idx| self.entries[*idx].addr >= min_label))
    }

    /// Find the symbol best describing `addr`, i.e., the closest
    /// symbol at or below it.
    pub fn addrsym(&self, module: &Module, addr: Addr) -> Result<Option<Sym<'_>>> {
        // Index zero stands for "no section", which no eligible symbol
        // can be defined in.
        let addr_shndx = if module.e_type() == ET_REL {
            Some(
                module
                    .sections
                    .as_ref()
                    .and_then(|table| table.find(addr))
                    .map(|record| record.shndx)
                    .unwrap_or(0),
            )
        } else if self.elf.shnum() > 0 {
            Some(section_containing(&self.elf, self.bias, addr)?.unwrap_or(0))
        } else {
            None
        };

        self.find_addr(addr, addr_shndx)
            .map(|idx| self.make_sym(idx))
            .transpose()
    }
}


/// Make sure that the symbol table of `module` is loaded, caching
/// failure.
pub(crate) fn ensure_symtab<'module>(
    module: &'module mut Module,
    callbacks: &dyn Callbacks,
) -> Result<&'module Symtab> {
    if module.symtab.is_none() {
        let mut slot = module.failures.symtab;
        let result = cached(&mut slot, || Symtab::load(module, callbacks));
        module.failures.symtab = slot;
        module.symtab = Some(result?);
    }
    // SANITY: We either had a symbol table or just loaded one.
    Ok(module.symtab.as_ref().unwrap())
}
