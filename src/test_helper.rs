//! Helpers for synthesizing ELF images in memory.
//!
//! The produced images are laid out the way a linker would do it: the
//! first `PT_LOAD` segment starts at file offset zero and covers the
//! ELF and program headers, followed by user data and generated
//! content such as notes and dynamic linking information. Core files
//! (`ET_CORE`) are the exception, their segments contain user data
//! only.

use crate::elf::types::Class;
use crate::elf::types::DT_DEBUG;
use crate::elf::types::DT_GNU_HASH;
use crate::elf::types::DT_HASH;
use crate::elf::types::DT_NULL;
use crate::elf::types::DT_SONAME;
use crate::elf::types::DT_STRSZ;
use crate::elf::types::DT_STRTAB;
use crate::elf::types::DT_SYMENT;
use crate::elf::types::DT_SYMTAB;
use crate::elf::types::ELFCLASS32;
use crate::elf::types::ELFCLASS64;
use crate::elf::types::ELFDATA2LSB;
use crate::elf::types::ELFDATA2MSB;
use crate::elf::types::ET_CORE;
use crate::elf::types::NT_GNU_BUILD_ID;
use crate::elf::types::PF_R;
use crate::elf::types::PF_W;
use crate::elf::types::PF_X;
use crate::elf::types::PT_DYNAMIC;
use crate::elf::types::PT_LOAD;
use crate::elf::types::PT_NOTE;
use crate::elf::types::PT_PHDR;
use crate::elf::types::SHF_ALLOC;
#[cfg(feature = "zlib")]
use crate::elf::types::SHF_COMPRESSED;
use crate::elf::types::SHN_ABS;
use crate::elf::types::SHN_UNDEF;
use crate::elf::types::SHT_DYNAMIC;
use crate::elf::types::SHT_DYNSYM;
use crate::elf::types::SHT_HASH;
use crate::elf::types::SHT_NOBITS;
use crate::elf::types::SHT_NOTE;
use crate::elf::types::SHT_PROGBITS;
use crate::elf::types::SHT_RELA;
use crate::elf::types::SHT_STRTAB;
use crate::elf::types::SHT_SYMTAB;
use crate::elf::types::STB_GLOBAL;
use crate::elf::types::STB_LOCAL;
use crate::elf::types::STT_NOTYPE;
use crate::util::Endian;
use crate::Addr;


/// A byte buffer with class and byte order aware writers.
#[derive(Debug)]
struct Writer {
    buf: Vec<u8>,
    class: Class,
    endian: Endian,
}

impl Writer {
    fn new(class: Class, endian: Endian) -> Self {
        Self {
            buf: Vec::new(),
            class,
            endian,
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn bytes(&mut self, data: &[u8]) {
        let () = self.buf.extend_from_slice(data);
    }

    fn u8(&mut self, value: u8) {
        let () = self.buf.push(value);
    }

    fn u16(&mut self, value: u16) {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.bytes(&bytes)
    }

    fn u32(&mut self, value: u32) {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.bytes(&bytes)
    }

    fn u64(&mut self, value: u64) {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.bytes(&bytes)
    }

    /// Write an address sized value.
    fn word(&mut self, value: u64) {
        match self.class {
            Class::Elf32 => self.u32(value as u32),
            Class::Elf64 => self.u64(value),
        }
    }

    fn pad_to(&mut self, offset: usize) {
        assert!(offset >= self.buf.len(), "{offset} < {}", self.buf.len());
        let () = self.buf.resize(offset, 0);
    }

    fn align(&mut self, align: usize) {
        let align = align.max(1);
        let offset = self.buf.len().next_multiple_of(align);
        self.pad_to(offset)
    }
}


/// A builder for a sequence of ELF notes.
#[derive(Debug)]
pub struct NoteBuilder {
    writer: Writer,
}

impl NoteBuilder {
    /// Create a new builder producing notes in the given byte order.
    pub fn new(endian: Endian) -> Self {
        Self {
            writer: Writer::new(Class::Elf64, endian),
        }
    }

    /// Append a note. `name` is NUL terminated automatically.
    pub fn note(mut self, name: &[u8], n_type: u32, desc: &[u8]) -> Self {
        let () = self.writer.u32(name.len() as u32 + 1);
        let () = self.writer.u32(desc.len() as u32);
        let () = self.writer.u32(n_type);
        let () = self.writer.bytes(name);
        let () = self.writer.u8(0);
        let () = self.writer.align(4);
        let () = self.writer.bytes(desc);
        let () = self.writer.align(4);
        self
    }

    /// Retrieve the raw note data.
    pub fn build(self) -> Vec<u8> {
        self.writer.buf
    }
}


/// The description of a section to include in a synthesized image.
#[derive(Clone, Debug)]
pub struct SectionSpec {
    name: String,
    sh_type: u32,
    flags: u64,
    addr: Addr,
    addralign: u64,
    data: Vec<u8>,
    compressed: bool,
}

impl SectionSpec {
    /// Create a new section description.
    pub fn new(name: &str, sh_type: u32) -> Self {
        Self {
            name: name.to_string(),
            sh_type,
            flags: 0,
            addr: 0,
            addralign: 1,
            data: Vec::new(),
            compressed: false,
        }
    }

    /// Set the section's flags.
    pub fn flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    /// Set the section's (link-time) address.
    pub fn addr(mut self, addr: Addr) -> Self {
        self.addr = addr;
        self
    }

    /// Set the section's alignment.
    pub fn align(mut self, align: u64) -> Self {
        self.addralign = align;
        self
    }

    /// Set the section contents. For `SHT_NOBITS` sections only the
    /// length is used.
    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Store the section contents zlib compressed.
    #[cfg(feature = "zlib")]
    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }
}


/// The description of a program header to include in a synthesized
/// image.
#[derive(Clone, Debug)]
pub struct SegmentSpec {
    p_type: u32,
    flags: u32,
    vaddr: Addr,
    align: u64,
    data: Vec<u8>,
    memsz: Option<u64>,
}

impl SegmentSpec {
    /// Create a `PT_LOAD` segment at `vaddr`.
    pub fn load(vaddr: Addr, align: u64) -> Self {
        Self {
            p_type: PT_LOAD,
            flags: PF_R | PF_X,
            vaddr,
            align,
            data: Vec::new(),
            memsz: None,
        }
    }

    /// Create a `PT_NOTE` segment containing raw note data. It is not
    /// part of any loadable segment.
    pub fn note(data: Vec<u8>) -> Self {
        Self {
            p_type: PT_NOTE,
            flags: PF_R,
            vaddr: 0,
            align: 4,
            data,
            memsz: None,
        }
    }

    /// Set the segment's contents.
    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Set the size of the segment in memory, if larger than its data.
    pub fn memsz(mut self, memsz: u64) -> Self {
        self.memsz = Some(memsz);
        self
    }

    /// Make the segment writable.
    pub fn writable(mut self) -> Self {
        self.flags |= PF_W;
        self
    }
}


#[derive(Clone, Debug)]
enum SymSection {
    Abs,
    Undef,
    Named(String),
}

/// The description of a symbol to include in a synthesized image.
#[derive(Clone, Debug)]
pub struct SymbolSpec {
    name: String,
    value: u64,
    size: u64,
    bind: u8,
    type_: u8,
    section: SymSection,
}

impl SymbolSpec {
    /// Create an absolute, global, untyped symbol.
    pub fn new(name: &str, value: u64, size: u64) -> Self {
        Self {
            name: name.to_string(),
            value,
            size,
            bind: STB_GLOBAL,
            type_: STT_NOTYPE,
            section: SymSection::Abs,
        }
    }

    /// Set the symbol's binding and type.
    pub fn info(mut self, bind: u8, type_: u8) -> Self {
        self.bind = bind;
        self.type_ = type_;
        self
    }

    /// Associate the symbol with the named section.
    pub fn section(mut self, name: &str) -> Self {
        self.section = SymSection::Named(name.to_string());
        self
    }

    /// Mark the symbol as undefined.
    pub fn undefined(mut self) -> Self {
        self.section = SymSection::Undef;
        self
    }
}


#[derive(Clone, Debug)]
struct RelaSpec {
    target: String,
    offset: u64,
    sym: u32,
    addend: i64,
}


/// The hash table flavor to emit for dynamic symbols.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HashStyle {
    Sysv,
    Gnu,
}


/// A piece of generated content placed into the first loadable
/// segment.
#[derive(Debug)]
struct Blob {
    name: &'static str,
    sh_type: u32,
    data: Vec<u8>,
    link: Option<&'static str>,
    entsize: u64,
    align: usize,
    offset: usize,
    vaddr: Addr,
}


/// A builder for synthetic ELF images.
#[derive(Clone, Debug)]
pub struct ElfBuilder {
    e_type: u16,
    class: Class,
    endian: Endian,
    entry: Addr,
    sections: Vec<SectionSpec>,
    segments: Vec<SegmentSpec>,
    symbols: Vec<SymbolSpec>,
    dynsyms: Vec<SymbolSpec>,
    relas: Vec<RelaSpec>,
    build_id: Option<Vec<u8>>,
    soname: Option<String>,
    debuglink: Option<(String, u32)>,
    dt_debug: Option<Addr>,
    hash_style: HashStyle,
    phdr_segment: bool,
    section_headers: bool,
}

impl ElfBuilder {
    /// Create a new builder for an ELF64 little endian image of the
    /// given type.
    pub fn new(e_type: u16) -> Self {
        Self {
            e_type,
            class: Class::Elf64,
            endian: Endian::Little,
            entry: 0,
            sections: Vec::new(),
            segments: Vec::new(),
            symbols: Vec::new(),
            dynsyms: Vec::new(),
            relas: Vec::new(),
            build_id: None,
            soname: None,
            debuglink: None,
            dt_debug: None,
            hash_style: HashStyle::Sysv,
            phdr_segment: false,
            section_headers: true,
        }
    }

    /// Set the ELF class.
    pub fn class(mut self, class: Class) -> Self {
        self.class = class;
        self
    }

    /// Set the byte order.
    pub fn endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Set the entry point.
    pub fn entry(mut self, entry: Addr) -> Self {
        self.entry = entry;
        self
    }

    /// Add a section.
    pub fn section(mut self, section: SectionSpec) -> Self {
        let () = self.sections.push(section);
        self
    }

    /// Add a segment.
    pub fn segment(mut self, segment: SegmentSpec) -> Self {
        let () = self.segments.push(segment);
        self
    }

    /// Add a symbol to `.symtab`.
    pub fn symbol(mut self, symbol: SymbolSpec) -> Self {
        let () = self.symbols.push(symbol);
        self
    }

    /// Add a symbol to `.dynsym`.
    pub fn dynsym(mut self, symbol: SymbolSpec) -> Self {
        let () = self.dynsyms.push(symbol);
        self
    }

    /// Add a relocation with explicit addend against section `target`.
    /// `sym` is the index into `.symtab`, where 0 is the null symbol.
    pub fn rela(mut self, target: &str, offset: u64, sym: u32, addend: i64) -> Self {
        let () = self.relas.push(RelaSpec {
            target: target.to_string(),
            offset,
            sym,
            addend,
        });
        self
    }

    /// Embed a GNU build ID note.
    pub fn build_id(mut self, build_id: &[u8]) -> Self {
        self.build_id = Some(build_id.to_vec());
        self
    }

    /// Set `DT_SONAME`.
    pub fn soname(mut self, soname: &str) -> Self {
        self.soname = Some(soname.to_string());
        self
    }

    /// Add a `.gnu_debuglink` section.
    pub fn debuglink(mut self, name: &str, crc: u32) -> Self {
        self.debuglink = Some((name.to_string(), crc));
        self
    }

    /// Add a `DT_DEBUG` entry with the given value.
    pub fn dt_debug(mut self, value: Addr) -> Self {
        self.dt_debug = Some(value);
        self
    }

    /// Emit `DT_GNU_HASH` instead of `DT_HASH`.
    pub fn gnu_hash(mut self) -> Self {
        self.hash_style = HashStyle::Gnu;
        self
    }

    /// Emit a `PT_PHDR` program header.
    pub fn phdr_segment(mut self) -> Self {
        self.phdr_segment = true;
        self
    }

    /// Do not emit section headers.
    pub fn strip_section_headers(mut self) -> Self {
        self.section_headers = false;
        self
    }

    fn needs_dynamic(&self) -> bool {
        self.soname.is_some() || !self.dynsyms.is_empty() || self.dt_debug.is_some()
    }

    fn sym_bytes(&self, syms: &[SymbolSpec], strtab: &mut Vec<u8>, shndx: &dyn Fn(&SymSection) -> u16) -> Vec<u8> {
        let mut w = Writer::new(self.class, self.endian);
        // The null symbol.
        let () = w.pad_to(self.class.sym_size());

        for sym in syms {
            let name = if sym.name.is_empty() {
                0
            } else {
                let offset = strtab.len() as u32;
                let () = strtab.extend_from_slice(sym.name.as_bytes());
                let () = strtab.push(0);
                offset
            };
            let info = (sym.bind << 4) | (sym.type_ & 0xf);
            let shndx = shndx(&sym.section);

            match self.class {
                Class::Elf32 => {
                    let () = w.u32(name);
                    let () = w.u32(sym.value as u32);
                    let () = w.u32(sym.size as u32);
                    let () = w.u8(info);
                    let () = w.u8(0);
                    let () = w.u16(shndx);
                }
                Class::Elf64 => {
                    let () = w.u32(name);
                    let () = w.u8(info);
                    let () = w.u8(0);
                    let () = w.u16(shndx);
                    let () = w.u64(sym.value);
                    let () = w.u64(sym.size);
                }
            }
        }
        w.buf
    }

    fn hash_bytes(&self, nsyms: usize) -> Vec<u8> {
        let mut w = Writer::new(self.class, self.endian);
        match self.hash_style {
            HashStyle::Sysv => {
                // One bucket pointing at the last symbol, chaining all
                // the way back down.
                let () = w.u32(1);
                let () = w.u32(nsyms as u32);
                let () = w.u32(nsyms.saturating_sub(1) as u32);
                for i in 0..nsyms {
                    let () = w.u32(i.saturating_sub(1) as u32);
                }
            }
            HashStyle::Gnu => {
                let symoffset = 1u32;
                let () = w.u32(1);
                let () = w.u32(symoffset);
                let () = w.u32(1);
                let () = w.u32(0);
                let () = w.word(u64::MAX);
                let () = w.u32(if nsyms > 1 { symoffset } else { 0 });
                for i in 1..nsyms {
                    let last = i == nsyms - 1;
                    let () = w.u32(if last { 1 } else { 0 });
                }
            }
        }
        w.buf
    }

    fn dynamic_bytes(&self, entries: &[(i64, u64)]) -> Vec<u8> {
        let mut w = Writer::new(self.class, self.endian);
        for (tag, value) in entries.iter().chain([(DT_NULL, 0)].iter()) {
            let () = w.word(*tag as u64);
            let () = w.word(*value);
        }
        w.buf
    }

    fn dynamic_entry_count(&self) -> usize {
        // DT_HASH/DT_GNU_HASH, DT_STRTAB, DT_SYMTAB, DT_STRSZ, DT_SYMENT
        5 + usize::from(self.soname.is_some()) + usize::from(self.dt_debug.is_some())
    }

    /// Create the generated content destined for the first loadable
    /// segment, without addresses assigned.
    fn blobs(&self) -> Vec<Blob> {
        let mut blobs = Vec::new();
        let blob = |name, sh_type, data, link, entsize, align| Blob {
            name,
            sh_type,
            data,
            link,
            entsize,
            align,
            offset: 0,
            vaddr: 0,
        };

        if let Some(build_id) = &self.build_id {
            let data = NoteBuilder::new(self.endian)
                .note(b"GNU", NT_GNU_BUILD_ID, build_id)
                .build();
            let () = blobs.push(blob(".note.gnu.build-id", SHT_NOTE, data, None, 0, 4));
        }

        if self.needs_dynamic() {
            let mut dynstr = vec![0];
            if let Some(soname) = &self.soname {
                let () = dynstr.extend_from_slice(soname.as_bytes());
                let () = dynstr.push(0);
            }
            // Dynamic symbols are all absolute.
            let dynsym = self.sym_bytes(&self.dynsyms, &mut dynstr, &|section| match section {
                SymSection::Undef => SHN_UNDEF,
                _ => SHN_ABS,
            });
            let hash = self.hash_bytes(self.dynsyms.len() + 1);
            let (hash_name, hash_type) = match self.hash_style {
                HashStyle::Sysv => (".hash", SHT_HASH),
                HashStyle::Gnu => (".gnu.hash", 0x6fff_fff6),
            };
            let dyn_size = (self.dynamic_entry_count() + 1) * self.class.dyn_size();
            let sym_size = self.class.sym_size() as u64;

            let () = blobs.push(blob(".dynsym", SHT_DYNSYM, dynsym, Some(".dynstr"), sym_size, 8));
            let () = blobs.push(blob(".dynstr", SHT_STRTAB, dynstr, None, 0, 1));
            let () = blobs.push(blob(hash_name, hash_type, hash, Some(".dynsym"), 4, 8));
            let () = blobs.push(blob(
                ".dynamic",
                SHT_DYNAMIC,
                vec![0; dyn_size],
                Some(".dynstr"),
                self.class.dyn_size() as u64,
                8,
            ));
        }
        blobs
    }

    /// Fill in the `.dynamic` blob, now that addresses are known.
    fn finalize_dynamic(&self, blobs: &mut [Blob]) {
        fn find(blobs: &[Blob], name: &str) -> Option<usize> {
            blobs.iter().position(|blob| blob.name == name)
        }

        let dynamic = if let Some(idx) = find(blobs, ".dynamic") {
            idx
        } else {
            return
        };

        // SANITY: All of these get created alongside `.dynamic`.
        let dynsym = &blobs[find(blobs, ".dynsym").unwrap()];
        let dynstr = &blobs[find(blobs, ".dynstr").unwrap()];
        let (hash_tag, hash) = match self.hash_style {
            HashStyle::Sysv => (DT_HASH, &blobs[find(blobs, ".hash").unwrap()]),
            HashStyle::Gnu => (DT_GNU_HASH, &blobs[find(blobs, ".gnu.hash").unwrap()]),
        };

        let mut entries = vec![
            (hash_tag, hash.vaddr),
            (DT_STRTAB, dynstr.vaddr),
            (DT_SYMTAB, dynsym.vaddr),
            (DT_STRSZ, dynstr.data.len() as u64),
            (DT_SYMENT, self.class.sym_size() as u64),
        ];
        if self.soname.is_some() {
            let () = entries.push((DT_SONAME, 1));
        }
        if let Some(value) = self.dt_debug {
            let () = entries.push((DT_DEBUG, value));
        }
        let data = self.dynamic_bytes(&entries);
        blobs[dynamic].data = data;
    }

    /// Produce the ELF image.
    pub fn build(self) -> Vec<u8> {
        let class = self.class;
        let endian = self.endian;
        let is_core = self.e_type == ET_CORE;

        let loads = self
            .segments
            .iter()
            .filter(|segment| segment.p_type == PT_LOAD)
            .collect::<Vec<_>>();
        let others = self
            .segments
            .iter()
            .filter(|segment| segment.p_type != PT_LOAD)
            .collect::<Vec<_>>();
        let has_loads = !loads.is_empty();

        let mut blobs = self.blobs();
        let has_note = blobs.iter().any(|blob| blob.sh_type == SHT_NOTE) && has_loads;
        let has_dynamic = self.needs_dynamic() && has_loads;

        let phnum = usize::from(self.phdr_segment && has_loads)
            + loads.len()
            + usize::from(has_dynamic)
            + usize::from(has_note)
            + others.len();
        let phoff = if phnum > 0 { class.ehdr_size() } else { 0 };
        let headers_len = class.ehdr_size() + phnum * class.phdr_size();

        let mut w = Writer::new(class, endian);
        let () = w.pad_to(headers_len);

        // Phdrs as (type, flags, offset, vaddr, filesz, memsz, align).
        let mut phdrs = Vec::<(u32, u32, u64, u64, u64, u64, u64)>::new();
        // Offset and address of user data for each loadable segment.
        let mut load_data = Vec::new();

        for (i, load) in loads.iter().enumerate() {
            let align = load.align.max(1) as usize;
            if i == 0 && !is_core {
                let () = w.align(16);
                let data_offset = w.len();
                let () = w.bytes(&load.data);
                let () = load_data.push((data_offset, load.vaddr + data_offset as u64));

                for blob in blobs.iter_mut() {
                    let () = w.align(blob.align);
                    blob.offset = w.len();
                    blob.vaddr = load.vaddr + blob.offset as u64;
                    let () = w.pad_to(blob.offset + blob.data.len());
                }
                let filesz = w.len() as u64;
                let extra = load
                    .memsz
                    .map(|memsz| memsz.saturating_sub(load.data.len() as u64))
                    .unwrap_or(0);
                let () = phdrs.push((
                    PT_LOAD,
                    load.flags,
                    0,
                    load.vaddr,
                    filesz,
                    filesz + extra,
                    load.align,
                ));
            } else {
                let offset = w.len();
                let modulo = (load.vaddr as usize) % align;
                let mut start = offset - offset % align + modulo;
                if start < offset {
                    start += align;
                }
                let () = w.pad_to(start);
                let () = w.bytes(&load.data);
                let () = load_data.push((start, load.vaddr));

                let filesz = load.data.len() as u64;
                let memsz = load.memsz.unwrap_or(filesz).max(filesz);
                let () = phdrs.push((
                    PT_LOAD,
                    load.flags,
                    start as u64,
                    load.vaddr,
                    filesz,
                    memsz,
                    load.align,
                ));
            }
        }

        // Without a loadable segment headers are not mapped and
        // generated content lives outside of any segment.
        if !has_loads || is_core {
            for blob in blobs.iter_mut() {
                let () = w.align(blob.align);
                blob.offset = w.len();
                blob.vaddr = 0;
                let () = w.pad_to(blob.offset + blob.data.len());
            }
        }

        let () = self.finalize_dynamic(&mut blobs);
        for blob in &blobs {
            let end = blob.offset + blob.data.len();
            let () = w.buf[blob.offset..end].copy_from_slice(&blob.data);
        }

        if has_dynamic {
            // SANITY: `has_dynamic` implies a `.dynamic` blob.
            let blob = blobs.iter().find(|blob| blob.name == ".dynamic").unwrap();
            let size = blob.data.len() as u64;
            let () = phdrs.push((
                PT_DYNAMIC,
                PF_R | PF_W,
                blob.offset as u64,
                blob.vaddr,
                size,
                size,
                8,
            ));
        }
        if has_note {
            // SANITY: `has_note` implies a note blob.
            let blob = blobs.iter().find(|blob| blob.sh_type == SHT_NOTE).unwrap();
            let size = blob.data.len() as u64;
            let () = phdrs.push((PT_NOTE, PF_R, blob.offset as u64, blob.vaddr, size, size, 4));
        }
        for other in &others {
            let () = w.align(other.align.max(1) as usize);
            let offset = w.len() as u64;
            let () = w.bytes(&other.data);
            let size = other.data.len() as u64;
            let () = phdrs.push((other.p_type, other.flags, offset, other.vaddr, size, size, other.align));
        }
        if self.phdr_segment && has_loads {
            let vaddr = loads[0].vaddr + phoff as u64;
            let size = (phnum * class.phdr_size()) as u64;
            let () = phdrs.insert(0, (PT_PHDR, PF_R, phoff as u64, vaddr, size, size, 8));
        }
        debug_assert_eq!(phdrs.len(), phnum);

        // Now for sections. Index 0 is the null section.
        struct Out {
            name: String,
            sh_type: u32,
            flags: u64,
            addr: u64,
            offset: u64,
            size: u64,
            link: u32,
            info: u32,
            addralign: u64,
            entsize: u64,
        }

        let mut names = vec![
            self.sections
                .iter()
                .map(|section| section.name.clone())
                .collect::<Vec<_>>(),
            blobs
                .iter()
                .map(|blob| blob.name.to_string())
                .collect::<Vec<_>>(),
        ]
        .concat();
        let has_symtab = !self.symbols.is_empty();
        if has_symtab {
            let () = names.push(".symtab".to_string());
            let () = names.push(".strtab".to_string());
        }
        let rela_targets = self
            .relas
            .iter()
            .map(|rela| rela.target.clone())
            .fold(Vec::<String>::new(), |mut targets, target| {
                if !targets.contains(&target) {
                    let () = targets.push(target);
                }
                targets
            });
        for target in &rela_targets {
            let () = names.push(format!(".rela{target}"));
        }
        if self.debuglink.is_some() {
            let () = names.push(".gnu_debuglink".to_string());
        }
        let () = names.push(".shstrtab".to_string());

        let index_of = |name: &str| -> u32 {
            names
                .iter()
                .position(|n| n == name)
                .map(|idx| idx as u32 + 1)
                .unwrap_or(0)
        };
        let shndx = |section: &SymSection| -> u16 {
            match section {
                SymSection::Abs => SHN_ABS,
                SymSection::Undef => SHN_UNDEF,
                SymSection::Named(name) => index_of(name) as u16,
            }
        };

        let mut out = Vec::<Out>::new();
        for section in &self.sections {
            #[cfg(feature = "zlib")]
            let (data, flags) = if section.compressed {
                let mut chdr = Writer::new(class, endian);
                let () = chdr.u32(crate::elf::types::ELFCOMPRESS_ZLIB);
                if class.is_64() {
                    let () = chdr.u32(0);
                }
                let () = chdr.word(section.data.len() as u64);
                let () = chdr.word(section.addralign);
                let () = chdr.bytes(&miniz_oxide::deflate::compress_to_vec_zlib(&section.data, 6));
                (chdr.buf, section.flags | SHF_COMPRESSED)
            } else {
                (section.data.clone(), section.flags)
            };
            #[cfg(not(feature = "zlib"))]
            let (data, flags) = {
                let _compressed = section.compressed;
                (section.data.clone(), section.flags)
            };

            let () = w.align(section.addralign as usize);
            let offset = w.len() as u64;
            if section.sh_type != SHT_NOBITS {
                let () = w.bytes(&data);
            }
            let () = out.push(Out {
                name: section.name.clone(),
                sh_type: section.sh_type,
                flags,
                addr: section.addr,
                offset,
                size: data.len() as u64,
                link: 0,
                info: 0,
                addralign: section.addralign,
                entsize: 0,
            });
        }
        for blob in &blobs {
            let () = out.push(Out {
                name: blob.name.to_string(),
                sh_type: blob.sh_type,
                flags: if blob.vaddr != 0 { SHF_ALLOC } else { 0 },
                addr: blob.vaddr,
                offset: blob.offset as u64,
                size: blob.data.len() as u64,
                link: blob.link.map(index_of).unwrap_or(0),
                info: 0,
                addralign: blob.align as u64,
                entsize: blob.entsize,
            });
        }
        if has_symtab {
            let mut strtab = vec![0];
            let symtab = self.sym_bytes(&self.symbols, &mut strtab, &shndx);
            let locals = self
                .symbols
                .iter()
                .take_while(|sym| sym.bind == STB_LOCAL)
                .count();

            let () = w.align(8);
            let offset = w.len() as u64;
            let () = w.bytes(&symtab);
            let () = out.push(Out {
                name: ".symtab".to_string(),
                sh_type: SHT_SYMTAB,
                flags: 0,
                addr: 0,
                offset,
                size: symtab.len() as u64,
                link: index_of(".strtab"),
                info: locals as u32 + 1,
                addralign: 8,
                entsize: class.sym_size() as u64,
            });

            let offset = w.len() as u64;
            let () = w.bytes(&strtab);
            let () = out.push(Out {
                name: ".strtab".to_string(),
                sh_type: SHT_STRTAB,
                flags: 0,
                addr: 0,
                offset,
                size: strtab.len() as u64,
                link: 0,
                info: 0,
                addralign: 1,
                entsize: 0,
            });
        }
        for target in &rela_targets {
            let mut rela = Writer::new(class, endian);
            for spec in self.relas.iter().filter(|rela| &rela.target == target) {
                let () = rela.word(spec.offset);
                // Use the architecture's "absolute address" relocation
                // type; it is not interpreted.
                match class {
                    Class::Elf32 => rela.u32((spec.sym << 8) | 1),
                    Class::Elf64 => rela.u64((u64::from(spec.sym) << 32) | 1),
                }
                let () = rela.word(spec.addend as u64);
            }

            let () = w.align(8);
            let offset = w.len() as u64;
            let () = w.bytes(&rela.buf);
            let () = out.push(Out {
                name: format!(".rela{target}"),
                sh_type: SHT_RELA,
                flags: 0,
                addr: 0,
                offset,
                size: rela.buf.len() as u64,
                link: index_of(".symtab"),
                info: index_of(target),
                addralign: 8,
                entsize: class.rel_size(true) as u64,
            });
        }
        if let Some((name, crc)) = &self.debuglink {
            let mut link = Writer::new(class, endian);
            let () = link.bytes(name.as_bytes());
            let () = link.u8(0);
            let () = link.align(4);
            let () = link.u32(*crc);

            let () = w.align(4);
            let offset = w.len() as u64;
            let () = w.bytes(&link.buf);
            let () = out.push(Out {
                name: ".gnu_debuglink".to_string(),
                sh_type: SHT_PROGBITS,
                flags: 0,
                addr: 0,
                offset,
                size: link.buf.len() as u64,
                link: 0,
                info: 0,
                addralign: 4,
                entsize: 0,
            });
        }

        let mut shstrtab = vec![0];
        let name_offsets = out
            .iter()
            .map(|section| section.name.as_str())
            .chain([".shstrtab"])
            .map(|name| {
                let offset = shstrtab.len() as u32;
                let () = shstrtab.extend_from_slice(name.as_bytes());
                let () = shstrtab.push(0);
                offset
            })
            .collect::<Vec<_>>();
        let offset = w.len() as u64;
        let () = w.bytes(&shstrtab);
        let () = out.push(Out {
            name: ".shstrtab".to_string(),
            sh_type: SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset,
            size: shstrtab.len() as u64,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        });

        let (shoff, shnum, shstrndx) = if self.section_headers {
            let () = w.align(8);
            let shoff = w.len();
            // The null section header.
            let () = w.pad_to(shoff + class.shdr_size());
            for (section, name) in out.iter().zip(name_offsets.iter()) {
                let () = w.u32(*name);
                let () = w.u32(section.sh_type);
                let () = w.word(section.flags);
                let () = w.word(section.addr);
                let () = w.word(section.offset);
                let () = w.word(section.size);
                let () = w.u32(section.link);
                let () = w.u32(section.info);
                let () = w.word(section.addralign);
                let () = w.word(section.entsize);
            }
            (shoff as u64, out.len() as u16 + 1, out.len() as u16)
        } else {
            (0, 0, 0)
        };

        // Finally, go back and write the headers.
        let mut hdr = Writer::new(class, endian);
        let () = hdr.bytes(b"\x7fELF");
        let () = hdr.u8(if class.is_64() { ELFCLASS64 } else { ELFCLASS32 });
        let () = hdr.u8(match endian {
            Endian::Little => ELFDATA2LSB,
            Endian::Big => ELFDATA2MSB,
        });
        let () = hdr.u8(1);
        let () = hdr.pad_to(16);
        let () = hdr.u16(self.e_type);
        let () = hdr.u16(if class.is_64() { 62 } else { 3 });
        let () = hdr.u32(1);
        let () = hdr.word(self.entry);
        let () = hdr.word(phoff as u64);
        let () = hdr.word(shoff);
        let () = hdr.u32(0);
        let () = hdr.u16(class.ehdr_size() as u16);
        let () = hdr.u16(class.phdr_size() as u16);
        let () = hdr.u16(phnum as u16);
        let () = hdr.u16(class.shdr_size() as u16);
        let () = hdr.u16(shnum);
        let () = hdr.u16(shstrndx);

        for (p_type, flags, offset, vaddr, filesz, memsz, align) in phdrs {
            let () = hdr.u32(p_type);
            match class {
                Class::Elf32 => {
                    let () = hdr.u32(offset as u32);
                    let () = hdr.u32(vaddr as u32);
                    let () = hdr.u32(vaddr as u32);
                    let () = hdr.u32(filesz as u32);
                    let () = hdr.u32(memsz as u32);
                    let () = hdr.u32(flags);
                    let () = hdr.u32(align as u32);
                }
                Class::Elf64 => {
                    let () = hdr.u32(flags);
                    let () = hdr.u64(offset);
                    let () = hdr.u64(vaddr);
                    let () = hdr.u64(vaddr);
                    let () = hdr.u64(filesz);
                    let () = hdr.u64(memsz);
                    let () = hdr.u64(align);
                }
            }
        }
        debug_assert_eq!(hdr.len(), headers_len);
        let () = w.buf[..headers_len].copy_from_slice(&hdr.buf);
        w.buf
    }
}


/// Create a core file image consisting of the provided loadable
/// segments, plus a `PT_NOTE` segment holding `notes`, if non-empty.
pub fn core_image(segments: Vec<SegmentSpec>, notes: Vec<u8>) -> Vec<u8> {
    let mut builder = ElfBuilder::new(ET_CORE);
    if !notes.is_empty() {
        builder = builder.segment(SegmentSpec::note(notes));
    }
    segments
        .into_iter()
        .fold(builder, ElfBuilder::segment)
        .build()
}
