use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::mem;
use std::ops::Deref as _;
use std::path::Path;
use std::path::PathBuf;

use crate::log::debug;
use crate::log::warn;
use crate::mmap::Mmap;
use crate::once::OnceCell;
use crate::util::align_down_u64;
use crate::util::Endian;
use crate::util::ReadRaw as _;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::IntoError as _;
use crate::Result;

use super::types::parse_ident;
use super::types::Chdr;
use super::types::Class;
use super::types::Dyn;
use super::types::Ehdr;
use super::types::Phdr;
use super::types::Shdr;
use super::types::Sym;
use super::types::DT_NULL;
use super::types::DT_SONAME;
use super::types::DT_STRTAB;
use super::types::EI_NIDENT;
use super::types::ELFCOMPRESS_ZLIB;
use super::types::ELFCOMPRESS_ZSTD;
use super::types::ELFMAG;
use super::types::PN_XNUM;
use super::types::PT_DYNAMIC;
use super::types::PT_LOAD;
use super::types::SHF_COMPRESSED;
use super::types::SHN_XINDEX;
use super::types::SHT_DYNAMIC;
use super::types::SHT_NOBITS;


/// Decompress the payload of a `SHF_COMPRESSED` section.
fn decompress(chdr: &Chdr, data: &[u8]) -> Result<Vec<u8>> {
    let size = usize::try_from(chdr.ch_size)
        .ok()
        .ok_or_invalid_data(|| format!("compressed section too large ({})", chdr.ch_size))?;

    let decompressed = match chdr.ch_type {
        #[cfg(feature = "zlib")]
        ELFCOMPRESS_ZLIB => miniz_oxide::inflate::decompress_to_vec_zlib_with_limit(data, size)
            .map_err(|err| Error::with_invalid_data(format!("{err:?}")))
            .context("failed to inflate zlib compressed section")?,
        #[cfg(feature = "zstd")]
        ELFCOMPRESS_ZSTD => {
            use std::io::Read as _;

            let decoder = zstd::stream::read::Decoder::new(data)
                .context("failed to create zstd decoder")?;
            let mut buffer = Vec::with_capacity(size);
            let _count = decoder
                .take(chdr.ch_size)
                .read_to_end(&mut buffer)
                .context("failed to decompress zstd compressed section")?;
            buffer
        }
        #[cfg(not(feature = "zlib"))]
        ELFCOMPRESS_ZLIB => {
            return Err(Error::with_unsupported(
                "zlib compressed sections are not supported; enable the `zlib` feature",
            ))
        }
        #[cfg(not(feature = "zstd"))]
        ELFCOMPRESS_ZSTD => {
            return Err(Error::with_unsupported(
                "zstd compressed sections are not supported; enable the `zstd` feature",
            ))
        }
        ty => {
            return Err(Error::with_unsupported(format!(
                "section uses unsupported compression type {ty}"
            )))
        }
    };

    if decompressed.len() != size {
        return Err(Error::with_invalid_data(format!(
            "decompressed section has unexpected size ({} vs. {size})",
            decompressed.len()
        )))
    }
    Ok(decompressed)
}


#[derive(Clone, Debug)]
struct EhdrExt {
    /// The ELF header.
    ehdr: Ehdr,
    /// Override of `ehdr.e_shnum`, handling of which is special-cased by
    /// the ELF standard.
    shnum: usize,
    /// Override of `ehdr.e_phnum`, handling of which is special-cased by
    /// the ELF standard.
    phnum: usize,
    /// Override of `ehdr.e_shstrndx`.
    shstrndx: usize,
}


struct Cache<'mmap> {
    /// A slice of the raw ELF data that we are about to parse.
    elf_data: &'mmap [u8],
    /// The ELF header, parsed eagerly.
    ehdr: EhdrExt,
    /// The cached ELF section headers.
    shdrs: OnceCell<Box<[Shdr]>>,
    /// The cached section name string table.
    shstrtab: OnceCell<&'mmap [u8]>,
    /// The cached ELF program headers.
    phdrs: OnceCell<Box<[Phdr]>>,
    /// Decompressed section contents, one slot per section.
    decompressed: OnceCell<Box<[OnceCell<Box<[u8]>>]>>,
}

impl<'mmap> Cache<'mmap> {
    /// Create a new `Cache` using the provided raw ELF object data,
    /// validating the ELF header in the process.
    fn new(elf_data: &'mmap [u8]) -> Result<Self> {
        let ehdr = Self::parse_ehdr(elf_data)?;
        let slf = Self {
            elf_data,
            ehdr,
            shdrs: OnceCell::new(),
            shstrtab: OnceCell::new(),
            phdrs: OnceCell::new(),
            decompressed: OnceCell::new(),
        };
        Ok(slf)
    }

    /// Read the very first section header.
    ///
    /// ELF contains a couple of clauses that special case data ranges
    /// of certain member variables to reference data from this header,
    /// which otherwise is zeroed out.
    fn read_first_shdr(elf_data: &[u8], ehdr: &Ehdr) -> Result<Shdr> {
        let mut data = elf_data
            .get(ehdr.e_shoff as usize..)
            .ok_or_unexpected_eof(|| "e_shoff is out of bounds")?;
        let shdr = Shdr::parse(&mut data, ehdr.class, ehdr.endian)
            .ok_or_unexpected_eof(|| "failed to read initial section header")?;
        Ok(shdr)
    }

    fn parse_ehdr(elf_data: &[u8]) -> Result<EhdrExt> {
        if elf_data.get(..ELFMAG.len()) != Some(ELFMAG.as_slice()) {
            return Err(Error::new(ErrorKind::NotElf, "ELF magic not found"))
        }

        if elf_data.len() >= EI_NIDENT && parse_ident(elf_data).is_none() {
            return Err(Error::new(
                ErrorKind::NotElf,
                "unsupported ELF class or data encoding",
            ))
        }
        let ehdr = Ehdr::parse(elf_data).ok_or_unexpected_eof(|| "ELF header is truncated")?;

        let has_shdrs = ehdr.e_shoff != 0;

        // "If the number of entries in the section header table is larger than
        // or equal to SHN_LORESERVE, e_shnum holds the value zero and the real
        // number of entries in the section header table is held in the sh_size
        // member of the initial entry in section header table."
        let shnum = if ehdr.e_shnum == 0 && has_shdrs {
            let shdr = Self::read_first_shdr(elf_data, &ehdr)?;
            usize::try_from(shdr.sh_size).ok().ok_or_invalid_data(|| {
                format!(
                    "ELF file contains unsupported number of sections ({})",
                    shdr.sh_size
                )
            })?
        } else if has_shdrs {
            ehdr.e_shnum.into()
        } else {
            0
        };

        // "If the number of entries in the program header table is
        // larger than or equal to PN_XNUM (0xffff), this member holds
        // PN_XNUM (0xffff) and the real number of entries in the
        // program header table is held in the sh_info member of the
        // initial entry in section header table."
        let phnum = if ehdr.e_phnum == PN_XNUM && has_shdrs {
            let shdr = Self::read_first_shdr(elf_data, &ehdr)?;
            shdr.sh_info as usize
        } else {
            ehdr.e_phnum.into()
        };

        let shstrndx = if ehdr.e_shstrndx == SHN_XINDEX && has_shdrs {
            let shdr = Self::read_first_shdr(elf_data, &ehdr)?;
            shdr.sh_link as usize
        } else {
            ehdr.e_shstrndx.into()
        };

        let ehdr = EhdrExt {
            ehdr,
            shnum,
            phnum,
            shstrndx,
        };
        Ok(ehdr)
    }

    /// Read `count` fixed size entries starting at `offset`, using the
    /// provided stride.
    fn parse_table<T, F>(&self, offset: u64, count: usize, stride: usize, f: F) -> Result<Vec<T>>
    where
        F: Fn(&mut &[u8]) -> Option<T>,
    {
        let mut data = self
            .elf_data
            .get(offset as usize..)
            .ok_or_unexpected_eof(|| format!("table offset {offset:#x} is out of bounds"))?;

        (0..count)
            .map(|_| {
                let mut entry = data
                    .read_slice(stride)
                    .ok_or_unexpected_eof(|| "table is truncated")?;
                f(&mut entry).ok_or_unexpected_eof(|| "table entry is truncated")
            })
            .collect()
    }

    fn parse_shdrs(&self) -> Result<Box<[Shdr]>> {
        let EhdrExt { ehdr, shnum, .. } = &self.ehdr;
        let stride = usize::from(ehdr.e_shentsize).max(ehdr.class.shdr_size());
        let shdrs = self
            .parse_table(ehdr.e_shoff, *shnum, stride, |data| {
                Shdr::parse(data, ehdr.class, ehdr.endian)
            })
            .context("failed to read section headers")?;
        Ok(shdrs.into_boxed_slice())
    }

    fn ensure_shdrs(&self) -> Result<&[Shdr]> {
        self.shdrs
            .get_or_try_init(|| self.parse_shdrs())
            .map(|shdrs| shdrs.deref())
    }

    fn parse_phdrs(&self) -> Result<Box<[Phdr]>> {
        let EhdrExt { ehdr, phnum, .. } = &self.ehdr;
        if ehdr.e_phoff == 0 {
            return Ok(Box::default())
        }
        let stride = usize::from(ehdr.e_phentsize).max(ehdr.class.phdr_size());
        let phdrs = self
            .parse_table(ehdr.e_phoff, *phnum, stride, |data| {
                Phdr::parse(data, ehdr.class, ehdr.endian)
            })
            .context("failed to read program headers")?;
        Ok(phdrs.into_boxed_slice())
    }

    fn ensure_phdrs(&self) -> Result<&[Phdr]> {
        self.phdrs
            .get_or_try_init(|| self.parse_phdrs())
            .map(|phdrs| phdrs.deref())
    }

    fn section_header(&self, idx: usize) -> Result<&Shdr> {
        let shdrs = self.ensure_shdrs()?;
        let shdr = shdrs
            .get(idx)
            .ok_or_invalid_input(|| format!("ELF section index ({idx}) out of bounds"))?;
        Ok(shdr)
    }

    /// Retrieve the raw (potentially compressed) section data for the ELF
    /// section at index `idx`.
    fn section_data_raw(&self, idx: usize) -> Result<&'mmap [u8]> {
        let shdr = self.section_header(idx)?;
        if shdr.sh_type == SHT_NOBITS {
            return Ok(&[])
        }

        let data = self
            .elf_data
            .get(shdr.sh_offset as usize..)
            .ok_or_unexpected_eof(|| "failed to read section data: invalid offset")?
            .read_slice(shdr.sh_size as usize)
            .ok_or_unexpected_eof(|| "failed to read section data: invalid size")?;
        Ok(data)
    }

    /// Retrieve the data of the section at index `idx`, decompressing
    /// it if necessary.
    fn section_data(&self, idx: usize) -> Result<&[u8]> {
        let shdr = self.section_header(idx)?;
        let data = self.section_data_raw(idx)?;
        if shdr.sh_flags & SHF_COMPRESSED == 0 {
            return Ok(data)
        }

        let slots = self.decompressed.get_or_init(|| {
            let count = self.ehdr.shnum;
            (0..count).map(|_| OnceCell::new()).collect()
        });
        // SANITY: `section_header` already bounds checked `idx`.
        let slot = &slots[idx];
        let data = slot.get_or_try_init(|| {
            let ehdr = &self.ehdr.ehdr;
            let mut data = data;
            let chdr = Chdr::parse(&mut data, ehdr.class, ehdr.endian)
                .ok_or_unexpected_eof(|| "compressed section header is truncated")?;
            debug!(
                "decompressing section {idx} ({} -> {} bytes)",
                data.len(),
                chdr.ch_size
            );
            decompress(&chdr, data)
                .with_context(|| format!("failed to decompress section {idx}"))
                .map(Vec::into_boxed_slice)
        })?;
        Ok(data)
    }

    fn ensure_shstrtab(&self) -> Result<&'mmap [u8]> {
        self.shstrtab
            .get_or_try_init(|| self.section_data_raw(self.ehdr.shstrndx))
            .copied()
    }

    /// Get the name of the section at a given index.
    fn section_name(&self, idx: usize) -> Result<&'mmap str> {
        let shdr = self.section_header(idx)?;
        let shstrtab = self.ensure_shstrtab()?;
        let name = shstrtab
            .get(shdr.sh_name as usize..)
            .ok_or_invalid_data(|| "string table index out of bounds")?
            .read_cstr()
            .ok_or_invalid_data(|| "no valid string found in string table")?
            .to_str()
            .map_err(Error::with_invalid_data)
            .context("invalid section name")?;
        Ok(name)
    }

    /// Find the section of a given name.
    ///
    /// This function return the index of the section if found.
    fn find_section(&self, name: &str) -> Result<Option<usize>> {
        for i in 1..self.ehdr.shnum {
            if self.section_name(i)? == name {
                return Ok(Some(i))
            }
        }
        Ok(None)
    }
}

impl Debug for Cache<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Cache")
    }
}


/// A parser for ELF files of either class and byte order.
///
/// The parser owns the memory backing the file. It is typically shared
/// between modules in the form of an `Rc<ElfParser>`.
pub struct ElfParser {
    /// A cache for relevant parts of the ELF file.
    // SAFETY: We must not hand out references with a 'static lifetime to
    //         this member. Rather, they should never outlive `self`.
    //         Furthermore, this member has to be listed before `_mmap`
    //         to make sure we never end up with a dangling reference.
    cache: Cache<'static>,
    /// Run-time section addresses, once sections were laid out.
    section_addrs: OnceCell<Box<[Addr]>>,
    /// The path of the file, if known.
    path: Option<PathBuf>,
    /// The memory mapped file.
    _mmap: Mmap,
}

impl ElfParser {
    /// Create an `ElfParser` from an open file.
    pub fn open_file(file: &File, path: Option<PathBuf>) -> Result<ElfParser> {
        let mmap = Mmap::map(file).context("failed to memory map file")?;
        Self::from_mmap(mmap, path)
    }

    /// Create an `ElfParser` from mmap'ed data.
    ///
    /// The ELF header is validated eagerly, everything else is parsed
    /// on demand.
    pub fn from_mmap(mmap: Mmap, path: Option<PathBuf>) -> Result<ElfParser> {
        // We transmute the mmap's lifetime to static here as that is a
        // necessity for self-referentiality.
        // SAFETY: We never hand out any 'static references to cache
        //         data.
        let elf_data = unsafe { mem::transmute::<&[u8], &'static [u8]>(mmap.deref()) };

        let parser = ElfParser {
            cache: Cache::new(elf_data)?,
            section_addrs: OnceCell::new(),
            path,
            _mmap: mmap,
        };
        Ok(parser)
    }

    /// Create an `ElfParser` for an in-memory image.
    pub fn from_bytes(data: Vec<u8>, path: Option<PathBuf>) -> Result<ElfParser> {
        Self::from_mmap(Mmap::from_vec(data), path)
    }

    /// Create an `ElfParser` for a path.
    pub fn open(path: &Path) -> Result<ElfParser> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Self::open_file(&file, Some(path.to_path_buf()))
            .with_context(|| format!("failed to parse ELF file {}", path.display()))
    }

    /// Retrieve the path of the file this parser works on, if known.
    #[inline]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Retrieve the raw file contents.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.cache.elf_data
    }

    /// Retrieve the ELF header.
    #[inline]
    pub fn ehdr(&self) -> &Ehdr {
        &self.cache.ehdr.ehdr
    }

    #[inline]
    pub fn class(&self) -> Class {
        self.ehdr().class
    }

    #[inline]
    pub fn endian(&self) -> Endian {
        self.ehdr().endian
    }

    /// The `e_type` of the file.
    #[inline]
    pub fn elf_type(&self) -> u16 {
        self.ehdr().e_type
    }

    /// The number of section headers, taking into account extended
    /// numbering.
    #[inline]
    pub fn shnum(&self) -> usize {
        self.cache.ehdr.shnum
    }

    pub fn section_headers(&self) -> Result<&[Shdr]> {
        self.cache.ensure_shdrs()
    }

    pub fn section_header(&self, idx: usize) -> Result<&Shdr> {
        self.cache.section_header(idx)
    }

    pub fn program_headers(&self) -> Result<&[Phdr]> {
        self.cache.ensure_phdrs()
    }

    /// Retrieve the name of the section at index `idx`.
    pub fn section_name(&self, idx: usize) -> Result<&str> {
        self.cache.section_name(idx)
    }

    /// Retrieve the data corresponding to the ELF section at index `idx`,
    /// decompressing it if necessary.
    pub fn section_data(&self, idx: usize) -> Result<&[u8]> {
        self.cache.section_data(idx)
    }

    /// Find the section of a given name.
    ///
    /// This function return the index of the section if found.
    pub fn find_section(&self, name: &str) -> Result<Option<usize>> {
        self.cache.find_section(name)
    }

    /// Find the first section of the given type.
    pub fn find_section_by_type(&self, sh_type: u32) -> Result<Option<usize>> {
        let shdrs = self.section_headers()?;
        let idx = shdrs
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(idx, shdr)| (shdr.sh_type == sh_type).then_some(idx));
        Ok(idx)
    }

    /// Retrieve the file contents of a segment (`p_filesz` bytes at
    /// `p_offset`).
    pub fn segment_data(&self, phdr: &Phdr) -> Result<&[u8]> {
        let data = self
            .data()
            .get(phdr.p_offset as usize..)
            .ok_or_unexpected_eof(|| "segment offset is out of bounds")?
            .read_slice(phdr.p_filesz as usize)
            .ok_or_unexpected_eof(|| "segment is truncated")?;
        Ok(data)
    }

    /// Convert a link-time virtual address into a file offset, using the
    /// `PT_LOAD` segments.
    pub fn vaddr_to_offset(&self, vaddr: Addr) -> Result<Option<u64>> {
        let phdrs = self.program_headers()?;
        let offset = phdrs
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD)
            .find(|phdr| vaddr >= phdr.p_vaddr && vaddr - phdr.p_vaddr < phdr.p_filesz)
            .map(|phdr| vaddr - phdr.p_vaddr + phdr.p_offset);
        Ok(offset)
    }

    /// Retrieve the file contents starting at link-time virtual
    /// address `vaddr`, up to the end of the containing segment.
    pub fn vaddr_data(&self, vaddr: Addr) -> Result<Option<&[u8]>> {
        let phdrs = self.program_headers()?;
        let data = phdrs
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD)
            .find(|phdr| vaddr >= phdr.p_vaddr && vaddr - phdr.p_vaddr < phdr.p_filesz)
            .map(|phdr| {
                let segment = self.segment_data(phdr)?;
                let start = (vaddr - phdr.p_vaddr) as usize;
                Ok::<_, Error>(&segment[start..])
            })
            .transpose()?;
        Ok(data)
    }

    /// Retrieve the first `PT_LOAD` program header, if any.
    pub fn first_load(&self) -> Result<Option<&Phdr>> {
        let phdrs = self.program_headers()?;
        Ok(phdrs.iter().find(|phdr| phdr.p_type == PT_LOAD))
    }

    /// Compute the link-time address range spanned by the `PT_LOAD`
    /// segments. The start is rounded down to the first segment's
    /// alignment.
    pub fn load_range(&self) -> Result<Option<(Addr, Addr)>> {
        let phdrs = self.program_headers()?;
        let mut loads = phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD);
        let first = if let Some(first) = loads.next() {
            first
        } else {
            return Ok(None)
        };

        let start = align_down_u64(first.p_vaddr, first.p_align);
        let end = loads.fold(first.p_vaddr.wrapping_add(first.p_memsz), |end, phdr| {
            end.max(phdr.p_vaddr.wrapping_add(phdr.p_memsz))
        });
        Ok(Some((start, end)))
    }

    /// Decode the symbol table contained in the section at `idx`.
    pub fn symbols(&self, idx: usize) -> Result<Vec<Sym>> {
        let class = self.class();
        let endian = self.endian();
        let shdr = self.section_header(idx)?;
        let entsize = if shdr.sh_entsize == 0 {
            class.sym_size()
        } else {
            shdr.sh_entsize as usize
        };
        if entsize < class.sym_size() {
            return Err(Error::with_invalid_data(format!(
                "symbol table entry size ({entsize}) is invalid"
            )))
        }

        let mut data = self.section_data(idx)?;
        if data.len() % entsize != 0 {
            warn!("size of symbol table section {idx} is not a multiple of its entry size");
        }

        let mut syms = Vec::with_capacity(data.len() / entsize);
        while let Some(mut entry) = data.read_slice(entsize) {
            let sym = Sym::parse(&mut entry, class, endian)
                .ok_or_unexpected_eof(|| "symbol is truncated")?;
            let () = syms.push(sym);
        }
        Ok(syms)
    }

    /// Decode the dynamic section, preferring `SHT_DYNAMIC` and falling
    /// back to the `PT_DYNAMIC` segment.
    pub fn dynamic(&self) -> Result<Vec<Dyn>> {
        let data = if let Some(idx) = self.find_section_by_type(SHT_DYNAMIC)? {
            self.section_data(idx)?
        } else {
            let phdrs = self.program_headers()?;
            match phdrs.iter().find(|phdr| phdr.p_type == PT_DYNAMIC) {
                Some(phdr) => self.segment_data(phdr)?,
                None => return Ok(Vec::new()),
            }
        };

        let class = self.class();
        let endian = self.endian();
        let mut data = data;
        let mut entries = Vec::new();
        while let Some(dyn_) = Dyn::parse(&mut data, class, endian) {
            if dyn_.d_tag == DT_NULL {
                break
            }
            let () = entries.push(dyn_);
        }
        Ok(entries)
    }

    /// Look up the `DT_SONAME` of a shared object.
    pub fn soname(&self) -> Result<Option<&str>> {
        let dynamic = self.dynamic()?;
        let soname = match dynamic.iter().find(|dyn_| dyn_.d_tag == DT_SONAME) {
            Some(dyn_) => dyn_.d_val,
            None => return Ok(None),
        };

        let strtab = if let Some(idx) = self.find_section_by_type(SHT_DYNAMIC)? {
            let link = self.section_header(idx)?.sh_link as usize;
            self.section_data(link)?
        } else {
            let strtab = dynamic
                .iter()
                .find(|dyn_| dyn_.d_tag == DT_STRTAB)
                .ok_or_invalid_data(|| "dynamic section lacks DT_STRTAB")?;
            match self.vaddr_data(strtab.d_val)? {
                Some(data) => data,
                None => return Ok(None),
            }
        };

        let name = strtab
            .get(soname as usize..)
            .and_then(|mut data| data.read_cstr())
            .ok_or_invalid_data(|| "DT_SONAME is out of bounds")?
            .to_str()
            .map_err(Error::with_invalid_data)
            .context("DT_SONAME is not valid UTF-8")?;
        Ok(Some(name))
    }

    /// Record run-time addresses for all sections.
    ///
    /// Addresses can only be set once; `false` is returned if they
    /// were set before.
    pub fn set_section_addrs(&self, addrs: Box<[Addr]>) -> bool {
        self.section_addrs.set(addrs).is_ok()
    }

    /// Check whether run-time section addresses have been set.
    #[inline]
    pub fn has_section_addrs(&self) -> bool {
        self.section_addrs.get().is_some()
    }

    /// Retrieve the address of section `idx`: the run-time address, if
    /// set, otherwise `sh_addr`.
    pub fn section_addr(&self, idx: usize) -> Result<Addr> {
        if let Some(addr) = self
            .section_addrs
            .get()
            .and_then(|addrs| addrs.get(idx).copied())
        {
            return Ok(addr)
        }
        let shdr = self.section_header(idx)?;
        Ok(shdr.sh_addr)
    }
}

impl Debug for ElfParser {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let Self {
            cache,
            section_addrs,
            path,
            _mmap: _,
        } = self;

        f.debug_struct(stringify!(ElfParser))
            .field("cache", cache)
            .field("relocated", &section_addrs.get().is_some())
            .field("path", path)
            .finish()
    }
}
