//! Normalized representations of ELF data structures.
//!
//! ELF comes in two classes (32 and 64 bit) and two byte orders. All
//! structures are decoded into the 64 bit shaped types below, so that
//! the rest of the crate never has to care about the on-disk layout.
#![allow(missing_docs)]

pub use crate::util::Endian;
use crate::util::ReadRaw as _;


pub const EI_NIDENT: usize = 16;
pub const ELFMAG: &[u8; 4] = b"\x7fELF";
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;

pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ELFDATA2MSB: u8 = 2;

pub const ET_NONE: u16 = 0;
pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const PN_XNUM: u16 = 0xffff;

pub const SHT_NULL: u32 = 0;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_HASH: u32 = 5;
pub const SHT_DYNAMIC: u32 = 6;
pub const SHT_NOTE: u32 = 7;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_REL: u32 = 9;
pub const SHT_DYNSYM: u32 = 11;
pub const SHT_SYMTAB_SHNDX: u32 = 18;

pub const SHF_WRITE: u64 = 0x1;
pub const SHF_ALLOC: u64 = 0x2;
pub const SHF_EXECINSTR: u64 = 0x4;
pub const SHF_COMPRESSED: u64 = 0x800;

pub const SHN_UNDEF: u16 = 0;
pub const SHN_LORESERVE: u16 = 0xff00;
pub const SHN_ABS: u16 = 0xfff1;
pub const SHN_COMMON: u16 = 0xfff2;
pub const SHN_XINDEX: u16 = 0xffff;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;
pub const STT_TLS: u8 = 6;
pub const STT_GNU_IFUNC: u8 = 10;

pub const DT_NULL: i64 = 0;
pub const DT_NEEDED: i64 = 1;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_STRSZ: i64 = 10;
pub const DT_SYMENT: i64 = 11;
pub const DT_SONAME: i64 = 14;
pub const DT_DEBUG: i64 = 21;
pub const DT_GNU_HASH: i64 = 0x6fff_fef5;

pub const NT_PRSTATUS: u32 = 1;
pub const NT_GNU_BUILD_ID: u32 = 3;
pub const NT_AUXV: u32 = 6;

pub const ELFCOMPRESS_ZLIB: u32 = 1;
pub const ELFCOMPRESS_ZSTD: u32 = 2;


/// The ELF class, i.e., the width of addresses and offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Class {
    /// 32 bit ELF.
    Elf32,
    /// 64 bit ELF.
    Elf64,
}

impl Class {
    #[inline]
    pub fn is_64(self) -> bool {
        self == Self::Elf64
    }

    /// The size of an address, in bytes.
    #[inline]
    pub fn word_size(self) -> usize {
        match self {
            Self::Elf32 => 4,
            Self::Elf64 => 8,
        }
    }

    #[inline]
    pub fn ehdr_size(self) -> usize {
        match self {
            Self::Elf32 => 52,
            Self::Elf64 => 64,
        }
    }

    #[inline]
    pub fn phdr_size(self) -> usize {
        match self {
            Self::Elf32 => 32,
            Self::Elf64 => 56,
        }
    }

    #[inline]
    pub fn shdr_size(self) -> usize {
        match self {
            Self::Elf32 => 40,
            Self::Elf64 => 64,
        }
    }

    #[inline]
    pub fn sym_size(self) -> usize {
        match self {
            Self::Elf32 => 16,
            Self::Elf64 => 24,
        }
    }

    #[inline]
    pub fn dyn_size(self) -> usize {
        match self {
            Self::Elf32 => 8,
            Self::Elf64 => 16,
        }
    }

    /// The size of a relocation entry with (`rela`) or without addend.
    #[inline]
    pub fn rel_size(self, rela: bool) -> usize {
        match (self, rela) {
            (Self::Elf32, false) => 8,
            (Self::Elf32, true) => 12,
            (Self::Elf64, false) => 16,
            (Self::Elf64, true) => 24,
        }
    }
}


/// Check `e_ident` and determine class and byte order.
pub(crate) fn parse_ident(data: &[u8]) -> Option<(Class, Endian)> {
    let ident = data.get(..EI_NIDENT)?;
    if &ident[..4] != ELFMAG {
        return None
    }
    let class = match ident[EI_CLASS] {
        ELFCLASS32 => Class::Elf32,
        ELFCLASS64 => Class::Elf64,
        _ => return None,
    };
    let endian = match ident[EI_DATA] {
        ELFDATA2LSB => Endian::Little,
        ELFDATA2MSB => Endian::Big,
        _ => return None,
    };
    Some((class, endian))
}


#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ehdr {
    pub class: Class,
    pub endian: Endian,
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Ehdr {
    /// Decode an ELF header. `None` is returned for anything that is
    /// either not ELF or too short.
    pub(crate) fn parse(data: &[u8]) -> Option<Self> {
        let (class, endian) = parse_ident(data)?;
        let mut data = data.get(EI_NIDENT..)?;
        let wide = class.is_64();
        let ehdr = Self {
            class,
            endian,
            e_type: data.read_u16_e(endian)?,
            e_machine: data.read_u16_e(endian)?,
            e_version: data.read_u32_e(endian)?,
            e_entry: data.read_word(wide, endian)?,
            e_phoff: data.read_word(wide, endian)?,
            e_shoff: data.read_word(wide, endian)?,
            e_flags: data.read_u32_e(endian)?,
            e_ehsize: data.read_u16_e(endian)?,
            e_phentsize: data.read_u16_e(endian)?,
            e_phnum: data.read_u16_e(endian)?,
            e_shentsize: data.read_u16_e(endian)?,
            e_shnum: data.read_u16_e(endian)?,
            e_shstrndx: data.read_u16_e(endian)?,
        };
        Some(ehdr)
    }
}


#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Phdr {
    pub(crate) fn parse(data: &mut &[u8], class: Class, endian: Endian) -> Option<Self> {
        let phdr = match class {
            Class::Elf32 => {
                let p_type = data.read_u32_e(endian)?;
                let p_offset = data.read_u32_e(endian)?.into();
                let p_vaddr = data.read_u32_e(endian)?.into();
                let p_paddr = data.read_u32_e(endian)?.into();
                let p_filesz = data.read_u32_e(endian)?.into();
                let p_memsz = data.read_u32_e(endian)?.into();
                let p_flags = data.read_u32_e(endian)?;
                let p_align = data.read_u32_e(endian)?.into();
                Self {
                    p_type,
                    p_flags,
                    p_offset,
                    p_vaddr,
                    p_paddr,
                    p_filesz,
                    p_memsz,
                    p_align,
                }
            }
            Class::Elf64 => Self {
                p_type: data.read_u32_e(endian)?,
                p_flags: data.read_u32_e(endian)?,
                p_offset: data.read_u64_e(endian)?,
                p_vaddr: data.read_u64_e(endian)?,
                p_paddr: data.read_u64_e(endian)?,
                p_filesz: data.read_u64_e(endian)?,
                p_memsz: data.read_u64_e(endian)?,
                p_align: data.read_u64_e(endian)?,
            },
        };
        Some(phdr)
    }
}


#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl Shdr {
    pub(crate) fn parse(data: &mut &[u8], class: Class, endian: Endian) -> Option<Self> {
        let wide = class.is_64();
        let shdr = Self {
            sh_name: data.read_u32_e(endian)?,
            sh_type: data.read_u32_e(endian)?,
            sh_flags: data.read_word(wide, endian)?,
            sh_addr: data.read_word(wide, endian)?,
            sh_offset: data.read_word(wide, endian)?,
            sh_size: data.read_word(wide, endian)?,
            sh_link: data.read_u32_e(endian)?,
            sh_info: data.read_u32_e(endian)?,
            sh_addralign: data.read_word(wide, endian)?,
            sh_entsize: data.read_word(wide, endian)?,
        };
        Some(shdr)
    }
}


#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl Sym {
    pub(crate) fn parse(data: &mut &[u8], class: Class, endian: Endian) -> Option<Self> {
        let sym = match class {
            Class::Elf32 => {
                let st_name = data.read_u32_e(endian)?;
                let st_value = data.read_u32_e(endian)?.into();
                let st_size = data.read_u32_e(endian)?.into();
                let st_info = data.read_u8()?;
                let st_other = data.read_u8()?;
                let st_shndx = data.read_u16_e(endian)?;
                Self {
                    st_name,
                    st_info,
                    st_other,
                    st_shndx,
                    st_value,
                    st_size,
                }
            }
            Class::Elf64 => Self {
                st_name: data.read_u32_e(endian)?,
                st_info: data.read_u8()?,
                st_other: data.read_u8()?,
                st_shndx: data.read_u16_e(endian)?,
                st_value: data.read_u64_e(endian)?,
                st_size: data.read_u64_e(endian)?,
            },
        };
        Some(sym)
    }

    /// Extract the symbol's type, typically represented by a STT_*
    /// constant.
    #[inline]
    pub fn type_(&self) -> u8 {
        self.st_info & 0xf
    }

    /// Extract the symbol's binding, typically represented by a STB_*
    /// constant.
    #[inline]
    pub fn bind(&self) -> u8 {
        self.st_info >> 4
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dyn {
    pub d_tag: i64,
    pub d_val: u64,
}

impl Dyn {
    pub(crate) fn parse(data: &mut &[u8], class: Class, endian: Endian) -> Option<Self> {
        let dyn_ = match class {
            Class::Elf32 => Self {
                d_tag: i64::from(data.read_u32_e(endian)? as i32),
                d_val: data.read_u32_e(endian)?.into(),
            },
            Class::Elf64 => Self {
                d_tag: data.read_u64_e(endian)? as i64,
                d_val: data.read_u64_e(endian)?,
            },
        };
        Some(dyn_)
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nhdr {
    pub n_namesz: u32,
    pub n_descsz: u32,
    pub n_type: u32,
}

impl Nhdr {
    pub(crate) fn parse(data: &mut &[u8], endian: Endian) -> Option<Self> {
        let nhdr = Self {
            n_namesz: data.read_u32_e(endian)?,
            n_descsz: data.read_u32_e(endian)?,
            n_type: data.read_u32_e(endian)?,
        };
        Some(nhdr)
    }
}


/// The header of a `SHF_COMPRESSED` section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chdr {
    pub ch_type: u32,
    pub ch_size: u64,
    pub ch_addralign: u64,
}

impl Chdr {
    pub(crate) fn parse(data: &mut &[u8], class: Class, endian: Endian) -> Option<Self> {
        let chdr = match class {
            Class::Elf32 => Self {
                ch_type: data.read_u32_e(endian)?,
                ch_size: data.read_u32_e(endian)?.into(),
                ch_addralign: data.read_u32_e(endian)?.into(),
            },
            Class::Elf64 => {
                let ch_type = data.read_u32_e(endian)?;
                let _ch_reserved = data.read_u32_e(endian)?;
                Self {
                    ch_type,
                    ch_size: data.read_u64_e(endian)?,
                    ch_addralign: data.read_u64_e(endian)?,
                }
            }
        };
        Some(chdr)
    }
}


/// A relocation entry, with or without explicit addend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rela {
    pub r_offset: u64,
    pub r_sym: u32,
    pub r_type: u32,
    pub r_addend: Option<i64>,
}

impl Rela {
    pub(crate) fn parse(
        data: &mut &[u8],
        class: Class,
        endian: Endian,
        explicit: bool,
    ) -> Option<Self> {
        let rela = match class {
            Class::Elf32 => {
                let r_offset = data.read_u32_e(endian)?.into();
                let r_info = data.read_u32_e(endian)?;
                let r_addend = if explicit {
                    Some(i64::from(data.read_u32_e(endian)? as i32))
                } else {
                    None
                };
                Self {
                    r_offset,
                    r_sym: r_info >> 8,
                    r_type: r_info & 0xff,
                    r_addend,
                }
            }
            Class::Elf64 => {
                let r_offset = data.read_u64_e(endian)?;
                let r_info = data.read_u64_e(endian)?;
                let r_addend = if explicit {
                    Some(data.read_u64_e(endian)? as i64)
                } else {
                    None
                };
                Self {
                    r_offset,
                    r_sym: (r_info >> 32) as u32,
                    r_type: (r_info & 0xffff_ffff) as u32,
                    r_addend,
                }
            }
        };
        Some(rela)
    }
}
