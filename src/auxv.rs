//! Decoding of ELF auxiliary vectors.

use std::fs::read as read_file;

use crate::elf::types::Class;
use crate::log::debug;
use crate::util::Endian;
use crate::util::ReadRaw as _;
use crate::Error;
use crate::ErrorExt as _;
use crate::Pid;
use crate::Result;


pub(crate) const AT_NULL: u64 = 0;
pub(crate) const AT_PHDR: u64 = 3;
pub(crate) const AT_PHENT: u64 = 4;
pub(crate) const AT_PHNUM: u64 = 5;
pub(crate) const AT_PAGESZ: u64 = 6;
pub(crate) const AT_ENTRY: u64 = 9;
pub(crate) const AT_SYSINFO_EHDR: u64 = 33;


#[cfg(target_pointer_width = "64")]
const NATIVE_CLASS: Class = Class::Elf64;
#[cfg(not(target_pointer_width = "64"))]
const NATIVE_CLASS: Class = Class::Elf32;


fn foreign(endian: Endian) -> Endian {
    match endian {
        Endian::Little => Endian::Big,
        Endian::Big => Endian::Little,
    }
}


/// An auxiliary vector, as passed by the kernel to a new process.
#[derive(Clone, Debug)]
pub struct Auxv {
    class: Class,
    endian: Endian,
    entries: Vec<(u64, u64)>,
}

impl Auxv {
    fn decode(data: &[u8], class: Class, endian: Endian) -> Vec<(u64, u64)> {
        let wide = class.is_64();
        let mut data = data;
        let mut entries = Vec::new();
        while let (Some(type_), Some(value)) =
            (data.read_word(wide, endian), data.read_word(wide, endian))
        {
            if type_ == AT_NULL {
                break
            }
            let () = entries.push((type_, value));
        }
        entries
    }

    /// Parse the raw contents of an auxiliary vector.
    ///
    /// Neither the word size nor the byte order of the target are
    /// known up front. They are inferred from the `AT_PHENT` entry,
    /// which has to match the program header size of the class.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let native = Endian::native();
        let layouts = [
            (Class::Elf64, native),
            (Class::Elf32, native),
            (Class::Elf64, foreign(native)),
            (Class::Elf32, foreign(native)),
        ];

        for (class, endian) in layouts {
            let entries = Self::decode(data, class, endian);
            let phent = entries
                .iter()
                .find(|(type_, _value)| *type_ == AT_PHENT)
                .map(|(_type, value)| *value);
            if phent == Some(class.phdr_size() as u64) {
                debug!("auxiliary vector uses {class:?} {endian:?} layout");
                return Ok(Self {
                    class,
                    endian,
                    entries,
                })
            }
        }

        Err(Error::with_invalid_data(
            "auxiliary vector has no usable AT_PHENT entry",
        ))
    }

    /// Read the auxiliary vector of the process identified by `pid`.
    pub fn from_pid(pid: Pid) -> Result<Self> {
        let path = format!("/proc/{pid}/auxv");
        let data = read_file(&path).with_context(|| format!("failed to read `{path}`"))?;
        Self::parse(&data)
    }

    /// The word size the vector was encoded with.
    #[inline]
    pub fn class(&self) -> Class {
        self.class
    }

    /// The byte order the vector was encoded in.
    #[inline]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Look up the value of the entry of the provided type.
    pub fn get(&self, type_: u64) -> Option<u64> {
        self.entries
            .iter()
            .find(|(other, _value)| *other == type_)
            .map(|(_type, value)| *value)
    }

    /// The address of the program headers of the executable.
    #[inline]
    pub fn phdr(&self) -> Option<u64> {
        self.get(AT_PHDR)
    }

    /// The number of program headers of the executable.
    #[inline]
    pub fn phnum(&self) -> Option<u64> {
        self.get(AT_PHNUM)
    }

    /// The system page size.
    #[inline]
    pub fn page_size(&self) -> Option<u64> {
        self.get(AT_PAGESZ)
    }

    /// The entry point of the executable.
    #[inline]
    pub fn entry(&self) -> Option<u64> {
        self.get(AT_ENTRY)
    }

    /// The address of the vDSO's ELF header.
    #[inline]
    pub fn sysinfo_ehdr(&self) -> Option<u64> {
        self.get(AT_SYSINFO_EHDR)
    }

    /// Whether the vector indicates a native word size.
    #[inline]
    pub(crate) fn is_native_class(&self) -> bool {
        self.class == NATIVE_CLASS
    }
}
