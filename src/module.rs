use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use crate::callbacks::Callbacks;
use crate::callbacks::FoundElf;
use crate::debuginfo::hex;
use crate::debuginfo::read_debug_link;
use crate::elf::notes::read_build_id;
use crate::elf::types::ET_DYN;
use crate::elf::types::ET_EXEC;
use crate::elf::types::ET_NONE;
use crate::elf::types::ET_REL;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::log::warn;
use crate::reloc::SectionTable;
use crate::symtab::Symtab;
use crate::util::align_down_u64;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::Result;


/// An identifier for a [`Module`] within a [`Dwfl`][crate::Dwfl]
/// context.
///
/// Identifiers are never reused within a context, so an identifier of
/// a module that got removed simply stops resolving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(usize);

impl ModuleId {
    #[inline]
    pub(crate) fn new(idx: usize) -> Self {
        Self(idx)
    }

    #[inline]
    pub(crate) fn idx(&self) -> usize {
        self.0
    }
}

impl Display for ModuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "#{}", self.0)
    }
}


/// The state of a module's build ID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BuildId {
    /// The build ID has not been looked for yet.
    #[default]
    Unknown,
    /// The module was checked and has no build ID.
    Absent,
    /// The module has a build ID.
    Present {
        /// The raw build ID.
        bytes: Vec<u8>,
        /// The run-time address of the build ID note's descriptor.
        vaddr: Addr,
    },
}

impl BuildId {
    /// Retrieve the build ID bytes, if present.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Present { bytes, .. } => Some(bytes),
            Self::Unknown | Self::Absent => None,
        }
    }
}

impl Display for BuildId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Unknown => f.write_str("<unknown>"),
            Self::Absent => f.write_str("<none>"),
            Self::Present { bytes, .. } => f.write_str(&hex(bytes)),
        }
    }
}


/// An ELF file associated with a module, be it the main file or the
/// one containing separate debug information.
#[derive(Clone, Debug)]
pub(crate) struct FileRecord {
    /// The path the file was found at, if any.
    pub path: Option<PathBuf>,
    /// The parsed ELF file.
    pub elf: Rc<ElfParser>,
    /// The difference between run-time and link-time addresses.
    pub bias: Addr,
    /// Whether the file was validated by build ID.
    pub valid: bool,
    /// Whether the module's section layout was applied to the file.
    pub relocated: bool,
}


/// Cached failure kinds of the lazy per-module lookups.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Failures {
    pub elf: Option<ErrorKind>,
    pub debug: Option<ErrorKind>,
    pub symtab: Option<ErrorKind>,
    pub dwarf: Option<ErrorKind>,
}


/// Run `f` unless `slot` holds a cached failure, caching its failure
/// otherwise.
pub(crate) fn cached<T, F>(slot: &mut Option<ErrorKind>, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    if let Some(kind) = slot {
        return Err(Error::cached(*kind))
    }

    let result = f();
    if let Err(err) = &result {
        *slot = Some(err.kind());
    }
    result
}


/// A module, i.e., an ELF object loaded at some address range.
#[derive(Debug)]
pub struct Module {
    id: ModuleId,
    name: String,
    low: Addr,
    high: Addr,
    pub(crate) build_id: BuildId,
    /// Whether the build ID was read from memory, as opposed to the
    /// main file.
    pub(crate) build_id_from_memory: bool,
    pub(crate) main: Option<FileRecord>,
    pub(crate) debug: Option<FileRecord>,
    pub(crate) failures: Failures,
    pub(crate) symtab: Option<Symtab>,
    #[cfg(feature = "dwarf")]
    pub(crate) cus: Option<crate::dwarf::CuCache>,
    /// The index of the first segment table entry covering the module.
    pub(crate) segment: Option<usize>,
    /// Set while the module has not been reported in the current
    /// reporting round.
    pub(crate) gc: bool,
    /// The run-time section layout, for `ET_REL` modules.
    pub(crate) sections: Option<SectionTable>,
    /// The effective ELF type.
    pub(crate) e_type: u16,
}

impl Module {
    pub(crate) fn new(id: ModuleId, name: &str, low: Addr, high: Addr) -> Self {
        Self {
            id,
            name: name.to_string(),
            low,
            high,
            build_id: BuildId::Unknown,
            build_id_from_memory: false,
            main: None,
            debug: None,
            failures: Failures::default(),
            symtab: None,
            #[cfg(feature = "dwarf")]
            cus: None,
            segment: None,
            gc: false,
            sections: None,
            e_type: ET_NONE,
        }
    }

    /// The module's identifier.
    #[inline]
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// The module's name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// The first address covered by the module.
    #[inline]
    pub fn low(&self) -> Addr {
        self.low
    }

    /// The first address past the module.
    #[inline]
    pub fn high(&self) -> Addr {
        self.high
    }

    /// The address range covered by the module.
    #[inline]
    pub fn range(&self) -> Range<Addr> {
        self.low..self.high
    }

    /// Check whether `addr` falls into the module's address range.
    #[inline]
    pub fn contains(&self, addr: Addr) -> bool {
        self.range().contains(&addr)
    }

    #[inline]
    pub(crate) fn overlaps(&self, low: Addr, high: Addr) -> bool {
        low < self.high && self.low < high
    }

    /// The module's build ID.
    #[inline]
    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    /// Set the build ID as read from memory.
    pub(crate) fn set_memory_build_id(&mut self, bytes: &[u8], vaddr: Addr) {
        self.build_id = BuildId::Present {
            bytes: bytes.to_vec(),
            vaddr,
        };
        self.build_id_from_memory = true;
    }

    /// The path of the main ELF file, if it was found on disk.
    pub fn main_path(&self) -> Option<&Path> {
        self.main.as_ref().and_then(|file| file.path.as_deref())
    }

    /// The path of the separate debug information file, if one was
    /// found on disk.
    pub fn debug_path(&self) -> Option<&Path> {
        self.debug.as_ref().and_then(|file| file.path.as_deref())
    }

    /// The main file's load bias, if the main file is known.
    pub fn bias(&self) -> Option<Addr> {
        self.main.as_ref().map(|file| file.bias)
    }

    /// The main ELF file, if it was already looked up.
    pub fn elf(&self) -> Option<&ElfParser> {
        self.main.as_ref().map(|file| &*file.elf)
    }

    /// The effective ELF type of the module, which is `ET_NONE` while
    /// the main file is unknown. An `ET_EXEC` file loaded at an address
    /// other than its link-time address counts as `ET_DYN`.
    #[inline]
    pub fn e_type(&self) -> u16 {
        self.e_type
    }

    /// The index of the first segment table entry covering the module,
    /// once the segment table was built.
    #[inline]
    pub fn segment(&self) -> Option<usize> {
        self.segment
    }

    /// Check the build ID of `elf` against the one read from memory.
    fn check_build_id(&self, elf: &ElfParser) -> Result<bool> {
        if !self.build_id_from_memory {
            return Ok(false)
        }
        let expected = if let Some(expected) = self.build_id.bytes() {
            expected
        } else {
            return Ok(false)
        };

        match read_build_id(elf)? {
            Some((build_id, _addr)) if build_id == expected => Ok(true),
            Some((build_id, _addr)) => Err(Error::new(
                ErrorKind::WrongIdElf,
                format!(
                    "build ID {} does not match expected {}",
                    hex(build_id),
                    hex(expected)
                ),
            )),
            None => {
                debug!("ELF file for module `{}` has no build ID to check", self.name);
                Ok(false)
            }
        }
    }

    /// Compute the load bias of a file mapped at `self.low`.
    fn compute_bias(&self, elf: &ElfParser) -> Result<Addr> {
        let bias = match elf.first_load()? {
            Some(phdr) => self
                .low
                .wrapping_sub(align_down_u64(phdr.p_vaddr, phdr.p_align)),
            None => 0,
        };
        Ok(bias)
    }

    /// Attach `found` as the module's main file.
    pub(crate) fn attach_main(&mut self, found: FoundElf, callbacks: &dyn Callbacks) -> Result<()> {
        let FoundElf { path, elf } = found;
        let valid = self.check_build_id(&elf)?;

        let (e_type, bias) = match elf.elf_type() {
            ET_REL => (ET_REL, 0),
            ET_EXEC => {
                let bias = self.compute_bias(&elf)?;
                if bias == 0 {
                    (ET_EXEC, 0)
                } else {
                    (ET_DYN, bias)
                }
            }
            e_type => (e_type, self.compute_bias(&elf)?),
        };

        let sections = if e_type == ET_REL {
            Some(crate::reloc::cache_sections(self, &elf, callbacks)?)
        } else {
            None
        };

        if self.build_id == BuildId::Unknown {
            self.build_id = match read_build_id(&elf)? {
                Some((bytes, vaddr)) => BuildId::Present {
                    bytes: bytes.to_vec(),
                    vaddr: vaddr.wrapping_add(bias),
                },
                None => BuildId::Absent,
            };
        }

        debug!(
            "module `{}`: using {} (type {e_type}, bias {bias:#x})",
            self.name,
            path.as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<memory>".to_string())
        );

        self.e_type = e_type;
        self.sections = sections;
        self.main = Some(FileRecord {
            path,
            elf,
            bias,
            valid,
            relocated: false,
        });

        if let Err(err) = crate::reloc::relocate(self) {
            self.main = None;
            self.sections = None;
            self.e_type = ET_NONE;
            return Err(err)
        }
        Ok(())
    }

    fn load_elf(&mut self, callbacks: &dyn Callbacks) -> Result<()> {
        let found = callbacks
            .find_elf(self)
            .with_context(|| format!("failed to find ELF file for module `{}`", self.name))?
            .ok_or_else(|| {
                Error::with_not_found(format!("no ELF file found for module `{}`", self.name))
            })?;
        self.attach_main(found, callbacks)
    }

    /// Make sure that the main ELF file is known.
    pub(crate) fn ensure_elf(&mut self, callbacks: &dyn Callbacks) -> Result<&FileRecord> {
        if self.main.is_none() {
            let mut slot = self.failures.elf;
            let result = cached(&mut slot, || self.load_elf(callbacks));
            self.failures.elf = slot;
            let () = result?;
        }
        // SANITY: We either had a main file or just loaded one.
        Ok(self.main.as_ref().unwrap())
    }

    fn load_debug(&mut self, callbacks: &dyn Callbacks) -> Result<()> {
        // SANITY: Callers make sure the main file is present.
        let main = self.main.as_ref().unwrap();
        let (debuglink, crc) = match read_debug_link(&main.elf)? {
            Some((link, crc)) => (Some(link.to_os_string()), crc),
            None => (None, 0),
        };
        let main_path = main.path.clone();
        let main_bias = main.bias;
        let main_start = main.elf.load_range()?.map(|(start, _end)| start);

        let found = callbacks
            .find_debuginfo(self, main_path.as_deref(), debuglink.as_deref(), crc)?
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NoDwarf,
                    format!("no debug information found for module `{}`", self.name),
                )
            })?;

        // Debug files may have been linked at a different address than
        // the main file, e.g., if the latter was prelinked.
        let debug_start = found.elf.load_range()?.map(|(start, _end)| start);
        let bias = match (main_start, debug_start) {
            (Some(main_start), Some(debug_start)) => main_bias
                .wrapping_add(main_start)
                .wrapping_sub(debug_start),
            _ => main_bias,
        };
        let valid = self.build_id.bytes().is_some();

        debug!(
            "module `{}`: using debug information from {:?}",
            self.name, found.path
        );
        self.debug = Some(FileRecord {
            path: found.path,
            elf: found.elf,
            bias,
            valid,
            relocated: false,
        });

        if self.e_type == ET_REL {
            let () = crate::reloc::relocate(self)?;
        }
        Ok(())
    }

    /// Make sure that separate debug information is known.
    pub(crate) fn ensure_debug(&mut self, callbacks: &dyn Callbacks) -> Result<&FileRecord> {
        let _main = self.ensure_elf(callbacks)?;
        if self.debug.is_none() {
            let mut slot = self.failures.debug;
            let result = cached(&mut slot, || self.load_debug(callbacks));
            self.failures.debug = slot;
            let () = result?;
        }
        // SANITY: We either had a debug file or just loaded one.
        Ok(self.debug.as_ref().unwrap())
    }

    /// Forget about cached failures and re-check the build ID of an
    /// already attached main file.
    pub(crate) fn revalidate(&mut self) -> Result<()> {
        self.failures = Failures::default();

        if let Some(main) = &self.main {
            match self.check_build_id(&main.elf) {
                Ok(valid) => {
                    // SANITY: We just checked that there is a main file.
                    self.main.as_mut().unwrap().valid = valid;
                }
                Err(err) if err.kind() == ErrorKind::WrongIdElf => {
                    warn!("module `{}`: dropping mismatching main file: {err}", self.name);
                    self.main = None;
                    self.debug = None;
                    self.symtab = None;
                    #[cfg(feature = "dwarf")]
                    {
                        self.cus = None;
                    }
                    self.failures.elf = Some(err.kind());
                    return Err(err)
                }
                Err(err) => return Err(err),
            }
        } else if !self.build_id_from_memory {
            self.build_id = BuildId::Unknown;
        }
        Ok(())
    }
}
