//! Environment specific lookup of ELF files for modules.
//!
//! A [`Dwfl`][crate::Dwfl] context delegates everything that depends
//! on where modules came from to a [`Callbacks`] implementation. The
//! crate provides one for each supported environment:
//! - [`OfflineCallbacks`] for files on disk
//! - [`ProcCallbacks`] for live processes
//! - [`KernelCallbacks`] for the running kernel and its modules
//! - [`CoreCallbacks`] for core files

use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use crate::debuginfo::build_id_main_paths;
use crate::debuginfo::find_debuginfo;
use crate::debuginfo::hex;
use crate::debuginfo::DebuginfoPath;
use crate::debuginfo::DEFAULT_DEBUGINFO_PATH;
use crate::debuginfo::KERNEL_DEBUGINFO_PATH;
use crate::elf::notes::read_build_id;
use crate::elf::ElfParser;
use crate::kernel;
use crate::kernel::DepmodIndex;
use crate::log::debug;
use crate::memory::read_elf_image;
use crate::memory::CoreMemory;
use crate::memory::MemoryReader;
use crate::memory::ProcessMemory;
use crate::module::Module;
use crate::once::OnceCell;
use crate::util::uname_release;
use crate::Addr;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::Pid;
use crate::Result;


/// An ELF file found for a module.
#[derive(Clone, Debug)]
pub struct FoundElf {
    /// The path the file was found at, if it came from disk.
    pub path: Option<PathBuf>,
    /// The parsed file.
    pub elf: Rc<ElfParser>,
}

impl FoundElf {
    /// Open the ELF file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let elf = ElfParser::open(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            elf: Rc::new(elf),
        })
    }

    /// Wrap an ELF image held in memory.
    pub fn from_image(image: Vec<u8>) -> Result<Self> {
        let elf = ElfParser::from_bytes(image, None)?;
        Ok(Self {
            path: None,
            elf: Rc::new(elf),
        })
    }
}


/// The environment specific part of module handling.
pub trait Callbacks {
    /// Find the main ELF file of `module`.
    ///
    /// `Ok(None)` signals that no file could be found.
    fn find_elf(&self, module: &Module) -> Result<Option<FoundElf>>;

    /// Find the file containing separate debug information for
    /// `module`.
    ///
    /// `main_path` is the path of the main file, if known, and
    /// `debuglink` and `crc` are the contents of its
    /// `.gnu_debuglink` section, if any. The default implementation
    /// searches [`debuginfo_path`](Self::debuginfo_path) by build ID
    /// and by debug link.
    fn find_debuginfo(
        &self,
        module: &Module,
        main_path: Option<&Path>,
        debuglink: Option<&OsStr>,
        crc: u32,
    ) -> Result<Option<FoundElf>> {
        let search = DebuginfoPath::parse(self.debuginfo_path().unwrap_or(DEFAULT_DEBUGINFO_PATH));
        find_debuginfo(
            &search,
            module.build_id().bytes(),
            main_path,
            debuglink,
            crc,
        )
    }

    /// Provide the run-time address of section `secname` (with index
    /// `shndx`) of a relocatable module.
    ///
    /// `Ok(None)` leaves placement of the section to the default
    /// layout.
    fn section_address(
        &self,
        _module: &Module,
        _secname: &str,
        _shndx: usize,
    ) -> Result<Option<Addr>> {
        Ok(None)
    }

    /// The debug information search path to use, in the syntax
    /// understood by [`DebuginfoPath::parse`].
    fn debuginfo_path(&self) -> Option<&str> {
        None
    }
}


/// Open the ELF file at `path`, if it exists and matches the build
/// ID `module` is known to have.
fn open_matching(module: &Module, path: &Path) -> Result<Option<FoundElf>> {
    let found = match FoundElf::open(path) {
        Ok(found) => found,
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotElf) => {
            debug!("module `{}`: candidate {} not usable: {err}", module.name(), path.display());
            return Ok(None)
        }
        Err(err) => return Err(err),
    };

    if let Some(expected) = module.build_id().bytes() {
        match read_build_id(&found.elf)? {
            Some((build_id, _addr)) if build_id != expected => {
                debug!(
                    "module `{}`: candidate {} has build ID {}, expected {}",
                    module.name(),
                    path.display(),
                    hex(build_id),
                    hex(expected)
                );
                return Ok(None)
            }
            _ => (),
        }
    }
    Ok(Some(found))
}

/// Look for the main file of `module` in the `.build-id` hierarchies
/// of the search path.
fn find_by_build_id(module: &Module, search: &DebuginfoPath) -> Result<Option<FoundElf>> {
    let build_id = if let Some(build_id) = module.build_id().bytes() {
        build_id
    } else {
        return Ok(None)
    };

    for path in build_id_main_paths(search, build_id) {
        if let Some(found) = open_matching(module, &path)? {
            return Ok(Some(found))
        }
    }
    Ok(None)
}

/// Treat the name of `module` as the path of its main file.
fn find_by_name(module: &Module) -> Result<Option<FoundElf>> {
    let path = Path::new(module.name());
    if !path.is_absolute() {
        return Ok(None)
    }
    open_matching(module, path)
}


/// Callbacks for files on disk.
///
/// Main files are found by build ID or by treating module names as
/// paths.
#[derive(Clone, Debug, Default)]
pub struct OfflineCallbacks {
    /// The debug information search path; [`DEFAULT_DEBUGINFO_PATH`]
    /// if unset.
    pub debuginfo_path: Option<String>,
}

impl Callbacks for OfflineCallbacks {
    fn find_elf(&self, module: &Module) -> Result<Option<FoundElf>> {
        let search = DebuginfoPath::parse(self.debuginfo_path().unwrap_or(DEFAULT_DEBUGINFO_PATH));
        if let Some(found) = find_by_build_id(module, &search)? {
            return Ok(Some(found))
        }

        let path = Path::new(module.name());
        FoundElf::open(path)
            .map(Some)
            .with_context(|| format!("failed to open `{}`", path.display()))
    }

    fn debuginfo_path(&self) -> Option<&str> {
        self.debuginfo_path.as_deref()
    }
}


/// Callbacks for modules of a live process.
#[derive(Debug)]
pub struct ProcCallbacks {
    pid: Pid,
    memory: OnceCell<ProcessMemory>,
    /// The debug information search path; [`DEFAULT_DEBUGINFO_PATH`]
    /// if unset.
    pub debuginfo_path: Option<String>,
}

impl ProcCallbacks {
    /// Create a new [`ProcCallbacks`] object for the process identified
    /// by `pid`.
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            memory: OnceCell::new(),
            debuginfo_path: None,
        }
    }

    /// The process the callbacks operate on.
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn memory(&self) -> Result<&ProcessMemory> {
        self.memory.get_or_try_init(|| ProcessMemory::new(self.pid))
    }
}

impl Callbacks for ProcCallbacks {
    fn find_elf(&self, module: &Module) -> Result<Option<FoundElf>> {
        let name = module.name();
        if name.starts_with("[vdso") {
            let image = read_elf_image(self.memory()?, module.low())
                .with_context(|| format!("failed to read vDSO image of process {}", self.pid))?;
            return FoundElf::from_image(image.data).map(Some)
        }

        if Path::new(name).is_absolute() {
            let found = FoundElf::open(Path::new(name))
                .with_context(|| format!("failed to open `{name}`"))?;
            return Ok(Some(found))
        }
        Ok(None)
    }

    fn debuginfo_path(&self) -> Option<&str> {
        self.debuginfo_path.as_deref()
    }
}


/// Callbacks for the running kernel and its modules.
#[derive(Debug)]
pub struct KernelCallbacks {
    release: Option<String>,
    sysfs: PathBuf,
    modules_dir: PathBuf,
    depmod: OnceCell<Option<DepmodIndex>>,
    /// The debug information search path; [`KERNEL_DEBUGINFO_PATH`]
    /// if unset.
    pub debuginfo_path: Option<String>,
}

impl KernelCallbacks {
    /// Create a new [`KernelCallbacks`] object for the running kernel.
    pub fn new() -> Self {
        Self {
            release: None,
            sysfs: PathBuf::from(kernel::SYSFS),
            modules_dir: PathBuf::from(kernel::MODULES_DIR),
            depmod: OnceCell::new(),
            debuginfo_path: None,
        }
    }

    /// Use the provided kernel release instead of the running one.
    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = Some(release.into());
        self
    }

    /// Use a sysfs hierarchy mounted somewhere other than `/sys`.
    pub fn with_sysfs(mut self, sysfs: impl Into<PathBuf>) -> Self {
        self.sysfs = sysfs.into();
        self
    }

    /// Look for kernel modules somewhere other than `/lib/modules`.
    pub fn with_modules_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.modules_dir = dir.into();
        self
    }

    /// The root of the sysfs hierarchy used.
    #[inline]
    pub(crate) fn sysfs(&self) -> &Path {
        &self.sysfs
    }

    fn release(&self) -> Result<String> {
        if let Some(release) = &self.release {
            return Ok(release.clone())
        }
        let release = uname_release().context("failed to query kernel release")?;
        Ok(release.to_string_lossy().into_owned())
    }

    fn depmod(&self) -> Result<Option<&DepmodIndex>> {
        let depmod = self.depmod.get_or_try_init(|| {
            let dir = self.modules_dir.join(self.release()?);
            match DepmodIndex::open(&dir) {
                Ok(index) => Ok(Some(index)),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("no depmod index in {}: {err}", dir.display());
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        })?;
        Ok(depmod.as_ref())
    }

    fn vmlinux_candidates(&self) -> Result<Vec<PathBuf>> {
        let release = self.release()?;
        let candidates = vec![
            PathBuf::from(format!("/boot/vmlinux-{release}")),
            self.modules_dir.join(&release).join("vmlinux"),
            self.modules_dir.join(&release).join("build").join("vmlinux"),
            PathBuf::from(format!("/usr/lib/debug/boot/vmlinux-{release}")),
            PathBuf::from(format!("/usr/lib/debug/lib/modules/{release}/vmlinux")),
        ];
        Ok(candidates)
    }
}

impl Default for KernelCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl Callbacks for KernelCallbacks {
    fn find_elf(&self, module: &Module) -> Result<Option<FoundElf>> {
        let search = DebuginfoPath::parse(self.debuginfo_path().unwrap_or(KERNEL_DEBUGINFO_PATH));
        if let Some(found) = find_by_build_id(module, &search)? {
            return Ok(Some(found))
        }

        if module.name() == "kernel" {
            for path in self.vmlinux_candidates()? {
                if let Some(found) = open_matching(module, &path)? {
                    return Ok(Some(found))
                }
            }
            return Ok(None)
        }

        let depmod = if let Some(depmod) = self.depmod()? {
            depmod
        } else {
            return Ok(None)
        };
        match depmod.find_path(module.name())? {
            Some(path) => open_matching(module, &path),
            None => Ok(None),
        }
    }

    fn section_address(
        &self,
        module: &Module,
        secname: &str,
        _shndx: usize,
    ) -> Result<Option<Addr>> {
        if module.name() == "kernel" {
            return Ok(None)
        }
        kernel::read_section_address(&self.sysfs, module.name(), secname)
    }

    fn debuginfo_path(&self) -> Option<&str> {
        Some(self.debuginfo_path.as_deref().unwrap_or(KERNEL_DEBUGINFO_PATH))
    }
}


/// Callbacks for modules found in a core file.
#[derive(Debug)]
pub struct CoreCallbacks {
    memory: Rc<CoreMemory>,
    /// The debug information search path; [`DEFAULT_DEBUGINFO_PATH`]
    /// if unset.
    pub debuginfo_path: Option<String>,
}

impl CoreCallbacks {
    /// Create a new [`CoreCallbacks`] object reading from the provided
    /// core memory.
    pub fn new(memory: Rc<CoreMemory>) -> Self {
        Self {
            memory,
            debuginfo_path: None,
        }
    }

    /// The memory of the core file.
    #[inline]
    pub fn memory(&self) -> &Rc<CoreMemory> {
        &self.memory
    }
}

impl Callbacks for CoreCallbacks {
    fn find_elf(&self, module: &Module) -> Result<Option<FoundElf>> {
        let search = DebuginfoPath::parse(self.debuginfo_path().unwrap_or(DEFAULT_DEBUGINFO_PATH));
        if let Some(found) = find_by_build_id(module, &search)? {
            return Ok(Some(found))
        }
        if let Some(found) = find_by_name(module)? {
            return Ok(Some(found))
        }

        // As a last resort, use whatever the core file captured of the
        // module's image.
        let memory: &dyn MemoryReader = &*self.memory;
        match read_elf_image(memory, module.low()) {
            Ok(image) => FoundElf::from_image(image.data).map(Some),
            Err(err) if matches!(err.kind(), ErrorKind::NotElf | ErrorKind::UnexpectedEof) => {
                debug!("module `{}`: no usable image in core file: {err}", module.name());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn debuginfo_path(&self) -> Option<&str> {
        self.debuginfo_path.as_deref()
    }
}

