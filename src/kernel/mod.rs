//! Discovery of the running kernel and its modules.

mod depmod;
mod kallsyms;
mod modmap;

use std::fs::read as read_file;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use crate::elf::notes::find_build_id;
use crate::log::debug;
use crate::log::warn;
use crate::module::ModuleId;
use crate::util::Endian;
use crate::Addr;
use crate::Dwfl;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::Result;

pub(crate) use depmod::DepmodIndex;
pub(crate) use kallsyms::read_kernel_range;
pub(crate) use modmap::read_modules;
pub(crate) use modmap::KernelModule;


pub(crate) const KALLSYMS: &str = "/proc/kallsyms";
pub(crate) const MODULES: &str = "/proc/modules";
/// The default root of the sysfs hierarchy.
pub(crate) const SYSFS: &str = "/sys";
/// The default root of the kernel module directories.
pub(crate) const MODULES_DIR: &str = "/lib/modules";


/// Read a GNU build ID from a raw notes file, as exposed in sysfs.
///
/// A missing file is reported as `None`.
pub(crate) fn read_notes_build_id(path: &Path) -> Result<Option<Vec<u8>>> {
    let data = match read_file(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(Error::from(err))
                .with_context(|| format!("failed to read `{}`", path.display()))
        }
    };
    let build_id =
        find_build_id(&data, Endian::native(), 4).map(|(build_id, _offset)| build_id.to_vec());
    Ok(build_id)
}

/// The path of the kernel's build ID notes in sysfs.
pub(crate) fn kernel_notes_path(sysfs: &Path) -> PathBuf {
    sysfs.join("kernel").join("notes")
}

/// The path of a kernel module's build ID note in sysfs.
pub(crate) fn module_notes_path(sysfs: &Path, module: &str) -> PathBuf {
    sysfs
        .join("module")
        .join(module)
        .join("notes")
        .join(".note.gnu.build-id")
}

/// Read the load address of section `secname` of kernel module
/// `module` from sysfs.
pub(crate) fn read_section_address(
    sysfs: &Path,
    module: &str,
    secname: &str,
) -> Result<Option<Addr>> {
    let path = sysfs
        .join("module")
        .join(module)
        .join("sections")
        .join(secname);
    let data = match read_file(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(Error::from(err))
                .with_context(|| format!("failed to read `{}`", path.display()))
        }
    };

    let text = String::from_utf8_lossy(&data);
    let text = text.trim();
    let addr = Addr::from_str_radix(text.trim_start_matches("0x"), 16).map_err(|err| {
        Error::with_invalid_data(format!(
            "section address `{text}` in `{}` is malformed: {err}",
            path.display()
        ))
    })?;
    Ok(Some(addr))
}


/// The name of the module representing the kernel image.
pub(crate) const KERNEL_MODULE: &str = "kernel";


impl Dwfl {
    /// Report the running kernel's image as module `kernel`.
    ///
    /// The module's address range is taken from `/proc/kallsyms`, its
    /// build ID from `/sys/kernel/notes`.
    pub fn report_kernel(&mut self) -> Result<ModuleId> {
        self.report_kernel_with(Path::new(KALLSYMS), Path::new(SYSFS))
    }

    pub(crate) fn report_kernel_with(&mut self, kallsyms: &Path, sysfs: &Path) -> Result<ModuleId> {
        let (start, end) = read_kernel_range(kallsyms)?.ok_or_else(|| {
            Error::new(
                ErrorKind::PermissionDenied,
                format!(
                    "kernel address range not available in `{}`; are addresses masked?",
                    kallsyms.display()
                ),
            )
        })?;

        let id = self.report_module(KERNEL_MODULE, start, end)?;
        match read_notes_build_id(&kernel_notes_path(sysfs)) {
            Ok(Some(build_id)) => {
                let () = self.module_mut(id)?.set_memory_build_id(&build_id, 0);
            }
            Ok(None) => debug!("kernel build ID not available"),
            Err(err) => warn!("failed to read kernel build ID: {err}"),
        }
        Ok(id)
    }

    /// Report the loaded kernel modules, as listed in `/proc/modules`.
    ///
    /// Build IDs are taken from each module's notes in sysfs. The
    /// number of modules reported is returned.
    #[cfg_attr(feature = "tracing", crate::log::instrument(skip_all))]
    pub fn report_kernel_modules(&mut self) -> Result<usize> {
        self.report_kernel_modules_with(Path::new(MODULES), Path::new(SYSFS))
    }

    pub(crate) fn report_kernel_modules_with(&mut self, modules: &Path, sysfs: &Path) -> Result<usize> {
        let modules = read_modules(modules)?;
        let mut count = 0;

        for KernelModule { name, addr, size } in modules {
            let end = addr.saturating_add(size);
            let id = match self.report_module(&name, addr, end) {
                Ok(id) => id,
                Err(err) if err.kind() == ErrorKind::Overlap => {
                    warn!("skipping kernel module `{name}`: {err}");
                    continue
                }
                Err(err) => return Err(err),
            };
            count += 1;

            match read_notes_build_id(&module_notes_path(sysfs, &name)) {
                Ok(Some(build_id)) => {
                    let () = self.module_mut(id)?.set_memory_build_id(&build_id, 0);
                }
                Ok(None) => (),
                Err(err) => warn!("failed to read build ID of kernel module `{name}`: {err}"),
            }
        }
        Ok(count)
    }
}
