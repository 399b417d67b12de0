//! Module discovery for live processes, based on `/proc/<pid>/maps`.

use std::io::Read;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

use crate::auxv::Auxv;
use crate::log::debug;
use crate::log::warn;
use crate::maps;
use crate::maps::FileId;
use crate::maps::MapsEntry;
use crate::Addr;
use crate::Dwfl;
use crate::Error;
use crate::ErrorExt as _;
use crate::Pid;
use crate::Result;


/// A file backed module whose mappings are still being collected.
#[derive(Debug)]
struct Pending {
    file: FileId,
    path: PathBuf,
    range: Range<Addr>,
}


/// Check whether `path` is a stand-in for a deleted file.
fn is_map_file(path: &Path) -> bool {
    path.starts_with("/proc") && path.components().any(|c| c.as_os_str() == "map_files")
}


impl Dwfl {
    fn report_pending(&mut self, pending: Pending) -> Result<()> {
        let name = pending.path.to_string_lossy();
        let _id = self.report_module(&name, pending.range.start, pending.range.end)?;
        Ok(())
    }

    fn report_maps_entries<I>(&mut self, entries: I, sysinfo_ehdr: Option<Addr>, pid: Pid) -> Result<usize>
    where
        I: IntoIterator<Item = Result<MapsEntry>>,
    {
        let mut count = 0;
        let mut pending = None::<Pending>;

        for entry in entries {
            let entry = entry?;

            let file = if let Some(file) = entry.file {
                file
            } else {
                let is_vdso = match sysinfo_ehdr {
                    Some(ehdr) => entry.range.start == ehdr,
                    None => entry.path == Path::new("[vdso]"),
                };
                if is_vdso {
                    if let Some(done) = pending.take() {
                        let () = self.report_pending(done)?;
                        count += 1;
                    }
                    let name = format!("[vdso: {}]", pid.resolve());
                    let _id = self.report_module(&name, entry.range.start, entry.range.end)?;
                    count += 1;
                }
                continue
            };

            match &mut pending {
                Some(cur) if cur.file == file => {
                    if cur.path != entry.path && !is_map_file(&cur.path) && !is_map_file(&entry.path) {
                        return Err(Error::with_invalid_data(format!(
                            "mappings of the same file have different paths: {} and {}",
                            cur.path.display(),
                            entry.path.display()
                        )))
                    }
                    cur.range.end = cur.range.end.max(entry.range.end);
                }
                _ => {
                    if let Some(done) = pending.take() {
                        let () = self.report_pending(done)?;
                        count += 1;
                    }
                    pending = Some(Pending {
                        file,
                        path: entry.path,
                        range: entry.range,
                    });
                }
            }
        }

        if let Some(done) = pending {
            let () = self.report_pending(done)?;
            count += 1;
        }
        Ok(count)
    }

    /// Report the modules described by a proc maps style listing.
    ///
    /// Consecutive mappings of the same file (as identified by device
    /// and inode) form a module named after the file's path. If
    /// `sysinfo_ehdr` (the `AT_SYSINFO_EHDR` value of the process) is
    /// provided, an anonymous mapping starting there is reported as the
    /// vDSO of process `pid`. The number of modules reported is
    /// returned.
    pub fn report_maps<R>(&mut self, reader: R, sysinfo_ehdr: Option<Addr>, pid: Pid) -> Result<usize>
    where
        R: Read,
    {
        self.report_maps_entries(maps::parse_file(reader, pid), sysinfo_ehdr, pid)
    }

    /// Report the modules of the live process `pid`.
    ///
    /// The number of modules reported is returned.
    #[cfg_attr(feature = "tracing", crate::log::instrument(skip(self), fields(pid = %pid)))]
    pub fn report_proc(&mut self, pid: Pid) -> Result<usize> {
        let sysinfo_ehdr = match Auxv::from_pid(pid) {
            Ok(auxv) => auxv.sysinfo_ehdr(),
            Err(err) => {
                warn!("failed to read auxiliary vector of process {pid}: {err}");
                None
            }
        };

        let entries = maps::parse(pid)?;
        let count = self
            .report_maps_entries(entries, sysinfo_ehdr, pid)
            .with_context(|| format!("failed to report modules of process {pid}"))?;
        debug!("reported {count} modules for process {pid}");
        Ok(count)
    }
}
