//! Module discovery through the dynamic linker's `r_debug` and
//! `link_map` structures.

use std::collections::HashSet;
use std::path::Path;

use crate::auxv::Auxv;
use crate::elf::types::Class;
use crate::elf::types::Dyn;
use crate::elf::types::Phdr;
use crate::elf::types::DT_DEBUG;
use crate::elf::types::DT_NULL;
use crate::elf::types::ET_DYN;
use crate::elf::types::ET_EXEC;
use crate::elf::types::PT_DYNAMIC;
use crate::elf::types::PT_LOAD;
use crate::elf::types::PT_PHDR;
use crate::log::debug;
use crate::log::warn;
use crate::memory::read_cstring;
use crate::memory::read_vec;
use crate::memory::read_word;
use crate::memory::MemoryReader;
use crate::module::ModuleId;
use crate::util::bytes_to_path;
use crate::util::Endian;
use crate::Addr;
use crate::Dwfl;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Result;


/// The maximum length of a path read from target memory.
const PATH_MAX: usize = 4096;
/// The maximum number of `link_map` entries we are willing to walk.
const MAX_ENTRIES: usize = 1 << 16;


/// A single entry of the dynamic linker's list of loaded objects.
#[derive(Clone, Debug, PartialEq, Eq)]
struct LinkMap {
    l_addr: Addr,
    l_name: Addr,
    l_ld: Addr,
    l_next: Addr,
}

impl LinkMap {
    fn read(memory: &dyn MemoryReader, addr: Addr, class: Class, endian: Endian) -> Result<Self> {
        let word = class.word_size() as u64;
        let field = |idx: u64| read_word(memory, addr.wrapping_add(idx * word), class, endian);
        let entry = Self {
            l_addr: field(0)?,
            l_name: field(1)?,
            l_ld: field(2)?,
            l_next: field(3)?,
        };
        Ok(entry)
    }
}


fn parse_phdrs(data: &[u8], class: Class, endian: Endian) -> Vec<Phdr> {
    data.chunks_exact(class.phdr_size())
        .filter_map(|mut chunk| Phdr::parse(&mut chunk, class, endian))
        .collect()
}


/// Locate the dynamic section of the executable, as `(address, size)`.
fn dynamic_from_phdrs(phdrs: &[Phdr], at_phdr: Addr, fallback_bias: Addr) -> Option<(Addr, u64)> {
    let bias = phdrs
        .iter()
        .find(|phdr| phdr.p_type == PT_PHDR)
        .map(|phdr| at_phdr.wrapping_sub(phdr.p_vaddr))
        .unwrap_or(fallback_bias);
    phdrs
        .iter()
        .find(|phdr| phdr.p_type == PT_DYNAMIC)
        .map(|phdr| (bias.wrapping_add(phdr.p_vaddr), phdr.p_memsz))
}


impl Dwfl {
    /// Find the dynamic section of the executable through an already
    /// reported module whose file maps its program headers at
    /// `at_phdr`.
    fn dynamic_from_modules(&mut self, at_phdr: Addr, page_size: u64) -> Option<(Addr, u64)> {
        let candidates = self
            .modules()
            .filter(|(_id, module)| module.contains(at_phdr))
            .map(|(id, _module)| id)
            .collect::<Vec<_>>();

        for id in candidates {
            let (elf, _bias) = match self.module_getelf(id) {
                Ok(found) => found,
                Err(err) => {
                    debug!("module {id} has no usable ELF file: {err}");
                    continue
                }
            };
            if !matches!(elf.elf_type(), ET_EXEC | ET_DYN) {
                continue
            }
            let phdrs = if let Ok(phdrs) = elf.program_headers() {
                phdrs
            } else {
                continue
            };

            let phoff = elf.ehdr().e_phoff;
            let file_phdr = phdrs
                .iter()
                .filter(|phdr| phdr.p_type == PT_LOAD)
                .find(|phdr| phdr.p_offset <= phoff && phoff < phdr.p_offset + phdr.p_filesz)
                .map(|phdr| phdr.p_vaddr + (phoff - phdr.p_offset));
            let file_phdr = if let Some(file_phdr) = file_phdr {
                file_phdr
            } else {
                continue
            };

            let mask = page_size.saturating_sub(1);
            if at_phdr & mask != file_phdr & mask {
                continue
            }
            let bias = at_phdr.wrapping_sub(file_phdr);
            debug!("using program headers of module {id} with bias {bias:#x}");
            return dynamic_from_phdrs(phdrs, at_phdr, bias)
        }
        None
    }

    /// Find the address of `struct r_debug` of the target.
    fn find_r_debug(&mut self, auxv: &Auxv, memory: &dyn MemoryReader) -> Result<Option<Addr>> {
        let class = auxv.class();
        let endian = auxv.endian();
        let at_phdr = auxv.phdr().ok_or_invalid_data(|| "auxiliary vector lacks AT_PHDR")?;
        let phnum = auxv.phnum().ok_or_invalid_data(|| "auxiliary vector lacks AT_PHNUM")?;
        let page_size = auxv.page_size().unwrap_or(0x1000);

        let len = (phnum as usize).saturating_mul(class.phdr_size());
        let dynamic = match read_vec(memory, at_phdr, len) {
            Ok(data) => dynamic_from_phdrs(&parse_phdrs(&data, class, endian), at_phdr, 0),
            Err(err) => {
                debug!("failed to read program headers at {at_phdr:#x}: {err}");
                self.dynamic_from_modules(at_phdr, page_size)
            }
        };
        let (dyn_addr, dyn_size) = if let Some(dynamic) = dynamic {
            dynamic
        } else {
            debug!("executable has no dynamic section");
            return Ok(None)
        };

        let data = read_vec(memory, dyn_addr, dyn_size as usize)
            .context("failed to read dynamic section")?;
        let mut data = data.as_slice();
        while let Some(dyn_) = Dyn::parse(&mut data, class, endian) {
            match dyn_.d_tag {
                DT_NULL => break,
                DT_DEBUG if dyn_.d_val != 0 => return Ok(Some(dyn_.d_val)),
                _ => (),
            }
        }
        Ok(None)
    }

    /// Discover modules by walking the dynamic linker's list of loaded
    /// objects in the target described by `auxv` and `memory`.
    ///
    /// Modules already reported (e.g., from memory mappings) are
    /// renamed after the object's path and reordered to follow the
    /// dynamic linker's list. Objects without a corresponding module are
    /// reported from their files. The number of list entries consumed is
    /// returned.
    #[cfg_attr(feature = "tracing", crate::log::instrument(skip_all))]
    pub fn report_link_map(&mut self, auxv: &Auxv, memory: &dyn MemoryReader) -> Result<usize> {
        let class = auxv.class();
        let endian = auxv.endian();
        let word = class.word_size() as u64;

        let r_debug = if let Some(r_debug) = self.find_r_debug(auxv, memory)? {
            r_debug
        } else {
            return Ok(0)
        };

        let mut version = [0; 4];
        let _read = memory
            .read(r_debug, &mut version, 4)
            .context("failed to read r_debug")?;
        let version = endian.u32(version);
        if !matches!(version, 1 | 2) {
            return Err(Error::with_invalid_data(format!(
                "r_debug at {r_debug:#x} has unsupported version {version}"
            )))
        }
        let mut next = read_word(memory, r_debug.wrapping_add(word), class, endian)
            .context("failed to read r_map")?;

        let mut visited = HashSet::new();
        let mut pos = 0;
        let mut count = 0;
        while next != 0 {
            if !visited.insert(next) {
                warn!("link_map list contains a cycle at {next:#x}");
                break
            }
            if count >= MAX_ENTRIES {
                warn!("link_map list is implausibly long; stopping");
                break
            }

            let entry = LinkMap::read(memory, next, class, endian)
                .with_context(|| format!("failed to read link_map entry at {next:#x}"))?;
            next = entry.l_next;
            count += 1;

            let name = if entry.l_name != 0 {
                read_cstring(memory, entry.l_name, PATH_MAX).unwrap_or_default()
            } else {
                Vec::new()
            };
            let path = bytes_to_path(&name);
            if let Some(id) = self.report_link_map_entry(&entry, path)? {
                let () = self.move_module(id, pos);
                pos += 1;
            }
        }

        debug!("consumed {count} link_map entries");
        Ok(count)
    }

    fn report_link_map_entry(&mut self, entry: &LinkMap, path: &Path) -> Result<Option<ModuleId>> {
        let is_path = path.is_absolute();

        if let Some(id) = self.addrmodule(entry.l_ld) {
            let module = self.module_mut(id)?;
            if is_path && !Path::new(module.name()).is_absolute() {
                debug!("renaming module `{}` to `{}`", module.name(), path.display());
                let () = module.set_name(&path.to_string_lossy());
            }
            return Ok(Some(id))
        }

        if !is_path {
            debug!("no module for link_map entry with dynamic section at {:#x}", entry.l_ld);
            return Ok(None)
        }

        let name = path.to_string_lossy();
        match self.report_elf(&name, path, entry.l_addr, true) {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                warn!("failed to report `{}`: {err}", path.display());
                Ok(None)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::ffi::OsStr;

    use test_log::test;

    use crate::callbacks::Callbacks;
    use crate::callbacks::FoundElf;
    use crate::memory::SliceMemory;
    use crate::ErrorKind;
    use crate::Module;


    struct NoFiles;

    impl Callbacks for NoFiles {
        fn find_elf(&self, _module: &Module) -> Result<Option<FoundElf>> {
            Ok(None)
        }

        fn find_debuginfo(
            &self,
            _module: &Module,
            _main_path: Option<&Path>,
            _debuglink: Option<&OsStr>,
            _crc: u32,
        ) -> Result<Option<FoundElf>> {
            Ok(None)
        }
    }


    const BASE: Addr = 0x10000;

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        let () = buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
        let () = buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_phdr(buf: &mut [u8], offset: usize, p_type: u32, vaddr: u64, memsz: u64) {
        let () = put_u32(buf, offset, p_type);
        let () = put_u64(buf, offset + 16, vaddr);
        let () = put_u64(buf, offset + 32, memsz);
        let () = put_u64(buf, offset + 40, memsz);
    }

    fn put_link_map(buf: &mut [u8], offset: usize, l_addr: u64, l_name: u64, l_ld: u64, l_next: u64) {
        let () = put_u64(buf, offset, l_addr);
        let () = put_u64(buf, offset + 8, l_name);
        let () = put_u64(buf, offset + 16, l_ld);
        let () = put_u64(buf, offset + 24, l_next);
    }

    fn auxv(at_phdr: Addr, phnum: u64) -> Auxv {
        let entries = [(3, at_phdr), (4, 56), (5, phnum), (6, 0x1000), (0, 0)];
        let data = entries
            .iter()
            .flat_map(|(type_, value): &(u64, u64)| {
                type_.to_ne_bytes().into_iter().chain(value.to_ne_bytes())
            })
            .collect::<Vec<_>>();
        Auxv::parse(&data).unwrap()
    }

    /// Create a process image containing program headers, a dynamic
    /// section, `r_debug`, and a cyclic list of three `link_map`
    /// entries.
    fn process_image(version: u32) -> Vec<u8> {
        let mut buf = vec![0; 0x1000];
        // PT_PHDR at link-time address 0 makes for a bias of `BASE`.
        let () = put_phdr(&mut buf, 0, PT_PHDR, 0, 3 * 56);
        let () = put_phdr(&mut buf, 56, PT_LOAD, 0, 0x1000);
        let () = put_phdr(&mut buf, 112, PT_DYNAMIC, 0x200, 0x20);

        let () = put_u64(&mut buf, 0x200, DT_DEBUG as u64);
        let () = put_u64(&mut buf, 0x208, BASE + 0x300);

        let () = put_u32(&mut buf, 0x300, version);
        let () = put_u64(&mut buf, 0x308, BASE + 0x400);

        let () = put_link_map(&mut buf, 0x400, 0, BASE + 0x600, BASE + 0x200, BASE + 0x440);
        let () = put_link_map(
            &mut buf,
            0x440,
            0x7f0000000000,
            BASE + 0x610,
            0x7f0000000100,
            BASE + 0x480,
        );
        let () = put_link_map(&mut buf, 0x480, 0x7fff0000, BASE + 0x630, 0x7fff0100, BASE + 0x400);

        let () = buf[0x610..0x610 + 14].copy_from_slice(b"/lib/libfoo.so");
        let () = buf[0x630..0x630 + 15].copy_from_slice(b"linux-vdso.so.1");
        buf
    }

    /// Check that modules are renamed and reordered after the dynamic
    /// linker's list.
    #[test]
    fn link_map_walking() {
        let image = process_image(1);
        let memory = SliceMemory::new(BASE, &image);

        let mut dwfl = Dwfl::new(NoFiles);
        let () = dwfl.report_begin();
        let vdso = dwfl.report_module("[vdso]", 0x7fff0000, 0x7fff2000).unwrap();
        let lib = dwfl.report_module("[lib]", 0x7f0000000000, 0x7f0000010000).unwrap();
        let exe = dwfl.report_module("[exe]", BASE, BASE + 0x1000).unwrap();

        let count = dwfl.report_link_map(&auxv(BASE, 3), &memory).unwrap();
        let () = dwfl.report_end(|_module| ());
        assert_eq!(count, 3);

        let order = dwfl.modules().map(|(id, _module)| id).collect::<Vec<_>>();
        assert_eq!(order, vec![exe, lib, vdso]);
        assert_eq!(dwfl.module(exe).unwrap().name(), "[exe]");
        assert_eq!(dwfl.module(lib).unwrap().name(), "/lib/libfoo.so");
        assert_eq!(dwfl.module(vdso).unwrap().name(), "[vdso]");
    }

    /// Make sure that an unknown `r_debug` version is rejected.
    #[test]
    fn bad_version() {
        let image = process_image(7);
        let memory = SliceMemory::new(BASE, &image);
        let mut dwfl = Dwfl::new(NoFiles);
        let err = dwfl.report_link_map(&auxv(BASE, 3), &memory).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    /// Check that a not yet initialized `DT_DEBUG` yields no entries.
    #[test]
    fn uninitialized_debug() {
        let mut image = process_image(1);
        let () = put_u64(&mut image, 0x208, 0);
        let memory = SliceMemory::new(BASE, &image);
        let mut dwfl = Dwfl::new(NoFiles);
        assert_eq!(dwfl.report_link_map(&auxv(BASE, 3), &memory).unwrap(), 0);
    }

    /// Check that unreadable program headers without a matching module
    /// yield no entries.
    #[test]
    fn unreadable_phdrs() {
        let image = process_image(1);
        let memory = SliceMemory::new(BASE, &image);
        let mut dwfl = Dwfl::new(NoFiles);
        assert_eq!(dwfl.report_link_map(&auxv(0x1000, 3), &memory).unwrap(), 0);
    }
}
