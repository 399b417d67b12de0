//! Module discovery for core files.

use std::ops::Range;
use std::os::unix::ffi::OsStrExt as _;

use crate::auxv::Auxv;
use crate::elf::notes::read_build_id;
use crate::elf::notes::NoteIter;
use crate::elf::types::Phdr;
use crate::elf::types::ET_DYN;
use crate::elf::types::ET_EXEC;
use crate::elf::types::NT_AUXV;
use crate::elf::types::PT_LOAD;
use crate::elf::types::PT_NOTE;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::log::trace;
use crate::log::warn;
use crate::memory::read_ehdr;
use crate::memory::read_elf_image;
use crate::memory::CoreMemory;
use crate::memory::MemoryImage;
use crate::util::align_down_u64;
use crate::util::align_up_u64;
use crate::Addr;
use crate::Dwfl;
use crate::Error;
use crate::ErrorKind;
use crate::Result;


/// The granularity at which segments are probed for ELF headers.
const PROBE_ALIGN: u64 = 0x1000;


/// An ELF image found in the memory captured by a core file.
#[derive(Debug)]
struct Sniffed {
    name: String,
    range: Range<Addr>,
    build_id: Option<(Vec<u8>, Addr)>,
}

impl Sniffed {
    fn new(image: MemoryImage) -> Result<Self> {
        let MemoryImage { data, range } = image;
        let elf = ElfParser::from_bytes(data, None)?;

        let name = match elf.soname() {
            Ok(Some(soname)) if !soname.is_empty() => soname.to_string(),
            _ => format!("[elf@{:#x}]", range.start),
        };
        let bias = elf
            .first_load()?
            .map(|phdr| range.start.wrapping_sub(align_down_u64(phdr.p_vaddr, phdr.p_align)))
            .unwrap_or(0);
        let build_id = read_build_id(&elf)?
            .map(|(build_id, addr)| (build_id.to_vec(), bias.wrapping_add(addr)));

        let slf = Self {
            name,
            range,
            build_id,
        };
        Ok(slf)
    }
}


/// Search a loadable segment of the core file for embedded ELF images.
fn sniff_segment(memory: &CoreMemory, phdr: &Phdr) -> Vec<Sniffed> {
    let end = phdr.p_vaddr.saturating_add(phdr.p_filesz);
    let mut addr = align_up_u64(phdr.p_vaddr, PROBE_ALIGN);
    let mut found = Vec::new();

    while addr < end {
        let next = addr.saturating_add(PROBE_ALIGN);
        let ehdr = match read_ehdr(memory, addr) {
            Ok(Some(ehdr)) if matches!(ehdr.e_type, ET_DYN | ET_EXEC) => ehdr,
            Ok(_) => {
                addr = next;
                continue
            }
            Err(err) => {
                trace!("failed to probe for ELF header at {addr:#x}: {err}");
                addr = next;
                continue
            }
        };

        let image = match read_elf_image(memory, addr) {
            Ok(image) => image,
            Err(err) => {
                debug!("ignoring ELF header of type {} at {addr:#x}: {err}", ehdr.e_type);
                addr = next;
                continue
            }
        };
        if !memory.contains(image.range.clone()) {
            debug!("ELF image at {addr:#x} is not fully captured by core file");
            addr = next;
            continue
        }

        let image_end = image.range.end;
        match Sniffed::new(image) {
            Ok(sniffed) => {
                debug!("found ELF image `{}` at {:#x?}", sniffed.name, sniffed.range);
                let () = found.push(sniffed);
                addr = align_up_u64(image_end, PROBE_ALIGN).max(next);
            }
            Err(err) => {
                debug!("ignoring ELF image at {addr:#x}: {err}");
                addr = next;
            }
        }
    }
    found
}


fn find_auxv(core: &ElfParser, note: &Phdr) -> Result<Option<Auxv>> {
    let data = core.segment_data(note)?;
    let auxv = NoteIter::new(data, core.endian(), note.p_align)
        .find(|note| note.n_type == NT_AUXV)
        .map(|note| Auxv::parse(note.desc))
        .transpose()?;
    Ok(auxv)
}


/// A module to report for a core file.
#[derive(Debug)]
enum Candidate {
    Segment { ndx: usize, range: Range<Addr> },
    Image(Sniffed),
}

impl Candidate {
    fn start(&self) -> Addr {
        match self {
            Self::Segment { range, .. } => range.start,
            Self::Image(sniffed) => sniffed.range.start,
        }
    }
}


impl Dwfl {
    /// Report the modules of the process captured by the core file
    /// `core`, with `memory` providing access to its memory image.
    ///
    /// Every loadable segment is reported as a segment and, unless an
    /// ELF image was found at its start, as a module of its own. ELF
    /// images embedded in the captured memory are reported as modules.
    /// If the core file carries the process's auxiliary vector, the
    /// dynamic linker's list of objects is consulted to name and order
    /// modules. The number of modules reported is returned.
    #[cfg_attr(feature = "tracing", crate::log::instrument(skip_all, fields(core = ?core.path())))]
    pub fn report_core(&mut self, core: &ElfParser, memory: &CoreMemory) -> Result<usize> {
        let phdrs = core.program_headers()?;
        if phdrs.is_empty() {
            return Err(Error::new(ErrorKind::NoPhdr, "core file has no program headers"))
        }

        let ident = core
            .path()
            .map(|path| path.as_os_str().as_bytes())
            .unwrap_or(b"core");

        let mut loads = Vec::new();
        let mut note = None;
        for (ndx, phdr) in phdrs.iter().enumerate() {
            match phdr.p_type {
                PT_LOAD => {
                    let _ndx = self.report_segment(ndx as i32, phdr, 0, ident)?;
                    let () = loads.push((ndx, phdr));
                }
                PT_NOTE if note.is_none() => note = Some(phdr),
                _ => (),
            }
        }

        let mut images = loads
            .iter()
            .flat_map(|(_ndx, phdr)| sniff_segment(memory, phdr))
            .collect::<Vec<_>>();
        let () = images.sort_by_key(|sniffed| sniffed.range.start);

        let mut candidates = Vec::new();
        for (ndx, phdr) in &loads {
            let start = phdr.p_vaddr;
            let mut end = phdr.p_vaddr.saturating_add(phdr.p_memsz);
            if images.iter().any(|sniffed| sniffed.range.contains(&start)) {
                continue
            }
            if let Some(sniffed) = images
                .iter()
                .find(|sniffed| start < sniffed.range.start && sniffed.range.start < end)
            {
                end = sniffed.range.start;
            }
            if start < end {
                let () = candidates.push(Candidate::Segment {
                    ndx: *ndx,
                    range: start..end,
                });
            }
        }
        let () = candidates.extend(images.into_iter().map(Candidate::Image));
        let () = candidates.sort_by_key(Candidate::start);

        let mut count = 0;
        for candidate in candidates {
            let result = match &candidate {
                Candidate::Segment { ndx, range } => {
                    self.report_module(&format!("[core:{ndx}]"), range.start, range.end)
                }
                Candidate::Image(sniffed) => self
                    .report_module(&sniffed.name, sniffed.range.start, sniffed.range.end)
                    .and_then(|id| {
                        if let Some((build_id, addr)) = &sniffed.build_id {
                            let () = self.module_mut(id)?.set_memory_build_id(build_id, *addr);
                        }
                        Ok(id)
                    }),
            };

            match result {
                Ok(_id) => count += 1,
                Err(err) if err.kind() == ErrorKind::Overlap => {
                    warn!("skipping core file module at {:#x}: {err}", candidate.start())
                }
                Err(err) => return Err(err),
            }
        }

        let auxv = match note.map(|note| find_auxv(core, note)).transpose() {
            Ok(auxv) => auxv.flatten(),
            Err(err) => {
                warn!("failed to read auxiliary vector from core file: {err}");
                None
            }
        };
        if let Some(auxv) = auxv {
            match self.report_link_map(&auxv, memory) {
                Ok(entries) => debug!("core file link_map has {entries} entries"),
                Err(err) => warn!("failed to walk link_map of core file: {err}"),
            }
        }

        debug!("reported {count} modules from core file");
        Ok(count)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::rc::Rc;

    use test_log::test;

    use crate::elf::types::ET_CORE;
    use crate::elf::types::NT_PRSTATUS;
    use crate::test_helper::core_image;
    use crate::test_helper::ElfBuilder;
    use crate::test_helper::NoteBuilder;
    use crate::test_helper::SegmentSpec;
    use crate::test_helper::SymbolSpec;
    use crate::util::Endian;
    use crate::CoreCallbacks;


    const BUILD_ID: [u8; 8] = [0x0c, 0x0e, 0x0f, 0x11, 0x22, 0x33, 0x44, 0x55];


    /// Create a shared object image padded to a page.
    fn dso_page(soname: Option<&str>) -> Vec<u8> {
        let mut builder = ElfBuilder::new(ET_DYN)
            .segment(SegmentSpec::load(0x0, 0x1000).data(vec![0x90; 0x200]))
            .dynsym(SymbolSpec::new("core_fn", 0x100, 0x40))
            .build_id(&BUILD_ID);
        if let Some(soname) = soname {
            builder = builder.soname(soname);
        }
        let image = builder.build();
        let parser = ElfParser::from_bytes(image.clone(), None).unwrap();
        let (_start, end) = parser.load_range().unwrap().unwrap();
        assert!(end <= 0x1000);

        let mut page = vec![0; 0x1000];
        let len = end as usize;
        let () = page[..len].copy_from_slice(&image[..len]);
        page
    }

    fn core(segments: Vec<SegmentSpec>, notes: Vec<u8>) -> (Rc<ElfParser>, Rc<CoreMemory>) {
        let image = core_image(segments, notes);
        let elf = Rc::new(ElfParser::from_bytes(image, None).unwrap());
        assert_eq!(elf.elf_type(), ET_CORE);
        let memory = Rc::new(CoreMemory::new(elf.clone()).unwrap());
        (elf, memory)
    }

    /// Check that embedded ELF images and plain segments are reported
    /// as modules.
    #[test]
    fn core_reporting() {
        let mut mixed = vec![0xee; 0x1000];
        let () = mixed.extend(dso_page(None));
        let () = mixed.extend(vec![0xee; 0x1000]);

        let (elf, memory) = core(
            vec![
                SegmentSpec::load(0x400000, 0x1000).data(dso_page(Some("libcore.so"))),
                SegmentSpec::load(0x500000, 0x1000).data(vec![0xaa; 0x1000]).writable(),
                SegmentSpec::load(0x600000, 0x1000).data(mixed),
            ],
            Vec::new(),
        );

        let mut dwfl = Dwfl::new(CoreCallbacks::new(memory.clone()));
        let () = dwfl.report_begin();
        let count = dwfl.report_core(&elf, &memory).unwrap();
        let () = dwfl.report_end(|_module| ());
        assert_eq!(count, 4);

        let names = dwfl
            .modules()
            .map(|(_id, module)| module.name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["libcore.so", "[core:1]", "[core:2]", "[elf@0x601000]"]
        );

        let (_id, truncated) = dwfl
            .modules()
            .find(|(_id, module)| module.name() == "[core:2]")
            .unwrap();
        assert_eq!(truncated.range(), 0x600000..0x601000);

        let lib = dwfl.addrmodule(0x400100).unwrap();
        assert_eq!(dwfl.module(lib).unwrap().name(), "libcore.so");
        assert_eq!(
            dwfl.module_build_id(lib).unwrap().bytes(),
            Some(BUILD_ID.as_slice())
        );
        let (_elf, bias) = dwfl.module_getelf(lib).unwrap();
        assert_eq!(bias, 0x400000);
        let sym = dwfl.module_addrsym(lib, 0x400110).unwrap().unwrap();
        assert_eq!(sym.name, "core_fn");
        assert_eq!(sym.addr, 0x400100);

        let (ndx, module) = dwfl.addrsegment(0x500010).unwrap();
        assert!(ndx >= 0);
        let module = module.unwrap();
        assert_eq!(dwfl.module(module).unwrap().name(), "[core:1]");
    }

    /// Check that an unusable auxiliary vector does not fail core file
    /// reporting.
    #[test]
    fn core_with_notes() {
        let auxv = [(4u64, 56u64), (3, 0xdead0000), (5, 4), (0, 0)]
            .iter()
            .flat_map(|(type_, value)| type_.to_ne_bytes().into_iter().chain(value.to_ne_bytes()))
            .collect::<Vec<_>>();
        let notes = NoteBuilder::new(Endian::native())
            .note(b"CORE", NT_PRSTATUS, &[0; 32])
            .note(b"CORE", NT_AUXV, &auxv)
            .build();
        let (elf, memory) = core(
            vec![SegmentSpec::load(0x10000, 0x1000).data(vec![0; 0x1000])],
            notes,
        );

        let mut dwfl = Dwfl::new(CoreCallbacks::new(memory.clone()));
        let () = dwfl.report_begin();
        let count = dwfl.report_core(&elf, &memory).unwrap();
        let () = dwfl.report_end(|_module| ());
        assert_eq!(count, 1);
        assert_eq!(dwfl.modules().next().unwrap().1.name(), "[core:0]");
    }

    /// Make sure that a file without program headers is rejected.
    #[test]
    fn no_phdrs() {
        let image = ElfBuilder::new(ET_CORE).build();
        let elf = Rc::new(ElfParser::from_bytes(image, None).unwrap());
        let memory = CoreMemory::new(elf.clone()).unwrap();
        let mut dwfl = Dwfl::new(CoreCallbacks::new(Rc::new(memory.clone())));
        let err = dwfl.report_core(&elf, &memory).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPhdr);
    }
}
