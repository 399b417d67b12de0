use std::borrow::Cow;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::path::Path;
use std::rc::Rc;

use crate::callbacks::Callbacks;
use crate::callbacks::FoundElf;
use crate::elf::types::Phdr;
use crate::elf::types::ET_DYN;
use crate::elf::types::ET_EXEC;
use crate::elf::types::ET_REL;
use crate::elf::types::PT_LOAD;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::log::trace;
use crate::module::BuildId;
use crate::module::Module;
use crate::module::ModuleId;
use crate::reloc;
use crate::reloc::SectionTable;
use crate::segment::SegmentTable;
use crate::symtab::ensure_symtab;
use crate::symtab::Sym;
use crate::symtab::Symtab;
use crate::symtab::SymtabSource;
use crate::util::align_down_u64;
use crate::util::align_up_u64;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::Result;


/// The gap left between relocatable objects placed by
/// [`Dwfl::report_offline`].
const OFFLINE_REDZONE: Addr = 0x10000;


/// A context tracking a set of modules and the address ranges they
/// occupy.
///
/// Modules are reported in rounds, each started by
/// [`report_begin`](Self::report_begin) (or
/// [`report_begin_add`](Self::report_begin_add)) and ended by
/// [`report_end`](Self::report_end). Modules not reported again in a
/// round are removed at its end; the others keep everything that was
/// cached for them.
pub struct Dwfl {
    callbacks: Box<dyn Callbacks>,
    /// Module arena, indexed by [`ModuleId`]. Removed modules leave a
    /// hole behind, so that identifiers stay unique.
    arena: Vec<Option<Module>>,
    /// Live modules, in list order.
    order: Vec<ModuleId>,
    segments: SegmentTable,
    /// The address at which the next relocatable object is placed by
    /// `report_offline`.
    offline_next: Addr,
}

impl Dwfl {
    /// Create a new [`Dwfl`] context using the provided callbacks.
    pub fn new<C>(callbacks: C) -> Self
    where
        C: Callbacks + 'static,
    {
        Self {
            callbacks: Box::new(callbacks),
            arena: Vec::new(),
            order: Vec::new(),
            segments: SegmentTable::default(),
            offline_next: 0,
        }
    }

    /// The callbacks in use.
    #[inline]
    pub fn callbacks(&self) -> &dyn Callbacks {
        &*self.callbacks
    }

    /// Start a new reporting round.
    ///
    /// All existing modules are marked as stale. Modules not reported
    /// again before [`report_end`](Self::report_end) get removed.
    pub fn report_begin(&mut self) {
        for module in self.arena.iter_mut().flatten() {
            module.gc = true;
        }
        let () = self.segments.clear();
    }

    /// Start a reporting round that only adds modules, leaving existing
    /// ones alone.
    pub fn report_begin_add(&mut self) {
        let () = self.segments.invalidate();
    }

    /// Report a module called `name` covering `[start, end)`.
    ///
    /// If a module with the very same name and range exists, it is
    /// kept. Otherwise a new one is created. Either way, the module is
    /// placed right after the last module already reported in the
    /// current round.
    pub fn report_module(&mut self, name: &str, start: Addr, end: Addr) -> Result<ModuleId> {
        if start > end {
            return Err(Error::with_invalid_input(format!(
                "module `{name}` has invalid range {start:#x}-{end:#x}"
            )))
        }

        let mut tail = 0;
        let mut existing = None;
        for (pos, id) in self.order.iter().enumerate() {
            // SANITY: All modules in `order` are present in the arena.
            let module = self.arena[id.idx()].as_ref().unwrap();
            if module.low() == start && module.high() == end && module.name() == name {
                existing = Some(pos);
                break
            }
            if !module.gc {
                tail = pos + 1;
            }
        }

        let conflict = self.live_modules().find(|module| {
            module.overlaps(start, end)
                && !(module.low() == start && module.high() == end && module.name() == name)
        });
        if let Some(module) = conflict {
            return Err(Error::new(
                ErrorKind::Overlap,
                format!(
                    "module `{name}` ({start:#x}-{end:#x}) overlaps `{}` ({:#x}-{:#x})",
                    module.name(),
                    module.low(),
                    module.high()
                ),
            ))
        }

        let id = if let Some(pos) = existing {
            let id = self.order.remove(pos);
            let () = self.order.insert(tail, id);
            // SANITY: All modules in `order` are present in the arena.
            let module = self.arena[id.idx()].as_mut().unwrap();
            module.gc = false;
            trace!("module `{name}` reported again");
            id
        } else {
            let id = ModuleId::new(self.arena.len());
            let () = self.arena.push(Some(Module::new(id, name, start, end)));
            let () = self.order.insert(tail, id);
            debug!("reported module `{name}` ({id}) at {start:#x}-{end:#x}");
            id
        };

        let () = self.segments.invalidate();
        Ok(id)
    }

    /// Finish a reporting round, removing all modules that were not
    /// reported in it.
    ///
    /// `removed` is invoked for each module right before it is
    /// dropped.
    pub fn report_end<F>(&mut self, mut removed: F)
    where
        F: FnMut(&Module),
    {
        let arena = &mut self.arena;
        let () = self.order.retain(|id| {
            let stale = arena[id.idx()].as_ref().map(|module| module.gc).unwrap_or(true);
            if stale {
                if let Some(module) = arena[id.idx()].take() {
                    debug!("removing stale module `{}` ({id})", module.name());
                    let () = removed(&module);
                }
            }
            !stale
        });
        let () = self.segments.invalidate();
    }

    /// Iterate over all modules, in list order.
    pub fn modules(&self) -> impl ExactSizeIterator<Item = (ModuleId, &Module)> + '_ {
        self.order.iter().map(move |id| {
            // SANITY: All modules in `order` are present in the arena.
            (*id, self.arena[id.idx()].as_ref().unwrap())
        })
    }

    /// Retrieve the module with the given identifier.
    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.arena.get(id.idx()).and_then(Option::as_ref)
    }

    /// The number of modules.
    #[inline]
    pub fn module_count(&self) -> usize {
        self.order.len()
    }

    /// Iterate over the modules not marked stale.
    fn live_modules(&self) -> impl Iterator<Item = &Module> {
        self.modules()
            .map(|(_id, module)| module)
            .filter(|module| !module.gc)
    }

    pub(crate) fn module_mut(&mut self, id: ModuleId) -> Result<&mut Module> {
        self.arena
            .get_mut(id.idx())
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::with_invalid_input(format!("module {id} does not exist")))
    }

    /// Retrieve a module along with the callbacks to use for it.
    fn parts(&mut self, id: ModuleId) -> Result<(&mut Module, &dyn Callbacks)> {
        let module = self
            .arena
            .get_mut(id.idx())
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::with_invalid_input(format!("module {id} does not exist")))?;
        Ok((module, &*self.callbacks))
    }

    /// Move the module `id` to position `pos` in the list.
    pub(crate) fn move_module(&mut self, id: ModuleId, pos: usize) {
        if let Some(cur) = self.order.iter().position(|other| *other == id) {
            let id = self.order.remove(cur);
            let () = self.order.insert(pos.min(self.order.len()), id);
        }
    }

    /// The list position of the module `id`.
    pub(crate) fn module_position(&self, id: ModuleId) -> Option<usize> {
        self.order.iter().position(|other| *other == id)
    }

    /// Report a loaded segment.
    ///
    /// `ndx` is the caller's index of the segment; a negative value
    /// means the one following the last segment reported. `bias` is
    /// added to the segment's address. Contiguous segments reported
    /// with the same non-empty `ident` are merged. The segment index
    /// used is returned.
    pub fn report_segment(&mut self, ndx: i32, phdr: &Phdr, bias: Addr, ident: &[u8]) -> Result<i32> {
        let vaddr = bias.wrapping_add(phdr.p_vaddr);
        if vaddr.checked_add(phdr.p_memsz).is_none() {
            return Err(Error::with_invalid_input(format!(
                "segment at {vaddr:#x} with size {:#x} wraps around",
                phdr.p_memsz
            )))
        }
        Ok(self.segments.report(ndx, phdr, bias, ident))
    }

    /// Bring module ownership of the segment table up to date.
    fn reify(&mut self) {
        if self.segments.is_reified() {
            return
        }

        let ranges = self
            .live_modules()
            .map(|module| (module.id(), module.low(), module.high()))
            .collect::<Vec<_>>();
        let backrefs = self.segments.reify(ranges);
        for module in self.arena.iter_mut().flatten() {
            module.segment = None;
        }
        for (id, idx) in backrefs {
            if let Some(module) = self.arena.get_mut(id.idx()).and_then(Option::as_mut) {
                module.segment = Some(idx);
            }
        }
    }

    /// Find the segment and module covering `addr`.
    ///
    /// The reported segment index is -1 for addresses not covered by a
    /// reported segment.
    pub fn addrsegment(&mut self, addr: Addr) -> Option<(i32, Option<ModuleId>)> {
        let () = self.reify();
        let arena = &self.arena;
        self.segments.lookup(addr, |id| {
            arena
                .get(id.idx())
                .and_then(Option::as_ref)
                .map(Module::high)
        })
    }

    /// Find the module covering `addr`.
    pub fn addrmodule(&mut self, addr: Addr) -> Option<ModuleId> {
        self.addrsegment(addr).and_then(|(_ndx, module)| module)
    }

    /// Report the ELF file at `path` as module `name`.
    ///
    /// See [`report_elf_file`](Self::report_elf_file).
    pub fn report_elf(&mut self, name: &str, path: &Path, base: Addr, add_p_vaddr: bool) -> Result<ModuleId> {
        let found = FoundElf::open(path)?;
        self.report_elf_file(name, found, base, add_p_vaddr)
    }

    /// Report an already opened ELF file as module `name`, loaded at
    /// `base`.
    ///
    /// The module's range is derived from the file's `PT_LOAD`
    /// segments. If `add_p_vaddr` is set, `base` is the load bias;
    /// otherwise it is the address the first segment got loaded at.
    /// Executables are always assumed to be loaded at their link-time
    /// addresses. The sections of relocatable objects are laid out
    /// starting at `base`.
    pub fn report_elf_file(
        &mut self,
        name: &str,
        found: FoundElf,
        base: Addr,
        add_p_vaddr: bool,
    ) -> Result<ModuleId> {
        let (start, end) = self
            .elf_address_range(name, &found.elf, base, add_p_vaddr)
            .with_context(|| format!("failed to determine address range of `{name}`"))?;
        let id = self.report_module(name, start, end)?;

        let (module, callbacks) = self.parts(id)?;
        if module.main.is_none() {
            let () = module.attach_main(found, callbacks)?;
        }
        Ok(id)
    }

    fn elf_address_range(
        &self,
        name: &str,
        elf: &ElfParser,
        base: Addr,
        add_p_vaddr: bool,
    ) -> Result<(Addr, Addr)> {
        let (base, add_p_vaddr) = match elf.elf_type() {
            ET_REL => {
                let placeholder = Module::new(ModuleId::new(usize::MAX), name, base, base);
                let table = SectionTable::layout(elf, base, |secname, shndx| {
                    self.callbacks.section_address(&placeholder, secname, shndx)
                })?;
                let range = table.extent().unwrap_or(base..base);
                return Ok((range.start.min(base), range.end))
            }
            ET_EXEC => (0, true),
            _ => (base, add_p_vaddr),
        };

        let phdrs = elf.program_headers()?;
        let mut loads = phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD);
        let first = loads.next().ok_or_else(|| {
            Error::new(ErrorKind::NoPhdr, "ELF file has no loadable segments")
        })?;
        let vaddr = align_down_u64(first.p_vaddr, first.p_align);
        let (start, bias) = if add_p_vaddr {
            (base.wrapping_add(vaddr), base)
        } else {
            (base, base.wrapping_sub(vaddr))
        };
        let last = phdrs
            .iter()
            .rev()
            .find(|phdr| phdr.p_type == PT_LOAD)
            .unwrap_or(first);
        let end = bias.wrapping_add(last.p_vaddr.wrapping_add(last.p_memsz));
        Ok((start, end))
    }

    /// Report the ELF file at `path` the way a debugger inspecting it
    /// without a running process would.
    ///
    /// Executables and shared objects are placed at their link-time
    /// addresses. Relocatable objects get placed one after the other,
    /// with some space in between.
    pub fn report_offline(&mut self, name: &str, path: &Path) -> Result<ModuleId> {
        let found = FoundElf::open(path)?;
        if found.elf.elf_type() != ET_REL {
            return self.report_elf_file(name, found, 0, true)
        }

        if self.offline_next == 0 {
            self.offline_next = OFFLINE_REDZONE;
        }
        let base = self.offline_next;
        let id = self.report_elf_file(name, found, base, false)?;
        // SANITY: We just reported the module.
        let high = self.module(id).map(Module::high).unwrap_or(base);
        self.offline_next = align_up_u64(high, OFFLINE_REDZONE).wrapping_add(OFFLINE_REDZONE);
        Ok(id)
    }

    /// Retrieve the main ELF file of a module, along with its load
    /// bias.
    pub fn module_getelf(&mut self, id: ModuleId) -> Result<(&Rc<ElfParser>, Addr)> {
        let (module, callbacks) = self.parts(id)?;
        let main = module.ensure_elf(callbacks)?;
        Ok((&main.elf, main.bias))
    }

    /// Retrieve the file containing separate debug information for a
    /// module, along with its load bias.
    pub fn module_getdebug(&mut self, id: ModuleId) -> Result<(&Rc<ElfParser>, Addr)> {
        let (module, callbacks) = self.parts(id)?;
        let debug = module.ensure_debug(callbacks)?;
        Ok((&debug.elf, debug.bias))
    }

    /// Retrieve the build ID of a module, looking up its main file if
    /// necessary.
    pub fn module_build_id(&mut self, id: ModuleId) -> Result<&BuildId> {
        let (module, callbacks) = self.parts(id)?;
        if *module.build_id() == BuildId::Unknown {
            let _main = module.ensure_elf(callbacks)?;
        }
        Ok(module.build_id())
    }

    /// Discard cached lookup failures of a module and check its main
    /// file against the build ID known for it once more.
    pub fn module_revalidate(&mut self, id: ModuleId) -> Result<()> {
        self.module_mut(id)?.revalidate()
    }

    fn module_symtab(&mut self, id: ModuleId) -> Result<(&Module, &Symtab)> {
        let (module, callbacks) = self.parts(id)?;
        let _symtab = ensure_symtab(module, callbacks)?;
        let module = &*module;
        // SANITY: `ensure_symtab` succeeded, so the table is present.
        let symtab = module.symtab.as_ref().unwrap();
        Ok((module, symtab))
    }

    /// Load the symbol table of a module, reporting the number of
    /// symbols in it.
    pub fn module_getsymtab(&mut self, id: ModuleId) -> Result<usize> {
        let (_module, symtab) = self.module_symtab(id)?;
        Ok(symtab.len())
    }

    /// Report which table the symbols of a module come from.
    pub fn module_symtab_source(&mut self, id: ModuleId) -> Result<SymtabSource> {
        let (_module, symtab) = self.module_symtab(id)?;
        Ok(symtab.source())
    }

    /// Retrieve the symbol at index `idx` of a module's symbol table.
    pub fn module_getsym(&mut self, id: ModuleId, idx: usize) -> Result<Sym<'_>> {
        let (_module, symtab) = self.module_symtab(id)?;
        symtab.sym(idx)
    }

    /// Find the symbol best describing `addr` in a module.
    pub fn module_addrsym(&mut self, id: ModuleId, addr: Addr) -> Result<Option<Sym<'_>>> {
        let (module, symtab) = self.module_symtab(id)?;
        symtab.addrsym(module, addr)
    }

    /// Find the name of the symbol best describing `addr` in a module.
    pub fn module_addrname(&mut self, id: ModuleId, addr: Addr) -> Result<Option<Cow<'_, str>>> {
        let sym = self.module_addrsym(id, addr)?;
        Ok(sym.map(|sym| sym.name))
    }

    /// Find the source location of `addr` in a module.
    #[cfg(feature = "dwarf")]
    #[cfg_attr(docsrs, doc(cfg(feature = "dwarf")))]
    pub fn module_addrline(&mut self, id: ModuleId, addr: Addr) -> Result<Option<crate::SrcLoc>> {
        let (module, callbacks) = self.parts(id)?;
        let cus = crate::dwarf::ensure_cus(module, callbacks)?;
        cus.find_location(addr)
    }

    /// The number of relocation bases of a module.
    ///
    /// That is the number of allocated sections for relocatable
    /// modules, one for shared objects, and zero for executables.
    pub fn relocations(&mut self, id: ModuleId) -> Result<usize> {
        let (module, callbacks) = self.parts(id)?;
        let _main = module.ensure_elf(callbacks)?;
        let count = match module.e_type() {
            ET_REL => module
                .sections
                .as_ref()
                .map(|table| table.records().len())
                .unwrap_or(0),
            ET_DYN => 1,
            _ => 0,
        };
        Ok(count)
    }

    /// Retrieve the name of relocation base `idx` of a module.
    ///
    /// For relocatable modules that is the section name. Shared objects
    /// have a single, unnamed base.
    pub fn relocation_info(&mut self, id: ModuleId, idx: usize) -> Result<&str> {
        let (module, callbacks) = self.parts(id)?;
        let _main = module.ensure_elf(callbacks)?;
        let module = &*module;
        match module.e_type() {
            ET_REL => module
                .sections
                .as_ref()
                .and_then(|table| table.records().get(idx))
                .map(|record| record.name.as_str())
                .ok_or_else(|| {
                    Error::with_invalid_input(format!("relocation base {idx} does not exist"))
                }),
            ET_DYN if idx == 0 => Ok(""),
            _ => Err(Error::with_invalid_input(format!(
                "relocation base {idx} does not exist"
            ))),
        }
    }

    /// Convert a run-time address into one relative to its relocation
    /// base.
    ///
    /// For relocatable modules, the index of the containing section is
    /// reported as well.
    pub fn relocate_address(&mut self, id: ModuleId, addr: Addr) -> Result<(Option<usize>, Addr)> {
        let (module, callbacks) = self.parts(id)?;
        let _main = module.ensure_elf(callbacks)?;
        reloc::relocate_address(module, addr)
    }

    /// Convert a value relative to section `shndx` into a run-time
    /// address.
    pub fn relocate_value(&mut self, id: ModuleId, shndx: u16, value: Addr) -> Result<Addr> {
        let (module, callbacks) = self.parts(id)?;
        let _main = module.ensure_elf(callbacks)?;
        reloc::relocate_value(module, shndx, value)
    }

    /// Apply the run-time section layout of a relocatable module to its
    /// files. Doing so more than once has no further effect.
    pub fn relocate(&mut self, id: ModuleId) -> Result<()> {
        let (module, callbacks) = self.parts(id)?;
        let _main = module.ensure_elf(callbacks)?;
        reloc::relocate(module)
    }
}

impl Debug for Dwfl {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Dwfl")
            .field("modules", &self.modules().map(|(_id, module)| module).collect::<Vec<_>>())
            .field("segments", &self.segments)
            .field("offline_next", &self.offline_next)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::ffi::OsStr;
    use std::fs::write;

    use tempfile::tempdir;
    use test_log::test;
    use test_tag::tag;

    use crate::Result;

    use crate::elf::types::SHF_ALLOC;
    use crate::elf::types::SHF_EXECINSTR;
    use crate::elf::types::SHT_PROGBITS;
    use crate::elf::types::STB_GLOBAL;
    use crate::elf::types::STT_FUNC;
    use crate::test_helper::ElfBuilder;
    use crate::test_helper::SectionSpec;
    use crate::test_helper::SegmentSpec;
    use crate::test_helper::SymbolSpec;
    use crate::OfflineCallbacks;


    /// Callbacks that never find anything.
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


    fn names(dwfl: &Dwfl) -> Vec<&str> {
        dwfl.modules().map(|(_id, module)| module.name()).collect()
    }

    fn dso_image() -> Vec<u8> {
        ElfBuilder::new(ET_DYN)
            .segment(SegmentSpec::load(0x0, 0x1000).data(vec![0xcc; 0x200]))
            .section(
                SectionSpec::new(".text", SHT_PROGBITS)
                    .flags(SHF_ALLOC | SHF_EXECINSTR)
                    .addr(0x100)
                    .data(vec![0; 0x100]),
            )
            .symbol(
                SymbolSpec::new("compute", 0x100, 0x40)
                    .info(STB_GLOBAL, STT_FUNC)
                    .section(".text"),
            )
            .build_id(&[0xaa, 0xbb, 0xcc, 0xdd])
            .build()
    }


    /// Exercise the `Debug` representation of a context.
    #[tag(miri)]
    #[test]
    fn debug_repr() {
        let dwfl = Dwfl::new(NoFiles);
        assert_ne!(format!("{dwfl:?}"), "");
    }

    /// Check that a single reported module survives its round without
    /// the removal callback firing.
    #[tag(miri)]
    #[test]
    fn single_module_round() {
        let mut dwfl = Dwfl::new(NoFiles);
        let () = dwfl.report_begin();
        let id = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
        let mut removed = 0;
        let () = dwfl.report_end(|_module| removed += 1);

        assert_eq!(removed, 0);
        assert_eq!(dwfl.module_count(), 1);
        let module = dwfl.module(id).unwrap();
        assert_eq!(module.name(), "a");
        assert_eq!(module.range(), 0x1000..0x2000);
    }

    /// Check that modules not reported again get swept.
    #[tag(miri)]
    #[test]
    fn stale_module_removal() {
        let mut dwfl = Dwfl::new(NoFiles);
        let () = dwfl.report_begin();
        let a = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
        let b = dwfl.report_module("b", 0x2000, 0x3000).unwrap();
        let () = dwfl.report_end(|_module| panic!("no module should be removed"));

        let () = dwfl.report_begin();
        let a2 = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
        let mut removed = Vec::new();
        let () = dwfl.report_end(|module| removed.push(module.name().to_string()));

        assert_eq!(a, a2);
        assert_eq!(removed, vec!["b".to_string()]);
        assert_eq!(names(&dwfl), vec!["a"]);
        assert!(dwfl.module(b).is_none());
        assert_eq!(dwfl.addrmodule(0x2800), None);
    }

    /// Check that modules keep the order in which they got reported.
    #[tag(miri)]
    #[test]
    fn report_order() {
        let mut dwfl = Dwfl::new(NoFiles);
        let () = dwfl.report_begin();
        let _a = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
        let _b = dwfl.report_module("b", 0x2000, 0x3000).unwrap();
        let _c = dwfl.report_module("c", 0x3000, 0x4000).unwrap();
        let () = dwfl.report_end(|_module| ());

        let () = dwfl.report_begin();
        let _c = dwfl.report_module("c", 0x3000, 0x4000).unwrap();
        let _d = dwfl.report_module("d", 0x5000, 0x6000).unwrap();
        let _a = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
        // Before the round ends, stale modules trail.
        assert_eq!(names(&dwfl), vec!["c", "d", "a", "b"]);
        let () = dwfl.report_end(|_module| ());
        assert_eq!(names(&dwfl), vec!["c", "d", "a"]);
    }

    /// Make sure that invalid and overlapping ranges are rejected.
    #[tag(miri)]
    #[test]
    fn invalid_reports() {
        let mut dwfl = Dwfl::new(NoFiles);
        let () = dwfl.report_begin();
        let err = dwfl.report_module("a", 0x2000, 0x1000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let _a = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
        let err = dwfl.report_module("b", 0x1800, 0x2800).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overlap);
        let err = dwfl.report_module("a", 0x1000, 0x1800).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overlap);
        // Adjacent modules are fine.
        let _b = dwfl.report_module("b", 0x2000, 0x2800).unwrap();
        let () = dwfl.report_end(|_module| ());

        // A stale module does not stand in the way.
        let () = dwfl.report_begin();
        let _c = dwfl.report_module("c", 0x1800, 0x2800).unwrap();
        let () = dwfl.report_end(|_module| ());
        assert_eq!(names(&dwfl), vec!["c"]);
    }

    /// Check that `report_begin_add` keeps existing modules.
    #[tag(miri)]
    #[test]
    fn additive_round() {
        let mut dwfl = Dwfl::new(NoFiles);
        let () = dwfl.report_begin();
        let a = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
        let () = dwfl.report_end(|_module| ());
        assert_eq!(dwfl.addrmodule(0x1000), Some(a));

        let () = dwfl.report_begin_add();
        let b = dwfl.report_module("b", 0x4000, 0x5000).unwrap();
        let () = dwfl.report_end(|_module| panic!("no module should be removed"));
        assert_eq!(names(&dwfl), vec!["a", "b"]);
        assert_eq!(dwfl.addrmodule(0x1fff), Some(a));
        assert_eq!(dwfl.addrmodule(0x4000), Some(b));
    }

    /// Check that every address of a module maps back to it.
    #[tag(miri)]
    #[test]
    fn address_lookup() {
        let mut dwfl = Dwfl::new(NoFiles);
        let () = dwfl.report_begin();
        let a = dwfl.report_module("a", 0x1000, 0x1100).unwrap();
        let b = dwfl.report_module("b", 0x1100, 0x1180).unwrap();
        let c = dwfl.report_module("c", 0x2000, 0x2010).unwrap();
        let () = dwfl.report_end(|_module| ());

        for (id, range) in [(a, 0x1000..0x1100), (b, 0x1100..0x1180), (c, 0x2000..0x2010)] {
            for addr in range {
                assert_eq!(dwfl.addrmodule(addr), Some(id), "{addr:#x}");
            }
        }
        assert_eq!(dwfl.addrmodule(0xfff), None);
        assert_eq!(dwfl.addrmodule(0x1800), None);
        // The end of the last module in a run still maps to it.
        assert_eq!(dwfl.addrmodule(0x1180), Some(b));
        assert_eq!(dwfl.module(a).unwrap().segment(), Some(0));
    }

    /// Check that reported segments are visible through
    /// `addrsegment`.
    #[tag(miri)]
    #[test]
    fn segment_reporting() {
        let mut dwfl = Dwfl::new(NoFiles);
        let () = dwfl.report_begin();
        let phdr = Phdr {
            p_type: PT_LOAD,
            p_flags: 0,
            p_offset: 0,
            p_vaddr: 0x1000,
            p_paddr: 0x1000,
            p_filesz: 0x1000,
            p_memsz: 0x1000,
            p_align: 0x1000,
        };
        assert_eq!(dwfl.report_segment(0, &phdr, 0x10000, b"").unwrap(), 0);
        let id = dwfl.report_module("m", 0x11000, 0x11800).unwrap();
        let () = dwfl.report_end(|_module| ());

        assert_eq!(dwfl.addrsegment(0x11000), Some((0, Some(id))));
        // The module got rounded up to the segment alignment.
        assert_eq!(dwfl.addrsegment(0x11fff), Some((0, Some(id))));
        assert_eq!(dwfl.addrsegment(0x12000), Some((-1, None)));

        let wrapping = Phdr {
            p_memsz: u64::MAX,
            ..phdr
        };
        let err = dwfl.report_segment(1, &wrapping, 0, b"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    /// Check that an in-memory shared object can be reported at a
    /// base and that its symbols are relocated.
    #[test]
    fn elf_reporting() {
        let found = FoundElf::from_image(dso_image()).unwrap();
        let mut dwfl = Dwfl::new(NoFiles);
        let () = dwfl.report_begin();
        let id = dwfl.report_elf_file("libfoo.so", found, 0x7f0000000000, true).unwrap();
        let () = dwfl.report_end(|_module| ());

        let module = dwfl.module(id).unwrap();
        assert_eq!(module.low(), 0x7f0000000000);
        assert!(module.high() > 0x7f0000000200);
        assert_eq!(module.e_type(), ET_DYN);

        let (_elf, bias) = dwfl.module_getelf(id).unwrap();
        assert_eq!(bias, 0x7f0000000000);
        assert_eq!(
            dwfl.module_build_id(id).unwrap().bytes(),
            Some([0xaa, 0xbb, 0xcc, 0xdd].as_slice())
        );
        assert_eq!(dwfl.module_getsymtab(id).unwrap(), 2);
        assert_eq!(dwfl.module_symtab_source(id).unwrap(), SymtabSource::MainSymtab);

        let addr = 0x7f0000000110;
        assert_eq!(dwfl.addrmodule(addr), Some(id));
        let sym = dwfl.module_addrsym(id, addr).unwrap().unwrap();
        assert_eq!(sym.name, "compute");
        assert_eq!(sym.addr, 0x7f0000000100);
        assert_eq!(dwfl.module_addrname(id, addr).unwrap().as_deref(), Some("compute"));

        assert_eq!(dwfl.relocations(id).unwrap(), 1);
        assert_eq!(dwfl.relocation_info(id, 0).unwrap(), "");
        assert_eq!(dwfl.relocate_address(id, addr).unwrap(), (None, 0x110));
        assert_eq!(dwfl.relocate_value(id, 1, 0x110).unwrap(), addr);
    }

    /// Check that a module without a file fails lookups consistently.
    #[tag(miri)]
    #[test]
    fn missing_files() {
        let mut dwfl = Dwfl::new(NoFiles);
        let () = dwfl.report_begin();
        let id = dwfl.report_module("nothing", 0x1000, 0x2000).unwrap();
        let () = dwfl.report_end(|_module| ());

        let err = dwfl.module_getelf(id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = dwfl.module_addrsym(id, 0x1000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = dwfl.module_build_id(id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let () = dwfl.module_revalidate(id).unwrap();
        let err = dwfl.module_getelf(ModuleId::new(42)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    /// Check that relocatable objects are placed one after the other
    /// when reported offline.
    #[test]
    fn offline_placement() {
        let dir = tempdir().unwrap();
        let object = ElfBuilder::new(ET_REL)
            .section(
                SectionSpec::new(".text", SHT_PROGBITS)
                    .flags(SHF_ALLOC | SHF_EXECINSTR)
                    .align(16)
                    .data(vec![0; 0x1234]),
            )
            .section(
                SectionSpec::new(".data", SHT_PROGBITS)
                    .flags(SHF_ALLOC)
                    .align(8)
                    .data(vec![0; 0x10]),
            )
            .symbol(
                SymbolSpec::new("entry", 0x20, 0x10)
                    .info(STB_GLOBAL, STT_FUNC)
                    .section(".text"),
            )
            .build();
        let path = dir.path().join("object.o");
        let () = write(&path, object).unwrap();

        let mut dwfl = Dwfl::new(OfflineCallbacks::default());
        let () = dwfl.report_begin();
        let first = dwfl.report_offline("first", &path).unwrap();
        let second = dwfl.report_offline("second", &path).unwrap();
        let () = dwfl.report_end(|_module| ());

        let first = dwfl.module(first).unwrap();
        assert_eq!(first.low(), OFFLINE_REDZONE);
        assert_eq!(first.high(), OFFLINE_REDZONE + 0x1238 + 0x10);
        assert_eq!(dwfl.module(second).unwrap().low(), 3 * OFFLINE_REDZONE);

        assert_eq!(dwfl.relocations(second).unwrap(), 2);
        assert_eq!(dwfl.relocation_info(second, 0).unwrap(), ".text");
        assert_eq!(dwfl.relocation_info(second, 1).unwrap(), ".data");
        let err = dwfl.relocation_info(second, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let sym = dwfl
            .module_addrsym(second, 3 * OFFLINE_REDZONE + 0x28)
            .unwrap()
            .unwrap();
        assert_eq!(sym.name, "entry");
        assert_eq!(sym.addr, 3 * OFFLINE_REDZONE + 0x20);

        let data = dwfl.relocate_address(second, 3 * OFFLINE_REDZONE + 0x1238).unwrap();
        assert_eq!(data.1, 0);
        let () = dwfl.relocate(second).unwrap();
        let () = dwfl.relocate(second).unwrap();
    }
}
