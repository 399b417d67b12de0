use std::fs::write;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use dwfl::elf::types::ET_DYN;
use dwfl::elf::types::ET_REL;
use dwfl::elf::types::SHF_ALLOC;
use dwfl::elf::types::SHF_EXECINSTR;
use dwfl::elf::types::SHT_PROGBITS;
use dwfl::elf::types::STB_GLOBAL;
use dwfl::elf::types::STT_FUNC;
use dwfl::elf::ElfParser;
use dwfl::CoreMemory;
use dwfl::__private::core_image;
use dwfl::__private::ElfBuilder;
use dwfl::__private::SectionSpec;
use dwfl::__private::SegmentSpec;
use dwfl::__private::SymbolSpec;


/// The build ID stamped into synthesized shared objects.
pub const BUILD_ID: [u8; 6] = [0x51, 0x7a, 0x09, 0x3e, 0xc4, 0x10];


/// Create a shared object with a `.text` section at 0x100 and a
/// single function symbol `compute` in it.
pub fn dso_builder() -> ElfBuilder {
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
}

/// Create a shared object image fitting into a single page, suitable
/// for embedding into core file segments.
pub fn dso_page(soname: Option<&str>) -> Vec<u8> {
    let mut builder = ElfBuilder::new(ET_DYN)
        .segment(SegmentSpec::load(0x0, 0x1000).data(vec![0x90; 0x200]))
        .dynsym(SymbolSpec::new("embedded_fn", 0x100, 0x40))
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

/// Create a relocatable object with a `.text` and a `.data` section.
pub fn object_image() -> Vec<u8> {
    ElfBuilder::new(ET_REL)
        .section(
            SectionSpec::new(".text", SHT_PROGBITS)
                .flags(SHF_ALLOC | SHF_EXECINSTR)
                .align(16)
                .data(vec![0; 0x300]),
        )
        .section(
            SectionSpec::new(".data", SHT_PROGBITS)
                .flags(SHF_ALLOC)
                .align(8)
                .data(vec![0; 0x20]),
        )
        .symbol(
            SymbolSpec::new("relocated_fn", 0x80, 0x20)
                .info(STB_GLOBAL, STT_FUNC)
                .section(".text"),
        )
        .build()
}

/// Parse a synthesized core file and wrap its memory.
pub fn core(segments: Vec<SegmentSpec>) -> (Rc<ElfParser>, Rc<CoreMemory>) {
    let image = core_image(segments, Vec::new());
    let elf = Rc::new(ElfParser::from_bytes(image, None).unwrap());
    let memory = Rc::new(CoreMemory::new(elf.clone()).unwrap());
    (elf, memory)
}

/// Write `data` to the file `name` inside of `dir`.
pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    let () = write(&path, data).unwrap();
    path
}
