use dwfl::elf::types::ET_DYN;
use dwfl::elf::types::SHF_ALLOC;
use dwfl::elf::types::SHF_EXECINSTR;
use dwfl::elf::types::SHT_PROGBITS;
use dwfl::elf::types::STB_GLOBAL;
use dwfl::elf::types::STT_FUNC;
use dwfl::elf::types::STT_NOTYPE;
use dwfl::Addr;
use dwfl::Dwfl;
use dwfl::ModuleId;
use dwfl::OfflineCallbacks;
use dwfl::SymtabSource;
use dwfl::__private::ElfBuilder;
use dwfl::__private::SectionSpec;
use dwfl::__private::SegmentSpec;
use dwfl::__private::SymbolSpec;

use tempfile::tempdir;
use tempfile::TempDir;
use test_log::test;

use super::common::object_image;
use super::common::write_file;


fn report(name: &str, image: &[u8]) -> (TempDir, Dwfl, ModuleId) {
    let dir = tempdir().unwrap();
    let path = write_file(dir.path(), name, image);
    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let () = dwfl.report_begin();
    let id = dwfl.report_offline(name, &path).unwrap();
    let () = dwfl.report_end(|_module| ());
    (dir, dwfl, id)
}

fn addrsym_name(dwfl: &mut Dwfl, id: ModuleId, addr: Addr) -> Option<String> {
    dwfl.module_addrsym(id, addr)
        .unwrap()
        .map(|sym| sym.name.to_string())
}


/// Check how overlapping symbols and labels are ranked against each
/// other.
#[test]
fn symbol_tie_break() {
    let func = |name, addr, size| {
        SymbolSpec::new(name, addr, size)
            .info(STB_GLOBAL, STT_FUNC)
            .section(".text")
    };
    let label = |name, addr| {
        SymbolSpec::new(name, addr, 0)
            .info(STB_GLOBAL, STT_NOTYPE)
            .section(".text")
    };

    let image = ElfBuilder::new(ET_DYN)
        .segment(SegmentSpec::load(0x0, 0x1000).data(vec![0xcc; 0x200]))
        .section(
            SectionSpec::new(".text", SHT_PROGBITS)
                .flags(SHF_ALLOC | SHF_EXECINSTR)
                .addr(0x100)
                .data(vec![0; 0x100]),
        )
        .symbol(func("long", 0x100, 10))
        .symbol(func("short", 0x100, 5))
        .symbol(label("shadowed", 0x108))
        .symbol(label("trailing", 0x180))
        .build();
    let (_dir, mut dwfl, id) = report("libtie.so", &image);
    assert_eq!(dwfl.module_symtab_source(id).unwrap(), SymtabSource::MainSymtab);

    // Both sized symbols start at the same address, but only the larger
    // one covers the queried address.
    assert_eq!(addrsym_name(&mut dwfl, id, 0x105).as_deref(), Some("long"));
    assert_eq!(addrsym_name(&mut dwfl, id, 0x109).as_deref(), Some("long"));
    // Past all sized symbols, a label only qualifies if it is not
    // below the end of any of them.
    assert_eq!(addrsym_name(&mut dwfl, id, 0x10c), None);
    assert_eq!(addrsym_name(&mut dwfl, id, 0x190).as_deref(), Some("trailing"));

    let sym = dwfl.module_addrsym(id, 0x190).unwrap().unwrap();
    assert_eq!(sym.addr, 0x180);
    assert_eq!(sym.size, 0);
}

/// Check that relocating a relocatable module more than once does not
/// change any addresses.
#[test]
fn relocation_idempotence() {
    let (_dir, mut dwfl, id) = report("object.o", &object_image());
    let low = dwfl.module(id).unwrap().low();

    assert_eq!(dwfl.relocations(id).unwrap(), 2);
    assert_eq!(dwfl.relocation_info(id, 0).unwrap(), ".text");
    assert_eq!(dwfl.relocation_info(id, 1).unwrap(), ".data");

    let probe = low + 0x90;
    let (shndx, offset) = dwfl.relocate_address(id, probe).unwrap();
    let shndx = shndx.unwrap();
    assert_eq!(offset, 0x90);

    let snapshot = |dwfl: &mut Dwfl| {
        let sym = dwfl
            .module_addrsym(id, probe)
            .unwrap()
            .map(|sym| sym.into_owned())
            .unwrap();
        let value = dwfl.relocate_value(id, shndx as u16, 0x80).unwrap();
        let address = dwfl.relocate_address(id, probe).unwrap();
        (sym, value, address)
    };

    let () = dwfl.relocate(id).unwrap();
    let once = snapshot(&mut dwfl);
    let () = dwfl.relocate(id).unwrap();
    let twice = snapshot(&mut dwfl);
    assert_eq!(once, twice);

    let (sym, value, _address) = once;
    assert_eq!(sym.name, "relocated_fn");
    assert_eq!(sym.addr, low + 0x80);
    assert_eq!(value, low + 0x80);
}
