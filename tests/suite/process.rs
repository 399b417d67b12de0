use std::env::current_exe;
use std::path::Path;

use dwfl::Addr;
use dwfl::Auxv;
use dwfl::Dwfl;
use dwfl::OfflineCallbacks;
use dwfl::Pid;
use dwfl::ProcCallbacks;

use test_log::test;


/// Encode an auxiliary vector in the layout of the running system.
fn auxv_bytes(entries: &[(u64, u64)]) -> Vec<u8> {
    entries
        .iter()
        .chain([(0, 0)].iter())
        .flat_map(|(type_, value)| type_.to_ne_bytes().into_iter().chain(value.to_ne_bytes()))
        .collect()
}


/// Check that the mapping at `AT_SYSINFO_EHDR` is reported as the
/// process's vDSO, no matter how it is named.
#[test]
fn vdso_from_auxv() {
    // AT_PHENT, AT_PAGESZ, AT_SYSINFO_EHDR
    let auxv = auxv_bytes(&[(3, 0x400040), (4, 56), (6, 0x1000), (33, 0x7fff0000)]);
    let auxv = Auxv::parse(&auxv).unwrap();
    assert_eq!(auxv.sysinfo_ehdr(), Some(0x7fff0000));

    let maps = "\
00400000-00402000 r-xp 00000000 08:02 4711       /usr/bin/true
7ffe0000-7ffe1000 rw-p 00000000 00:00 0
7fff0000-7fff1000 r-xp 00000000 00:00 0
";

    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let () = dwfl.report_begin();
    let count = dwfl
        .report_maps(maps.as_bytes(), auxv.sysinfo_ehdr(), Pid::from(42))
        .unwrap();
    let () = dwfl.report_end(|_module| ());
    assert_eq!(count, 2);

    let id = dwfl.addrmodule(0x7fff0800).unwrap();
    let vdso = dwfl.module(id).unwrap();
    assert!(vdso.name().contains("vdso"), "{}", vdso.name());
    assert_eq!(vdso.range(), 0x7fff0000..0x7fff1000);
    assert_eq!(dwfl.addrmodule(0x7ffe0800), None);
}


#[inline(never)]
fn lookup_target() -> usize {
    1337
}

/// Check that we can find a function of our own process by address.
#[test]
fn own_process_symbol() {
    let mut dwfl = Dwfl::new(ProcCallbacks::new(Pid::Slf));
    let () = dwfl.report_begin();
    let count = dwfl.report_proc(Pid::Slf).unwrap();
    let () = dwfl.report_end(|_module| ());
    assert!(count > 0);

    assert_eq!(lookup_target(), 1337);
    let addr = lookup_target as *const () as Addr;
    let id = dwfl.addrmodule(addr).unwrap();
    let exe = current_exe().unwrap();
    assert_eq!(Path::new(dwfl.module(id).unwrap().name()), exe);

    let sym = dwfl.module_addrsym(id, addr).unwrap().unwrap();
    assert!(sym.name.contains("lookup_target"), "{sym:?}");
    assert_eq!(sym.addr, addr);

    let name = dwfl.module_addrname(id, addr + 1).unwrap().unwrap();
    assert!(name.contains("lookup_target"), "{name}");
}
