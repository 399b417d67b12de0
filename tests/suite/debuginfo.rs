use std::fs::read as read_file;
use std::fs::write;
use std::path::Path;

use dwfl::elf::notes::read_build_id;
use dwfl::elf::types::ET_DYN;
use dwfl::elf::types::SHT_PROGBITS;
use dwfl::elf::ElfParser;
use dwfl::Dwfl;
use dwfl::ErrorKind;
use dwfl::OfflineCallbacks;
use dwfl::__private::debug_link_crc32;
use dwfl::__private::ElfBuilder;
use dwfl::__private::SectionSpec;
use dwfl::__private::SegmentSpec;

use tempfile::tempdir;
use test_log::test;

use super::common::dso_builder;
use super::common::write_file;
use super::common::BUILD_ID;


/// Check that the build ID is the same, whether it is found through
/// section headers or program headers.
#[test]
fn build_id_sources() {
    let with_shdrs = dso_builder().build_id(&BUILD_ID).build();
    let without_shdrs = dso_builder()
        .build_id(&BUILD_ID)
        .strip_section_headers()
        .build();

    let with_shdrs = ElfParser::from_bytes(with_shdrs, None).unwrap();
    let without_shdrs = ElfParser::from_bytes(without_shdrs, None).unwrap();
    assert!(with_shdrs.shnum() > 0);
    assert_eq!(without_shdrs.shnum(), 0);

    let (id1, addr1) = read_build_id(&with_shdrs).unwrap().unwrap();
    let (id2, addr2) = read_build_id(&without_shdrs).unwrap().unwrap();
    assert_eq!(id1, BUILD_ID);
    assert_eq!(id1, id2);
    assert_eq!(addr1, addr2);
}

/// Check that a module reporting a build ID of its own accepts a file
/// with the same one only.
#[test]
fn build_id_validation() {
    let dir = tempdir().unwrap();
    let path = write_file(dir.path(), "libid.so", &dso_builder().build_id(&BUILD_ID).build());

    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let () = dwfl.report_begin();
    let id = dwfl.report_offline("libid.so", &path).unwrap();
    let () = dwfl.report_end(|_module| ());
    assert_eq!(
        dwfl.module_build_id(id).unwrap().bytes(),
        Some(BUILD_ID.as_slice())
    );
    let () = dwfl.module_revalidate(id).unwrap();
}


/// Create a separate debug file image.
fn debug_image() -> Vec<u8> {
    ElfBuilder::new(ET_DYN)
        .segment(SegmentSpec::load(0x0, 0x1000).data(vec![0xaa; 0x40]))
        .section(SectionSpec::new(".debug_info", SHT_PROGBITS).data(vec![0; 0x20]))
        .build()
}

/// Report the file at `path` offline and look up its debug file.
fn lookup_debug(path: &Path) -> dwfl::Result<Option<std::path::PathBuf>> {
    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let () = dwfl.report_begin();
    let id = dwfl.report_offline("main", path)?;
    let () = dwfl.report_end(|_module| ());
    let (debug, _bias) = dwfl.module_getdebug(id)?;
    Ok(debug.path().map(Path::to_path_buf))
}

/// Check that debug link checksums are honored.
#[test]
fn debuglink_crc() {
    let dir = tempdir().unwrap();
    let mut debug = debug_image();
    let crc = debug_link_crc32(&debug);
    let debug_path = write_file(dir.path(), "main.debug", &debug);

    let main = dso_builder().debuglink("main.debug", crc).build();
    let main_path = write_file(dir.path(), "main", &main);

    let found = lookup_debug(&main_path).unwrap();
    assert_eq!(found.as_deref(), Some(debug_path.as_path()));
    assert_eq!(debug_link_crc32(&read_file(&debug_path).unwrap()), crc);

    // Flip a single bit in the payload of the debug file. It is still a
    // valid ELF file, but no longer matches the checksum.
    let pos = debug
        .windows(0x40)
        .position(|window| window.iter().all(|b| *b == 0xaa))
        .unwrap();
    debug[pos] ^= 0x1;
    let () = write(&debug_path, &debug).unwrap();
    assert_ne!(debug_link_crc32(&debug), crc);

    let err = lookup_debug(&main_path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoDwarf);
}
