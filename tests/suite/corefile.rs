use dwfl::CoreCallbacks;
use dwfl::Dwfl;
use dwfl::__private::SegmentSpec;

use test_log::test;

use super::common::core;
use super::common::dso_page;
use super::common::BUILD_ID;


/// Check that a core file with an ELF image embedded into the middle
/// of a segment yields a module per segment plus one for the image.
#[test]
fn embedded_image() {
    let mut mixed = vec![0xee; 0x1000];
    let () = mixed.extend(dso_page(None));
    let () = mixed.extend(vec![0xee; 0x1000]);

    let (elf, memory) = core(vec![
        SegmentSpec::load(0x400000, 0x1000).data(vec![0xaa; 0x1000]),
        SegmentSpec::load(0x500000, 0x1000).data(vec![0xbb; 0x2000]).writable(),
        SegmentSpec::load(0x600000, 0x1000).data(mixed),
    ]);

    let mut dwfl = Dwfl::new(CoreCallbacks::new(memory.clone()));
    let () = dwfl.report_begin();
    let count = dwfl.report_core(&elf, &memory).unwrap();
    let () = dwfl.report_end(|_module| ());
    assert_eq!(count, 4);

    let modules = dwfl
        .modules()
        .map(|(_id, module)| (module.name().to_string(), module.range()))
        .collect::<Vec<_>>();
    assert_eq!(
        modules[..3],
        [
            ("[core:0]".to_string(), 0x400000..0x401000),
            ("[core:1]".to_string(), 0x500000..0x502000),
            ("[core:2]".to_string(), 0x600000..0x601000),
        ]
    );
    let (name, range) = &modules[3];
    assert_eq!(name, "[elf@0x601000]");
    assert_eq!(range.start, 0x601000);
    assert!(range.end > 0x601140 && range.end <= 0x602000, "{range:#x?}");

    let image = dwfl.addrmodule(0x601100).unwrap();
    assert_eq!(dwfl.module(image).unwrap().name(), "[elf@0x601000]");
    assert_eq!(
        dwfl.module_build_id(image).unwrap().bytes(),
        Some(BUILD_ID.as_slice())
    );
    let sym = dwfl.module_addrsym(image, 0x601120).unwrap().unwrap();
    assert_eq!(sym.name, "embedded_fn");
    assert_eq!(sym.addr, 0x601100);

    // Segment indices follow the order of the core file's program
    // headers.
    let (ndx, module) = dwfl.addrsegment(0x500800).unwrap();
    assert_eq!(ndx, 1);
    assert_eq!(dwfl.module(module.unwrap()).unwrap().name(), "[core:1]");
}

/// Check that a shared object named by its `DT_SONAME` takes the place
/// of the segment it got found in.
#[test]
fn named_image() {
    let (elf, memory) = core(vec![
        SegmentSpec::load(0x7f0000000000, 0x1000).data(dso_page(Some("libnamed.so.1"))),
    ]);

    let mut dwfl = Dwfl::new(CoreCallbacks::new(memory.clone()));
    let () = dwfl.report_begin();
    let count = dwfl.report_core(&elf, &memory).unwrap();
    let () = dwfl.report_end(|_module| ());
    assert_eq!(count, 1);

    let (id, module) = dwfl.modules().next().unwrap();
    assert_eq!(module.name(), "libnamed.so.1");
    let (_elf, bias) = dwfl.module_getelf(id).unwrap();
    assert_eq!(bias, 0x7f0000000000);
}
