use dwfl::Dwfl;
use dwfl::ErrorKind;
use dwfl::OfflineCallbacks;

use test_log::test;


fn spans(dwfl: &Dwfl) -> Vec<(String, u64, u64)> {
    dwfl.modules()
        .map(|(_id, module)| (module.name().to_string(), module.low(), module.high()))
        .collect()
}


/// Check that a module reported in a single round is kept and that
/// nothing is reported as removed.
#[test]
fn single_round() {
    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let mut removed = 0;
    let () = dwfl.report_begin();
    let _id = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
    let () = dwfl.report_end(|_module| removed += 1);

    assert_eq!(removed, 0);
    assert_eq!(spans(&dwfl), vec![("a".to_string(), 0x1000, 0x2000)]);
}

/// Check that a module not reported again in a later round gets
/// removed, with the removal callback firing exactly once.
#[test]
fn stale_module_removal() {
    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let () = dwfl.report_begin();
    let a = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
    let _b = dwfl.report_module("b", 0x2000, 0x3000).unwrap();
    let () = dwfl.report_end(|_module| panic!("nothing should be removed"));

    let mut removed = Vec::new();
    let () = dwfl.report_begin();
    let a_again = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
    let () = dwfl.report_end(|module| removed.push(module.name().to_string()));

    assert_eq!(removed, vec!["b".to_string()]);
    assert_eq!(a, a_again);
    assert_eq!(spans(&dwfl), vec![("a".to_string(), 0x1000, 0x2000)]);

    // Another round does not bring up "b" again.
    let mut removed = 0;
    let () = dwfl.report_begin();
    let _a = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
    let () = dwfl.report_end(|_module| removed += 1);
    assert_eq!(removed, 0);
}

/// Check that an additive round keeps existing modules.
#[test]
fn additive_round() {
    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let () = dwfl.report_begin();
    let _a = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
    let () = dwfl.report_end(|_module| ());

    let () = dwfl.report_begin_add();
    let _c = dwfl.report_module("c", 0x8000, 0x9000).unwrap();
    let () = dwfl.report_end(|_module| panic!("nothing should be removed"));
    assert_eq!(dwfl.module_count(), 2);
}

/// Make sure that overlapping live modules are rejected, while stale
/// ones do not get in the way.
#[test]
fn overlap_rejection() {
    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let () = dwfl.report_begin();
    let _a = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
    let err = dwfl.report_module("b", 0x1800, 0x2800).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Overlap);
    let () = dwfl.report_end(|_module| ());

    // "a" is stale as soon as a new round begins, so it no longer
    // conflicts.
    let () = dwfl.report_begin();
    let _b = dwfl.report_module("b", 0x1800, 0x2800).unwrap();
    let () = dwfl.report_end(|_module| ());
    assert_eq!(spans(&dwfl), vec![("b".to_string(), 0x1800, 0x2800)]);

    let () = dwfl.report_begin();
    let err = dwfl.report_module("bad", 0x3000, 0x2000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

/// Check that every address of a module maps back to it, and that
/// addresses in between modules map to none.
#[test]
fn address_lookup() {
    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let () = dwfl.report_begin();
    let a = dwfl.report_module("a", 0x1000, 0x2000).unwrap();
    let b = dwfl.report_module("b", 0x2000, 0x2800).unwrap();
    let c = dwfl.report_module("c", 0x5000, 0x5001).unwrap();
    let () = dwfl.report_end(|_module| ());

    for (id, low, high) in [(a, 0x1000, 0x2000), (b, 0x2000, 0x2800), (c, 0x5000, 0x5001)] {
        for addr in [low, low + (high - low) / 2, high - 1] {
            assert_eq!(dwfl.addrmodule(addr), Some(id), "{addr:#x}");
        }
    }

    assert_eq!(dwfl.addrmodule(0xfff), None);
    assert_eq!(dwfl.addrmodule(0x4fff), None);
    assert_eq!(dwfl.addrmodule(0x5002), None);
    // An address right at the end of a module is attributed to it, if
    // no other module starts there.
    assert_eq!(dwfl.addrmodule(0x5001), Some(c));
    assert_eq!(dwfl.addrmodule(0x2800), Some(b));

    let modules = dwfl
        .modules()
        .map(|(_id, module)| module.range())
        .collect::<Vec<_>>();
    for (i, range) in modules.iter().enumerate() {
        assert!(range.start <= range.end);
        for other in &modules[i + 1..] {
            assert!(range.end <= other.start || other.end <= range.start);
        }
    }
}
