use std::hint::black_box;

use dwfl::Dwfl;
use dwfl::OfflineCallbacks;
use dwfl::Pid;
use dwfl::ProcCallbacks;

use criterion::measurement::Measurement;
use criterion::Bencher;
use criterion::BenchmarkGroup;


/// Report the modules of the current process.
fn report_proc() {
    let mut dwfl = Dwfl::new(ProcCallbacks::new(Pid::Slf));
    let () = dwfl.report_begin();
    let count = dwfl.report_proc(black_box(Pid::Slf)).unwrap();
    let () = dwfl.report_end(|_module| ());
    assert!(count > 0);
}

/// Benchmark repeated reporting rounds based on a fixed maps listing,
/// in which every module is already known.
fn report_maps_rounds<M>(b: &mut Bencher<'_, M>)
where
    M: Measurement,
{
    let maps = (0..256u64)
        .map(|i| {
            let start = 0x7f0000000000 + i * 0x10000;
            format!(
                "{:x}-{:x} r-xp 00000000 08:02 {} /usr/lib/lib{i}.so\n",
                start,
                start + 0x8000,
                1000 + i
            )
        })
        .collect::<String>();

    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let () = b.iter(|| {
        let () = dwfl.report_begin();
        let count = dwfl
            .report_maps(black_box(maps.as_bytes()), None, Pid::from(1))
            .unwrap();
        let () = dwfl.report_end(|_module| ());
        assert_eq!(count, 256);
    });
}


pub fn benchmark<M>(group: &mut BenchmarkGroup<'_, M>)
where
    M: Measurement,
{
    bench_fn!(group, report_proc);
    bench_sub_fn!(group, report_maps_rounds);
}
