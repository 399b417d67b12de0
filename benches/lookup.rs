use std::hint::black_box;

use dwfl::Addr;
use dwfl::Dwfl;
use dwfl::OfflineCallbacks;
use dwfl::Pid;
use dwfl::ProcCallbacks;

use criterion::measurement::Measurement;
use criterion::Bencher;
use criterion::BenchmarkGroup;


/// Benchmark address to module lookup in a context with many modules.
fn addrmodule_many<M>(b: &mut Bencher<'_, M>)
where
    M: Measurement,
{
    let mut dwfl = Dwfl::new(OfflineCallbacks::default());
    let () = dwfl.report_begin();
    for i in 0..4096u64 {
        let start = 0x10000 + i * 0x2000;
        let _id = dwfl
            .report_module(&format!("mod{i}"), start, start + 0x1000)
            .unwrap();
    }
    let () = dwfl.report_end(|_module| ());

    let addrs = (0..4096u64)
        .map(|i| 0x10000 + i * 0x2000 + 0x800)
        .collect::<Vec<Addr>>();
    let () = b.iter(|| {
        for addr in &addrs {
            let id = dwfl.addrmodule(black_box(*addr));
            let _id = black_box(id);
        }
    });
}

/// Benchmark symbol lookup for functions of the current process,
/// with the symbol table already loaded.
fn addrsym_process<M>(b: &mut Bencher<'_, M>)
where
    M: Measurement,
{
    let mut dwfl = Dwfl::new(ProcCallbacks::new(Pid::Slf));
    let () = dwfl.report_begin();
    let _count = dwfl.report_proc(Pid::Slf).unwrap();
    let () = dwfl.report_end(|_module| ());

    let addrs = [
        addrsym_process::<M> as *const () as Addr,
        addrmodule_many::<M> as *const () as Addr,
        Dwfl::addrmodule as *const () as Addr,
    ];
    let ids = addrs
        .iter()
        .map(|addr| dwfl.addrmodule(*addr).unwrap())
        .collect::<Vec<_>>();

    let () = b.iter(|| {
        for (id, addr) in ids.iter().zip(&addrs) {
            let sym = dwfl.module_addrsym(*id, black_box(*addr)).unwrap();
            let _sym = black_box(sym);
        }
    });
}


pub fn benchmark<M>(group: &mut BenchmarkGroup<'_, M>)
where
    M: Measurement,
{
    bench_sub_fn!(group, addrmodule_many);
    bench_sub_fn!(group, addrsym_process);
}
