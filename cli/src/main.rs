#![allow(clippy::let_and_return, clippy::let_unit_value)]

mod args;

use std::path::Path;
use std::rc::Rc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use dwfl::elf::notes::read_build_id;
use dwfl::elf::ElfParser;
use dwfl::Addr;
use dwfl::CoreCallbacks;
use dwfl::CoreMemory;
use dwfl::Dwfl;
use dwfl::ErrorKind;
use dwfl::KernelCallbacks;
use dwfl::OfflineCallbacks;
use dwfl::ProcCallbacks;

use clap::Parser as _;

use tracing::subscriber::set_global_default as set_global_subscriber;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::FmtSubscriber;


fn format_build_id_bytes(build_id: &[u8]) -> String {
    build_id
        .iter()
        .fold(String::with_capacity(build_id.len() * 2), |mut s, b| {
            let () = s.push_str(&format!("{b:02x}"));
            s
        })
}


/// Print all modules known to `dwfl`, in list order.
fn print_modules(dwfl: &mut Dwfl) {
    let ids = dwfl.modules().map(|(id, _module)| id).collect::<Vec<_>>();
    for id in ids {
        let build_id = match dwfl.module_build_id(id) {
            Ok(build_id) => build_id.to_string(),
            Err(err) => {
                warn!("failed to retrieve build ID of module {id}: {err}");
                "<unknown>".to_string()
            }
        };
        // SANITY: `id` was just reported by the context.
        let module = dwfl.module(id).unwrap();
        println!(
            "{:#016x}-{:#016x} {build_id:<40} {}",
            module.low(),
            module.high(),
            module.name()
        );
    }
}

/// Open a core file, reporting its modules to a new context.
fn open_core(path: &Path, debuginfo_path: Option<String>) -> Result<Dwfl> {
    let elf = ElfParser::open(path).context("failed to open core file")?;
    let elf = Rc::new(elf);
    let memory = Rc::new(CoreMemory::new(Rc::clone(&elf))?);
    let mut callbacks = CoreCallbacks::new(Rc::clone(&memory));
    callbacks.debuginfo_path = debuginfo_path;
    let mut dwfl = Dwfl::new(callbacks);
    let () = dwfl.report_begin();
    let _count = dwfl
        .report_core(&elf, &memory)
        .with_context(|| format!("failed to report modules of core file {}", path.display()))?;
    let () = dwfl.report_end(|_module| ());
    Ok(dwfl)
}

/// The handler for the 'modules' command.
fn modules(modules: args::modules::Modules) -> Result<()> {
    let mut dwfl = match modules {
        args::modules::Modules::Proc(args::modules::Proc { pid }) => {
            let mut dwfl = Dwfl::new(ProcCallbacks::new(pid));
            let () = dwfl.report_begin();
            let _count = dwfl
                .report_proc(pid)
                .with_context(|| format!("failed to report modules of process {pid}"))?;
            let () = dwfl.report_end(|_module| ());
            dwfl
        }
        args::modules::Modules::Core(args::modules::Core { path }) => open_core(&path, None)?,
        args::modules::Modules::Kernel => {
            let mut dwfl = Dwfl::new(KernelCallbacks::new());
            let () = dwfl.report_begin();
            let _id = dwfl.report_kernel().context("failed to report kernel")?;
            if let Err(err) = dwfl.report_kernel_modules() {
                warn!("failed to report kernel modules: {err}");
            }
            let () = dwfl.report_end(|_module| ());
            dwfl
        }
    };

    let () = print_modules(&mut dwfl);
    Ok(())
}


/// Print the symbol (and optionally the source location) for each of
/// `addrs`.
fn print_symbols(dwfl: &mut Dwfl, addrs: &[Addr], lines: bool) -> Result<()> {
    for addr in addrs {
        let addr_fmt = format!("{addr:#016x}:");
        let id = if let Some(id) = dwfl.addrmodule(*addr) {
            id
        } else {
            println!("{addr_fmt} <no-module>");
            continue
        };

        let sym = match dwfl.module_addrsym(id, *addr) {
            Ok(sym) => sym.map(|sym| sym.into_owned()),
            Err(err) if matches!(err.kind(), ErrorKind::NoSymtab | ErrorKind::NotFound) => None,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to look up symbol for {addr:#x}"))
            }
        };

        let src_loc = if lines {
            match dwfl.module_addrline(id, *addr) {
                Ok(Some(loc)) => match (loc.line, loc.column) {
                    (Some(line), Some(col)) if col != 0 => {
                        format!(" {}:{line}:{col}", loc.path().display())
                    }
                    (Some(line), _) => format!(" {}:{line}", loc.path().display()),
                    (None, _) => format!(" {}", loc.path().display()),
                },
                Ok(None) => String::new(),
                Err(err) if err.kind() == ErrorKind::NoDwarf => String::new(),
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to look up source line for {addr:#x}"))
                }
            }
        } else {
            String::new()
        };

        // SANITY: `id` was just reported by the context.
        let module = dwfl.module(id).unwrap().name();
        match sym {
            Some(sym) => {
                let offset = addr - sym.addr;
                println!(
                    "{addr_fmt} {} @ {:#x}+{offset:#x} in {module}{src_loc}",
                    sym.demangled(),
                    sym.addr
                )
            }
            None => println!("{addr_fmt} <no-symbol> in {module}{src_loc}"),
        }
    }
    Ok(())
}

/// The handler for the 'addr2sym' command.
fn addr2sym(addr2sym: args::addr2sym::AddrToSym) -> Result<()> {
    let (mut dwfl, addrs, options) = match addr2sym {
        args::addr2sym::AddrToSym::Elf(args::addr2sym::Elf {
            path,
            options,
            addrs,
        }) => {
            let callbacks = OfflineCallbacks {
                debuginfo_path: options.debug_args.debuginfo_path.clone(),
            };
            let mut dwfl = Dwfl::new(callbacks);
            let name = path.to_string_lossy();
            let () = dwfl.report_begin();
            let _id = dwfl
                .report_offline(&name, &path)
                .with_context(|| format!("failed to report {}", path.display()))?;
            let () = dwfl.report_end(|_module| ());
            (dwfl, addrs, options)
        }
        args::addr2sym::AddrToSym::Proc(args::addr2sym::Proc {
            pid,
            options,
            addrs,
        }) => {
            let mut callbacks = ProcCallbacks::new(pid);
            callbacks.debuginfo_path = options.debug_args.debuginfo_path.clone();
            let mut dwfl = Dwfl::new(callbacks);
            let () = dwfl.report_begin();
            let _count = dwfl
                .report_proc(pid)
                .with_context(|| format!("failed to report modules of process {pid}"))?;
            let () = dwfl.report_end(|_module| ());
            (dwfl, addrs, options)
        }
        args::addr2sym::AddrToSym::Core(args::addr2sym::Core {
            path,
            options,
            addrs,
        }) => {
            let dwfl = open_core(&path, options.debug_args.debuginfo_path.clone())?;
            (dwfl, addrs, options)
        }
    };

    print_symbols(&mut dwfl, &addrs, options.lines)
}


/// The handler for the 'buildid' command.
fn buildid(args::BuildId { path }: args::BuildId) -> Result<()> {
    let elf = ElfParser::open(&path)?;
    match read_build_id(&elf).context("failed to read build ID")? {
        Some((build_id, _addr)) => println!("{}", format_build_id_bytes(build_id)),
        None => bail!("{} has no build ID", path.display()),
    }
    Ok(())
}

/// The handler for the 'debuginfo' command.
fn debuginfo(args::Debuginfo { path, debug_args }: args::Debuginfo) -> Result<()> {
    let callbacks = OfflineCallbacks {
        debuginfo_path: debug_args.debuginfo_path,
    };
    let mut dwfl = Dwfl::new(callbacks);
    let name = path.to_string_lossy();
    let () = dwfl.report_begin();
    let id = dwfl
        .report_offline(&name, &path)
        .with_context(|| format!("failed to report {}", path.display()))?;
    let () = dwfl.report_end(|_module| ());

    let (debug, _bias) = dwfl
        .module_getdebug(id)
        .with_context(|| format!("failed to find debug information for {}", path.display()))?;
    match debug.path() {
        Some(debug_path) => println!("{}", debug_path.display()),
        None => println!("<in-memory>"),
    }
    Ok(())
}


fn main() -> Result<()> {
    let args = args::Args::parse();
    let level = match args.verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_span_events(FmtSpan::FULL)
        .with_timer(SystemTime)
        .finish();

    let () =
        set_global_subscriber(subscriber).with_context(|| "failed to set tracing subscriber")?;

    match args.command {
        args::Command::Modules(modules) => self::modules(modules),
        args::Command::AddrToSym(addr2sym) => self::addr2sym(addr2sym),
        args::Command::BuildId(buildid) => self::buildid(buildid),
        args::Command::Debuginfo(debuginfo) => self::debuginfo(debuginfo),
    }
}
