use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;

use dwfl::Addr;
use dwfl::Pid;

use clap::ArgAction;
use clap::Args as Arguments;
use clap::Parser;
use clap::Subcommand;


/// Parse a PID from a string, accepting `self` and hexadecimal
/// values as well.
fn parse_pid(s: &str) -> Result<Pid> {
    if let Some(hex) = s.strip_prefix("0x") {
        let pid =
            u32::from_str_radix(hex, 16).with_context(|| format!("failed to parse PID: {s}"))?;
        Ok(Pid::from(pid))
    } else {
        s.parse::<Pid>().with_context(|| format!("failed to parse PID: {s}"))
    }
}

/// Parse an address from a string.
fn parse_addr(s: &str) -> Result<Addr> {
    // Addresses are always given in hex, with or without 0x prefix.
    Addr::from_str_radix(s.trim_start_matches("0x"), 16)
        .with_context(|| format!("failed to parse address: {s}"))
}


/// A command line interface for dwfl.
#[derive(Debug, Parser)]
#[clap(version = env!("VERSION"))]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
    /// Increase verbosity (can be supplied multiple times).
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    pub verbosity: u8,
}


#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the modules of a process, core file, or the kernel.
    #[command(subcommand)]
    Modules(modules::Modules),
    /// Map one or more addresses to symbols.
    #[command(subcommand, name = "addr2sym")]
    AddrToSym(addr2sym::AddrToSym),
    /// Print the build ID of an ELF file.
    #[command(name = "buildid")]
    BuildId(BuildId),
    /// Locate the separate debug information file of an ELF file.
    Debuginfo(Debuginfo),
}


/// Arguments controlling where debug information is searched for.
#[derive(Debug, Arguments)]
pub struct DebugArgs {
    /// The debug information search path, e.g.,
    /// ":.debug:/usr/lib/debug".
    #[clap(long)]
    pub debuginfo_path: Option<String>,
}


pub mod modules {
    use super::*;


    /// A type representing the `modules` command.
    #[derive(Debug, Subcommand)]
    pub enum Modules {
        /// List the modules of a running process.
        Proc(Proc),
        /// List the modules of the process captured in a core file.
        Core(Core),
        /// List the running kernel and its loaded modules.
        Kernel,
    }

    #[derive(Debug, Arguments)]
    pub struct Proc {
        /// The PID of the process.
        #[arg(value_parser = parse_pid)]
        pub pid: Pid,
    }

    #[derive(Debug, Arguments)]
    pub struct Core {
        /// The path to the core file.
        pub path: PathBuf,
    }
}


pub mod addr2sym {
    use super::*;


    /// A type representing the `addr2sym` command.
    #[derive(Debug, Subcommand)]
    pub enum AddrToSym {
        Elf(Elf),
        Proc(Proc),
        Core(Core),
    }

    /// Options shared by all sources.
    #[derive(Debug, Arguments)]
    pub struct Options {
        /// Report source code locations as well.
        #[clap(short, long)]
        pub lines: bool,
        #[command(flatten)]
        pub debug_args: DebugArgs,
    }

    #[derive(Debug, Arguments)]
    pub struct Elf {
        /// The path to the ELF file.
        #[clap(short, long)]
        pub path: PathBuf,
        #[command(flatten)]
        pub options: Options,
        /// The addresses to look up.
        ///
        /// The file is placed at its link-time addresses. Relocatable
        /// objects are placed at the first offline address.
        #[arg(value_parser = parse_addr)]
        pub addrs: Vec<Addr>,
    }

    #[derive(Debug, Arguments)]
    pub struct Proc {
        /// The PID of the process the provided addresses belong to.
        #[clap(short, long)]
        #[arg(value_parser = parse_pid)]
        pub pid: Pid,
        #[command(flatten)]
        pub options: Options,
        /// The addresses to look up.
        #[arg(value_parser = parse_addr)]
        pub addrs: Vec<Addr>,
    }

    #[derive(Debug, Arguments)]
    pub struct Core {
        /// The path to the core file.
        #[clap(short, long)]
        pub path: PathBuf,
        #[command(flatten)]
        pub options: Options,
        /// The addresses to look up.
        #[arg(value_parser = parse_addr)]
        pub addrs: Vec<Addr>,
    }
}


/// A type representing the `buildid` command.
#[derive(Debug, Arguments)]
pub struct BuildId {
    /// The path to the ELF file.
    pub path: PathBuf,
}

/// A type representing the `debuginfo` command.
#[derive(Debug, Arguments)]
pub struct Debuginfo {
    /// The path to the ELF file.
    pub path: PathBuf,
    #[command(flatten)]
    pub debug_args: DebugArgs,
}
