//! **dwfl** is a library for mapping addresses to modules, ELF sections,
//! symbols, and debug information.
//!
//! A [`Dwfl`] context owns a set of [`Module`]s. Modules are discovered
//! by one of the reporting front ends -- a live process
//! ([`Dwfl::report_proc`]), a core file ([`Dwfl::report_core`]), the
//! running kernel ([`Dwfl::report_kernel`]), or an offline set of ELF
//! files ([`Dwfl::report_offline`]) -- inside of a reporting round:
//!
//! ```no_run
//! use dwfl::Dwfl;
//! use dwfl::ProcCallbacks;
//! use dwfl::Pid;
//!
//! let mut dwfl = Dwfl::new(ProcCallbacks::new(Pid::Slf));
//! let () = dwfl.report_begin();
//! let _count = dwfl.report_proc(Pid::Slf).unwrap();
//! let () = dwfl.report_end(|_module| ());
//!
//! let addr = 0x7f0000001234;
//! if let Some(id) = dwfl.addrmodule(addr) {
//!     let sym = dwfl.module_addrsym(id, addr).unwrap();
//!     println!("{addr:#x}: {sym:?}");
//! }
//! ```
//!
//! Per-module information (the ELF file, its separate debug
//! information, the symbol table, and source line information) is
//! resolved lazily, on first use.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::let_and_return, clippy::let_unit_value)]

mod auxv;
mod callbacks;
mod corefile;
mod debuginfo;
#[cfg(feature = "dwarf")]
mod dwarf;
mod dwfl;
pub mod elf;
mod error;
mod kernel;
mod link_map;
mod maps;
mod memory;
mod mmap;
mod module;
mod once;
mod pid;
mod proc;
mod reloc;
mod segment;
mod symtab;
#[cfg(any(test, feature = "test"))]
mod test_helper;
mod util;

pub use crate::auxv::Auxv;
pub use crate::callbacks::Callbacks;
pub use crate::callbacks::CoreCallbacks;
pub use crate::callbacks::FoundElf;
pub use crate::callbacks::KernelCallbacks;
pub use crate::callbacks::OfflineCallbacks;
pub use crate::callbacks::ProcCallbacks;
pub use crate::debuginfo::DebuginfoDir;
pub use crate::debuginfo::DebuginfoPath;
pub use crate::debuginfo::DEFAULT_DEBUGINFO_PATH;
pub use crate::debuginfo::KERNEL_DEBUGINFO_PATH;
#[cfg(feature = "dwarf")]
pub use crate::dwarf::SrcLoc;
pub use crate::dwfl::Dwfl;
pub use crate::error::Error;
pub use crate::error::ErrorExt;
pub use crate::error::ErrorKind;
pub use crate::error::IntoError;
pub use crate::error::Result;
pub use crate::memory::CoreMemory;
pub use crate::memory::MemoryReader;
pub use crate::memory::ProcessMemory;
pub use crate::memory::SliceMemory;
pub use crate::mmap::Mmap;
pub use crate::module::BuildId;
pub use crate::module::Module;
pub use crate::module::ModuleId;
pub use crate::pid::Pid;
pub use crate::symtab::Sym;
pub use crate::symtab::SymtabSource;


/// A type representing addresses.
pub type Addr = u64;


/// Utility functionality not officially exposed.
#[cfg(any(test, feature = "test"))]
#[doc(hidden)]
pub mod __private {
    pub use crate::debuginfo::debug_link_crc32;
    pub use crate::test_helper::core_image;
    pub use crate::test_helper::ElfBuilder;
    pub use crate::test_helper::NoteBuilder;
    pub use crate::test_helper::SectionSpec;
    pub use crate::test_helper::SegmentSpec;
    pub use crate::test_helper::SymbolSpec;
}


#[cfg(feature = "tracing")]
#[macro_use]
#[allow(unused_imports)]
mod log {
    pub(crate) use tracing::debug;
    pub(crate) use tracing::error;
    pub(crate) use tracing::info;
    pub(crate) use tracing::instrument;
    pub(crate) use tracing::trace;
    pub(crate) use tracing::warn;
}

#[cfg(not(feature = "tracing"))]
#[macro_use]
#[allow(unused_imports)]
mod log {
    macro_rules! debug {
        ($($args:tt)*) => {{
          if false {
            // Make sure to use `args` to prevent any warnings about
            // unused variables.
            let _args = format_args!($($args)*);
          }
        }};
    }
    pub(crate) use debug;
    pub(crate) use debug as error;
    pub(crate) use debug as info;
    pub(crate) use debug as trace;
    pub(crate) use debug as warn;
}
