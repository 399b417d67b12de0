//! ELF file parsing.
//!
//! Both ELF classes and both byte orders are supported. Parsed
//! structures are normalized into the types found in [`types`].

pub mod notes;
mod parser;
#[cfg(feature = "dwarf")]
pub(crate) mod relocations;
pub mod types;

pub use parser::ElfParser;
