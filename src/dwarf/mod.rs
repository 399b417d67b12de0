//! Source line lookup based on DWARF debug information.

mod lines;
mod reader;
mod relocate;
mod units;

pub use self::lines::SrcLoc;
pub(crate) use self::units::ensure_cus;
pub(crate) use self::units::CuCache;
