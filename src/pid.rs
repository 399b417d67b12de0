use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::num::NonZeroU32;
use std::process;
use std::str::FromStr;

use crate::Error;


/// An enumeration identifying a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pid {
    /// The current process.
    Slf,
    /// The process identified by the provided ID.
    Pid(NonZeroU32),
}

impl Pid {
    /// Resolve this [`Pid`] into an actual number, if it is the symbolic
    /// [`Pid::Slf`] variant.
    pub fn resolve(&self) -> u32 {
        match self {
            Self::Slf => process::id(),
            Self::Pid(pid) => pid.get(),
        }
    }
}

impl Display for Pid {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Slf => write!(f, "self"),
            Self::Pid(pid) => write!(f, "{pid}"),
        }
    }
}

impl From<u32> for Pid {
    fn from(pid: u32) -> Self {
        NonZeroU32::new(pid).map(Pid::Pid).unwrap_or(Pid::Slf)
    }
}

impl FromStr for Pid {
    type Err = Error;

    /// Parse a process ID, accepting `self` for the current process.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "self" {
            return Ok(Self::Slf)
        }
        let pid = s
            .parse::<u32>()
            .map_err(|err| Error::with_invalid_input(format!("invalid PID `{s}`: {err}")))?;
        Ok(Self::from(pid))
    }
}
