//! Parsing of `/proc/<pid>/maps` files.

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::ops::Range;
use std::path::PathBuf;

use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::Pid;
use crate::Result;


/// The identity of a mapped file, as `(device, inode)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileId {
    pub dev: (u32, u32),
    pub inode: u64,
}


/// A single mapping of a process.
#[derive(Debug)]
pub(crate) struct MapsEntry {
    pub range: Range<Addr>,
    /// The backing file; `None` for anonymous and special mappings.
    pub file: Option<FileId>,
    /// The path of the backing file, or a pseudo path such as
    /// `[vdso]`.
    pub path: PathBuf,
}


fn malformed<E>(what: &str, line: &str, err: E) -> Error
where
    E: std::fmt::Display,
{
    Error::with_invalid_data(format!("malformed {what} in maps line `{line}`: {err}"))
}

fn hex(what: &str, line: &str, text: &str) -> Result<u64> {
    u64::from_str_radix(text, 16).map_err(|err| malformed(what, line, err))
}

/// Parse one line of a maps listing, e.g.,
/// `7fa7bb400000-7fa7bb428000 r--p 00000000 00:20 12023223  /usr/lib64/libc.so.6`
///
/// Permissions and file offset are not of interest for module
/// discovery and are skipped.
fn parse_maps_line(line: &str, pid: Pid) -> Result<MapsEntry> {
    let mut fields = line.split_ascii_whitespace();
    let mut field = |what| {
        fields
            .next()
            .ok_or_else(|| malformed(what, line, "field missing"))
    };
    let range = field("address range")?;
    let _perms = field("permissions")?;
    let _offset = field("offset")?;
    let dev = field("device")?;
    let inode = field("inode")?;

    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| malformed("address range", line, "no `-` separator"))?;
    let start = hex("start address", line, start)?;
    let end = hex("end address", line, end)?;

    let (major, minor) = dev
        .split_once(':')
        .ok_or_else(|| malformed("device", line, "no `:` separator"))?;
    let dev = (
        u32::from_str_radix(major, 16).map_err(|err| malformed("device", line, err))?,
        u32::from_str_radix(minor, 16).map_err(|err| malformed("device", line, err))?,
    );
    let inode = inode
        .parse::<u64>()
        .map_err(|err| malformed("inode", line, err))?;

    // The path is everything after the inode column and may contain
    // spaces of its own.
    let path = line
        .splitn(6, |c: char| c.is_ascii_whitespace())
        .nth(5)
        .unwrap_or("")
        .trim();
    let path = if path.ends_with(" (deleted)") {
        PathBuf::from(format!("/proc/{pid}/map_files/{start:x}-{end:x}"))
    } else {
        PathBuf::from(path)
    };

    let entry = MapsEntry {
        range: start..end,
        file: (inode != 0).then_some(FileId { dev, inode }),
        path,
    };
    Ok(entry)
}


#[derive(Debug)]
struct MapsEntryIter<R> {
    reader: R,
    line: String,
    pid: Pid,
}

impl<R> Iterator for MapsEntryIter<R>
where
    R: BufRead,
{
    type Item = Result<MapsEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let () = self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Err(err) => return Some(Err(Error::from(err))),
                Ok(0) => break None,
                Ok(_) => {
                    let line = self.line.trim();
                    if !line.is_empty() {
                        break Some(parse_maps_line(line, self.pid))
                    }
                }
            }
        }
    }
}


/// Parse a proc maps file from the provided reader.
///
/// `pid` is only used for synthesizing paths of deleted files.
pub(crate) fn parse_file<R>(reader: R, pid: Pid) -> impl Iterator<Item = Result<MapsEntry>>
where
    R: Read,
{
    MapsEntryIter {
        reader: BufReader::new(reader),
        line: String::new(),
        pid,
    }
}

/// Parse the maps file for the process with the given PID.
pub(crate) fn parse(pid: Pid) -> Result<impl Iterator<Item = Result<MapsEntry>>> {
    let path = format!("/proc/{pid}/maps");
    let file = File::open(&path).with_context(|| format!("failed to open `{path}`"))?;
    let iter = parse_file(file, pid);
    Ok(iter)
}
