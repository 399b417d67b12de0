use std::fs::File;
use std::io::BufRead as _;
use std::io::BufReader;
use std::io::Read;
use std::path::Path;

use crate::Addr;
use crate::ErrorExt as _;
use crate::Result;


/// Symbols marking the start of the kernel image, in order of
/// preference.
const START_SYMS: [&str; 2] = ["_stext", "_text"];
/// Symbols marking the end of the kernel image, in order of
/// preference.
const END_SYMS: [&str; 2] = ["_end", "_etext"];


/// Determine the address range of the kernel image from a
/// kallsyms-style listing.
///
/// `None` is returned if the bounds are not listed, or if addresses are
/// masked, as is the case for unprivileged users.
pub(crate) fn parse_kernel_range<R>(reader: R) -> Result<Option<(Addr, Addr)>>
where
    R: Read,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut start = [None; START_SYMS.len()];
    let mut end = [None; END_SYMS.len()];

    loop {
        let () = line.clear();
        let sz = reader.read_line(&mut line)?;
        if sz == 0 {
            break
        }

        let mut tokens = line.split_ascii_whitespace();
        #[rustfmt::skip]
        let (addr, name) = {
            let addr = if let Some(token) = tokens.next() { token } else { continue };
            let _typ = if let Some(token) = tokens.next() { token } else { continue };
            let name = if let Some(token) = tokens.next() { token } else { continue };
            (addr, name)
        };
        // Symbols of modules are of no interest.
        if tokens.next().is_some() {
            continue
        }

        let slot = if let Some(idx) = START_SYMS.iter().position(|sym| *sym == name) {
            &mut start[idx]
        } else if let Some(idx) = END_SYMS.iter().position(|sym| *sym == name) {
            &mut end[idx]
        } else {
            continue
        };

        if let Ok(addr) = Addr::from_str_radix(addr, 16) {
            if addr != 0 && slot.is_none() {
                *slot = Some(addr);
            }
        }
    }

    let start = start.into_iter().flatten().next();
    let end = end.into_iter().flatten().next();
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(Some((start, end))),
        _ => Ok(None),
    }
}

/// Determine the address range of the kernel image from the kallsyms
/// file at `path`.
pub(crate) fn read_kernel_range(path: &Path) -> Result<Option<(Addr, Addr)>> {
    let file =
        File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
    parse_kernel_range(file)
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;
    use test_tag::tag;


    /// Check that the kernel bounds are found.
    #[tag(miri)]
    #[test]
    fn range_parsing() {
        let kallsyms = br"ffffffff81000000 T _text
ffffffff81000000 T startup_64
ffffffff81001000 T _stext
ffffffffc0279010 T _end	[fuse]
ffffffff83400000 B _end
ffffffff82000000 T _etext
";
        let range = parse_kernel_range(kallsyms.as_slice()).unwrap();
        assert_eq!(range, Some((0xffffffff81001000, 0xffffffff83400000)));
    }

    /// Check that the fallback symbols are used.
    #[tag(miri)]
    #[test]
    fn fallback_symbols() {
        let kallsyms = br"ffffffff81000000 T _text
ffffffff82000000 T _etext
";
        let range = parse_kernel_range(kallsyms.as_slice()).unwrap();
        assert_eq!(range, Some((0xffffffff81000000, 0xffffffff82000000)));
    }

    /// Make sure that masked addresses are not reported.
    #[tag(miri)]
    #[test]
    fn masked_addresses() {
        let kallsyms = br"0000000000000000 T _stext
0000000000000000 B _end
";
        let range = parse_kernel_range(kallsyms.as_slice()).unwrap();
        assert_eq!(range, None);
    }
}
