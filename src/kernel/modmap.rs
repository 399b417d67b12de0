use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::path::Path;
use std::str::FromStr as _;

use crate::log::debug;
use crate::Addr;
use crate::ErrorExt as _;
use crate::Result;


/// A loaded kernel module, as listed in `/proc/modules`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct KernelModule {
    pub name: Box<str>,
    pub addr: Addr,
    pub size: u64,
}


/// Parse a `/proc/modules`-style file from the given path.
pub(crate) fn read_modules(path: &Path) -> Result<Vec<KernelModule>> {
    let file =
        File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
    parse_modules(file)
}

/// Parse `/proc/modules` contents, sorted by address.
///
/// Modules with a masked (zero) load address are skipped.
pub(crate) fn parse_modules<R>(reader: R) -> Result<Vec<KernelModule>>
where
    R: Read,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut modules = Vec::new();

    loop {
        let () = line.clear();
        let size = reader.read_line(&mut line)?;
        if size == 0 {
            break
        }

        // Each line has format:
        // <module_name> <size> <instances> <dependencies> <state> <address> (<flags>)
        let mut parts = line.split_ascii_whitespace();
        #[rustfmt::skip]
        let (name, addr, size) = {
          let name = if let Some(part) = parts.next() { part } else { continue };
          let size = if let Some(part) = parts.next() { part } else { continue };
          let _insts = if let Some(part) = parts.next() { part } else { continue };
          let _deps = if let Some(part) = parts.next() { part } else { continue };
          let _state = if let Some(part) = parts.next() { part } else { continue };
          let addr = if let Some(part) = parts.next() { part } else { continue };
          (name, addr, size)
        };

        let addr = match Addr::from_str_radix(addr.trim_start_matches("0x"), 16) {
            Ok(0) => {
                debug!("skipping kernel module `{name}` with masked address");
                continue
            }
            Ok(addr) => addr,
            Err(err) => {
                debug!("skipping kernel module `{name}` with malformed address `{addr}`: {err}");
                continue
            }
        };

        let size = if let Ok(size) = u64::from_str(size) {
            size
        } else {
            continue
        };

        let () = modules.push(KernelModule {
            name: name.into(),
            addr,
            size,
        });
    }

    let () = modules.sort_unstable_by_key(|m| m.addr);
    Ok(modules)
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;
    use test_tag::tag;

    use crate::kernel::MODULES;


    /// Check that module lines are parsed and sorted by address.
    #[tag(miri)]
    #[test]
    fn module_parsing() {
        let modules = br"intel_lpss_pci 24576 0 - Live 0xffffffffa012c000
intel_lpss 12288 1 intel_lpss_pci, Live 0xffffffffa0121000
cfg80211 782336 3 iwlmvm,mac80211,iwlwifi, Live 0xffffffffa0012000
broken 12288 1
mfd_core 12288 1 intel_lpss, Live 0xffffffffa000a000
intel_pch_thermal 12288 0 - Live 0xffffffffa0000000
autofs4 53248 8 - Live 0xffffffffa0201000 (E)
";

        let modules = parse_modules(modules.as_slice()).unwrap();
        let names = modules.iter().map(|m| &*m.name).collect::<Vec<_>>();
        assert_eq!(
            names,
            [
                "intel_pch_thermal",
                "mfd_core",
                "cfg80211",
                "intel_lpss",
                "intel_lpss_pci",
                "autofs4"
            ]
        );
        assert_eq!(
            modules[4],
            KernelModule {
                name: "intel_lpss_pci".into(),
                addr: 0xffffffffa012c000,
                size: 24576,
            }
        );
    }

    /// Make sure that modules with masked addresses are ignored.
    #[tag(miri)]
    #[test]
    fn masked_addresses() {
        let modules = br"cfg80211 782336 3 iwlmvm,mac80211,iwlwifi, Live 0x0000000000000000
mfd_core 12288 1 intel_lpss, Live 0x0000000000000000
";
        let modules = parse_modules(modules.as_slice()).unwrap();
        assert!(modules.is_empty());
    }

    /// Check that we can load the system's `/proc/modules` file.
    #[test]
    fn load_system_modules() {
        let _modules = read_modules(Path::new(MODULES)).unwrap();
    }
}
