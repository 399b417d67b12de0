use std::path::Path;
use std::path::PathBuf;

use crate::util::bytes_to_path;
use crate::util::ReadRaw as _;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Mmap;
use crate::Result;

const INDEX_MAGIC: u32 = 0xb007f457;
const INDEX_VERSION: u32 = 0x00020001;

const INDEX_NODE_MASK: u32 = 0x0fffffff;
const INDEX_NODE_CHILDS: u32 = 0x20000000;
const INDEX_NODE_VALUES: u32 = 0x40000000;
const INDEX_NODE_PREFIX: u32 = 0x80000000;


/// The name of the depmod index file in a kernel's module directory.
pub(crate) const DEPMOD_INDEX: &str = "modules.dep.bin";


/// A `modules.dep.bin` index, mapping kernel module names to the
/// paths of their files.
#[derive(Debug)]
pub(crate) struct DepmodIndex {
    /// The directory paths in the index are relative to.
    base_dir: PathBuf,
    data: Mmap,
}

impl DepmodIndex {
    /// Open the depmod index of the kernel module directory `dir`,
    /// e.g., `/lib/modules/<release>`.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(DEPMOD_INDEX);
        let data = Mmap::open(&path)
            .with_context(|| format!("failed to open depmod index `{}`", path.display()))?;
        Self::from_data(dir.to_path_buf(), data)
    }

    fn from_data(base_dir: PathBuf, data: Mmap) -> Result<Self> {
        let slf = Self { base_dir, data };
        let () = slf.validate()?;
        Ok(slf)
    }

    fn validate(&self) -> Result<()> {
        let mut reader = &*self.data;
        let magic = reader
            .read_u32()
            .map(u32::from_be)
            .ok_or_unexpected_eof(|| "failed to read depmod index magic")?;
        if magic != INDEX_MAGIC {
            return Err(Error::with_invalid_data(format!(
                "invalid depmod index magic {magic:#010x}"
            )))
        }

        let version = reader
            .read_u32()
            .map(u32::from_be)
            .ok_or_unexpected_eof(|| "failed to read depmod index version")?;
        if version != INDEX_VERSION {
            return Err(Error::with_unsupported(format!(
                "unsupported depmod index version {version:#010x}"
            )))
        }
        Ok(())
    }

    /// Look up the path of the kernel module with the given name.
    pub fn find_path(&self, name: &str) -> Result<Option<PathBuf>> {
        let data = &*self.data;
        let mut reader = data
            .get(8..)
            .ok_or_unexpected_eof(|| "depmod index header is truncated")?;
        let mut name = name.as_bytes();

        // Walk the trie, consuming `name` along the way.
        let offset = loop {
            let offset = reader
                .read_u32()
                .map(u32::from_be)
                .ok_or_unexpected_eof(|| "failed to read depmod node offset")?;
            reader = data
                .get((offset & INDEX_NODE_MASK) as usize..)
                .ok_or_invalid_data(|| format!("depmod node offset {offset:#x} is out of bounds"))?;

            if offset & INDEX_NODE_PREFIX != 0 {
                let prefix = reader
                    .read_cstr()
                    .ok_or_unexpected_eof(|| "failed to read depmod node prefix")?
                    .to_bytes();
                name = match name.strip_prefix(prefix) {
                    Some(rest) => rest,
                    None => return Ok(None),
                };
            }

            if offset & INDEX_NODE_CHILDS != 0 {
                let first = reader
                    .read_u8()
                    .ok_or_unexpected_eof(|| "failed to read first depmod child")?;
                let last = reader
                    .read_u8()
                    .ok_or_unexpected_eof(|| "failed to read last depmod child")?;

                if let Some((cur, rest)) = name.split_first() {
                    if *cur < first || *cur > last {
                        return Ok(None)
                    }
                    let () = reader
                        .advance(4 * usize::from(cur - first))
                        .ok_or_unexpected_eof(|| "depmod children are truncated")?;
                    name = rest;
                    continue
                }

                let () = reader
                    .advance(4 * (usize::from(last - first) + 1))
                    .ok_or_unexpected_eof(|| "depmod children are truncated")?;
                break offset
            } else if !name.is_empty() {
                return Ok(None)
            } else {
                break offset
            }
        };

        if offset & INDEX_NODE_VALUES == 0 {
            return Ok(None)
        }

        let count = reader
            .read_u32()
            .map(u32::from_be)
            .ok_or_unexpected_eof(|| "failed to read depmod value count")?;
        if count == 0 {
            return Ok(None)
        }
        let _priority = reader
            .read_u32()
            .ok_or_unexpected_eof(|| "failed to read depmod value priority")?;

        // Values have the format `<path>: <dependencies>`.
        let value = reader
            .read_cstr()
            .ok_or_unexpected_eof(|| "failed to read depmod value")?
            .to_bytes();
        let colon = value
            .iter()
            .position(|b| *b == b':')
            .ok_or_invalid_data(|| "depmod value lacks `:` separator")?;
        let path = bytes_to_path(&value[..colon]);
        Ok(Some(self.base_dir.join(path)))
    }
}
