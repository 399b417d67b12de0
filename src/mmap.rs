use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use std::rc::Rc;

use memmap2::Mmap as Mapping;
use memmap2::MmapOptions;

use crate::Error;
use crate::ErrorExt as _;
use crate::Result;


/// The bytes an [`Mmap`] hands out.
#[derive(Debug)]
enum Image {
    /// Zero-length files cannot be mapped by the kernel.
    Empty,
    /// A file mapped read-only into our address space.
    Mapped(Mapping),
    /// An image owned on the heap, e.g., one copied out of a core file.
    Owned(Box<[u8]>),
}


/// The contents of an ELF image, either memory mapped from a file or
/// held on the heap.
///
/// Cloning an `Mmap` is cheap and shares the underlying image.
#[derive(Clone, Debug)]
pub struct Mmap {
    image: Rc<Image>,
}

impl Mmap {
    /// Map the provided file into memory, in its entirety.
    pub fn map(file: &File) -> Result<Self> {
        let len = usize::try_from(file.metadata()?.len())
            .map_err(Error::with_invalid_data)
            .context("file is too large to mmap")?;

        let image = if len == 0 {
            Image::Empty
        } else {
            // SAFETY: The mapping is read-only; concurrent truncation of
            //         the file is not guarded against.
            let mapping = unsafe { MmapOptions::new().map(file) }?;
            Image::Mapped(mapping)
        };
        Ok(Self {
            image: Rc::new(image),
        })
    }

    /// Map the file at `path` into memory, in its entirety.
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
        Self::map(&file).with_context(|| format!("failed to map `{}`", path.display()))
    }

    /// Wrap a heap allocated image, making it usable wherever a file
    /// mapping is expected.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            image: Rc::new(Image::Owned(data.into_boxed_slice())),
        }
    }
}

impl Deref for Mmap {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self.image.deref() {
            Image::Empty => &[],
            Image::Mapped(mapping) => mapping.deref(),
            Image::Owned(data) => data.deref(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::ffi::CStr;
    use std::io::Write;

    use tempfile::NamedTempFile;
    use test_log::test;
    use test_tag::tag;

    use crate::util::ReadRaw;


    /// Exercise the `Debug` representation of heap images.
    #[tag(miri)]
    #[test]
    fn debug_repr() {
        let mmap = Mmap::from_vec(vec![0x7f, b'E', b'L', b'F']);
        assert_ne!(format!("{mmap:?}"), "");
    }

    /// Check that an empty file yields an empty image.
    #[test]
    fn map_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let mmap = Mmap::map(file.as_file()).unwrap();
        assert!(mmap.is_empty());
    }

    /// Check that file contents are visible through the mapping.
    #[test]
    fn map_file_contents() {
        let file = NamedTempFile::new().unwrap();
        let cstr = b"vdso image goes here\0";
        let () = file.as_file().write_all(cstr).unwrap();
        let () = file.as_file().sync_all().unwrap();

        let mmap = Mmap::open(file.path()).unwrap();
        let mut data = mmap.deref();
        let s = data.read_cstr().unwrap();
        assert_eq!(s, CStr::from_bytes_with_nul(cstr).unwrap());
        assert_eq!(mmap.len(), cstr.len());
    }

    /// Check that opening a missing file reports the path.
    #[test]
    fn open_missing() {
        let err = Mmap::open("/does-not-exist/libfoo.so").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        assert!(err.to_string().contains("libfoo.so"), "{err}");
    }

    /// Check that clones refer to the same image.
    #[tag(miri)]
    #[test]
    fn clone_sharing() {
        let mmap = Mmap::from_vec(b"abc".to_vec());
        let clone = mmap.clone();
        assert_eq!(mmap.as_ptr(), clone.as_ptr());
        assert_eq!(clone.deref(), b"abc");
    }
}
