//! Access to the memory of a target, be it a core file, a live
//! process, or some buffer.

use std::fs::File;
use std::io;
use std::ops::Range;
use std::os::unix::fs::FileExt as _;
use std::rc::Rc;

use crate::elf::types::parse_ident;
use crate::elf::types::Class;
use crate::elf::types::Ehdr;
use crate::elf::types::Phdr;
use crate::elf::types::EI_NIDENT;
use crate::elf::types::PT_LOAD;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::log::trace;
use crate::util::align_down_u64;
use crate::util::Endian;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::Pid;
use crate::Result;


/// The largest ELF image we are willing to reconstruct from memory.
const MAX_IMAGE_SIZE: u64 = 1 << 30;


/// A source of target memory.
pub trait MemoryReader {
    /// Read into `buf` the memory starting at `addr`.
    ///
    /// At least `min` bytes have to be read for the operation to
    /// succeed; fewer are reported as [`ErrorKind::UnexpectedEof`]. On
    /// success, the number of bytes read is returned, which may be less
    /// than the size of `buf`.
    fn read(&self, addr: Addr, buf: &mut [u8], min: usize) -> Result<usize>;
}

impl<M> MemoryReader for &M
where
    M: MemoryReader + ?Sized,
{
    #[inline]
    fn read(&self, addr: Addr, buf: &mut [u8], min: usize) -> Result<usize> {
        M::read(self, addr, buf, min)
    }
}

impl<M> MemoryReader for Rc<M>
where
    M: MemoryReader + ?Sized,
{
    #[inline]
    fn read(&self, addr: Addr, buf: &mut [u8], min: usize) -> Result<usize> {
        M::read(self, addr, buf, min)
    }
}


fn short_read(addr: Addr, read: usize, min: usize) -> Error {
    Error::with_unexpected_eof(format!(
        "read only {read} of at least {min} bytes at {addr:#x}"
    ))
}


/// Read exactly `len` bytes at `addr`.
pub(crate) fn read_vec(reader: &dyn MemoryReader, addr: Addr, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; len];
    let _read = reader.read(addr, &mut buf, len)?;
    Ok(buf)
}

/// Read a target word of the given class and byte order at `addr`.
pub(crate) fn read_word(
    reader: &dyn MemoryReader,
    addr: Addr,
    class: Class,
    endian: Endian,
) -> Result<u64> {
    let mut buf = [0; 8];
    let size = class.word_size();
    let _read = reader.read(addr, &mut buf[..size], size)?;
    let word = match class {
        Class::Elf32 => u64::from(endian.u32([buf[0], buf[1], buf[2], buf[3]])),
        Class::Elf64 => endian.u64(buf),
    };
    Ok(word)
}

/// Read a NUL terminated string at `addr`, up to `max` bytes.
pub(crate) fn read_cstring(reader: &dyn MemoryReader, addr: Addr, max: usize) -> Result<Vec<u8>> {
    let mut string = Vec::new();
    let mut chunk = [0; 64];
    while string.len() < max {
        let addr = addr.wrapping_add(string.len() as u64);
        let read = reader.read(addr, &mut chunk, 1)?;
        if let Some(nul) = chunk[..read].iter().position(|b| *b == 0) {
            let () = string.extend_from_slice(&chunk[..nul]);
            return Ok(string)
        }
        let () = string.extend_from_slice(&chunk[..read]);
    }
    Err(Error::with_invalid_data(format!(
        "string at {addr:#x} is not terminated within {max} bytes"
    )))
}


/// Memory backed by an in-memory buffer mapped at some base address.
#[derive(Clone, Debug)]
pub struct SliceMemory<'data> {
    base: Addr,
    data: &'data [u8],
}

impl<'data> SliceMemory<'data> {
    /// Create a new [`SliceMemory`] object presenting `data` at `base`.
    pub fn new(base: Addr, data: &'data [u8]) -> Self {
        Self { base, data }
    }
}

impl MemoryReader for SliceMemory<'_> {
    fn read(&self, addr: Addr, buf: &mut [u8], min: usize) -> Result<usize> {
        let data = addr
            .checked_sub(self.base)
            .and_then(|offset| usize::try_from(offset).ok())
            .and_then(|offset| self.data.get(offset..))
            .unwrap_or(&[]);
        let len = buf.len().min(data.len());
        if len < min {
            return Err(short_read(addr, len, min))
        }
        let () = buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }
}


/// The memory image captured in a core file.
///
/// Only file backed contents of `PT_LOAD` segments can be read;
/// anything the core file does not capture is treated as unreadable.
#[derive(Clone, Debug)]
pub struct CoreMemory {
    elf: Rc<ElfParser>,
    /// `PT_LOAD` segments, sorted by address.
    loads: Vec<Phdr>,
}

impl CoreMemory {
    /// Create a [`CoreMemory`] object for the provided core file.
    pub fn new(elf: Rc<ElfParser>) -> Result<Self> {
        let mut loads = elf
            .program_headers()?
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD)
            .cloned()
            .collect::<Vec<_>>();
        let () = loads.sort_by_key(|phdr| phdr.p_vaddr);
        Ok(Self { elf, loads })
    }

    /// The core file.
    #[inline]
    pub fn elf(&self) -> &Rc<ElfParser> {
        &self.elf
    }

    /// The bytes of `phdr` actually present in the core file, which may
    /// be fewer than `p_filesz` if the file got truncated.
    fn captured(&self, phdr: &Phdr) -> &[u8] {
        let data = self.elf.data();
        let end = phdr.p_offset.saturating_add(phdr.p_filesz);
        let end = usize::try_from(end).unwrap_or(usize::MAX).min(data.len());
        let start = usize::try_from(phdr.p_offset)
            .unwrap_or(usize::MAX)
            .min(end);
        &data[start..end]
    }

    /// Check whether all of `range` is captured by the core file.
    pub(crate) fn contains(&self, range: Range<Addr>) -> bool {
        let mut addr = range.start;
        for phdr in &self.loads {
            let end = phdr
                .p_vaddr
                .wrapping_add(self.captured(phdr).len() as u64);
            if phdr.p_vaddr <= addr && addr < end {
                addr = end;
            }
            if addr >= range.end {
                return true
            }
        }
        addr >= range.end
    }
}

impl MemoryReader for CoreMemory {
    fn read(&self, addr: Addr, buf: &mut [u8], min: usize) -> Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            let cur = addr.wrapping_add(read as u64);
            let phdr = self
                .loads
                .iter()
                .find(|phdr| phdr.p_vaddr <= cur && cur - phdr.p_vaddr < phdr.p_filesz);
            let phdr = if let Some(phdr) = phdr {
                phdr
            } else {
                break
            };

            let data = usize::try_from(cur - phdr.p_vaddr)
                .ok()
                .and_then(|offset| self.captured(phdr).get(offset..))
                .unwrap_or(&[]);
            let len = data.len().min(buf.len() - read);
            if len == 0 {
                break
            }
            let () = buf[read..read + len].copy_from_slice(&data[..len]);
            read += len;
        }

        if read < min {
            return Err(short_read(addr, read, min))
        }
        Ok(read)
    }
}


/// The memory of a live process, read through `/proc/<pid>/mem`.
#[derive(Debug)]
pub struct ProcessMemory {
    pid: Pid,
    file: File,
}

impl ProcessMemory {
    /// Open the memory of the process identified by `pid`.
    pub fn new(pid: Pid) -> Result<Self> {
        let path = format!("/proc/{pid}/mem");
        let file = File::open(&path).with_context(|| format!("failed to open `{path}`"))?;
        Ok(Self { pid, file })
    }
}

impl MemoryReader for ProcessMemory {
    fn read(&self, addr: Addr, buf: &mut [u8], min: usize) -> Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match self
                .file
                .read_at(&mut buf[read..], addr.wrapping_add(read as u64))
            {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    trace!("reading process {} memory at {addr:#x} failed: {err}", self.pid);
                    if read >= min {
                        break
                    }
                    return Err(Error::from(err)).with_context(|| {
                        format!("failed to read memory of process {} at {addr:#x}", self.pid)
                    })
                }
            }
        }

        if read < min {
            return Err(short_read(addr, read, min))
        }
        Ok(read)
    }
}


/// An ELF image reconstructed from target memory.
#[derive(Debug)]
pub(crate) struct MemoryImage {
    /// The file image.
    pub data: Vec<u8>,
    /// The run-time address range covered by the image's `PT_LOAD`
    /// segments.
    pub range: Range<Addr>,
}


/// Read the ELF header at `addr`, if there is one.
pub(crate) fn read_ehdr(reader: &dyn MemoryReader, addr: Addr) -> Result<Option<Ehdr>> {
    let mut buf = [0; 64];
    let read = match reader.read(addr, &mut buf, EI_NIDENT) {
        Ok(read) => read,
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };

    let (class, _endian) = if let Some(ident) = parse_ident(&buf[..read]) {
        ident
    } else {
        return Ok(None)
    };
    if read < class.ehdr_size() {
        return Ok(None)
    }
    Ok(Ehdr::parse(&buf[..class.ehdr_size()]))
}


/// Zero the section header table fields of the ELF header in `image`.
fn clear_shdr_fields(image: &mut [u8], class: Class) {
    let fields: [(usize, usize); 3] = match class {
        Class::Elf32 => [(0x20, 4), (0x30, 2), (0x32, 2)],
        Class::Elf64 => [(0x28, 8), (0x3c, 2), (0x3e, 2)],
    };
    for (offset, len) in fields {
        if let Some(field) = image.get_mut(offset..offset + len) {
            let () = field.fill(0);
        }
    }
}


/// Reconstruct the file image of an ELF object whose header was
/// loaded at `ehdr_addr`.
///
/// Segments are placed at their file offsets. If the section headers
/// are not part of any loaded segment, they are dropped from the
/// image.
pub(crate) fn read_elf_image(reader: &dyn MemoryReader, ehdr_addr: Addr) -> Result<MemoryImage> {
    let ehdr = read_ehdr(reader, ehdr_addr)?.ok_or_else(|| {
        Error::new(
            ErrorKind::NotElf,
            format!("no ELF header found at {ehdr_addr:#x}"),
        )
    })?;
    let class = ehdr.class;
    let endian = ehdr.endian;

    if ehdr.e_phnum == 0 || usize::from(ehdr.e_phentsize) < class.phdr_size() {
        return Err(Error::new(
            ErrorKind::NoPhdr,
            format!("ELF image at {ehdr_addr:#x} has no usable program headers"),
        ))
    }

    let phdrs_len = usize::from(ehdr.e_phnum) * usize::from(ehdr.e_phentsize);
    let raw = read_vec(reader, ehdr_addr.wrapping_add(ehdr.e_phoff), phdrs_len)
        .context("failed to read program headers")?;
    let loads = raw
        .chunks_exact(usize::from(ehdr.e_phentsize))
        .filter_map(|mut chunk| Phdr::parse(&mut chunk, class, endian))
        .filter(|phdr| phdr.p_type == PT_LOAD)
        .collect::<Vec<_>>();

    let first = loads.first().ok_or_else(|| {
        Error::new(
            ErrorKind::NoPhdr,
            format!("ELF image at {ehdr_addr:#x} has no PT_LOAD segments"),
        )
    })?;
    let base = align_down_u64(first.p_vaddr, first.p_align);
    let bias = ehdr_addr.wrapping_sub(base);

    let mut file_size = 0u64;
    let mut end = base;
    for phdr in &loads {
        file_size = file_size.max(phdr.p_offset.saturating_add(phdr.p_filesz));
        end = end.max(phdr.p_vaddr.saturating_add(phdr.p_memsz));
    }

    let shdrs_end = ehdr
        .e_shoff
        .saturating_add(u64::from(ehdr.e_shnum) * u64::from(ehdr.e_shentsize));
    let keep_shdrs = ehdr.e_shoff != 0 && shdrs_end <= file_size;

    if file_size > MAX_IMAGE_SIZE {
        return Err(Error::with_invalid_data(format!(
            "ELF image at {ehdr_addr:#x} is implausibly large ({file_size} bytes)"
        )))
    }

    let mut data = vec![0; file_size as usize];
    for phdr in &loads {
        let offset = phdr.p_offset as usize;
        let len = phdr.p_filesz as usize;
        let addr = bias.wrapping_add(phdr.p_vaddr);
        let _read = reader
            .read(addr, &mut data[offset..offset + len], len)
            .with_context(|| format!("failed to read segment at {addr:#x}"))?;
    }

    if !keep_shdrs {
        debug!("section headers of ELF image at {ehdr_addr:#x} are not loaded; dropping them");
        let () = clear_shdr_fields(&mut data, class);
    }

    let image = MemoryImage {
        data,
        range: ehdr_addr..bias.wrapping_add(end),
    };
    Ok(image)
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;
    use test_tag::tag;

    use crate::elf::types::ET_CORE;
    use crate::elf::types::ET_DYN;
    use crate::test_helper::core_image;
    use crate::test_helper::ElfBuilder;
    use crate::test_helper::SegmentSpec;


    /// Check reads from a slice.
    #[tag(miri)]
    #[test]
    fn slice_reading() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        let memory = SliceMemory::new(0x1000, &data);
        let mut buf = [0; 4];
        assert_eq!(memory.read(0x1002, &mut buf, 4).unwrap(), 4);
        assert_eq!(buf, [3, 4, 5, 6]);

        // Partial reads succeed as long as the minimum is met.
        assert_eq!(memory.read(0x1006, &mut buf, 1).unwrap(), 2);
        assert_eq!(&buf[..2], &[7, 8]);

        let err = memory.read(0x1006, &mut buf, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        let err = memory.read(0xfff, &mut buf, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    /// Check word and string reading helpers.
    #[tag(miri)]
    #[test]
    fn word_and_string_reading() {
        let data = b"\x01\x02\x03\x04\x05\x06\x07\x08hello\0world";
        let memory = SliceMemory::new(0x0, data);
        assert_eq!(
            read_word(&memory, 0, Class::Elf64, Endian::Little).unwrap(),
            0x0807060504030201
        );
        assert_eq!(
            read_word(&memory, 0, Class::Elf32, Endian::Big).unwrap(),
            0x01020304
        );
        assert_eq!(read_cstring(&memory, 8, 64).unwrap(), b"hello");
        let err = read_cstring(&memory, 14, 64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    /// Check that core memory only exposes file backed contents.
    #[test]
    fn core_reading() {
        let core = core_image(
            vec![
                SegmentSpec::load(0x1000, 0x1000).data(vec![0xaa; 0x100]).memsz(0x1000),
                SegmentSpec::load(0x1100, 0x1000).data(vec![0xbb; 0x100]),
            ],
            Vec::new(),
        );
        let elf = Rc::new(ElfParser::from_bytes(core, None).unwrap());
        assert_eq!(elf.elf_type(), ET_CORE);
        let memory = CoreMemory::new(elf).unwrap();

        let mut buf = [0; 0x20];
        assert_eq!(memory.read(0x10f0, &mut buf, 0x20).unwrap(), 0x20);
        assert_eq!(&buf[..0x10], &[0xaa; 0x10]);
        assert_eq!(&buf[0x10..], &[0xbb; 0x10]);

        let err = memory.read(0x11f0, &mut buf, 0x20).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        assert!(memory.contains(0x1000..0x1200));
        assert!(!memory.contains(0x1000..0x1201));
    }

    /// Check that a truncated core file still exposes the segment
    /// contents it did capture.
    #[test]
    fn truncated_core_reading() {
        let mut core = core_image(
            vec![
                SegmentSpec::load(0x1000, 0x1000).data(vec![0xaa; 0x100]),
                SegmentSpec::load(0x1100, 0x1000).data(vec![0xbb; 0x100]),
            ],
            Vec::new(),
        );
        let elf = ElfParser::from_bytes(core.clone(), None).unwrap();
        let second = elf
            .program_headers()
            .unwrap()
            .iter()
            .find(|phdr| phdr.p_type == PT_LOAD && phdr.p_vaddr == 0x1100)
            .unwrap()
            .clone();
        assert_eq!(second.p_filesz, 0x100);
        let () = core.truncate(second.p_offset as usize + 0x80);

        let elf = Rc::new(ElfParser::from_bytes(core, None).unwrap());
        let memory = CoreMemory::new(elf).unwrap();

        let mut buf = [0; 0x20];
        assert_eq!(memory.read(0x10f0, &mut buf, 0x10).unwrap(), 0x20);
        assert_eq!(&buf[..0x10], &[0xaa; 0x10]);
        assert_eq!(&buf[0x10..], &[0xbb; 0x10]);

        let mut buf = [0; 0x40];
        assert_eq!(memory.read(0x1100, &mut buf, 1).unwrap(), 0x40);
        assert_eq!(buf, [0xbb; 0x40]);

        // Only the captured part of the second segment is readable.
        let mut buf = [0; 0x100];
        assert_eq!(memory.read(0x1100, &mut buf, 0x80).unwrap(), 0x80);
        let err = memory.read(0x1100, &mut buf, 0x81).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        let err = memory.read(0x1180, &mut buf, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

        assert!(memory.contains(0x1000..0x1180));
        assert!(!memory.contains(0x1000..0x1181));
    }

    /// Check that an ELF image can be reconstructed from memory.
    #[test]
    fn image_reconstruction() {
        let image = ElfBuilder::new(ET_DYN)
            .segment(SegmentSpec::load(0x0, 0x1000).data(vec![0x11; 0x40]))
            .build_id(&[0xde, 0xad, 0xbe, 0xef])
            .build();
        let original = ElfParser::from_bytes(image.clone(), None).unwrap();
        let (_start, end) = original.load_range().unwrap().unwrap();

        let mut memory = vec![0; end as usize];
        let () = memory[..image.len().min(end as usize)]
            .copy_from_slice(&image[..image.len().min(end as usize)]);
        let memory = SliceMemory::new(0x7000_0000, &memory);

        let rebuilt = read_elf_image(&memory, 0x7000_0000).unwrap();
        assert_eq!(rebuilt.range, 0x7000_0000..0x7000_0000 + end);
        let parser = ElfParser::from_bytes(rebuilt.data, None).unwrap();
        assert_eq!(parser.elf_type(), ET_DYN);
        // Section headers are not part of any segment.
        assert_eq!(parser.shnum(), 0);
        let (build_id, _addr) = crate::elf::notes::read_build_id(&parser).unwrap().unwrap();
        assert_eq!(build_id, &[0xde, 0xad, 0xbe, 0xef]);

        let err = read_elf_image(&memory, 0x7000_0010).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotElf);
    }
}
