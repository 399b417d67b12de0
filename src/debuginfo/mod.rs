//! Discovery of separate debug information files.
//!
//! Two strategies are supported, and tried in this order:
//! - build ID based lookup in the `.build-id` hierarchy of each
//!   absolute search directory
//! - GNU debug link based lookup relative to the main file

mod build_id;
mod debug_link;
mod path;

use std::ffi::OsStr;
use std::ffi::OsString;
use std::fs::File;
use std::os::unix::io::AsRawFd as _;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use crate::callbacks::FoundElf;
use crate::elf::notes::read_build_id;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::util::fstat;
use crate::ErrorKind;
use crate::Result;

pub(crate) use build_id::build_id_path;
pub(crate) use build_id::hex;
pub use debug_link::debug_link_crc32;
pub(crate) use debug_link::read_debug_link;
pub use path::DebuginfoDir;
pub use path::DebuginfoPath;


/// The default debug information search path.
pub const DEFAULT_DEBUGINFO_PATH: &str = ":.debug:/usr/lib/debug";
/// The search path used for the kernel and its modules. Checksums are
/// always verified.
pub const KERNEL_DEBUGINFO_PATH: &str = "+:.debug:/usr/lib/debug";


/// Retrieve the `(device, inode)` pair identifying an open file.
fn file_identity(file: &File) -> Option<(u64, u64)> {
    fstat(file.as_raw_fd())
        .ok()
        .map(|stat| (stat.st_dev as u64, stat.st_ino as u64))
}


/// How a debug information candidate is to be validated.
#[derive(Clone, Copy, Debug)]
enum Validation<'id> {
    /// The candidate has to have the provided build ID.
    BuildId(&'id [u8]),
    /// The candidate's contents have to match the provided checksum.
    Crc(u32),
    /// Anything goes.
    None,
}

fn validate(parser: &ElfParser, validation: Validation<'_>) -> Result<bool> {
    let valid = match validation {
        Validation::BuildId(expected) => {
            matches!(read_build_id(parser)?, Some((build_id, _addr)) if build_id == expected)
        }
        Validation::Crc(crc) => debug_link_crc32(parser.data()) == crc,
        Validation::None => true,
    };
    Ok(valid)
}


/// Try opening the candidate at `path`, returning it if it is a valid
/// match.
fn try_candidate(
    path: &Path,
    main_identity: Option<(u64, u64)>,
    validation: Validation<'_>,
) -> Result<Option<FoundElf>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            debug!("debug information candidate {} not usable: {err}", path.display());
            return Ok(None)
        }
    };

    let identity = file_identity(&file);
    if identity.is_some() && identity == main_identity {
        debug!("skipping debug information candidate {}: it is the main file", path.display());
        return Ok(None)
    }

    let parser = match ElfParser::open_file(&file, Some(path.to_path_buf())) {
        Ok(parser) => parser,
        Err(err) if matches!(err.kind(), ErrorKind::NotElf | ErrorKind::UnexpectedEof) => {
            debug!("debug information candidate {} is not a valid ELF file: {err}", path.display());
            return Ok(None)
        }
        Err(err) => return Err(err),
    };

    if !validate(&parser, validation)? {
        debug!("rejecting debug information candidate {}: {validation:?} mismatch", path.display());
        return Ok(None)
    }

    let found = FoundElf {
        path: Some(path.to_path_buf()),
        elf: Rc::new(parser),
    };
    Ok(Some(found))
}


/// Search for debug information for a module.
///
/// `build_id` is the module's build ID, if known. `main_path` is the
/// path to the main file and `debuglink` and `crc` are the contents of
/// its debug link, if any.
#[cfg_attr(feature = "tracing", crate::log::instrument(skip_all, fields(main = ?main_path)))]
pub(crate) fn find_debuginfo(
    search: &DebuginfoPath,
    build_id: Option<&[u8]>,
    main_path: Option<&Path>,
    debuglink: Option<&OsStr>,
    crc: u32,
) -> Result<Option<FoundElf>> {
    let main_identity = main_path
        .and_then(|path| File::open(path).ok())
        .and_then(|file| file_identity(&file));

    if let Some(build_id) = build_id {
        for dir in search.absolute_dirs() {
            if let Some(path) = build_id_path(dir, build_id, ".debug") {
                let validation = Validation::BuildId(build_id);
                if let Some(found) = try_candidate(&path, main_identity, validation)? {
                    return Ok(Some(found))
                }
            }
        }
    }

    let main_path = if let Some(main_path) = main_path {
        main_path
    } else {
        return Ok(None)
    };

    // Without a debug link we fall back to `<basename>.debug`, which
    // has no checksum to check.
    let (debuglink, crc) = match debuglink {
        Some(debuglink) => (debuglink.to_os_string(), crc),
        None => {
            let mut name = main_path.file_name().map(OsString::from).unwrap_or_default();
            let () = name.push(".debug");
            (name, 0)
        }
    };
    let main_dir = main_path.parent().unwrap_or_else(|| Path::new(""));

    for dir in search.dirs() {
        let path = if let Some(path) = dir.debuglink_candidate(main_dir, &debuglink) {
            path
        } else {
            continue
        };

        let validation = match build_id {
            Some(build_id) => Validation::BuildId(build_id),
            None if dir.check_crc && crc != 0 => Validation::Crc(crc),
            None => Validation::None,
        };
        if let Some(found) = try_candidate(&path, main_identity, validation)? {
            return Ok(Some(found))
        }
    }
    Ok(None)
}

/// Build the path list used when looking for a main file by build ID,
/// i.e., `<dir>/.build-id/xx/yyyy` for each absolute search directory.
pub(crate) fn build_id_main_paths(search: &DebuginfoPath, build_id: &[u8]) -> Vec<PathBuf> {
    search
        .absolute_dirs()
        .filter_map(|dir| build_id_path(dir, build_id, ""))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::create_dir_all;
    use std::fs::write;

    use tempfile::tempdir;
    use test_log::test;

    use crate::elf::types::ET_DYN;
    use crate::test_helper::ElfBuilder;
    use crate::test_helper::SegmentSpec;


    fn image_with_id(build_id: &[u8], payload: u8) -> Vec<u8> {
        ElfBuilder::new(ET_DYN)
            .segment(SegmentSpec::load(0x0, 0x1000).data(vec![payload; 0x10]))
            .build_id(build_id)
            .build()
    }


    /// Check that debug information is found through the build ID
    /// hierarchy and that it is validated.
    #[test]
    fn build_id_lookup() {
        let dir = tempdir().unwrap();
        let build_id = [0x12, 0x34, 0x56, 0x78];
        let path = build_id_path(dir.path(), &build_id, ".debug").unwrap();
        let () = create_dir_all(path.parent().unwrap()).unwrap();
        let () = write(&path, image_with_id(&build_id, 1)).unwrap();

        let search = DebuginfoPath::parse(&format!("{}", dir.path().display()));
        let found = find_debuginfo(&search, Some(&build_id), None, None, 0)
            .unwrap()
            .unwrap();
        assert_eq!(found.path.as_deref(), Some(path.as_path()));

        // A file at the right spot with the wrong build ID is rejected.
        let () = write(&path, image_with_id(&[0x12, 0x34, 0x56, 0x79], 1)).unwrap();
        let found = find_debuginfo(&search, Some(&build_id), None, None, 0).unwrap();
        assert!(found.is_none());
    }

    /// Check that the debug link checksum is honored and that flipping
    /// a single byte invalidates a candidate.
    #[test]
    fn debuglink_crc_validation() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("libfoo.so");
        let () = write(&main, b"not relevant").unwrap();

        let debug = ElfBuilder::new(ET_DYN).build();
        let crc = debug_link_crc32(&debug);
        let debug_path = dir.path().join(".debug").join("libfoo.so.debug");
        let () = create_dir_all(debug_path.parent().unwrap()).unwrap();
        let () = write(&debug_path, &debug).unwrap();

        let link = OsStr::new("libfoo.so.debug");
        let search = DebuginfoPath::default();
        let found = find_debuginfo(&search, None, Some(&main), Some(link), crc)
            .unwrap()
            .unwrap();
        assert_eq!(found.path.as_deref(), Some(debug_path.as_path()));

        let mut corrupted = debug.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        let () = write(&debug_path, &corrupted).unwrap();
        let found = find_debuginfo(&search, None, Some(&main), Some(link), crc).unwrap();
        assert!(found.is_none());

        // With checksum verification disabled the candidate is accepted.
        let search = DebuginfoPath::parse("-:.debug");
        let found = find_debuginfo(&search, None, Some(&main), Some(link), crc).unwrap();
        assert!(found.is_some());
    }

    /// Check that without a debug link `<basename>.debug` is tried and
    /// that the main file itself is never reported.
    #[test]
    fn fallback_name() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("prog");
        let () = write(&main, ElfBuilder::new(ET_DYN).build()).unwrap();

        let search = DebuginfoPath::default();
        let found = find_debuginfo(&search, None, Some(&main), None, 0).unwrap();
        assert!(found.is_none());

        let debug_path = dir.path().join("prog.debug");
        let () = write(&debug_path, ElfBuilder::new(ET_DYN).build()).unwrap();
        let found = find_debuginfo(&search, None, Some(&main), None, 0)
            .unwrap()
            .unwrap();
        assert_eq!(found.path.as_deref(), Some(debug_path.as_path()));

        // A debug link pointing back at the main file is skipped.
        let found = find_debuginfo(&search, None, Some(&main), Some(OsStr::new("prog")), 0).unwrap();
        assert!(found.is_none());
    }
}
