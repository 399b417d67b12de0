use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;


/// A single directory of a debug information search path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebuginfoDir {
    /// The directory. An empty path refers to the directory containing
    /// the main file.
    pub dir: PathBuf,
    /// Whether to verify the debug link checksum of candidates found in
    /// this directory.
    pub check_crc: bool,
}

impl DebuginfoDir {
    /// Generate the debug link candidate for a main file residing in
    /// `main_dir`.
    ///
    /// Absolute entries are searched for the main file's directory
    /// hierarchy, relative ones are interpreted relative to `main_dir`.
    pub(crate) fn debuglink_candidate(&self, main_dir: &Path, debuglink: &OsStr) -> Option<PathBuf> {
        if self.dir.as_os_str().is_empty() {
            Some(main_dir.join(debuglink))
        } else if self.dir.is_absolute() {
            if !main_dir.is_absolute() {
                return None
            }
            let relative = main_dir.strip_prefix("/").unwrap_or(main_dir);
            Some(self.dir.join(relative).join(debuglink))
        } else {
            Some(main_dir.join(&self.dir).join(debuglink))
        }
    }
}


/// A parsed debug information search path.
///
/// The textual representation is a colon separated list of
/// directories. Each entry, as well as the list as a whole, may be
/// prefixed with `+` to request or with `-` to suppress verification
/// of debug link checksums.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebuginfoPath {
    dirs: Vec<DebuginfoDir>,
}

impl DebuginfoPath {
    /// Parse a search path.
    pub fn parse(path: &str) -> Self {
        let (default_check, list) = match path.as_bytes().first() {
            Some(b'+') => (true, &path[1..]),
            Some(b'-') => (false, &path[1..]),
            _ => (true, path),
        };

        let dirs = list
            .split(':')
            .map(|entry| {
                let (check_crc, dir) = match entry.as_bytes().first() {
                    Some(b'+') => (true, &entry[1..]),
                    Some(b'-') => (false, &entry[1..]),
                    _ => (default_check, entry),
                };
                DebuginfoDir {
                    dir: PathBuf::from(dir),
                    check_crc,
                }
            })
            .collect();

        Self { dirs }
    }

    /// Retrieve the directories of this search path, in order.
    #[inline]
    pub fn dirs(&self) -> &[DebuginfoDir] {
        &self.dirs
    }

    /// Iterate over the absolute directories, which are the ones
    /// searched for build ID based links.
    pub(crate) fn absolute_dirs(&self) -> impl Iterator<Item = &Path> {
        self.dirs
            .iter()
            .map(|dir| dir.dir.as_path())
            .filter(|dir| dir.is_absolute())
    }
}

impl Default for DebuginfoPath {
    fn default() -> Self {
        Self::parse(super::DEFAULT_DEBUGINFO_PATH)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;
    use test_tag::tag;


    /// Check that the default search path is parsed as expected.
    #[tag(miri)]
    #[test]
    fn default_path_parsing() {
        let path = DebuginfoPath::default();
        let dirs = path.dirs();
        assert_eq!(dirs.len(), 3);
        assert_eq!(dirs[0].dir, Path::new(""));
        assert_eq!(dirs[1].dir, Path::new(".debug"));
        assert_eq!(dirs[2].dir, Path::new("/usr/lib/debug"));
        assert!(dirs.iter().all(|dir| dir.check_crc));
        assert_eq!(
            path.absolute_dirs().collect::<Vec<_>>(),
            vec![Path::new("/usr/lib/debug")]
        );
    }

    /// Check that checksum prefixes are honored per entry and for the
    /// list as a whole.
    #[tag(miri)]
    #[test]
    fn crc_prefixes() {
        let path = DebuginfoPath::parse("-:+.debug:/usr/lib/debug");
        let checks = path
            .dirs()
            .iter()
            .map(|dir| dir.check_crc)
            .collect::<Vec<_>>();
        assert_eq!(checks, vec![false, true, false]);
        assert_eq!(path.dirs()[1].dir, Path::new(".debug"));

        let path = DebuginfoPath::parse("+:-/opt/debug");
        let checks = path
            .dirs()
            .iter()
            .map(|dir| dir.check_crc)
            .collect::<Vec<_>>();
        assert_eq!(checks, vec![true, false]);
    }

    /// Check the candidates generated for the various entry kinds.
    #[tag(miri)]
    #[test]
    fn debuglink_candidates() {
        let path = DebuginfoPath::default();
        let link = OsStr::new("libc.so.debug");
        let candidates = path
            .dirs()
            .iter()
            .filter_map(|dir| dir.debuglink_candidate(Path::new("/usr/lib64"), link))
            .collect::<Vec<_>>();
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/usr/lib64/libc.so.debug"),
                PathBuf::from("/usr/lib64/.debug/libc.so.debug"),
                PathBuf::from("/usr/lib/debug/usr/lib64/libc.so.debug"),
            ]
        );

        // Absolute entries are skipped for relative main paths.
        let candidates = path
            .dirs()
            .iter()
            .filter_map(|dir| dir.debuglink_candidate(Path::new("build"), link))
            .collect::<Vec<_>>();
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("build/libc.so.debug"),
                PathBuf::from("build/.debug/libc.so.debug"),
            ]
        );
    }
}
