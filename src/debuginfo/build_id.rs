use std::fmt::Write as _;
use std::path::Path;
use std::path::PathBuf;


/// Format `bytes` as a lower case hexadecimal string.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, byte| {
            // SANITY: Writing to a `String` never fails.
            let () = write!(s, "{byte:02x}").unwrap();
            s
        })
}

/// Construct the path `<dir>/.build-id/xx/yyyy<suffix>` for the
/// provided build ID.
///
/// Build IDs shorter than two bytes cannot be represented.
pub(crate) fn build_id_path(dir: &Path, build_id: &[u8], suffix: &str) -> Option<PathBuf> {
    if build_id.len() < 2 {
        return None
    }

    let (first, rest) = build_id.split_at(1);
    let path = dir
        .join(".build-id")
        .join(hex(first))
        .join(format!("{}{suffix}", hex(rest)));
    Some(path)
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_tag::tag;


    /// Check that build ID paths are constructed as expected.
    #[tag(miri)]
    #[test]
    fn build_id_paths() {
        let path = build_id_path(Path::new("/usr/lib/debug"), &[0xab, 0xcd, 0x0e], ".debug");
        assert_eq!(
            path,
            Some(PathBuf::from("/usr/lib/debug/.build-id/ab/cd0e.debug"))
        );

        assert_eq!(build_id_path(Path::new("/"), &[0x1], ""), None);
        assert_eq!(hex(&[]), "");
        assert_eq!(hex(&[0x0, 0xff]), "00ff");
    }
}
