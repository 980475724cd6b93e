//! Filename filtering, content fingerprinting, and relative-path normalization.
//!
//! These are pure, synchronous helpers shared by the watcher, the debouncer's
//! stable-file handler, and the rescanner, anywhere a raw filesystem path
//! needs to become something the server can reason about.

use std::io::Read;
use std::path::{Path, PathBuf};

/// Basename prefixes that mark a file or directory as noise to ignore.
const IGNORE_PREFIXES: &[&str] = &["~", ".", "._"];

/// Basename suffixes that mark a file as noise to ignore.
const IGNORE_SUFFIXES: &[&str] = &[".tmp", ".bak", ".swp", ".ds_store", "thumbs.db", "desktop.ini"];

/// Basename prefixes used by common editors/OSes for not-yet-named files.
const PLACEHOLDER_PREFIXES: &[&str] = &["新建", "new ", "未命名", "untitled"];

/// Chunk size used while streaming a file for its MD5 fingerprint.
const FINGERPRINT_READ_CHUNK: usize = 1024 * 1024;

/// Returns true if `path`'s basename matches the ignore blacklist.
///
/// Ignored basenames are filtered both for individual files and for
/// directories encountered while walking the tree.
#[must_use]
pub fn should_ignore(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_lowercase();
    IGNORE_PREFIXES.iter().any(|p| lower.starts_with(p))
        || IGNORE_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// Returns true if `path`'s basename matches a known "not yet named" pattern
/// used by editors and operating systems (e.g. "New Text Document.txt",
/// "未命名文件夹"). Callers additionally check file size: a placeholder of
/// size 0 is an editor stub and should be ignored; once written to, it is
/// a real file and is no longer treated specially.
#[must_use]
pub fn is_placeholder(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_lowercase();
    PLACEHOLDER_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Computes the MD5 fingerprint of a file's full content, streaming in
/// 1 MiB chunks to bound memory use on large instrument output files.
///
/// Returns `None` if the file cannot be opened or read. The caller should
/// treat this as "not yet ready" rather than a hard error (the debouncer
/// will naturally re-fire if the file changes further).
#[must_use]
pub fn fingerprint(path: &Path) -> Option<String> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; FINGERPRINT_READ_CHUNK];
    loop {
        let read = file.read(&mut buf).ok()?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }
    Some(format!("{:x}", context.compute()))
}

/// Computes `path`'s location relative to `root`, with path separators
/// normalized to `/` regardless of platform.
///
/// Returns `None` if `path` is not under `root`. The caller should drop
/// the event rather than report an unrepresentable path to the server.
#[must_use]
pub fn relative_path(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        parts.push(component.as_os_str().to_str()?.to_string());
    }
    Some(parts.join("/"))
}

/// Joins a root directory and a server-relative (`/`-separated) path back
/// into a platform-native [`PathBuf`]. Used by the worker when it only has
/// the relative path on hand (e.g. the rename destination).
#[must_use]
pub fn to_local_path(root: &Path, rel_path: &str) -> PathBuf {
    let mut buf = root.to_path_buf();
    for part in rel_path.split('/') {
        buf.push(part);
    }
    buf
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn ignores_dotfiles_and_tilde_and_known_suffixes() {
        assert!(should_ignore(Path::new("/a/.hidden")));
        assert!(should_ignore(Path::new("/a/~lock.docx")));
        assert!(should_ignore(Path::new("/a/._AppleDouble")));
        assert!(should_ignore(Path::new("/a/output.tmp")));
        assert!(should_ignore(Path::new("/a/backup.BAK")));
        assert!(should_ignore(Path::new("/a/Thumbs.db")));
        assert!(should_ignore(Path::new("/a/Desktop.ini")));
        assert!(!should_ignore(Path::new("/a/real_data.csv")));
    }

    #[test]
    fn placeholder_prefixes_match_case_insensitively() {
        assert!(is_placeholder(Path::new("/a/新建文本文档.txt")));
        assert!(is_placeholder(Path::new("/a/New Text Document.txt")));
        assert!(is_placeholder(Path::new("/a/未命名文件夹")));
        assert!(is_placeholder(Path::new("/a/Untitled.txt")));
        assert!(!is_placeholder(Path::new("/a/experiment_042.csv")));
    }

    #[test]
    fn relative_path_normalizes_to_forward_slashes() {
        let root = Path::new("/watch");
        let path = Path::new("/watch/sub/dir/file.txt");
        assert_eq!(relative_path(path, root).as_deref(), Some("sub/dir/file.txt"));
    }

    #[test]
    fn relative_path_outside_root_is_none() {
        let root = Path::new("/watch");
        let path = Path::new("/elsewhere/file.txt");
        assert_eq!(relative_path(path, root), None);
    }

    #[test]
    fn to_local_path_rebuilds_native_path() {
        let root = Path::new("/watch");
        let rebuilt = to_local_path(root, "a/b/c.txt");
        assert_eq!(rebuilt, Path::new("/watch/a/b/c.txt"));
    }

    #[test]
    fn fingerprint_matches_known_md5_of_hello() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello").unwrap();
        drop(f);

        // MD5("hello") is a well known test vector.
        assert_eq!(
            fingerprint(&path).as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }

    #[test]
    fn fingerprint_of_missing_file_is_none() {
        assert_eq!(fingerprint(Path::new("/does/not/exist")), None);
    }

    #[test]
    fn fingerprint_streams_large_file_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        let chunk = vec![0xABu8; 1024 * 1024];
        for _ in 0..3 {
            f.write_all(&chunk).unwrap();
        }
        drop(f);
        assert!(fingerprint(&path).is_some());
    }
}
