//! Common helper functions for Trellis.

use std::path::{Path, PathBuf};

pub const MAX_FILENAME_BYTES: usize = 255;

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Reduce an untrusted name to one path component made of
/// `[A-Za-z0-9._ -]`, at most [`MAX_FILENAME_BYTES`] long.
///
/// Directory parts are dropped; other characters become `_`. `None` when
/// nothing but dots and spaces is left.
pub fn safe_file_name(input: &str) -> Option<String> {
    let base = Path::new(input.trim()).file_name()?.to_string_lossy();
    // Every kept char is ASCII, so chars and bytes coincide.
    let mapped: String = base
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c,
            '.' | '_' | '-' | ' ' => c,
            _ => '_',
        })
        .take(MAX_FILENAME_BYTES)
        .collect();
    let name = mapped.trim().trim_matches('.').trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// `path` itself if free, else the first free `stem-N.ext`.
pub fn free_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    std::iter::once(path.to_path_buf())
        .chain((1..=9_999u32).map(|n| path.with_file_name(format!("{stem}-{n}{ext}"))))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn safe_file_name_keeps_only_the_last_component() {
        assert_eq!(
            safe_file_name("../../../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(safe_file_name("recv/../..").as_deref(), None);
        assert_eq!(safe_file_name(""), None);
        assert_eq!(safe_file_name(" . "), None);
        assert_eq!(safe_file_name("..."), None);
    }

    #[test]
    fn safe_file_name_masks_and_caps() {
        assert_eq!(
            safe_file_name("recv_alice:1700000000000").as_deref(),
            Some("recv_alice_1700000000000")
        );
        assert_eq!(safe_file_name("a\u{0}b\u{e9}").as_deref(), Some("a_b_"));
        let long = "x".repeat(MAX_FILENAME_BYTES * 2);
        assert_eq!(safe_file_name(&long).map(|n| n.len()), Some(MAX_FILENAME_BYTES));
    }

    #[test]
    fn free_path_numbers_collisions() {
        let dir = std::env::temp_dir().join(format!("trellis-helpers-{}", now_millis()));
        fs::create_dir_all(&dir).unwrap();
        let first = dir.join("report.txt");
        assert_eq!(free_path(&first), first);

        fs::write(&first, b"x").unwrap();
        assert_eq!(free_path(&first), dir.join("report-1.txt"));
        fs::write(dir.join("report-1.txt"), b"y").unwrap();
        assert_eq!(free_path(&first), dir.join("report-2.txt"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn now_millis_is_recent() {
        // 2023-11-14 in unix millis
        assert!(now_millis() > 1_700_000_000_000);
    }
}
