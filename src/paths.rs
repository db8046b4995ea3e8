//! Path normalization and the case-insensitive 128-bit path hash.
//!
//! Every path stored by the engine uses forward slashes, regardless of
//! platform; backends convert at the kernel boundary. Repo-relative paths
//! have no leading or trailing separator (the repo root itself is the empty
//! string). Absolute paths are `C:/...` on Windows and `/...` elsewhere.

use xxhash_rust::xxh3::xxh3_128;

use crate::file_info::Hash128;

/// Relative paths are capped so name/extension offsets fit in a u16.
/// Exceeding it is a user error.
pub const MAX_RELATIVE_PATH: usize = u16::MAX as usize;

/// Collapse separators to single forward slashes.
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_sep = false;
    for c in path.chars() {
        let is_sep = c == '/' || c == '\\';
        if is_sep {
            if !prev_sep {
                out.push('/');
            }
        } else {
            out.push(c);
        }
        prev_sep = is_sep;
    }
    out
}

/// Normalize a repo-relative path: forward slashes, no leading or trailing
/// separator. The repo root is the empty string.
pub fn normalize_relative(path: &str) -> String {
    let n = normalize(path);
    n.trim_matches('/').to_string()
}

/// Normalize a repo root path: absolute, forward slashes, exactly one
/// trailing separator.
pub fn normalize_root(path: &str) -> String {
    let mut n = normalize(path);
    while n.ends_with('/') && n.len() > 1 {
        n.pop();
    }
    if !n.ends_with('/') {
        n.push('/');
    }
    n
}

pub fn is_absolute(path: &str) -> bool {
    if path.starts_with('/') {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// The drive key of an absolute path: the uppercased drive letter on
/// Windows-style paths, '/' for rooted Unix paths.
pub fn drive_letter(abs_path: &str) -> char {
    debug_assert!(is_absolute(abs_path));
    if abs_path.starts_with('/') {
        '/'
    } else {
        abs_path.as_bytes()[0].to_ascii_uppercase() as char
    }
}

pub fn starts_with_ignore_ascii_case(path: &str, prefix: &str) -> bool {
    path.len() >= prefix.len()
        && path.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Hash the absolute path of a file in a case-insensitive manner.
///
/// Used as the file's identity even when the file itself doesn't exist yet.
/// The hash is 128 bits over the uppercased UTF-16 form of the normalized
/// absolute path; collisions are assumed impossible. The volume is
/// case-insensitive, so two spellings of one path must hash identically.
pub fn hash_path(root_path: &str, relative: &str) -> Hash128 {
    debug_assert!(is_absolute(root_path) && root_path.ends_with('/'));
    debug_assert!(!relative.starts_with('/') && !relative.ends_with('/'));

    let mut abs = String::with_capacity(root_path.len() + relative.len());
    abs.push_str(root_path);
    abs.push_str(relative);

    let upper = abs.to_uppercase();
    let mut wide = Vec::with_capacity(upper.len() * 2);
    for unit in upper.encode_utf16() {
        wide.extend_from_slice(&unit.to_le_bytes());
    }

    Hash128(xxh3_128(&wide))
}

/// Offset of the character after the last slash, or 0 if there is none.
pub(crate) fn find_name_pos(path: &str) -> u16 {
    match path.rfind('/') {
        Some(pos) => (pos + 1) as u16,
        None => 0,
    }
}

/// Offset of the first '.' of the file name, or the path length if the name
/// has no extension.
pub(crate) fn find_extension_pos(name_pos: u16, path: &str) -> u16 {
    match path[name_pos as usize..].find('.') {
        Some(off) => name_pos + off as u16,
        None => path.len() as u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_and_flips_separators() {
        assert_eq!(normalize(r"C:\proj\\src//a.c"), "C:/proj/src/a.c");
        assert_eq!(normalize_relative(r"\src\util.c\"), "src/util.c");
        assert_eq!(normalize_relative(""), "");
        assert_eq!(normalize_root(r"C:\proj"), "C:/proj/");
        assert_eq!(normalize_root("C:/proj///"), "C:/proj/");
        assert_eq!(normalize_root("/"), "/");
    }

    #[test]
    fn absolute_and_drive_letter() {
        assert!(is_absolute("C:/proj"));
        assert!(is_absolute("/tmp/x"));
        assert!(!is_absolute("src/util.c"));
        assert_eq!(drive_letter("c:/proj/"), 'C');
        assert_eq!(drive_letter("/tmp/x/"), '/');
    }

    #[test]
    fn hash_is_case_insensitive() {
        let a = hash_path("C:/proj/", "src/Util.c");
        let b = hash_path("C:/PROJ/", "SRC/UTIL.C");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_distinguishes_paths() {
        let a = hash_path("C:/proj/", "src/util.c");
        let b = hash_path("C:/proj/", "src/util.h");
        let root = hash_path("C:/proj/", "");
        assert_ne!(a, b);
        assert_ne!(a, root);
    }

    #[test]
    fn name_and_extension_offsets() {
        let path = "src/util.test.c";
        let name_pos = find_name_pos(path);
        assert_eq!(&path[name_pos as usize..], "util.test.c");
        let ext_pos = find_extension_pos(name_pos, path);
        assert_eq!(&path[ext_pos as usize..], ".test.c");

        assert_eq!(find_name_pos("main.c"), 0);
        assert_eq!(find_extension_pos(0, "Makefile"), "Makefile".len() as u16);
        assert_eq!(find_name_pos(""), 0);
        assert_eq!(find_extension_pos(0, ""), 0);
    }
}
