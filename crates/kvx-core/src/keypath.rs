//! Key path helpers.
//!
//! Keys are `/`-delimited strings. A trailing separator denotes directory
//! intent and is preserved by [`normalize`].

/// Path separator used by every backend.
pub const SEPARATOR: char = '/';

/// Strip every leading separator.
pub fn trim_start(key: &str) -> &str {
    key.trim_start_matches(SEPARATOR)
}

/// Strip every trailing separator.
pub fn trim_end(key: &str) -> &str {
    key.trim_end_matches(SEPARATOR)
}

/// Strip separators from both ends.
pub fn trim(key: &str) -> &str {
    key.trim_matches(SEPARATOR)
}

/// Canonical absolute form of a key.
///
/// Prefixes a single leading separator and collapses runs of separators,
/// so `normalize(normalize(k)) == normalize(k)`.
pub fn normalize(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 1);
    out.push(SEPARATOR);
    let mut last_was_sep = true;
    for c in key.chars() {
        if c == SEPARATOR {
            if !last_was_sep {
                out.push(c);
            }
            last_was_sep = true;
        } else {
            out.push(c);
            last_was_sep = false;
        }
    }
    out
}

/// Whether the key ends with a separator (directory intent).
pub fn is_directory(key: &str) -> bool {
    key.ends_with(SEPARATOR)
}

/// Prefix selecting every key strictly below `directory`.
///
/// `directory` is expected in backend form (no leading separator). The
/// root directory maps to the empty prefix.
pub fn directory_prefix(directory: &str) -> String {
    let dir = trim_end(directory);
    if dir.is_empty() {
        String::new()
    } else {
        format!("{dir}{SEPARATOR}")
    }
}
