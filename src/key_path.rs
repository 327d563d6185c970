//! Key path joining, splitting and root key resolution.
//!
//! Key paths are backslash separated, for example
//! `HKEY_LOCAL_MACHINE\System\Select`. Keys inside a single registry file
//! that has no key path prefix use paths relative to the file root, which
//! start with a separator, for example `\Select`.

/// Key path segment separator.
pub const KEY_PATH_SEPARATOR: char = '\\';

/// Root keys supported by the registry.
pub const ROOT_KEYS: [&str; 7] = [
    "HKEY_CLASSES_ROOT",
    "HKEY_CURRENT_CONFIG",
    "HKEY_CURRENT_USER",
    "HKEY_DYN_DATA",
    "HKEY_LOCAL_MACHINE",
    "HKEY_PERFORMANCE_DATA",
    "HKEY_USERS",
];

/// Root key aliases and the root key they stand for.
pub const ROOT_KEY_ALIASES: [(&str, &str); 5] = [
    ("HKCC", "HKEY_CURRENT_CONFIG"),
    ("HKCR", "HKEY_CLASSES_ROOT"),
    ("HKCU", "HKEY_CURRENT_USER"),
    ("HKLM", "HKEY_LOCAL_MACHINE"),
    ("HKU", "HKEY_USERS"),
];

/// Joins path segments into a key path.
///
/// Every segment may itself contain separators. Successive and trailing
/// separators are collapsed and the result starts with a separator unless
/// its first segment is a root key name.
///
/// # Examples
///
/// ```rust
/// use reg_vfs::key_path::join_key_path;
///
/// assert_eq!(join_key_path(["HKEY_CURRENT_USER\\", "\\Software"]), "HKEY_CURRENT_USER\\Software");
/// assert_eq!(join_key_path(["Select"]), "\\Select");
/// ```
pub fn join_key_path<I, S>(path_segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key_path = String::new();
    let mut first_segment = true;

    for path_segment in path_segments {
        for segment in path_segment.as_ref().split(KEY_PATH_SEPARATOR) {
            if segment.is_empty() {
                continue;
            }
            if first_segment {
                if !is_root_key(segment) {
                    key_path.push(KEY_PATH_SEPARATOR);
                }
                first_segment = false;
            } else {
                key_path.push(KEY_PATH_SEPARATOR);
            }
            key_path.push_str(segment);
        }
    }

    if first_segment {
        key_path.push(KEY_PATH_SEPARATOR);
    }
    key_path
}

/// Splits a key path into its segments, dropping empty segments.
pub fn split_key_path(key_path: &str) -> Vec<&str> {
    split_key_path_with(key_path, "\\")
}

/// Splits a key path on an arbitrary separator string, dropping empty segments.
///
/// Regular expression key paths use an escaped backslash (`\\`) as separator.
pub fn split_key_path_with<'a>(key_path: &'a str, separator: &str) -> Vec<&'a str> {
    key_path
        .split(separator)
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Returns true if the name is one of the root keys, ignoring case.
pub fn is_root_key(name: &str) -> bool {
    ROOT_KEYS.iter().any(|root| root.eq_ignore_ascii_case(name))
}

/// Resolves a root key name or alias to its canonical root key name.
///
/// Returns `None` if the name is neither a root key nor an alias.
///
/// # Examples
///
/// ```rust
/// use reg_vfs::key_path::resolve_root_key;
///
/// assert_eq!(resolve_root_key("hkcu"), Some("HKEY_CURRENT_USER"));
/// assert_eq!(resolve_root_key("HKEY_USERS"), Some("HKEY_USERS"));
/// assert_eq!(resolve_root_key("HKEY_BOGUS"), None);
/// ```
pub fn resolve_root_key(name: &str) -> Option<&'static str> {
    if let Some((_, root)) = ROOT_KEY_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
    {
        return Some(root);
    }
    ROOT_KEYS
        .iter()
        .copied()
        .find(|root| root.eq_ignore_ascii_case(name))
}

/// Compares two key names ignoring case.
pub fn key_names_equal(first: &str, second: &str) -> bool {
    first.eq_ignore_ascii_case(second) || first.to_uppercase() == second.to_uppercase()
}

/// Strips a key path prefix segment by segment, ignoring case.
///
/// Returns the remainder as a relative key path starting with a separator,
/// or `None` if `prefix` is not `key_path` or one of its ancestors.
///
/// # Examples
///
/// ```rust
/// use reg_vfs::key_path::strip_key_path_prefix;
///
/// assert_eq!(
///     strip_key_path_prefix("HKEY_LOCAL_MACHINE\\System\\Select", "hkey_local_machine\\SYSTEM"),
///     Some("\\Select".to_string())
/// );
/// assert_eq!(strip_key_path_prefix("HKEY_USERS", "HKEY_USERS"), Some("\\".to_string()));
/// assert_eq!(strip_key_path_prefix("HKEY_USERS", "HKEY_CURRENT_USER"), None);
/// ```
pub fn strip_key_path_prefix(key_path: &str, prefix: &str) -> Option<String> {
    let segments = split_key_path(key_path);
    let prefix_segments = split_key_path(prefix);

    if prefix_segments.len() > segments.len() {
        return None;
    }
    let prefix_matches = prefix_segments
        .iter()
        .zip(&segments)
        .all(|(expected, segment)| key_names_equal(expected, segment));
    if !prefix_matches {
        return None;
    }

    let mut relative_key_path = String::new();
    for segment in &segments[prefix_segments.len()..] {
        relative_key_path.push(KEY_PATH_SEPARATOR);
        relative_key_path.push_str(segment);
    }
    if relative_key_path.is_empty() {
        relative_key_path.push(KEY_PATH_SEPARATOR);
    }
    Some(relative_key_path)
}

/// Returns true if `prefix` is `key_path` or one of its ancestors.
///
/// Both arguments are expected in the same case. The comparison honours
/// segment boundaries: `A\BC` is not under `A\B`.
pub(crate) fn has_key_path_prefix(key_path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || prefix == "\\" {
        return true;
    }
    match key_path.strip_prefix(prefix) {
        Some(remainder) => remainder.is_empty() || remainder.starts_with(KEY_PATH_SEPARATOR),
        None => false,
    }
}
