use std::path::Path;

fn is_dir_separator(c: u8) -> bool {
    c == b'/' || (cfg!(windows) && c == b'\\')
}

/// Returns `true` if `path` is `prefix` itself or lies in the directory `prefix`.
///
/// The comparison is textual. `"/aa"` matches `"/aa/bb"` but not `"/aaa"`.
pub fn matches_dir_prefix_or_file(prefix: &Path, path: &Path) -> bool {
    let prefix = prefix.as_os_str().as_encoded_bytes();
    let path = path.as_os_str().as_encoded_bytes();

    !prefix.is_empty()
        && !path.is_empty()
        && path.starts_with(prefix)
        && (prefix.len() == path.len()
            || is_dir_separator(path[prefix.len()])
            || is_dir_separator(prefix[prefix.len() - 1]))
}
