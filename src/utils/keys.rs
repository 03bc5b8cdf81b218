//! Object key helpers.
//!
//! Store keys are slash-delimited paths. Staging paths and destination keys are
//! derived from them deterministically, keeping every intermediate segment so
//! that `a/x.heic` and `b/x.heic` never share a staging file.

use std::path::{Component, Path, PathBuf};

/// Extension of the key's last segment, without the dot.
pub fn extension(key: &str) -> Option<&str> {
    let name = key.rsplit('/').next()?;
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

/// Case-insensitive extension match; `ext` is given without the dot.
pub fn has_extension(key: &str, ext: &str) -> bool {
    extension(key).is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Replaces the extension of the last segment, appending one when absent.
pub fn swap_extension(key: &str, ext: &str) -> String {
    let (dir, name) = match key.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, key),
    };
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    match dir {
        Some(dir) => format!("{dir}/{stem}.{ext}"),
        None => format!("{stem}.{ext}"),
    }
}

/// The key as a relative filesystem path, or `None` when it would escape
/// the directory it is joined onto.
pub fn relative_path(key: &str) -> Option<PathBuf> {
    let trimmed = key.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        return None;
    }

    let path = Path::new(trimmed);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => out.push(segment),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Moves `key` from under `from` to under `to`. Keys outside `from` are only
/// prefixed.
pub fn rebase(key: &str, from: &str, to: &str) -> String {
    let relative = key.strip_prefix(from).unwrap_or(key);
    format!("{to}{relative}")
}
