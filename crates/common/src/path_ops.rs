//! Path helpers for remote object paths.
//!
//! Remote paths are absolute and `/` separated; the root is `/`. Listings
//! are keyed by the parent path, so most callers need to split a path into
//! its parent and final component.

/// The root directory path
pub const ROOT: &str = "/";

/// Normalize a path: ensure a leading slash, drop trailing slashes and
/// collapse an empty path to the root.
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return ROOT.to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Parent directory of a path (`/` for top-level entries and for the root itself)
pub fn parent_of(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) | None => ROOT.to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Final component of a path (empty for the root)
pub fn name_of(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

/// Join a child name onto a directory path
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT || parent.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Whether `path` is `ancestor` itself or lives somewhere beneath it
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return true;
    }
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Re-root `path` from under `from` to under `to`.
///
/// Returns `None` when `path` is not within `from`. The root cannot be re-rooted.
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if from == ROOT || !is_within(path, from) {
        return None;
    }
    let rest = &path[from.len()..];
    Some(format!("{}{}", to, rest))
}
