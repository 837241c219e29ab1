//! Path containment and encoding helpers for the single-root resource tree.
//!
//! Paths are absolute, cleaned, slash-separated strings. Equality is string
//! equality after cleaning, which makes the containment predicates below
//! plain string operations.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

/// Characters that must be escaped inside a URL path. Slashes are kept
/// verbatim so encoded paths remain hierarchical.
const PATH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\');

/// Lexically cleans a slash-separated path: collapses repeated slashes,
/// resolves `.` and `..`, and drops any trailing slash.
pub fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|s| *s != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            _ => out.push(segment),
        }
    }
    let joined = out.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Joins a relative name onto a base path and cleans the result.
pub fn join(base: &str, rel: &str) -> String {
    if rel.is_empty() {
        clean(base)
    } else {
        clean(&format!("{base}/{rel}"))
    }
}

/// Returns the parent path; the root is its own parent.
pub fn parent(path: &str) -> String {
    join(path, "..")
}

/// Final path segment, used for `displayname`.
pub fn base(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name,
        _ => path,
    }
}

/// Determines whether `path` lies within `subtree` (inclusive).
pub fn in_tree(path: &str, subtree: &str) -> bool {
    if path == subtree {
        return true;
    }
    if subtree.ends_with('/') {
        path.starts_with(subtree)
    } else {
        path.len() > subtree.len()
            && path.starts_with(subtree)
            && path.as_bytes()[subtree.len()] == b'/'
    }
}

/// Determines whether `path` is included in `subtree` subject to the depth
/// restriction (negative depth means unbounded). On inclusion, returns the
/// cleaned remainder of `path` relative to `subtree`.
pub fn included(path: &str, subtree: &str, depth: i32) -> Option<String> {
    if path == subtree {
        return Some(String::new());
    }
    if !in_tree(path, subtree) {
        return None;
    }
    let rel = clean(&path[subtree.len()..]);
    let rel = rel.trim_start_matches('/');
    let segments = rel.split('/').count() as i32;
    if depth >= 0 && segments > depth {
        return None;
    }
    Some(rel.to_string())
}

/// Percent-encodes a path so it is safe to place in a URL or an `href`.
pub fn url_encode(path: &str) -> String {
    utf8_percent_encode(path, PATH_ESCAPE).to_string()
}
