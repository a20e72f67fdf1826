//! Path helpers
//!
//! Partition paths are compared component by component, so `/home` is a
//! prefix of `/home/alice` but not of `/homework`.

use metaroute_common::{Error, ROOT_PATH, Result};

/// Canonical form of an absolute path: no empty components, no trailing
/// slash, `/` for the root.
pub fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::invalid_path(format!("{path}: not absolute")));
    }
    let mut out = String::with_capacity(path.len());
    for component in components(path) {
        out.push('/');
        out.push_str(component);
    }
    if out.is_empty() {
        out.push_str(ROOT_PATH);
    }
    Ok(out)
}

/// Non-empty components of a path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// True when every component of `prefix` matches the leading components of
/// `path`. Equal paths count as a prefix.
#[must_use]
pub fn is_prefix(prefix: &str, path: &str) -> bool {
    let mut rest = components(path);
    components(prefix).all(|p| rest.next() == Some(p))
}

/// True when `prefix` is a prefix of `path` and the two differ.
#[must_use]
pub fn is_proper_prefix(prefix: &str, path: &str) -> bool {
    is_prefix(prefix, path) && components(prefix).count() < components(path).count()
}
