//! Path access control
//!
//! A pure predicate over absolute paths against configured allow/deny roots.
//! Deny rules always win; with no allow roots everything not denied is
//! reachable. Matching is component-wise, so a root never matches a sibling
//! that merely shares a string prefix ("/data" does not cover "/database").
//!
//! Paths are resolved lexically: relative inputs are joined against the
//! process working directory and `.`/`..` segments are collapsed without
//! consulting the filesystem.

use std::path::{Component, Path, PathBuf};

/// Static allow/deny policy for filesystem operations
#[derive(Debug, Clone, Default)]
pub struct PathAccess {
    allowed: Vec<PathBuf>,
    denied: Vec<PathBuf>,
}

impl PathAccess {
    /// Build a policy from configured roots; each root is resolved to
    /// absolute, cleaned form up front.
    pub fn new(allowed: Vec<PathBuf>, denied: Vec<PathBuf>) -> Self {
        PathAccess {
            allowed: allowed.iter().map(|p| absolutize(p)).collect(),
            denied: denied.iter().map(|p| absolutize(p)).collect(),
        }
    }

    /// Whether `path` may be read or mutated.
    ///
    /// Denied if it equals or sits under any denied root. Otherwise allowed
    /// when no allow roots are configured, or when it equals or sits under
    /// one of them.
    pub fn is_allowed(&self, path: &Path) -> bool {
        let abs = absolutize(path);
        if self.denied.iter().any(|d| is_within(&abs, d)) {
            return false;
        }
        if self.allowed.is_empty() {
            return true;
        }
        self.allowed.iter().any(|a| is_within(&abs, a))
    }

    /// Whether a directory-listing entry at `path` may be shown.
    ///
    /// Same as [`is_allowed`](Self::is_allowed), except a directory that is
    /// an ancestor of an allow root is also kept, so a client can navigate
    /// down to a permitted subtree from an unprivileged parent.
    pub fn is_listable(&self, path: &Path, is_dir: bool) -> bool {
        let abs = absolutize(path);
        if self.denied.iter().any(|d| is_within(&abs, d)) {
            return false;
        }
        if self.allowed.is_empty() {
            return true;
        }
        self.allowed
            .iter()
            .any(|a| is_within(&abs, a) || (is_dir && a.starts_with(&abs)))
    }

    /// True when at least one allow root is configured.
    pub fn has_allow_roots(&self) -> bool {
        !self.allowed.is_empty()
    }
}

/// Resolve `path` to absolute, lexically cleaned form.
///
/// Relative paths are joined against the current working directory. `.` is
/// dropped and `..` pops the previous component; popping past the root stays
/// at the root. Symlinks are not resolved.
pub fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::RootDir => out.push(Component::RootDir),
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(Component::RootDir);
    }
    out
}

/// Component-wise containment: `path` equals `base` or sits under it.
fn is_within(path: &Path, base: &Path) -> bool {
    path.starts_with(base)
}
