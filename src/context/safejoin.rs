use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

use crate::pattern;

/// Resolves an untrusted relative path under `root`, following symlinks one
/// component at a time and refusing any result that lands outside `root`.
///
/// Returns `Ok(None)` when the path escapes, via `..` or via a symlink; the
/// caller is expected to silently drop the write. This is the single choke
/// point for tar extraction and COPY/ADD destination writes, so archive- and
/// symlink-based traversal from untrusted contexts never reaches the host.
pub fn safe_join(root: &Path, unsafe_rel: &str) -> Result<Option<PathBuf>> {
    let rel = pattern::clean(unsafe_rel.trim_start_matches('/'));
    let croot = fs::canonicalize(root)
        .with_context(|| format!("Failed to canonicalize {}", root.display()))?;
    if rel == "." {
        return Ok(Some(croot));
    }
    if rel == ".." || rel.starts_with("../") {
        return Ok(None);
    }

    let mut cur = croot.clone();
    for comp in rel.split('/') {
        let next = cur.join(comp);
        let is_symlink = fs::symlink_metadata(&next)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            cur = next;
            continue;
        }
        let resolved = match fs::canonicalize(&next) {
            Ok(p) => p,
            Err(_) => {
                // Dangling link: resolve its target lexically.
                let target = fs::read_link(&next)
                    .with_context(|| format!("Failed to read link {}", next.display()))?;
                let abs = if target.is_absolute() {
                    target
                } else {
                    cur.join(target)
                };
                lexical_resolve(&abs)
            }
        };
        if !resolved.starts_with(&croot) {
            return Ok(None);
        }
        cur = resolved;
    }
    Ok(Some(cur))
}

/// Lexically folds `.` and `..` components of an absolute path without
/// touching the filesystem.
fn lexical_resolve(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
