//! Minimal unified diffs for file edits.
//!
//! An edit is computed in memory and handed to the runtime as a diff against
//! the directory tree, so large files are never shipped whole.

use std::path::{Component, Path};

use anyhow::{Result, anyhow};

/// Where a patch applies: a directory inside the snapshot plus the file path
/// relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchLocation {
    pub dir: String,
    pub relative: String,
}

/// Resolve `path` against `workdir` into a patch location.
///
/// `.` and `..` are resolved lexically first, so the patch lands on the same
/// file a read of `path` returns; `..` above `/` stays at `/`. Paths that end
/// up under `workdir` patch the workdir tree, anything else patches the root.
pub fn patch_location(workdir: &str, path: &str) -> PatchLocation {
    let root = lexical_components("/", workdir);
    let target = lexical_components(workdir, path);
    if target.len() > root.len() && target.starts_with(&root) {
        return PatchLocation {
            dir: ".".to_string(),
            relative: target[root.len()..].join("/"),
        };
    }
    PatchLocation {
        dir: "/".to_string(),
        relative: target.join("/"),
    }
}

/// Components of `path` made absolute against `base`, with `.` and `..` applied.
fn lexical_components(base: &str, path: &str) -> Vec<String> {
    let path = Path::new(path);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new("/").join(base).join(path)
    };
    let mut parts: Vec<String> = Vec::new();
    for component in joined.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    parts
}

/// Unified diff turning `old` into `new` for `relative`, with git-style
/// `a/` and `b/` headers.
pub fn unified_diff(relative: &str, old: &str, new: &str) -> String {
    let body = diffy::create_patch(old, new).to_string();
    let hunks: String = body
        .lines()
        .skip_while(|line| line.starts_with("--- ") || line.starts_with("+++ "))
        .flat_map(|line| [line, "\n"])
        .collect();
    format!("--- a/{relative}\n+++ b/{relative}\n{hunks}")
}

/// File path named by a patch's `+++` header, without the `b/` prefix.
pub fn patch_target(patch: &str) -> Option<&str> {
    patch.lines().find_map(|line| {
        let name = line.strip_prefix("+++ ")?;
        Some(name.strip_prefix("b/").unwrap_or(name).trim_end())
    })
}

/// Apply a patch produced by [`unified_diff`] to `base`.
pub fn apply_unified_diff(base: &str, patch: &str) -> Result<String> {
    let parsed = diffy::Patch::from_str(patch).map_err(|e| anyhow!("parse patch: {e}"))?;
    diffy::apply(base, &parsed).map_err(|e| anyhow!("apply patch: {e}"))
}
