//! Workspace path confinement.
//!
//! Every path argument a tool accepts must resolve inside the workspace
//! root. Resolution is lexical (`..` and `.` are folded without touching the
//! filesystem) so paths that do not exist yet are still checked, and the
//! operation is idempotent: confining an already-confined absolute path is a
//! no-op.

use std::path::{Component, Path, PathBuf};

/// Resolve `path` against `root` and reject it if it escapes.
pub fn resolve(root: &Path, path: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let normalised = normalise(&joined);
    let root = normalise(root);
    if normalised.starts_with(&root) {
        Ok(normalised)
    } else {
        Err(format!(
            "path '{}' escapes the workspace root",
            path
        ))
    }
}

/// Fold `.` and `..` components without filesystem access.
fn normalise(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Workspace-relative, forward-slash normalised rendering of a confined path.
pub fn relative_display(root: &Path, resolved: &Path) -> String {
    resolved
        .strip_prefix(normalise(root))
        .unwrap_or(resolved)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Argument keys the dispatcher screens for escapes before execution.
const PATH_KEYS: &[&str] = &["path", "file_path", "filePath", "cwd", "dir"];

/// Check every recognised path argument. Returns the first violation.
pub fn check_args(root: &Path, args: &serde_json::Value) -> Result<(), String> {
    let Some(map) = args.as_object() else {
        return Ok(());
    };
    for key in PATH_KEYS {
        if let Some(value) = map.get(*key).and_then(|v| v.as_str()) {
            resolve(root, value)?;
        }
    }
    if let Some(paths) = map.get("paths").and_then(|v| v.as_array()) {
        for value in paths.iter().filter_map(|v| v.as_str()) {
            resolve(root, value)?;
        }
    }
    Ok(())
}
