use corral_runtime::RuntimeError;
use std::path::{Component, Path, PathBuf};

fn escape_error(path: &str) -> RuntimeError {
    RuntimeError::execution(format!("path escapes the worktree root: {path}"), None)
        .with_context("path", path)
}

/// Resolve `path` against `root` and reject anything that would land outside
/// it.
///
/// Absolute paths are accepted only when they already lie under `root`. `..`
/// components are resolved logically and may not climb above the root. The
/// deepest existing ancestor is then canonicalized so a symlink inside the
/// tree cannot point the result elsewhere.
pub fn resolve_within(root: &Path, path: &str) -> Result<PathBuf, RuntimeError> {
    let requested = Path::new(path);
    let relative = if requested.is_absolute() {
        requested
            .strip_prefix(root)
            .map_err(|_| escape_error(path))?
            .to_path_buf()
    } else {
        requested.to_path_buf()
    };

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(escape_error(path));
                }
            }
            Component::Normal(part) => parts.push(part),
            Component::RootDir | Component::Prefix(_) => return Err(escape_error(path)),
        }
    }

    let mut resolved = root.to_path_buf();
    resolved.extend(parts);

    let canonical_root = root
        .canonicalize()
        .map_err(|e| RuntimeError::execution(format!("worktree root unavailable: {e}"), None))?;
    let mut existing = resolved.as_path();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            if !canonical.starts_with(&canonical_root) {
                return Err(escape_error(path));
            }
            break;
        }
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }

    Ok(resolved)
}
