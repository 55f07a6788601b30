use std::path::{Component, Path, PathBuf};

use crate::error::{LegerError, Result};

/// Normalize a relative path and ensure it stays within `root`. Rejects
/// absolute paths and any `.`/`..`/prefix components up front, then
/// canonicalizes the nearest existing ancestor so a symlinked directory
/// inside the root cannot lead back out of it. The returned path may not
/// exist yet.
pub fn normalize_under_root(root: &Path, candidate: &Path) -> Result<PathBuf> {
    if candidate.as_os_str().is_empty() {
        return Err(LegerError::UserInput("empty path".into()));
    }
    if candidate.is_absolute() {
        return Err(LegerError::UserInput(format!(
            "absolute paths are not allowed: {}",
            candidate.display()
        )));
    }
    for component in candidate.components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(LegerError::UserInput(format!(
                "path escapes its root: {}",
                candidate.display()
            )));
        }
    }

    let root_canon = root.canonicalize().map_err(|err| {
        LegerError::StateInconsistent(format!(
            "failed to canonicalize {}: {err}",
            root.display()
        ))
    })?;
    let joined = root_canon.join(candidate);

    let mut ancestor = joined.as_path();
    while !ancestor.exists() {
        ancestor = ancestor.parent().unwrap_or(&root_canon);
    }
    let ancestor_canon = ancestor.canonicalize().map_err(|err| {
        LegerError::StateInconsistent(format!(
            "failed to canonicalize {}: {err}",
            ancestor.display()
        ))
    })?;
    if !ancestor_canon.starts_with(&root_canon) {
        return Err(LegerError::UserInput(format!(
            "path escapes root ({}): {}",
            root_canon.display(),
            joined.display()
        )));
    }

    Ok(joined)
}

/// Deployment names become directory names under the state root and prefixes
/// of systemd unit names, so they are restricted to a conservative charset.
pub fn valid_deployment_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with(['-', '.'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Volume names follow the same rules as deployment names.
pub fn valid_volume_name(name: &str) -> bool {
    valid_deployment_name(name)
}
