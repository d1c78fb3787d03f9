//! Credential file access for plugin `CoreServices` handles.
//!
//! Grounded on the teacher's `sa-skills` credential-path discipline
//! (rejecting traversal before ever touching the filesystem) generalized
//! to plugins and to a `PathBuf`-based root instead of a fixed directory.

use std::path::{Path, PathBuf};

use carapace_domain::error::CoreError;

/// `key` must contain no `/`, no `..`, and no NUL byte — the same rule the
/// manifest validator applies to `install.credentials` entries, checked
/// again here since a plugin could in principle ask for an
/// un-declared key.
fn validate_key(key: &str) -> Result<(), CoreError> {
    if key.is_empty() || key.contains('/') || key.contains("..") || key.contains('\0') {
        return Err(CoreError::Internal(format!("invalid credential key '{key}'")));
    }
    Ok(())
}

/// Reads `{credentials_root}/{plugin_name}/{key}`. Refuses to follow a
/// symlink at the final path component — a plugin sandbox escape vector if
/// `credentials_root` is ever made writable by a lower-trust process.
pub fn read_credential(credentials_root: &Path, plugin_name: &str, key: &str) -> Result<Vec<u8>, CoreError> {
    validate_key(plugin_name)?;
    validate_key(key)?;

    let path: PathBuf = credentials_root.join(plugin_name).join(key);

    let metadata = std::fs::symlink_metadata(&path).map_err(|e| CoreError::Internal(format!("credential '{plugin_name}/{key}' unavailable: {e}")))?;
    if metadata.file_type().is_symlink() {
        return Err(CoreError::Internal(format!("credential '{plugin_name}/{key}' refused: symlink")));
    }

    std::fs::read(&path).map_err(|e| CoreError::Internal(format!("credential '{plugin_name}/{key}' unavailable: {e}")))
}
