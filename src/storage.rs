use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::{AuthError, AuthResult};

const PRIVATE_FILE_MODE: u32 = 0o600;
const PRIVATE_DIR_MODE: u32 = 0o700;

/// Resolves `<config>/gsuite`: `$XDG_CONFIG_HOME` first, then the platform
/// config dir, then `$HOME/.config`.
pub fn default_config_dir() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        });
    base.join("gsuite")
}

/// Every missing level is created 0700. An existing `dir` is tightened to
/// 0700; existing ancestors are left alone.
pub fn ensure_private_dir(dir: &Path) -> AuthResult<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(PRIVATE_DIR_MODE)
        .create(dir)
        .map_err(|err| {
            AuthError::storage(format!("failed to create dir {}: {}", dir.display(), err))
        })?;
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(PRIVATE_DIR_MODE));
    Ok(())
}

/// Readers either see the previous file or the complete new one, never a
/// partial write.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> AuthResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AuthError::storage(format!("invalid target path: {}", path.display())))?;
    ensure_private_dir(parent)?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|err| AuthError::storage(format!("failed to create temp file: {}", err)))?;
    temp_file
        .write_all(data)
        .map_err(|err| AuthError::storage(format!("failed to write temp file: {}", err)))?;
    let _ = temp_file
        .as_file()
        .set_permissions(fs::Permissions::from_mode(PRIVATE_FILE_MODE));

    temp_file.persist(path).map_err(|err| {
        AuthError::storage(format!("failed to persist {}: {}", path.display(), err))
    })?;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(PRIVATE_FILE_MODE));
    Ok(())
}
