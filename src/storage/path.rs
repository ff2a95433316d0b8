use std::path::PathBuf;

use super::StorageError;

/// Resolves `~`, `~/...`, `$HOME` and `$HOME/...` against the HOME variable.
pub(crate) fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let suffix = if raw_path == "~" || raw_path == "$HOME" {
        Some("")
    } else {
        raw_path
            .strip_prefix("~/")
            .or_else(|| raw_path.strip_prefix("$HOME/"))
    };

    match suffix {
        Some(suffix) => {
            let home = std::env::var_os("HOME").ok_or(StorageError::HomeDirectoryUnavailable)?;
            let home = PathBuf::from(home);
            Ok(if suffix.is_empty() {
                home
            } else {
                home.join(suffix)
            })
        }
        None => Ok(PathBuf::from(raw_path)),
    }
}
