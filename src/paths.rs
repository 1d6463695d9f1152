use std::path::{Path, PathBuf};

use crate::config::{CONFIG_DIR, CONFIG_FILENAME};

/// Resolve the project root for a run.
///
/// When a `.patchwarden/config.toml` was found, the root is the directory that
/// holds `.patchwarden/`. Otherwise the working directory is the root.
pub fn resolve_project_root(cwd: &Path, config_path: Option<&Path>) -> PathBuf {
    config_path
        .and_then(Path::parent)
        .filter(|dir| dir.file_name().is_some_and(|name| name == CONFIG_DIR))
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf())
}

/// State directory holding logs, alerts and (by default) backups.
pub fn state_dir(project_root: &Path) -> PathBuf {
    project_root.join(CONFIG_DIR)
}

pub fn logs_dir(project_root: &Path) -> PathBuf {
    state_dir(project_root).join("logs")
}

pub fn config_file(project_root: &Path) -> PathBuf {
    state_dir(project_root).join(CONFIG_FILENAME)
}
