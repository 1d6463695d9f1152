//! Splicing a validated function into its source file.
//!
//! The target is parsed, the definition located structurally, the original
//! content snapshotted to a timestamped backup, and the new content written
//! through a temp file + rename. A failure at any step leaves the target
//! byte-identical.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::source::{self, SourceError};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot patch {path}: {source}")]
    Locate {
        path: PathBuf,
        #[source]
        source: SourceError,
    },

    #[error("replacement for '{function}' would leave {path} unparseable")]
    InvalidResult { path: PathBuf, function: String },

    #[error("failed to write backup {path}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Full copy of a file taken just before it was modified.
#[derive(Debug, Clone)]
pub struct BackupSnapshot {
    pub source: PathBuf,
    pub timestamp: NaiveDateTime,
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct AppliedPatch {
    pub target: PathBuf,
    pub function: String,
    pub backup: BackupSnapshot,
    pub sha256_before: String,
    pub sha256_after: String,
}

/// A backup found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub timestamp: NaiveDateTime,
}

pub struct PatchApplier {
    backup_dir: PathBuf,
}

impl PatchApplier {
    pub fn new(backup_dir: &Path) -> Self {
        Self {
            backup_dir: backup_dir.to_path_buf(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Replace the top-level function `function` in `file` with `new_body`.
    pub fn apply(&self, file: &Path, function: &str, new_body: &str) -> Result<AppliedPatch, ApplyError> {
        let original = fs::read_to_string(file).map_err(|source| ApplyError::Read {
            path: file.to_path_buf(),
            source,
        })?;

        let located = source::locate_function(&original, function).map_err(|source| ApplyError::Locate {
            path: file.to_path_buf(),
            source,
        })?;
        debug!(
            file = %file.display(),
            function,
            start = located.span.start,
            end = located.span.end,
            "located target definition"
        );

        let patched = splice(&original, located.span, new_body);
        let still_valid = source::locate_function(&patched, function).is_ok()
            && (!source::parses_cleanly(&original) || source::parses_cleanly(&patched));
        if !still_valid {
            return Err(ApplyError::InvalidResult {
                path: file.to_path_buf(),
                function: function.to_string(),
            });
        }

        let backup = self.snapshot(file, &original)?;
        write_atomic(file, &patched).map_err(|source| ApplyError::Write {
            path: file.to_path_buf(),
            source,
        })?;

        info!(
            file = %file.display(),
            function,
            backup = %backup.path.display(),
            "patch applied"
        );
        Ok(AppliedPatch {
            target: file.to_path_buf(),
            function: function.to_string(),
            sha256_before: sha256_hex(original.as_bytes()),
            sha256_after: sha256_hex(patched.as_bytes()),
            backup,
        })
    }

    /// Write `content` of `file` to a new timestamped backup. Existing backups
    /// are never overwritten.
    pub fn snapshot(&self, file: &Path, content: &str) -> Result<BackupSnapshot, ApplyError> {
        let backup_err = |path: &Path, source| ApplyError::Backup {
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(&self.backup_dir).map_err(|e| backup_err(&self.backup_dir, e))?;

        let timestamp = Local::now().naive_local();
        let (stem, ext) = stem_and_ext(file);
        let stamp = timestamp.format(TIMESTAMP_FORMAT).to_string();

        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{stem}_{stamp}{ext}")
            } else {
                format!("{stem}_{stamp}_{attempt}{ext}")
            };
            let path = self.backup_dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut out) => {
                    out.write_all(content.as_bytes())
                        .and_then(|()| out.sync_all())
                        .map_err(|e| backup_err(&path, e))?;
                    debug!(backup = %path.display(), "backup written");
                    return Ok(BackupSnapshot {
                        source: file.to_path_buf(),
                        timestamp,
                        path,
                        content: content.to_string(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(backup_err(&path, e)),
            }
        }
    }
}

/// Replace `span` of `source` with `body`, keeping everything else verbatim.
pub fn splice(source: &str, span: std::ops::Range<usize>, body: &str) -> String {
    let mut out = String::with_capacity(source.len() + body.len());
    out.push_str(&source[..span.start]);
    out.push_str(body.trim());
    out.push_str(&source[span.end..]);
    out
}

/// Write `content` to `path` via a temp file in the same directory and a
/// rename, keeping the original's permissions.
pub fn write_atomic(path: &Path, content: impl AsRef<[u8]>) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".patchwarden-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(content.as_ref())?;
    tmp.as_file().sync_all()?;

    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), meta.permissions())?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Put a backup's content back over `target`. Returns the restored digest.
pub fn restore(backup: &Path, target: &Path) -> Result<String, ApplyError> {
    let content = fs::read_to_string(backup).map_err(|source| ApplyError::Read {
        path: backup.to_path_buf(),
        source,
    })?;
    write_atomic(target, &content).map_err(|source| ApplyError::Write {
        path: target.to_path_buf(),
        source,
    })?;
    info!(backup = %backup.display(), target = %target.display(), "backup restored");
    Ok(sha256_hex(content.as_bytes()))
}

/// Backups of `target` in `backup_dir`, newest first.
pub fn list_backups(backup_dir: &Path, target: &Path) -> std::io::Result<Vec<BackupEntry>> {
    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let (stem, ext) = stem_and_ext(target);
    let prefix = format!("{stem}_");
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(rest) = name.strip_prefix(&prefix).and_then(|r| r.strip_suffix(&ext)) else {
            continue;
        };
        let Some(stamp) = rest.get(..15) else {
            continue;
        };
        if let Ok(timestamp) = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT) {
            found.push(BackupEntry {
                path: entry.path(),
                timestamp,
            });
        }
    }

    found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.path.cmp(&a.path)));
    Ok(found)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn stem_and_ext(file: &Path) -> (String, String) {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "source".to_string());
    let ext = file
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = "import requests\n\n\n@st.cache_data\ndef get_top_5_links(query):\n    return ['Error: search results container not found']\n\n\ndef extract(url):\n    return url\n";

    const FIXED: &str = "def get_top_5_links(query):\n    return sorted(set([query]))";

    fn fixture() -> (tempfile::TempDir, PathBuf, PatchApplier) {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("Streamlit_app.py");
        fs::write(&file, APP).unwrap();
        let applier = PatchApplier::new(&tmp.path().join("backups"));
        (tmp, file, applier)
    }

    #[test]
    fn apply_replaces_only_the_definition() {
        let (_tmp, file, applier) = fixture();
        let applied = applier.apply(&file, "get_top_5_links", FIXED).unwrap();

        let after = fs::read_to_string(&file).unwrap();
        assert_eq!(
            after,
            "import requests\n\n\n@st.cache_data\ndef get_top_5_links(query):\n    return sorted(set([query]))\n\n\ndef extract(url):\n    return url\n"
        );
        assert_eq!(applied.backup.content, APP);
        assert_eq!(fs::read_to_string(&applied.backup.path).unwrap(), APP);
        assert_ne!(applied.sha256_before, applied.sha256_after);
        assert_eq!(applied.sha256_after, sha256_hex(after.as_bytes()));
    }

    #[test]
    fn decorated_reply_keeps_a_single_decorator() {
        let (_tmp, file, applier) = fixture();
        let candidate = crate::synth::extract_function(
            "```python\n@st.cache_data\ndef get_top_5_links(query):\n    return sorted(set([query]))\n```",
        )
        .unwrap();
        applier.apply(&file, &candidate.name, &candidate.body).unwrap();

        let after = fs::read_to_string(&file).unwrap();
        assert_eq!(after.matches("@st.cache_data").count(), 1);
        assert!(after.contains("@st.cache_data\ndef get_top_5_links(query):\n    return sorted(set([query]))\n"));
    }

    #[test]
    fn unknown_function_leaves_file_untouched() {
        let (tmp, file, applier) = fixture();
        let err = applier.apply(&file, "not_there", FIXED).unwrap_err();
        assert!(matches!(
            err,
            ApplyError::Locate {
                source: SourceError::NotFound(_),
                ..
            }
        ));
        assert_eq!(fs::read(&file).unwrap(), APP.as_bytes());
        assert!(!tmp.path().join("backups").exists());
    }

    #[test]
    fn replacement_that_breaks_the_file_is_rejected() {
        let (_tmp, file, applier) = fixture();
        let err = applier
            .apply(&file, "extract", "def extract(url:\n    return")
            .unwrap_err();
        assert!(matches!(err, ApplyError::InvalidResult { .. }));
        assert_eq!(fs::read(&file).unwrap(), APP.as_bytes());
    }

    #[test]
    fn renamed_replacement_is_rejected() {
        let (_tmp, file, applier) = fixture();
        let err = applier
            .apply(&file, "extract", "def extract_v2(url):\n    return url")
            .unwrap_err();
        assert!(matches!(err, ApplyError::InvalidResult { .. }));
        assert_eq!(fs::read(&file).unwrap(), APP.as_bytes());
    }

    #[test]
    fn backup_apply_restore_round_trip() {
        let (_tmp, file, applier) = fixture();
        let applied = applier.apply(&file, "get_top_5_links", FIXED).unwrap();
        assert_ne!(fs::read(&file).unwrap(), APP.as_bytes());

        let digest = restore(&applied.backup.path, &file).unwrap();
        assert_eq!(fs::read(&file).unwrap(), APP.as_bytes());
        assert_eq!(digest, applied.sha256_before);
    }

    #[test]
    fn backups_are_never_overwritten() {
        let (_tmp, file, applier) = fixture();
        let first = applier.snapshot(&file, "one").unwrap();
        let second = applier.snapshot(&file, "two").unwrap();
        assert_ne!(first.path, second.path);
        assert_eq!(fs::read_to_string(&first.path).unwrap(), "one");
        assert_eq!(fs::read_to_string(&second.path).unwrap(), "two");
    }

    #[test]
    fn backup_name_carries_stem_timestamp_and_extension() {
        let (_tmp, file, applier) = fixture();
        let snapshot = applier.snapshot(&file, APP).unwrap();
        let name = snapshot.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Streamlit_app_"));
        assert!(name.ends_with(".py"));
        let stamp = &name["Streamlit_app_".len().."Streamlit_app_".len() + 15];
        assert!(NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn list_backups_newest_first_and_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        for name in [
            "Streamlit_app_20240101_090000.py",
            "Streamlit_app_20240305_120000.py",
            "Streamlit_app_20240305_120000_1.py",
            "other_20250101_000000.py",
            "Streamlit_app_notes.txt",
        ] {
            fs::write(dir.join(name), "x").unwrap();
        }

        let found = list_backups(dir, Path::new("/srv/Streamlit_app.py")).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|b| b.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "Streamlit_app_20240305_120000_1.py",
                "Streamlit_app_20240305_120000.py",
                "Streamlit_app_20240101_090000.py",
            ]
        );
    }

    #[test]
    fn list_backups_of_missing_dir_is_empty() {
        let found = list_backups(Path::new("/nonexistent/patchwarden"), Path::new("a.py")).unwrap();
        assert!(found.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("app.py");
        fs::write(&file, "old").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();

        write_atomic(&file, "new").unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "new");
        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }
}
