//! Isolated execution of generated candidates.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::patch;
use crate::python::{HarnessError, HarnessRequest, PythonRuntime};
use crate::source;
use crate::synth::PatchCandidate;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to read import prelude from {path}: {source}")]
    Prelude {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("candidate '{name}' failed: {source}")]
    Harness {
        name: String,
        #[source]
        source: HarnessError,
    },

    #[error("failed to snapshot guarded path {path}: {source}")]
    Guard {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("candidate '{name}' modified guarded files (restored): {}", display_paths(.paths))]
    Tampered { name: String, paths: Vec<PathBuf> },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Runs a candidate with one argument and hands back its result.
pub trait CandidateRunner {
    fn execute(&self, candidate: &PatchCandidate, argument: &Value) -> Result<Value, SandboxError>;
}

/// Runs candidates in a throwaway child interpreter.
///
/// The candidate is prefixed with the target module's import statements so
/// it resolves the same names it would once spliced into place.
///
/// The target file and every guarded path are snapshotted before each run.
/// Anything the candidate changed, deleted or created under them is put back
/// and the run fails with [`SandboxError::Tampered`].
pub struct SandboxExecutor {
    runtime: PythonRuntime,
    prelude_source: Option<PathBuf>,
    guarded: Vec<PathBuf>,
}

impl SandboxExecutor {
    pub fn new(runtime: PythonRuntime) -> Self {
        Self {
            runtime,
            prelude_source: None,
            guarded: Vec::new(),
        }
    }

    /// Take the import prelude from `target`; the target is also guarded.
    pub fn with_prelude_from(mut self, target: &Path) -> Self {
        self.prelude_source = Some(target.to_path_buf());
        self.guarding(target)
    }

    /// Guard a file, or a directory and everything below it.
    pub fn guarding(mut self, path: &Path) -> Self {
        if !self.guarded.iter().any(|p| p == path) {
            self.guarded.push(path.to_path_buf());
        }
        self
    }

    fn prelude(&self) -> Result<String, SandboxError> {
        let Some(path) = &self.prelude_source else {
            return Ok(String::new());
        };
        let text = std::fs::read_to_string(path).map_err(|source| SandboxError::Prelude {
            path: path.clone(),
            source,
        })?;
        // An unparseable target only loses the prelude; the candidate still runs.
        Ok(source::module_imports(&text).unwrap_or_default())
    }
}

impl CandidateRunner for SandboxExecutor {
    fn execute(&self, candidate: &PatchCandidate, argument: &Value) -> Result<Value, SandboxError> {
        let prelude = self.prelude()?;
        let program = format!("{prelude}\n{}\n", candidate.body);
        debug!(
            function = %candidate.name,
            prelude_lines = prelude.lines().count(),
            "executing candidate in sandbox"
        );

        let request = HarnessRequest::Source {
            source: program,
            function: candidate.name.clone(),
            argument: argument.clone(),
        };
        let before = Snapshot::take(&self.guarded)?;
        let result = self.runtime.call(&request, None);

        let touched = before.restore()?;
        if !touched.is_empty() {
            warn!(
                function = %candidate.name,
                paths = touched.len(),
                "candidate modified guarded files; restored"
            );
            return Err(SandboxError::Tampered {
                name: candidate.name.clone(),
                paths: touched,
            });
        }

        let value = result.map_err(|source| SandboxError::Harness {
            name: candidate.name.clone(),
            source,
        })?;
        info!(function = %candidate.name, "candidate returned");
        Ok(value)
    }
}

/// Contents of every regular file under a set of guarded roots.
struct Snapshot {
    roots: Vec<PathBuf>,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl Snapshot {
    fn take(roots: &[PathBuf]) -> Result<Self, SandboxError> {
        let mut files = BTreeMap::new();
        for root in roots {
            collect(root, &mut files).map_err(|source| SandboxError::Guard {
                path: root.clone(),
                source,
            })?;
        }
        Ok(Self {
            roots: roots.to_vec(),
            files,
        })
    }

    /// Put the snapshotted state back. Returns the paths that differed.
    fn restore(&self) -> Result<Vec<PathBuf>, SandboxError> {
        let now = Self::take(&self.roots)?.files;
        let mut touched = Vec::new();

        for (path, content) in &self.files {
            if now.get(path) == Some(content) {
                continue;
            }
            let rewrite = match path.parent() {
                Some(dir) => fs::create_dir_all(dir).and_then(|()| patch::write_atomic(path, content)),
                None => patch::write_atomic(path, content),
            };
            rewrite.map_err(|source| SandboxError::Guard {
                path: path.clone(),
                source,
            })?;
            touched.push(path.clone());
        }

        for path in now.keys().filter(|p| !self.files.contains_key(*p)) {
            fs::remove_file(path).map_err(|source| SandboxError::Guard {
                path: path.clone(),
                source,
            })?;
            touched.push(path.clone());
        }

        touched.sort();
        Ok(touched)
    }
}

fn collect(path: &Path, files: &mut BTreeMap<PathBuf, Vec<u8>>) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            collect(&entry?.path(), files)?;
        }
    } else if meta.is_file() {
        files.insert(path.to_path_buf(), fs::read(path)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::python::tests::test_runtime;
    use crate::synth::extract_function;
    use serde_json::json;

    #[test]
    fn candidate_result_comes_back() {
        let Some(runtime) = test_runtime() else {
            return;
        };
        let candidate =
            extract_function("def get_top_5_links(q):\n    return sorted([q, 'b', 'a'])\n```").unwrap();
        let value = SandboxExecutor::new(runtime)
            .execute(&candidate, &json!("c"))
            .unwrap();
        assert_eq!(value, json!(["a", "b", "c"]));
    }

    #[test]
    fn candidate_cannot_touch_the_orchestrator_directory() {
        let Some(runtime) = test_runtime() else {
            return;
        };
        let marker = std::env::current_dir().unwrap().join("patchwarden-escaped.txt");
        // Relative writes land in the scratch dir, which is removed afterwards.
        let candidate = extract_function(
            "def f(x):\n    open('patchwarden-escaped.txt', 'w').write('x')\n    import os\n    return os.getcwd()\n```",
        )
        .unwrap();

        let cwd = SandboxExecutor::new(runtime)
            .execute(&candidate, &json!(null))
            .unwrap();
        let cwd = PathBuf::from(cwd.as_str().unwrap());
        assert!(!marker.exists());
        assert!(!cwd.exists());
    }

    #[test]
    fn prelude_supplies_module_imports() {
        let Some(runtime) = test_runtime() else {
            return;
        };
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("app.py");
        std::fs::write(&target, "import json\n\n\ndef dump(x):\n    return x\n").unwrap();

        let candidate =
            extract_function("def dump(x):\n    return json.dumps(x, sort_keys=True)\n```").unwrap();
        let value = SandboxExecutor::new(runtime)
            .with_prelude_from(&target)
            .execute(&candidate, &json!({"b": 1, "a": 2}))
            .unwrap();
        assert_eq!(value, json!("{\"a\": 2, \"b\": 1}"));
    }

    #[test]
    fn crashing_candidate_is_an_error() {
        let Some(runtime) = test_runtime() else {
            return;
        };
        let candidate = extract_function("def f(x):\n    return x['missing']\n```").unwrap();
        let err = SandboxExecutor::new(runtime)
            .execute(&candidate, &json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("KeyError"));
    }

    fn python_literal(path: &Path) -> String {
        format!("{:?}", path.display().to_string())
    }

    #[test]
    fn candidate_overwriting_the_target_is_restored_and_rejected() {
        let Some(runtime) = test_runtime() else {
            return;
        };
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("app.py");
        let original = "import json\n\n\ndef get_top_5_links(q):\n    return []\n";
        std::fs::write(&target, original).unwrap();

        let reply = format!(
            "def get_top_5_links(q):\n    open({}, 'w').write('CORRUPTED')\n    return [q]\n```",
            python_literal(&target)
        );
        let candidate = extract_function(&reply).unwrap();
        let err = SandboxExecutor::new(runtime)
            .with_prelude_from(&target)
            .execute(&candidate, &json!("a"))
            .unwrap_err();

        match err {
            SandboxError::Tampered { name, paths } => {
                assert_eq!(name, "get_top_5_links");
                assert_eq!(paths, vec![target.clone()]);
            }
            other => panic!("expected tampering, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&target).unwrap(), original);
    }

    #[test]
    fn guarded_directory_changes_are_undone() {
        let Some(runtime) = test_runtime() else {
            return;
        };
        let tmp = tempfile::tempdir().unwrap();
        let backups = tmp.path().join("backups");
        std::fs::create_dir(&backups).unwrap();
        let kept = backups.join("app_20240801_120000.py");
        std::fs::write(&kept, "def f():\n    return 1\n").unwrap();
        let planted = backups.join("planted.py");

        let reply = format!(
            "def f(x):\n    import os\n    os.remove({})\n    open({}, 'w').write('x')\n    return x\n```",
            python_literal(&kept),
            python_literal(&planted)
        );
        let candidate = extract_function(&reply).unwrap();
        let err = SandboxExecutor::new(runtime)
            .guarding(&backups)
            .execute(&candidate, &json!(1))
            .unwrap_err();

        assert!(matches!(err, SandboxError::Tampered { ref paths, .. } if paths.len() == 2));
        assert_eq!(std::fs::read_to_string(&kept).unwrap(), "def f():\n    return 1\n");
        assert!(!planted.exists());
    }

    #[test]
    fn untouched_guarded_paths_let_the_result_through() {
        let Some(runtime) = test_runtime() else {
            return;
        };
        let tmp = tempfile::tempdir().unwrap();
        let backups = tmp.path().join("backups");
        std::fs::create_dir(&backups).unwrap();
        std::fs::write(backups.join("app_20240801_120000.py"), "x = 1\n").unwrap();

        let candidate = extract_function("def f(x):\n    return x * 2\n```").unwrap();
        let value = SandboxExecutor::new(runtime)
            .guarding(&backups)
            .guarding(&tmp.path().join("not-created-yet"))
            .execute(&candidate, &json!(21))
            .unwrap();
        assert_eq!(value, json!(42));
    }

    #[test]
    fn snapshot_restores_without_an_interpreter() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("nested/config.toml"), "a = 1\n").unwrap();

        let snapshot = Snapshot::take(&[dir.clone()]).unwrap();
        std::fs::write(dir.join("nested/config.toml"), "a = 2\n").unwrap();
        std::fs::write(dir.join("extra"), "").unwrap();

        let touched = snapshot.restore().unwrap();
        assert_eq!(touched, vec![dir.join("extra"), dir.join("nested/config.toml")]);
        assert_eq!(
            std::fs::read_to_string(dir.join("nested/config.toml")).unwrap(),
            "a = 1\n"
        );
        assert!(!dir.join("extra").exists());
        assert!(snapshot.restore().unwrap().is_empty());
    }

    #[test]
    fn missing_prelude_file_is_reported() {
        let runtime = PythonRuntime::from_config(&crate::config::SandboxConfig::default());
        let candidate = extract_function("def f(x):\n    return x\n```").unwrap();
        let err = SandboxExecutor::new(runtime)
            .with_prelude_from(Path::new("/nonexistent/patchwarden/app.py"))
            .execute(&candidate, &json!(1))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Prelude { .. }));
    }
}
