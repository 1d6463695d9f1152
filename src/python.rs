//! Out-of-process Python harness.
//!
//! Protected routines and generated candidates both run in a child
//! interpreter. The request goes in as a JSON file, the result comes back as a
//! single marked JSON line on stdout. The child gets a cleared environment, a
//! scratch working directory and a wall-clock limit after which it is killed.

use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::probe::RoutineHost;

const RESULT_MARKER: &str = "__PATCHWARDEN_RESULT__";

const HARNESS: &str = r#"
import json
import sys
import traceback

MARKER = "__PATCHWARDEN_RESULT__"


def emit(payload):
    sys.stdout.write("\n" + MARKER + json.dumps(payload, default=str) + "\n")
    sys.stdout.flush()


def main():
    with open(sys.argv[1], "r", encoding="utf-8") as fh:
        request = json.load(fh)
    name = request["function"]
    try:
        if request["mode"] == "module":
            sys.path.insert(0, request["root"])
            import importlib
            func = getattr(importlib.import_module(request["module"]), name, None)
        else:
            namespace = {"__name__": "__candidate__"}
            exec(compile(request["source"], "<candidate>", "exec"), namespace)
            func = namespace.get(name)
        if not callable(func):
            emit({"ok": False, "error": "%s is not defined or not callable" % name})
            return
        emit({"ok": True, "value": func(request["argument"])})
    except BaseException as exc:
        emit({
            "ok": False,
            "error": "%s: %s" % (type(exc).__name__, exc),
            "traceback": traceback.format_exc(),
        })


main()
"#;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to prepare scratch directory: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("failed to start interpreter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("interpreter did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("{error}")]
    Raised { error: String },

    #[error("interpreter produced no result (exit status {status}): {stderr}")]
    MissingResult { status: String, stderr: String },

    #[error("unreadable harness result: {0}")]
    BadResult(#[from] serde_json::Error),
}

/// What the harness should load and call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HarnessRequest {
    /// Import `module` from `root` and call `function`.
    Module {
        root: String,
        module: String,
        function: String,
        argument: Value,
    },
    /// Execute `source` in a private namespace and call `function`.
    Source {
        source: String,
        function: String,
        argument: Value,
    },
}

impl HarnessRequest {
    fn function(&self) -> &str {
        match self {
            HarnessRequest::Module { function, .. } | HarnessRequest::Source { function, .. } => {
                function
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct HarnessReply {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    traceback: Option<String>,
}

#[derive(Debug)]
struct CommandRunResult {
    status: Option<ExitStatus>,
    stdout: String,
    stderr: String,
    timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct PythonRuntime {
    interpreter: String,
    args: Vec<String>,
    wrapper: Vec<String>,
    timeout: Duration,
    pass_env: Vec<String>,
}

impl PythonRuntime {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            args: config.args.clone(),
            wrapper: config.wrapper.clone(),
            timeout: config.timeout(),
            pass_env: config.pass_env.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    /// Whether the interpreter can be started at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.interpreter)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run one harness request. `work_dir` becomes the child's working
    /// directory; `None` uses the scratch directory.
    pub fn call(&self, request: &HarnessRequest, work_dir: Option<&Path>) -> Result<Value, HarnessError> {
        let scratch = tempfile::Builder::new()
            .prefix("patchwarden-")
            .tempdir()
            .map_err(HarnessError::Scratch)?;
        let harness_path = scratch.path().join("harness.py");
        let request_path = scratch.path().join("request.json");
        std::fs::write(&harness_path, HARNESS).map_err(HarnessError::Scratch)?;
        std::fs::write(&request_path, serde_json::to_vec(request)?).map_err(HarnessError::Scratch)?;

        let mut command = self.command(&harness_path, &request_path);
        command.current_dir(work_dir.unwrap_or(scratch.path()));

        debug!(
            interpreter = %self.interpreter,
            function = request.function(),
            timeout = ?self.timeout,
            "starting python harness"
        );

        let program = command.get_program().to_string_lossy().to_string();
        let run = run_command_with_timeout(&mut command, self.timeout)
            .map_err(|source| HarnessError::Spawn { program, source })?;
        if run.timed_out {
            return Err(HarnessError::TimedOut(self.timeout));
        }

        let Some(line) = run
            .stdout
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix(RESULT_MARKER))
        else {
            return Err(HarnessError::MissingResult {
                status: run
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                stderr: tail(&run.stderr, 2000),
            });
        };

        let reply: HarnessReply = serde_json::from_str(line)?;
        if reply.ok {
            Ok(reply.value)
        } else {
            if let Some(traceback) = &reply.traceback {
                debug!(traceback = %traceback, "python raised");
            }
            Err(HarnessError::Raised {
                error: reply
                    .error
                    .unwrap_or_else(|| "unknown python error".to_string()),
            })
        }
    }

    fn command(&self, harness: &Path, request: &Path) -> Command {
        let mut command = match self.wrapper.split_first() {
            Some((program, rest)) => {
                let mut c = Command::new(program);
                c.args(rest).arg(&self.interpreter);
                c
            }
            None => Command::new(&self.interpreter),
        };
        command.args(&self.args).arg(harness).arg(request);

        command.env_clear();
        for key in &self.pass_env {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }
        command.env("PYTHONDONTWRITEBYTECODE", "1");
        command.env("PYTHONIOENCODING", "utf-8");
        command.stdin(Stdio::null());
        command
    }
}

/// Runs protected routines by importing the target module in a child
/// interpreter.
pub struct PythonRoutineHost {
    runtime: PythonRuntime,
    source_root: PathBuf,
    module: String,
}

impl PythonRoutineHost {
    pub fn new(runtime: PythonRuntime, source_root: &Path, module: &str) -> Self {
        Self {
            runtime,
            source_root: source_root.to_path_buf(),
            module: module.to_string(),
        }
    }
}

impl RoutineHost for PythonRoutineHost {
    fn invoke(&self, routine: &str, argument: &Value) -> Result<Value, HarnessError> {
        let request = HarnessRequest::Module {
            root: self.source_root.display().to_string(),
            module: self.module.clone(),
            function: routine.to_string(),
            argument: argument.clone(),
        };
        self.runtime.call(&request, Some(&self.source_root))
    }
}

fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> std::io::Result<CommandRunResult> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(out) = stdout {
            let _ = BufReader::new(out).read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(err) = stderr {
            let _ = BufReader::new(err).read_to_end(&mut buf);
        }
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    warn!(pid = child.id(), "killing interpreter after timeout");
                    let _ = child.kill();
                    break child.wait().ok();
                }
                thread::sleep(Duration::from_millis(20));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
    })
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim().to_string();
    }
    text.chars().skip(count - max_chars).collect::<String>().trim().to_string()
}
