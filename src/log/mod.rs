//! Structured execution log, one JSON object per line.
//!
//! Every `patchwarden run` writes a `.jsonl` file recording what happened to
//! each probe: verdicts, conversations, candidates, backups, applied patches,
//! alerts and the publish/deploy step.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub run_id: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted {
        environment: String,
        target: String,
        probes: usize,
        dry_run: bool,
    },
    ProbeVerdict {
        probe: String,
        routine: String,
        verdict: String,
        failure: Option<String>,
    },
    ConversationFinished {
        probe: String,
        purpose: String,
        conversation: String,
        outcome: String,
        polls: u32,
    },
    CandidateExtracted {
        probe: String,
        function: String,
        lines: usize,
    },
    CandidateExecuted {
        probe: String,
        function: String,
        ok: bool,
        matches_reference: Option<bool>,
    },
    BackupCreated {
        source: String,
        backup: String,
    },
    PatchApplied {
        probe: String,
        function: String,
        target: String,
        sha256_before: String,
        sha256_after: String,
    },
    Published {
        publisher: String,
        revision: Option<String>,
    },
    Deployed {
        deployer: String,
    },
    AlertRaised {
        severity: u8,
        message: String,
    },
    RunCompleted {
        probes: usize,
        patched: usize,
        alerts: usize,
        max_severity: u8,
    },
}

impl LogEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LogEvent::RunStarted { .. } => "run_started",
            LogEvent::ProbeVerdict { .. } => "probe_verdict",
            LogEvent::ConversationFinished { .. } => "conversation_finished",
            LogEvent::CandidateExtracted { .. } => "candidate_extracted",
            LogEvent::CandidateExecuted { .. } => "candidate_executed",
            LogEvent::BackupCreated { .. } => "backup_created",
            LogEvent::PatchApplied { .. } => "patch_applied",
            LogEvent::Published { .. } => "published",
            LogEvent::Deployed { .. } => "deployed",
            LogEvent::AlertRaised { .. } => "alert_raised",
            LogEvent::RunCompleted { .. } => "run_completed",
        }
    }
}

pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
    run_id: String,
}

impl ExecutionLog {
    /// Open (or create) the log at `path`, appending to existing content.
    pub fn new(path: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
            run_id: run_id.to_string(),
        })
    }

    /// `run-<timestamp>.jsonl` under `logs_dir`.
    pub fn for_run(logs_dir: &Path, run_id: &str) -> Result<Self> {
        let name = format!("run-{}.jsonl", Utc::now().format("%Y%m%d-%H%M%S"));
        Self::new(&logs_dir.join(name), run_id)
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            run_id: self.run_id.clone(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;
        debug!(event = entry.event.name(), "execution log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("execution log lock poisoned"))?;
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
