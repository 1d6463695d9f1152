//! The repair pipeline.
//!
//! For each probe: run it; on a mismatch ask for a judgment; on a confirmed
//! failure ask for a diagnosis, extract the candidate, run it in the sandbox,
//! ask for a judgment of its output, and splice it into the target file. Once
//! every probe has been processed, publish and redeploy if anything changed.
//!
//! Failures stop the current probe's repair only. Each one is raised as an
//! alert whose severity comes from [`RepairError::severity`].

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::alert::{Alert, Alerter, Severity};
use crate::config::ProbeConfig;
use crate::conversation::{
    Clock, ConversationDriver, ConversationService, Decision, Outcome, PollPolicy,
};
use crate::error::RepairError;
use crate::log::{ExecutionLog, LogEvent};
use crate::page::{PageSource, split_page};
use crate::patch::{AppliedPatch, PatchApplier};
use crate::probe::{Probe, ProbeRunner, RoutineHost, Verdict};
use crate::prompts::{DiagnosisContext, diagnosis_messages, judgment_messages};
use crate::publish::{Deployer, Publisher};
use crate::sandbox::CandidateRunner;
use crate::source;
use crate::synth::extract_function;

/// Per-run state threaded through the pipeline.
pub struct RunContext {
    pub run_id: String,
    pub dry_run: bool,
    pub alerts: Vec<Alert>,
    pub patched: Vec<AppliedPatch>,
    alerter: Alerter,
    log: Option<ExecutionLog>,
}

impl RunContext {
    pub fn new(run_id: &str, dry_run: bool, alerter: Alerter) -> Self {
        Self {
            run_id: run_id.to_string(),
            dry_run,
            alerts: Vec::new(),
            patched: Vec::new(),
            alerter,
            log: None,
        }
    }

    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(ExecutionLog::path)
    }

    pub fn alert(&mut self, message: impl Into<String>, severity: Severity) {
        let alert = Alert::new(message, severity);
        self.alerter.alert(&alert);
        self.record(LogEvent::AlertRaised {
            severity: severity.level(),
            message: alert.message.clone(),
        });
        self.alerts.push(alert);
    }

    pub fn record(&self, event: LogEvent) {
        if let Some(log) = &self.log {
            if let Err(e) = log.log(event) {
                warn!(error = %e, "failed to write execution log");
            }
        }
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.alerts.iter().map(|a| a.severity).max()
    }

    pub fn requires_intervention(&self) -> bool {
        self.alerts.iter().any(|a| a.severity.requires_intervention())
    }

    pub fn flush_alerts(&self) {
        self.alerter.flush();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Passed,
    /// The literal check failed but the judgment accepted the output.
    Accepted,
    /// The collaborator found nothing to change.
    NoChange,
    Repaired { function: String, backup: PathBuf },
    /// Dry run: the candidate passed verification, the file was left alone.
    Validated { function: String },
    Aborted { kind: &'static str },
}

impl ProbeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Passed => "passed",
            ProbeOutcome::Accepted => "accepted",
            ProbeOutcome::NoChange => "no-change",
            ProbeOutcome::Repaired { .. } => "repaired",
            ProbeOutcome::Validated { .. } => "validated",
            ProbeOutcome::Aborted { .. } => "aborted",
        }
    }
}

/// Everything the pipeline talks to.
pub struct Collaborators<'a> {
    pub host: &'a dyn RoutineHost,
    pub conversations: &'a dyn ConversationService,
    pub clock: &'a dyn Clock,
    pub sandbox: &'a dyn CandidateRunner,
    pub pages: &'a dyn PageSource,
    pub publisher: &'a dyn Publisher,
    pub deployer: &'a dyn Deployer,
}

pub struct RepairPipeline<'a> {
    parts: Collaborators<'a>,
    target: PathBuf,
    applier: PatchApplier,
    poll: PollPolicy,
    chunk_chars: usize,
    commit_message: String,
}

impl<'a> RepairPipeline<'a> {
    pub fn new(parts: Collaborators<'a>, target: &Path, backup_dir: &Path) -> Self {
        Self {
            parts,
            target: target.to_path_buf(),
            applier: PatchApplier::new(backup_dir),
            poll: PollPolicy::default(),
            chunk_chars: 250_000,
            commit_message: "Replace failing extraction routine".to_string(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars;
        self
    }

    pub fn with_commit_message(mut self, message: &str) -> Self {
        self.commit_message = message.to_string();
        self
    }

    /// Process every probe in order, then ship whatever was patched.
    pub fn run(&self, ctx: &mut RunContext, probes: &[ProbeConfig]) -> Vec<(String, ProbeOutcome)> {
        let mut outcomes = Vec::with_capacity(probes.len());
        for config in probes {
            let outcome = self.process(ctx, config);
            info!(probe = %config.name, outcome = outcome.label(), "probe processed");
            outcomes.push((config.name.clone(), outcome));
        }

        self.ship(ctx);

        ctx.record(LogEvent::RunCompleted {
            probes: probes.len(),
            patched: ctx.patched.len(),
            alerts: ctx.alerts.len(),
            max_severity: ctx.max_severity().map(Severity::level).unwrap_or(0),
        });
        outcomes
    }

    /// Run one probe and, if it fails, the repair chain. Never panics or
    /// propagates: every failure ends as an alert.
    pub fn process(&self, ctx: &mut RunContext, config: &ProbeConfig) -> ProbeOutcome {
        let mut probe = Probe::from_config(config);
        let verdict = ProbeRunner::new(self.parts.host).run(&mut probe);
        ctx.record(LogEvent::ProbeVerdict {
            probe: probe.name.clone(),
            routine: probe.routine.clone(),
            verdict: verdict.to_string(),
            failure: probe.failure.clone(),
        });
        if verdict == Verdict::Pass {
            return ProbeOutcome::Passed;
        }

        ctx.alert(
            format!(
                "Probe '{}' failed: {}. Performing secondary judgment",
                probe.name,
                probe.failure.as_deref().unwrap_or("unknown difference")
            ),
            Severity::Warning,
        );

        match self.repair(ctx, config, &probe) {
            Ok(outcome) => outcome,
            Err(err) => {
                let severity = err.severity();
                let suffix = if severity.requires_intervention() {
                    ". Manual intervention required"
                } else {
                    ""
                };
                ctx.alert(
                    format!("Repair of '{}' stopped: {err}{suffix}", config.routine),
                    severity,
                );
                ProbeOutcome::Aborted { kind: err.kind() }
            }
        }
    }

    fn repair(&self, ctx: &mut RunContext, config: &ProbeConfig, probe: &Probe) -> Result<ProbeOutcome, RepairError> {
        let page = match &config.page_url {
            Some(url) => Some(self.parts.pages.fetch(url)?),
            None => None,
        };
        let chunks = page
            .as_deref()
            .map(|p| split_page(p, self.chunk_chars))
            .unwrap_or_default();
        let judged_page = chunks.first().map(String::as_str);

        let messages = judgment_messages(
            config.judge,
            judged_page,
            &probe.reference,
            &probe.actual_or_null(),
            &config.labels,
        );
        let judgment = self.converse(ctx, &probe.name, "judgment", &config.verification_assistant, &messages)?;
        match judgment.decision() {
            Some(Decision::Passed) => {
                ctx.alert(
                    format!("Secondary judgment accepted the output of '{}'", config.routine),
                    Severity::Info,
                );
                return Ok(ProbeOutcome::Accepted);
            }
            Some(Decision::Failed) => ctx.alert(
                format!(
                    "Failed secondary judgment for '{}'. Attempting repair",
                    config.routine
                ),
                Severity::Error,
            ),
            None => return Err(inconclusive("judgment", &judgment)),
        }

        let original = std::fs::read_to_string(&self.target).map_err(|e| {
            RepairError::ApplyFailure(format!("cannot read {}: {e}", self.target.display()))
        })?;
        let routine_source = source::function_source(&original, &config.routine)
            .map_err(|e| RepairError::ApplyFailure(format!("{}: {e}", self.target.display())))?;

        let ctx_msg = DiagnosisContext {
            routine: &config.routine,
            description: config.description.as_deref(),
            routine_source,
            actual: probe.actual.as_ref(),
            failure: probe.failure.as_deref(),
            labels: &config.labels,
        };
        let messages = diagnosis_messages(&ctx_msg, &chunks);
        let reply = self.converse(ctx, &probe.name, "diagnosis", &config.repair_assistant, &messages)?;
        let text = match reply {
            Outcome::Decision(Decision::Passed) => {
                ctx.alert(
                    format!("Collaborator found no error in '{}'", config.routine),
                    Severity::Warning,
                );
                return Ok(ProbeOutcome::NoChange);
            }
            Outcome::Text(text) => text,
            other => return Err(inconclusive("diagnosis", &other)),
        };

        let mut candidate = extract_function(&text)?;
        if candidate.name != config.routine {
            return Err(RepairError::ParseFailure(format!(
                "candidate defines '{}' instead of '{}'",
                candidate.name, config.routine
            )));
        }
        ctx.record(LogEvent::CandidateExtracted {
            probe: probe.name.clone(),
            function: candidate.name.clone(),
            lines: candidate.body.lines().count(),
        });

        let output = match self.parts.sandbox.execute(&candidate, &probe.input) {
            Ok(output) => output,
            Err(e) => {
                ctx.record(LogEvent::CandidateExecuted {
                    probe: probe.name.clone(),
                    function: candidate.name.clone(),
                    ok: false,
                    matches_reference: None,
                });
                return Err(e.into());
            }
        };
        ctx.record(LogEvent::CandidateExecuted {
            probe: probe.name.clone(),
            function: candidate.name.clone(),
            ok: true,
            matches_reference: Some(probe.comparison.matches(&output, &probe.reference)),
        });

        let messages = judgment_messages(
            config.judge,
            judged_page,
            &probe.reference,
            &output,
            &config.labels,
        );
        let verification =
            self.converse(ctx, &probe.name, "verification", &config.verification_assistant, &messages)?;
        match verification.decision() {
            Some(Decision::Passed) => candidate.mark(true),
            Some(Decision::Failed) => {
                candidate.mark(false);
                return Err(RepairError::ValidationFailure(format!(
                    "judgment rejected the output of the replacement for '{}'",
                    config.routine
                )));
            }
            None => return Err(inconclusive("verification", &verification)),
        }

        if ctx.dry_run {
            ctx.alert(
                format!(
                    "Replacement for '{}' passed verification (dry run, not applied)",
                    config.routine
                ),
                Severity::Info,
            );
            return Ok(ProbeOutcome::Validated {
                function: candidate.name,
            });
        }

        let applied = self.applier.apply(&self.target, &config.routine, &candidate.body)?;
        ctx.record(LogEvent::BackupCreated {
            source: applied.target.display().to_string(),
            backup: applied.backup.path.display().to_string(),
        });
        ctx.record(LogEvent::PatchApplied {
            probe: probe.name.clone(),
            function: applied.function.clone(),
            target: applied.target.display().to_string(),
            sha256_before: applied.sha256_before.clone(),
            sha256_after: applied.sha256_after.clone(),
        });
        ctx.alert(
            format!(
                "Replacement for '{}' passed verification and was applied",
                config.routine
            ),
            Severity::Info,
        );

        let backup = applied.backup.path.clone();
        ctx.patched.push(applied);
        Ok(ProbeOutcome::Repaired {
            function: candidate.name,
            backup,
        })
    }

    fn converse(
        &self,
        ctx: &mut RunContext,
        probe: &str,
        purpose: &str,
        participant: &str,
        messages: &[String],
    ) -> Result<Outcome, RepairError> {
        let driver = ConversationDriver::new(self.parts.conversations, self.parts.clock, self.poll);
        let report = driver.run_session_report(participant, messages)?;
        ctx.record(LogEvent::ConversationFinished {
            probe: probe.to_string(),
            purpose: purpose.to_string(),
            conversation: report.conversation.id.clone(),
            outcome: report.outcome.kind().to_string(),
            polls: report.polls,
        });
        Ok(report.outcome)
    }

    /// Publish and redeploy when at least one patch landed.
    pub fn ship(&self, ctx: &mut RunContext) {
        if ctx.patched.is_empty() || ctx.dry_run {
            return;
        }

        match self.parts.publisher.publish(&self.target, &self.commit_message) {
            Ok(revision) => ctx.record(LogEvent::Published {
                publisher: self.parts.publisher.name().to_string(),
                revision,
            }),
            Err(e) => {
                ctx.alert(
                    format!("Publishing the patched file failed: {e}. Manual intervention required"),
                    Severity::Critical,
                );
                return;
            }
        }

        match self.parts.deployer.deploy() {
            Ok(()) => ctx.record(LogEvent::Deployed {
                deployer: self.parts.deployer.name().to_string(),
            }),
            Err(e) => ctx.alert(
                format!("Redeploy failed after publishing: {e}. Manual intervention required"),
                Severity::Critical,
            ),
        }
    }
}

fn inconclusive(step: &str, outcome: &Outcome) -> RepairError {
    let detail = match outcome {
        Outcome::Text(text) => format!("free text ({} chars)", text.chars().count()),
        Outcome::Action(name) => format!("action '{name}'"),
        Outcome::Decision(d) => format!("{d:?}"),
    };
    RepairError::Inconclusive(format!("{step} returned {detail}"))
}
