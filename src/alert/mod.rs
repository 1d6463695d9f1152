//! Operator alerts.
//!
//! Every repair failure and every successful repair is reported as an
//! [`Alert`] on a four-level severity scale. Alerts are emitted as `tracing`
//! events at the mapped level and queued to a batching record processor that
//! exports them (JSON lines on disk, optionally an HTTP telemetry endpoint).
//!
//! The export pipeline is process-wide and built at most once: [`install`]
//! returns the existing pipeline on every call after the first.

mod batch;
mod exporter;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use batch::{BatchConfig, BatchProcessor};
pub use exporter::{AlertExporter, HttpExporter, JsonlExporter};

use crate::config::AlertsConfig;

/// Alert severity. Level 4 always means a human has to step in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

impl Severity {
    /// Map a numeric level onto the scale. Unknown levels are treated as
    /// warnings.
    pub fn from_level(level: u8) -> Self {
        match level {
            1 => Severity::Info,
            2 => Severity::Warning,
            3 => Severity::Error,
            4 => Severity::Critical,
            _ => Severity::Warning,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn requires_intervention(self) -> bool {
        self == Severity::Critical
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.level(), self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub message: String,
    pub severity: Severity,
}

impl Alert {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

/// Exported form of an alert.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlertRecord {
    pub timestamp: String,
    pub severity: u8,
    pub level: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl AlertRecord {
    pub fn from_alert(alert: &Alert, run_id: Option<&str>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            severity: alert.severity.level(),
            level: alert.severity.label(),
            message: alert.message.clone(),
            run_id: run_id.map(str::to_string),
        }
    }
}

/// Cheap handle for raising alerts.
///
/// Without a processor the alerter only emits `tracing` events.
#[derive(Clone, Default)]
pub struct Alerter {
    processor: Option<Arc<BatchProcessor>>,
    run_id: Option<String>,
}

impl Alerter {
    pub fn new(processor: Arc<BatchProcessor>) -> Self {
        Self {
            processor: Some(processor),
            run_id: None,
        }
    }

    /// Alerter that logs but exports nothing.
    pub fn tracing_only() -> Self {
        Self::default()
    }

    /// Tag every exported record with a run id.
    pub fn for_run(&self, run_id: &str) -> Self {
        Self {
            processor: self.processor.clone(),
            run_id: Some(run_id.to_string()),
        }
    }

    pub fn alert(&self, alert: &Alert) {
        match alert.severity {
            Severity::Info => info!(severity = 1, "{}", alert.message),
            Severity::Warning => warn!(severity = 2, "{}", alert.message),
            Severity::Error => error!(severity = 3, "{}", alert.message),
            Severity::Critical => error!(
                severity = 4,
                manual_intervention = true,
                "{}",
                alert.message
            ),
        }

        if let Some(processor) = &self.processor {
            processor.submit(AlertRecord::from_alert(alert, self.run_id.as_deref()));
        }
    }

    /// Block until every queued record has been handed to the exporters.
    pub fn flush(&self) {
        if let Some(processor) = &self.processor {
            processor.flush();
        }
    }
}

/// The process-wide export pipeline.
pub struct AlertPipeline {
    processor: Arc<BatchProcessor>,
}

impl AlertPipeline {
    pub fn build(config: &AlertsConfig, state_root: &Path, endpoint_key: Option<String>) -> Result<Self> {
        let mut exporters: Vec<Box<dyn AlertExporter>> = Vec::new();

        let log_path = state_root.join(&config.log_file);
        let jsonl = JsonlExporter::open(&log_path)
            .with_context(|| format!("failed to open alert log {}", log_path.display()))?;
        exporters.push(Box::new(jsonl));

        if let Some(endpoint) = &config.endpoint {
            exporters.push(Box::new(HttpExporter::new(
                endpoint,
                endpoint_key,
                config.request_timeout(),
            )));
        }

        let processor = BatchProcessor::spawn(
            exporters,
            BatchConfig {
                max_batch: config.batch_size.max(1),
                flush_interval: config.flush_interval(),
            },
        )?;

        Ok(Self {
            processor: Arc::new(processor),
        })
    }

    pub fn alerter(&self) -> Alerter {
        Alerter::new(Arc::clone(&self.processor))
    }

    pub fn flush(&self) {
        self.processor.flush();
    }
}

static PIPELINE: OnceLock<AlertPipeline> = OnceLock::new();

/// Install the process-wide alert pipeline, or return the one already
/// installed. Configuration passed after the first call is ignored.
pub fn install(
    config: &AlertsConfig,
    state_root: &Path,
    endpoint_key: Option<String>,
) -> Result<&'static AlertPipeline> {
    if let Some(existing) = PIPELINE.get() {
        debug!("alert pipeline already installed");
        return Ok(existing);
    }

    let pipeline = AlertPipeline::build(config, state_root, endpoint_key)?;
    Ok(PIPELINE.get_or_init(|| pipeline))
}

/// The installed pipeline, if any.
pub fn installed() -> Option<&'static AlertPipeline> {
    PIPELINE.get()
}
