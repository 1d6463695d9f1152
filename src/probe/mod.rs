//! Probes: fixed-input checks of protected routines.

mod compare;

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub use compare::{Comparison, Rule};

use crate::config::ProbeConfig;
use crate::python::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// A single check of one routine, owned by the run that created it.
#[derive(Debug, Clone)]
pub struct Probe {
    pub name: String,
    pub routine: String,
    pub input: Value,
    pub reference: Value,
    pub comparison: Comparison,
    pub actual: Option<Value>,
    /// Why the verdict is `Fail`: the comparison difference or the invocation error.
    pub failure: Option<String>,
    pub verdict: Verdict,
}

impl Probe {
    pub fn new(name: &str, routine: &str, input: Value, reference: Value) -> Self {
        Self {
            name: name.to_string(),
            routine: routine.to_string(),
            input,
            reference,
            comparison: Comparison::default(),
            actual: None,
            failure: None,
            verdict: Verdict::Unknown,
        }
    }

    pub fn with_comparison(mut self, comparison: Comparison) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(
            &config.name,
            &config.routine,
            config.argument.clone(),
            config.reference.clone(),
        )
        .with_comparison(config.compare.clone())
    }

    /// The produced value, or `null` when the routine never returned.
    pub fn actual_or_null(&self) -> Value {
        self.actual.clone().unwrap_or(Value::Null)
    }
}

/// Something that can call a protected routine by name.
pub trait RoutineHost {
    fn invoke(&self, routine: &str, argument: &Value) -> Result<Value, HarnessError>;
}

pub struct ProbeRunner<'a> {
    host: &'a dyn RoutineHost,
}

impl<'a> ProbeRunner<'a> {
    pub fn new(host: &'a dyn RoutineHost) -> Self {
        Self { host }
    }

    /// Invoke the routine with the probe's input and record the verdict.
    pub fn run(&self, probe: &mut Probe) -> Verdict {
        debug!(probe = %probe.name, routine = %probe.routine, "running probe");

        match self.host.invoke(&probe.routine, &probe.input) {
            Ok(actual) => {
                let outcome = probe.comparison.check(&actual, &probe.reference);
                probe.actual = Some(actual);
                match outcome {
                    Ok(()) => {
                        probe.failure = None;
                        probe.verdict = Verdict::Pass;
                    }
                    Err(difference) => {
                        probe.failure = Some(difference);
                        probe.verdict = Verdict::Fail;
                    }
                }
            }
            Err(e) => {
                warn!(probe = %probe.name, error = %e, "routine invocation failed");
                probe.actual = None;
                probe.failure = Some(e.to_string());
                probe.verdict = Verdict::Fail;
            }
        }

        info!(probe = %probe.name, verdict = %probe.verdict, "probe finished");
        probe.verdict
    }
}
