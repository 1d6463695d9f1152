//! Alert exporters.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use super::AlertRecord;

/// Destination for batches of alert records.
pub trait AlertExporter: Send {
    fn name(&self) -> &str;

    fn export(&mut self, records: &[AlertRecord]) -> Result<()>;
}

/// Appends one JSON object per alert to a local file.
pub struct JsonlExporter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl JsonlExporter {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create alert directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open alert log: {}", path.display()))?;

        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlertExporter for JsonlExporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn export(&mut self, records: &[AlertRecord]) -> Result<()> {
        for record in records {
            let json = serde_json::to_string(record).context("failed to serialize alert")?;
            writeln!(self.writer, "{json}").context("failed to write alert")?;
        }
        self.writer.flush().context("failed to flush alert log")
    }
}

/// Posts each batch as a JSON array to a telemetry ingestion endpoint.
pub struct HttpExporter {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpExporter {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            endpoint: endpoint.to_string(),
            api_key,
        }
    }
}

impl AlertExporter for HttpExporter {
    fn name(&self) -> &str {
        "http"
    }

    fn export(&mut self, records: &[AlertRecord]) -> Result<()> {
        let mut request = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }

        let body = serde_json::to_value(records).context("failed to serialize alert batch")?;
        match request.send_json(body) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, response)) => {
                let text = response.into_string().unwrap_or_default();
                bail!("telemetry endpoint returned {code}: {text}")
            }
            Err(e) => bail!("failed to reach telemetry endpoint: {e}"),
        }
    }
}
