//! Batching record processor.
//!
//! Records are queued over a channel to a single worker thread which hands
//! them to the exporters when the batch is full, when the flush interval
//! passes, on an explicit flush, or when the processor is dropped.

use std::sync::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use super::AlertRecord;
use super::exporter::AlertExporter;

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_batch: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch: 32,
            flush_interval: Duration::from_secs(2),
        }
    }
}

enum Message {
    Record(AlertRecord),
    Flush(Sender<()>),
}

pub struct BatchProcessor {
    tx: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchProcessor {
    pub fn spawn(exporters: Vec<Box<dyn AlertExporter>>, config: BatchConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Message>();

        let worker = thread::Builder::new()
            .name("alert-export".to_string())
            .spawn(move || {
                let mut exporters = exporters;
                let mut pending: Vec<AlertRecord> = Vec::new();
                loop {
                    match rx.recv_timeout(config.flush_interval) {
                        Ok(Message::Record(record)) => {
                            pending.push(record);
                            if pending.len() >= config.max_batch {
                                export_all(&mut exporters, &mut pending);
                            }
                        }
                        Ok(Message::Flush(ack)) => {
                            export_all(&mut exporters, &mut pending);
                            let _ = ack.send(());
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            export_all(&mut exporters, &mut pending);
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            export_all(&mut exporters, &mut pending);
                            break;
                        }
                    }
                }
            })
            .context("failed to spawn alert export thread")?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn submit(&self, record: AlertRecord) {
        let guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = guard.as_ref() {
            if tx.send(Message::Record(record)).is_err() {
                warn!("alert export thread is gone; record dropped");
            }
        }
    }

    /// Export everything queued so far and wait for the exporters to finish.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        {
            let guard = match self.tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let Some(tx) = guard.as_ref() else {
                return;
            };
            if tx.send(Message::Flush(ack_tx)).is_err() {
                return;
            }
        }
        let _ = ack_rx.recv();
    }

    fn shutdown(&self) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);

        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for BatchProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn export_all(exporters: &mut [Box<dyn AlertExporter>], pending: &mut Vec<AlertRecord>) {
    if pending.is_empty() {
        return;
    }
    for exporter in exporters.iter_mut() {
        if let Err(e) = exporter.export(pending) {
            warn!(exporter = exporter.name(), error = %e, "alert export failed");
        }
    }
    pending.clear();
}
