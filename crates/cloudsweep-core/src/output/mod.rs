//! Fan-out of reported findings to output sinks.

pub mod csv;
pub mod json;
pub mod store;

pub use csv::CsvSink;
pub use json::JsonBatchSink;
pub use store::{DirectoryStore, HttpObjectStore, ObjectStore};

use crate::config::{ScanSettings, StoreSettings};
use crate::plugin::{Finding, PluginMeta, Status};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// A finding as it is handed to sinks: the plugin's metadata, the
/// resolved display defaults and the compliance label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub plugin: String,
    pub title: String,
    pub category: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recommended_action: String,
    pub resource: String,
    pub region: String,
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<String>,
}

impl ResultRecord {
    pub fn new(finding: &Finding, meta: &PluginMeta, compliance: Option<String>) -> Self {
        Self {
            plugin: meta.id.clone(),
            title: meta.title.clone(),
            category: meta.category.clone(),
            description: meta.description.clone(),
            recommended_action: meta.recommended_action.clone(),
            resource: finding.resource_or_na().to_string(),
            region: finding.region_or_global().to_string(),
            status: finding.status,
            message: finding.message.clone(),
            compliance,
        }
    }

    pub fn status_word(&self) -> &'static str {
        self.status.symbol()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutputError {
    #[error("failed to open {path}: {message}")]
    Open { path: String, message: String },

    #[error("failed to write {sink} output: {message}")]
    Write { sink: String, message: String },

    #[error("failed to serialize results: {0}")]
    Serialize(String),

    #[error("failed to store '{key}': {message}")]
    Store { key: String, message: String },
}

/// Destination for reported findings.
#[async_trait]
pub trait OutputSink: Send {
    fn name(&self) -> &str;

    async fn write_result(&mut self, record: &ResultRecord) -> Result<(), OutputError>;

    /// Finalize the sink. Called once per scan.
    async fn close(&mut self, scan_id: &str) -> Result<(), OutputError>;
}

/// Totals reported once the multiplexer is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSummary {
    /// Records accepted by at least one sink.
    pub delivered: usize,
    pub ignored_ok: usize,
    pub failures: usize,
}

/// Forwards every finding to each configured sink.
pub struct OutputMultiplexer {
    sinks: Vec<Box<dyn OutputSink>>,
    ignore_ok: bool,
    summary: OutputSummary,
}

impl Default for OutputMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputMultiplexer {
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            ignore_ok: false,
            summary: OutputSummary::default(),
        }
    }

    /// Build the CSV and JSON batch sinks named in the settings.
    pub fn from_settings(settings: &ScanSettings) -> Result<Self, OutputError> {
        let mut output = Self::new().ignore_ok(settings.ignore_ok);
        let with_compliance = !settings.compliance_filter().is_empty();

        if let Some(path) = &settings.output.csv {
            output.add_sink(Box::new(CsvSink::create(path, with_compliance)?));
        }

        if let Some(json) = &settings.output.json {
            let store: Arc<dyn ObjectStore> = match &json.store {
                StoreSettings::Directory { path } => Arc::new(DirectoryStore::new(path)),
                StoreSettings::Http {
                    endpoint,
                    bucket,
                    token_env,
                } => {
                    let token = token_env.as_deref().and_then(|var| std::env::var(var).ok());
                    Arc::new(HttpObjectStore::new(
                        endpoint,
                        bucket,
                        token.as_deref(),
                        Duration::from_secs(settings.http.timeout_secs),
                    )?)
                }
            };
            output.add_sink(Box::new(JsonBatchSink::new(store, json.prefix.clone())));
        }

        Ok(output)
    }

    pub fn ignore_ok(mut self, ignore_ok: bool) -> Self {
        self.ignore_ok = ignore_ok;
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn OutputSink>) {
        self.sinks.push(sink);
    }

    pub fn with_sink(mut self, sink: impl OutputSink + 'static) -> Self {
        self.add_sink(Box::new(sink));
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver one record to every sink. OK records are dropped here when
    /// `ignore_ok` is set; sink failures are logged and counted.
    pub async fn write_result(&mut self, record: &ResultRecord) {
        if self.ignore_ok && record.status == Status::Ok {
            self.summary.ignored_ok += 1;
            return;
        }

        let mut accepted = false;
        for sink in &mut self.sinks {
            match sink.write_result(record).await {
                Ok(()) => accepted = true,
                Err(error) => {
                    warn!(sink = sink.name(), %error, "output sink rejected result");
                    self.summary.failures += 1;
                }
            }
        }
        if accepted {
            self.summary.delivered += 1;
        }
    }

    /// Finalize every sink.
    pub async fn close(mut self, scan_id: &str) -> OutputSummary {
        for sink in &mut self.sinks {
            match sink.close(scan_id).await {
                Ok(()) => info!(sink = sink.name(), scan_id, "output finalized"),
                Err(error) => {
                    warn!(sink = sink.name(), %error, "output sink failed to close");
                    self.summary.failures += 1;
                }
            }
        }
        self.summary
    }
}

/// Keeps every record in memory behind a shared handle.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ResultRecord>>>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Scan ids this sink was closed with.
    pub fn closed_with(&self) -> Vec<String> {
        self.closed.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write_result(&mut self, record: &ResultRecord) -> Result<(), OutputError> {
        self.records
            .lock()
            .map_err(|e| OutputError::Write {
                sink: "memory".to_string(),
                message: e.to_string(),
            })?
            .push(record.clone());
        Ok(())
    }

    async fn close(&mut self, scan_id: &str) -> Result<(), OutputError> {
        if let Ok(mut closed) = self.closed.lock() {
            closed.push(scan_id.to_string());
        }
        Ok(())
    }
}
