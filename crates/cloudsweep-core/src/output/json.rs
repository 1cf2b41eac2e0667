use super::{ObjectStore, OutputError, OutputSink, ResultRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Serialize)]
struct BatchEntry<'a> {
    #[serde(flatten)]
    record: &'a ResultRecord,
    generated_at: DateTime<Utc>,
}

/// Buffers every record and writes them as one JSON document on close.
pub struct JsonBatchSink {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    records: Vec<ResultRecord>,
}

impl JsonBatchSink {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            records: Vec::new(),
        }
    }

    pub fn key_for(&self, scan_id: &str) -> String {
        format!("{}{}.json", self.prefix, scan_id)
    }

    pub fn buffered(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl OutputSink for JsonBatchSink {
    fn name(&self) -> &str {
        "json"
    }

    async fn write_result(&mut self, record: &ResultRecord) -> Result<(), OutputError> {
        self.records.push(record.clone());
        Ok(())
    }

    async fn close(&mut self, scan_id: &str) -> Result<(), OutputError> {
        let generated_at = Utc::now();
        let entries: Vec<BatchEntry<'_>> = self
            .records
            .iter()
            .map(|record| BatchEntry {
                record,
                generated_at,
            })
            .collect();

        let body = serde_json::to_vec_pretty(&entries).map_err(|e| OutputError::Serialize(e.to_string()))?;
        let key = self.key_for(scan_id);
        self.store.put(&key, body).await?;

        info!(
            key = %key,
            store = %self.store.describe(),
            records = self.records.len(),
            "JSON results stored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::DirectoryStore;
    use crate::plugin::{Finding, PluginMeta};
    use serde_json::Value;

    #[tokio::test]
    async fn test_batch_written_once_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonBatchSink::new(Arc::new(DirectoryStore::new(dir.path())), "scans/");

        let meta = PluginMeta::new("kmsKeyRotation", "Key Rotation", "Cryptographic Keys");
        let first = Finding::warn("rotation period is 400 days").with_resource("k1").with_region("us-east1");
        sink.write_result(&ResultRecord::new(&first, &meta, Some("CIS: 1.10".to_string())))
            .await
            .unwrap();
        sink.write_result(&ResultRecord::new(&Finding::ok("rotated"), &meta, None))
            .await
            .unwrap();

        let path = dir.path().join("scans/scan-42.json");
        assert!(!path.exists());
        assert_eq!(sink.buffered(), 2);

        sink.close("scan-42").await.unwrap();

        let batch: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let entries = batch.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["plugin"], "kmsKeyRotation");
        assert_eq!(entries[0]["status"], "WARN");
        assert_eq!(entries[0]["compliance"], "CIS: 1.10");
        assert_eq!(entries[1]["resource"], "N/A");
        assert_eq!(entries[1]["region"], "Global");
        assert!(entries[1].get("compliance").is_none());
        assert!(entries[1]["generated_at"].is_string());
    }
}
