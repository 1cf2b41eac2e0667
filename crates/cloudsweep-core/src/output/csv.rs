use super::{OutputError, OutputSink, ResultRecord};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::info;

const HEADERS: [&str; 7] = [
    "category",
    "title",
    "description",
    "resource",
    "region",
    "statusWord",
    "message",
];

/// Streams one CSV row per finding.
pub struct CsvSink {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    path: Option<PathBuf>,
    with_compliance: bool,
    header_written: bool,
}

impl CsvSink {
    /// The file is created up front so an unwritable path fails before the scan starts.
    pub fn create(path: &Path, with_compliance: bool) -> Result<Self, OutputError> {
        let file = std::fs::File::create(path).map_err(|e| OutputError::Open {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let file = tokio::fs::File::from_std(file);
        let mut sink = Self::from_writer(BufWriter::new(file), with_compliance);
        sink.path = Some(path.to_path_buf());
        Ok(sink)
    }

    pub fn from_writer(writer: impl AsyncWrite + Send + Unpin + 'static, with_compliance: bool) -> Self {
        Self {
            writer: Box::new(writer),
            path: None,
            with_compliance,
            header_written: false,
        }
    }

    async fn write_row(&mut self, fields: &[&str]) -> Result<(), OutputError> {
        let mut line = fields.iter().map(|f| quote(f)).collect::<Vec<_>>().join(",");
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(write_error)
    }

    async fn write_header(&mut self) -> Result<(), OutputError> {
        if self.header_written {
            return Ok(());
        }
        let mut headers = HEADERS.to_vec();
        if self.with_compliance {
            headers.push("compliance");
        }
        self.write_row(&headers).await?;
        self.header_written = true;
        Ok(())
    }
}

fn write_error(error: std::io::Error) -> OutputError {
    OutputError::Write {
        sink: "csv".to_string(),
        message: error.to_string(),
    }
}

#[async_trait]
impl OutputSink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn write_result(&mut self, record: &ResultRecord) -> Result<(), OutputError> {
        self.write_header().await?;

        let description = comma_safe(&record.description);
        let message = comma_safe(&record.message);
        let mut row = vec![
            record.category.as_str(),
            record.title.as_str(),
            description.as_str(),
            record.resource.as_str(),
            record.region.as_str(),
            record.status_word(),
            message.as_str(),
        ];
        if self.with_compliance {
            row.push(record.compliance.as_deref().unwrap_or(""));
        }
        self.write_row(&row).await
    }

    async fn close(&mut self, _scan_id: &str) -> Result<(), OutputError> {
        self.write_header().await?;
        self.writer.flush().await.map_err(write_error)?;
        if let Some(path) = &self.path {
            info!(path = %path.display(), "CSV file written");
        }
        Ok(())
    }
}

fn comma_safe(value: &str) -> String {
    value.replace(',', " ")
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Finding, PluginMeta};

    fn record(compliance: Option<&str>) -> ResultRecord {
        let mut meta = PluginMeta::new("openSsh", "Open SSH", "VPC Network");
        meta.description = "Determines if TCP port 22, for SSH, is open".to_string();
        let finding = Finding::fail("Firewall rule allows \"0.0.0.0/0\", on port 22")
            .with_resource("default-allow-ssh");
        ResultRecord::new(&finding, &meta, compliance.map(str::to_string))
    }

    #[tokio::test]
    async fn test_rows_with_compliance_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("findings.csv");
        let mut sink = CsvSink::create(&path, true).unwrap();

        sink.write_result(&record(Some("CIS: 3.6; PCI: 1.2"))).await.unwrap();
        sink.close("scan").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "category,title,description,resource,region,statusWord,message,compliance");
        assert_eq!(
            lines[1],
            "VPC Network,Open SSH,Determines if TCP port 22  for SSH  is open,default-allow-ssh,Global,FAIL,\"Firewall rule allows \"\"0.0.0.0/0\"\"  on port 22\",CIS: 3.6; PCI: 1.2"
        );
    }

    #[tokio::test]
    async fn test_header_only_when_nothing_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        let mut sink = CsvSink::create(&path, false).unwrap();
        sink.close("scan").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "category,title,description,resource,region,statusWord,message\n");
    }

    #[tokio::test]
    async fn test_rows_without_compliance_to_any_writer() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let mut sink = CsvSink::from_writer(writer, false);

        sink.write_result(&record(None)).await.unwrap();
        sink.close("scan").await.unwrap();
        drop(sink);

        let mut content = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut content).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("VPC Network,Open SSH,"));
        assert!(lines[1].ends_with(",FAIL,\"Firewall rule allows \"\"0.0.0.0/0\"\"  on port 22\""));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("two\nlines"), "\"two\nlines\"");
    }
}
