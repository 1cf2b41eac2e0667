use super::OutputError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use std::path::PathBuf;
use std::time::Duration;

/// Persists one serialized batch under a key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn describe(&self) -> String;

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), OutputError>;
}

/// Writes objects as files below a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for DirectoryStore {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), OutputError> {
        let path = self.path_for(key);
        let store_error = |message: String| OutputError::Store {
            key: key.to_string(),
            message,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store_error(e.to_string()))?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| store_error(e.to_string()))
    }
}

/// Uploads objects with `PUT <endpoint>/<bucket>/<key>`.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, OutputError> {
        let build_error = |message: String| OutputError::Store {
            key: bucket.to_string(),
            message,
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("cloudsweep/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(token) = token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| build_error(format!("invalid store token: {e}")))?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| build_error(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
        })
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn describe(&self) -> String {
        format!("{}/{}", self.endpoint, self.bucket)
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), OutputError> {
        self.client
            .put(self.object_url(key))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map(|_| ())
            .map_err(|e| OutputError::Store {
                key: key.to_string(),
                message: e.to_string(),
            })
    }
}

impl std::fmt::Debug for HttpObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpObjectStore")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_store_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());

        store.put("scans/abc.json", b"[]".to_vec()).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("scans/abc.json")).unwrap();
        assert_eq!(written, "[]");
    }

    #[test]
    fn test_object_url() {
        let store = HttpObjectStore::new("https://storage.example/", "audits", None, Duration::from_secs(5)).unwrap();
        assert_eq!(store.object_url("/scans/a.json"), "https://storage.example/audits/scans/a.json");
        assert_eq!(store.describe(), "https://storage.example/audits");
    }
}
