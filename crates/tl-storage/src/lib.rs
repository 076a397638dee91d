//! Object-store abstraction, checkpoint persistence, the read-modify-write
//! partition writer, and HTTP fetch utilities for Transferlens.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tl_core::CheckpointState;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tl-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("store io error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(key: &str, source: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }
}

/// Key/value + list/copy/delete surface the pipeline runs against. Keys are
/// `/`-separated relative paths; `list` returns them in lexicographic order.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    async fn copy(&self, src: &str, dst: &str) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Filesystem-rooted object store. Writes go through a temp file + rename so
/// a concurrent reader never observes a partially written object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(err) => Err(StoreError::io(key, err)),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StoreError::io(key, e))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        file.flush().await.map_err(|e| StoreError::io(key, e))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::io(key, err))
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::io(prefix, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(prefix, e))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(prefix, e))?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                    continue;
                }
                // in-flight temp files are not objects
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), StoreError> {
        let bytes = self.get(src).await?;
        self.put(dst, &bytes).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            // deleting an absent object is a no-op, as on any blob store
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(key, err)),
        }
    }
}

/// Durable resume position for the crawl. Absence is "start from {0,0}";
/// every other store error surfaces, because the orchestrator cannot safely
/// guess a starting point.
pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
    key: String,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub async fn load(&self) -> anyhow::Result<CheckpointState> {
        match self.store.get(&self.key).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing checkpoint {}", self.key)),
            Err(StoreError::NotFound { .. }) => Ok(CheckpointState::default()),
            Err(err) => Err(err).with_context(|| format!("loading checkpoint {}", self.key)),
        }
    }

    pub async fn save(&self, state: CheckpointState) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(&state).context("serializing checkpoint")?;
        self.store
            .put(&self.key, &bytes)
            .await
            .with_context(|| format!("saving checkpoint {}", self.key))
    }

    pub async fn reset(&self) -> anyhow::Result<()> {
        self.save(CheckpointState::default()).await
    }
}

/// Append-semantics partition writer over a store that only has Get/Put:
/// read the whole partition, keep every existing line verbatim, add one row,
/// write the whole partition back.
pub struct PartitionWriter {
    store: Arc<dyn ObjectStore>,
}

impl PartitionWriter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Returns the partition's data-row count after the append.
    pub async fn append_row(
        &self,
        key: &str,
        row: &str,
        header_if_absent: &str,
    ) -> anyhow::Result<usize> {
        let mut content = match self.store.get(key).await {
            Ok(bytes) => String::from_utf8(bytes)
                .with_context(|| format!("partition {key} is not utf-8"))?,
            Err(StoreError::NotFound { .. }) => format!("{header_if_absent}\n"),
            Err(err) => return Err(err).with_context(|| format!("reading partition {key}")),
        };
        if !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(row);
        content.push('\n');
        self.store
            .put(key, content.as_bytes())
            .await
            .with_context(|| format!("writing partition {key}"))?;
        Ok(content.lines().count().saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Short connect timeout, longer read timeout: listing pages answer fast,
/// the per-player performance pages do not.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// GET client with retry on transient failures. Each call blocks until the
/// response body is in memory; the pipeline never overlaps two fetches.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_text_inner(url).instrument(span).await
    }

    async fn fetch_text_inner(&self, url: &str) -> Result<String, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tl_core::PARTITION_HEADER;

    fn store(dir: &tempfile::TempDir) -> Arc<dyn ObjectStore> {
        Arc::new(FsObjectStore::new(dir.path()))
    }

    #[tokio::test]
    async fn put_get_round_trip_and_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = store(&dir);

        store
            .put("crawl/raw/team_0000_Test.csv", b"hello")
            .await
            .expect("put");
        let bytes = store.get("crawl/raw/team_0000_Test.csv").await.expect("get");
        assert_eq!(bytes, b"hello");

        let missing = store.get("crawl/raw/absent.csv").await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn put_overwrites_wholesale() {
        let dir = tempdir().expect("tempdir");
        let store = store(&dir);

        store.put("k", b"first").await.expect("put");
        store.put("k", b"second, longer content").await.expect("put");
        assert_eq!(store.get("k").await.expect("get"), b"second, longer content");
    }

    #[tokio::test]
    async fn list_is_lexicographic_and_prefix_scoped() {
        let dir = tempdir().expect("tempdir");
        let store = store(&dir);

        store.put("crawl/raw/team_0001_B.csv", b"b").await.expect("put");
        store.put("crawl/raw/team_0000_A.csv", b"a").await.expect("put");
        store.put("crawl/archive/team_0002_C.csv", b"c").await.expect("put");

        let keys = store.list("crawl/raw/").await.expect("list");
        assert_eq!(
            keys,
            vec!["crawl/raw/team_0000_A.csv", "crawl/raw/team_0001_B.csv"]
        );
    }

    #[tokio::test]
    async fn copy_then_delete_moves_an_object() {
        let dir = tempdir().expect("tempdir");
        let store = store(&dir);

        store.put("crawl/raw/p.csv", b"rows").await.expect("put");
        store
            .copy("crawl/raw/p.csv", "crawl/archive/p.csv")
            .await
            .expect("copy");
        store.delete("crawl/raw/p.csv").await.expect("delete");

        assert!(matches!(
            store.get("crawl/raw/p.csv").await,
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(store.get("crawl/archive/p.csv").await.expect("get"), b"rows");
    }

    #[tokio::test]
    async fn checkpoint_defaults_when_absent_and_round_trips() {
        let dir = tempdir().expect("tempdir");
        let checkpoint = CheckpointStore::new(store(&dir), "crawl/progress.json");

        assert_eq!(
            checkpoint.load().await.expect("load"),
            CheckpointState::default()
        );

        checkpoint
            .save(CheckpointState::new(2, 3))
            .await
            .expect("save");
        assert_eq!(
            checkpoint.load().await.expect("load"),
            CheckpointState::new(2, 3)
        );

        checkpoint.reset().await.expect("reset");
        assert_eq!(
            checkpoint.load().await.expect("load"),
            CheckpointState::default()
        );
    }

    #[tokio::test]
    async fn checkpoint_wire_format_matches_the_stored_progress_object() {
        let dir = tempdir().expect("tempdir");
        let store = store(&dir);
        let checkpoint = CheckpointStore::new(store.clone(), "crawl/progress.json");

        checkpoint
            .save(CheckpointState::new(4, 11))
            .await
            .expect("save");
        let raw = store.get("crawl/progress.json").await.expect("get");
        let value: serde_json::Value = serde_json::from_slice(&raw).expect("json");
        assert_eq!(value["team_idx"], 4);
        assert_eq!(value["player_idx"], 11);
    }

    #[tokio::test]
    async fn partition_append_creates_header_then_grows_by_one() {
        let dir = tempdir().expect("tempdir");
        let store = store(&dir);
        let writer = PartitionWriter::new(store.clone());

        let rows = writer
            .append_row("crawl/raw/team_0000_T.csv", "0,A,21,5,1,0,0,3,1,0,4", PARTITION_HEADER)
            .await
            .expect("append");
        assert_eq!(rows, 1);

        let rows = writer
            .append_row("crawl/raw/team_0000_T.csv", "1,B,27,12,3,0,0,9,4,2,4", PARTITION_HEADER)
            .await
            .expect("append");
        assert_eq!(rows, 2);

        let content =
            String::from_utf8(store.get("crawl/raw/team_0000_T.csv").await.expect("get"))
                .expect("utf8");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], PARTITION_HEADER);
        assert_eq!(lines[1], "0,A,21,5,1,0,0,3,1,0,4");
        assert_eq!(lines[2], "1,B,27,12,3,0,0,9,4,2,4");
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
