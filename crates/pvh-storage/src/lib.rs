//! Interval-keyed artifact storage + HTTP fetch utilities for PVH.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use pvh_core::{Interval, PipelineError};
use reqwest::header::CONTENT_LENGTH;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pvh-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Raw,
    Extracted,
    Transformed,
}

impl ArtifactKind {
    fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Extracted => "extracted",
            ArtifactKind::Transformed => "transformed",
        }
    }
}

/// Opaque address of a stage artifact, namespaced by the interval's end hour.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BlobKey {
    pub kind: ArtifactKind,
    pub stamp: String,
    pub name: String,
}

impl BlobKey {
    pub fn new(kind: ArtifactKind, interval: &Interval, name: impl Into<String>) -> Self {
        Self {
            kind,
            stamp: interval.stamp(),
            name: name.into(),
        }
    }

    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.kind.dir_name())
            .join(&self.stamp)
            .join(&self.name)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.dir_name(), self.stamp, self.name)
    }
}

/// Handle to a published artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobRef {
    pub key: BlobKey,
    pub content_hash: String,
    pub byte_size: u64,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("artifact {key} not found")]
    NotFound { key: String },
    #[error("io error on artifact {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

impl BlobError {
    fn io(key: &BlobKey, source: io::Error) -> Self {
        BlobError::Io {
            key: key.to_string(),
            source,
        }
    }
}

impl From<BlobError> for PipelineError {
    fn from(err: BlobError) -> Self {
        let key = match &err {
            BlobError::NotFound { key } | BlobError::Io { key, .. } => key.clone(),
        };
        PipelineError::ArtifactIo {
            key,
            reason: err.to_string(),
        }
    }
}

/// Write side of an artifact. Nothing is visible under the key until `commit`;
/// dropping an uncommitted blob discards everything written so far.
pub trait StagedBlob: Write + Send {
    fn key(&self) -> &BlobKey;
    fn commit(self: Box<Self>) -> Result<BlobRef, BlobError>;
}

/// Storage backend for stage hand-off artifacts: atomic writes, deterministic reads by key.
pub trait ArtifactStore: Send + Sync + fmt::Debug {
    fn stage(&self, key: &BlobKey) -> Result<Box<dyn StagedBlob>, BlobError>;
    fn open(&self, key: &BlobKey) -> Result<Box<dyn Read + Send>, BlobError>;
    fn exists(&self, key: &BlobKey) -> Result<bool, BlobError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute_path(&self, key: &BlobKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

impl ArtifactStore for FsArtifactStore {
    fn stage(&self, key: &BlobKey) -> Result<Box<dyn StagedBlob>, BlobError> {
        let final_path = self.absolute_path(key);
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).map_err(|e| BlobError::io(key, e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", key.name, Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .map_err(|e| BlobError::io(key, e))?;

        Ok(Box::new(FsStagedBlob {
            key: key.clone(),
            temp_path,
            final_path,
            file: Some(BufWriter::new(file)),
            hasher: Sha256::new(),
            byte_size: 0,
            committed: false,
        }))
    }

    fn open(&self, key: &BlobKey) -> Result<Box<dyn Read + Send>, BlobError> {
        match File::open(self.absolute_path(key)) {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound {
                key: key.to_string(),
            }),
            Err(err) => Err(BlobError::io(key, err)),
        }
    }

    fn exists(&self, key: &BlobKey) -> Result<bool, BlobError> {
        self.absolute_path(key)
            .try_exists()
            .map_err(|e| BlobError::io(key, e))
    }
}

struct FsStagedBlob {
    key: BlobKey,
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<BufWriter<File>>,
    hasher: Sha256,
    byte_size: u64,
    committed: bool,
}

impl Write for FsStagedBlob {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "staged blob closed"))?;
        let written = file.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.byte_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl StagedBlob for FsStagedBlob {
    fn key(&self) -> &BlobKey {
        &self.key
    }

    fn commit(mut self: Box<Self>) -> Result<BlobRef, BlobError> {
        let key = self.key.clone();
        let writer = self.file.take().ok_or_else(|| BlobError::Io {
            key: key.to_string(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "staged blob closed"),
        })?;
        let file = writer
            .into_inner()
            .map_err(|e| BlobError::io(&key, e.into_error()))?;
        file.sync_all().map_err(|e| BlobError::io(&key, e))?;
        drop(file);

        // Replaces any artifact left by an earlier attempt in one step.
        fs::rename(&self.temp_path, &self.final_path).map_err(|e| BlobError::io(&key, e))?;
        self.committed = true;

        Ok(BlobRef {
            key,
            content_hash: hex::encode(self.hasher.clone().finalize()),
            byte_size: self.byte_size,
        })
    }
}

impl Drop for FsStagedBlob {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// In-process backend, mostly for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryArtifactStore {
    blobs: Arc<Mutex<HashMap<BlobKey, Arc<[u8]>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &BlobKey, bytes: &[u8]) -> BlobRef {
        self.lock().insert(key.clone(), Arc::from(bytes));
        BlobRef {
            key: key.clone(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len() as u64,
        }
    }

    pub fn get(&self, key: &BlobKey) -> Option<Arc<[u8]>> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BlobKey, Arc<[u8]>>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn stage(&self, key: &BlobKey) -> Result<Box<dyn StagedBlob>, BlobError> {
        Ok(Box::new(MemoryStagedBlob {
            key: key.clone(),
            buf: Vec::new(),
            store: self.clone(),
        }))
    }

    fn open(&self, key: &BlobKey) -> Result<Box<dyn Read + Send>, BlobError> {
        self.get(key)
            .map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>)
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_string(),
            })
    }

    fn exists(&self, key: &BlobKey) -> Result<bool, BlobError> {
        Ok(self.lock().contains_key(key))
    }
}

struct MemoryStagedBlob {
    key: BlobKey,
    buf: Vec<u8>,
    store: MemoryArtifactStore,
}

impl Write for MemoryStagedBlob {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StagedBlob for MemoryStagedBlob {
    fn key(&self) -> &BlobKey {
        &self.key
    }

    fn commit(self: Box<Self>) -> Result<BlobRef, BlobError> {
        Ok(self.store.put(&self.key, &self.buf))
    }
}

const WRITER_QUEUE_CHUNKS: usize = 16;

enum WriterMsg {
    Chunk(Vec<u8>),
    Finish,
}

/// Runs the writes and the commit of a staged blob on the blocking pool.
///
/// The blob is published only by [`BlobWriter::finish`]. Dropping the writer or
/// calling [`BlobWriter::abort`] discards whatever was staged.
pub struct BlobWriter {
    key: BlobKey,
    tx: Option<mpsc::Sender<WriterMsg>>,
    task: JoinHandle<Result<Option<BlobRef>, BlobError>>,
}

impl BlobWriter {
    pub fn spawn(mut staged: Box<dyn StagedBlob>) -> Self {
        let key = staged.key().clone();
        let (tx, mut rx) = mpsc::channel(WRITER_QUEUE_CHUNKS);
        let task_key = key.clone();
        let task = tokio::task::spawn_blocking(move || {
            while let Some(msg) = rx.blocking_recv() {
                match msg {
                    WriterMsg::Chunk(bytes) => staged
                        .write_all(&bytes)
                        .map_err(|e| BlobError::io(&task_key, e))?,
                    WriterMsg::Finish => return staged.commit().map(Some),
                }
            }
            Ok(None)
        });
        Self {
            key,
            tx: Some(tx),
            task,
        }
    }

    /// Queues a chunk. Returns `false` once the writer has stopped; `finish` reports why.
    pub async fn write(&self, chunk: Vec<u8>) -> bool {
        match &self.tx {
            Some(tx) => tx.send(WriterMsg::Chunk(chunk)).await.is_ok(),
            None => false,
        }
    }

    pub async fn finish(mut self) -> Result<BlobRef, BlobError> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(WriterMsg::Finish).await;
        }
        let key = self.key.clone();
        match self.join().await? {
            Some(blob) => Ok(blob),
            None => Err(BlobError::io(
                &key,
                io::Error::new(io::ErrorKind::BrokenPipe, "writer stopped before commit"),
            )),
        }
    }

    /// Discards the staged blob and waits until its temporary state is gone.
    pub async fn abort(mut self) {
        self.tx.take();
        let _ = self.join().await;
    }

    async fn join(self) -> Result<Option<BlobRef>, BlobError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(BlobError::io(&self.key, io::Error::other(err))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn is_missing_status(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::GONE
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
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
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{url} does not exist (http {status})")]
    NotFound { status: u16, url: String },
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("fetcher is shut down")]
    Closed,
}

impl FetchError {
    fn status(status: StatusCode, url: &str) -> Self {
        if is_missing_status(status) {
            FetchError::NotFound {
                status: status.as_u16(),
                url: url.to_string(),
            }
        } else {
            FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::NotFound { .. } | FetchError::Blob(_) | FetchError::Closed => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotFound { status, url } => PipelineError::SourceNotFound { url, status },
            FetchError::Request { url, source } => PipelineError::SourceUnavailable {
                url,
                reason: source.to_string(),
            },
            FetchError::HttpStatus { status, url } => PipelineError::SourceUnavailable {
                url,
                reason: format!("http status {status}"),
            },
            FetchError::Blob(blob) => blob.into(),
            FetchError::Closed => PipelineError::SourceUnavailable {
                url: String::new(),
                reason: "fetcher is shut down".to_string(),
            },
        }
    }
}

/// Result of the existence check performed before a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub status: u16,
    pub content_length: Option<u64>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        // Dumps are stored gzip-encoded; the artifact must keep the compressed bytes.
        let mut builder = reqwest::Client::builder()
            .gzip(false)
            .brotli(false)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// Lightweight `HEAD` check that the remote object exists.
    pub async fn probe(&self, url: &str) -> Result<ProbeOutcome, FetchError> {
        let span = info_span!("http_probe", url);
        self.with_retries(url, || self.probe_once(url))
            .instrument(span)
            .await
    }

    /// Streams `url` into the store under `key`. The key only becomes visible once the
    /// whole body has been written; a failed attempt leaves nothing behind.
    pub async fn fetch_into(
        &self,
        url: &str,
        store: &dyn ArtifactStore,
        key: &BlobKey,
    ) -> Result<BlobRef, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", url, key = %key);
        async {
            let blob = self
                .with_retries(url, || self.download_once(url, store, key))
                .await?;
            info!(
                bytes = blob.byte_size,
                content_hash = %blob.content_hash,
                "download complete"
            );
            Ok::<_, FetchError>(blob)
        }
        .instrument(span)
        .await
    }

    async fn with_retries<T, F, Fut>(&self, url: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(url, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn probe_once(&self, url: &str) -> Result<ProbeOutcome, FetchError> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
            let content_length = resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Ok(ProbeOutcome {
                status: status.as_u16(),
                content_length,
            });
        }
        Err(FetchError::status(status, url))
    }

    async fn download_once(
        &self,
        url: &str,
        store: &dyn ArtifactStore,
        key: &BlobKey,
    ) -> Result<BlobRef, FetchError> {
        let request_error = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };
        let mut resp = self.client.get(url).send().await.map_err(request_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::status(status, url));
        }

        let writer = BlobWriter::spawn(store.stage(key)?);
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    if !writer.write(chunk.to_vec()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(source) => {
                    writer.abort().await;
                    return Err(request_error(source));
                }
            }
        }
        Ok(writer.finish().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use pvh_core::parse_anchor;
    use tempfile::tempdir;

    fn raw_key(name: &str) -> BlobKey {
        let anchor = parse_anchor("2025-12-10T17:00:00Z").expect("anchor");
        let interval = Interval::ending_at(anchor).expect("interval");
        BlobKey::new(ArtifactKind::Raw, &interval, name)
    }

    fn fast_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("pvh-test".into()),
            global_concurrency: 2,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .expect("fetcher")
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn keys_are_namespaced_by_hour_end() {
        let key = raw_key("pageviews-20251210-170000.gz");
        assert_eq!(
            key.relative_path(),
            PathBuf::from("raw/20251210_170000/pageviews-20251210-170000.gz")
        );
        assert_eq!(key.to_string(), "raw/20251210_170000/pageviews-20251210-170000.gz");
    }

    #[test]
    fn fs_commit_publishes_and_replaces_wholesale() {
        let dir = tempdir().expect("tempdir");
        let store = FsArtifactStore::new(dir.path());
        let key = raw_key("a.gz");

        let mut first = store.stage(&key).expect("stage");
        first.write_all(b"first attempt, longer body").expect("write");
        assert!(!store.exists(&key).expect("exists"));
        let first = first.commit().expect("commit");

        let mut second = store.stage(&key).expect("stage");
        second.write_all(b"second").expect("write");
        let second = second.commit().expect("commit");

        let mut body = String::new();
        store
            .open(&key)
            .expect("open")
            .read_to_string(&mut body)
            .expect("read");
        assert_eq!(body, "second");
        assert_eq!(second.byte_size, 6);
        assert_eq!(second.content_hash, sha256_hex(b"second"));
        assert_ne!(first.content_hash, second.content_hash);
    }

    #[test]
    fn dropped_stage_leaves_no_trace() {
        let dir = tempdir().expect("tempdir");
        let store = FsArtifactStore::new(dir.path());
        let key = raw_key("b.gz");

        let mut staged = store.stage(&key).expect("stage");
        staged.write_all(b"partial").expect("write");
        drop(staged);

        assert!(!store.exists(&key).expect("exists"));
        let parent = store.absolute_path(&key).parent().expect("parent").to_path_buf();
        let leftovers = fs::read_dir(parent).expect("read_dir").count();
        assert_eq!(leftovers, 0);
        assert!(matches!(store.open(&key), Err(BlobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn blob_writer_publishes_only_on_finish() {
        let dir = tempdir().expect("tempdir");
        let store = FsArtifactStore::new(dir.path());
        let key = raw_key("writer.gz");

        let writer = BlobWriter::spawn(store.stage(&key).expect("stage"));
        assert!(writer.write(b"hello ".to_vec()).await);
        assert!(writer.write(b"world".to_vec()).await);
        assert!(!store.exists(&key).expect("exists"));
        let blob = writer.finish().await.expect("finish");

        assert_eq!(blob.byte_size, 11);
        assert_eq!(blob.content_hash, sha256_hex(b"hello world"));
        assert!(store.exists(&key).expect("exists"));
    }

    #[tokio::test]
    async fn aborted_blob_writer_leaves_no_trace() {
        let dir = tempdir().expect("tempdir");
        let store = FsArtifactStore::new(dir.path());
        let key = raw_key("aborted.gz");

        let writer = BlobWriter::spawn(store.stage(&key).expect("stage"));
        assert!(writer.write(b"partial".to_vec()).await);
        writer.abort().await;

        assert!(!store.exists(&key).expect("exists"));
        let parent = store.absolute_path(&key).parent().expect("parent").to_path_buf();
        assert_eq!(fs::read_dir(parent).expect("read_dir").count(), 0);

        let memory = MemoryArtifactStore::new();
        let writer = BlobWriter::spawn(memory.stage(&key).expect("stage"));
        assert!(writer.write(b"partial".to_vec()).await);
        drop(writer);
        assert!(memory.is_empty());
    }

    #[test]
    fn memory_store_hides_uncommitted_writes() {
        let store = MemoryArtifactStore::new();
        let key = raw_key("c.gz");
        let mut staged = store.stage(&key).expect("stage");
        staged.write_all(b"abc").expect("write");
        assert!(store.is_empty());
        let blob = staged.commit().expect("commit");
        assert_eq!(blob.content_hash, sha256_hex(b"abc"));
        assert_eq!(store.get(&key).as_deref(), Some(&b"abc"[..]));
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
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_separates_missing_from_transient() {
        assert!(is_missing_status(StatusCode::NOT_FOUND));
        assert!(is_missing_status(StatusCode::GONE));
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
        let err: PipelineError = FetchError::status(StatusCode::NOT_FOUND, "http://x").into();
        assert_eq!(err.kind(), pvh_core::ErrorKind::SourceNotFound);
        let err: PipelineError = FetchError::status(StatusCode::BAD_GATEWAY, "http://x").into();
        assert_eq!(err.kind(), pvh_core::ErrorKind::SourceUnavailable);
    }

    #[tokio::test]
    async fn probe_and_fetch_stream_body_into_store() {
        let body: &'static [u8] = b"\x1f\x8bnot-really-gzip";
        let base = serve(Router::new().route("/dump.gz", get(move || async move { body }))).await;
        let url = format!("{base}/dump.gz");
        let fetcher = fast_fetcher();
        let store = MemoryArtifactStore::new();
        let key = raw_key("dump.gz");

        let probe = fetcher.probe(&url).await.expect("probe");
        assert_eq!(probe.status, 200);

        let blob = fetcher.fetch_into(&url, &store, &key).await.expect("fetch");
        assert_eq!(blob.byte_size, body.len() as u64);
        assert_eq!(store.get(&key).as_deref(), Some(body));
    }

    #[tokio::test]
    async fn missing_object_is_not_found_without_retrying() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/missing.gz",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::NOT_FOUND
                }),
            )
            .with_state(hits.clone());
        let base = serve(router).await;

        let err = fast_fetcher()
            .probe(&format!("{base}/missing.gz"))
            .await
            .expect_err("missing");
        assert!(matches!(err, FetchError::NotFound { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/flaky.gz",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        AxumStatus::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        b"payload".as_slice().into_response()
                    }
                }),
            )
            .with_state(hits.clone());
        let base = serve(router).await;
        let store = MemoryArtifactStore::new();
        let key = raw_key("flaky.gz");

        let blob = fast_fetcher()
            .fetch_into(&format!("{base}/flaky.gz"), &store, &key)
            .await
            .expect("eventually succeeds");
        assert_eq!(blob.byte_size, 7);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_publish_nothing() {
        let base = serve(Router::new().route(
            "/down.gz",
            get(|| async { AxumStatus::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let store = MemoryArtifactStore::new();
        let key = raw_key("down.gz");

        let err = fast_fetcher()
            .fetch_into(&format!("{base}/down.gz"), &store, &key)
            .await
            .expect_err("server keeps failing");
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
        assert!(!store.exists(&key).expect("exists"));
    }

    #[tokio::test]
    async fn truncated_body_leaves_no_partial_file() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 64\r\n\r\npartial")
                    .await;
                let _ = socket.shutdown().await;
            }
        });
        let dir = tempdir().expect("tempdir");
        let store = FsArtifactStore::new(dir.path());
        let key = raw_key("truncated.gz");

        let err = fast_fetcher()
            .fetch_into(&format!("http://{addr}/truncated.gz"), &store, &key)
            .await
            .expect_err("body ends early");
        assert!(matches!(err, FetchError::Request { .. }));
        assert!(!store.exists(&key).expect("exists"));
        let parent = store.absolute_path(&key).parent().expect("parent").to_path_buf();
        assert_eq!(fs::read_dir(parent).expect("read_dir").count(), 0);
    }
}
