//! Pageviews source adapter: fetch, extract, and transform stages for one hourly dump.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use pvh_core::{CanonicalRow, ExtractedRecord, Interval, PipelineError, ResolvedInterval};
use pvh_storage::{ArtifactKind, ArtifactStore, BlobKey, BlobRef, BlobWriter, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pvh-adapters";

const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Fetch-stage output: the compressed dump as published in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawArtifactRef {
    pub interval: Interval,
    pub source_url: String,
    pub blob: BlobRef,
}

pub fn raw_key(resolved: &ResolvedInterval) -> BlobKey {
    BlobKey::new(ArtifactKind::Raw, &resolved.interval, resolved.file_name.clone())
}

/// Where hourly dumps come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Publishes the dump for `resolved` into `store`, replacing any earlier copy.
    async fn fetch(
        &self,
        resolved: &ResolvedInterval,
        store: &dyn ArtifactStore,
    ) -> Result<RawArtifactRef, PipelineError>;
}

/// Remote archive over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    http: Arc<HttpFetcher>,
}

impl HttpSnapshotSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    fn source_id(&self) -> &'static str {
        "wikimedia-http"
    }

    async fn fetch(
        &self,
        resolved: &ResolvedInterval,
        store: &dyn ArtifactStore,
    ) -> Result<RawArtifactRef, PipelineError> {
        let probe = self.http.probe(&resolved.url).await?;
        debug!(
            url = %resolved.url,
            status = probe.status,
            content_length = ?probe.content_length,
            "source probe ok"
        );
        let blob = self
            .http
            .fetch_into(&resolved.url, store, &raw_key(resolved))
            .await?;
        Ok(RawArtifactRef {
            interval: resolved.interval,
            source_url: resolved.url.clone(),
            blob,
        })
    }
}

/// Serves dumps from a local directory or from in-memory bodies keyed by file name.
#[derive(Debug, Default)]
pub struct FixtureSnapshotSource {
    root: Option<PathBuf>,
    bodies: HashMap<String, Vec<u8>>,
    transient_failures: AtomicUsize,
    fetches: AtomicUsize,
}

impl FixtureSnapshotSource {
    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, file_name: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.bodies.insert(file_name.into(), body.into());
        self
    }

    /// The next `count` fetches fail with `SourceUnavailable`.
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn body_for(&self, resolved: &ResolvedInterval) -> Result<Vec<u8>, PipelineError> {
        if let Some(body) = self.bodies.get(&resolved.file_name) {
            return Ok(body.clone());
        }
        let not_found = || PipelineError::SourceNotFound {
            url: resolved.url.clone(),
            status: 404,
        };
        let Some(root) = &self.root else {
            return Err(not_found());
        };
        let path = root.join(&resolved.file_name);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(body),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(not_found()),
            Err(err) => Err(PipelineError::SourceUnavailable {
                url: path.display().to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl SnapshotSource for FixtureSnapshotSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(
        &self,
        resolved: &ResolvedInterval,
        store: &dyn ArtifactStore,
    ) -> Result<RawArtifactRef, PipelineError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PipelineError::SourceUnavailable {
                url: resolved.url.clone(),
                reason: "injected transient failure".to_string(),
            });
        }

        let body = self.body_for(resolved).await?;
        let writer = BlobWriter::spawn(store.stage(&raw_key(resolved))?);
        writer.write(body).await;
        Ok(RawArtifactRef {
            interval: resolved.interval,
            source_url: resolved.url.clone(),
            blob: writer.finish().await?,
        })
    }
}

fn artifact_io(key: &BlobKey, err: &io::Error) -> PipelineError {
    PipelineError::ArtifactIo {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

/// Extract-stage output: decompressed, line-oriented copy of the dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedStreamRef {
    pub interval: Interval,
    pub blob: BlobRef,
    pub line_count: u64,
}

impl ExtractedStreamRef {
    /// Lazily parses the artifact. Each call starts again from the first line.
    pub fn records(
        &self,
        store: &dyn ArtifactStore,
    ) -> Result<ExtractedLines<BufReader<Box<dyn Read + Send>>>, PipelineError> {
        let reader = store.open(&self.blob.key)?;
        Ok(ExtractedLines::new(
            BufReader::with_capacity(READ_BUFFER_BYTES, reader),
            self.blob.key.to_string(),
        ))
    }
}

pub fn extracted_key(raw: &RawArtifactRef) -> BlobKey {
    let name = raw
        .blob
        .key
        .name
        .strip_suffix(".gz")
        .unwrap_or(&raw.blob.key.name);
    BlobKey::new(ArtifactKind::Extracted, &raw.interval, format!("{name}.txt"))
}

/// Decompresses the raw dump line by line into the extracted artifact.
///
/// Any decoding failure (bad header, truncated stream, checksum mismatch, invalid UTF-8)
/// is reported as `CorruptArtifact` and nothing is published.
pub fn extract(
    store: &dyn ArtifactStore,
    raw: &RawArtifactRef,
) -> Result<ExtractedStreamRef, PipelineError> {
    let raw_label = raw.blob.key.to_string();
    let corrupt = |err: io::Error| PipelineError::CorruptArtifact {
        key: raw_label.clone(),
        reason: err.to_string(),
    };

    let compressed = BufReader::with_capacity(READ_BUFFER_BYTES, store.open(&raw.blob.key)?);
    let mut lines = BufReader::with_capacity(READ_BUFFER_BYTES, MultiGzDecoder::new(compressed));

    let key = extracted_key(raw);
    let mut staged = store.stage(&key)?;
    let mut line = String::new();
    let mut line_count = 0u64;

    loop {
        line.clear();
        let read = lines.read_line(&mut line).map_err(corrupt)?;
        if read == 0 {
            break;
        }
        if !line.ends_with('\n') {
            line.push('\n');
        }
        staged
            .write_all(line.as_bytes())
            .map_err(|e| artifact_io(&key, &e))?;
        line_count += 1;
    }

    let blob = staged.commit()?;
    info!(
        raw = %raw_label,
        extracted = %blob.key,
        lines = line_count,
        bytes = blob.byte_size,
        "extraction complete"
    );
    Ok(ExtractedStreamRef {
        interval: raw.interval,
        blob,
        line_count,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedLine {
    Record(ExtractedRecord),
    /// Fewer than four fields or a non-integer view count.
    Malformed { line_no: u64 },
}

/// Parses `project page_title view_count response_size`. Fields are separated by
/// any run of ASCII whitespace; a line with fewer than four fields is malformed.
pub fn parse_line(line: &str) -> Option<ExtractedRecord> {
    let mut fields = line.split_ascii_whitespace();
    let project_code = fields.next()?;
    let page_title = fields.next()?;
    let view_count = fields.next()?.parse::<i64>().ok()?;
    let response_size = fields.next()?;
    Some(ExtractedRecord {
        project_code: project_code.to_string(),
        page_title: page_title.to_string(),
        view_count,
        response_size: response_size.to_string(),
    })
}

/// Streaming iterator over extracted lines; holds one line in memory at a time.
pub struct ExtractedLines<R> {
    reader: R,
    label: String,
    buf: String,
    line_no: u64,
}

impl<R: BufRead> ExtractedLines<R> {
    pub fn new(reader: R, label: impl Into<String>) -> Self {
        Self {
            reader,
            label: label.into(),
            buf: String::new(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for ExtractedLines<R> {
    type Item = Result<ExtractedLine, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_line(&mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                self.line_no += 1;
                Some(Ok(match parse_line(&self.buf) {
                    Some(record) => ExtractedLine::Record(record),
                    None => ExtractedLine::Malformed {
                        line_no: self.line_no,
                    },
                }))
            }
            Err(err) => Some(Err(PipelineError::ArtifactIo {
                key: self.label.clone(),
                reason: err.to_string(),
            })),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown {what} `{value}`")]
pub struct OptionParseError {
    what: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleMatch {
    /// Byte-for-byte comparison.
    #[default]
    Exact,
    /// Trimmed, with spaces folded to underscores. Still case-sensitive.
    Normalized,
}

impl TitleMatch {
    fn key(self, title: &str) -> String {
        match self {
            TitleMatch::Exact => title.to_string(),
            TitleMatch::Normalized => title.trim().replace(' ', "_"),
        }
    }
}

impl FromStr for TitleMatch {
    type Err = OptionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(TitleMatch::Exact),
            "normalized" | "normalised" => Ok(TitleMatch::Normalized),
            _ => Err(OptionParseError {
                what: "title match mode",
                value: s.to_string(),
            }),
        }
    }
}

/// What to do when several lines of one hour map to the same entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Sum,
    /// The line appearing last in the dump wins.
    KeepLast,
}

impl FromStr for DuplicatePolicy {
    type Err = OptionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(DuplicatePolicy::Sum),
            "keep_last" | "keep-last" | "last" => Ok(DuplicatePolicy::KeepLast),
            _ => Err(OptionParseError {
                what: "duplicate policy",
                value: s.to_string(),
            }),
        }
    }
}

/// Configured entity names, indexed by their match key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    mode: TitleMatch,
    entries: BTreeMap<String, String>,
}

impl AllowList {
    pub fn new<I, S>(entities: I, mode: TitleMatch) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entities
            .into_iter()
            .map(|e| e.as_ref().trim().to_string())
            .filter(|e| !e.is_empty())
            .map(|e| (mode.key(&e), e))
            .collect();
        Self { mode, entries }
    }

    /// Configured entity name matching `title`, if any.
    pub fn resolve(&self, title: &str) -> Option<&str> {
        self.entries.get(&self.mode.key(title)).map(String::as_str)
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(String::as_str)
    }

    pub fn mode(&self) -> TitleMatch {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub project_code: String,
    pub allow_list: AllowList,
    pub duplicate_policy: DuplicatePolicy,
    /// Emit a zero row for allow-listed entities absent from the hour.
    pub zero_fill: bool,
}

/// Per-run counters. Validation drops are absorbed here instead of being raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformStats {
    pub lines_read: u64,
    pub malformed: u64,
    pub empty_title: u64,
    pub negative_views: u64,
    pub other_project: u64,
    pub not_allow_listed: u64,
    pub merged_duplicates: u64,
    pub rows_emitted: u64,
}

impl TransformStats {
    pub fn validation_drops(&self) -> u64 {
        self.malformed + self.empty_title + self.negative_views
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOutput {
    pub interval: Interval,
    pub hour_timestamp: DateTime<Utc>,
    /// Sorted by entity name.
    pub rows: Vec<CanonicalRow>,
    pub stats: TransformStats,
}

/// Filters, validates, and aggregates extracted lines into one row per entity.
///
/// Output depends only on the input lines and `options`; the same input always
/// yields the same rows in the same order.
pub fn transform<I>(
    lines: I,
    options: &TransformOptions,
    interval: &Interval,
) -> Result<TransformOutput, PipelineError>
where
    I: IntoIterator<Item = Result<ExtractedLine, PipelineError>>,
{
    let mut stats = TransformStats::default();
    let mut totals: BTreeMap<&str, u64> = BTreeMap::new();

    for line in lines {
        stats.lines_read += 1;
        let record = match line? {
            ExtractedLine::Record(record) => record,
            ExtractedLine::Malformed { .. } => {
                stats.malformed += 1;
                continue;
            }
        };

        if record.page_title.trim().is_empty() {
            stats.empty_title += 1;
            continue;
        }
        let Ok(views) = u64::try_from(record.view_count) else {
            stats.negative_views += 1;
            continue;
        };
        if record.project_code != options.project_code {
            stats.other_project += 1;
            continue;
        }
        let Some(entity) = options.allow_list.resolve(&record.page_title) else {
            stats.not_allow_listed += 1;
            continue;
        };

        match totals.get_mut(entity) {
            Some(total) => {
                stats.merged_duplicates += 1;
                *total = match options.duplicate_policy {
                    DuplicatePolicy::Sum => total.saturating_add(views),
                    DuplicatePolicy::KeepLast => views,
                };
            }
            None => {
                totals.insert(entity, views);
            }
        }
    }

    if options.zero_fill {
        for entity in options.allow_list.entities() {
            totals.entry(entity).or_insert(0);
        }
    }

    let hour_timestamp = interval.partition_hour();
    let rows: Vec<CanonicalRow> = totals
        .into_iter()
        .map(|(entity_name, pageviews)| CanonicalRow {
            entity_name: entity_name.to_string(),
            pageviews,
            hour_timestamp,
        })
        .collect();
    stats.rows_emitted = rows.len() as u64;

    if stats.validation_drops() > 0 {
        warn!(
            interval = %interval,
            malformed = stats.malformed,
            empty_title = stats.empty_title,
            negative_views = stats.negative_views,
            "dropped invalid records"
        );
    }
    info!(
        interval = %interval,
        lines = stats.lines_read,
        rows = stats.rows_emitted,
        merged = stats.merged_duplicates,
        "transformation complete"
    );

    Ok(TransformOutput {
        interval: *interval,
        hour_timestamp,
        rows,
        stats,
    })
}

/// Transform-stage output as published in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformedRef {
    pub interval: Interval,
    pub blob: BlobRef,
    pub row_count: u64,
}

pub fn transformed_key(interval: &Interval) -> BlobKey {
    BlobKey::new(
        ArtifactKind::Transformed,
        interval,
        format!("pageviews_hourly_{}.json", interval.stamp()),
    )
}

/// Runs [`transform`] over an extracted artifact and publishes the result.
pub fn transform_stream(
    store: &dyn ArtifactStore,
    extracted: &ExtractedStreamRef,
    options: &TransformOptions,
) -> Result<(TransformedRef, TransformOutput), PipelineError> {
    let output = transform(extracted.records(store)?, options, &extracted.interval)?;
    let transformed = write_transformed(store, &output)?;
    Ok((transformed, output))
}

pub fn write_transformed(
    store: &dyn ArtifactStore,
    output: &TransformOutput,
) -> Result<TransformedRef, PipelineError> {
    let key = transformed_key(&output.interval);
    let mut staged = store.stage(&key)?;
    serde_json::to_writer_pretty(&mut staged, output).map_err(|e| PipelineError::ArtifactIo {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    staged
        .write_all(b"\n")
        .map_err(|e| artifact_io(&key, &e))?;
    Ok(TransformedRef {
        interval: output.interval,
        blob: staged.commit()?,
        row_count: output.rows.len() as u64,
    })
}

pub fn read_transformed(
    store: &dyn ArtifactStore,
    transformed: &TransformedRef,
) -> Result<TransformOutput, PipelineError> {
    let reader = BufReader::new(store.open(&transformed.blob.key)?);
    serde_json::from_reader(reader).map_err(|e| PipelineError::CorruptArtifact {
        key: transformed.blob.key.to_string(),
        reason: e.to_string(),
    })
}

impl fmt::Display for TransformStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lines={} rows={} merged={} dropped={} (malformed={} empty_title={} negative={})",
            self.lines_read,
            self.rows_emitted,
            self.merged_duplicates,
            self.validation_drops(),
            self.malformed,
            self.empty_title,
            self.negative_views
        )
    }
}
