//! Core domain model for PVH: hour intervals, record shapes, and the pipeline error taxonomy.

use std::fmt;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pvh-core";

pub const DEFAULT_BASE_URL: &str = "https://dumps.wikimedia.org/other/pageviews";
pub const DEFAULT_FILENAME_PREFIX: &str = "pageviews";

/// One hour of source data, identified by its end timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    pub hour_start: DateTime<Utc>,
    pub hour_end: DateTime<Utc>,
}

impl Interval {
    /// Builds the interval ending at `anchor`. The anchor must sit exactly on an hour boundary.
    pub fn ending_at(anchor: DateTime<Utc>) -> Result<Self, PipelineError> {
        if anchor.minute() != 0 || anchor.second() != 0 || anchor.nanosecond() != 0 {
            return Err(PipelineError::InvalidAnchor {
                anchor: anchor.to_rfc3339(),
                reason: "anchor is not aligned to the top of an hour".to_string(),
            });
        }
        Ok(Self {
            hour_start: anchor - Duration::hours(1),
            hour_end: anchor,
        })
    }

    /// Value written to `hour_timestamp` for every row of this interval.
    pub fn partition_hour(&self) -> DateTime<Utc> {
        self.hour_start
    }

    /// Compact stamp used to namespace artifacts, e.g. `20251210_170000`.
    pub fn stamp(&self) -> String {
        self.hour_end.format("%Y%m%d_%H%M%S").to_string()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.hour_start.format("%Y-%m-%dT%H:%MZ"),
            self.hour_end.format("%Y-%m-%dT%H:%MZ")
        )
    }
}

/// Naming template of the remote archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLayout {
    pub base_url: String,
    pub filename_prefix: String,
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            filename_prefix: DEFAULT_FILENAME_PREFIX.to_string(),
        }
    }
}

impl SourceLayout {
    pub fn file_name(&self, hour_end: DateTime<Utc>) -> String {
        format!(
            "{}-{}.gz",
            self.filename_prefix,
            hour_end.format("%Y%m%d-%H%M%S")
        )
    }

    pub fn url(&self, hour_end: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            hour_end.format("%Y"),
            hour_end.format("%Y-%m"),
            self.file_name(hour_end)
        )
    }
}

/// Interval plus the remote identifier of the dump covering it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedInterval {
    pub interval: Interval,
    pub file_name: String,
    pub url: String,
}

/// Maps a trigger anchor to its interval and remote file. Never consults the wall clock.
pub fn resolve_interval(
    anchor: DateTime<Utc>,
    layout: &SourceLayout,
) -> Result<ResolvedInterval, PipelineError> {
    let interval = Interval::ending_at(anchor)?;
    Ok(ResolvedInterval {
        interval,
        file_name: layout.file_name(interval.hour_end),
        url: layout.url(interval.hour_end),
    })
}

/// Parses an RFC 3339 anchor such as `2025-12-10T17:00:00Z`.
pub fn parse_anchor(raw: &str) -> Result<DateTime<Utc>, PipelineError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| PipelineError::InvalidAnchor {
            anchor: raw.to_string(),
            reason: err.to_string(),
        })
}

/// One decompressed source line: `project page_title view_count response_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub project_code: String,
    pub page_title: String,
    /// May be negative in damaged dumps; the transformer drops such records.
    pub view_count: i64,
    /// Unused downstream; kept verbatim.
    pub response_size: String,
}

/// Validated, aggregated row ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub entity_name: String,
    pub pageviews: u64,
    pub hour_timestamp: DateTime<Utc>,
}

/// Row as persisted in `pageviews_hourly`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub entity_name: String,
    pub pageviews: i64,
    pub hour_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolve,
    Fetch,
    Extract,
    Transform,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
        };
        f.write_str(name)
    }
}

/// State machine of a single pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Fetching,
    Extracting,
    Transforming,
    Loading,
    Succeeded { rows_loaded: u64 },
    Failed { stage: Stage, kind: ErrorKind },
}

impl RunState {
    /// Stage executed while in this state, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunState::Fetching => Some(Stage::Fetch),
            RunState::Extracting => Some(Stage::Extract),
            RunState::Transforming => Some(Stage::Transform),
            RunState::Loading => Some(Stage::Load),
            _ => None,
        }
    }

    /// Next state on success of the current stage. `Loading` and terminal states stay put;
    /// leaving `Loading` requires the loaded row count.
    pub fn advance(&self) -> RunState {
        match self {
            RunState::Pending => RunState::Fetching,
            RunState::Fetching => RunState::Extracting,
            RunState::Extracting => RunState::Transforming,
            RunState::Transforming => RunState::Loading,
            other => other.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded { .. } | RunState::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidAnchor,
    SourceUnavailable,
    SourceNotFound,
    CorruptArtifact,
    ArtifactIo,
    ConstraintViolation,
    StoreUnavailable,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidAnchor => "InvalidAnchor",
            ErrorKind::SourceUnavailable => "SourceUnavailable",
            ErrorKind::SourceNotFound => "SourceNotFound",
            ErrorKind::CorruptArtifact => "CorruptArtifact",
            ErrorKind::ArtifactIo => "ArtifactIo",
            ErrorKind::ConstraintViolation => "ConstraintViolation",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// How the external retry governor should treat a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Run again from fetch.
    Retry,
    /// Run again from fetch, but the failure is expected to persist; give up when attempts run out.
    RetryUntilExhausted,
    /// Surface immediately.
    Fatal,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid anchor {anchor}: {reason}")]
    InvalidAnchor { anchor: String, reason: String },
    #[error("source unavailable at {url}: {reason}")]
    SourceUnavailable { url: String, reason: String },
    #[error("source not found at {url} (http {status})")]
    SourceNotFound { url: String, status: u16 },
    #[error("corrupt artifact {key}: {reason}")]
    CorruptArtifact { key: String, reason: String },
    #[error("artifact io failure for {key}: {reason}")]
    ArtifactIo { key: String, reason: String },
    #[error("constraint violation on ({entity_name}, {hour_timestamp}): {detail}")]
    ConstraintViolation {
        entity_name: String,
        hour_timestamp: DateTime<Utc>,
        detail: String,
    },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("run cancelled before {stage}")]
    Cancelled { stage: Stage },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidAnchor { .. } => ErrorKind::InvalidAnchor,
            PipelineError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            PipelineError::SourceNotFound { .. } => ErrorKind::SourceNotFound,
            PipelineError::CorruptArtifact { .. } => ErrorKind::CorruptArtifact,
            PipelineError::ArtifactIo { .. } => ErrorKind::ArtifactIo,
            PipelineError::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            PipelineError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self.kind() {
            ErrorKind::SourceUnavailable
            | ErrorKind::CorruptArtifact
            | ErrorKind::ArtifactIo
            | ErrorKind::StoreUnavailable => Disposition::Retry,
            ErrorKind::SourceNotFound => Disposition::RetryUntilExhausted,
            ErrorKind::InvalidAnchor | ErrorKind::ConstraintViolation | ErrorKind::Cancelled => {
                Disposition::Fatal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap()
    }

    #[test]
    fn resolver_keeps_anchor_as_hour_end() {
        let layout = SourceLayout::default();
        for hour in [0, 1, 12, 17, 23] {
            let anchor = ts(2025, 12, 10, hour, 0, 0);
            let resolved = resolve_interval(anchor, &layout).unwrap();
            assert_eq!(resolved.interval.hour_end, anchor);
            assert_eq!(resolved.interval.hour_start, anchor - Duration::hours(1));
            assert!(resolved
                .file_name
                .contains(&format!("20251210-{hour:02}0000")));
        }
    }

    #[test]
    fn resolver_builds_wikimedia_url() {
        let layout = SourceLayout::default();
        let resolved = resolve_interval(ts(2025, 12, 10, 17, 0, 0), &layout).unwrap();
        assert_eq!(resolved.file_name, "pageviews-20251210-170000.gz");
        assert_eq!(
            resolved.url,
            "https://dumps.wikimedia.org/other/pageviews/2025/2025-12/pageviews-20251210-170000.gz"
        );
        assert_eq!(resolved.interval.partition_hour(), ts(2025, 12, 10, 16, 0, 0));
    }

    #[test]
    fn midnight_anchor_covers_previous_day() {
        let resolved = resolve_interval(ts(2026, 1, 1, 0, 0, 0), &SourceLayout::default()).unwrap();
        assert_eq!(resolved.interval.hour_start, ts(2025, 12, 31, 23, 0, 0));
        assert_eq!(resolved.file_name, "pageviews-20260101-000000.gz");
        assert!(resolved.url.contains("/2026/2026-01/"));
    }

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let layout = SourceLayout {
            base_url: "http://mirror.local/pv/".into(),
            filename_prefix: "pageviews".into(),
        };
        assert_eq!(
            layout.url(ts(2025, 3, 4, 5, 0, 0)),
            "http://mirror.local/pv/2025/2025-03/pageviews-20250304-050000.gz"
        );
    }

    #[test]
    fn unaligned_anchor_is_rejected() {
        for anchor in [ts(2025, 12, 10, 17, 30, 0), ts(2025, 12, 10, 17, 0, 1)] {
            let err = resolve_interval(anchor, &SourceLayout::default()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidAnchor);
            assert_eq!(err.disposition(), Disposition::Fatal);
        }
        let sub_second = ts(2025, 12, 10, 17, 0, 0) + Duration::milliseconds(5);
        assert!(Interval::ending_at(sub_second).is_err());
    }

    #[test]
    fn anchor_parsing_normalizes_offsets_to_utc() {
        let parsed = parse_anchor("2025-12-10T18:00:00+01:00").unwrap();
        assert_eq!(parsed, ts(2025, 12, 10, 17, 0, 0));
        assert_eq!(
            parse_anchor("yesterday").unwrap_err().kind(),
            ErrorKind::InvalidAnchor
        );
    }

    #[test]
    fn run_state_walks_stages_in_order() {
        let mut state = RunState::Pending;
        let mut stages = Vec::new();
        while state != RunState::Loading {
            state = state.advance();
            stages.extend(state.stage());
        }
        assert_eq!(
            stages,
            vec![Stage::Fetch, Stage::Extract, Stage::Transform, Stage::Load]
        );
        let done = RunState::Succeeded { rows_loaded: 2 };
        assert!(done.is_terminal());
        assert_eq!(done.advance(), done);
    }

    #[test]
    fn dispositions_follow_taxonomy() {
        let unavailable = PipelineError::SourceUnavailable {
            url: "u".into(),
            reason: "503".into(),
        };
        let not_found = PipelineError::SourceNotFound {
            url: "u".into(),
            status: 404,
        };
        let violation = PipelineError::ConstraintViolation {
            entity_name: "Apple".into(),
            hour_timestamp: ts(2025, 12, 10, 16, 0, 0),
            detail: "duplicate".into(),
        };
        assert_eq!(unavailable.disposition(), Disposition::Retry);
        assert_eq!(not_found.disposition(), Disposition::RetryUntilExhausted);
        assert_eq!(violation.disposition(), Disposition::Fatal);
        assert_eq!(
            PipelineError::StoreUnavailable("down".into()).disposition(),
            Disposition::Retry
        );
    }

    #[test]
    fn failed_state_serializes_stage_and_kind() {
        let state = RunState::Failed {
            stage: Stage::Load,
            kind: ErrorKind::StoreUnavailable,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["stage"], "load");
        assert_eq!(json["kind"], "store_unavailable");
    }
}
