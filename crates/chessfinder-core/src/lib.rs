//! Core domain model for the chessfinder game mirror and board search.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "chessfinder-core";

/// Remote services a profile can be mirrored from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    ChessDotCom,
    Lichess,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::ChessDotCom => "CHESS_DOT_COM",
            Platform::Lichess => "LICHESS",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported platform {0:?}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "CHESS_DOT_COM" => Ok(Platform::ChessDotCom),
            "LICHESS" => Ok(Platform::Lichess),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

/// One registered remote profile. Written on the first successful lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub platform: Platform,
    pub remote_user_id: String,
}

/// Freshness marker of an archive-month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "at", rename_all = "snake_case")]
pub enum SyncState {
    NeverSynced,
    SyncedAt(DateTime<Utc>),
}

impl SyncState {
    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        match self {
            SyncState::NeverSynced => None,
            SyncState::SyncedAt(at) => Some(*at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchiveIdError {
    #[error("archive identifier {0:?} does not end in /YYYY/MM")]
    Shape(String),
    #[error("archive identifier {id:?} has invalid year/month {year}/{month}")]
    OutOfRange { id: String, year: i32, month: u32 },
}

/// Parse the trailing `/YYYY/MM` segments of a remote archive identifier.
pub fn parse_archive_month(archive_id: &str) -> Result<(i32, u32), ArchiveIdError> {
    let mut segments = archive_id.trim_end_matches('/').rsplit('/');
    let (Some(month), Some(year)) = (segments.next(), segments.next()) else {
        return Err(ArchiveIdError::Shape(archive_id.to_string()));
    };
    let year: i32 = year
        .parse()
        .map_err(|_| ArchiveIdError::Shape(archive_id.to_string()))?;
    let month: u32 = month
        .parse()
        .map_err(|_| ArchiveIdError::Shape(archive_id.to_string()))?;
    if month_closes_at(year, month).is_none() {
        return Err(ArchiveIdError::OutOfRange {
            id: archive_id.to_string(),
            year,
            month,
        });
    }
    Ok((year, month))
}

/// First instant (UTC) of the month following `year`/`month`.
pub fn month_closes_at(year: i32, month: u32) -> Option<DateTime<Utc>> {
    if !(1..=12).contains(&month) {
        return None;
    }
    let (next_year, next_month) = if month == 12 {
        (year.checked_add(1)?, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// One remote archive-month for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveUnit {
    pub user_id: String,
    pub archive_id: String,
    pub year: i32,
    pub month: u32,
    pub games_downloaded_count: u64,
    pub sync_state: SyncState,
}

impl ArchiveUnit {
    pub fn never_synced(
        user_id: impl Into<String>,
        archive_id: impl Into<String>,
        year: i32,
        month: u32,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            archive_id: archive_id.into(),
            year,
            month,
            games_downloaded_count: 0,
            sync_state: SyncState::NeverSynced,
        }
    }

    /// Build an unsynced unit from a remote archive identifier ending in `/YYYY/MM`.
    pub fn from_remote_id(
        user_id: impl Into<String>,
        archive_id: &str,
    ) -> Result<Self, ArchiveIdError> {
        let (year, month) = parse_archive_month(archive_id)?;
        Ok(Self::never_synced(user_id, archive_id, year, month))
    }

    pub fn closes_at(&self) -> Option<DateTime<Utc>> {
        month_closes_at(self.year, self.month)
    }

    /// Closed archives were synced on or after the first instant of the following
    /// month and can never receive new games.
    pub fn is_closed(&self) -> bool {
        match (self.sync_state, self.closes_at()) {
            (SyncState::SyncedAt(at), Some(closes_at)) => at >= closes_at,
            _ => false,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    /// Set from what the store holds for this month, never accumulated.
    pub fn record_stored_games(&mut self, stored: u64) {
        self.games_downloaded_count = stored;
    }

    pub fn record_sync(&mut self, at: DateTime<Utc>) {
        self.sync_state = SyncState::SyncedAt(at);
    }
}

/// One mirrored game. `game_id` is unique per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    pub user_id: String,
    pub archive_id: String,
    pub game_id: String,
    pub pgn: String,
    pub end_timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionEffect {
    Applied,
    /// The unit had already been reported; counters are untouched.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("download job {job_id} already done ({done} of {total}); completion refused")]
    DoneExceedsTotal { job_id: Uuid, total: u32, done: u32 },
    #[error("search job {search_id} cannot be finalized as {requested:?}")]
    NotTerminal { search_id: Uuid, requested: SearchStatus },
}

/// Fan-in aggregate for one download request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub job_id: Uuid,
    pub user_id: String,
    pub total: u32,
    pub pending: u32,
    pub done: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub reported_units: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

impl DownloadJob {
    pub fn new(
        job_id: Uuid,
        user_id: impl Into<String>,
        total: u32,
        started_at: DateTime<Utc>,
        expires_in: Duration,
    ) -> Self {
        Self {
            job_id,
            user_id: user_id.into(),
            total,
            pending: total,
            done: 0,
            succeeded: 0,
            failed: 0,
            reported_units: BTreeSet::new(),
            started_at,
            last_progress_at: started_at,
            expires_at: started_at + expires_in,
            version: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    pub fn counters_consistent(&self) -> bool {
        self.done == self.succeeded + self.failed
            && self.done <= self.total
            && self.pending == self.total - self.done
    }

    /// Next state after one unit reports in. Pure: the caller persists the result
    /// with a version check.
    pub fn apply_completion(
        &self,
        unit_key: &str,
        outcome: UnitOutcome,
        at: DateTime<Utc>,
    ) -> Result<(DownloadJob, CompletionEffect), AggregateError> {
        if self.reported_units.contains(unit_key) {
            return Ok((self.clone(), CompletionEffect::Duplicate));
        }
        if self.done >= self.total {
            return Err(AggregateError::DoneExceedsTotal {
                job_id: self.job_id,
                total: self.total,
                done: self.done,
            });
        }

        let mut next = self.clone();
        next.pending -= 1;
        next.done += 1;
        match outcome {
            UnitOutcome::Succeeded => next.succeeded += 1,
            UnitOutcome::Failed => next.failed += 1,
        }
        next.reported_units.insert(unit_key.to_string());
        next.last_progress_at = at;
        next.version += 1;
        Ok((next, CompletionEffect::Applied))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchStatus {
    InProgress,
    SearchedAll,
    SearchedPartially,
}

impl SearchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStatus::InProgress => "IN_PROGRESS",
            SearchStatus::SearchedAll => "SEARCHED_ALL",
            SearchStatus::SearchedPartially => "SEARCHED_PARTIALLY",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SearchStatus::InProgress)
    }
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown search status {0:?}")]
pub struct UnknownSearchStatus(pub String);

impl FromStr for SearchStatus {
    type Err = UnknownSearchStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(SearchStatus::InProgress),
            "SEARCHED_ALL" => Ok(SearchStatus::SearchedAll),
            "SEARCHED_PARTIALLY" => Ok(SearchStatus::SearchedPartially),
            other => Err(UnknownSearchStatus(other.to_string())),
        }
    }
}

/// Aggregate for one board scan over a user's mirrored games.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchJob {
    pub search_id: Uuid,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    pub examined_count: u64,
    pub total_count: u64,
    pub matched_game_ids: Vec<String>,
    pub status: SearchStatus,
    /// Continuation point after the last persisted page.
    pub cursor: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

impl SearchJob {
    pub fn new(
        search_id: Uuid,
        user_id: impl Into<String>,
        total_count: u64,
        started_at: DateTime<Utc>,
        expires_in: Duration,
    ) -> Self {
        Self {
            search_id,
            user_id: user_id.into(),
            started_at,
            last_progress_at: started_at,
            examined_count: 0,
            total_count,
            matched_game_ids: Vec::new(),
            status: SearchStatus::InProgress,
            cursor: None,
            expires_at: started_at + expires_in,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn with_progress(
        &self,
        examined_delta: u64,
        new_matches: &[String],
        cursor: Option<String>,
        at: DateTime<Utc>,
    ) -> SearchJob {
        let mut next = self.clone();
        next.examined_count = next.examined_count.saturating_add(examined_delta);
        for game_id in new_matches {
            if !next.matched_game_ids.contains(game_id) {
                next.matched_game_ids.push(game_id.clone());
            }
        }
        next.cursor = cursor;
        next.last_progress_at = at;
        next.version += 1;
        next
    }

    /// `Ok(None)` when the job is already terminal.
    pub fn finalized(&self, status: SearchStatus) -> Result<Option<SearchJob>, AggregateError> {
        if !status.is_terminal() {
            return Err(AggregateError::NotTerminal {
                search_id: self.search_id,
                requested: status,
            });
        }
        if self.is_terminal() {
            return Ok(None);
        }
        let mut next = self.clone();
        next.status = status;
        next.version += 1;
        Ok(Some(next))
    }
}

/// Queue payload for one archive unit of a download job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadArchiveCommand {
    pub username: String,
    pub platform: Platform,
    pub user_id: String,
    pub archive_id: String,
    pub year: i32,
    pub month: u32,
    pub download_id: Uuid,
}

/// Queue payload that triggers one board scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchBoardCommand {
    pub user_id: String,
    pub search_id: Uuid,
    pub board: String,
}
