//! Download and search job orchestration for chessfinder.
//!
//! A download request fans out one queue message per archive-month that still
//! needs syncing and each [`ArchiveUnitProcessor`] run reports back into the
//! shared [`DownloadJob`]. A search request enqueues a single message that the
//! [`BoardScanner`] turns into a paginated, resumable scan.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chessfinder_adapters::{
    BoardMatcher, ChessDotComSource, HttpBoardMatcher, PgnFilter, RemoteError, RemoteSource,
};
use chessfinder_core::{
    AggregateError, ArchiveIdError, ArchiveUnit, CompletionEffect, DownloadArchiveCommand,
    DownloadJob, GameRecord, Platform, SearchBoardCommand, SearchJob, SearchStatus, UnitOutcome,
    User,
};
use chessfinder_storage::{
    dedupe_key, Delivery, HttpClientConfig, HttpFetcher, InMemoryRecordStore, InMemoryWorkQueue,
    PgRecordStore, QueueConfig, QueueError, RecordStore, StoreError, WorkQueue,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chessfinder-sync";

/// Games written per store batch.
pub const GAME_BATCH_SIZE: usize = 25;

const AGGREGATE_UPDATE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub chess_dot_com_url: String,
    pub matcher_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub search_page_size: usize,
    pub match_quota: usize,
    pub worker_concurrency: usize,
    pub visibility_timeout_secs: u64,
    pub download_expires_in_secs: i64,
    pub search_expires_in_secs: i64,
    pub web_port: u16,
    pub pgn_filter: PgnFilter,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            chess_dot_com_url: "https://api.chess.com".to_string(),
            matcher_url: "http://localhost:8090".to_string(),
            user_agent: "chessfinder-bot/0.1".to_string(),
            http_timeout_secs: 20,
            search_page_size: 100,
            match_quota: 10,
            worker_concurrency: 8,
            visibility_timeout_secs: 60,
            download_expires_in_secs: 86_400,
            search_expires_in_secs: 86_400,
            web_port: 8000,
            pgn_filter: PgnFilter::Squeeze,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let pgn_filter = match std::env::var("CHESSFINDER_PGN_FILTER") {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                warn!(%err, "falling back to default pgn filter");
                defaults.pgn_filter
            }),
            Err(_) => defaults.pgn_filter,
        };
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            chess_dot_com_url: std::env::var("CHESS_DOT_COM_URL")
                .unwrap_or(defaults.chess_dot_com_url),
            matcher_url: std::env::var("CHESSFINDER_MATCHER_URL").unwrap_or(defaults.matcher_url),
            user_agent: std::env::var("CHESSFINDER_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("CHESSFINDER_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            search_page_size: env_or("CHESSFINDER_SEARCH_PAGE_SIZE", defaults.search_page_size)
                .max(1),
            match_quota: env_or("CHESSFINDER_MATCH_QUOTA", defaults.match_quota).max(1),
            worker_concurrency: env_or(
                "CHESSFINDER_WORKER_CONCURRENCY",
                defaults.worker_concurrency,
            )
            .max(1),
            visibility_timeout_secs: env_or(
                "CHESSFINDER_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout_secs,
            ),
            download_expires_in_secs: env_or(
                "CHESSFINDER_DOWNLOAD_EXPIRES_IN_SECS",
                defaults.download_expires_in_secs,
            ),
            search_expires_in_secs: env_or(
                "CHESSFINDER_SEARCH_EXPIRES_IN_SECS",
                defaults.search_expires_in_secs,
            ),
            web_port: env_or("CHESSFINDER_WEB_PORT", defaults.web_port),
            pgn_filter,
        }
    }
}

/// Failure surfaced by the engine, carrying a stable machine-readable code.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Profile {0} not found!")]
    ProfileNotFound(String),
    #[error("Profile {username} from {platform} is not cached!")]
    ProfileNotCached { username: String, platform: Platform },
    #[error("Profile {0} does not have any information about their played games!")]
    NoGameAvailable(String),
    #[error("Service is overloaded. Please try again later.")]
    ServiceOverloaded(String),
    #[error("Invalid board!")]
    InvalidSearchBoard,
    #[error("Download request {0} not found")]
    DownloadNotFound(Uuid),
    #[error("Search result {0} not found")]
    SearchNotFound(Uuid),
    #[error("{0}")]
    Validation(String),
    #[error("inconsistent aggregate: {0}")]
    Inconsistent(#[from] AggregateError),
    #[error("aggregate {0} kept changing underneath the update")]
    Contention(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Business,
    Validation,
    Internal,
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ProfileNotFound(_) => "PROFILE_NOT_FOUND",
            EngineError::ProfileNotCached { .. } => "PROFILE_IS_NOT_CACHED",
            EngineError::NoGameAvailable(_) => "NO_GAME_AVAILABLE",
            EngineError::ServiceOverloaded(_) => "SERVICE_OVERLOADED",
            EngineError::InvalidSearchBoard => "INVALID_SEARCH_BOARD",
            EngineError::DownloadNotFound(_) => "DOWNLOAD_NOT_FOUND",
            EngineError::SearchNotFound(_) => "SEARCH_NOT_FOUND",
            EngineError::Validation(_) => "VALIDATION_FAILED",
            EngineError::Inconsistent(_) => "INCONSISTENT_AGGREGATE",
            EngineError::Contention(_)
            | EngineError::Store(_)
            | EngineError::Queue(_)
            | EngineError::Encode(_)
            | EngineError::Internal(_) => "INTERNAL",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ProfileNotFound(_)
            | EngineError::ProfileNotCached { .. }
            | EngineError::NoGameAvailable(_)
            | EngineError::ServiceOverloaded(_)
            | EngineError::InvalidSearchBoard
            | EngineError::DownloadNotFound(_)
            | EngineError::SearchNotFound(_) => ErrorKind::Business,
            EngineError::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        }
    }
}

/// Archive units a download has to visit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Listed remotely, unknown locally.
    pub missing: Vec<ArchiveUnit>,
    /// Known locally and still open.
    pub stale: Vec<ArchiveUnit>,
}

impl SyncPlan {
    pub fn len(&self) -> usize {
        self.missing.len() + self.stale.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn units(&self) -> impl Iterator<Item = &ArchiveUnit> {
        self.missing.iter().chain(self.stale.iter())
    }
}

/// Split the remote listing into missing archives and locally known open ones.
pub fn plan_archives(
    user_id: &str,
    remote_archive_ids: &[String],
    known: &[ArchiveUnit],
) -> Result<SyncPlan, ArchiveIdError> {
    let mut seen: HashSet<&str> = known.iter().map(|a| a.archive_id.as_str()).collect();
    let mut missing = Vec::new();
    for archive_id in remote_archive_ids {
        if seen.insert(archive_id.as_str()) {
            missing.push(ArchiveUnit::from_remote_id(user_id, archive_id)?);
        }
    }
    let stale = known.iter().filter(|a| a.is_open()).cloned().collect();
    Ok(SyncPlan { missing, stale })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    Applied(DownloadJob),
    Duplicate,
    JobMissing,
}

#[derive(Clone)]
pub struct DownloadJobTracker {
    store: Arc<dyn RecordStore>,
    expires_in: chrono::Duration,
}

impl DownloadJobTracker {
    pub fn new(store: Arc<dyn RecordStore>, expires_in: chrono::Duration) -> Self {
        Self { store, expires_in }
    }

    pub async fn create(
        &self,
        job_id: Uuid,
        user_id: &str,
        total: u32,
    ) -> Result<DownloadJob, StoreError> {
        let job = DownloadJob::new(job_id, user_id, total, Utc::now(), self.expires_in);
        self.store.insert_download_job(&job).await?;
        Ok(job)
    }

    /// Record one unit's outcome exactly once.
    ///
    /// A completion that would push `done` past `total` is logged and rejected
    /// with [`EngineError::Inconsistent`] without touching the stored job.
    pub async fn mark_unit_complete(
        &self,
        job_id: Uuid,
        unit_key: &str,
        outcome: UnitOutcome,
    ) -> Result<MarkOutcome, EngineError> {
        for attempt in 0..AGGREGATE_UPDATE_ATTEMPTS {
            let Some(current) = self.store.get_download_job(job_id).await? else {
                warn!(%job_id, unit_key, "download job missing; completion dropped");
                return Ok(MarkOutcome::JobMissing);
            };
            let (next, effect) = match current.apply_completion(unit_key, outcome, Utc::now()) {
                Ok(applied) => applied,
                Err(err) => {
                    error!(
                        %job_id,
                        unit_key,
                        %err,
                        "inconsistent download job; completion rejected"
                    );
                    return Err(err.into());
                }
            };
            if effect == CompletionEffect::Duplicate {
                debug!(%job_id, unit_key, "unit already reported");
                return Ok(MarkOutcome::Duplicate);
            }
            if self.store.replace_download_job(&next, current.version).await? {
                return Ok(MarkOutcome::Applied(next));
            }
            debug!(%job_id, attempt, "download job changed concurrently; retrying");
            tokio::task::yield_now().await;
        }
        Err(EngineError::Contention(job_id))
    }
}

#[derive(Clone)]
pub struct SearchJobTracker {
    store: Arc<dyn RecordStore>,
    expires_in: chrono::Duration,
}

impl SearchJobTracker {
    pub fn new(store: Arc<dyn RecordStore>, expires_in: chrono::Duration) -> Self {
        Self { store, expires_in }
    }

    pub async fn create(
        &self,
        search_id: Uuid,
        user_id: &str,
        total: u64,
    ) -> Result<SearchJob, StoreError> {
        let job = SearchJob::new(search_id, user_id, total, Utc::now(), self.expires_in);
        self.store.insert_search_job(&job).await?;
        Ok(job)
    }

    /// Returns `None` when the job is gone or already terminal.
    pub async fn record_progress(
        &self,
        search_id: Uuid,
        examined_delta: u64,
        new_matches: &[String],
        cursor: Option<String>,
    ) -> Result<Option<SearchJob>, EngineError> {
        for attempt in 0..AGGREGATE_UPDATE_ATTEMPTS {
            let Some(current) = self.store.get_search_job(search_id).await? else {
                return Ok(None);
            };
            if current.is_terminal() {
                return Ok(None);
            }
            let next =
                current.with_progress(examined_delta, new_matches, cursor.clone(), Utc::now());
            if self.store.replace_search_job(&next, current.version).await? {
                return Ok(Some(next));
            }
            debug!(%search_id, attempt, "search job changed concurrently; retrying");
            tokio::task::yield_now().await;
        }
        Err(EngineError::Contention(search_id))
    }

    /// One-way. Finalising a terminal or missing job is a no-op returning `None`.
    pub async fn finalize(
        &self,
        search_id: Uuid,
        status: SearchStatus,
    ) -> Result<Option<SearchJob>, EngineError> {
        for attempt in 0..AGGREGATE_UPDATE_ATTEMPTS {
            let Some(current) = self.store.get_search_job(search_id).await? else {
                return Ok(None);
            };
            let Some(next) = current.finalized(status)? else {
                return Ok(None);
            };
            if self.store.replace_search_job(&next, current.version).await? {
                return Ok(Some(next));
            }
            debug!(%search_id, attempt, "search job changed concurrently; retrying");
            tokio::task::yield_now().await;
        }
        Err(EngineError::Contention(search_id))
    }
}

#[derive(Debug, Error)]
enum UnitError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{count} games still unwritten after {attempts} attempts")]
    Unwritten { count: usize, attempts: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub outcome: UnitOutcome,
    pub new_games: u64,
    pub fetched: bool,
    pub mark: Option<MarkOutcome>,
}

/// Syncs one archive-month and reports the result into its download job.
#[derive(Clone)]
pub struct ArchiveUnitProcessor {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteSource>,
    tracker: DownloadJobTracker,
    pgn_filter: PgnFilter,
    write_attempts: usize,
    write_retry_pause: Duration,
}

impl ArchiveUnitProcessor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteSource>,
        tracker: DownloadJobTracker,
        pgn_filter: PgnFilter,
    ) -> Self {
        Self {
            store,
            remote,
            tracker,
            pgn_filter,
            write_attempts: 3,
            write_retry_pause: Duration::from_millis(100),
        }
    }

    pub fn with_write_retry(mut self, attempts: usize, pause: Duration) -> Self {
        self.write_attempts = attempts.max(1);
        self.write_retry_pause = pause;
        self
    }

    /// `Err` only when the store is unreachable before any work was recorded,
    /// so the delivery can be retried.
    pub async fn process(&self, cmd: &DownloadArchiveCommand) -> Result<UnitReport, EngineError> {
        let span = info_span!(
            "archive_unit",
            job_id = %cmd.download_id,
            user_id = %cmd.user_id,
            archive_id = %cmd.archive_id
        );
        async {
            let (outcome, new_games, fetched) =
                match self.store.get_archive(&cmd.user_id, &cmd.archive_id).await? {
                    None => {
                        info!("archive record absent; nothing to sync");
                        (UnitOutcome::Succeeded, 0, false)
                    }
                    Some(archive) if archive.is_closed() => {
                        debug!("archive closed; skipping fetch");
                        (UnitOutcome::Succeeded, 0, false)
                    }
                    Some(archive) => match self.sync_archive(cmd, archive).await {
                        Ok(new_games) => (UnitOutcome::Succeeded, new_games, true),
                        Err(err) => {
                            warn!(%err, "archive sync failed");
                            (UnitOutcome::Failed, 0, true)
                        }
                    },
                };

            let mark = match self
                .tracker
                .mark_unit_complete(cmd.download_id, &cmd.archive_id, outcome)
                .await
            {
                Ok(mark) => Some(mark),
                Err(EngineError::Inconsistent(_)) => None,
                Err(err) => return Err(err),
            };
            info!(?outcome, new_games, "archive unit handled");
            Ok(UnitReport {
                outcome,
                new_games,
                fetched,
                mark,
            })
        }
        .instrument(span)
        .await
    }

    async fn sync_archive(
        &self,
        cmd: &DownloadArchiveCommand,
        mut archive: ArchiveUnit,
    ) -> Result<u64, UnitError> {
        let remote_games = self
            .remote
            .list_games(&cmd.username, archive.year, archive.month)
            .await?;

        if remote_games.is_empty() {
            archive.record_sync(Utc::now());
            self.store.put_archive(&archive).await?;
            return Ok(0);
        }

        let stored = self
            .store
            .archive_game_ids(&archive.user_id, &archive.archive_id)
            .await?;
        let fresh: Vec<GameRecord> = remote_games
            .into_iter()
            .filter(|g| !stored.contains(&g.game_id))
            .map(|g| GameRecord {
                user_id: archive.user_id.clone(),
                archive_id: archive.archive_id.clone(),
                game_id: g.game_id,
                pgn: self.pgn_filter.apply(&g.pgn),
                end_timestamp: g.end_timestamp,
            })
            .collect();

        let (written, result) = self.write_games(&fresh).await;
        archive.record_stored_games(stored.len() as u64 + written);
        if let Err(err) = result {
            // Sync stamp untouched: the month stays open and the gap is refetched.
            if let Err(store_err) = self.store.put_archive(&archive).await {
                warn!(%store_err, "could not record partially written archive");
            }
            return Err(err);
        }
        archive.record_sync(Utc::now());
        self.store.put_archive(&archive).await?;
        Ok(written)
    }

    /// Returns how many games were written, stopping at the first batch that
    /// stays unwritten after every attempt.
    async fn write_games(&self, games: &[GameRecord]) -> (u64, Result<(), UnitError>) {
        let mut written = 0u64;
        for batch in games.chunks(GAME_BATCH_SIZE) {
            let mut pending = batch.to_vec();
            let mut attempt = 1;
            loop {
                let failed = match self.store.batch_put_games(&pending).await {
                    Ok(failed) => failed,
                    Err(err) => return (written, Err(err.into())),
                };
                written += pending.len().saturating_sub(failed.len()) as u64;
                if failed.is_empty() {
                    break;
                }
                pending = failed
                    .iter()
                    .filter_map(|idx| pending.get(*idx).cloned())
                    .collect();
                if attempt >= self.write_attempts {
                    let err = UnitError::Unwritten {
                        count: pending.len(),
                        attempts: attempt,
                    };
                    return (written, Err(err));
                }
                warn!(unwritten = pending.len(), attempt, "retrying unprocessed games");
                tokio::time::sleep(self.write_retry_pause).await;
                attempt += 1;
            }
        }
        (written, Ok(()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanReport {
    /// The job was missing or already terminal.
    Skipped,
    Finished(SearchJob),
}

/// Pages through a user's games, matching each against the board.
#[derive(Clone)]
pub struct BoardScanner {
    store: Arc<dyn RecordStore>,
    matcher: Arc<dyn BoardMatcher>,
    tracker: SearchJobTracker,
    page_size: usize,
    match_quota: usize,
}

impl BoardScanner {
    pub fn new(
        store: Arc<dyn RecordStore>,
        matcher: Arc<dyn BoardMatcher>,
        tracker: SearchJobTracker,
        page_size: usize,
        match_quota: usize,
    ) -> Self {
        Self {
            store,
            matcher,
            tracker,
            page_size: page_size.max(1),
            match_quota: match_quota.max(1),
        }
    }

    pub async fn scan(&self, cmd: &SearchBoardCommand) -> Result<ScanReport, EngineError> {
        let span = info_span!("board_scan", search_id = %cmd.search_id, user_id = %cmd.user_id);
        async {
            let Some(mut job) = self.store.get_search_job(cmd.search_id).await? else {
                info!("search job absent; nothing to scan");
                return Ok(ScanReport::Skipped);
            };
            if job.is_terminal() {
                info!(status = %job.status, "search already finished");
                return Ok(ScanReport::Skipped);
            }

            loop {
                if job.matched_game_ids.len() >= self.match_quota {
                    return self.finish(cmd.search_id, SearchStatus::SearchedPartially).await;
                }

                let page = self
                    .store
                    .query_games(&cmd.user_id, job.cursor.as_deref(), self.page_size)
                    .await?;
                let wanted = self.match_quota - job.matched_game_ids.len();

                let mut examined = 0u64;
                let mut last_examined = None;
                let mut matches = Vec::new();
                let mut matcher_failed = false;
                for game in &page.games {
                    match self.matcher.matches(&cmd.board, &game.pgn).await {
                        Ok(matched) => {
                            examined += 1;
                            last_examined = Some(game.game_id.clone());
                            if matched {
                                matches.push(game.game_id.clone());
                                if matches.len() >= wanted {
                                    break;
                                }
                            }
                        }
                        Err(err) => {
                            warn!(
                                game_id = %game.game_id,
                                %err,
                                "matcher failed; keeping partial result"
                            );
                            matcher_failed = true;
                            break;
                        }
                    }
                }

                let cursor = last_examined.or_else(|| job.cursor.clone());
                let Some(progressed) = self
                    .tracker
                    .record_progress(cmd.search_id, examined, &matches, cursor)
                    .await?
                else {
                    info!("search job finished elsewhere; stopping");
                    return Ok(ScanReport::Skipped);
                };
                job = progressed;
                debug!(
                    examined = job.examined_count,
                    matched = job.matched_game_ids.len(),
                    "page scanned"
                );

                if matcher_failed || job.matched_game_ids.len() >= self.match_quota {
                    return self.finish(cmd.search_id, SearchStatus::SearchedPartially).await;
                }
                if page.next_cursor.is_none() {
                    return self.finish(cmd.search_id, SearchStatus::SearchedAll).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn finish(
        &self,
        search_id: Uuid,
        status: SearchStatus,
    ) -> Result<ScanReport, EngineError> {
        match self.tracker.finalize(search_id, status).await? {
            Some(job) => {
                info!(
                    %status,
                    examined = job.examined_count,
                    matched = job.matched_game_ids.len(),
                    "search finished"
                );
                Ok(ScanReport::Finished(job))
            }
            None => Ok(ScanReport::Skipped),
        }
    }
}

/// Envelope carried by every queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkMessage {
    DownloadArchive(DownloadArchiveCommand),
    SearchBoard(SearchBoardCommand),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub acked: usize,
    pub nacked: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    Acked,
    Nacked,
    Dropped,
}

struct Dispatcher {
    queue: Arc<dyn WorkQueue>,
    processor: ArchiveUnitProcessor,
    scanner: BoardScanner,
}

impl Dispatcher {
    async fn handle(&self, delivery: Delivery) -> Handled {
        let message: WorkMessage = match serde_json::from_str(&delivery.message.payload) {
            Ok(message) => message,
            Err(err) => {
                error!(
                    %err,
                    dedupe_key = %delivery.message.dedupe_key,
                    "undecodable message dropped"
                );
                self.settle(delivery.receipt, true).await;
                return Handled::Dropped;
            }
        };

        let result = match &message {
            WorkMessage::DownloadArchive(cmd) => self.processor.process(cmd).await.map(|_| ()),
            WorkMessage::SearchBoard(cmd) => self.scanner.scan(cmd).await.map(|_| ()),
        };

        match result {
            Ok(()) => {
                self.settle(delivery.receipt, true).await;
                Handled::Acked
            }
            Err(err) => {
                warn!(
                    %err,
                    receive_count = delivery.receive_count,
                    "handler failed; message will be redelivered"
                );
                self.settle(delivery.receipt, false).await;
                Handled::Nacked
            }
        }
    }

    async fn settle(&self, receipt: Uuid, ack: bool) {
        let result = if ack {
            self.queue.ack(receipt).await
        } else {
            self.queue.nack(receipt).await
        };
        if let Err(err) = result {
            warn!(%err, ack, "could not settle delivery");
        }
    }
}

/// Queue consumer running handlers with bounded concurrency.
#[derive(Clone)]
pub struct Worker {
    dispatcher: Arc<Dispatcher>,
    concurrency: usize,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        processor: ArchiveUnitProcessor,
        scanner: BoardScanner,
        concurrency: usize,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                queue,
                processor,
                scanner,
            }),
            concurrency: concurrency.max(1),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Process messages until the queue has nothing ready or in flight.
    pub async fn drain(&self) -> Result<WorkerStats, EngineError> {
        let mut tasks = JoinSet::new();
        let mut stats = WorkerStats::default();
        while self.step(&mut tasks, &mut stats, true).await? {}
        Ok(stats)
    }

    /// Process messages until `shutdown` resolves, then finish in-flight handlers.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<WorkerStats, EngineError>
    where
        F: Future<Output = ()>,
    {
        let mut tasks = JoinSet::new();
        let mut stats = WorkerStats::default();
        tokio::pin!(shutdown);
        info!(concurrency = self.concurrency, "worker started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                step = self.step(&mut tasks, &mut stats, false) => {
                    step?;
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            record(&mut stats, joined);
        }
        info!(?stats, "worker stopped");
        Ok(stats)
    }

    async fn step(
        &self,
        tasks: &mut JoinSet<Handled>,
        stats: &mut WorkerStats,
        stop_when_idle: bool,
    ) -> Result<bool, EngineError> {
        let free = self.concurrency.saturating_sub(tasks.len());
        if free > 0 {
            let deliveries = self.dispatcher.queue.receive(free).await?;
            for delivery in deliveries {
                let dispatcher = Arc::clone(&self.dispatcher);
                tasks.spawn(async move { dispatcher.handle(delivery).await });
            }
        }

        if tasks.is_empty() {
            if stop_when_idle && self.dispatcher.queue.is_idle().await {
                return Ok(false);
            }
            self.dispatcher.queue.wait(self.poll_interval).await;
            return Ok(true);
        }

        if let Some(joined) = tasks.join_next().await {
            record(stats, joined);
        }
        Ok(true)
    }
}

fn record(stats: &mut WorkerStats, joined: Result<Handled, tokio::task::JoinError>) {
    match joined {
        Ok(Handled::Acked) => stats.acked += 1,
        Ok(Handled::Nacked) => stats.nacked += 1,
        Ok(Handled::Dropped) => stats.dropped += 1,
        Err(err) => {
            error!(%err, "handler task panicked");
            stats.nacked += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStarted {
    pub download_id: Uuid,
    pub total: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchStarted {
    pub search_id: Uuid,
    pub total: u64,
}

/// Entry points used by the HTTP and CLI layers.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn WorkQueue>,
    remote: Arc<dyn RemoteSource>,
    matcher: Arc<dyn BoardMatcher>,
    downloads: DownloadJobTracker,
    searches: SearchJobTracker,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn WorkQueue>,
        remote: Arc<dyn RemoteSource>,
        matcher: Arc<dyn BoardMatcher>,
    ) -> Self {
        let downloads = DownloadJobTracker::new(
            Arc::clone(&store),
            chrono::Duration::seconds(config.download_expires_in_secs),
        );
        let searches = SearchJobTracker::new(
            Arc::clone(&store),
            chrono::Duration::seconds(config.search_expires_in_secs),
        );
        Self {
            config,
            store,
            queue,
            remote,
            matcher,
            downloads,
            searches,
        }
    }

    /// Wire the production collaborators described by `config`.
    pub async fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn RecordStore> = match &config.database_url {
            Some(url) => Arc::new(
                PgRecordStore::connect(url)
                    .await
                    .context("connecting to postgres record store")?,
            ),
            None => {
                warn!("DATABASE_URL unset; using in-memory record store");
                Arc::new(InMemoryRecordStore::new())
            }
        };
        let queue: Arc<dyn WorkQueue> = Arc::new(InMemoryWorkQueue::new(QueueConfig {
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            ..QueueConfig::default()
        }));
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?);
        let remote: Arc<dyn RemoteSource> =
            Arc::new(ChessDotComSource::new(Arc::clone(&http), &config.chess_dot_com_url));
        let matcher: Arc<dyn BoardMatcher> =
            Arc::new(HttpBoardMatcher::new(http, &config.matcher_url));
        Ok(Self::new(config, store, queue, remote, matcher))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    pub fn worker(&self) -> Worker {
        let processor = ArchiveUnitProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            self.downloads.clone(),
            self.config.pgn_filter,
        );
        let scanner = BoardScanner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.matcher),
            self.searches.clone(),
            self.config.search_page_size,
            self.config.match_quota,
        );
        Worker::new(
            Arc::clone(&self.queue),
            processor,
            scanner,
            self.config.worker_concurrency,
        )
    }

    /// Register the profile and enqueue every archive that needs syncing.
    pub async fn start_download(
        &self,
        username: &str,
        platform: Platform,
    ) -> Result<DownloadStarted, EngineError> {
        let username = validate_username(username)?;
        if platform != Platform::ChessDotCom {
            return Err(EngineError::Validation(format!("platform {platform} is not supported")));
        }

        let remote_user_id = self
            .remote
            .lookup_profile(username)
            .await
            .map_err(|err| remote_to_engine(username, err))?;
        let user = User {
            username: username.to_string(),
            platform,
            remote_user_id,
        };
        self.store.put_user(&user).await?;

        let remote_archives = self
            .remote
            .list_archives(username)
            .await
            .map_err(|err| remote_to_engine(username, err))?;
        let known = self.store.query_archives(&user.remote_user_id).await?;
        let plan = plan_archives(&user.remote_user_id, &remote_archives, &known)
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        let total = u32::try_from(plan.len()).map_err(|_| {
            EngineError::Internal(format!("{} archives exceed job capacity", plan.len()))
        })?;

        for archive in &plan.missing {
            self.store.put_archive(archive).await?;
        }

        let download_id = Uuid::new_v4();
        self.downloads
            .create(download_id, &user.remote_user_id, total)
            .await?;

        for unit in plan.units() {
            let message = WorkMessage::DownloadArchive(DownloadArchiveCommand {
                username: user.username.clone(),
                platform,
                user_id: user.remote_user_id.clone(),
                archive_id: unit.archive_id.clone(),
                year: unit.year,
                month: unit.month,
                download_id,
            });
            let key = dedupe_key(&[download_id.to_string().as_str(), unit.archive_id.as_str()]);
            self.queue
                .send(&user.remote_user_id, &key, serde_json::to_string(&message)?)
                .await?;
        }

        info!(
            %download_id,
            username,
            missing = plan.missing.len(),
            stale = plan.stale.len(),
            "download started"
        );
        Ok(DownloadStarted { download_id, total })
    }

    pub async fn start_search(
        &self,
        username: &str,
        platform: Platform,
        board: &str,
    ) -> Result<SearchStarted, EngineError> {
        let username = validate_username(username)?;
        if board.trim().is_empty() {
            return Err(EngineError::InvalidSearchBoard);
        }
        match self.matcher.validate(board).await {
            Ok(true) => {}
            Ok(false) => return Err(EngineError::InvalidSearchBoard),
            Err(err) => return Err(EngineError::ServiceOverloaded(err.to_string())),
        }

        let user = self
            .store
            .get_user(username, platform)
            .await?
            .ok_or_else(|| EngineError::ProfileNotCached {
                username: username.to_string(),
                platform,
            })?;
        let total: u64 = self
            .store
            .query_archives(&user.remote_user_id)
            .await?
            .iter()
            .map(|a| a.games_downloaded_count)
            .sum();
        if total == 0 {
            return Err(EngineError::NoGameAvailable(username.to_string()));
        }

        let search_id = Uuid::new_v4();
        self.searches
            .create(search_id, &user.remote_user_id, total)
            .await?;
        let message = WorkMessage::SearchBoard(SearchBoardCommand {
            user_id: user.remote_user_id.clone(),
            search_id,
            board: board.to_string(),
        });
        let key = dedupe_key(&[search_id.to_string().as_str()]);
        self.queue
            .send(&user.remote_user_id, &key, serde_json::to_string(&message)?)
            .await?;

        info!(%search_id, username, total, "search started");
        Ok(SearchStarted { search_id, total })
    }

    pub async fn download_status(&self, download_id: Uuid) -> Result<DownloadJob, EngineError> {
        self.store
            .get_download_job(download_id)
            .await?
            .ok_or(EngineError::DownloadNotFound(download_id))
    }

    pub async fn search_status(&self, search_id: Uuid) -> Result<SearchJob, EngineError> {
        self.store
            .get_search_job(search_id)
            .await?
            .ok_or(EngineError::SearchNotFound(search_id))
    }
}

fn validate_username(username: &str) -> Result<&str, EngineError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(EngineError::Validation("username must not be empty".to_string()));
    }
    Ok(username)
}

fn remote_to_engine(username: &str, err: RemoteError) -> EngineError {
    match err {
        RemoteError::NotFound(_) => EngineError::ProfileNotFound(username.to_string()),
        other => {
            warn!(username, err = %other, "remote source unavailable");
            EngineError::ServiceOverloaded(other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chessfinder_adapters::{FixtureBoardMatcher, FixtureRemoteSource, RemoteGame};
    use chessfinder_core::SyncState;
    use chrono::{DateTime, Datelike, TimeZone};

    const BASE: &str = "https://api.chess.com";

    fn utc(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, hh, mm, ss).single().expect("valid timestamp")
    }

    fn archive_id(year: i32, month: u32) -> String {
        format!("{BASE}/pub/player/tal/games/{year:04}/{month:02}")
    }

    fn remote_game(id: &str, end: i64) -> RemoteGame {
        RemoteGame {
            game_id: id.to_string(),
            pgn: format!("1. e4 e5 {id}"),
            end_timestamp: end,
        }
    }

    fn stored_game(archive: &str, id: &str, end: i64) -> GameRecord {
        GameRecord {
            user_id: "tal-id".to_string(),
            archive_id: archive.to_string(),
            game_id: id.to_string(),
            pgn: format!("1. e4 e5 {id}"),
            end_timestamp: end,
        }
    }

    fn command(archive: &ArchiveUnit, download_id: Uuid) -> DownloadArchiveCommand {
        DownloadArchiveCommand {
            username: "tal".to_string(),
            platform: Platform::ChessDotCom,
            user_id: archive.user_id.clone(),
            archive_id: archive.archive_id.clone(),
            year: archive.year,
            month: archive.month,
            download_id,
        }
    }

    struct Fixture {
        store: InMemoryRecordStore,
        remote: FixtureRemoteSource,
        downloads: DownloadJobTracker,
        searches: SearchJobTracker,
    }

    impl Fixture {
        fn new() -> Self {
            let store = InMemoryRecordStore::new();
            let shared: Arc<dyn RecordStore> = Arc::new(store.clone());
            Self {
                downloads: DownloadJobTracker::new(Arc::clone(&shared), chrono::Duration::hours(1)),
                searches: SearchJobTracker::new(shared, chrono::Duration::hours(1)),
                store,
                remote: FixtureRemoteSource::new(BASE),
            }
        }

        fn processor(&self) -> ArchiveUnitProcessor {
            ArchiveUnitProcessor::new(
                Arc::new(self.store.clone()),
                Arc::new(self.remote.clone()),
                self.downloads.clone(),
                PgnFilter::Identity,
            )
            .with_write_retry(3, Duration::from_millis(1))
        }

        fn scanner(&self, matcher: FixtureBoardMatcher, page_size: usize) -> BoardScanner {
            BoardScanner::new(
                Arc::new(self.store.clone()),
                Arc::new(matcher),
                self.searches.clone(),
                page_size,
                10,
            )
        }

        async fn seed_games(&self, count: usize, matching: &[usize]) {
            let games: Vec<_> = (0..count)
                .map(|i| GameRecord {
                    user_id: "tal-id".to_string(),
                    archive_id: archive_id(2022, 8),
                    game_id: format!("g{i:02}"),
                    pgn: if matching.contains(&i) {
                        "1. e4 e5 2. Qh5 TARGET".to_string()
                    } else {
                        "1. d4 d5".to_string()
                    },
                    end_timestamp: i as i64,
                })
                .collect();
            assert!(self.store.batch_put_games(&games).await.expect("seed").is_empty());
        }
    }

    #[test]
    fn planner_splits_missing_and_open_archives() {
        let closed = ArchiveUnit {
            sync_state: SyncState::SyncedAt(utc(2022, 9, 1, 0, 0, 0)),
            ..ArchiveUnit::never_synced("tal-id", archive_id(2022, 8), 2022, 8)
        };
        let just_before_close = ArchiveUnit {
            sync_state: SyncState::SyncedAt(utc(2022, 8, 31, 23, 59, 59)),
            ..ArchiveUnit::never_synced("tal-id", archive_id(2022, 7), 2022, 7)
        };
        let stale_august = ArchiveUnit {
            sync_state: SyncState::SyncedAt(utc(2022, 8, 31, 23, 59, 59)),
            ..closed.clone()
        };

        let remote = vec![archive_id(2022, 8), archive_id(2022, 9), archive_id(2022, 9)];
        let plan = plan_archives("tal-id", &remote, &[closed.clone(), just_before_close.clone()])
            .expect("plan");
        assert_eq!(plan.missing.len(), 1);
        assert_eq!(plan.missing[0].archive_id, archive_id(2022, 9));
        assert_eq!(plan.missing[0].sync_state, SyncState::NeverSynced);
        assert!(plan.stale.is_empty());

        let plan = plan_archives("tal-id", &[], &[stale_august]).expect("plan");
        assert_eq!(plan.stale.len(), 1);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn planner_rejects_malformed_archive_ids() {
        let err = plan_archives("tal-id", &["https://api.chess.com/nope".to_string()], &[]);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn tracker_counts_every_unit_once() {
        let fx = Fixture::new();
        let job = fx.downloads.create(Uuid::new_v4(), "tal-id", 3).await.expect("create");

        fx.downloads
            .mark_unit_complete(job.job_id, "a", UnitOutcome::Succeeded)
            .await
            .expect("a");
        let dup = fx
            .downloads
            .mark_unit_complete(job.job_id, "a", UnitOutcome::Succeeded)
            .await
            .expect("dup");
        assert_eq!(dup, MarkOutcome::Duplicate);
        fx.downloads
            .mark_unit_complete(job.job_id, "b", UnitOutcome::Failed)
            .await
            .expect("b");
        let last = fx
            .downloads
            .mark_unit_complete(job.job_id, "c", UnitOutcome::Succeeded)
            .await
            .expect("c");

        let MarkOutcome::Applied(done) = last else {
            panic!("expected applied, got {last:?}");
        };
        assert_eq!((done.pending, done.succeeded, done.failed, done.done), (0, 2, 1, 3));
        assert!(done.counters_consistent());

        let overflow = fx
            .downloads
            .mark_unit_complete(job.job_id, "d", UnitOutcome::Succeeded)
            .await;
        assert!(matches!(overflow, Err(EngineError::Inconsistent(_))));
        let stored = fx.store.get_download_job(job.job_id).await.expect("get").expect("job");
        assert_eq!(stored, done);
    }

    #[tokio::test]
    async fn concurrent_completions_are_not_lost() {
        let fx = Fixture::new();
        let job_id = fx.downloads.create(Uuid::new_v4(), "tal-id", 6).await.expect("create").job_id;

        let mut handles = Vec::new();
        for unit in 0..6 {
            let tracker = fx.downloads.clone();
            handles.push(tokio::spawn(async move {
                tracker
                    .mark_unit_complete(job_id, &format!("unit-{unit}"), UnitOutcome::Succeeded)
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("mark");
        }
        let stored = fx.store.get_download_job(job_id).await.expect("get").expect("job");
        assert_eq!(stored.done, 6);
        assert!(stored.is_complete());
    }

    #[tokio::test]
    async fn processor_merges_only_unseen_games() {
        let fx = Fixture::new();
        let archive = ArchiveUnit {
            games_downloaded_count: 3,
            ..ArchiveUnit::never_synced("tal-id", archive_id(2022, 8), 2022, 8)
        };
        fx.store.put_archive(&archive).await.expect("archive");
        fx.store
            .batch_put_games(&[
                stored_game(&archive.archive_id, "g10", 10),
                stored_game(&archive.archive_id, "g20", 20),
                stored_game(&archive.archive_id, "g30", 30),
            ])
            .await
            .expect("seed");
        fx.remote
            .put_games(
                "tal",
                2022,
                8,
                vec![remote_game("g20", 20), remote_game("g30", 30), remote_game("g40", 40)],
            )
            .await;
        let job = fx.downloads.create(Uuid::new_v4(), "tal-id", 1).await.expect("job");

        let report = fx.processor().process(&command(&archive, job.job_id)).await.expect("process");
        assert_eq!(report.outcome, UnitOutcome::Succeeded);
        assert_eq!(report.new_games, 1);
        assert_eq!(fx.store.game_count("tal-id").await, 4);

        let synced = fx
            .store
            .get_archive("tal-id", &archive.archive_id)
            .await
            .expect("get")
            .expect("archive");
        assert_eq!(synced.games_downloaded_count, 4);
        assert!(synced.is_closed());
    }

    #[tokio::test]
    async fn redelivered_unit_is_absorbed() {
        let fx = Fixture::new();
        let archive = ArchiveUnit::never_synced("tal-id", archive_id(2022, 8), 2022, 8);
        fx.store.put_archive(&archive).await.expect("archive");
        fx.remote
            .put_games("tal", 2022, 8, vec![remote_game("g1", 1), remote_game("g2", 2)])
            .await;
        let job = fx.downloads.create(Uuid::new_v4(), "tal-id", 1).await.expect("job");
        let cmd = command(&archive, job.job_id);

        fx.processor().process(&cmd).await.expect("first");
        let after_first = fx.store.get_download_job(job.job_id).await.expect("get");
        let second = fx.processor().process(&cmd).await.expect("second");

        assert!(!second.fetched);
        assert_eq!(second.mark, Some(MarkOutcome::Duplicate));
        assert_eq!(fx.store.get_download_job(job.job_id).await.expect("get"), after_first);
        let synced = fx
            .store
            .get_archive("tal-id", &archive.archive_id)
            .await
            .expect("get")
            .expect("archive");
        assert_eq!(synced.games_downloaded_count, 2);
    }

    #[tokio::test]
    async fn processor_records_remote_failure_and_absent_archive() {
        let fx = Fixture::new();
        let archive = ArchiveUnit::never_synced("tal-id", archive_id(2022, 8), 2022, 8);
        fx.store.put_archive(&archive).await.expect("archive");
        fx.remote.fail_month("tal", 2022, 8).await;
        let job = fx.downloads.create(Uuid::new_v4(), "tal-id", 2).await.expect("job");

        let failed = fx.processor().process(&command(&archive, job.job_id)).await.expect("failed");
        assert_eq!(failed.outcome, UnitOutcome::Failed);

        let ghost = ArchiveUnit::never_synced("tal-id", archive_id(2021, 1), 2021, 1);
        let absent = fx.processor().process(&command(&ghost, job.job_id)).await.expect("absent");
        assert_eq!(absent.outcome, UnitOutcome::Succeeded);
        assert!(!absent.fetched);

        let stored = fx.store.get_download_job(job.job_id).await.expect("get").expect("job");
        assert_eq!((stored.succeeded, stored.failed, stored.pending), (1, 1, 0));
    }

    #[tokio::test]
    async fn empty_remote_month_is_marked_synced() {
        let fx = Fixture::new();
        let now = Utc::now();
        let current = ArchiveUnit::never_synced(
            "tal-id",
            archive_id(now.year(), now.month()),
            now.year(),
            now.month(),
        );
        fx.store.put_archive(&current).await.expect("archive");
        let job = fx.downloads.create(Uuid::new_v4(), "tal-id", 1).await.expect("job");

        let report = fx.processor().process(&command(&current, job.job_id)).await.expect("process");
        assert_eq!(report.outcome, UnitOutcome::Succeeded);
        let synced = fx
            .store
            .get_archive("tal-id", &current.archive_id)
            .await
            .expect("get")
            .expect("archive");
        assert!(synced.sync_state.synced_at().is_some());
        assert!(synced.is_open());
    }

    #[tokio::test]
    async fn transient_write_failures_are_retried() {
        let fx = Fixture::new();
        let archive = ArchiveUnit::never_synced("tal-id", archive_id(2022, 8), 2022, 8);
        fx.store.put_archive(&archive).await.expect("archive");
        let games: Vec<_> = (0..30).map(|i| remote_game(&format!("g{i:02}"), i)).collect();
        fx.remote.put_games("tal", 2022, 8, games).await;
        let job = fx.downloads.create(Uuid::new_v4(), "tal-id", 1).await.expect("job");

        fx.store.inject_game_write_failures(2);
        let report = fx
            .processor()
            .process(&command(&archive, job.job_id))
            .await
            .expect("process");
        assert_eq!(report.outcome, UnitOutcome::Succeeded);
        assert_eq!(report.new_games, 30);
        assert_eq!(fx.store.game_count("tal-id").await, 30);
    }

    #[tokio::test]
    async fn partially_written_unit_is_completed_on_next_sync() {
        let fx = Fixture::new();
        let archive = ArchiveUnit::never_synced("tal-id", archive_id(2022, 8), 2022, 8);
        fx.store.put_archive(&archive).await.expect("archive");
        let games: Vec<_> = (0..30).map(|i| remote_game(&format!("g{i:02}"), i)).collect();
        fx.remote.put_games("tal", 2022, 8, games).await;

        // Two full failures of the first batch, then g00 and g01 stay unwritten.
        fx.store.inject_game_write_failures(2 * GAME_BATCH_SIZE + 2);
        let first_job = fx.downloads.create(Uuid::new_v4(), "tal-id", 1).await.expect("job");
        let first = fx
            .processor()
            .process(&command(&archive, first_job.job_id))
            .await
            .expect("first sync");
        assert_eq!(first.outcome, UnitOutcome::Failed);
        assert_eq!(fx.store.game_count("tal-id").await, 23);

        let partial = fx
            .store
            .get_archive("tal-id", &archive.archive_id)
            .await
            .expect("get")
            .expect("archive");
        assert_eq!(partial.games_downloaded_count, 23);
        assert_eq!(partial.sync_state, SyncState::NeverSynced);

        let second_job = fx.downloads.create(Uuid::new_v4(), "tal-id", 1).await.expect("job");
        let second = fx
            .processor()
            .process(&command(&partial, second_job.job_id))
            .await
            .expect("second sync");
        assert_eq!(second.outcome, UnitOutcome::Succeeded);
        assert_eq!(second.new_games, 7);

        let stored = fx
            .store
            .archive_game_ids("tal-id", &archive.archive_id)
            .await
            .expect("archive ids");
        assert_eq!(stored.len(), 30);
        assert!(stored.contains("g00") && stored.contains("g01"));
        let synced = fx
            .store
            .get_archive("tal-id", &archive.archive_id)
            .await
            .expect("get")
            .expect("archive");
        assert_eq!(synced.games_downloaded_count, stored.len() as u64);
        assert!(synced.is_closed());
    }

    #[tokio::test]
    async fn game_count_is_rebuilt_when_archive_write_was_lost() {
        let fx = Fixture::new();
        let archive = ArchiveUnit::never_synced("tal-id", archive_id(2022, 8), 2022, 8);
        fx.store.put_archive(&archive).await.expect("archive");
        fx.store
            .batch_put_games(&[
                stored_game(&archive.archive_id, "g1", 1),
                stored_game(&archive.archive_id, "g2", 2),
            ])
            .await
            .expect("seed");
        fx.remote
            .put_games(
                "tal",
                2022,
                8,
                vec![remote_game("g1", 1), remote_game("g2", 2), remote_game("g3", 3)],
            )
            .await;
        let job = fx.downloads.create(Uuid::new_v4(), "tal-id", 1).await.expect("job");

        let report = fx
            .processor()
            .process(&command(&archive, job.job_id))
            .await
            .expect("process");
        assert_eq!(report.new_games, 1);
        let synced = fx
            .store
            .get_archive("tal-id", &archive.archive_id)
            .await
            .expect("get")
            .expect("archive");
        assert_eq!(synced.games_downloaded_count, 3);
    }

    #[tokio::test]
    async fn scanner_stops_at_match_quota() {
        let fx = Fixture::new();
        let matching: Vec<usize> = (0..12).map(|i| i * 2).collect();
        fx.seed_games(25, &matching).await;
        let job = fx.searches.create(Uuid::new_v4(), "tal-id", 25).await.expect("job");
        let cmd = SearchBoardCommand {
            user_id: "tal-id".to_string(),
            search_id: job.search_id,
            board: "TARGET".to_string(),
        };

        let report = fx.scanner(FixtureBoardMatcher::new(), 7).scan(&cmd).await.expect("scan");
        let ScanReport::Finished(done) = report else {
            panic!("expected a finished scan");
        };
        assert_eq!(done.status, SearchStatus::SearchedPartially);
        assert_eq!(done.matched_game_ids.len(), 10);
        assert_eq!(done.examined_count, 19);
    }

    #[tokio::test]
    async fn scanner_exhausts_small_collections() {
        let fx = Fixture::new();
        fx.seed_games(5, &[3]).await;
        let job = fx.searches.create(Uuid::new_v4(), "tal-id", 5).await.expect("job");
        let cmd = SearchBoardCommand {
            user_id: "tal-id".to_string(),
            search_id: job.search_id,
            board: "TARGET".to_string(),
        };
        let scanner = fx.scanner(FixtureBoardMatcher::new(), 2);

        let ScanReport::Finished(done) = scanner.scan(&cmd).await.expect("scan") else {
            panic!("expected a finished scan");
        };
        assert_eq!(done.status, SearchStatus::SearchedAll);
        assert_eq!(done.examined_count, 5);
        assert_eq!(done.matched_game_ids, vec!["g03".to_string()]);

        assert_eq!(scanner.scan(&cmd).await.expect("rescan"), ScanReport::Skipped);
        let stored = fx.store.get_search_job(job.search_id).await.expect("get").expect("job");
        assert_eq!(stored, done);
    }

    #[tokio::test]
    async fn matcher_failure_keeps_partial_result() {
        let fx = Fixture::new();
        fx.seed_games(6, &[0]).await;
        let poisoned = vec![stored_game(&archive_id(2022, 8), "g03", 3)];
        fx.store.batch_put_games(&poisoned).await.expect("poison");
        let job = fx.searches.create(Uuid::new_v4(), "tal-id", 6).await.expect("job");
        let cmd = SearchBoardCommand {
            user_id: "tal-id".to_string(),
            search_id: job.search_id,
            board: "TARGET".to_string(),
        };

        let scanner = fx.scanner(FixtureBoardMatcher::new().failing_on("g03"), 100);
        let ScanReport::Finished(done) = scanner.scan(&cmd).await.expect("scan") else {
            panic!("expected a finished scan");
        };
        assert_eq!(done.status, SearchStatus::SearchedPartially);
        assert_eq!(done.examined_count, 3);
        assert_eq!(done.matched_game_ids, vec!["g00".to_string()]);
    }

    #[tokio::test]
    async fn scan_resumes_from_persisted_cursor() {
        let fx = Fixture::new();
        fx.seed_games(4, &[1, 3]).await;
        let job = fx.searches.create(Uuid::new_v4(), "tal-id", 4).await.expect("job");
        fx.searches
            .record_progress(job.search_id, 2, &["g01".to_string()], Some("g01".to_string()))
            .await
            .expect("progress");
        let cmd = SearchBoardCommand {
            user_id: "tal-id".to_string(),
            search_id: job.search_id,
            board: "TARGET".to_string(),
        };

        let ScanReport::Finished(done) =
            fx.scanner(FixtureBoardMatcher::new(), 10).scan(&cmd).await.expect("scan")
        else {
            panic!("expected a finished scan");
        };
        assert_eq!(done.examined_count, 4);
        assert_eq!(done.matched_game_ids, vec!["g01".to_string(), "g03".to_string()]);
        assert_eq!(done.status, SearchStatus::SearchedAll);
    }

    #[tokio::test]
    async fn finalize_is_one_way() {
        let fx = Fixture::new();
        let job = fx.searches.create(Uuid::new_v4(), "tal-id", 1).await.expect("job");
        let done = fx
            .searches
            .finalize(job.search_id, SearchStatus::SearchedAll)
            .await
            .expect("finalize");
        assert!(done.is_some());
        let again = fx
            .searches
            .finalize(job.search_id, SearchStatus::SearchedPartially)
            .await
            .expect("again");
        assert!(again.is_none());
        assert!(fx
            .searches
            .record_progress(job.search_id, 1, &[], None)
            .await
            .expect("progress")
            .is_none());
        let stored = fx.store.get_search_job(job.search_id).await.expect("get").expect("job");
        assert_eq!(stored.status, SearchStatus::SearchedAll);
    }

    #[test]
    fn error_codes_and_kinds_are_stable() {
        assert_eq!(EngineError::ProfileNotFound("x".into()).code(), "PROFILE_NOT_FOUND");
        assert_eq!(EngineError::InvalidSearchBoard.kind(), ErrorKind::Business);
        assert_eq!(EngineError::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(
            EngineError::ServiceOverloaded("x".into()).to_string(),
            "Service is overloaded. Please try again later."
        );
        assert_eq!(EngineError::Contention(Uuid::nil()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn work_messages_are_tagged() {
        let message = WorkMessage::SearchBoard(SearchBoardCommand {
            user_id: "tal-id".into(),
            search_id: Uuid::nil(),
            board: "8/8/8/8/8/8/8/8".into(),
        });
        let json = serde_json::to_value(&message).expect("encode");
        assert_eq!(json["kind"], "search_board");
        assert_eq!(json["searchId"], Uuid::nil().to_string());
    }
}
