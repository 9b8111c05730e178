//! Record store, work queue and HTTP fetch plumbing for chessfinder.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chessfinder_core::{
    ArchiveUnit, DownloadJob, GameRecord, Platform, SearchJob, SearchStatus, SyncState, User,
};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chessfinder-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record already exists: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// One page of a user's games plus the continuation point, if any games remain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GamePage {
    pub games: Vec<GameRecord>,
    pub next_cursor: Option<String>,
}

/// Durable keyed storage for users, archives, games and job aggregates.
///
/// Job aggregates are only ever overwritten through `replace_*`, which applies
/// the write only if the stored version still equals `expected_version`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_user(
        &self,
        username: &str,
        platform: Platform,
    ) -> Result<Option<User>, StoreError>;
    async fn put_user(&self, user: &User) -> Result<(), StoreError>;

    async fn get_archive(
        &self,
        user_id: &str,
        archive_id: &str,
    ) -> Result<Option<ArchiveUnit>, StoreError>;
    async fn put_archive(&self, archive: &ArchiveUnit) -> Result<(), StoreError>;
    async fn query_archives(&self, user_id: &str) -> Result<Vec<ArchiveUnit>, StoreError>;

    /// Ids of the games stored under one archive.
    async fn archive_game_ids(
        &self,
        user_id: &str,
        archive_id: &str,
    ) -> Result<HashSet<String>, StoreError>;
    /// Idempotent overwrite keyed by `(user_id, game_id)`. Returns the indexes of
    /// `games` that were not written.
    async fn batch_put_games(&self, games: &[GameRecord]) -> Result<Vec<usize>, StoreError>;
    /// Games ordered by `game_id`, strictly after `after`.
    async fn query_games(
        &self,
        user_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<GamePage, StoreError>;

    async fn get_download_job(&self, job_id: Uuid) -> Result<Option<DownloadJob>, StoreError>;
    async fn insert_download_job(&self, job: &DownloadJob) -> Result<(), StoreError>;
    async fn replace_download_job(
        &self,
        job: &DownloadJob,
        expected_version: u64,
    ) -> Result<bool, StoreError>;

    async fn get_search_job(&self, search_id: Uuid) -> Result<Option<SearchJob>, StoreError>;
    async fn insert_search_job(&self, job: &SearchJob) -> Result<(), StoreError>;
    async fn replace_search_job(
        &self,
        job: &SearchJob,
        expected_version: u64,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<(String, Platform), User>,
    archives: BTreeMap<(String, String), ArchiveUnit>,
    games: BTreeMap<(String, String), GameRecord>,
    downloads: HashMap<Uuid, DownloadJob>,
    searches: HashMap<Uuid, SearchJob>,
}

/// Process-local store. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    tables: Arc<RwLock<Tables>>,
    unavailable: Arc<AtomicBool>,
    game_write_failures: Arc<AtomicUsize>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent call fails with `StoreError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `count` game writes are reported back as failed indexes.
    pub fn inject_game_write_failures(&self, count: usize) {
        self.game_write_failures.store(count, Ordering::SeqCst);
    }

    pub async fn game_count(&self, user_id: &str) -> usize {
        self.tables
            .read()
            .await
            .games
            .keys()
            .filter(|(u, _)| u == user_id)
            .count()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }

    fn take_game_write_failure(&self) -> bool {
        self.game_write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_user(
        &self,
        username: &str,
        platform: Platform,
    ) -> Result<Option<User>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.users.get(&(username.to_string(), platform)).cloned())
    }

    async fn put_user(&self, user: &User) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables
            .users
            .insert((user.username.clone(), user.platform), user.clone());
        Ok(())
    }

    async fn get_archive(
        &self,
        user_id: &str,
        archive_id: &str,
    ) -> Result<Option<ArchiveUnit>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .archives
            .get(&(user_id.to_string(), archive_id.to_string()))
            .cloned())
    }

    async fn put_archive(&self, archive: &ArchiveUnit) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.archives.insert(
            (archive.user_id.clone(), archive.archive_id.clone()),
            archive.clone(),
        );
        Ok(())
    }

    async fn query_archives(&self, user_id: &str) -> Result<Vec<ArchiveUnit>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .archives
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn archive_game_ids(
        &self,
        user_id: &str,
        archive_id: &str,
    ) -> Result<HashSet<String>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .games
            .values()
            .filter(|g| g.user_id == user_id && g.archive_id == archive_id)
            .map(|g| g.game_id.clone())
            .collect())
    }

    async fn batch_put_games(&self, games: &[GameRecord]) -> Result<Vec<usize>, StoreError> {
        self.check()?;
        let mut failed = Vec::new();
        let mut tables = self.tables.write().await;
        for (idx, game) in games.iter().enumerate() {
            if self.take_game_write_failure() {
                failed.push(idx);
                continue;
            }
            tables
                .games
                .insert((game.user_id.clone(), game.game_id.clone()), game.clone());
        }
        Ok(failed)
    }

    async fn query_games(
        &self,
        user_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<GamePage, StoreError> {
        self.check()?;
        let limit = limit.max(1);
        let tables = self.tables.read().await;
        let start = match after {
            Some(cursor) => Bound::Excluded((user_id.to_string(), cursor.to_string())),
            None => Bound::Included((user_id.to_string(), String::new())),
        };
        let mut rows = tables
            .games
            .range((start, Bound::Unbounded))
            .take_while(|((owner, _), _)| owner == user_id)
            .map(|(_, game)| game.clone());
        let games: Vec<GameRecord> = rows.by_ref().take(limit).collect();
        let next_cursor = if rows.next().is_some() {
            games.last().map(|g| g.game_id.clone())
        } else {
            None
        };
        Ok(GamePage { games, next_cursor })
    }

    async fn get_download_job(&self, job_id: Uuid) -> Result<Option<DownloadJob>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.downloads.get(&job_id).cloned())
    }

    async fn insert_download_job(&self, job: &DownloadJob) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if tables.downloads.contains_key(&job.job_id) {
            return Err(StoreError::Conflict(format!("download job {}", job.job_id)));
        }
        tables.downloads.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn replace_download_job(
        &self,
        job: &DownloadJob,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        match tables.downloads.get_mut(&job.job_id) {
            Some(current) if current.version == expected_version => {
                *current = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_search_job(&self, search_id: Uuid) -> Result<Option<SearchJob>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.searches.get(&search_id).cloned())
    }

    async fn insert_search_job(&self, job: &SearchJob) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if tables.searches.contains_key(&job.search_id) {
            return Err(StoreError::Conflict(format!("search job {}", job.search_id)));
        }
        tables.searches.insert(job.search_id, job.clone());
        Ok(())
    }

    async fn replace_search_job(
        &self,
        job: &SearchJob,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        match tables.searches.get_mut(&job.search_id) {
            Some(current) if current.version == expected_version => {
                *current = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// PostgreSQL-backed store. Schema lives in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{field}={value} overflows INTEGER")))
}

fn to_i64(value: u64, field: &str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{field}={value} overflows BIGINT")))
}

fn column_u32(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column}={value} is negative")))
}

fn column_u64(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column}={value} is negative")))
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let platform: String = row.try_get("platform")?;
    Ok(User {
        username: row.try_get("username")?,
        platform: platform
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        remote_user_id: row.try_get("remote_user_id")?,
    })
}

fn archive_from_row(row: &PgRow) -> Result<ArchiveUnit, StoreError> {
    let last_synced_at: Option<DateTime<Utc>> = row.try_get("last_synced_at")?;
    Ok(ArchiveUnit {
        user_id: row.try_get("user_id")?,
        archive_id: row.try_get("archive_id")?,
        year: row.try_get("year")?,
        month: column_u32(row, "month")?,
        games_downloaded_count: column_u64(row, "games_downloaded_count")?,
        sync_state: last_synced_at.map_or(SyncState::NeverSynced, SyncState::SyncedAt),
    })
}

fn game_from_row(row: &PgRow) -> Result<GameRecord, StoreError> {
    Ok(GameRecord {
        user_id: row.try_get("user_id")?,
        archive_id: row.try_get("archive_id")?,
        game_id: row.try_get("game_id")?,
        pgn: row.try_get("pgn")?,
        end_timestamp: row.try_get("end_timestamp")?,
    })
}

fn download_from_row(row: &PgRow) -> Result<DownloadJob, StoreError> {
    let reported_units: Vec<String> = row.try_get("reported_units")?;
    Ok(DownloadJob {
        job_id: row.try_get("job_id")?,
        user_id: row.try_get("user_id")?,
        total: column_u32(row, "total")?,
        pending: column_u32(row, "pending")?,
        done: column_u32(row, "done")?,
        succeeded: column_u32(row, "succeeded")?,
        failed: column_u32(row, "failed")?,
        reported_units: reported_units.into_iter().collect(),
        started_at: row.try_get("started_at")?,
        last_progress_at: row.try_get("last_progress_at")?,
        expires_at: row.try_get("expires_at")?,
        version: column_u64(row, "version")?,
    })
}

fn search_from_row(row: &PgRow) -> Result<SearchJob, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(SearchJob {
        search_id: row.try_get("search_id")?,
        user_id: row.try_get("user_id")?,
        started_at: row.try_get("started_at")?,
        last_progress_at: row.try_get("last_progress_at")?,
        examined_count: column_u64(row, "examined_count")?,
        total_count: column_u64(row, "total_count")?,
        matched_game_ids: row.try_get("matched_game_ids")?,
        status: status
            .parse::<SearchStatus>()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        cursor: row.try_get("cursor")?,
        expires_at: row.try_get("expires_at")?,
        version: column_u64(row, "version")?,
    })
}

const DOWNLOAD_COLUMNS: &str = "job_id, user_id, total, pending, done, succeeded, failed, \
     reported_units, started_at, last_progress_at, expires_at, version";

const SEARCH_COLUMNS: &str = "search_id, user_id, started_at, last_progress_at, examined_count, \
     total_count, matched_game_ids, status, cursor, expires_at, version";

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get_user(
        &self,
        username: &str,
        platform: Platform,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT username, platform, remote_user_id
              FROM users
             WHERE username = $1 AND platform = $2
            "#,
        )
        .bind(username)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn put_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (username, platform, remote_user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (username, platform)
            DO UPDATE SET remote_user_id = EXCLUDED.remote_user_id
            "#,
        )
        .bind(&user.username)
        .bind(user.platform.as_str())
        .bind(&user.remote_user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_archive(
        &self,
        user_id: &str,
        archive_id: &str,
    ) -> Result<Option<ArchiveUnit>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, archive_id, year, month, games_downloaded_count, last_synced_at
              FROM archives
             WHERE user_id = $1 AND archive_id = $2
            "#,
        )
        .bind(user_id)
        .bind(archive_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(archive_from_row).transpose()
    }

    async fn put_archive(&self, archive: &ArchiveUnit) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO archives
                   (user_id, archive_id, year, month, games_downloaded_count, last_synced_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, archive_id)
            DO UPDATE SET games_downloaded_count = EXCLUDED.games_downloaded_count,
                          last_synced_at = EXCLUDED.last_synced_at
            "#,
        )
        .bind(&archive.user_id)
        .bind(&archive.archive_id)
        .bind(archive.year)
        .bind(to_i32(archive.month, "month")?)
        .bind(to_i64(archive.games_downloaded_count, "games_downloaded_count")?)
        .bind(archive.sync_state.synced_at())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_archives(&self, user_id: &str) -> Result<Vec<ArchiveUnit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, archive_id, year, month, games_downloaded_count, last_synced_at
              FROM archives
             WHERE user_id = $1
             ORDER BY year, month
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(archive_from_row).collect()
    }

    async fn archive_game_ids(
        &self,
        user_id: &str,
        archive_id: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT game_id
              FROM games
             WHERE user_id = $1 AND archive_id = $2
            "#,
        )
        .bind(user_id)
        .bind(archive_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("game_id").map_err(StoreError::from))
            .collect()
    }

    async fn batch_put_games(&self, games: &[GameRecord]) -> Result<Vec<usize>, StoreError> {
        if games.is_empty() {
            return Ok(Vec::new());
        }
        let user_ids: Vec<&str> = games.iter().map(|g| g.user_id.as_str()).collect();
        let game_ids: Vec<&str> = games.iter().map(|g| g.game_id.as_str()).collect();
        let archive_ids: Vec<&str> = games.iter().map(|g| g.archive_id.as_str()).collect();
        let pgns: Vec<&str> = games.iter().map(|g| g.pgn.as_str()).collect();
        let ends: Vec<i64> = games.iter().map(|g| g.end_timestamp).collect();

        sqlx::query(
            r#"
            INSERT INTO games (user_id, game_id, archive_id, pgn, end_timestamp)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::bigint[])
            ON CONFLICT (user_id, game_id)
            DO UPDATE SET archive_id = EXCLUDED.archive_id,
                          pgn = EXCLUDED.pgn,
                          end_timestamp = EXCLUDED.end_timestamp
            "#,
        )
        .bind(&user_ids)
        .bind(&game_ids)
        .bind(&archive_ids)
        .bind(&pgns)
        .bind(&ends)
        .execute(&self.pool)
        .await?;
        Ok(Vec::new())
    }

    async fn query_games(
        &self,
        user_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<GamePage, StoreError> {
        let limit = limit.max(1);
        let fetch = i64::try_from(limit + 1).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT user_id, game_id, archive_id, pgn, end_timestamp
              FROM games
             WHERE user_id = $1
               AND ($2::text IS NULL OR game_id > $2)
             ORDER BY game_id
             LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(after)
        .bind(fetch)
        .fetch_all(&self.pool)
        .await?;

        let mut games = rows.iter().map(game_from_row).collect::<Result<Vec<_>, _>>()?;
        let next_cursor = if games.len() > limit {
            games.truncate(limit);
            games.last().map(|g| g.game_id.clone())
        } else {
            None
        };
        Ok(GamePage { games, next_cursor })
    }

    async fn get_download_job(&self, job_id: Uuid) -> Result<Option<DownloadJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM download_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(download_from_row).transpose()
    }

    async fn insert_download_job(&self, job: &DownloadJob) -> Result<(), StoreError> {
        let reported: Vec<&str> = job.reported_units.iter().map(String::as_str).collect();
        let result = sqlx::query(&format!(
            "INSERT INTO download_jobs ({DOWNLOAD_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (job_id) DO NOTHING"
        ))
        .bind(job.job_id)
        .bind(&job.user_id)
        .bind(to_i32(job.total, "total")?)
        .bind(to_i32(job.pending, "pending")?)
        .bind(to_i32(job.done, "done")?)
        .bind(to_i32(job.succeeded, "succeeded")?)
        .bind(to_i32(job.failed, "failed")?)
        .bind(&reported)
        .bind(job.started_at)
        .bind(job.last_progress_at)
        .bind(job.expires_at)
        .bind(to_i64(job.version, "version")?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("download job {}", job.job_id)));
        }
        Ok(())
    }

    async fn replace_download_job(
        &self,
        job: &DownloadJob,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let reported: Vec<&str> = job.reported_units.iter().map(String::as_str).collect();
        let result = sqlx::query(
            r#"
            UPDATE download_jobs
               SET pending = $3,
                   done = $4,
                   succeeded = $5,
                   failed = $6,
                   reported_units = $7,
                   last_progress_at = $8,
                   version = $9
             WHERE job_id = $1
               AND version = $2
            "#,
        )
        .bind(job.job_id)
        .bind(to_i64(expected_version, "version")?)
        .bind(to_i32(job.pending, "pending")?)
        .bind(to_i32(job.done, "done")?)
        .bind(to_i32(job.succeeded, "succeeded")?)
        .bind(to_i32(job.failed, "failed")?)
        .bind(&reported)
        .bind(job.last_progress_at)
        .bind(to_i64(job.version, "version")?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_search_job(&self, search_id: Uuid) -> Result<Option<SearchJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SEARCH_COLUMNS} FROM search_jobs WHERE search_id = $1"
        ))
        .bind(search_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(search_from_row).transpose()
    }

    async fn insert_search_job(&self, job: &SearchJob) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO search_jobs ({SEARCH_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (search_id) DO NOTHING"
        ))
        .bind(job.search_id)
        .bind(&job.user_id)
        .bind(job.started_at)
        .bind(job.last_progress_at)
        .bind(to_i64(job.examined_count, "examined_count")?)
        .bind(to_i64(job.total_count, "total_count")?)
        .bind(&job.matched_game_ids)
        .bind(job.status.as_str())
        .bind(&job.cursor)
        .bind(job.expires_at)
        .bind(to_i64(job.version, "version")?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("search job {}", job.search_id)));
        }
        Ok(())
    }

    async fn replace_search_job(
        &self,
        job: &SearchJob,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE search_jobs
               SET last_progress_at = $3,
                   examined_count = $4,
                   matched_game_ids = $5,
                   status = $6,
                   cursor = $7,
                   version = $8
             WHERE search_id = $1
               AND version = $2
            "#,
        )
        .bind(job.search_id)
        .bind(to_i64(expected_version, "version")?)
        .bind(job.last_progress_at)
        .bind(to_i64(job.examined_count, "examined_count")?)
        .bind(&job.matched_game_ids)
        .bind(job.status.as_str())
        .bind(&job.cursor)
        .bind(to_i64(job.version, "version")?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Bounded-length deduplication key derived from arbitrary parts.
pub fn dedupe_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub group: String,
    pub dedupe_key: String,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: Uuid,
    pub receive_count: u32,
    pub message: QueueMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued,
    Deduplicated,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown or expired receipt {0}")]
    UnknownReceipt(Uuid),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// At-least-once delivery with per-group ordering and send-side deduplication.
///
/// A delivery that is neither acked nor nacked becomes visible again once its
/// visibility timeout elapses.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(
        &self,
        group: &str,
        dedupe_key: &str,
        payload: String,
    ) -> Result<SendOutcome, QueueError>;
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;
    async fn ack(&self, receipt: Uuid) -> Result<(), QueueError>;
    async fn nack(&self, receipt: Uuid) -> Result<(), QueueError>;
    /// Resolve when a message may be available or `timeout` elapses.
    async fn wait(&self, timeout: Duration);
    async fn is_idle(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub visibility_timeout: Duration,
    pub dedupe_window: Duration,
    pub max_receive_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            dedupe_window: Duration::from_secs(300),
            max_receive_count: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
}

#[derive(Debug)]
struct Queued {
    message: QueueMessage,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: QueueMessage,
    receive_count: u32,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Queued>,
    in_flight: HashMap<Uuid, InFlight>,
    seen: HashMap<String, Instant>,
    dead_letters: Vec<QueueMessage>,
}

impl QueueState {
    fn requeue(&mut self, message: QueueMessage, receive_count: u32, max_receive_count: u32) {
        if receive_count >= max_receive_count {
            warn!(
                group = %message.group,
                dedupe_key = %message.dedupe_key,
                receive_count,
                "message exceeded max receive count; moving to dead letters"
            );
            self.dead_letters.push(message);
        } else {
            self.ready.push_front(Queued {
                message,
                receive_count,
            });
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryWorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
            dead_letters: state.dead_letters.len(),
        }
    }

    pub async fn dead_letters(&self) -> Vec<QueueMessage> {
        self.state.lock().await.dead_letters.clone()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn send(
        &self,
        group: &str,
        dedupe_key: &str,
        payload: String,
    ) -> Result<SendOutcome, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let window = self.config.dedupe_window;
        state.seen.retain(|_, sent_at| now.duration_since(*sent_at) < window);
        if state.seen.contains_key(dedupe_key) {
            debug!(group, dedupe_key, "duplicate send suppressed");
            return Ok(SendOutcome::Deduplicated);
        }
        state.seen.insert(dedupe_key.to_string(), now);
        state.ready.push_back(Queued {
            message: QueueMessage {
                group: group.to_string(),
                dedupe_key: dedupe_key.to_string(),
                payload,
            },
            receive_count: 0,
        });
        drop(state);
        self.notify.notify_one();
        Ok(SendOutcome::Enqueued)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let expired: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(f) = state.in_flight.remove(&receipt) {
                state.requeue(f.message, f.receive_count, self.config.max_receive_count);
            }
        }

        let mut busy_groups: HashSet<String> = state
            .in_flight
            .values()
            .map(|f| f.message.group.clone())
            .collect();
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < state.ready.len() && out.len() < max {
            if busy_groups.contains(&state.ready[idx].message.group) {
                idx += 1;
                continue;
            }
            let Some(queued) = state.ready.remove(idx) else {
                break;
            };
            let receipt = Uuid::new_v4();
            let receive_count = queued.receive_count + 1;
            busy_groups.insert(queued.message.group.clone());
            state.in_flight.insert(
                receipt,
                InFlight {
                    message: queued.message.clone(),
                    receive_count,
                    visible_at: now + self.config.visibility_timeout,
                },
            );
            out.push(Delivery {
                receipt,
                receive_count,
                message: queued.message,
            });
        }
        Ok(out)
    }

    async fn ack(&self, receipt: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&receipt)
            .ok_or(QueueError::UnknownReceipt(receipt))?;
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn nack(&self, receipt: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let f = state
            .in_flight
            .remove(&receipt)
            .ok_or(QueueError::UnknownReceipt(receipt))?;
        state.requeue(f.message, f.receive_count, self.config.max_receive_count);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.ready.is_empty() && state.in_flight.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// chess.com answers parallel bursts with 429 and slow archive months with 408.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_scope_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_scope_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http fetcher is shutting down")]
    Closed,
}

/// Shared HTTP client with global and per-scope concurrency limits and retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    pub async fn get_json_bytes(
        &self,
        scope: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(scope, url, || {
            self.client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json")
        })
        .await
    }

    pub async fn post_json_bytes<B: Serialize + Sync>(
        &self,
        scope: &str,
        url: &str,
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(scope, url, || {
            self.client
                .post(url)
                .header(reqwest::header::ACCEPT, "application/json")
                .json(body)
        })
        .await
    }

    async fn execute<F>(
        &self,
        scope: &str,
        url: &str,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_scope = self.per_scope_semaphore(scope).await;
        let _scope = per_scope.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", scope, url);
        async {
            let mut attempt = 0;
            loop {
                match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(status = status.as_u16(), attempt, "retryable http status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
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
                            warn!(error = %err, attempt, "retryable request error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
