//! Remote data source, board matcher and PGN normalisation adapters.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chessfinder_storage::{FetchError, HttpFetcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "chessfinder-adapters";

pub const CHESS_DOT_COM_SCOPE: &str = "chess.com";
pub const MATCHER_SCOPE: &str = "matcher";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote profile {0:?} not found")]
    NotFound(String),
    #[error("remote service overloaded: {0}")]
    Overloaded(String),
    #[error("remote request failed: {0}")]
    Request(String),
    #[error("could not decode remote payload: {0}")]
    Decode(String),
}

/// One game as listed by the remote archive-month endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteGame {
    pub game_id: String,
    pub pgn: String,
    pub end_timestamp: i64,
}

/// Read-only view of the remote service a profile is mirrored from.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Resolve the remote user id for `username`.
    async fn lookup_profile(&self, username: &str) -> Result<String, RemoteError>;
    /// Archive identifiers, each ending in `/YYYY/MM`.
    async fn list_archives(&self, username: &str) -> Result<Vec<String>, RemoteError>;
    async fn list_games(
        &self,
        username: &str,
        year: i32,
        month: u32,
    ) -> Result<Vec<RemoteGame>, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct ProfileBody {
    #[serde(rename = "@id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ArchivesBody {
    #[serde(default)]
    archives: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GamesBody {
    #[serde(default)]
    games: Vec<GameBody>,
}

#[derive(Debug, Deserialize)]
struct GameBody {
    url: String,
    #[serde(default)]
    pgn: String,
    end_time: i64,
}

/// chess.com public API over the shared [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct ChessDotComSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl ChessDotComSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn profile_url(&self, username: &str) -> String {
        format!("{}/pub/player/{}", self.base_url, username)
    }

    pub fn archives_url(&self, username: &str) -> String {
        format!("{}/pub/player/{}/games/archives", self.base_url, username)
    }

    pub fn games_url(&self, username: &str, year: i32, month: u32) -> String {
        format!("{}/pub/player/{}/games/{:04}/{:02}", self.base_url, username, year, month)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        username: &str,
        url: &str,
    ) -> Result<T, RemoteError> {
        let response = self
            .http
            .get_json_bytes(CHESS_DOT_COM_SCOPE, url)
            .await
            .map_err(|err| remote_error(username, err))?;
        serde_json::from_slice(&response.body)
            .map_err(|e| RemoteError::Decode(format!("{url}: {e}")))
    }
}

fn remote_error(username: &str, err: FetchError) -> RemoteError {
    match err {
        FetchError::HttpStatus { status: 404, .. } => RemoteError::NotFound(username.to_string()),
        FetchError::HttpStatus { status, url } => {
            RemoteError::Overloaded(format!("status {status} from {url}"))
        }
        other => RemoteError::Request(other.to_string()),
    }
}

#[async_trait]
impl RemoteSource for ChessDotComSource {
    async fn lookup_profile(&self, username: &str) -> Result<String, RemoteError> {
        let profile: ProfileBody = self.get(username, &self.profile_url(username)).await?;
        Ok(profile.id)
    }

    async fn list_archives(&self, username: &str) -> Result<Vec<String>, RemoteError> {
        let body: ArchivesBody = self.get(username, &self.archives_url(username)).await?;
        Ok(body.archives)
    }

    async fn list_games(
        &self,
        username: &str,
        year: i32,
        month: u32,
    ) -> Result<Vec<RemoteGame>, RemoteError> {
        let body: GamesBody = self.get(username, &self.games_url(username, year, month)).await?;
        debug!(username, year, month, games = body.games.len(), "listed remote games");
        Ok(body
            .games
            .into_iter()
            .map(|g| RemoteGame {
                game_id: g.url,
                pgn: unwrap_quoted(&g.pgn).to_string(),
                end_timestamp: g.end_time,
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct FixtureState {
    profiles: HashMap<String, String>,
    archives: HashMap<String, BTreeMap<(i32, u32), Vec<RemoteGame>>>,
    overloaded: bool,
    failing_months: HashSet<(String, i32, u32)>,
}

/// In-memory remote source for tests and offline runs. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FixtureRemoteSource {
    base_url: String,
    state: Arc<RwLock<FixtureState>>,
}

impl FixtureRemoteSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            state: Arc::default(),
        }
    }

    pub fn archive_id(&self, username: &str, year: i32, month: u32) -> String {
        format!("{}/pub/player/{}/games/{:04}/{:02}", self.base_url, username, year, month)
    }

    pub async fn add_profile(&self, username: &str, remote_user_id: &str) {
        let mut state = self.state.write().await;
        state
            .profiles
            .insert(username.to_string(), remote_user_id.to_string());
        state.archives.entry(username.to_string()).or_default();
    }

    /// Replace the games of one archive-month, creating the month if needed.
    pub async fn put_games(&self, username: &str, year: i32, month: u32, games: Vec<RemoteGame>) {
        let mut state = self.state.write().await;
        state
            .archives
            .entry(username.to_string())
            .or_default()
            .insert((year, month), games);
    }

    pub async fn set_overloaded(&self, overloaded: bool) {
        self.state.write().await.overloaded = overloaded;
    }

    pub async fn fail_month(&self, username: &str, year: i32, month: u32) {
        self.state
            .write()
            .await
            .failing_months
            .insert((username.to_string(), year, month));
    }
}

#[async_trait]
impl RemoteSource for FixtureRemoteSource {
    async fn lookup_profile(&self, username: &str) -> Result<String, RemoteError> {
        let state = self.state.read().await;
        if state.overloaded {
            return Err(RemoteError::Overloaded("fixture overloaded".to_string()));
        }
        state
            .profiles
            .get(username)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(username.to_string()))
    }

    async fn list_archives(&self, username: &str) -> Result<Vec<String>, RemoteError> {
        let state = self.state.read().await;
        if state.overloaded {
            return Err(RemoteError::Overloaded("fixture overloaded".to_string()));
        }
        let months = state
            .archives
            .get(username)
            .ok_or_else(|| RemoteError::NotFound(username.to_string()))?;
        Ok(months
            .keys()
            .map(|(year, month)| self.archive_id(username, *year, *month))
            .collect())
    }

    async fn list_games(
        &self,
        username: &str,
        year: i32,
        month: u32,
    ) -> Result<Vec<RemoteGame>, RemoteError> {
        let state = self.state.read().await;
        if state.overloaded || state.failing_months.contains(&(username.to_string(), year, month)) {
            return Err(RemoteError::Overloaded(format!("{username} {year}/{month:02}")));
        }
        Ok(state
            .archives
            .get(username)
            .and_then(|months| months.get(&(year, month)))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("board matcher unavailable: {0}")]
    Unavailable(String),
    #[error("board matcher returned an unreadable answer: {0}")]
    Decode(String),
}

/// Opaque position matching capability.
#[async_trait]
pub trait BoardMatcher: Send + Sync {
    async fn validate(&self, board: &str) -> Result<bool, MatchError>;
    async fn matches(&self, board: &str, pgn: &str) -> Result<bool, MatchError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateRequest<'a> {
    board: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    is_valid: bool,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Serialize)]
struct MatchRequest<'a> {
    board: &'a str,
    pgn: &'a str,
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    matched: bool,
}

/// Matcher delegated to an HTTP service exposing `POST /validate` and `POST /match`.
#[derive(Debug, Clone)]
pub struct HttpBoardMatcher {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl HttpBoardMatcher {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, MatchError>
    where
        Req: Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post_json_bytes(MATCHER_SCOPE, &url, body)
            .await
            .map_err(|e| MatchError::Unavailable(e.to_string()))?;
        serde_json::from_slice(&response.body).map_err(|e| MatchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BoardMatcher for HttpBoardMatcher {
    async fn validate(&self, board: &str) -> Result<bool, MatchError> {
        let response: ValidateResponse = self.post("/validate", &ValidateRequest { board }).await?;
        if let Some(comment) = response.comment.as_deref().filter(|_| !response.is_valid) {
            debug!(board, comment, "board rejected by matcher");
        }
        Ok(response.is_valid)
    }

    async fn matches(&self, board: &str, pgn: &str) -> Result<bool, MatchError> {
        let response: MatchResponse = self.post("/match", &MatchRequest { board, pgn }).await?;
        Ok(response.matched)
    }
}

/// Deterministic matcher: a game matches when its PGN contains the board text.
///
/// Any PGN containing one of the configured poison markers fails with
/// [`MatchError::Unavailable`].
#[derive(Debug, Clone, Default)]
pub struct FixtureBoardMatcher {
    poison: Vec<String>,
}

impl FixtureBoardMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.poison.push(marker.into());
        self
    }
}

#[async_trait]
impl BoardMatcher for FixtureBoardMatcher {
    async fn validate(&self, board: &str) -> Result<bool, MatchError> {
        Ok(!board.trim().is_empty())
    }

    async fn matches(&self, board: &str, pgn: &str) -> Result<bool, MatchError> {
        if let Some(marker) = self.poison.iter().find(|m| pgn.contains(m.as_str())) {
            warn!(marker, "fixture matcher poisoned");
            return Err(MatchError::Unavailable(format!("poisoned by {marker}")));
        }
        Ok(pgn.contains(board))
    }
}

/// Strip one pair of surrounding double quotes, if present.
pub fn unwrap_quoted(pgn: &str) -> &str {
    pgn.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(pgn)
}

static COMMENTS_AND_VARIATIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\{[^}]*\})|\([^)]*\)").expect("static regex is valid"));

static BLACK_MOVE_NUMBERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\.\.\s+").expect("static regex is valid"));

/// Normalisation applied to PGN text before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PgnFilter {
    Identity,
    #[default]
    Squeeze,
}

impl PgnFilter {
    pub fn apply(&self, pgn: &str) -> String {
        match self {
            PgnFilter::Identity => pgn.to_string(),
            PgnFilter::Squeeze => squeeze_pgn(pgn),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown pgn filter {0:?}; expected identity or squeeze")]
pub struct UnknownPgnFilter(pub String);

impl FromStr for PgnFilter {
    type Err = UnknownPgnFilter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" => Ok(PgnFilter::Identity),
            "squeeze" => Ok(PgnFilter::Squeeze),
            other => Err(UnknownPgnFilter(other.to_string())),
        }
    }
}

/// Movetext only: no tag pairs, comments, variations or `N...` markers, single-spaced.
pub fn squeeze_pgn(pgn: &str) -> String {
    let movetext = pgn
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('['))
        .collect::<Vec<_>>()
        .join("\n");
    let movetext = COMMENTS_AND_VARIATIONS.replace_all(&movetext, "");
    let movetext = BLACK_MOVE_NUMBERS.replace_all(&movetext, "");
    movetext.split_whitespace().collect::<Vec<_>>().join(" ")
}
