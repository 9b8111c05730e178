use std::sync::Arc;
use std::time::Duration;

use chessfinder_adapters::{FixtureBoardMatcher, FixtureRemoteSource, RemoteGame};
use chessfinder_core::{Platform, SearchStatus};
use chessfinder_storage::{
    InMemoryRecordStore, InMemoryWorkQueue, QueueConfig, RecordStore, WorkQueue,
};
use chessfinder_sync::{Engine, EngineConfig, EngineError};

struct Harness {
    engine: Engine,
    store: InMemoryRecordStore,
    queue: Arc<InMemoryWorkQueue>,
    remote: FixtureRemoteSource,
}

fn harness() -> Harness {
    let store = InMemoryRecordStore::new();
    let queue = Arc::new(InMemoryWorkQueue::new(QueueConfig::default()));
    let remote = FixtureRemoteSource::new("https://api.chess.com");
    let config = EngineConfig {
        search_page_size: 2,
        match_quota: 10,
        worker_concurrency: 4,
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        config,
        Arc::new(store.clone()),
        queue.clone(),
        Arc::new(remote.clone()),
        Arc::new(FixtureBoardMatcher::new()),
    );
    Harness {
        engine,
        store,
        queue,
        remote,
    }
}

fn game(id: &str, end: i64, pgn: &str) -> RemoteGame {
    RemoteGame {
        game_id: format!("https://www.chess.com/game/live/{id}"),
        pgn: pgn.to_string(),
        end_timestamp: end,
    }
}

#[tokio::test]
async fn download_then_search_reaches_terminal_state() {
    let h = harness();
    h.remote.add_profile("tal", "tal-id").await;
    h.remote
        .put_games(
            "tal",
            2022,
            8,
            vec![game("1", 100, "1. e4 e5 2. Qh5"), game("2", 200, "1. d4 d5")],
        )
        .await;
    h.remote
        .put_games("tal", 2022, 9, vec![game("3", 300, "1. e4 c5 2. Qh5")])
        .await;

    let started = h
        .engine
        .start_download("tal", Platform::ChessDotCom)
        .await
        .expect("start download");
    assert_eq!(started.total, 2);

    let stats = h.engine.worker().drain().await.expect("drain downloads");
    assert_eq!(stats.acked, 2);

    let job = h
        .engine
        .download_status(started.download_id)
        .await
        .expect("download status");
    assert_eq!((job.pending, job.succeeded, job.failed), (0, 2, 0));
    assert_eq!(h.store.game_count("tal-id").await, 3);

    let search = h
        .engine
        .start_search("tal", Platform::ChessDotCom, "Qh5")
        .await
        .expect("start search");
    assert_eq!(search.total, 3);
    h.engine.worker().drain().await.expect("drain search");

    let result = h
        .engine
        .search_status(search.search_id)
        .await
        .expect("search status");
    assert_eq!(result.status, SearchStatus::SearchedAll);
    assert_eq!(result.examined_count, 3);
    assert_eq!(result.matched_game_ids.len(), 2);
    assert!(h.queue.is_idle().await);
}

#[tokio::test]
async fn second_download_skips_closed_archives() {
    let h = harness();
    h.remote.add_profile("tal", "tal-id").await;
    h.remote
        .put_games("tal", 2022, 8, vec![game("1", 100, "1. e4")])
        .await;

    h.engine
        .start_download("tal", Platform::ChessDotCom)
        .await
        .expect("first download");
    h.engine.worker().drain().await.expect("drain");

    let again = h
        .engine
        .start_download("tal", Platform::ChessDotCom)
        .await
        .expect("second download");
    assert_eq!(again.total, 0);
    let job = h
        .engine
        .download_status(again.download_id)
        .await
        .expect("status");
    assert!(job.is_complete());
}

#[tokio::test]
async fn request_errors_carry_business_codes() {
    let h = harness();

    let missing = h
        .engine
        .start_download("ghost", Platform::ChessDotCom)
        .await
        .expect_err("unknown profile");
    assert_eq!(missing.code(), "PROFILE_NOT_FOUND");

    h.remote.set_overloaded(true).await;
    let overloaded = h
        .engine
        .start_download("tal", Platform::ChessDotCom)
        .await
        .expect_err("overloaded");
    assert_eq!(overloaded.code(), "SERVICE_OVERLOADED");
    h.remote.set_overloaded(false).await;

    let not_cached = h
        .engine
        .start_search("tal", Platform::ChessDotCom, "Qh5")
        .await
        .expect_err("not cached");
    assert_eq!(not_cached.code(), "PROFILE_IS_NOT_CACHED");

    let invalid = h
        .engine
        .start_search("tal", Platform::ChessDotCom, "   ")
        .await
        .expect_err("invalid board");
    assert!(matches!(invalid, EngineError::InvalidSearchBoard));

    h.remote.add_profile("tal", "tal-id").await;
    h.engine
        .start_download("tal", Platform::ChessDotCom)
        .await
        .expect("empty download");
    let no_games = h
        .engine
        .start_search("tal", Platform::ChessDotCom, "Qh5")
        .await
        .expect_err("no games");
    assert_eq!(no_games.code(), "NO_GAME_AVAILABLE");

    let unknown = h
        .engine
        .search_status(uuid::Uuid::new_v4())
        .await
        .expect_err("unknown search");
    assert_eq!(unknown.code(), "SEARCH_NOT_FOUND");
}

#[tokio::test]
async fn unavailable_store_sends_messages_to_dead_letters() {
    let h = harness();
    h.remote.add_profile("tal", "tal-id").await;
    h.remote
        .put_games("tal", 2022, 8, vec![game("1", 100, "1. e4")])
        .await;
    let started = h
        .engine
        .start_download("tal", Platform::ChessDotCom)
        .await
        .expect("start");

    h.store.set_unavailable(true);
    let stats = h
        .engine
        .worker()
        .with_poll_interval(Duration::from_millis(5))
        .drain()
        .await
        .expect("drain");
    assert_eq!(stats.nacked, QueueConfig::default().max_receive_count as usize);
    assert_eq!(h.queue.dead_letters().await.len(), 1);

    h.store.set_unavailable(false);
    let job = h
        .store
        .get_download_job(started.download_id)
        .await
        .expect("get")
        .expect("job");
    assert_eq!(job.pending, 1);
}
