//! End-to-end recording and replay scenarios

use std::collections::VecDeque;
use std::io::Cursor;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::{header, Method, Request, StatusCode};
use parking_lot::Mutex;
use tempfile::TempDir;

use spectrec::monitor::{GameAnnouncement, Monitor};
use spectrec::record::{self, SpectatorApi};
use spectrec::registry::RecordingRegistry;
use spectrec::replay::ReplayRouter;
use spectrec::storage::{ChunkInfo, Recording};
use spectrec::{Result, SpectrecError};

/// A fake upstream that replays a scripted sequence of chunk infos and
/// serves `C<i>` / `K<i>` as chunk and key frame payloads.
struct ScriptedApi {
    metadata: Vec<u8>,
    chunk_infos: Mutex<VecDeque<ChunkInfo>>,
    last_chunk_info: Mutex<Option<ChunkInfo>>,
    fetched_chunks: Mutex<Vec<i32>>,
    fetched_key_frames: Mutex<Vec<i32>>,
}

impl ScriptedApi {
    fn new(metadata: &str, script: Vec<ChunkInfo>) -> Self {
        Self {
            metadata: metadata.as_bytes().to_vec(),
            chunk_infos: Mutex::new(script.into()),
            last_chunk_info: Mutex::new(None),
            fetched_chunks: Mutex::new(Vec::new()),
            fetched_key_frames: Mutex::new(Vec::new()),
        }
    }

    fn next_chunk_info(&self) -> ChunkInfo {
        let mut queue = self.chunk_infos.lock();
        let mut last = self.last_chunk_info.lock();

        match queue.pop_front() {
            Some(info) => {
                *last = Some(info);
                info
            }
            // Keep answering with the final state once the script ends.
            None => last.unwrap_or_default(),
        }
    }
}

fn trailing_id(url: &str) -> i32 {
    url.rsplit('/').nth(1).and_then(|s| s.parse().ok()).unwrap()
}

impl SpectatorApi for ScriptedApi {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        if url.ends_with("/version") {
            return Ok(b"4.12.0.123".to_vec());
        }

        if url.contains("/getGameMetaData/") {
            return Ok(self.metadata.clone());
        }

        if url.contains("/getLastChunkInfo/") {
            let info = self.next_chunk_info();
            return Ok(serde_json::to_vec(&info)?);
        }

        if url.contains("/getGameDataChunk/") {
            let id = trailing_id(url);
            self.fetched_chunks.lock().push(id);
            return Ok(format!("C{id}").into_bytes());
        }

        if url.contains("/getKeyFrame/") {
            let id = trailing_id(url);
            self.fetched_key_frames.lock().push(id);
            return Ok(format!("K{id}").into_bytes());
        }

        Err(SpectrecError::NotFound)
    }
}

fn script_entry(current: i32, key_frame: i32) -> ChunkInfo {
    ChunkInfo {
        current_chunk: current,
        current_key_frame: key_frame,
        next_chunk: current + 1,
        start_game_chunk: 3,
        end_startup_chunk: 2,
        end_game_chunk: 5,
        next_update: 0,
        available_since: 0,
        duration: 30_000,
    }
}

#[tokio::test(start_paused = true)]
async fn test_record_happy_path() {
    let api = Arc::new(ScriptedApi::new(
        r#"{"endStartupChunkId": 2, "lastChunkId": 5, "gameId": 42}"#,
        vec![
            // Waiting for the game to progress past startup.
            script_entry(1, 1),
            script_entry(2, 1),
            script_entry(3, 1),
            // Startup chunk polls.
            script_entry(3, 1),
            script_entry(3, 1),
            // Live loop.
            script_entry(3, 1),
            script_entry(4, 2),
            script_entry(5, 3),
        ],
    ));

    let rec = Arc::new(Recording::new(Cursor::new(Vec::new())).unwrap());

    record::record(Arc::clone(&api), "NA1", "42", "secret", Arc::clone(&rec))
        .await
        .unwrap();

    for i in 1..=5 {
        assert!(rec.has_chunk(i), "chunk {i} missing");
        let mut chunk = Vec::new();
        rec.retrieve_chunk_to(i, &mut chunk).unwrap();
        assert_eq!(chunk, format!("C{i}").as_bytes());
    }
    assert!(!rec.has_chunk(6));

    for i in 1..=3 {
        assert!(rec.has_key_frame(i), "key frame {i} missing");
    }

    assert!(rec.is_complete());
    assert!(rec.has_game_metadata());

    let info = rec.game_info();
    assert_eq!(info.platform, "NA1");
    assert_eq!(info.game_id, "42");
    assert_eq!(info.version, "4.12.0.123");
    assert_eq!(info.encryption_key, "secret");

    let first = rec.first_chunk_info();
    assert_eq!(first.current_chunk, 3);
    assert_eq!(first.start_game_chunk, 3);
    assert_eq!(first.next_update, 0);
    assert_eq!(first.duration, 30_000);

    let last = rec.last_chunk_info();
    assert_eq!(last.current_chunk, 5);
    assert_eq!(last.current_key_frame, 3);

    let mut chunk = Vec::new();
    rec.retrieve_chunk_to(4, &mut chunk).unwrap();
    assert_eq!(chunk, b"C4");

    // The loop terminated on the response whose endGameChunkId equals its
    // chunkId, without polling again.
    assert!(api.chunk_infos.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resumption_skips_stored_chunks() {
    // A previously interrupted recording holding chunks 1..3 and key
    // frame 1.
    let rec = Arc::new(Recording::new(Cursor::new(Vec::new())).unwrap());
    rec.store_game_metadata(&b"{\"gameId\": 42}"[..]).unwrap();
    for i in 1..=3 {
        rec.store_chunk(i, format!("C{i}").as_bytes()).unwrap();
    }
    rec.store_key_frame(1, &b"K1"[..]).unwrap();
    rec.store_first_chunk_info(ChunkInfo {
        current_chunk: 1,
        current_key_frame: 1,
        start_game_chunk: 1,
        end_game_chunk: 3,
        duration: 30_000,
        ..Default::default()
    })
    .unwrap();
    rec.store_last_chunk_info(ChunkInfo {
        current_chunk: 3,
        current_key_frame: 1,
        start_game_chunk: 1,
        end_game_chunk: 3,
        duration: 30_000,
        ..Default::default()
    })
    .unwrap();
    assert!(!rec.is_complete());

    let resume_entry = |current: i32, key_frame: i32| ChunkInfo {
        current_chunk: current,
        current_key_frame: key_frame,
        next_chunk: current + 1,
        start_game_chunk: 1,
        end_startup_chunk: 0,
        end_game_chunk: 5,
        next_update: 0,
        available_since: 0,
        duration: 30_000,
    };

    let api = Arc::new(ScriptedApi::new(
        r#"{"endStartupChunkId": 0, "lastChunkId": 5}"#,
        vec![resume_entry(4, 2), resume_entry(5, 3)],
    ));

    record::record(Arc::clone(&api), "NA1", "42", "secret", Arc::clone(&rec))
        .await
        .unwrap();

    // Give the backfill tasks a beat to drain.
    tokio::time::sleep(Duration::from_millis(10)).await;

    for i in 1..=5 {
        assert!(rec.has_chunk(i), "chunk {i} missing");
    }
    for i in 1..=3 {
        assert!(rec.has_key_frame(i), "key frame {i} missing");
    }

    // Chunks already on disk were never re-fetched.
    let fetched = api.fetched_chunks.lock().clone();
    assert!(
        fetched.iter().all(|id| *id >= 4),
        "re-fetched stored chunks: {fetched:?}"
    );
    assert!(api.fetched_key_frames.lock().iter().all(|id| *id >= 2));

    // The recording picked up where it left off and finished cleanly.
    assert!(rec.is_complete());
    assert_eq!(rec.last_chunk_info().current_chunk, 5);
    assert_eq!(rec.first_chunk_info().current_chunk, 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_join_leaves_gaps() {
    // The game is already at chunk 5 when recording starts; chunks 3 and
    // 4 of live play are never seen.
    let api = Arc::new(ScriptedApi::new(
        r#"{"endStartupChunkId": 2, "lastChunkId": 5}"#,
        vec![
            script_entry(5, 3),
            script_entry(5, 3),
            script_entry(5, 3),
            script_entry(5, 3),
        ],
    ));

    let rec = Arc::new(Recording::new(Cursor::new(Vec::new())).unwrap());

    record::record(Arc::clone(&api), "NA1", "42", "secret", Arc::clone(&rec))
        .await
        .unwrap();

    assert!(rec.has_chunk(5));
    assert!(!rec.has_chunk(4));

    // The first served chunk is past the start of live play, so the
    // recording must not claim completeness.
    assert!(!rec.is_complete());
    assert_eq!(rec.first_chunk_info().current_chunk, 5);
    assert_eq!(rec.first_chunk_info().start_game_chunk, 3);
}

#[tokio::test(start_paused = true)]
async fn test_record_then_replay_over_http() {
    let api = Arc::new(ScriptedApi::new(
        r#"{"endStartupChunkId": 2, "lastChunkId": 5, "gameId": 42}"#,
        vec![
            script_entry(1, 1),
            script_entry(2, 1),
            script_entry(3, 1),
            script_entry(3, 1),
            script_entry(3, 1),
            script_entry(3, 1),
            script_entry(4, 2),
            script_entry(5, 3),
        ],
    ));

    let dir = TempDir::new().unwrap();
    let registry = Arc::new(RecordingRegistry::new(10));
    let monitor = Monitor::new(
        Arc::clone(&registry),
        Arc::clone(&api),
        dir.path().to_path_buf(),
    );

    let handle = monitor
        .handle_announcement(GameAnnouncement {
            platform: "NA1".to_string(),
            game_id: "42".to_string(),
            encryption_key: "secret".to_string(),
            game_info: serde_json::json!({"gameId": 42, "mapId": 11}),
        })
        .unwrap();
    handle.await.unwrap();

    // The finished recording is visible and replayable.
    let rec = registry.lookup("NA1_42").unwrap();
    assert!(rec.is_complete());

    let router = ReplayRouter::new(Arc::clone(&registry), api);
    let client_ip: IpAddr = "10.0.0.1".parse().unwrap();

    let get = |path: &str| {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(())
            .unwrap()
    };

    let response = router
        .handle(
            get("/observer-mode/rest/consumer/getGameMetaData/NA1/42/0/token"),
            client_ip,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

    let response = router
        .handle(
            get("/observer-mode/rest/consumer/getGameDataChunk/NA1/42/4/token"),
            client_ip,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"C4");

    // A fresh spectator is pointed at the first chunk.
    let response = router
        .handle(
            get("/observer-mode/rest/consumer/getLastChunkInfo/NA1/42/0/token"),
            client_ip,
        )
        .await;
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let info: ChunkInfo = serde_json::from_slice(&body).unwrap();
    assert_eq!(info.current_chunk, 3);

    // The stored user metadata round-trips.
    let game_info: serde_json::Value = rec.retrieve_user_metadata().unwrap();
    assert_eq!(game_info["mapId"], 11);
}
