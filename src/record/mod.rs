//! Recording controller
//!
//! Drives one live recording: waits for the first playable chunk,
//! downloads startup, live and backfill chunks and key frames in order,
//! persists chunk-info pointers, and decides whether the recording ended
//! complete or with gaps.

mod fetch;

pub use fetch::{SpectatorApi, UpstreamClient};

use std::io::{Read, Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::storage::{ChunkInfo, GameInfo, Recording};
use crate::{Result, SpectrecError};

/// Common path prefix of the upstream spectator consumer API
pub const CONSUMER_PATH: &str = "/observer-mode/rest/consumer";

/// Pause before re-checking a game that the upstream does not know yet
const NOT_FOUND_WAIT: Duration = Duration::from_secs(10);

/// Platform id to spectator endpoint base URL
static PLATFORM_URLS: &[(&str, &str)] = &[
    ("NA1", "http://spectator.na.lol.riotgames.com:80"),
    ("OC1", "http://spectator.oc1.lol.riotgames.com:80"),
    ("EUN1", "http://spectator.eu.lol.riotgames.com:8088"),
    ("EUW1", "http://spectator.euw1.lol.riotgames.com:80"),
    ("KR", "http://spectator.kr.lol.riotgames.com:80"),
    ("BR1", "http://spectator.br.lol.riotgames.com:80"),
    ("LA1", "http://spectator.la1.lol.riotgames.com:80"),
    ("LA2", "http://spectator.la2.lol.riotgames.com:80"),
    ("RU", "http://spectator.ru.lol.riotgames.com:80"),
    ("TR1", "http://spectator.tr.lol.riotgames.com:80"),
    ("PBE1", "http://spectator.pbe1.lol.riotgames.com:8088"),
];

/// The spectator endpoint base URL for a platform id.
#[must_use]
pub fn platform_url(platform: &str) -> Option<&'static str> {
    PLATFORM_URLS
        .iter()
        .find(|(id, _)| *id == platform)
        .map(|(_, url)| *url)
}

/// Whether a platform id has an entry in the platform table.
#[must_use]
pub fn is_valid_platform(platform: &str) -> bool {
    platform_url(platform).is_some()
}

/// Fetch the current version of the specified platform.
pub async fn platform_version<A: SpectatorApi>(api: &A, platform: &str) -> Result<String> {
    let url = platform_url(platform)
        .ok_or(SpectrecError::UnknownPlatform)
        .map_err(|e| e.with_op("get platform version"))?;

    let bytes = api
        .fetch_bytes(&format!("{url}{CONSUMER_PATH}/version"))
        .await
        .map_err(|e| e.with_op("get platform version"))?;

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The subset of the upstream game metadata the controller needs.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
struct GameMetadata {
    #[serde(rename = "endStartupChunkId")]
    end_startup_chunk: i32,
    #[serde(rename = "lastChunkId")]
    last_chunk: i32,
}

/// Start a recording and block until it ends or an error occurs.
///
/// Partial data may be written to the recording even when recording was
/// unsuccessful; that partial data can usually still be played back.
pub async fn record<A, F>(
    api: Arc<A>,
    platform: &str,
    game_id: &str,
    encryption_key: &str,
    recording: Arc<Recording<F>>,
) -> Result<()>
where
    A: SpectatorApi + 'static,
    F: Read + Write + Seek + Send + 'static,
{
    run(api, platform, game_id, encryption_key, recording)
        .await
        .map_err(|e| e.with_op("record"))
}

async fn run<A, F>(
    api: Arc<A>,
    platform: &str,
    game_id: &str,
    encryption_key: &str,
    recording: Arc<Recording<F>>,
) -> Result<()>
where
    A: SpectatorApi + 'static,
    F: Read + Write + Seek + Send + 'static,
{
    let platform_url = platform_url(platform).ok_or(SpectrecError::UnknownPlatform)?;

    let resumption = recording.has_game_metadata();

    let version = platform_version(api.as_ref(), platform).await?;
    recording.store_game_info(GameInfo {
        platform: platform.to_string(),
        version,
        game_id: game_id.to_string(),
        encryption_key: encryption_key.to_string(),
        record_time: SystemTime::now(),
    })?;

    let recorder = Arc::new(Recorder {
        api,
        recording: Arc::clone(&recording),
        platform_url,
        platform: platform.to_string(),
        game_id: game_id.to_string(),
        gaps: AtomicBool::new(false),
    });

    if !resumption {
        recorder.wait_for_first_chunk().await?;
    }

    record_frames(&recorder, resumption).await?;

    // A first chunk beyond the start of live play means the beginning of
    // the game was never captured.
    let first = recording.first_chunk_info();
    if first.current_chunk != first.start_game_chunk {
        recorder.gaps.store(true, Ordering::Relaxed);
    }

    if recorder.gaps.load(Ordering::Relaxed) {
        debug!("recording {}_{} ended with gaps", platform, game_id);
    } else {
        recording.declare_complete()?;
    }

    Ok(())
}

struct Recorder<A, F> {
    api: Arc<A>,
    recording: Arc<Recording<F>>,
    platform_url: &'static str,
    platform: String,
    game_id: String,
    gaps: AtomicBool,
}

impl<A, F> Recorder<A, F>
where
    A: SpectatorApi + 'static,
    F: Read + Write + Seek + Send + 'static,
{
    /// Block until the game has progressed past its startup phase, then
    /// store the game metadata and the startup chunks.
    async fn wait_for_first_chunk(&self) -> Result<()> {
        let meta = loop {
            match self.retrieve_metadata().await {
                Ok((meta, _)) => break meta,
                Err(e) if e.is_not_found() => {
                    debug!(
                        "game {}_{} not available yet, waiting",
                        self.platform, self.game_id
                    );
                    tokio::time::sleep(NOT_FOUND_WAIT).await;
                }
                Err(e) => return Err(e),
            }
        };

        debug!(
            "game {}_{}: startup ends at chunk {}, last chunk {}",
            self.platform, self.game_id, meta.end_startup_chunk, meta.last_chunk
        );

        loop {
            let chunk = self.retrieve_last_chunk_info().await?;
            if chunk.current_chunk > meta.end_startup_chunk {
                break;
            }
            sleep_until_next_update(chunk.next_update).await;
        }

        // Fetch the metadata again now that the game is past startup, so
        // the stored copy reflects a playable game.
        let (_, data) = self.retrieve_metadata().await?;
        self.recording.store_game_metadata(&data[..])?;

        for i in 1..=meta.end_startup_chunk {
            loop {
                let chunk = self.retrieve_last_chunk_info().await?;
                if i > chunk.current_chunk {
                    sleep_until_next_update(chunk.next_update).await;
                    continue;
                }

                self.store_chunk(i).await?;
                break;
            }
        }

        Ok(())
    }

    /// Build and persist the first/last chunk info pair from an upstream
    /// chunk info. The first chunk info makes new spectator clients start
    /// from the beginning of the recording.
    fn store_chunk_info(
        &self,
        first_chunk_id: i32,
        first_key_frame: i32,
        upstream: ChunkInfo,
    ) -> Result<()> {
        let mut info = ChunkInfo {
            next_chunk: first_chunk_id,
            current_chunk: first_chunk_id,
            next_update: 0,
            start_game_chunk: upstream.start_game_chunk,
            current_key_frame: first_key_frame,
            end_game_chunk: upstream.current_chunk,
            available_since: 0,
            duration: 30_000,
            end_startup_chunk: upstream.end_startup_chunk,
        };

        self.recording.store_first_chunk_info(info)?;

        info.next_chunk = upstream.current_chunk;
        info.current_chunk = upstream.current_chunk;
        info.current_key_frame = upstream.current_key_frame;

        self.recording.store_last_chunk_info(info)?;

        Ok(())
    }

    /// Fetch and store one chunk. No-op for non-positive or already
    /// stored ids; a concurrent store of the same id counts as stored.
    async fn store_chunk(&self, id: i32) -> Result<()> {
        if id <= 0 {
            return Ok(());
        }

        if self.recording.has_chunk(id) {
            return Ok(());
        }

        let url = format!(
            "{}{CONSUMER_PATH}/getGameDataChunk/{}/{}/{}/token",
            self.platform_url, self.platform, self.game_id, id
        );
        let bytes = self
            .api
            .fetch_bytes(&url)
            .await
            .map_err(|e| e.with_op("chunk"))?;

        match self.recording.store_chunk(id, &bytes[..]) {
            Ok(()) | Err(SpectrecError::CannotModify) => Ok(()),
            Err(e) => Err(e.with_op("chunk")),
        }
    }

    /// Fetch and store one key frame. Same no-op rules as chunks.
    async fn store_key_frame(&self, id: i32) -> Result<()> {
        if id <= 0 {
            return Ok(());
        }

        if self.recording.has_key_frame(id) {
            return Ok(());
        }

        let url = format!(
            "{}{CONSUMER_PATH}/getKeyFrame/{}/{}/{}/token",
            self.platform_url, self.platform, self.game_id, id
        );
        let bytes = self
            .api
            .fetch_bytes(&url)
            .await
            .map_err(|e| e.with_op("key frame"))?;

        match self.recording.store_key_frame(id, &bytes[..]) {
            Ok(()) | Err(SpectrecError::CannotModify) => Ok(()),
            Err(e) => Err(e.with_op("key frame")),
        }
    }

    async fn retrieve_metadata(&self) -> Result<(GameMetadata, Vec<u8>)> {
        let url = format!(
            "{}{CONSUMER_PATH}/getGameMetaData/{}/{}/0/token",
            self.platform_url, self.platform, self.game_id
        );
        let bytes = self
            .api
            .fetch_bytes(&url)
            .await
            .map_err(|e| e.with_op("metadata"))?;

        let meta: GameMetadata = serde_json::from_slice(&bytes)
            .map_err(|e| SpectrecError::from(e).with_op("metadata"))?;

        Ok((meta, bytes))
    }

    async fn retrieve_last_chunk_info(&self) -> Result<ChunkInfo> {
        let url = format!(
            "{}{CONSUMER_PATH}/getLastChunkInfo/{}/{}/0/token",
            self.platform_url, self.platform, self.game_id
        );
        let bytes = self
            .api
            .fetch_bytes(&url)
            .await
            .map_err(|e| e.with_op("last chunk info"))?;

        let info: ChunkInfo = serde_json::from_slice(&bytes)
            .map_err(|e| SpectrecError::from(e).with_op("last chunk info"))?;

        Ok(info)
    }
}

/// The live recording loop: polls the upstream chunk info and stores
/// every chunk and key frame it advertises until the game ends.
async fn record_frames<A, F>(recorder: &Arc<Recorder<A, F>>, mut resumption: bool) -> Result<()>
where
    A: SpectatorApi + 'static,
    F: Read + Write + Seek + Send + 'static,
{
    let mut first_chunk_id = 0;
    let mut first_key_frame = 0;
    let mut last_chunk_id = 0;
    let mut last_key_frame = 0;

    if resumption {
        let first = recorder.recording.first_chunk_info();
        first_chunk_id = first.current_chunk;
        first_key_frame = first.current_key_frame;

        let last = recorder.recording.last_chunk_info();
        last_chunk_id = last.current_chunk;
        last_key_frame = last.current_key_frame;
    }

    loop {
        let chunk = recorder.retrieve_last_chunk_info().await?;

        if resumption {
            last_chunk_id = chunk.current_chunk;
            last_key_frame = chunk.current_key_frame;

            // Backfill whatever the interrupted run missed, newest first.
            // The stored-id guards make these idempotent against the
            // foreground loop.
            let backfill = Arc::clone(recorder);
            tokio::spawn(async move {
                for i in (chunk.start_game_chunk..=chunk.current_chunk).rev() {
                    if let Err(e) = backfill.store_chunk(i).await {
                        warn!("chunk backfill stopped at {}: {}", i, e);
                        backfill.gaps.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            });

            let backfill = Arc::clone(recorder);
            tokio::spawn(async move {
                for i in (1..=chunk.current_key_frame).rev() {
                    if let Err(e) = backfill.store_key_frame(i).await {
                        warn!("key frame backfill stopped at {}: {}", i, e);
                        backfill.gaps.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            });

            resumption = false;
        }

        if first_chunk_id == 0 {
            first_chunk_id = chunk.start_game_chunk.max(chunk.current_chunk);
            first_key_frame = chunk.current_key_frame.max(1);
            last_chunk_id = chunk.current_chunk;
            last_key_frame = chunk.current_key_frame;

            recorder.store_chunk(chunk.current_chunk).await?;
            recorder.store_key_frame(chunk.current_key_frame).await?;
        }

        if chunk.start_game_chunk > first_chunk_id {
            first_chunk_id = chunk.start_game_chunk;
        }

        for i in (last_chunk_id + 1)..=chunk.current_chunk {
            recorder.store_chunk(i).await?;
        }

        // An out-of-order hint from the upstream points at a chunk behind
        // the current one.
        if chunk.next_chunk > 0 && chunk.next_chunk < chunk.current_chunk {
            recorder.store_chunk(chunk.next_chunk).await?;
        }

        for i in (last_key_frame + 1)..=chunk.current_key_frame {
            recorder.store_key_frame(i).await?;
        }

        recorder.store_chunk_info(first_chunk_id, first_key_frame, chunk)?;

        last_chunk_id = chunk.current_chunk;
        last_key_frame = chunk.current_key_frame;

        if chunk.end_game_chunk == chunk.current_chunk {
            return Ok(());
        }

        sleep_until_next_update(chunk.next_update).await;
    }
}

/// Sleep until the upstream advertises the next chunk, with a second of
/// slack.
async fn sleep_until_next_update(next_update: i32) {
    let millis = next_update.max(0) as u64;
    tokio::time::sleep(Duration::from_millis(millis) + Duration::from_secs(1)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct NeverApi;

    impl SpectatorApi for NeverApi {
        async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>> {
            Err(SpectrecError::NotFound)
        }
    }

    fn test_recorder() -> Recorder<NeverApi, Cursor<Vec<u8>>> {
        Recorder {
            api: Arc::new(NeverApi),
            recording: Arc::new(Recording::new(Cursor::new(Vec::new())).unwrap()),
            platform_url: "http://spectator.example:80",
            platform: "NA1".to_string(),
            game_id: "42".to_string(),
            gaps: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_platform_table() {
        assert!(is_valid_platform("NA1"));
        assert!(is_valid_platform("PBE1"));
        assert!(!is_valid_platform("XX9"));
        assert_eq!(
            platform_url("EUN1"),
            Some("http://spectator.eu.lol.riotgames.com:8088")
        );
    }

    #[tokio::test]
    async fn test_unknown_platform() {
        let rec = Arc::new(Recording::new(Cursor::new(Vec::new())).unwrap());
        let err = record(Arc::new(NeverApi), "XX9", "1", "key", rec)
            .await
            .unwrap_err();

        assert!(matches!(err.root(), SpectrecError::UnknownPlatform));
    }

    #[tokio::test]
    async fn test_store_chunk_ignores_non_positive_ids() {
        let recorder = test_recorder();

        // Would hit NeverApi and fail if these were fetched.
        recorder.store_chunk(0).await.unwrap();
        recorder.store_chunk(-3).await.unwrap();
        recorder.store_key_frame(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_chunk_info_synthesis() {
        let recorder = test_recorder();

        let upstream = ChunkInfo {
            current_chunk: 9,
            current_key_frame: 4,
            start_game_chunk: 3,
            end_startup_chunk: 2,
            end_game_chunk: 0,
            next_chunk: 10,
            next_update: 3000,
            available_since: 120,
            duration: 30_000,
        };

        recorder.store_chunk_info(3, 1, upstream).unwrap();

        let first = recorder.recording.first_chunk_info();
        assert_eq!(first.current_chunk, 3);
        assert_eq!(first.next_chunk, 3);
        assert_eq!(first.current_key_frame, 1);
        assert_eq!(first.next_update, 0);
        assert_eq!(first.available_since, 0);
        assert_eq!(first.duration, 30_000);
        assert_eq!(first.end_game_chunk, 9);
        assert_eq!(first.start_game_chunk, 3);
        assert_eq!(first.end_startup_chunk, 2);

        let last = recorder.recording.last_chunk_info();
        assert_eq!(last.current_chunk, 9);
        assert_eq!(last.next_chunk, 9);
        assert_eq!(last.current_key_frame, 4);
        assert_eq!(last.end_game_chunk, 9);
    }
}
