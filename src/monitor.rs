//! Recording supervision
//!
//! Turns announcements of active games into supervised recording tasks:
//! reserves the registry key, creates or reopens the on-disk recording,
//! promotes it, runs the controller, and demotes the entry when the
//! controller returns, fails or panics.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::record::{self, SpectatorApi};
use crate::registry::{key_for, RecordingRegistry, ReserveOutcome};
use crate::storage::{Recording, RECORDING_EXTENSION};

/// An active game discovered by the player poller.
#[derive(Debug, Clone)]
pub struct GameAnnouncement {
    /// Upstream platform id
    pub platform: String,
    /// Numeric game id as a string
    pub game_id: String,
    /// Encryption key for the game's chunk payloads
    pub encryption_key: String,
    /// The raw game info object from the poller, stored with the
    /// recording as user metadata
    pub game_info: serde_json::Value,
}

/// Supervises one recording task per announced game.
pub struct Monitor<A> {
    registry: Arc<RecordingRegistry>,
    api: Arc<A>,
    recordings_dir: PathBuf,
}

impl<A> Clone for Monitor<A> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            api: Arc::clone(&self.api),
            recordings_dir: self.recordings_dir.clone(),
        }
    }
}

impl<A: SpectatorApi + 'static> Monitor<A> {
    /// Create a monitor writing recordings into `recordings_dir`.
    pub fn new(registry: Arc<RecordingRegistry>, api: Arc<A>, recordings_dir: PathBuf) -> Self {
        Self {
            registry,
            api,
            recordings_dir,
        }
    }

    /// React to an announced game. Returns the handle of the spawned
    /// recording task, or `None` when the game is already being handled
    /// or already complete.
    pub fn handle_announcement(&self, announcement: GameAnnouncement) -> Option<JoinHandle<()>> {
        let key = key_for(&announcement.platform, &announcement.game_id);

        let resume = match self.registry.reserve(&key) {
            ReserveOutcome::Skip => return None,
            ReserveOutcome::Fresh => false,
            ReserveOutcome::Resume => true,
        };

        let monitor = self.clone();
        Some(tokio::spawn(async move {
            monitor.record_game(key, announcement, resume).await;
        }))
    }

    async fn record_game(&self, key: String, announcement: GameAnnouncement, resume: bool) {
        let existing = if resume {
            self.registry.resume_handle(&key)
        } else {
            None
        };

        let (location, rec) = match existing {
            Some(handle) => handle,
            None => {
                let location = self
                    .recordings_dir
                    .join(format!("{key}.{RECORDING_EXTENSION}"));

                let file = match OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&location)
                {
                    Ok(file) => file,
                    Err(e) => {
                        error!("create recording error: {}", e);
                        return;
                    }
                };

                match Recording::new(file) {
                    Ok(rec) => (location, Arc::new(rec)),
                    Err(e) => {
                        error!("failed to initialize recording: {}", e);
                        return;
                    }
                }
            }
        };

        self.registry.promote(&key, location, Arc::clone(&rec));

        if !rec.has_user_metadata() {
            if let Err(e) = rec.store_user_metadata(&announcement.game_info) {
                warn!("recording {} failed to store user metadata: {}", key, e);
            }
        }

        if resume {
            info!("resuming recording {}", key);
        } else {
            info!("recording {}", key);
        }

        let api = Arc::clone(&self.api);
        let recording = Arc::clone(&rec);
        let platform = announcement.platform.clone();
        let game_id = announcement.game_id.clone();
        let encryption_key = announcement.encryption_key.clone();

        let task = tokio::spawn(async move {
            record::record(api, &platform, &game_id, &encryption_key, recording).await
        });

        match task.await {
            Ok(Ok(())) => info!("recording {} complete", key),
            Ok(Err(e)) => warn!("error while recording {}: {}", key, e),
            Err(e) if e.is_panic() => error!("record game panic for {}: {:?}", key, e),
            Err(_) => warn!("recording task for {} was cancelled", key),
        }

        self.registry.demote(&key);
    }
}
