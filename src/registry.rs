//! In-memory index of recordings
//!
//! Tracks every recording the process knows about, keyed by
//! `PLATFORM_GAMEID`, together with its lifecycle flags. A parallel
//! sequence ordered by record time (oldest first) drives eviction when
//! the configured cap is reached.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::storage::{Recording, RECORDING_EXTENSION};
use crate::Result;

/// Build the registry key for a platform and game id.
#[must_use]
pub fn key_for(platform: &str, game_id: &str) -> String {
    format!("{platform}_{game_id}")
}

/// Outcome of reserving a key for an announced game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The game is already being handled or is already complete.
    Skip,
    /// The key was reserved for a brand new recording.
    Fresh,
    /// An incomplete recording exists and should be resumed.
    Resume,
}

struct InternalRecording {
    location: PathBuf,
    rec: Option<Arc<Recording<File>>>,
    /// A placeholder or an entry being evicted; invisible to lookups.
    temporary: bool,
    /// A controller is actively writing.
    recording: bool,
}

#[derive(Default)]
struct RegistryState {
    recordings: HashMap<String, InternalRecording>,
    /// Keys ordered by record time ascending; the front is evicted first.
    sorted: Vec<String>,
}

/// Process-wide index of active and archived recordings.
pub struct RecordingRegistry {
    state: RwLock<RegistryState>,
    keep_num: usize,
}

impl RecordingRegistry {
    /// Create a registry that keeps at most `keep_num` recordings.
    #[must_use]
    pub fn new(keep_num: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            keep_num,
        }
    }

    /// Reserve a key for an announced game.
    pub fn reserve(&self, key: &str) -> ReserveOutcome {
        let mut state = self.state.write();

        if let Some(entry) = state.recordings.get_mut(key) {
            let complete = entry.rec.as_ref().is_some_and(|rec| rec.is_complete());
            if entry.temporary || entry.recording || complete {
                return ReserveOutcome::Skip;
            }

            // Hide the entry while the controller reopens it.
            entry.temporary = true;
            entry.recording = false;
            return ReserveOutcome::Resume;
        }

        state.recordings.insert(
            key.to_string(),
            InternalRecording {
                location: PathBuf::new(),
                rec: None,
                temporary: true,
                recording: false,
            },
        );

        ReserveOutcome::Fresh
    }

    /// The file location and handle of a previously recorded game, for
    /// resumption.
    pub fn resume_handle(&self, key: &str) -> Option<(PathBuf, Arc<Recording<File>>)> {
        let state = self.state.read();
        let entry = state.recordings.get(key)?;
        let rec = entry.rec.clone()?;
        Some((entry.location.clone(), rec))
    }

    /// Replace a reserved placeholder with a live entry. Evicts the
    /// oldest recordings first if the registry is at capacity.
    pub fn promote(&self, key: &str, location: PathBuf, rec: Arc<Recording<File>>) {
        let mut state = self.state.write();

        clean_up(&mut state, self.keep_num);

        state.recordings.insert(
            key.to_string(),
            InternalRecording {
                location,
                rec: Some(rec),
                temporary: false,
                recording: true,
            },
        );

        if !state.sorted.iter().any(|k| k == key) {
            state.sorted.push(key.to_string());
        }
    }

    /// Mark a recording as no longer being written. The entry remains
    /// until eviction.
    pub fn demote(&self, key: &str) {
        let mut state = self.state.write();
        if let Some(entry) = state.recordings.get_mut(key) {
            entry.recording = false;
        }
    }

    /// The recording stored under a key, unless the entry is hidden.
    pub fn lookup(&self, key: &str) -> Option<Arc<Recording<File>>> {
        let state = self.state.read();
        let entry = state.recordings.get(key)?;

        if entry.temporary {
            return None;
        }

        entry.rec.clone()
    }

    /// Number of tracked recordings, placeholders included.
    pub fn len(&self) -> usize {
        self.state.read().recordings.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.state.read().recordings.is_empty()
    }

    /// Load existing recordings from a directory. Recordings that never
    /// received game metadata are deleted. Returns the number of
    /// recordings loaded.
    pub fn load_directory(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;

        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if path.is_dir() || path.extension().and_then(|s| s.to_str()) != Some(RECORDING_EXTENSION)
            {
                continue;
            }

            let file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!("failed to open {}: {}", path.display(), e);
                    continue;
                }
            };

            let rec = match Recording::new(file) {
                Ok(rec) => rec,
                Err(e) => {
                    warn!("failed to read recording {}: {}", path.display(), e);
                    continue;
                }
            };

            if !rec.has_game_metadata() {
                info!("deleting empty recording {}", path.display());
                drop(rec);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("failed to delete empty recording: {}", e);
                }
                continue;
            }

            let game_info = rec.game_info();
            let key = key_for(&game_info.platform, &game_info.game_id);

            let mut state = self.state.write();
            state.recordings.insert(
                key.clone(),
                InternalRecording {
                    location: path,
                    rec: Some(Arc::new(rec)),
                    temporary: false,
                    recording: false,
                },
            );
            state.sorted.push(key);
            loaded += 1;
        }

        let mut state = self.state.write();
        let by_time: HashMap<String, std::time::SystemTime> = state
            .recordings
            .iter()
            .filter_map(|(key, entry)| {
                entry
                    .rec
                    .as_ref()
                    .map(|rec| (key.clone(), rec.game_info().record_time))
            })
            .collect();
        state
            .sorted
            .sort_by_key(|key| by_time.get(key).copied().unwrap_or(std::time::SystemTime::UNIX_EPOCH));

        Ok(loaded)
    }

    /// Quiesce every recording so the process can exit without tearing a
    /// write in half. Each recording is locked on its own task so
    /// shutdown is not serialized behind one slow mutex.
    pub async fn close_all(&self) {
        let recordings: Vec<(String, Arc<Recording<File>>)> = {
            let state = self.state.write();
            state
                .recordings
                .iter()
                .filter_map(|(key, entry)| entry.rec.clone().map(|rec| (key.clone(), rec)))
                .collect()
        };

        let mut tasks = JoinSet::new();
        for (key, rec) in recordings {
            tasks.spawn(async move {
                let _guard = rec.lock();
                debug!("closed recording {}", key);
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("close task error: {}", e);
            }
        }
    }
}

/// Evict oldest recordings until the registry is under its cap. Must be
/// called with the write lock held.
fn clean_up(state: &mut RegistryState, keep_num: usize) {
    while state.recordings.len() >= keep_num {
        let Some(key) = state.sorted.first().cloned() else {
            break;
        };

        let Some(entry) = state.recordings.get_mut(&key) else {
            state.sorted.remove(0);
            continue;
        };

        // Hide the entry from lookups immediately, then quiesce in-flight
        // reads and writes before the file disappears.
        entry.temporary = true;
        let rec = entry.rec.clone();
        let location = entry.location.clone();

        {
            let _guard = rec.as_ref().map(|r| r.lock());
            if let Err(e) = fs::remove_file(&location) {
                warn!("failed to delete {}: {}", location.display(), e);
            }
        }

        state.sorted.remove(0);
        state.recordings.remove(&key);
        info!("evicted recording {}", key);
    }
}
