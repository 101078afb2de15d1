//! New spectator client detection
//!
//! To start a spectating session from the beginning, the replay surface
//! has to pretend that the last available chunk is one of the first
//! chunks. A client is identified by its `(IP, game id)` pair; a leaky
//! bucket per identity decides whether the client is new (serve the first
//! chunk info) or an ongoing session (serve the real last chunk info).

use std::net::IpAddr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Events a fresh client fingerprint may spend before being considered
/// an ongoing session. A normal spectator client polls roughly every
/// 10 seconds, so 3 per minute is conservative.
pub const NEW_CLIENT_CAPACITY: u32 = 3;

/// Refill window of the per-client bucket
pub const NEW_CLIENT_WINDOW: Duration = Duration::from_secs(60);

/// A spectator session fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    /// Remote address of the spectator client
    pub ip: IpAddr,
    /// Game the client is spectating
    pub game_id: String,
}

struct Bucket {
    count: u32,
    window_start: Instant,
}

/// Leaky-bucket store distinguishing new spectator clients from
/// returning ones.
pub struct NewClientDetector {
    buckets: DashMap<ClientKey, Bucket>,
    capacity: u32,
    window: Duration,
}

impl NewClientDetector {
    /// Create a detector with the default capacity and window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(NEW_CLIENT_CAPACITY, NEW_CLIENT_WINDOW)
    }

    /// Create a detector with explicit limits.
    #[must_use]
    pub fn with_limits(capacity: u32, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity,
            window,
        }
    }

    /// Record a request from the given fingerprint and report whether it
    /// still counts as a new client.
    pub fn is_new_client(&self, key: ClientKey) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            count: 0,
            window_start: now,
        });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        if bucket.count < self.capacity {
            bucket.count += 1;
            true
        } else {
            false
        }
    }

    /// Drop buckets whose window has expired to bound memory growth.
    pub fn gc(&self) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.window_start) < self.window);
    }

    /// Number of tracked fingerprints.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no fingerprints are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for NewClientDetector {
    fn default() -> Self {
        Self::new()
    }
}
