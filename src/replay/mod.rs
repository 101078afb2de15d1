//! Replay HTTP surface
//!
//! Serves the upstream spectator endpoint's operations back to spectator
//! clients from the recordings in the registry.

mod newclient;
mod pipe;
mod router;

pub use newclient::{ClientKey, NewClientDetector, NEW_CLIENT_CAPACITY, NEW_CLIENT_WINDOW};
pub use pipe::{BodySender, WriterPipe, STREAM_FRAME_SIZE};
pub use router::{ReplayBody, ReplayRouter};

/// Common path prefix of spectator consumer requests
pub const PATH_HEADER: &str = crate::record::CONSUMER_PATH;
