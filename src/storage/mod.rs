//! Recording file format and access layer

mod format;
mod pool;
mod recording;

pub use format::{
    decode_header, encode_header, ChunkInfo, GameInfo, RecordingHeader, Segment, FORMAT_VERSION,
    HEADER_SIZE_LIMIT, PREAMBLE_SIZE,
};
pub use pool::{BufferPool, BUFFER_POOL, SCRATCH_BUFFER_SIZE};
pub use recording::{Recording, RecordingInner};

/// File extension of recording files on disk
pub const RECORDING_EXTENSION: &str = "glr";
