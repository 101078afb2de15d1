//! On-disk recording format structures

use std::collections::BTreeMap;
use std::io::Read;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Version number of the recording format. Recording formats are not
/// forwards or backwards compatible.
pub const FORMAT_VERSION: u16 = 8;

/// Size of the trailing preamble: `[u16 header size LE][u16 version LE]`
pub const PREAMBLE_SIZE: u64 = 4;

/// Maximum encoded header size; must fit in the 16-bit size word
pub const HEADER_SIZE_LIMIT: usize = 65_535;

/// A half-open byte range within a recording file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Byte offset of the start of the range
    pub position: u64,
    /// Length of the range in bytes; zero means unwritten
    pub length: u64,
}

impl Segment {
    /// Whether the segment has been written.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.length > 0
    }
}

/// Chunk information exchanged with the upstream spectator endpoint and
/// served back to spectator clients. Field names are wire-critical.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkInfo {
    /// Latest chunk available for download
    #[serde(rename = "chunkId")]
    pub current_chunk: i32,

    /// Milliseconds since the current chunk became available
    #[serde(rename = "availableSince")]
    pub available_since: i32,

    /// Milliseconds until the next chunk becomes available
    #[serde(rename = "nextAvailableChunk")]
    pub next_update: i32,

    /// Latest key frame available for download
    #[serde(rename = "keyFrameId")]
    pub current_key_frame: i32,

    /// Chunk the client should request next
    #[serde(rename = "nextChunkId")]
    pub next_chunk: i32,

    /// Last chunk of the startup phase
    #[serde(rename = "endStartupChunkId")]
    pub end_startup_chunk: i32,

    /// First chunk of live play
    #[serde(rename = "startGameChunkId")]
    pub start_game_chunk: i32,

    /// Final chunk of the game; zero while the game is in progress
    #[serde(rename = "endGameChunkId")]
    pub end_game_chunk: i32,

    /// Chunk duration in milliseconds
    #[serde(rename = "duration")]
    pub duration: i32,
}

/// Meta information for a game required to play back a recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    /// Upstream platform id (e.g. `NA1`)
    pub platform: String,
    /// Platform version at record time
    pub version: String,
    /// Numeric game id as a string
    pub game_id: String,
    /// Encryption key for the chunk payloads, stored opaquely
    pub encryption_key: String,
    /// When the recording of this game started
    pub record_time: SystemTime,
}

impl Default for GameInfo {
    fn default() -> Self {
        Self {
            platform: String::new(),
            version: String::new(),
            game_id: String::new(),
            encryption_key: String::new(),
            record_time: SystemTime::UNIX_EPOCH,
        }
    }
}

/// The rewritten trailing header of a recording file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingHeader {
    /// Segment holding the raw game metadata JSON; write-once
    pub game_metadata: Segment,
    /// Chunk info served to new spectator clients
    pub first_chunk_info: ChunkInfo,
    /// Chunk info served to returning spectator clients
    pub last_chunk_info: ChunkInfo,
    /// Key frame id to segment index
    pub key_frame_map: BTreeMap<i32, Segment>,
    /// Chunk id to segment index
    pub chunk_map: BTreeMap<i32, Segment>,
    /// Basic game information
    pub info: GameInfo,
    /// Segment holding the caller-defined metadata blob; write-once
    pub user_metadata: Segment,
    /// Whether the recording ended with no known gaps
    pub is_complete: bool,
    /// Last time data was written to the recording
    pub last_write_time: SystemTime,
}

impl Default for RecordingHeader {
    fn default() -> Self {
        Self {
            game_metadata: Segment::default(),
            first_chunk_info: ChunkInfo::default(),
            last_chunk_info: ChunkInfo::default(),
            key_frame_map: BTreeMap::new(),
            chunk_map: BTreeMap::new(),
            info: GameInfo::default(),
            user_metadata: Segment::default(),
            is_complete: false,
            last_write_time: SystemTime::UNIX_EPOCH,
        }
    }
}

/// Encode a recording header into its self-describing binary form.
pub fn encode_header(header: &RecordingHeader) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(header, &mut buf)?;
    Ok(buf)
}

/// Decode a recording header from a reader limited to the header bytes.
pub fn decode_header<R: Read>(reader: R) -> Result<RecordingHeader> {
    let header: RecordingHeader = ciborium::from_reader(reader)?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut header = RecordingHeader::default();
        header.chunk_map.insert(1, Segment { position: 0, length: 10 });
        header.chunk_map.insert(7, Segment { position: 10, length: 32 });
        header.key_frame_map.insert(2, Segment { position: 42, length: 5 });
        header.info = GameInfo {
            platform: "NA1".to_string(),
            version: "4.12.0.123".to_string(),
            game_id: "1234567890".to_string(),
            encryption_key: "key".to_string(),
            record_time: SystemTime::now(),
        };
        header.is_complete = true;

        let encoded = encode_header(&header).unwrap();
        let decoded = decode_header(&encoded[..]).unwrap();

        assert_eq!(decoded, header);
    }

    #[test]
    fn test_chunk_info_wire_names() {
        let info = ChunkInfo {
            current_chunk: 5,
            available_since: 100,
            next_update: 3000,
            current_key_frame: 2,
            next_chunk: 6,
            end_startup_chunk: 2,
            start_game_chunk: 3,
            end_game_chunk: 0,
            duration: 30000,
        };

        let json = serde_json::to_value(info).unwrap();
        assert_eq!(json["chunkId"], 5);
        assert_eq!(json["availableSince"], 100);
        assert_eq!(json["nextAvailableChunk"], 3000);
        assert_eq!(json["keyFrameId"], 2);
        assert_eq!(json["nextChunkId"], 6);
        assert_eq!(json["endStartupChunkId"], 2);
        assert_eq!(json["startGameChunkId"], 3);
        assert_eq!(json["endGameChunkId"], 0);
        assert_eq!(json["duration"], 30000);
    }

    #[test]
    fn test_chunk_info_tolerates_missing_fields() {
        let info: ChunkInfo = serde_json::from_str(r#"{"chunkId": 3}"#).unwrap();
        assert_eq!(info.current_chunk, 3);
        assert_eq!(info.end_game_chunk, 0);
    }

    #[test]
    fn test_segment_presence() {
        assert!(!Segment::default().is_present());
        assert!(Segment { position: 0, length: 1 }.is_present());
    }

    #[test]
    fn test_garbage_header_fails_decode() {
        assert!(decode_header(&[0xff, 0x13][..]).is_err());
    }
}
