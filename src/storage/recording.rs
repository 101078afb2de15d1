//! Recording file access layer
//!
//! A recording is an append-only stack of opaque blobs followed by a
//! rewritten trailing header and a 4-byte preamble:
//! `[blob 0][blob 1]...[blob n][header][u16 header size LE][u16 version LE]`.
//!
//! Every write appends its blob at `position`, then rewrites the header
//! and preamble behind it. Readers always observe a consistent header
//! snapshot because the header is only rewritten after the blob is fully
//! on disk.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::format::{
    decode_header, encode_header, ChunkInfo, GameInfo, RecordingHeader, Segment, FORMAT_VERSION,
    HEADER_SIZE_LIMIT,
};
use super::pool::BUFFER_POOL;
use crate::{Result, SpectrecError};

/// Manages the reading and writing of recording data to a seekable
/// read-write byte stream such as a [`std::fs::File`].
#[derive(Debug)]
pub struct Recording<F> {
    inner: Mutex<RecordingInner<F>>,
}

/// Interior state of a recording, exposed only through [`Recording::lock`]
/// so external code can quiesce reads and writes before closing the
/// underlying file.
#[derive(Debug)]
pub struct RecordingInner<F> {
    file: F,
    position: u64,
    header: RecordingHeader,
}

impl<F: Read + Write + Seek> Recording<F> {
    /// Create a new recording for writing to, or read an existing
    /// recording from, the given byte stream.
    ///
    /// # Errors
    ///
    /// Returns [`SpectrecError::IncompatibleVersion`] if the trailing
    /// version word does not match [`FORMAT_VERSION`], and
    /// [`SpectrecError::CorruptRecording`] if a header is present but
    /// undecodable. An empty or truncated stream yields an empty
    /// recording.
    pub fn new(file: F) -> Result<Self> {
        let mut inner = RecordingInner {
            file,
            position: 0,
            header: RecordingHeader::default(),
        };

        match inner.read_header() {
            Ok(()) => {}
            Err(SpectrecError::MissingData) => {
                // New or empty stream: start with an empty header.
                inner.position = 0;
                inner.header = RecordingHeader::default();
            }
            Err(e) => return Err(e),
        }

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Lock the recording to disallow any further reads or writes. Used
    /// to safely close the underlying file without corrupting data, or
    /// for other purposes that must block reads and writes. The lock is
    /// released when the returned guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, RecordingInner<F>> {
        self.inner.lock()
    }

    /// Declare the recording as complete. Idempotent; completion never
    /// reverts.
    pub fn declare_complete(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.header.is_complete {
            return Ok(());
        }

        inner.header.is_complete = true;
        inner.write_header()
    }

    /// Store the game's basic information, overwriting any previous value.
    pub fn store_game_info(&self, info: GameInfo) -> Result<()> {
        let mut inner = self.inner.lock();

        inner.header.info = info;
        inner.write_header()
    }

    /// Store the raw game metadata. The metadata is write-once; a second
    /// store returns [`SpectrecError::CannotModify`]. Also stamps the
    /// game's record time.
    pub fn store_game_metadata<R: Read>(&self, rd: R) -> Result<()> {
        let buf = read_into_scratch(rd)?;

        let mut inner = self.inner.lock();

        if inner.header.game_metadata.is_present() {
            BUFFER_POOL.put(buf);
            return Err(SpectrecError::CannotModify);
        }

        let result = inner.append_blob(&buf).and_then(|seg| {
            inner.header.game_metadata = seg;
            inner.header.info.record_time = SystemTime::now();
            inner.write_header()
        });

        BUFFER_POOL.put(buf);
        result
    }

    /// Store arbitrary caller-defined data with the recording. The user
    /// metadata is write-once and can be read back with
    /// [`Recording::retrieve_user_metadata`].
    pub fn store_user_metadata<T: Serialize>(&self, metadata: &T) -> Result<()> {
        let mut buf = BUFFER_POOL.get();
        if let Err(e) = ciborium::into_writer(metadata, &mut buf) {
            BUFFER_POOL.put(buf);
            return Err(e.into());
        }

        let mut inner = self.inner.lock();

        if inner.header.user_metadata.is_present() {
            BUFFER_POOL.put(buf);
            return Err(SpectrecError::CannotModify);
        }

        let result = inner.append_blob(&buf).and_then(|seg| {
            inner.header.user_metadata = seg;
            inner.write_header()
        });

        BUFFER_POOL.put(buf);
        result
    }

    /// Store the chunk info that should be returned first to new
    /// spectator clients.
    pub fn store_first_chunk_info(&self, chunk_info: ChunkInfo) -> Result<()> {
        let mut inner = self.inner.lock();

        inner.header.first_chunk_info = chunk_info;
        inner.write_header()
    }

    /// Store the chunk info that should be returned to returning
    /// spectator clients.
    pub fn store_last_chunk_info(&self, chunk_info: ChunkInfo) -> Result<()> {
        let mut inner = self.inner.lock();

        inner.header.last_chunk_info = chunk_info;
        inner.write_header()
    }

    /// Store the chunk data for a chunk id. If the chunk id already
    /// exists in the recording, [`SpectrecError::CannotModify`] is
    /// returned.
    pub fn store_chunk<R: Read>(&self, id: i32, rd: R) -> Result<()> {
        let buf = read_into_scratch(rd)?;

        let mut inner = self.inner.lock();

        if inner.header.chunk_map.contains_key(&id) {
            BUFFER_POOL.put(buf);
            return Err(SpectrecError::CannotModify);
        }

        let result = inner.append_blob(&buf).and_then(|seg| {
            inner.header.chunk_map.insert(id, seg);
            inner.write_header()
        });

        BUFFER_POOL.put(buf);
        result
    }

    /// Store the key frame data for a key frame id. If the key frame id
    /// already exists in the recording, [`SpectrecError::CannotModify`]
    /// is returned.
    pub fn store_key_frame<R: Read>(&self, id: i32, rd: R) -> Result<()> {
        let buf = read_into_scratch(rd)?;

        let mut inner = self.inner.lock();

        if inner.header.key_frame_map.contains_key(&id) {
            BUFFER_POOL.put(buf);
            return Err(SpectrecError::CannotModify);
        }

        let result = inner.append_blob(&buf).and_then(|seg| {
            inner.header.key_frame_map.insert(id, seg);
            inner.write_header()
        });

        BUFFER_POOL.put(buf);
        result
    }

    /// Whether the specified chunk id already exists in the recording.
    pub fn has_chunk(&self, id: i32) -> bool {
        self.inner.lock().header.chunk_map.contains_key(&id)
    }

    /// Whether the specified key frame id already exists in the recording.
    pub fn has_key_frame(&self, id: i32) -> bool {
        self.inner.lock().header.key_frame_map.contains_key(&id)
    }

    /// Whether the game metadata has been written to the recording.
    pub fn has_game_metadata(&self) -> bool {
        self.inner.lock().header.game_metadata.is_present()
    }

    /// Whether the user metadata has been written to the recording.
    pub fn has_user_metadata(&self) -> bool {
        self.inner.lock().header.user_metadata.is_present()
    }

    /// The recorded game's basic information.
    pub fn game_info(&self) -> GameInfo {
        self.inner.lock().header.info.clone()
    }

    /// The chunk info served first to new spectator clients.
    pub fn first_chunk_info(&self) -> ChunkInfo {
        self.inner.lock().header.first_chunk_info
    }

    /// The chunk info served to returning spectator clients.
    pub fn last_chunk_info(&self) -> ChunkInfo {
        self.inner.lock().header.last_chunk_info
    }

    /// Whether the recording has been declared complete.
    pub fn is_complete(&self) -> bool {
        self.inner.lock().header.is_complete
    }

    /// The last time data was written to the recording.
    pub fn last_write_time(&self) -> SystemTime {
        self.inner.lock().header.last_write_time
    }

    /// The byte offset immediately after the last appended blob.
    pub fn position(&self) -> u64 {
        self.inner.lock().position
    }

    /// Retrieve the recorded game metadata into `w`, returning the number
    /// of bytes written. Returns [`SpectrecError::MissingData`] if the
    /// metadata has not been stored.
    pub fn retrieve_game_metadata_to<W: Write>(&self, w: &mut W) -> Result<u64> {
        let inner = self.inner.lock();

        if !inner.header.game_metadata.is_present() {
            return Err(SpectrecError::MissingData);
        }

        let seg = inner.header.game_metadata;
        Self::copy_segment_to(inner, seg, w)
    }

    /// Retrieve the chunk data for a chunk id into `w`, returning the
    /// number of bytes written. Returns [`SpectrecError::MissingData`]
    /// if the chunk id does not exist.
    pub fn retrieve_chunk_to<W: Write>(&self, id: i32, w: &mut W) -> Result<u64> {
        let inner = self.inner.lock();

        let Some(seg) = inner.header.chunk_map.get(&id).copied() else {
            return Err(SpectrecError::MissingData);
        };

        Self::copy_segment_to(inner, seg, w)
    }

    /// Retrieve the key frame data for a key frame id into `w`, returning
    /// the number of bytes written. Returns [`SpectrecError::MissingData`]
    /// if the key frame id does not exist.
    pub fn retrieve_key_frame_to<W: Write>(&self, id: i32, w: &mut W) -> Result<u64> {
        let inner = self.inner.lock();

        let Some(seg) = inner.header.key_frame_map.get(&id).copied() else {
            return Err(SpectrecError::MissingData);
        };

        Self::copy_segment_to(inner, seg, w)
    }

    /// Retrieve the caller-defined metadata stored by
    /// [`Recording::store_user_metadata`].
    pub fn retrieve_user_metadata<T: DeserializeOwned>(&self) -> Result<T> {
        let mut inner = self.inner.lock();

        if !inner.header.user_metadata.is_present() {
            return Err(SpectrecError::MissingData);
        }

        let seg = inner.header.user_metadata;
        inner.file.seek(SeekFrom::Start(seg.position))?;
        let reader = (&mut inner.file).take(seg.length);
        let metadata: T = ciborium::from_reader(reader)?;
        Ok(metadata)
    }

    /// Copy a segment into a pooled scratch buffer under the mutex, then
    /// release the mutex before flushing to `w` so a slow consumer does
    /// not block writers.
    fn copy_segment_to<W: Write>(
        mut inner: MutexGuard<'_, RecordingInner<F>>,
        seg: Segment,
        w: &mut W,
    ) -> Result<u64> {
        let mut buf = BUFFER_POOL.get();

        if let Err(e) = inner.read_segment(seg, &mut buf) {
            BUFFER_POOL.put(buf);
            return Err(e);
        }
        drop(inner);

        let result = match w.write_all(&buf) {
            Ok(()) => Ok(buf.len() as u64),
            Err(e) => Err(e.into()),
        };

        BUFFER_POOL.put(buf);
        result
    }
}

impl<F: Read + Write + Seek> RecordingInner<F> {
    /// Read the preamble and header from the tail of the stream,
    /// reconstructing `position` as the byte immediately after the last
    /// indexed blob.
    fn read_header(&mut self) -> Result<()> {
        let (version, _) = self.read_trailing_u16(-2)?;
        if version != FORMAT_VERSION {
            return Err(SpectrecError::IncompatibleVersion);
        }

        let (size, size_pos) = self.read_trailing_u16(-4)?;

        // The header size claiming more bytes than the file has means the
        // recording is corrupt.
        let header_start = size_pos
            .checked_sub(u64::from(size))
            .ok_or(SpectrecError::CorruptRecording)?;
        self.position = header_start;

        self.file.seek(SeekFrom::Start(header_start))?;
        let reader = (&mut self.file).take(u64::from(size));
        self.header = decode_header(reader).map_err(|_| SpectrecError::CorruptRecording)?;

        Ok(())
    }

    /// Read a little-endian u16 at the given offset from the end of the
    /// stream. A seek failure or short read means the data is missing.
    fn read_trailing_u16(&mut self, offset: i64) -> Result<(u16, u64)> {
        let pos = self
            .file
            .seek(SeekFrom::End(offset))
            .map_err(|_| SpectrecError::MissingData)?;

        let mut word = [0u8; 2];
        self.file
            .read_exact(&mut word)
            .map_err(|_| SpectrecError::MissingData)?;

        Ok((u16::from_le_bytes(word), pos))
    }

    /// Append a blob at `position` and advance it.
    fn append_blob(&mut self, data: &[u8]) -> Result<Segment> {
        self.file.seek(SeekFrom::Start(self.position))?;

        let seg = Segment {
            position: self.position,
            length: data.len() as u64,
        };

        self.file.write_all(data)?;
        self.position += seg.length;

        Ok(seg)
    }

    /// Rewrite the header and preamble at `position`. The preamble is not
    /// written when the encoded header exceeds the 16-bit size limit, so
    /// the previous preamble keeps pointing at the last valid header.
    fn write_header(&mut self) -> Result<()> {
        self.header.last_write_time = SystemTime::now();

        let encoded = encode_header(&self.header)?;
        if encoded.len() > HEADER_SIZE_LIMIT {
            return Err(SpectrecError::HeaderTooLarge);
        }

        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.write_all(&encoded)?;
        self.file.write_all(&(encoded.len() as u16).to_le_bytes())?;
        self.file.write_all(&FORMAT_VERSION.to_le_bytes())?;

        Ok(())
    }

    fn read_segment(&mut self, seg: Segment, buf: &mut Vec<u8>) -> Result<()> {
        self.file.seek(SeekFrom::Start(seg.position))?;

        let copied = (&mut self.file).take(seg.length).read_to_end(buf)? as u64;
        if copied != seg.length {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short segment read").into());
        }

        Ok(())
    }
}

/// Consume a reader fully into a pooled scratch buffer.
fn read_into_scratch<R: Read>(mut rd: R) -> Result<Vec<u8>> {
    let mut buf = BUFFER_POOL.get();
    if let Err(e) = rd.read_to_end(&mut buf) {
        BUFFER_POOL.put(buf);
        return Err(e.into());
    }
    Ok(buf)
}
