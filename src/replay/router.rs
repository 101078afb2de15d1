//! HTTP handlers impersonating the upstream spectator endpoint

use std::convert::Infallible;
use std::fs::File;
use std::net::IpAddr;
use std::sync::Arc;

use futures_util::stream;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::{header, Method, Request, Response, StatusCode};
use tokio::sync::mpsc;
use tracing::warn;

use super::newclient::{ClientKey, NewClientDetector};
use super::pipe::{BodySender, WriterPipe};
use super::PATH_HEADER;
use crate::record::{self, SpectatorApi};
use crate::registry::{self, RecordingRegistry};
use crate::storage::Recording;
use crate::Result;

/// Platform whose version is proxied on the `version` route
const REFERENCE_PLATFORM: &str = "OC1";

/// Frames buffered between the retrieval and the connection
const STREAM_CHANNEL_DEPTH: usize = 4;

/// Response body served by the replay surface: either a buffered payload
/// or a live stream of retrieval frames
pub type ReplayBody = BoxBody<Bytes, Infallible>;

/// Routes requests for recorded data to the recordings in the registry.
pub struct ReplayRouter<A> {
    registry: Arc<RecordingRegistry>,
    detector: NewClientDetector,
    api: Arc<A>,
}

impl<A: SpectatorApi> ReplayRouter<A> {
    /// Create a router serving recordings from the given registry.
    pub fn new(registry: Arc<RecordingRegistry>, api: Arc<A>) -> Self {
        Self {
            registry,
            detector: NewClientDetector::new(),
            api,
        }
    }

    /// The new-client detection store, exposed for maintenance.
    pub fn detector(&self) -> &NewClientDetector {
        &self.detector
    }

    /// Handle one spectator request.
    pub async fn handle<B>(&self, req: Request<B>, client_ip: IpAddr) -> Response<ReplayBody> {
        if req.method() != Method::GET {
            return text_response(StatusCode::NOT_FOUND, "not found");
        }

        let path = req.uri().path().to_string();
        let Some(rest) = path.strip_prefix(PATH_HEADER) else {
            return text_response(StatusCode::NOT_FOUND, "not found");
        };

        let segments: Vec<&str> = rest.trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            ["version"] => self.version().await,
            ["getGameMetaData", region, id, ..] => self.game_metadata(region, id).await,
            ["getLastChunkInfo", region, id, _end, ..] => {
                self.last_chunk_info(region, id, client_ip)
            }
            ["getGameDataChunk", region, id, chunk, ..] => {
                self.game_data_chunk(region, id, chunk).await
            }
            ["getKeyFrame", region, id, frame, ..] => self.key_frame(region, id, frame).await,
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    /// A recording for a region and game id, if one is visible. Requests
    /// for invalid platforms or non-numeric game ids never hit the
    /// registry.
    fn retrieve(&self, region: &str, game_id: &str) -> Option<Arc<Recording<File>>> {
        if !record::is_valid_platform(region) {
            return None;
        }

        if !game_id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        self.registry.lookup(&registry::key_for(region, game_id))
    }

    async fn version(&self) -> Response<ReplayBody> {
        match record::platform_version(self.api.as_ref(), REFERENCE_PLATFORM).await {
            Ok(version) => text_response(StatusCode::OK, &version),
            Err(e) => {
                warn!("version fetch failed: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "version unavailable")
            }
        }
    }

    async fn game_metadata(&self, region: &str, id: &str) -> Response<ReplayBody> {
        let Some(rec) = self.retrieve(region, id) else {
            return text_response(StatusCode::NOT_FOUND, "game not found");
        };

        stream_retrieval(
            "application/json",
            "metadata not found",
            "getGameMetaData",
            move |pipe| rec.retrieve_game_metadata_to(pipe),
        )
        .await
    }

    fn last_chunk_info(&self, region: &str, id: &str, client_ip: IpAddr) -> Response<ReplayBody> {
        let Some(rec) = self.retrieve(region, id) else {
            return text_response(StatusCode::NOT_FOUND, "game not found");
        };

        // A new client gets the first chunk info so its spectating
        // session starts from the beginning of the recording.
        let key = ClientKey {
            ip: client_ip,
            game_id: id.to_string(),
        };
        let info = if self.detector.is_new_client(key) {
            rec.first_chunk_info()
        } else {
            rec.last_chunk_info()
        };

        match serde_json::to_vec(&info) {
            Ok(body) => body_response("application/json", body),
            Err(e) => {
                warn!("getLastChunkInfo encode error: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }

    async fn game_data_chunk(&self, region: &str, id: &str, chunk: &str) -> Response<ReplayBody> {
        let Some(rec) = self.retrieve(region, id) else {
            return text_response(StatusCode::NOT_FOUND, "game not found");
        };

        let Ok(chunk_id) = chunk.parse::<i32>() else {
            return text_response(StatusCode::BAD_REQUEST, "invalid chunk number");
        };

        stream_retrieval(
            "application/octet-stream",
            "chunk not found",
            "getGameDataChunk",
            move |pipe| rec.retrieve_chunk_to(chunk_id, pipe),
        )
        .await
    }

    async fn key_frame(&self, region: &str, id: &str, frame: &str) -> Response<ReplayBody> {
        let Some(rec) = self.retrieve(region, id) else {
            return text_response(StatusCode::NOT_FOUND, "game not found");
        };

        let Ok(frame_id) = frame.parse::<i32>() else {
            return text_response(StatusCode::BAD_REQUEST, "invalid keyframe number");
        };

        stream_retrieval(
            "application/octet-stream",
            "keyframe not found",
            "getKeyFrame",
            move |pipe| rec.retrieve_key_frame_to(frame_id, pipe),
        )
        .await
    }
}

/// Run a retrieval on the blocking pool, streaming its bytes to the
/// connection as they are written.
///
/// The response status is committed by the first event: a data frame
/// locks in 200 with the payload content type, an error before any byte
/// maps to 404 or 500. An error *after* the first byte is logged
/// silently and simply ends the stream, leaving the client with a
/// truncated transfer.
async fn stream_retrieval<F>(
    content_type: &'static str,
    not_found_body: &'static str,
    op: &'static str,
    retrieve: F,
) -> Response<ReplayBody>
where
    F: FnOnce(&mut WriterPipe<BodySender>) -> Result<u64> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        let mut pipe = WriterPipe::new(BodySender::new(tx));

        if let Err(e) = retrieve(&mut pipe) {
            if pipe.has_written() {
                warn!("{} silent error: {}", op, e);
            } else {
                let sender = pipe.into_inner().into_sender();
                let _ = sender.blocking_send(Err(e));
            }
        }
        // Dropping the sender ends the body stream.
    });

    match rx.recv().await {
        Some(Ok(first)) => stream_response(content_type, first, rx),
        Some(Err(e)) if e.is_missing_data() => text_response(StatusCode::NOT_FOUND, not_found_body),
        Some(Err(e)) => {
            warn!("{} error: {}", op, e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
        None => body_response(content_type, Vec::new()),
    }
}

/// Build a 200 response whose body replays the already-received first
/// frame and then the rest of the retrieval channel.
///
/// # Panics
///
/// Panics if the response builder fails (should never happen with valid
/// inputs).
fn stream_response(
    content_type: &str,
    first: Bytes,
    rx: mpsc::Receiver<Result<Bytes>>,
) -> Response<ReplayBody> {
    let frames = stream::unfold((Some(first), rx), |(pending, mut rx)| async move {
        if let Some(bytes) = pending {
            return Some((Ok::<_, Infallible>(Frame::data(bytes)), (None, rx)));
        }

        match rx.recv().await {
            Some(Ok(bytes)) => Some((Ok(Frame::data(bytes)), (None, rx))),
            // Errors are only sent before the first byte; after that the
            // channel just closes.
            Some(Err(_)) | None => None,
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(StreamBody::new(frames).boxed())
        .expect("failed to build response")
}

/// Build a plain-text response.
///
/// # Panics
///
/// Panics if the response builder fails (should never happen with valid
/// inputs).
fn text_response(status: StatusCode, body: &str) -> Response<ReplayBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body.to_string())).boxed())
        .expect("failed to build response")
}

/// Build a 200 response with a buffered body and the given content type.
///
/// # Panics
///
/// Panics if the response builder fails (should never happen with valid
/// inputs).
fn body_response(content_type: &str, body: Vec<u8>) -> Response<ReplayBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(body)).boxed())
        .expect("failed to build response")
}
