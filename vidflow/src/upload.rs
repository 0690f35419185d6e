//! The adapter that pushes a video to the YouTube Data API.
//!
//! Uploads use the resumable protocol:
//!
//! 1. `POST /upload/youtube/v3/videos?uploadType=resumable` with the video resource as JSON.
//!    The `Location` response header names an upload session.
//! 2. `PUT` the bytes to the session. Payloads that fit in one chunk go in a single request;
//!    larger ones are sent as `Content-Range` chunks, each acknowledged with
//!    `308 Resume Incomplete` and a `Range: bytes=0-N` header.
//! 3. When a chunk is interrupted, `PUT` an empty body with `Content-Range: bytes */total` to
//!    learn how far the server got, and continue from there.
//!
//! See: <https://developers.google.com/youtube/v3/guides/using_resumable_upload_protocol>

use crate::config::{Config, UPLOAD_GRANULARITY};
use crate::error::{Error, Result};
use crate::model::{AccessCredential, ExternalId, PrivacyStatus, UploadMetadata};
use crate::source::{ByteStream, VideoPayload};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use eyre::Context;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::instrument;

/// How many times a single chunk may be resumed after an interruption.
const MAX_RESUME_ATTEMPTS: u32 = 3;

/// YouTube answers an unfinished resumable upload with 308, without a `Location`.
const RESUME_INCOMPLETE: StatusCode = StatusCode::PERMANENT_REDIRECT;

/// Error reasons that mean "try again later" rather than "this request is wrong".
const QUOTA_REASONS: &[&str] = &[
    "quotaExceeded",
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
    "uploadLimitExceeded",
];

/// Error reasons that mean the credential lacks the needed grant.
const AUTH_REASONS: &[&str] = &["insufficientPermissions", "authError", "youtubeSignupRequired"];

/// Capability to publish a video's bytes and metadata.
#[async_trait]
pub trait UploadClient: Send + Sync {
    /// Transfers `payload` and returns the identifier the platform assigned.
    ///
    /// Errors are `Unauthorized`, `QuotaExceeded`, `Rejected`, or `Transport`, plus `Storage`
    /// if the payload itself cannot be read.
    async fn upload(
        &self,
        payload: VideoPayload,
        metadata: &UploadMetadata,
        access: &AccessCredential,
    ) -> Result<ExternalId>;
}

/// The `video` resource parts sent when opening an upload session.
///
/// See: <https://developers.google.com/youtube/v3/docs/videos#resource>
#[derive(Debug, Serialize)]
struct VideoInsert<'a> {
    snippet: VideoInsertSnippet<'a>,
    status: VideoInsertStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoInsertSnippet<'a> {
    title: &'a str,
    description: &'a str,
    category_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoInsertStatus {
    privacy_status: PrivacyStatus,
}

/// The part of the `video` resource returned by a finished upload that we care about.
#[derive(Debug, Deserialize)]
struct UploadedVideo {
    #[serde(default)]
    id: Option<String>,
}

/// Google's JSON error envelope.
#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: String,
}

/// How one request against an upload session ended.
#[derive(Debug)]
enum Step {
    Done(ExternalId),
    /// The server holds this many leading bytes.
    Incomplete(u64),
    /// The request did not complete; the session may still be resumable.
    Interrupted(String),
}

/// [`UploadClient`] backed by the YouTube Data API v3.
#[derive(Debug, Clone)]
pub struct YouTubeUploader {
    http: reqwest::Client,
    base_url: String,
    chunk_size: usize,
}

impl YouTubeUploader {
    pub fn new(config: &Config) -> eyre::Result<Self> {
        if config.chunk_size == 0 || config.chunk_size % UPLOAD_GRANULARITY != 0 {
            eyre::bail!(
                "chunk_size must be a non-zero multiple of {UPLOAD_GRANULARITY} bytes, got {}",
                config.chunk_size
            );
        }
        let http = reqwest::ClientBuilder::new()
            // SSRF no thank you. This also keeps 308 Resume Incomplete from being followed.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build upload HTTP client")?;
        Ok(Self {
            http,
            base_url: config.upload_base_url.trim_end_matches('/').to_string(),
            chunk_size: config.chunk_size,
        })
    }

    /// Opens a resumable upload session and returns its URL.
    async fn start_session(
        &self,
        len: u64,
        content_type: &str,
        metadata: &UploadMetadata,
        access: &AccessCredential,
    ) -> Result<String> {
        let url = format!("{}/upload/youtube/v3/videos", self.base_url);
        let resource = VideoInsert {
            snippet: VideoInsertSnippet {
                title: &metadata.title,
                description: &metadata.description,
                category_id: &metadata.category_id,
            },
            status: VideoInsertStatus {
                privacy_status: metadata.privacy,
            },
        };

        let response = self
            .http
            .post(&url)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .header(AUTHORIZATION, format!("Bearer {}", access.secret()))
            .header("X-Upload-Content-Length", len)
            .header("X-Upload-Content-Type", content_type)
            .json(&resource)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify(status, &response.text().await.unwrap_or_default()));
        }
        let session = response
            .headers()
            .get(LOCATION)
            .and_then(|location| location.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Transport("upload session response had no Location".into()))?;
        tracing::debug!("opened resumable upload session");
        Ok(session)
    }

    /// Sends the whole payload in one request.
    async fn put_whole(
        &self,
        session: &str,
        payload: VideoPayload,
        access: &AccessCredential,
    ) -> Result<ExternalId> {
        let response = self
            .http
            .put(session)
            .header(AUTHORIZATION, format!("Bearer {}", access.secret()))
            .header(CONTENT_LENGTH, payload.len)
            .header(CONTENT_TYPE, &payload.content_type)
            .body(reqwest::Body::wrap_stream(payload.stream))
            .send()
            .await?;

        match read_step(response).await? {
            Step::Done(id) => Ok(id),
            Step::Incomplete(acked) => Err(Error::Transport(format!(
                "server kept {acked} of {} bytes of a single-request upload",
                payload.len
            ))),
            Step::Interrupted(reason) => Err(Error::Transport(reason)),
        }
    }

    /// Sends the payload in `chunk_size` pieces, resuming interrupted pieces.
    async fn put_chunks(
        &self,
        session: &str,
        payload: VideoPayload,
        access: &AccessCredential,
    ) -> Result<ExternalId> {
        let total = payload.len;
        let mut stream = payload.stream;
        // bytes the server has confirmed
        let mut offset: u64 = 0;
        // unconfirmed bytes, starting at `offset`
        let mut pending = BytesMut::new();
        let mut attempts = 0;
        let mut query_next = false;

        loop {
            let step = if query_next {
                self.query_progress(session, access, total).await?
            } else {
                fill(&mut stream, &mut pending, self.chunk_size).await?;
                let buffered_end = offset + pending.len() as u64;
                if buffered_end > total {
                    return Err(Error::Storage(format!(
                        "payload is longer than its declared {total} bytes"
                    )));
                }
                // `pending` may hold more than one chunk after a partial acknowledgement
                let send = pending.len().min(self.chunk_size);
                let is_last = offset + send as u64 == total;
                if send == 0 || (!is_last && send < self.chunk_size) {
                    return Err(Error::Storage(format!(
                        "payload ended after {buffered_end} of {total} bytes"
                    )));
                }
                let chunk = Bytes::copy_from_slice(&pending[..send]);
                self.put_chunk(session, access, chunk, offset, total).await?
            };

            match step {
                Step::Done(id) => return Ok(id),
                Step::Interrupted(reason) => {
                    attempts += 1;
                    if attempts > MAX_RESUME_ATTEMPTS {
                        return Err(Error::Transport(format!(
                            "giving up after {MAX_RESUME_ATTEMPTS} resumes: {reason}"
                        )));
                    }
                    tracing::warn!(offset, attempts, %reason, "upload interrupted, resuming");
                    query_next = true;
                }
                Step::Incomplete(acked) => {
                    query_next = false;
                    if acked < offset || acked > offset + pending.len() as u64 {
                        return Err(Error::Transport(format!(
                            "server acknowledged {acked} bytes, outside the buffered range {offset}..{}",
                            offset + pending.len() as u64
                        )));
                    }
                    if acked == total {
                        return Err(Error::Transport(
                            "server holds every byte but did not finish the upload".into(),
                        ));
                    }
                    if acked > offset {
                        attempts = 0;
                    }
                    pending.advance((acked - offset) as usize);
                    offset = acked;
                    tracing::trace!(offset, total, "chunk acknowledged");
                }
            }
        }
    }

    async fn put_chunk(
        &self,
        session: &str,
        access: &AccessCredential,
        chunk: Bytes,
        offset: u64,
        total: u64,
    ) -> Result<Step> {
        let last_byte = offset + chunk.len() as u64 - 1;
        let sent = self
            .http
            .request(Method::PUT, session)
            .header(AUTHORIZATION, format!("Bearer {}", access.secret()))
            .header(CONTENT_RANGE, format!("bytes {offset}-{last_byte}/{total}"))
            .body(chunk)
            .send()
            .await;
        match sent {
            Ok(response) => read_step(response).await,
            Err(e) => Ok(Step::Interrupted(e.to_string())),
        }
    }

    /// Asks the session how many bytes it holds.
    async fn query_progress(
        &self,
        session: &str,
        access: &AccessCredential,
        total: u64,
    ) -> Result<Step> {
        let sent = self
            .http
            .request(Method::PUT, session)
            .header(AUTHORIZATION, format!("Bearer {}", access.secret()))
            .header(CONTENT_LENGTH, 0)
            .header(CONTENT_RANGE, format!("bytes */{total}"))
            .send()
            .await;
        match sent {
            Ok(response) => read_step(response).await,
            Err(e) => Ok(Step::Interrupted(e.to_string())),
        }
    }
}

#[async_trait]
impl UploadClient for YouTubeUploader {
    #[instrument(skip_all, fields(title = %metadata.title, len = payload.len))]
    async fn upload(
        &self,
        payload: VideoPayload,
        metadata: &UploadMetadata,
        access: &AccessCredential,
    ) -> Result<ExternalId> {
        let session = self
            .start_session(payload.len, &payload.content_type, metadata, access)
            .await?;
        let id = if payload.len <= self.chunk_size as u64 {
            self.put_whole(&session, payload, access).await?
        } else {
            self.put_chunks(&session, payload, access).await?
        };
        tracing::debug!(external_id = %id, "upload finished");
        Ok(id)
    }
}

/// Tops `pending` up to at least `want` bytes, or until the stream ends.
async fn fill(stream: &mut ByteStream, pending: &mut BytesMut, want: usize) -> Result<()> {
    while pending.len() < want {
        match stream.next().await {
            Some(chunk) => {
                let chunk = chunk.map_err(|e| Error::Storage(format!("read video bytes: {e}")))?;
                pending.extend_from_slice(&chunk);
            }
            None => break,
        }
    }
    Ok(())
}

async fn read_step(response: reqwest::Response) -> Result<Step> {
    let status = response.status();
    if status == RESUME_INCOMPLETE {
        return Ok(Step::Incomplete(acknowledged_bytes(response.headers())));
    }
    if status.is_success() {
        let video: UploadedVideo = match response.json().await {
            Ok(video) => video,
            Err(e) => return Ok(Step::Interrupted(format!("read upload response: {e}"))),
        };
        return match video.id.filter(|id| !id.trim().is_empty()) {
            Some(id) => Ok(Step::Done(ExternalId::new(id))),
            None => Err(Error::Transport(
                "upload finished but the response carried no video id".into(),
            )),
        };
    }
    if status.is_server_error() {
        return Ok(Step::Interrupted(format!("server answered {status}")));
    }
    // the session URL itself is gone; a later attempt opens a new one
    if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        return Err(Error::Transport(format!("upload session expired ({status})")));
    }
    Err(classify(status, &response.text().await.unwrap_or_default()))
}

/// Parses `Range: bytes=0-N` into the number of bytes the server holds.
fn acknowledged_bytes(headers: &HeaderMap) -> u64 {
    headers
        .get(RANGE)
        .and_then(|range| range.to_str().ok())
        .and_then(|range| range.strip_prefix("bytes=0-"))
        .and_then(|last| last.trim().parse::<u64>().ok())
        .map_or(0, |last| last + 1)
}

/// Maps a failed API response onto the error taxonomy.
fn classify(status: StatusCode, body: &str) -> Error {
    let (message, reasons): (String, Vec<String>) = match serde_json::from_str::<ApiErrorEnvelope>(body) {
        Ok(ApiErrorEnvelope { error }) => (
            error.message,
            error.errors.into_iter().map(|e| e.reason).collect(),
        ),
        Err(_) => (body.trim().to_string(), Vec::new()),
    };
    let message = if message.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {message}")
    };
    let has_reason = |known: &[&str]| reasons.iter().any(|r| known.contains(&r.as_str()));

    match status {
        StatusCode::UNAUTHORIZED => Error::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => Error::QuotaExceeded(message),
        StatusCode::FORBIDDEN if has_reason(QUOTA_REASONS) => Error::QuotaExceeded(message),
        StatusCode::FORBIDDEN if has_reason(AUTH_REASONS) => Error::Unauthorized(message),
        s if s.is_client_error() => Error::Rejected(message),
        _ => Error::Transport(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn uploader(server: &MockServer) -> YouTubeUploader {
        YouTubeUploader::new(&Config {
            upload_base_url: server.uri(),
            chunk_size: UPLOAD_GRANULARITY,
            ..Config::default()
        })
        .unwrap()
    }

    fn metadata() -> UploadMetadata {
        UploadMetadata {
            title: "Launch trailer".into(),
            description: "cut 4".into(),
            category_id: "22".into(),
            privacy: PrivacyStatus::Unlisted,
        }
    }

    fn payload(len: usize) -> VideoPayload {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        // deliver in uneven pieces to exercise chunk buffering
        let pieces: Vec<std::io::Result<Bytes>> = bytes
            .chunks(100_000)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();
        VideoPayload {
            len: len as u64,
            content_type: "video/mp4".into(),
            stream: Box::pin(tokio_stream::iter(pieces)),
        }
    }

    async fn mount_session(server: &MockServer, session: &str, len: usize) {
        Mock::given(method("POST"))
            .and(path("/upload/youtube/v3/videos"))
            .and(query_param("uploadType", "resumable"))
            .and(query_param("part", "snippet,status"))
            .and(header("authorization", "Bearer ya29.test"))
            .and(header("x-upload-content-length", len.to_string().as_str()))
            .and(body_partial_json(serde_json::json!({
                "snippet": { "title": "Launch trailer", "categoryId": "22" },
                "status": { "privacyStatus": "unlisted" },
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Location", format!("{}/session/{session}", server.uri())),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    fn chunk_mock(session: &str, range: &str) -> wiremock::MockBuilder {
        Mock::given(method("PUT"))
            .and(path(format!("/session/{session}")))
            .and(header("content-range", range))
    }

    fn access() -> AccessCredential {
        AccessCredential::new("ya29.test", None)
    }

    #[tokio::test]
    async fn small_payload_goes_in_one_request() {
        let server = MockServer::start().await;
        mount_session(&server, "one", 1000).await;
        Mock::given(method("PUT"))
            .and(path("/session/one"))
            .and(header("content-length", "1000"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "yt_123" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = uploader(&server)
            .upload(payload(1000), &metadata(), &access())
            .await
            .unwrap();
        assert_eq!(id, ExternalId::from("yt_123"));
    }

    #[tokio::test]
    async fn large_payload_is_sent_in_acknowledged_chunks() {
        let server = MockServer::start().await;
        let g = UPLOAD_GRANULARITY;
        let total = 2 * g + 100;
        mount_session(&server, "big", total).await;
        chunk_mock("big", &format!("bytes 0-{}/{total}", g - 1))
            .respond_with(
                ResponseTemplate::new(308).insert_header("Range", format!("bytes=0-{}", g - 1)),
            )
            .expect(1)
            .mount(&server)
            .await;
        chunk_mock("big", &format!("bytes {g}-{}/{total}", 2 * g - 1))
            .respond_with(
                ResponseTemplate::new(308).insert_header("Range", format!("bytes=0-{}", 2 * g - 1)),
            )
            .expect(1)
            .mount(&server)
            .await;
        chunk_mock("big", &format!("bytes {}-{}/{total}", 2 * g, total - 1))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": "yt_big" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = uploader(&server)
            .upload(payload(total), &metadata(), &access())
            .await
            .unwrap();
        assert_eq!(id, ExternalId::from("yt_big"));
    }

    #[tokio::test]
    async fn partially_acknowledged_chunk_is_resent_from_the_gap() {
        let server = MockServer::start().await;
        let g = UPLOAD_GRANULARITY;
        let half = g / 2;
        let total = 2 * g;
        mount_session(&server, "partial", total).await;
        chunk_mock("partial", &format!("bytes 0-{}/{total}", g - 1))
            .respond_with(
                ResponseTemplate::new(308).insert_header("Range", format!("bytes=0-{}", half - 1)),
            )
            .expect(1)
            .mount(&server)
            .await;
        chunk_mock("partial", &format!("bytes {half}-{}/{total}", half + g - 1))
            .respond_with(
                ResponseTemplate::new(308)
                    .insert_header("Range", format!("bytes=0-{}", half + g - 1)),
            )
            .expect(1)
            .mount(&server)
            .await;
        chunk_mock("partial", &format!("bytes {}-{}/{total}", half + g, total - 1))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "yt_gap" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = uploader(&server)
            .upload(payload(total), &metadata(), &access())
            .await
            .unwrap();
        assert_eq!(id, ExternalId::from("yt_gap"));
    }

    #[tokio::test]
    async fn interrupted_chunk_resumes_from_reported_offset() {
        let server = MockServer::start().await;
        let g = UPLOAD_GRANULARITY;
        let total = g + 10;
        mount_session(&server, "flaky", total).await;
        chunk_mock("flaky", &format!("bytes 0-{}/{total}", g - 1))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        chunk_mock("flaky", &format!("bytes */{total}"))
            .respond_with(
                ResponseTemplate::new(308).insert_header("Range", format!("bytes=0-{}", g - 1)),
            )
            .expect(1)
            .mount(&server)
            .await;
        chunk_mock("flaky", &format!("bytes {g}-{}/{total}", total - 1))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "yt_resumed" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = uploader(&server)
            .upload(payload(total), &metadata(), &access())
            .await
            .unwrap();
        assert_eq!(id, ExternalId::from("yt_resumed"));
    }

    #[tokio::test]
    async fn persistent_server_errors_become_transport_failures() {
        let server = MockServer::start().await;
        let g = UPLOAD_GRANULARITY;
        let total = g + 10;
        mount_session(&server, "down", total).await;
        chunk_mock("down", &format!("bytes 0-{}/{total}", g - 1))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        chunk_mock("down", &format!("bytes */{total}"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = uploader(&server)
            .upload(payload(total), &metadata(), &access())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "{err:?}");
    }

    #[tokio::test]
    async fn session_errors_are_classified() {
        let cases = [
            (
                403,
                serde_json::json!({ "error": { "code": 403, "message": "The request cannot be completed because you have exceeded your quota.", "errors": [{ "reason": "quotaExceeded", "domain": "youtube.quota" }] } }),
                "quota",
            ),
            (
                401,
                serde_json::json!({ "error": { "code": 401, "message": "Invalid Credentials", "errors": [{ "reason": "authError" }] } }),
                "unauthorized",
            ),
            (
                403,
                serde_json::json!({ "error": { "code": 403, "message": "Request had insufficient authentication scopes.", "errors": [{ "reason": "insufficientPermissions" }] } }),
                "unauthorized",
            ),
            (
                400,
                serde_json::json!({ "error": { "code": 400, "message": "The request metadata specifies an invalid video title.", "errors": [{ "reason": "invalidTitle" }] } }),
                "rejected",
            ),
            (503, serde_json::json!({}), "transport"),
        ];

        for (status, body, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/upload/youtube/v3/videos"))
                .respond_with(ResponseTemplate::new(status).set_body_json(body))
                .mount(&server)
                .await;

            let err = uploader(&server)
                .upload(payload(10), &metadata(), &access())
                .await
                .unwrap_err();
            let kind = match err {
                Error::QuotaExceeded(_) => "quota",
                Error::Unauthorized(_) => "unauthorized",
                Error::Rejected(_) => "rejected",
                Error::Transport(_) => "transport",
                other => panic!("unexpected error {other:?}"),
            };
            assert_eq!(kind, expected, "status {status}");
        }
    }

    #[tokio::test]
    async fn success_without_an_id_is_not_trusted() {
        let server = MockServer::start().await;
        mount_session(&server, "noid", 10).await;
        Mock::given(method("PUT"))
            .and(path("/session/noid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let err = uploader(&server)
            .upload(payload(10), &metadata(), &access())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn expired_session_is_a_transport_failure() {
        let g = UPLOAD_GRANULARITY;
        for status in [404, 410] {
            let server = MockServer::start().await;
            let total = g + 10;
            mount_session(&server, "gone", total).await;
            chunk_mock("gone", &format!("bytes 0-{}/{total}", g - 1))
                .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({
                    "error": { "code": status, "message": "Not Found", "errors": [{ "reason": "notFound" }] }
                })))
                .expect(1)
                .mount(&server)
                .await;

            let err = uploader(&server)
                .upload(payload(total), &metadata(), &access())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Transport(_)), "status {status}: {err:?}");
            assert!(err.is_retryable());
        }
    }

    #[tokio::test]
    async fn payload_longer_than_declared_is_refused() {
        let server = MockServer::start().await;
        let g = UPLOAD_GRANULARITY;
        let declared = g + 10;
        mount_session(&server, "long", declared).await;
        let mut long = payload(2 * g);
        long.len = declared as u64;

        let err = uploader(&server)
            .upload(long, &metadata(), &access())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)), "{err:?}");
    }

    #[test]
    fn chunk_size_must_be_a_positive_multiple_of_the_granularity() {
        for chunk_size in [0, UPLOAD_GRANULARITY / 2, UPLOAD_GRANULARITY + 1] {
            let config = Config {
                chunk_size,
                ..Config::default()
            };
            assert!(YouTubeUploader::new(&config).is_err(), "{chunk_size}");
        }
        let config = Config {
            chunk_size: 4 * UPLOAD_GRANULARITY,
            ..Config::default()
        };
        assert!(YouTubeUploader::new(&config).is_ok());
    }

    #[test]
    fn upload_steps_can_cross_threads() {
        fn assert_send<T: Send>(_: &T) {}
        let uploader = YouTubeUploader::new(&Config::default()).unwrap();
        let metadata = metadata();
        let access = access();
        let session = uploader.start_session(10, "video/mp4", &metadata, &access);
        assert_send(&session);
        let chunks = uploader.put_chunks("http://localhost/session", payload(10), &access);
        assert_send(&chunks);
        let whole = uploader.put_whole("http://localhost/session", payload(10), &access);
        assert_send(&whole);
    }

    #[test]
    fn range_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(acknowledged_bytes(&headers), 0);
        headers.insert(RANGE, "bytes=0-262143".parse().unwrap());
        assert_eq!(acknowledged_bytes(&headers), 262_144);
    }
}
