//! 断点续传处理器：状态查询与分片写入。

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::{Extension, FromRequest, Multipart};
use axum::extract::multipart::MultipartError;
use axum::http::{HeaderMap, Request, header};
use axum::response::Json as JsonResponse;
use futures_util::stream::{Stream, StreamExt};
use http_body_util::BodyExt;
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::locking::LockManager;
use crate::protocol::{
    CHUNK_FIELD, ChunkRange, FILE_ID_HEADER, FILE_SIZE_HEADER, UploadReply, UploadSnapshot,
};
use crate::storage::{Storage, rollback_chunk};
use crate::tracker::OffsetTracker;

#[derive(Debug)]
pub struct UploadConfig {
    pub max_chunk_size: u64,
    pub lock_wait: Duration,
    pub tracker_idle_ttl: Duration,
}

/// 查询上传进度。
pub async fn upload_status(
    headers: HeaderMap,
    Extension(tracker): Extension<Arc<OffsetTracker>>,
) -> Result<JsonResponse<UploadReply>, ApiError> {
    let total = headers
        .get(FILE_SIZE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("{FILE_SIZE_HEADER} is required")))?;
    let id = file_id(&headers)?;

    let uploaded = tracker.confirmed_offset(&id).await?;
    debug!(upload_id = id, uploaded, total, "upload status");
    Ok(JsonResponse(UploadReply::ok(UploadSnapshot::new(
        uploaded, total,
    ))))
}

/// 接收单个分片，仅当起点等于已确认偏移量时写入。
pub async fn upload_chunk(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(tracker): Extension<Arc<OffsetTracker>>,
    Extension(locks): Extension<Arc<LockManager>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    request: Request<AxumBody>,
) -> Result<JsonResponse<UploadReply>, ApiError> {
    let range = request
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(ChunkRange::parse)
        .ok_or_else(|| ApiError::BadRequest("content-range is required".into()))?;
    let id = file_id(request.headers())?;
    if !range.is_ordered() {
        return Err(ApiError::BadRequest("content-range is out of bounds".into()));
    }
    if upload.max_chunk_size > 0 && range.len() > upload.max_chunk_size {
        return Err(ApiError::PayloadTooLarge(upload.max_chunk_size));
    }

    let _guard = locks
        .lock_with_timeout(&id, upload.lock_wait)
        .await
        .map_err(|_| ApiError::Conflict("upload is busy".into()))?;
    let expected = tracker.confirmed_offset(&id).await?;
    if range.start != expected || expected >= range.total {
        debug!(
            upload_id = id,
            expected,
            start = range.start,
            total = range.total,
            "chunk out of sequence"
        );
        discard_body(request.into_body()).await;
        return Ok(JsonResponse(UploadReply::ok(UploadSnapshot::new(
            expected,
            range.total,
        ))));
    }

    let multipart = is_multipart(request.headers());
    let mut file = storage.open_chunk_writer(&id, range.start).await?;
    let written = if multipart {
        write_multipart(&mut file, request, range.len()).await
    } else {
        write_stream(&mut file, BodyExt::into_data_stream(request.into_body()), range.len()).await
    };

    if let Err(err) = written {
        warn!(
            upload_id = id,
            start = range.start,
            end = range.end,
            error = %err,
            "chunk write failed, rolling back"
        );
        if let Err(rollback) = rollback_chunk(&mut file, range.start).await {
            warn!(upload_id = id, error = %rollback, "rollback failed");
            tracker.forget(&id).await;
        }
        return Err(err.into());
    }

    if !tracker.advance(&id, expected, range.end).await {
        warn!(upload_id = id, expected, "offset moved during chunk write, rolling back");
        if let Err(rollback) = rollback_chunk(&mut file, range.start).await {
            warn!(upload_id = id, error = %rollback, "rollback failed");
        }
        tracker.forget(&id).await;
        return Err(ApiError::Conflict("offset moved during write".into()));
    }
    drop(file);
    info!(
        upload_id = id,
        start = range.start,
        end = range.end,
        total = range.total,
        "chunk accepted"
    );
    Ok(JsonResponse(UploadReply::ok(UploadSnapshot::new(
        range.end,
        range.total,
    ))))
}

fn file_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(FILE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(format!("{FILE_ID_HEADER} is required")))
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("multipart/")
        })
}

/// 读完并丢弃请求体，保持连接可复用。
async fn discard_body(body: AxumBody) {
    let mut stream = BodyExt::into_data_stream(body);
    let mut discarded: u64 = 0;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(bytes) => discarded += bytes.len() as u64,
            Err(err) => {
                debug!(error = %err, discarded, "discarding body interrupted");
                return;
            }
        }
    }
    debug!(discarded, "request body discarded");
}

#[derive(Debug)]
enum PayloadError {
    Malformed(String),
    MissingField,
    LengthMismatch { expected: u64, received: u64 },
    Stream(String),
    Io(io::Error),
}

impl PayloadError {
    fn from_multipart(err: MultipartError) -> Self {
        if err.status().is_client_error() {
            PayloadError::Malformed(err.body_text())
        } else {
            PayloadError::Stream(err.body_text())
        }
    }
}

impl Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::Malformed(msg) => write!(f, "malformed multipart body: {msg}"),
            PayloadError::MissingField => f.write_str("multipart body has no chunk field"),
            PayloadError::LengthMismatch { expected, received } => write!(
                f,
                "payload length does not match content-range: expected {expected}, received {received}"
            ),
            PayloadError::Stream(msg) => write!(f, "payload stream failed: {msg}"),
            PayloadError::Io(err) => write!(f, "write failed: {err}"),
        }
    }
}

impl From<io::Error> for PayloadError {
    fn from(err: io::Error) -> Self {
        PayloadError::Io(err)
    }
}

impl From<PayloadError> for ApiError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::Malformed(_)
            | PayloadError::MissingField
            | PayloadError::LengthMismatch { .. } => ApiError::BadRequest(err.to_string()),
            PayloadError::Stream(_) | PayloadError::Io(_) => ApiError::Internal(err.to_string()),
        }
    }
}

async fn write_multipart(
    file: &mut File,
    request: Request<AxumBody>,
    expected: u64,
) -> Result<(), PayloadError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|err| PayloadError::Malformed(err.body_text()))?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(PayloadError::from_multipart)?
    {
        if field.file_name().is_some() || field.name() == Some(CHUNK_FIELD) {
            return write_stream(file, field, expected).await;
        }
    }
    Err(PayloadError::MissingField)
}

async fn write_stream<S, E>(file: &mut File, stream: S, expected: u64) -> Result<(), PayloadError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut received: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| PayloadError::Stream(err.to_string()))?;
        if chunk.is_empty() {
            continue;
        }
        received += chunk.len() as u64;
        if received > expected {
            return Err(PayloadError::LengthMismatch { expected, received });
        }
        file.write_all(&chunk).await?;
    }
    if received != expected {
        return Err(PayloadError::LengthMismatch { expected, received });
    }
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UploadStatus;
    use axum::http::HeaderValue;
    use futures_util::stream;
    use tempfile::tempdir;

    struct Fixture {
        _temp: tempfile::TempDir,
        storage: Arc<Storage>,
        tracker: Arc<OffsetTracker>,
        locks: Arc<LockManager>,
        upload: Arc<UploadConfig>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempdir().expect("tempdir");
            let root = temp.path().join("uploads");
            std::fs::create_dir_all(&root).expect("create uploads root");
            let storage = Arc::new(Storage::new(root));
            Self {
                tracker: Arc::new(OffsetTracker::new(storage.clone())),
                storage,
                locks: Arc::new(LockManager::new()),
                upload: Arc::new(UploadConfig {
                    max_chunk_size: 16 * 1024 * 1024,
                    lock_wait: Duration::from_secs(5),
                    tracker_idle_ttl: Duration::ZERO,
                }),
                _temp: temp,
            }
        }

        async fn status(&self, id: &str, size: u64) -> Result<UploadReply, ApiError> {
            let mut headers = HeaderMap::new();
            headers.insert(FILE_ID_HEADER, HeaderValue::from_str(id).expect("id"));
            headers.insert(
                FILE_SIZE_HEADER,
                HeaderValue::from_str(&size.to_string()).expect("size"),
            );
            upload_status(headers, Extension(self.tracker.clone()))
                .await
                .map(|JsonResponse(reply)| reply)
        }

        async fn chunk(&self, request: Request<AxumBody>) -> Result<UploadReply, ApiError> {
            upload_chunk(
                Extension(self.storage.clone()),
                Extension(self.tracker.clone()),
                Extension(self.locks.clone()),
                Extension(self.upload.clone()),
                request,
            )
            .await
            .map(|JsonResponse(reply)| reply)
        }

        fn stored(&self, id: &str) -> Vec<u8> {
            std::fs::read(self.storage.root_path().join(id)).unwrap_or_default()
        }
    }

    fn chunk_request(id: &str, range: ChunkRange, body: impl Into<AxumBody>) -> Request<AxumBody> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::CONTENT_RANGE, range.to_string())
            .header(FILE_ID_HEADER, id)
            .body(body.into())
            .expect("request")
    }

    fn multipart_request(id: &str, range: ChunkRange, payload: &[u8]) -> Request<AxumBody> {
        let mut body = Vec::new();
        body.extend_from_slice(
            b"--XBOUNDARY\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n",
        );
        body.extend_from_slice(
            b"--XBOUNDARY\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
              Content-Type: application/octet-stream\r\n\r\n",
        );
        body.extend_from_slice(payload);
        body.extend_from_slice(b"\r\n--XBOUNDARY--\r\n");
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::CONTENT_RANGE, range.to_string())
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
            .header(FILE_ID_HEADER, id)
            .body(AxumBody::from(body))
            .expect("request")
    }

    #[tokio::test]
    async fn two_chunk_upload_reports_resumable_then_completed() {
        let fx = Fixture::new();
        let total = 10_000_000;
        let first = vec![1u8; 5_000_000];
        let second = vec![2u8; 5_000_000];

        let reply = fx
            .chunk(chunk_request("big.bin", ChunkRange::new(0, 5_000_000, total), first.clone()))
            .await
            .expect("first chunk");
        assert_eq!(reply.data, Some(UploadSnapshot::new(5_000_000, total)));

        let status = fx.status("big.bin", total).await.expect("status");
        assert_eq!(
            status.data,
            Some(UploadSnapshot {
                status: UploadStatus::Resumable,
                uploaded_size: 5_000_000
            })
        );

        let reply = fx
            .chunk(chunk_request(
                "big.bin",
                ChunkRange::new(5_000_000, total, total),
                second.clone(),
            ))
            .await
            .expect("second chunk");
        assert_eq!(
            reply.data,
            Some(UploadSnapshot {
                status: UploadStatus::Completed,
                uploaded_size: total
            })
        );

        let stored = fx.stored("big.bin");
        assert_eq!(stored.len() as u64, total);
        assert_eq!(&stored[..5_000_000], &first[..]);
        assert_eq!(&stored[5_000_000..], &second[..]);
    }

    #[tokio::test]
    async fn out_of_sequence_chunk_is_rejected_without_writing() {
        let fx = Fixture::new();
        std::fs::write(fx.storage.root_path().join("big.bin"), vec![9u8; 3_000_000])
            .expect("seed file");

        let reply = fx
            .chunk(chunk_request(
                "big.bin",
                ChunkRange::new(5_000_000, 6_000_000, 10_000_000),
                vec![0u8; 1_000_000],
            ))
            .await
            .expect("reply");
        assert!(reply.success);
        assert_eq!(
            reply.data,
            Some(UploadSnapshot {
                status: UploadStatus::Resumable,
                uploaded_size: 3_000_000
            })
        );
        assert_eq!(
            fx.tracker.confirmed_offset("big.bin").await.expect("offset"),
            3_000_000
        );
        assert_eq!(fx.stored("big.bin"), vec![9u8; 3_000_000]);
    }

    #[tokio::test]
    async fn chunk_after_completion_is_a_no_op() {
        let fx = Fixture::new();
        fx.chunk(chunk_request("done.txt", ChunkRange::new(0, 5, 5), "hello"))
            .await
            .expect("upload");

        let status = fx.status("done.txt", 5).await.expect("status");
        assert_eq!(
            status.data,
            Some(UploadSnapshot {
                status: UploadStatus::Completed,
                uploaded_size: 5
            })
        );

        let reply = fx
            .chunk(chunk_request("done.txt", ChunkRange::new(5, 5, 5), ""))
            .await
            .expect("reply");
        assert_eq!(reply.data, Some(UploadSnapshot::new(5, 5)));
        assert_eq!(fx.stored("done.txt"), b"hello");
    }

    #[tokio::test]
    async fn multipart_chunk_field_is_written() {
        let fx = Fixture::new();
        let reply = fx
            .chunk(multipart_request("form.bin", ChunkRange::new(0, 4, 8), b"abcd"))
            .await
            .expect("first");
        assert_eq!(reply.data, Some(UploadSnapshot::new(4, 8)));
        fx.chunk(multipart_request("form.bin", ChunkRange::new(4, 8, 8), b"efgh"))
            .await
            .expect("second");
        assert_eq!(fx.stored("form.bin"), b"abcdefgh");
    }

    #[tokio::test]
    async fn broken_stream_leaves_offset_and_file_unchanged() {
        let fx = Fixture::new();
        fx.chunk(chunk_request("f", ChunkRange::new(0, 3, 9), "abc"))
            .await
            .expect("first chunk");

        let body = AxumBody::from_stream(stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from_static(b"de")),
            Err(io::Error::other("connection reset")),
        ]));
        let result = fx
            .chunk(chunk_request("f", ChunkRange::new(3, 6, 9), body))
            .await;
        assert!(matches!(result, Err(ApiError::Internal(_))));
        assert_eq!(fx.tracker.confirmed_offset("f").await.expect("offset"), 3);
        assert_eq!(fx.stored("f"), b"abc");
    }

    #[tokio::test]
    async fn offset_moved_mid_write_rolls_back_and_reconciles() {
        let fx = Fixture::new();
        let tracker = fx.tracker.clone();
        let body = AxumBody::from_stream(
            stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"ab"))]).chain(
                stream::once(async move {
                    assert!(tracker.advance("moved", 0, 2).await);
                    Ok(Bytes::from_static(b"cd"))
                }),
            ),
        );

        let result = fx
            .chunk(chunk_request("moved", ChunkRange::new(0, 4, 8), body))
            .await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));
        assert!(fx.stored("moved").is_empty());
        assert_eq!(fx.tracker.confirmed_offset("moved").await.expect("offset"), 0);
    }

    #[tokio::test]
    async fn payload_length_must_match_range() {
        let fx = Fixture::new();
        let short = fx
            .chunk(chunk_request("f", ChunkRange::new(0, 4, 8), "abc"))
            .await;
        assert!(matches!(short, Err(ApiError::BadRequest(_))));
        let long = fx
            .chunk(chunk_request("f", ChunkRange::new(0, 4, 8), "abcdef"))
            .await;
        assert!(matches!(long, Err(ApiError::BadRequest(_))));

        assert_eq!(fx.tracker.confirmed_offset("f").await.expect("offset"), 0);
        assert!(fx.stored("f").is_empty());
    }

    #[tokio::test]
    async fn missing_or_malformed_headers_are_rejected() {
        let fx = Fixture::new();
        let no_size = upload_status(HeaderMap::new(), Extension(fx.tracker.clone())).await;
        assert!(matches!(no_size, Err(ApiError::BadRequest(_))));

        let mut headers = HeaderMap::new();
        headers.insert(FILE_SIZE_HEADER, HeaderValue::from_static("-1"));
        headers.insert(FILE_ID_HEADER, HeaderValue::from_static("a"));
        let negative = upload_status(headers, Extension(fx.tracker.clone())).await;
        assert!(matches!(negative, Err(ApiError::BadRequest(_))));

        let empty_id = fx.status("", 10).await;
        assert!(matches!(empty_id, Err(ApiError::BadRequest(_))));

        let traversal = fx.status("..", 10).await;
        assert!(matches!(traversal, Err(ApiError::BadRequest(_))));

        let request = Request::builder()
            .method("POST")
            .header(header::CONTENT_RANGE, "bytes a-b/c")
            .header(FILE_ID_HEADER, "f")
            .body(AxumBody::from("x"))
            .expect("request");
        assert!(matches!(fx.chunk(request).await, Err(ApiError::BadRequest(_))));

        let reversed = fx
            .chunk(chunk_request("f", ChunkRange::new(4, 2, 8), ""))
            .await;
        assert!(matches!(reversed, Err(ApiError::BadRequest(_))));
        assert_eq!(fx.tracker.len().await, 0);
    }

    #[tokio::test]
    async fn oversized_chunk_is_refused() {
        let mut fx = Fixture::new();
        fx.upload = Arc::new(UploadConfig {
            max_chunk_size: 4,
            lock_wait: Duration::from_secs(1),
            tracker_idle_ttl: Duration::ZERO,
        });
        let result = fx
            .chunk(chunk_request("f", ChunkRange::new(0, 5, 5), "hello"))
            .await;
        assert!(matches!(result, Err(ApiError::PayloadTooLarge(4))));
    }

    #[tokio::test]
    async fn busy_upload_returns_conflict() {
        let mut fx = Fixture::new();
        fx.upload = Arc::new(UploadConfig {
            max_chunk_size: 0,
            lock_wait: Duration::from_millis(20),
            tracker_idle_ttl: Duration::ZERO,
        });
        let _guard = fx
            .locks
            .lock_with_timeout("f", Duration::from_secs(1))
            .await
            .expect("lock");
        let result = fx
            .chunk(chunk_request("f", ChunkRange::new(0, 3, 3), "abc"))
            .await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));
        assert!(fx.stored("f").is_empty());
    }

    #[tokio::test]
    async fn concurrent_chunks_for_same_id_apply_once() {
        let fx = Arc::new(Fixture::new());
        let mut tasks = Vec::new();
        for payload in ["aaaaa", "bbbbb"] {
            let fx = fx.clone();
            tasks.push(tokio::spawn(async move {
                fx.chunk(chunk_request("race", ChunkRange::new(0, 5, 10), payload))
                    .await
                    .expect("reply")
            }));
        }
        for task in tasks {
            let reply = task.await.expect("join");
            assert_eq!(reply.data, Some(UploadSnapshot::new(5, 10)));
        }

        let stored = fx.stored("race");
        assert!(stored == b"aaaaa" || stored == b"bbbbb", "{stored:?}");
        assert_eq!(fx.tracker.confirmed_offset("race").await.expect("offset"), 5);
    }
}
