//! 上传客户端的 HTTP 传输层。

use reqwest::Url;
use reqwest::header::{CACHE_CONTROL, CONTENT_RANGE};
use reqwest::multipart::{Form, Part};
use std::future::Future;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{CHUNK_FIELD, ChunkRange, FILE_ID_HEADER, FILE_SIZE_HEADER, UploadReply};

/// Failure to get any usable reply out of the server.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected reply ({status}): {body}")]
    Decode { status: u16, body: String },
}

/// The two calls of the resumable upload protocol.
pub trait UploadTransport: Send + Sync {
    fn query_status(
        &self,
        id: &str,
        total_size: u64,
    ) -> impl Future<Output = Result<UploadReply, TransportError>> + Send;

    fn send_chunk(
        &self,
        id: &str,
        range: ChunkRange,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<UploadReply, TransportError>> + Send;
}

#[derive(Clone, Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let endpoint = Url::parse(base_url)
            .and_then(|base| base.join("/upload"))
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// 无论 HTTP 状态码如何都解析 JSON 信封。
    async fn decode(response: reqwest::Response) -> Result<UploadReply, TransportError> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|_| TransportError::Decode { status, body })
    }
}

impl UploadTransport for HttpTransport {
    async fn query_status(&self, id: &str, total_size: u64) -> Result<UploadReply, TransportError> {
        let response = self
            .http
            .get(self.endpoint.clone())
            .header(FILE_ID_HEADER, id)
            .header(FILE_SIZE_HEADER, total_size.to_string())
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn send_chunk(
        &self,
        id: &str,
        range: ChunkRange,
        payload: Vec<u8>,
    ) -> Result<UploadReply, TransportError> {
        debug!(upload_id = id, %range, "sending chunk");
        let form = Form::new().part(CHUNK_FIELD, Part::bytes(payload).file_name("blob"));
        let response = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_RANGE, range.to_string())
            .header(FILE_ID_HEADER, id)
            .multipart(form)
            .send()
            .await?;
        Self::decode(response).await
    }
}
