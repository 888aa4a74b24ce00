//! 断点续传协议：请求头、分片范围与响应信封。

use serde::{Deserialize, Serialize};
use std::fmt;

pub const FILE_ID_HEADER: &str = "x-file-id";
pub const FILE_SIZE_HEADER: &str = "x-file-size";
pub const CHUNK_FIELD: &str = "chunk";

/// Completion state derived from the confirmed offset and the declared size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Resumable,
    Completed,
}

impl UploadStatus {
    /// 根据已确认字节数与声明总大小推导状态。
    pub fn derive(confirmed: u64, total: u64) -> Self {
        if confirmed >= total {
            UploadStatus::Completed
        } else {
            UploadStatus::Resumable
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSnapshot {
    pub status: UploadStatus,
    pub uploaded_size: u64,
}

impl UploadSnapshot {
    pub fn new(uploaded_size: u64, total: u64) -> Self {
        Self {
            status: UploadStatus::derive(uploaded_size, total),
            uploaded_size,
        }
    }
}

/// Byte range `[start, end)` of a file of `total` bytes.
///
/// Carried in the `content-range` header as `bytes <start>-<end>/<total>`.
/// The end is exclusive, which differs from RFC 9110 ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64, total: u64) -> Self {
        Self { start, end, total }
    }

    /// 解析 `content-range` 头，`bytes ` 前缀可选。
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let value = value.strip_prefix("bytes").unwrap_or(value).trim_start();
        let (range, total) = value.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        Some(Self {
            start: parse_digits(start)?,
            end: parse_digits(end)?,
            total: parse_digits(total)?,
        })
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// 起止与总大小是否自洽。
    pub fn is_ordered(&self) -> bool {
        self.start <= self.end && self.end <= self.total
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

fn parse_digits(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// JSON envelope returned by every upload endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReply {
    pub success: bool,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<UploadSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadReply {
    pub fn ok(snapshot: UploadSnapshot) -> Self {
        Self {
            success: true,
            status: 200,
            data: Some(snapshot),
            error: None,
        }
    }

    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            data: None,
            error: Some(message.into()),
        }
    }

    /// 转为类型化结果，供客户端判断是否需要重试。
    pub fn into_result(self) -> Result<UploadSnapshot, ReplyFailure> {
        match (self.success, self.data) {
            (true, Some(snapshot)) => Ok(snapshot),
            (true, None) => Err(ReplyFailure {
                status: 502,
                message: "reply carried no upload state".into(),
            }),
            (false, _) => Err(ReplyFailure {
                status: self.status,
                message: self.error.unwrap_or_default(),
            }),
        }
    }
}

/// A reply with `success: false`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyFailure {
    pub status: u16,
    pub message: String,
}

impl ReplyFailure {
    /// Server side trouble or a busy id; the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        self.status >= 500 || self.status == 409 || self.status == 429
    }
}

impl fmt::Display for ReplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}
