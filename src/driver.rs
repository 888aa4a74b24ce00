//! 客户端上传驱动：切片、顺序发送、对账、重试与暂停/继续。
//!
//! At most one chunk request is in flight per driver. The server's reply is
//! the only thing that moves the local offset, so an interrupted run never
//! skips bytes the server has not confirmed.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{TransportError, UploadTransport};
use crate::protocol::{ChunkRange, ReplyFailure};

#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub chunk_size: u64,
    pub max_transport_retries: u32,
    pub max_rejections: u32,
    pub retry_backoff: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Active,
    Paused,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub uploaded: u64,
    pub total: u64,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.uploaded.min(self.total) as f64) / (self.total as f64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed { total: u64 },
    AlreadyComplete { total: u64 },
    Paused { offset: u64 },
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        state: DriverState,
        action: &'static str,
    },
    #[error("transport failed after {attempts} attempts: {source}")]
    TransportExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("server kept failing chunk at offset {offset} after {attempts} attempts: {last}")]
    RejectionsExhausted {
        offset: u64,
        attempts: u32,
        last: ReplyFailure,
    },
    #[error("server refused upload: {0}")]
    Server(ReplyFailure),
    #[error("failed to read local file: {0}")]
    Io(#[from] io::Error),
}

/// A local file and the id it is uploaded under.
#[derive(Clone, Debug)]
pub struct UploadFile {
    id: String,
    path: PathBuf,
    size: u64,
}

impl UploadFile {
    /// 打开本地文件，默认以文件名作为上传 id。
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "upload source is not a regular file",
            ));
        }
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        Ok(Self {
            id,
            path,
            size: metadata.len(),
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, range: ChunkRange) -> io::Result<Vec<u8>> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; range.len() as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Cloneable control surface usable while the driver is running.
#[derive(Clone, Debug)]
pub struct DriverHandle {
    pause_requested: Arc<AtomicBool>,
    progress: watch::Receiver<Progress>,
}

impl DriverHandle {
    /// 请求暂停：当前分片完成后不再调度新分片。
    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }
}

pub struct UploadDriver<T> {
    transport: T,
    config: DriverConfig,
    state: DriverState,
    file: Option<UploadFile>,
    offset: u64,
    pause_requested: Arc<AtomicBool>,
    progress: watch::Sender<Progress>,
}

impl<T: UploadTransport> UploadDriver<T> {
    pub fn new(transport: T, config: DriverConfig) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            transport,
            config,
            state: DriverState::Idle,
            file: None,
            offset: 0,
            pause_requested: Arc::new(AtomicBool::new(false)),
            progress,
        }
    }

    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            pause_requested: self.pause_requested.clone(),
            progress: self.progress.subscribe(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// 从服务端报告的偏移量开始上传。
    pub async fn start(&mut self, file: UploadFile) -> Result<UploadOutcome, DriverError> {
        if self.state != DriverState::Idle {
            return Err(DriverError::InvalidState {
                state: self.state,
                action: "start",
            });
        }
        self.pause_requested.store(false, Ordering::SeqCst);

        let total = file.size();
        let offset = self.query_offset(&file).await?;
        self.progress.send_replace(Progress {
            uploaded: offset.min(total),
            total,
        });
        if offset >= total {
            info!(upload_id = file.id(), total, "file is already uploaded");
            self.offset = total;
            return Ok(UploadOutcome::AlreadyComplete { total });
        }

        info!(upload_id = file.id(), offset, total, "upload started");
        self.offset = offset;
        self.file = Some(file);
        self.state = DriverState::Active;
        self.run().await
    }

    /// 从最后确认的偏移量继续。
    pub async fn resume(&mut self) -> Result<UploadOutcome, DriverError> {
        if self.state != DriverState::Paused {
            return Err(DriverError::InvalidState {
                state: self.state,
                action: "resume",
            });
        }
        self.pause_requested.store(false, Ordering::SeqCst);
        self.state = DriverState::Active;
        self.run().await
    }

    async fn query_offset(&self, file: &UploadFile) -> Result<u64, DriverError> {
        let mut failures = 0;
        loop {
            match self.transport.query_status(file.id(), file.size()).await {
                Ok(reply) => {
                    return reply
                        .into_result()
                        .map(|snapshot| snapshot.uploaded_size)
                        .map_err(DriverError::Server);
                }
                Err(err) => {
                    failures += 1;
                    if failures > self.config.max_transport_retries {
                        return Err(DriverError::TransportExhausted {
                            attempts: failures,
                            source: err,
                        });
                    }
                    warn!(upload_id = file.id(), attempt = failures, error = %err, "status query failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
    }

    async fn run(&mut self) -> Result<UploadOutcome, DriverError> {
        let result = self.chunk_loop().await;
        if let Err(err) = &result {
            warn!(offset = self.offset, error = %err, "upload stopped");
            self.state = DriverState::Idle;
            self.file = None;
        }
        result
    }

    async fn chunk_loop(&mut self) -> Result<UploadOutcome, DriverError> {
        let Some(file) = self.file.clone() else {
            return Err(DriverError::InvalidState {
                state: self.state,
                action: "upload without a file",
            });
        };
        let total = file.size();
        let chunk_size = self.config.chunk_size.max(1);
        let mut transport_failures = 0;
        let mut rejections = 0;

        loop {
            if self.offset >= total {
                self.publish(total, total);
                self.state = DriverState::Idle;
                self.file = None;
                info!(upload_id = file.id(), total, "upload completed");
                return Ok(UploadOutcome::Completed { total });
            }
            if self.pause_requested.load(Ordering::SeqCst) {
                self.state = DriverState::Paused;
                info!(upload_id = file.id(), offset = self.offset, "upload paused");
                return Ok(UploadOutcome::Paused {
                    offset: self.offset,
                });
            }

            let range = ChunkRange::new(
                self.offset,
                self.offset.saturating_add(chunk_size).min(total),
                total,
            );
            let payload = file.read_range(range).await?;
            let sent = self.transport.send_chunk(file.id(), range, payload).await;
            let failure = match sent {
                Ok(reply) => match reply.into_result() {
                    Ok(snapshot) if snapshot.uploaded_size != self.offset => {
                        if snapshot.uploaded_size != range.end {
                            debug!(
                                upload_id = file.id(),
                                sent_end = range.end,
                                confirmed = snapshot.uploaded_size,
                                "resynchronized with server offset"
                            );
                        }
                        transport_failures = 0;
                        rejections = 0;
                        self.offset = snapshot.uploaded_size;
                        self.publish(self.offset, total);
                        continue;
                    }
                    Ok(_) => ReplyFailure {
                        status: 200,
                        message: "server did not advance the offset".into(),
                    },
                    Err(failure) if failure.is_retryable() => failure,
                    Err(failure) => return Err(DriverError::Server(failure)),
                },
                Err(err) => {
                    transport_failures += 1;
                    if transport_failures > self.config.max_transport_retries {
                        return Err(DriverError::TransportExhausted {
                            attempts: transport_failures,
                            source: err,
                        });
                    }
                    warn!(
                        upload_id = file.id(),
                        %range,
                        attempt = transport_failures,
                        error = %err,
                        "chunk transport failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                    continue;
                }
            };

            rejections += 1;
            if rejections > self.config.max_rejections {
                return Err(DriverError::RejectionsExhausted {
                    offset: self.offset,
                    attempts: rejections,
                    last: failure,
                });
            }
            warn!(
                upload_id = file.id(),
                %range,
                attempt = rejections,
                reason = %failure,
                "server rejected chunk, retrying"
            );
            tokio::time::sleep(self.config.retry_backoff * rejections).await;
        }
    }

    /// Progress only moves forward within one upload.
    fn publish(&self, uploaded: u64, total: u64) {
        self.progress.send_if_modified(|progress| {
            if uploaded > progress.uploaded {
                progress.uploaded = uploaded;
                progress.total = total;
                true
            } else {
                false
            }
        });
    }
}
