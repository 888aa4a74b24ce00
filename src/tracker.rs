//! 上传偏移量跟踪：内存缓存，首次访问时以文件长度为准对账。
//!
//! The stored file length is the record of truth. Entries here only save a
//! metadata probe per request and can be dropped at any time while no chunk
//! write holds the upload's lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::locking::LockManager;
use crate::storage::{Storage, StorageError};

#[derive(Debug)]
struct TrackedOffset {
    offset: u64,
    touched: Instant,
}

#[derive(Debug)]
pub struct OffsetTracker {
    storage: Arc<Storage>,
    entries: Mutex<HashMap<String, TrackedOffset>>,
}

impl OffsetTracker {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 返回已确认的字节数，未缓存时从存储文件长度恢复。
    pub async fn confirmed_offset(&self, id: &str) -> Result<u64, StorageError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.touched = Instant::now();
            return Ok(entry.offset);
        }

        let offset = self.storage.stored_len(id).await?.unwrap_or(0);
        debug!(upload_id = id, offset, "offset reconciled from storage");
        entries.insert(
            id.to_string(),
            TrackedOffset {
                offset,
                touched: Instant::now(),
            },
        );
        Ok(offset)
    }

    /// Moves the offset from `expected` to `new`. Fails when another writer
    /// got there first or the move would go backwards.
    pub async fn advance(&self, id: &str, expected: u64, new: u64) -> bool {
        if new < expected {
            return false;
        }
        let mut entries = self.entries.lock().await;
        match entries.get_mut(id) {
            Some(entry) if entry.offset == expected => {
                entry.offset = new;
                entry.touched = Instant::now();
                true
            }
            Some(_) => false,
            None => {
                entries.insert(
                    id.to_string(),
                    TrackedOffset {
                        offset: new,
                        touched: Instant::now(),
                    },
                );
                true
            }
        }
    }

    pub async fn forget(&self, id: &str) -> bool {
        self.entries.lock().await.remove(id).is_some()
    }

    /// 清理超过 `ttl` 未访问且未被写入锁持有的条目。
    pub async fn evict_idle(&self, ttl: Duration, locks: &LockManager) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.touched) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = 0;
        for id in stale {
            if locks.is_held(&id).await {
                continue;
            }
            entries.remove(&id);
            evicted += 1;
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
