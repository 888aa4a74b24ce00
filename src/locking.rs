//! 上传 id 级别的内存锁：串行化同一上传的分片写入。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

/// Manages asynchronous mutexes keyed by upload id.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    /// 创建新的锁管理器实例。
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在给定超时时间内获取上传锁，超时返回 Err。
    pub async fn lock_with_timeout(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, ()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| ())
    }

    /// Whether a chunk write currently holds the lock for `id`.
    pub async fn is_held(&self, id: &str) -> bool {
        let locks = self.locks.lock().await;
        match locks.get(id) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }

    /// 移除无人持有也无人等待的锁，返回移除数量。
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
