//! 后台任务：清理闲置的偏移量缓存与上传锁。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::TRACKER_EVICT_INTERVAL_SECS;
use crate::locking::LockManager;
use crate::tracker::OffsetTracker;
use crate::upload::UploadConfig;

/// 启动后台清理任务。
pub fn spawn_background_tasks(
    tracker: Arc<OffsetTracker>,
    locks: Arc<LockManager>,
    upload: Arc<UploadConfig>,
) {
    if upload.tracker_idle_ttl.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(TRACKER_EVICT_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let evicted = tracker.evict_idle(upload.tracker_idle_ttl, &locks).await;
            let pruned = locks.prune_idle().await;
            if evicted > 0 || pruned > 0 {
                let tracked = tracker.len().await;
                debug!(evicted, pruned, tracked, "evicted idle upload state");
            }
        }
    });
}
