//! 测试辅助：在临时端口上启动完整的上传服务。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::build_router;
use crate::locking::LockManager;
use crate::storage::Storage;
use crate::tracker::OffsetTracker;
use crate::upload::UploadConfig;

pub struct TestServer {
    pub base_url: String,
    pub storage: Arc<Storage>,
    pub tracker: Arc<OffsetTracker>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Serves `root` on an ephemeral port with a fresh tracker, as after a restart.
    pub async fn start(root: PathBuf) -> Self {
        let storage = Arc::new(Storage::new(root));
        storage.ensure_root().await.expect("create uploads root");
        let tracker = Arc::new(OffsetTracker::new(storage.clone()));
        let upload = Arc::new(UploadConfig {
            max_chunk_size: 0,
            lock_wait: Duration::from_secs(5),
            tracker_idle_ttl: Duration::ZERO,
        });
        let router = build_router(
            storage.clone(),
            tracker.clone(),
            Arc::new(LockManager::new()),
            upload,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            storage,
            tracker,
            task,
        }
    }

    pub fn stored(&self, id: &str) -> Vec<u8> {
        std::fs::read(self.storage.root_path().join(id)).unwrap_or_default()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
