//! AxoResume binary.
//!
//! `serve` runs the resumable upload server: a status endpoint and a chunk
//! endpoint backed by one file per upload id. `push` drives an upload from the
//! command line, resuming from whatever the server has already confirmed.

mod background;
mod client;
mod config;
mod driver;
mod error;
mod http;
mod locking;
mod logging;
mod protocol;
mod storage;
#[cfg(test)]
mod testing;
mod tracker;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::get;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::client::HttpTransport;
use crate::config::{Args, Command, PushArgs, ServeArgs};
use crate::driver::{DriverConfig, UploadDriver, UploadFile, UploadOutcome};
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::locking::LockManager;
use crate::protocol::FILE_ID_HEADER;
use crate::storage::Storage;
use crate::tracker::OffsetTracker;
use crate::upload::UploadConfig;

shadow!(build);

#[tokio::main]
async fn main() -> Result<(), io::Error> {
    let args = Args::parse();
    match args.command {
        Command::Serve(serve_args) => {
            logging::init_logging("info");
            serve(serve_args).await
        }
        Command::Push(push_args) => {
            logging::init_logging("warn,axo_resume=info");
            push(push_args).await
        }
    }
}

/// Builds the upload router with its shared state attached.
pub(crate) fn build_router(
    storage: Arc<Storage>,
    tracker: Arc<OffsetTracker>,
    locks: Arc<LockManager>,
    upload: Arc<UploadConfig>,
) -> Router {
    Router::new()
        .route(
            "/upload",
            get(upload::upload_status)
                .post(upload::upload_chunk)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    let upload_id = request
                        .headers()
                        .get(FILE_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("");

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        upload_id,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(tracker))
        .layer(Extension(locks))
        .layer(Extension(upload))
}

/// Starts the upload server and blocks until shutdown.
async fn serve(args: ServeArgs) -> Result<(), io::Error> {
    let storage = Arc::new(Storage::new(PathBuf::from(&args.uploads_dir)));
    storage.ensure_root().await?;
    let tracker = Arc::new(OffsetTracker::new(storage.clone()));
    let locks = Arc::new(LockManager::new());
    let upload_config = Arc::new(UploadConfig {
        max_chunk_size: args.max_chunk_size,
        lock_wait: Duration::from_secs(args.lock_wait_secs),
        tracker_idle_ttl: Duration::from_secs(args.tracker_idle_ttl_secs),
    });

    let mut app = build_router(
        storage.clone(),
        tracker.clone(),
        locks.clone(),
        upload_config.clone(),
    );
    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    info!(uploads_dir = ?storage.root_path(), "Serving uploads");

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(tracker, locks, upload_config);
    tokio::select! {
        result = http_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

/// Uploads one file; Ctrl+C pauses after the in-flight chunk, Enter resumes.
async fn push(args: PushArgs) -> Result<(), io::Error> {
    let transport = HttpTransport::new(&args.server).map_err(io::Error::other)?;
    let mut file = UploadFile::open(&args.file).await?;
    if let Some(id) = args.id {
        file = file.with_id(id);
    }
    info!(
        endpoint = %transport.endpoint(),
        upload_id = file.id(),
        size = file.size(),
        "pushing file"
    );

    let mut driver = UploadDriver::new(
        transport,
        DriverConfig {
            chunk_size: args.chunk_size,
            max_transport_retries: args.retries,
            max_rejections: args.max_rejections,
            retry_backoff: Duration::from_millis(args.retry_backoff_ms),
        },
    );
    let handle = driver.handle();

    let pause_handle = handle.clone();
    tokio::spawn(async move {
        while signal::ctrl_c().await.is_ok() {
            pause_handle.pause();
        }
    });

    let mut progress = handle.subscribe();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = *progress.borrow_and_update();
            info!(
                uploaded = current.uploaded,
                total = current.total,
                "progress {:.2}%",
                current.fraction() * 100.0
            );
        }
    });

    let mut outcome = driver.start(file).await.map_err(io::Error::other)?;
    loop {
        match outcome {
            UploadOutcome::Completed { total } => info!(total, "Upload completed"),
            UploadOutcome::AlreadyComplete { total } => info!(total, "File is already uploaded"),
            UploadOutcome::Paused { offset } => {
                info!(
                    offset,
                    "Upload paused at {:.2}%, press Enter to resume or Ctrl+C to stop",
                    handle.progress().fraction() * 100.0
                );
                if wait_for_resume().await {
                    outcome = driver.resume().await.map_err(io::Error::other)?;
                    continue;
                }
                info!(offset, "Run the same command again to resume");
            }
        }
        return Ok(());
    }
}

/// 暂停后等待用户输入：回车继续，Ctrl+C 或输入结束则退出。
async fn wait_for_resume() -> bool {
    let (tx, rx) = oneshot::channel();
    // tokio's stdin would block runtime shutdown until a line arrives
    std::thread::spawn(move || {
        let mut line = String::new();
        let read = std::io::stdin()
            .read_line(&mut line)
            .is_ok_and(|n| n > 0);
        let _ = tx.send(read);
    });
    tokio::select! {
        read = rx => read.unwrap_or(false),
        _ = signal::ctrl_c() => false,
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
