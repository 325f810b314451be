//! Status dashboard - Read-only HTTP view of the fleet

mod render;
mod routes;

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::core::{DashboardConfig, FleetManager, HostView, ResourceMonitor, RunLog};
pub use routes::{FleetView, StatusEntry};

/// Shared by every handler
#[derive(Clone)]
pub struct DashboardState {
    pub fleet: Arc<FleetManager>,
    /// Latest host sample, written only by the poller
    pub host: Arc<RwLock<HostView>>,
    /// Page auto-refresh interval
    pub refresh: Duration,
}

impl DashboardState {
    pub fn new(fleet: Arc<FleetManager>, refresh: Duration) -> Self {
        Self {
            fleet,
            host: Arc::new(RwLock::new(HostView::default())),
            refresh,
        }
    }
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(routes::index))
        .route("/status", get(routes::status))
        .route("/api/system", get(routes::system))
        .route("/api/fleet", get(routes::fleet))
        .route("/api/logs/:name", get(routes::log_tail))
        .route("/stream", get(routes::stream))
        .route("/health", get(routes::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the dashboard until `shutdown` resolves
pub async fn serve(
    state: DashboardState,
    config: &DashboardConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind dashboard on {}", addr))?;
    info!("Dashboard listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Dashboard server failed")?;
    Ok(())
}

/// Periodically sample the host. With `write_files`, each pass also rewrites
/// `status.json` and appends to the GPU, ports and system run logs.
///
/// Stops when `shutdown` changes or its sender is dropped.
pub fn spawn_poller(
    state: DashboardState,
    mut monitor: ResourceMonitor,
    write_files: bool,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let session = state.fleet.session().clone();
        let mut write_failed = false;
        loop {
            let status = state.fleet.snapshot();
            let host = monitor.sample(&status).await;
            *state.host.write().unwrap_or_else(PoisonError::into_inner) = host.clone();

            if write_files {
                let reports = [
                    (RunLog::Gpu, host.gpu_report()),
                    (RunLog::Ports, host.ports_report()),
                    (RunLog::System, host.system_report()),
                ];
                let view = FleetView { status, host };
                let mut result = write_status_file(&session.status_file(), &view).await;
                for (log, report) in reports {
                    if result.is_err() {
                        break;
                    }
                    result = append_run_log(&session.run_log(log), &report).await;
                }
                match result {
                    Ok(()) => write_failed = false,
                    Err(e) if !write_failed => {
                        warn!(
                            "Failed to write run files in {}: {:#}",
                            session.root_dir.display(),
                            e
                        );
                        write_failed = true;
                    }
                    Err(_) => {}
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(state.refresh) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("Dashboard poller stopped");
    })
}

/// Replace the status file atomically
async fn write_status_file(path: &Path, view: &FleetView) -> Result<()> {
    let json = serde_json::to_vec_pretty(view)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn append_run_log(path: &Path, report: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(report.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{wait_until, ScriptedLauncher};
    use crate::core::{CommandTemplate, FleetConfig, RunSession};
    use std::future::IntoFuture;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn state(dir: &Path) -> DashboardState {
        let config = FleetConfig {
            instances: 2,
            gpus: vec![0],
            max_per_gpu: 2,
            command: CommandTemplate::new("server", vec![]),
            ..Default::default()
        };
        let session = RunSession::new(dir, 2, vec![0], 2);
        let fleet = FleetManager::new(config, session, Arc::new(ScriptedLauncher::new()));
        DashboardState::new(Arc::new(fleet), Duration::from_millis(50))
    }

    async fn get(port: u16, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_routes_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        state.fleet.start().unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(axum::serve(listener, router(state.clone())).into_future());

        let health = get(port, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains("healthy"));

        let status = get(port, "/status").await;
        assert!(status.starts_with("HTTP/1.1 200"));
        assert!(status.contains("\"ordinal\":1"));

        let missing = get(port, "/api/logs/9").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        let invalid = get(port, "/api/logs/servers").await;
        assert!(invalid.starts_with("HTTP/1.1 400"));

        server.abort();
        state.fleet.stop_all(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn stream_pushes_fleet_views() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        state.fleet.start().unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(axum::serve(listener, router(state.clone())).into_future());

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        // The stream never ends, so read until two events have arrived
        let mut received = String::new();
        let mut buf = [0u8; 4096];
        let read = tokio::time::timeout(Duration::from_secs(10), async {
            while received.matches("data:").count() < 2 {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "stream closed early");
                received.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
        })
        .await;
        assert!(read.is_ok(), "no events in {:?}", received);

        assert!(received.starts_with("HTTP/1.1 200"));
        assert!(received.contains("text/event-stream"));
        assert!(received.contains("\"summary\""));
        assert!(received.contains("\"ordinal\":1"));

        server.abort();
        state.fleet.stop_all(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn poller_writes_run_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let session = state.fleet.session().clone();
        session.create_root().unwrap();
        state.fleet.start().unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = spawn_poller(
            state.clone(),
            ResourceMonitor::with_gpu_tool("/nonexistent/nvidia-smi"),
            true,
            stop_rx,
        );

        let ports_log = session.run_log(RunLog::Ports);
        // Two passes, so appends are visible
        assert!(
            wait_until(Duration::from_secs(10), || {
                std::fs::read_to_string(&ports_log)
                    .map(|text| text.matches("=== ").count() >= 2)
                    .unwrap_or(false)
            })
            .await
        );

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(session.status_file()).unwrap()).unwrap();
        assert_eq!(json["instances"].as_array().unwrap().len(), 2);
        assert!(json["host"]["sampled_at"].is_string());
        assert!(state.host.read().unwrap().sampled_at.is_some());

        let ports = std::fs::read_to_string(&ports_log).unwrap();
        assert!(ports.contains("instance 1 port 2100"));
        let gpu = std::fs::read_to_string(session.run_log(RunLog::Gpu)).unwrap();
        assert!(gpu.contains("no GPU data"));
        let system = std::fs::read_to_string(session.run_log(RunLog::System)).unwrap();
        assert!(system.contains("memory"));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), poller)
            .await
            .unwrap()
            .unwrap();
        state.fleet.stop_all(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn poller_without_files_only_caches() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let session = state.fleet.session().clone();
        session.create_root().unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = spawn_poller(
            state.clone(),
            ResourceMonitor::with_gpu_tool("/nonexistent/nvidia-smi"),
            false,
            stop_rx,
        );
        assert!(
            wait_until(Duration::from_secs(10), || {
                state.host.read().unwrap().sampled_at.is_some()
            })
            .await
        );
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), poller)
            .await
            .unwrap()
            .unwrap();

        assert!(!session.status_file().exists());
        assert!(!session.run_log(RunLog::Gpu).exists());
    }
}
