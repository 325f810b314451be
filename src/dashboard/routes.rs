//! Dashboard HTTP handlers. All read-only.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::PoisonError;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Html;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::{Stream, StreamExt};

use super::{render, DashboardState};
use crate::core::logs;
use crate::core::{FleetStatus, HostView, InstanceRecord, InstanceState, RunLog};

/// Lines returned by the log tail endpoint
pub const LOG_TAIL_LINES: usize = 100;

/// One row of `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub ordinal: usize,
    pub state: InstanceState,
    pub gpu: u32,
    pub slot: u32,
    pub port: u16,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    pub last_exit_signal: Option<i32>,
    pub log_path: Option<PathBuf>,
    pub last_error: Option<String>,
    pub logging_error: Option<String>,
    pub forced_kill: bool,
    pub uptime: String,
}

impl From<&InstanceRecord> for StatusEntry {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            ordinal: record.ordinal,
            state: record.state,
            gpu: record.assignment.gpu,
            slot: record.assignment.slot,
            port: record.port,
            pid: record.pid,
            restart_count: record.restart_count,
            last_exit_code: record.last_exit_code(),
            last_exit_signal: record.last_exit.and_then(|e| e.signal),
            log_path: record.log_path.clone(),
            last_error: record.last_error.clone(),
            logging_error: record.logging_error.clone(),
            forced_kill: record.forced_kill,
            uptime: record.uptime_string(),
        }
    }
}

/// Body of `GET /api/fleet`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetView {
    #[serde(flatten)]
    pub status: FleetStatus,
    pub host: HostView,
}

fn host_view(state: &DashboardState) -> HostView {
    state
        .host
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub async fn index(State(state): State<DashboardState>) -> Html<String> {
    let status = state.fleet.snapshot();
    Html(render::page(&status, &host_view(&state), state.refresh))
}

pub async fn status(State(state): State<DashboardState>) -> Json<Vec<StatusEntry>> {
    let status = state.fleet.snapshot();
    Json(status.instances.iter().map(StatusEntry::from).collect())
}

pub async fn system(State(state): State<DashboardState>) -> Json<HostView> {
    Json(host_view(&state))
}

pub async fn fleet(State(state): State<DashboardState>) -> Json<FleetView> {
    Json(FleetView {
        status: state.fleet.snapshot(),
        host: host_view(&state),
    })
}

/// Live fleet view, one event per refresh interval
pub async fn stream(
    State(state): State<DashboardState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ticks = IntervalStream::new(tokio::time::interval(state.refresh));
    let events = ticks.map(move |_| {
        let view = FleetView {
            status: state.fleet.snapshot(),
            host: host_view(&state),
        };
        Ok(Event::default().json_data(&view).unwrap_or_else(|e| {
            Event::default().data(json!({ "error": e.to_string() }).to_string())
        }))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Tail of an instance's current attempt log (`/api/logs/3`) or of a
/// fleet-wide run log (`/api/logs/supervisor`, `gpu`, `ports`, `system`)
pub async fn log_tail(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
) -> Result<String, (StatusCode, String)> {
    let path = match name.parse::<usize>() {
        Ok(ordinal) => {
            let record = state
                .fleet
                .record(ordinal)
                .ok_or((StatusCode::NOT_FOUND, format!("no instance {}", ordinal)))?;
            record.log_path.ok_or((
                StatusCode::NOT_FOUND,
                format!("instance {} has no log file", ordinal),
            ))?
        }
        Err(_) => {
            let log = RunLog::from_name(&name)
                .ok_or((StatusCode::BAD_REQUEST, format!("invalid log {:?}", name)))?;
            state.fleet.session().run_log(log)
        }
    };

    let lines = tokio::task::spawn_blocking(move || logs::tail(&path, LOG_TAIL_LINES))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => (StatusCode::NOT_FOUND, e.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        })?;

    let mut body = lines.join("\n");
    body.push('\n');
    Ok(body)
}

pub async fn health(State(state): State<DashboardState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "gpufleet",
        "version": env!("CARGO_PKG_VERSION"),
        "instances": state.fleet.instance_count(),
    }))
}
