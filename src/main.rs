//! gpufleet - Keep a fleet of crash-prone GPU simulation servers alive
//!
//! Launches N server processes across a fixed set of GPUs, restarts them when
//! they die, isolates their logs per attempt and serves a live status dashboard.

#![allow(dead_code)] // Parts of the core API are only used by tests and the dashboard

mod core;
mod dashboard;
mod platform;

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use single_instance::SingleInstance;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::config::{carla_command, DEFAULT_CONTAINER_IMAGE};
use crate::core::policy::{RestartBudget, RestartPolicy};
use crate::core::{
    CommandLauncher, CommandTemplate, DashboardConfig, FleetConfig, FleetManager,
    ResourceMonitor, RunSession, SupervisorSettings,
};
use crate::dashboard::DashboardState;

/// Application name constant
pub const APP_NAME: &str = "gpufleet";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "gpufleet", version)]
#[command(about = "Supervise N GPU simulation servers, restart them on crash, serve their status", long_about = None)]
struct Args {
    /// Number of server instances
    #[arg(short = 'n', long, default_value_t = 8, env = "FLEET_INSTANCES")]
    instances: usize,

    /// Comma-separated GPU indices
    #[arg(long, value_delimiter = ',', default_value = "0", env = "FLEET_GPUS")]
    gpus: Vec<u32>,

    /// Maximum instances per GPU
    #[arg(long, default_value_t = 2, env = "FLEET_MAX_PER_GPU")]
    max_per_gpu: u32,

    /// Pause between an exit and the next launch
    #[arg(long, default_value_t = 100, env = "FLEET_RESTART_COOLDOWN_MS")]
    restart_cooldown_ms: u64,

    /// Give up on an instance after this many restarts inside the window
    #[arg(long, env = "FLEET_MAX_RESTARTS")]
    max_restarts: Option<u32>,

    /// Observation window for --max-restarts
    #[arg(long, default_value_t = 600, env = "FLEET_RESTART_WINDOW_SECS")]
    restart_window_secs: u64,

    /// Time a process must survive to count as running
    #[arg(long, default_value_t = 2000, env = "FLEET_START_GRACE_MS")]
    start_grace_ms: u64,

    /// Time between interrupt and forced kill on shutdown
    #[arg(long, default_value_t = 10_000, env = "FLEET_STOP_GRACE_MS")]
    stop_grace_ms: u64,

    /// Exit polling interval
    #[arg(long, default_value_t = 200, env = "FLEET_POLL_INTERVAL_MS")]
    poll_interval_ms: u64,

    /// Exit code treated as a clean exit
    #[arg(long, default_value_t = 0, allow_negative_numbers = true, env = "FLEET_CLEAN_EXIT_CODE")]
    clean_exit_code: i32,

    /// Directory under which run directories are created
    #[arg(long, default_value = "server_logs", env = "FLEET_LOG_DIR")]
    log_dir: PathBuf,

    /// RPC port of instance 0
    #[arg(long, default_value_t = 2000, env = "FLEET_BASE_PORT")]
    base_port: u16,

    /// Port distance between consecutive instances
    #[arg(long, default_value_t = 100, env = "FLEET_PORT_STEP")]
    port_step: u16,

    /// Serve the status dashboard (default)
    #[arg(long, overrides_with = "no_dashboard")]
    dashboard: bool,

    /// Do not serve the status dashboard
    #[arg(long, overrides_with = "dashboard", env = "FLEET_NO_DASHBOARD")]
    no_dashboard: bool,

    /// Dashboard bind address
    #[arg(long, default_value = "0.0.0.0", env = "FLEET_DASHBOARD_HOST")]
    dashboard_host: String,

    /// Dashboard port
    #[arg(long, default_value_t = 5000, env = "FLEET_DASHBOARD_PORT")]
    dashboard_port: u16,

    /// Host counter and status file refresh interval
    #[arg(long, default_value_t = 2000, env = "FLEET_DASHBOARD_REFRESH_MS")]
    dashboard_refresh_ms: u64,

    /// Container image for the default CARLA command
    #[arg(long, default_value = DEFAULT_CONTAINER_IMAGE, env = "FLEET_CONTAINER_IMAGE")]
    container_image: String,

    /// Working directory of every server (defaults to ours)
    #[arg(long, env = "FLEET_WORKING_DIR")]
    working_dir: Option<PathBuf>,

    /// Extra environment variable for every server, as KEY=VALUE (repeatable)
    #[arg(long = "server-env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
    server_env: Vec<(String, String)>,

    /// Server command; placeholders {gpu} {slot} {ordinal} {port}
    #[arg(last = true)]
    command: Vec<String>,
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

impl Args {
    fn launcher(&self) -> CommandLauncher {
        let mut launcher = CommandLauncher::new().with_environment(self.server_env.clone());
        if let Some(dir) = &self.working_dir {
            launcher = launcher.with_working_directory(dir);
        }
        launcher
    }

    fn into_config(self) -> FleetConfig {
        let command = match self.command.split_first() {
            Some((program, arguments)) => CommandTemplate::new(program.clone(), arguments.to_vec()),
            None => carla_command(&self.container_image),
        };

        FleetConfig {
            instances: self.instances,
            gpus: self.gpus,
            max_per_gpu: self.max_per_gpu,
            command,
            base_port: self.base_port,
            port_step: self.port_step,
            log_dir: self.log_dir,
            supervisor: SupervisorSettings {
                start_grace: Duration::from_millis(self.start_grace_ms),
                stop_grace: Duration::from_millis(self.stop_grace_ms),
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                clean_exit_code: self.clean_exit_code,
                restart: RestartPolicy {
                    cooldown: Duration::from_millis(self.restart_cooldown_ms),
                    budget: self.max_restarts.map(|max_restarts| RestartBudget {
                        max_restarts,
                        window: Duration::from_secs(self.restart_window_secs),
                    }),
                },
            },
            dashboard: DashboardConfig {
                enabled: !self.no_dashboard,
                host: self.dashboard_host,
                port: self.dashboard_port,
                refresh: Duration::from_millis(self.dashboard_refresh_ms),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let launcher = args.launcher();
    let mut config = args.into_config();
    config.validate()?;

    // One supervisor per host, so two fleets never overcommit the same GPUs.
    // Taken before anything is written to the log directory.
    let instance = SingleInstance::new(APP_NAME).context("Failed to create single instance lock")?;
    if !instance.is_single() {
        anyhow::bail!("Another {} supervisor is already running on this host", APP_NAME);
    }

    let session = RunSession::new(
        &config.log_dir,
        config.instances,
        config.gpus.clone(),
        config.max_per_gpu,
    );
    let root_error = session.create_root().err();
    let log_file = match root_error {
        None => open_supervisor_log(&session),
        Some(_) => None,
    };
    init_logging(log_file);

    info!("{} v{} starting...", APP_NAME, APP_VERSION);
    if let Some(e) = &root_error {
        warn!(
            "Could not create run directory {}: {}",
            session.root_dir.display(),
            e
        );
    }

    let fleet = Arc::new(FleetManager::new(config.clone(), session, Arc::new(launcher)));
    fleet.start()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut background = Vec::new();
    if config.dashboard.enabled {
        let state = DashboardState::new(Arc::clone(&fleet), config.dashboard.refresh);
        background.push(dashboard::spawn_poller(
            state.clone(),
            ResourceMonitor::new(),
            root_error.is_none(),
            stop_rx.clone(),
        ));

        let dashboard_config = config.dashboard.clone();
        let mut shutdown = stop_rx.clone();
        background.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown.changed().await;
            };
            if let Err(e) = dashboard::serve(state, &dashboard_config, shutdown).await {
                error!("Dashboard unavailable: {:#}", e);
            }
        }));
    }

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received, stopping fleet..."),
        _ = fleet.wait_all_terminal(config.supervisor.poll_interval) => {
            warn!("No instance left to supervise");
        }
    }

    let forced = fleet.stop_all(config.supervisor.stop_grace).await;
    let _ = stop_tx.send(true);
    for task in background {
        let _ = task.await;
    }

    let status = fleet.snapshot();
    if !status.summary.dead.is_empty() {
        error!(
            "Instances {:?} exhausted their restart budget",
            status.summary.dead
        );
    }
    if !forced.is_empty() {
        warn!("Instances {:?} had to be force-killed", forced);
    }
    info!(
        "{} shutting down, {} restarts in total, logs in {}",
        APP_NAME,
        status.summary.total_restarts,
        fleet.session().root_dir.display()
    );
    Ok(())
}

fn open_supervisor_log(session: &RunSession) -> Option<File> {
    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(session.supervisor_log())
    {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!(
                "Could not open {}: {}",
                session.supervisor_log().display(),
                e
            );
            None
        }
    }
}

/// Initialize the logging system
fn init_logging(log_file: Option<File>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gpufleet=info,tower_http=info"));

    let file_layer = log_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Arc::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
