//! Fleet state - Owns every instance supervisor of a run

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::allocator::GpuAllocator;
use super::config::FleetConfig;
use super::error::{FleetError, FleetResult};
use super::instance::{InstanceRecord, InstanceState, SharedRecord};
use super::logs::LogManager;
use super::process::ProcessLauncher;
use super::session::RunSession;
use super::supervisor::{InstanceSupervisor, StopSignal};

/// Extra time granted to `stop_all` on top of the grace period, covering the kill
const KILL_MARGIN: Duration = Duration::from_secs(1);

/// Counts per state plus restart total
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSummary {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub total_restarts: u32,
    /// Instances that need an operator
    pub dead: Vec<usize>,
}

impl FleetSummary {
    pub fn count(&self, state: InstanceState) -> usize {
        self.by_state.get(state.label()).copied().unwrap_or(0)
    }
}

/// Point-in-time copy of every instance record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStatus {
    pub session: RunSession,
    pub generated_at: DateTime<Utc>,
    pub summary: FleetSummary,
    pub instances: Vec<InstanceRecord>,
}

impl FleetStatus {
    pub fn from_records(session: RunSession, instances: Vec<InstanceRecord>) -> Self {
        let mut summary = FleetSummary {
            total: instances.len(),
            ..Default::default()
        };
        for state in InstanceState::all() {
            summary.by_state.insert(state.label().to_string(), 0);
        }
        for record in &instances {
            *summary
                .by_state
                .entry(record.state.label().to_string())
                .or_default() += 1;
            summary.total_restarts += record.restart_count;
            if record.state == InstanceState::Dead {
                summary.dead.push(record.ordinal);
            }
        }
        Self {
            session,
            generated_at: Utc::now(),
            summary,
            instances,
        }
    }

    /// Every instance is STOPPED or DEAD
    pub fn all_terminal(&self) -> bool {
        self.instances.iter().all(|r| r.state.is_terminal())
    }
}

struct Worker {
    ordinal: usize,
    stop_tx: watch::Sender<StopSignal>,
    join: JoinHandle<()>,
}

/// Creates, owns and stops the supervisors of one run
pub struct FleetManager {
    config: FleetConfig,
    session: RunSession,
    launcher: Arc<dyn ProcessLauncher>,
    /// Coarse lock, held only while the record list is assembled or copied
    records: RwLock<Vec<SharedRecord>>,
    workers: Mutex<Vec<Worker>>,
}

impl FleetManager {
    pub fn new(config: FleetConfig, session: RunSession, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            config,
            session,
            launcher,
            records: RwLock::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &RunSession {
        &self.session
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Allocate GPU slots and launch one supervisor per instance.
    ///
    /// Nothing is launched unless the whole configuration is valid.
    pub fn start(&self) -> FleetResult<()> {
        let mut config = self.config.clone();
        config.validate()?;

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if !records.is_empty() {
            return Err(FleetError::config("fleet already started"));
        }

        let slots = GpuAllocator::new(config.gpus.clone(), config.max_per_gpu)
            .allocate(config.instances)?;
        let ports = (0..config.instances)
            .map(|i| config.port_for(i))
            .collect::<FleetResult<Vec<_>>>()?;

        info!(
            "Starting {} instances on GPUs {:?} ({} per GPU), logs in {}",
            config.instances,
            config.gpus,
            config.max_per_gpu,
            self.session.root_dir.display()
        );

        let stamp = self.session.stamp();
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for (ordinal, (slot, port)) in slots.into_iter().zip(ports).enumerate() {
            let record = InstanceRecord::new(ordinal, slot, port).shared();
            let spec = config.command.render(ordinal, slot, port);
            let (stop_tx, stop_rx) = watch::channel(None);

            let join = InstanceSupervisor::new(
                Arc::clone(&record),
                spec,
                Arc::clone(&self.launcher),
                LogManager::new(&self.session.root_dir, &stamp, ordinal),
                config.supervisor,
                stop_rx,
            )
            .spawn();

            info!("Started supervisor for instance {} on {}", ordinal, slot);
            records.push(record);
            workers.push(Worker {
                ordinal,
                stop_tx,
                join,
            });
        }

        Ok(())
    }

    /// Stop every instance and wait for all supervisors to finish.
    ///
    /// Returns the ordinals that had to be force-killed.
    pub async fn stop_all(&self, grace: Duration) -> Vec<usize> {
        let workers: Vec<Worker> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        info!("Stopping {} instances (grace {:?})", workers.len(), grace);

        for worker in &workers {
            // A closed channel means the supervisor already finished
            let _ = worker.stop_tx.send(Some(grace));
        }

        let deadline = tokio::time::Instant::now() + grace * 2 + KILL_MARGIN;
        let mut forced = Vec::new();
        for mut worker in workers {
            match tokio::time::timeout_at(deadline, &mut worker.join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Supervisor for instance {} failed: {}", worker.ordinal, e),
                Err(_) => {
                    warn!(
                        "Supervisor for instance {} did not finish in time, aborting",
                        worker.ordinal
                    );
                    forced.push(worker.ordinal);
                    self.force_stop(worker, grace).await;
                }
            }
        }

        forced.extend(
            self.snapshot()
                .instances
                .iter()
                .filter(|r| r.forced_kill)
                .map(|r| r.ordinal),
        );
        forced.sort_unstable();
        forced.dedup();

        if forced.is_empty() {
            info!("All instances stopped gracefully");
        } else {
            warn!("Force-killed instances: {:?}", forced);
        }
        forced
    }

    /// Abort a supervisor that missed the stop deadline and kill its last process.
    ///
    /// The record is left STOPPED with `forced_kill` set, never STOPPING.
    async fn force_stop(&self, mut worker: Worker, grace: Duration) {
        worker.join.abort();
        let _ = tokio::time::timeout(KILL_MARGIN, &mut worker.join).await;

        let Some(record) = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker.ordinal)
            .cloned()
        else {
            return;
        };
        let mut record = record.write().unwrap_or_else(PoisonError::into_inner);
        if record.state.is_terminal() {
            return;
        }
        if let Some(pid) = record.pid {
            if let Err(e) = self.launcher.kill_pid(pid) {
                error!("Failed to kill instance {} (PID {}): {:#}", worker.ordinal, pid, e);
            }
        }
        let err = FleetError::ShutdownTimeout {
            ordinal: worker.ordinal,
            grace,
        };
        record.mark_stopped(None, true);
        record.last_error = Some(err.to_string());
    }

    /// Copy every record. Each record is read under its own lock.
    pub fn snapshot(&self) -> FleetStatus {
        let instances = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.read().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        FleetStatus::from_records(self.session.clone(), instances)
    }

    /// Copy of a single record
    pub fn record(&self, ordinal: usize) -> Option<InstanceRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ordinal)
            .map(|r| r.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Resolves once every instance is STOPPED or DEAD
    pub async fn wait_all_terminal(&self, poll: Duration) {
        loop {
            let status = self.snapshot();
            if !status.instances.is_empty() && status.all_terminal() {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn instance_count(&self) -> usize {
        self.records
            .read()
            .map(|r| r.len())
            .unwrap_or(0)
    }
}
