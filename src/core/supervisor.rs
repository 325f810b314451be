//! Instance supervision - Launch, watch, restart and stop one simulation server
//!
//! Each supervisor runs as its own task and only ever blocks on its own process or
//! its own timers. State transitions are written to the instance's record, which
//! nobody else writes.

use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::SupervisorSettings;
use super::error::FleetError;
use super::instance::{InstanceRecord, SharedRecord};
use super::logs::LogManager;
use super::policy::{RestartDecision, RestartTracker};
use super::process::{ExitOutcome, LaunchSpec, OutputSink, ProcessHandle, ProcessLauncher};

/// Stop channel payload: `Some(grace)` once a stop has been requested
pub type StopSignal = Option<Duration>;

/// How one launch attempt ended
enum AttemptEnd {
    Clean(ExitOutcome),
    Crashed(Option<ExitOutcome>, String),
    Stopped,
}

enum Wait {
    Exited(ExitOutcome),
    Elapsed,
    StopRequested(Duration),
    Failed(std::io::Error),
}

/// Drives the lifecycle of one instance
pub struct InstanceSupervisor {
    record: SharedRecord,
    spec: LaunchSpec,
    launcher: Arc<dyn ProcessLauncher>,
    logs: LogManager,
    settings: SupervisorSettings,
    tracker: RestartTracker,
    stop_rx: watch::Receiver<StopSignal>,
}

impl InstanceSupervisor {
    pub fn new(
        record: SharedRecord,
        spec: LaunchSpec,
        launcher: Arc<dyn ProcessLauncher>,
        logs: LogManager,
        settings: SupervisorSettings,
        stop_rx: watch::Receiver<StopSignal>,
    ) -> Self {
        Self {
            record,
            spec,
            launcher,
            logs,
            tracker: RestartTracker::new(settings.restart),
            settings,
            stop_rx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn ordinal(&self) -> usize {
        self.spec.ordinal
    }

    fn update<R>(&self, f: impl FnOnce(&mut InstanceRecord) -> R) -> R {
        let mut record = self.record.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut record)
    }

    fn stop_requested(&self) -> Option<Duration> {
        *self.stop_rx.borrow()
    }

    /// Run until stopped or the restart budget is exhausted
    pub async fn run(mut self) {
        info!(
            "Supervisor started for instance {} ({}, port {})",
            self.ordinal(),
            self.spec.assignment,
            self.spec.port
        );

        loop {
            if self.stop_requested().is_some() {
                self.finish_without_process();
                return;
            }

            let end = match self.launch() {
                Ok(handle) => self.supervise(handle).await,
                Err(e) => {
                    error!("{}", e);
                    AttemptEnd::Crashed(None, e.to_string())
                }
            };

            let decision = match end {
                AttemptEnd::Stopped => return,
                AttemptEnd::Clean(outcome) => {
                    info!("Instance {} exited cleanly ({})", self.ordinal(), outcome);
                    self.update(|r| r.mark_exited_clean(outcome));
                    RestartDecision::Restart {
                        after: self.settings.restart.cooldown,
                    }
                }
                AttemptEnd::Crashed(outcome, reason) => {
                    warn!("Instance {} crashed: {}", self.ordinal(), reason);
                    self.update(|r| r.mark_crashed(outcome, reason));
                    self.tracker.record_crash(Instant::now())
                }
            };

            match decision {
                RestartDecision::GiveUp { crashes, window } => {
                    let err = FleetError::RestartBudgetExhausted {
                        ordinal: self.ordinal(),
                        crashes,
                        window,
                    };
                    error!("{}; operator attention required", err);
                    self.update(|r| r.mark_dead(err.to_string()));
                    return;
                }
                RestartDecision::Restart { after } => {
                    self.update(|r| r.mark_restarting());
                    info!(
                        "Restarting instance {} in {:?} (restart #{})",
                        self.ordinal(),
                        after,
                        self.update(|r| r.restart_count) + 1
                    );
                    if self.cooldown(after).await {
                        self.finish_without_process();
                        return;
                    }
                    self.update(|r| r.increment_restart_count());
                }
            }
        }
    }

    /// Open the attempt log and start the process
    fn launch(&self) -> Result<Box<dyn ProcessHandle>, FleetError> {
        let restart_count = self.update(|r| r.restart_count);
        let (log_path, output) = match self
            .logs
            .open_attempt(restart_count, &self.spec.command_line())
        {
            Ok((path, file)) => (Some(path), OutputSink::File(file)),
            Err(e) => {
                if self.update(|r| r.note_logging_error(e.to_string())) {
                    warn!("{}; output goes to the supervisor's stderr", e);
                }
                (None, OutputSink::Inherit)
            }
        };

        self.update(|r| r.mark_starting(log_path));
        let handle = self
            .launcher
            .launch(&self.spec, output)
            .map_err(|e| FleetError::LaunchFailure {
                ordinal: self.ordinal(),
                reason: format!("{:#}", e),
            })?;
        let pid = handle.pid();
        self.update(|r| r.attach_pid(pid));
        Ok(handle)
    }

    /// Watch a launched process through STARTING and RUNNING until it ends
    async fn supervise(&mut self, mut handle: Box<dyn ProcessHandle>) -> AttemptEnd {
        match self.wait(handle.as_mut(), Some(self.settings.start_grace)).await {
            Wait::Elapsed => {
                info!(
                    "Instance {} running (PID {})",
                    self.ordinal(),
                    handle.pid()
                );
                self.update(|r| r.mark_running());
            }
            Wait::Exited(outcome) => {
                self.sweep(handle.as_mut());
                let err = FleetError::LaunchFailure {
                    ordinal: self.ordinal(),
                    reason: format!("exited during start grace period ({})", outcome),
                };
                return AttemptEnd::Crashed(Some(outcome), err.to_string());
            }
            Wait::StopRequested(grace) => return self.shutdown(handle, grace).await,
            Wait::Failed(e) => return self.lost(handle, e),
        }

        loop {
            match self.wait(handle.as_mut(), None).await {
                Wait::Exited(outcome) if outcome.is_clean(self.settings.clean_exit_code) => {
                    self.sweep(handle.as_mut());
                    return AttemptEnd::Clean(outcome);
                }
                Wait::Exited(outcome) => {
                    self.sweep(handle.as_mut());
                    let err = FleetError::CrashExit {
                        ordinal: self.ordinal(),
                        outcome: outcome.to_string(),
                    };
                    return AttemptEnd::Crashed(Some(outcome), err.to_string());
                }
                Wait::StopRequested(grace) => return self.shutdown(handle, grace).await,
                Wait::Failed(e) => return self.lost(handle, e),
                Wait::Elapsed => continue,
            }
        }
    }

    /// Kill anything the exited server left in its process group
    fn sweep(&self, handle: &mut dyn ProcessHandle) {
        if let Err(e) = handle.kill_leftovers() {
            debug!("Nothing left behind by instance {}: {}", self.ordinal(), e);
        }
    }

    /// Exit status can no longer be observed; kill the process and treat it as a crash
    fn lost(&self, mut handle: Box<dyn ProcessHandle>, e: std::io::Error) -> AttemptEnd {
        error!("Lost track of instance {}: {}", self.ordinal(), e);
        if let Err(e) = handle.kill() {
            warn!("Failed to kill instance {}: {}", self.ordinal(), e);
        }
        AttemptEnd::Crashed(None, format!("failed to observe process: {}", e))
    }

    /// Poll for exit until it happens, `limit` elapses or a stop is requested
    async fn wait(&mut self, handle: &mut dyn ProcessHandle, limit: Option<Duration>) -> Wait {
        let deadline = limit.map(|d| Instant::now() + d);
        loop {
            match handle.try_wait() {
                Ok(Some(outcome)) => return Wait::Exited(outcome),
                Ok(None) => {}
                Err(e) => return Wait::Failed(e),
            }
            if let Some(grace) = self.stop_requested() {
                return Wait::StopRequested(grace);
            }
            let nap = match deadline {
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => left.min(self.settings.poll_interval),
                    _ => return Wait::Elapsed,
                },
                None => self.settings.poll_interval,
            };

            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                changed = self.stop_rx.changed() => {
                    if changed.is_err() {
                        // Fleet manager is gone; treat as a stop request
                        return Wait::StopRequested(self.settings.stop_grace);
                    }
                }
            }
        }
    }

    /// Sleep out the cooldown. Returns `true` if a stop arrived meanwhile.
    async fn cooldown(&mut self, after: Duration) -> bool {
        if self.stop_requested().is_some() {
            return true;
        }
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(after) => false,
            _ = self.stop_rx.changed() => true,
        };
        interrupted || self.stop_requested().is_some()
    }

    /// Interrupt, wait up to `grace`, then kill
    async fn shutdown(&mut self, mut handle: Box<dyn ProcessHandle>, grace: Duration) -> AttemptEnd {
        info!(
            "Stopping instance {} (PID {}, grace {:?})",
            self.ordinal(),
            handle.pid(),
            grace
        );
        self.update(|r| r.mark_stopping());

        if let Err(e) = handle.interrupt() {
            warn!("Failed to interrupt instance {}: {}", self.ordinal(), e);
        }
        if let Some(outcome) = self.wait_exit(handle.as_mut(), grace).await {
            info!("Instance {} stopped ({})", self.ordinal(), outcome);
            self.sweep(handle.as_mut());
            self.update(|r| r.mark_stopped(Some(outcome), false));
            return AttemptEnd::Stopped;
        }

        let err = FleetError::ShutdownTimeout {
            ordinal: self.ordinal(),
            grace,
        };
        warn!("{}", err);
        if let Err(e) = handle.kill() {
            error!("Failed to kill instance {}: {}", self.ordinal(), e);
        }
        let outcome = self.wait_exit(handle.as_mut(), grace).await;
        match outcome {
            Some(_) => self.sweep(handle.as_mut()),
            None => error!("Instance {} still alive after kill", self.ordinal()),
        }
        self.update(|r| {
            r.mark_stopped(outcome, true);
            r.last_error = Some(err.to_string());
        });
        AttemptEnd::Stopped
    }

    async fn wait_exit(&self, handle: &mut dyn ProcessHandle, limit: Duration) -> Option<ExitOutcome> {
        let deadline = Instant::now() + limit;
        loop {
            match handle.try_wait() {
                Ok(Some(outcome)) => return Some(outcome),
                Ok(None) => {}
                Err(e) => {
                    debug!("try_wait failed for instance {}: {}", self.ordinal(), e);
                    return None;
                }
            }
            match deadline.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => {
                    tokio::time::sleep(left.min(self.settings.poll_interval)).await
                }
                _ => return None,
            }
        }
    }

    /// Stop arrived while no process exists
    fn finish_without_process(&self) {
        info!("Instance {} stopped", self.ordinal());
        self.update(|r| {
            r.mark_stopping();
            r.mark_stopped(None, false);
        });
    }
}
