//! Scripted in-memory processes for exercising supervisors without real servers

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use super::process::{ExitOutcome, LaunchSpec, OutputSink, ProcessHandle, ProcessLauncher};

const SIGINT: i32 = 2;
const SIGKILL: i32 = 9;

/// How a fake process behaves once launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Runs until crashed, interrupted or killed
    RunForever,
    /// Exits on its own with `code` after the delay
    ExitAfter(Duration, i32),
    /// Exits with `code` when interrupted instead of dying by signal
    ExitOnInterrupt(i32),
    /// Ignores interrupts, only a kill stops it
    IgnoreInterrupt,
}

struct FakeProcess {
    pid: u32,
    started: Instant,
    behavior: Behavior,
    exit: Mutex<Option<ExitOutcome>>,
    leftovers_killed: AtomicBool,
}

impl FakeProcess {
    fn finish(&self, outcome: ExitOutcome) {
        let mut exit = self.exit.lock().unwrap();
        if exit.is_none() {
            *exit = Some(outcome);
        }
    }

    fn poll(&self) -> Option<ExitOutcome> {
        if let Behavior::ExitAfter(delay, code) = self.behavior {
            if self.started.elapsed() >= delay {
                self.finish(ExitOutcome::code(code));
            }
        }
        *self.exit.lock().unwrap()
    }
}

struct FakeHandle(Arc<FakeProcess>);

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> u32 {
        self.0.pid
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitOutcome>> {
        Ok(self.0.poll())
    }

    fn interrupt(&mut self) -> Result<()> {
        match self.0.behavior {
            Behavior::IgnoreInterrupt => {}
            Behavior::ExitOnInterrupt(code) => self.0.finish(ExitOutcome::code(code)),
            _ => self.0.finish(ExitOutcome::signal(SIGINT)),
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.0.finish(ExitOutcome::signal(SIGKILL));
        Ok(())
    }

    fn kill_leftovers(&mut self) -> Result<()> {
        self.0.leftovers_killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Script {
    next_pid: u32,
    behaviors: HashMap<usize, Behavior>,
    failures: HashMap<usize, usize>,
    launches: HashMap<usize, Vec<LaunchSpec>>,
    live: HashMap<usize, Arc<FakeProcess>>,
    killed_pids: Vec<u32>,
}

/// Launcher whose processes are driven by the test
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    script: Arc<Mutex<Script>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        let launcher = Self::default();
        launcher.script.lock().unwrap().next_pid = 1000;
        launcher
    }

    /// Behavior for every future launch of `ordinal`
    pub fn set_behavior(&self, ordinal: usize, behavior: Behavior) {
        self.script.lock().unwrap().behaviors.insert(ordinal, behavior);
    }

    /// Make the next `count` launches of `ordinal` fail to spawn
    pub fn fail_launches(&self, ordinal: usize, count: usize) {
        self.script.lock().unwrap().failures.insert(ordinal, count);
    }

    /// Terminate the live process of `ordinal` with an exit code
    pub fn exit(&self, ordinal: usize, code: i32) -> bool {
        match self.script.lock().unwrap().live.get(&ordinal) {
            Some(process) => {
                process.finish(ExitOutcome::code(code));
                true
            }
            None => false,
        }
    }

    /// Terminate the live process of `ordinal` with a signal
    pub fn signal(&self, ordinal: usize, signal: i32) -> bool {
        match self.script.lock().unwrap().live.get(&ordinal) {
            Some(process) => {
                process.finish(ExitOutcome::signal(signal));
                true
            }
            None => false,
        }
    }

    pub fn launch_count(&self, ordinal: usize) -> usize {
        self.launches(ordinal).len()
    }

    pub fn total_launches(&self) -> usize {
        self.script
            .lock()
            .unwrap()
            .launches
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn launches(&self, ordinal: usize) -> Vec<LaunchSpec> {
        self.script
            .lock()
            .unwrap()
            .launches
            .get(&ordinal)
            .cloned()
            .unwrap_or_default()
    }

    /// The live process of `ordinal` is still running
    pub fn is_alive(&self, ordinal: usize) -> bool {
        self.script
            .lock()
            .unwrap()
            .live
            .get(&ordinal)
            .map(|p| p.poll().is_none())
            .unwrap_or(false)
    }

    /// The group of the live process of `ordinal` was swept after it exited
    pub fn leftovers_killed(&self, ordinal: usize) -> bool {
        self.script
            .lock()
            .unwrap()
            .live
            .get(&ordinal)
            .map(|p| p.leftovers_killed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// PIDs killed through `kill_pid`
    pub fn killed_pids(&self) -> Vec<u32> {
        self.script.lock().unwrap().killed_pids.clone()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, spec: &LaunchSpec, _output: OutputSink) -> Result<Box<dyn ProcessHandle>> {
        let mut script = self.script.lock().unwrap();
        script
            .launches
            .entry(spec.ordinal)
            .or_default()
            .push(spec.clone());

        if let Some(left) = script.failures.get_mut(&spec.ordinal) {
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("scripted spawn failure");
            }
        }

        script.next_pid += 1;
        let process = Arc::new(FakeProcess {
            pid: script.next_pid,
            started: Instant::now(),
            behavior: script
                .behaviors
                .get(&spec.ordinal)
                .copied()
                .unwrap_or(Behavior::RunForever),
            exit: Mutex::new(None),
            leftovers_killed: AtomicBool::new(false),
        });
        script.live.insert(spec.ordinal, Arc::clone(&process));
        Ok(Box::new(FakeHandle(process)))
    }

    fn kill_pid(&self, pid: u32) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        let process = script
            .live
            .values()
            .find(|p| p.pid == pid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no process {}", pid))?;
        process.finish(ExitOutcome::signal(SIGKILL));
        script.killed_pids.push(pid);
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
