//! Scriptable in-memory runtime for tests.
//!
//! Records every call so tests can assert how many sandboxes were launched,
//! killed and removed, and injects faults at chosen points.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::{CapturedOutput, ContainerState, LaunchSpec, SandboxId, SandboxRuntime, StatsSnapshot};

/// How a launched sandbox finishes.
#[derive(Debug, Clone)]
pub enum FakeExit {
    /// Exit with `code` after `delay`, having printed `output`.
    After {
        delay: Duration,
        code: i32,
        output: CapturedOutput,
    },
    /// Never exits on its own.
    Never,
    /// `wait_exit` itself fails.
    WaitFails(String),
}

/// What `stats` returns.
#[derive(Debug, Clone)]
pub enum FakeStats {
    Steady(StatsSnapshot),
    /// One reading per call, errors after the sequence is exhausted.
    Sequence(Vec<Result<StatsSnapshot, String>>),
    /// Panics on the first call.
    Panic,
}

/// Runtime call that panics instead of answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakePanic {
    /// After the sandbox was recorded as running.
    Launch,
    /// On every inspection.
    State,
}

#[derive(Debug)]
enum StatsMode {
    Steady(StatsSnapshot),
    Sequence(VecDeque<Result<StatsSnapshot, String>>),
    Panic,
}

/// Fake runtime with call counters.
#[derive(Debug)]
pub struct FakeRuntime {
    reachable: bool,
    launch_error: Option<String>,
    remove_fails: bool,
    logs_fail: bool,
    panics_at: Option<FakePanic>,
    exit: FakeExit,
    stats: Mutex<StatsMode>,
    states: Mutex<HashMap<SandboxId, ContainerState>>,
    launched: Mutex<Vec<LaunchSpec>>,
    pings: AtomicUsize,
    launches: AtomicUsize,
    inspects: AtomicUsize,
    kills: AtomicUsize,
    removes: AtomicUsize,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    /// Reachable runtime whose sandboxes print "hi" and exit 0 after 100ms.
    pub fn new() -> Self {
        Self {
            reachable: true,
            launch_error: None,
            remove_fails: false,
            logs_fail: false,
            panics_at: None,
            exit: FakeExit::After {
                delay: Duration::from_millis(100),
                code: 0,
                output: CapturedOutput {
                    stdout: "hi\n".into(),
                    stderr: String::new(),
                },
            },
            stats: Mutex::new(StatsMode::Sequence(VecDeque::new())),
            states: Mutex::new(HashMap::new()),
            launched: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
            inspects: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    #[must_use]
    pub fn failing_launch(mut self, message: &str) -> Self {
        self.launch_error = Some(message.to_string());
        self
    }

    #[must_use]
    pub const fn failing_remove(mut self) -> Self {
        self.remove_fails = true;
        self
    }

    #[must_use]
    pub const fn failing_logs(mut self) -> Self {
        self.logs_fail = true;
        self
    }

    #[must_use]
    pub const fn panicking_at(mut self, point: FakePanic) -> Self {
        self.panics_at = Some(point);
        self
    }

    #[must_use]
    pub fn with_exit(mut self, exit: FakeExit) -> Self {
        self.exit = exit;
        self
    }

    #[must_use]
    pub fn with_stats(self, stats: FakeStats) -> Self {
        let mode = match stats {
            FakeStats::Steady(s) => StatsMode::Steady(s),
            FakeStats::Sequence(seq) => StatsMode::Sequence(seq.into()),
            FakeStats::Panic => StatsMode::Panic,
        };
        *self.stats.lock().unwrap() = mode;
        self
    }

    pub fn set_state(&self, id: &SandboxId, state: ContainerState) {
        self.states.lock().unwrap().insert(id.clone(), state);
    }

    /// Sandboxes launched and not yet removed.
    pub fn live_sandboxes(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.launched.lock().unwrap().clone()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn inspects(&self) -> usize {
        self.inspects.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    fn output(&self) -> CapturedOutput {
        match &self.exit {
            FakeExit::After { output, .. } => output.clone(),
            _ => CapturedOutput::default(),
        }
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.reachable {
            Ok(())
        } else {
            anyhow::bail!("Cannot connect to the fake daemon")
        }
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.launched.lock().unwrap().push(spec.clone());
        if let Some(ref message) = self.launch_error {
            // Like a container that was created but failed to start.
            self.set_state(&spec.id, ContainerState::Created);
            anyhow::bail!("{message}");
        }
        self.set_state(&spec.id, ContainerState::Running);
        if self.panics_at == Some(FakePanic::Launch) {
            panic!("injected fault in launch");
        }
        Ok(())
    }

    async fn state(&self, id: &SandboxId) -> Result<ContainerState> {
        self.inspects.fetch_add(1, Ordering::SeqCst);
        if self.panics_at == Some(FakePanic::State) {
            panic!("injected fault in state");
        }
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(ContainerState::Missing))
    }

    async fn wait_exit(&self, id: &SandboxId) -> Result<i32> {
        match &self.exit {
            FakeExit::After { delay, code, .. } => {
                tokio::time::sleep(*delay).await;
                self.set_state(id, ContainerState::Exited(*code));
                Ok(*code)
            }
            FakeExit::Never => std::future::pending().await,
            FakeExit::WaitFails(message) => anyhow::bail!("{message}"),
        }
    }

    async fn logs(&self, _id: &SandboxId) -> Result<CapturedOutput> {
        if self.logs_fail {
            anyhow::bail!("log stream unavailable");
        }
        Ok(self.output())
    }

    async fn stats(&self, _id: &SandboxId) -> Result<StatsSnapshot> {
        let reading = {
            let mut mode = self.stats.lock().unwrap();
            match &mut *mode {
                StatsMode::Steady(s) => Some(Ok(*s)),
                StatsMode::Sequence(seq) => {
                    Some(seq.pop_front().unwrap_or_else(|| Err("no reading".into())))
                }
                StatsMode::Panic => None,
            }
        };
        match reading {
            Some(Ok(s)) => Ok(s),
            Some(Err(message)) => anyhow::bail!("{message}"),
            None => panic!("injected fault in stats"),
        }
    }

    async fn kill(&self, id: &SandboxId) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.set_state(id, ContainerState::Exited(137));
        Ok(())
    }

    async fn remove(&self, id: &SandboxId) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if self.remove_fails {
            anyhow::bail!("removal of {id} is already in progress");
        }
        self.states.lock().unwrap().remove(id);
        Ok(())
    }

    async fn sweep(&self) -> Result<usize> {
        let mut states = self.states.lock().unwrap();
        let count = states.len();
        states.clear();
        Ok(count)
    }
}
