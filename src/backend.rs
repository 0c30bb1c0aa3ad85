//! Sandbox runtime trait and implementations.
//!
//! A runtime knows how to launch, observe and tear down one isolated
//! container. It holds no per-request state; the lifecycle manager in
//! [`crate::sandbox`] owns the handles.

mod docker;
#[cfg(test)]
pub mod fake;

pub use docker::DockerCli;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::profile::ResourceLimits;

/// Label attached to every sandbox this engine launches.
pub const MANAGED_LABEL: &str = "sandbox-exec-engine.managed=true";

/// Name of one sandbox, unique per request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxId(String);

impl SandboxId {
    /// Fresh identifier for a new sandbox.
    pub fn generate() -> Self {
        Self(format!("sbx-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(16);
        &self.0[..end]
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to start a sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub id: SandboxId,
    pub image: String,
    pub command: Vec<String>,
    pub limits: ResourceLimits,
}

/// Container state as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited(i32),
    /// The runtime has no record of the sandbox.
    Missing,
    Other(String),
}

impl ContainerState {
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Output captured from a finished sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Stdout and stderr as a single text block.
    pub fn combined(self) -> String {
        if self.stderr.is_empty() {
            self.stdout
        } else if self.stdout.is_empty() {
            self.stderr
        } else {
            format!("{}\n--- stderr ---\n{}", self.stdout, self.stderr)
        }
    }
}

/// One raw resource reading with cumulative CPU counters.
///
/// `cpu_total`/`system_cpu` are the current counters, the `pre*` fields the
/// counters of the runtime's previous reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub memory_bytes: u64,
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_cpu: u64,
    pub presystem_cpu: u64,
    pub online_cpus: u32,
}

/// Trait for sandbox runtimes.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;

    /// Check that the runtime is reachable without running anything.
    async fn ping(&self) -> Result<()>;

    /// Start a detached sandbox. Returns once it is running.
    async fn launch(&self, spec: &LaunchSpec) -> Result<()>;

    /// Current state of a sandbox.
    async fn state(&self, id: &SandboxId) -> Result<ContainerState>;

    /// Block until the sandbox exits and return its exit code.
    async fn wait_exit(&self, id: &SandboxId) -> Result<i32>;

    /// Output the sandbox produced so far.
    async fn logs(&self, id: &SandboxId) -> Result<CapturedOutput>;

    /// One resource reading.
    async fn stats(&self, id: &SandboxId) -> Result<StatsSnapshot>;

    /// Force-stop a running sandbox.
    async fn kill(&self, id: &SandboxId) -> Result<()>;

    /// Remove a sandbox. Removing an unknown sandbox succeeds.
    async fn remove(&self, id: &SandboxId) -> Result<()>;

    /// Remove every sandbox this engine left behind. Returns how many.
    async fn sweep(&self) -> Result<usize>;
}
