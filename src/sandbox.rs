//! Sandbox lifecycle management.
//!
//! One [`SandboxHandle`] per request, moving through
//! `Pending -> Running -> {Exited | Killed} -> Removed`. `Removed` is
//! terminal. [`SandboxManager::terminate`] is the only way to get there and
//! never fails: every teardown problem is logged and counted instead.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{ContainerState, LaunchSpec, SandboxId, SandboxRuntime};
use crate::config::{Config, ImageConfig};
use crate::error::{panic_message, EngineError, EngineResult};
use crate::profile::ResourceLimits;
use crate::request::Language;

/// Lifecycle status of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Pending,
    Running,
    Exited(i32),
    Killed,
    Removed,
}

/// Exclusive handle on one sandbox.
///
/// Not `Clone`: the request that created it is the only owner. Dropping a
/// handle that was never terminated schedules a background removal.
pub struct SandboxHandle {
    id: SandboxId,
    runtime: Arc<dyn SandboxRuntime>,
    status: SandboxStatus,
    started_at: Instant,
}

impl SandboxHandle {
    fn pending(id: SandboxId, runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self {
            id,
            runtime,
            status: SandboxStatus::Pending,
            started_at: Instant::now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn running(id: SandboxId, runtime: Arc<dyn SandboxRuntime>) -> Self {
        let mut handle = Self::pending(id, runtime);
        handle.status = SandboxStatus::Running;
        handle
    }

    pub const fn id(&self) -> &SandboxId {
        &self.id
    }

    pub fn runtime(&self) -> &dyn SandboxRuntime {
        self.runtime.as_ref()
    }

    pub const fn status(&self) -> SandboxStatus {
        self.status
    }

    /// When the sandbox started running.
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Record what `wait` observed.
    pub fn record(&mut self, outcome: &ExecutionOutcome) {
        if let ExecutionOutcome::Exited { exit_code, .. } = outcome {
            if self.status == SandboxStatus::Running {
                self.status = SandboxStatus::Exited(*exit_code);
            }
        }
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("runtime", &self.runtime.name())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.status == SandboxStatus::Removed {
            return;
        }
        warn!(sandbox = %self.id, status = ?self.status, "Sandbox handle dropped before teardown");
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let runtime = Arc::clone(&self.runtime);
            let id = self.id.clone();
            rt.spawn(async move {
                if let Err(e) = runtime.remove(&id).await {
                    warn!(sandbox = %id, error = %e, "Background sandbox removal failed");
                }
            });
        }
    }
}

/// What waiting on a sandbox produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The code ran to completion.
    Exited {
        exit_code: i32,
        output: String,
        elapsed: Duration,
    },
    /// The timeout expired first.
    TimedOut,
    /// The runtime failed while waiting or collecting output.
    Failed { reason: String },
}

/// Creates, waits on and tears down sandboxes.
pub struct SandboxManager {
    runtime: Arc<dyn SandboxRuntime>,
    images: ImageConfig,
    max_output_bytes: usize,
    cleanup_timeout: Duration,
    removed: AtomicU64,
    cleanup_failures: AtomicU64,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: &Config) -> Self {
        Self {
            runtime,
            images: config.images.clone(),
            max_output_bytes: config.max_output_bytes,
            cleanup_timeout: config.cleanup_timeout(),
            removed: AtomicU64::new(0),
            cleanup_failures: AtomicU64::new(0),
        }
    }

    /// Launch a sandbox running `code`.
    ///
    /// On failure the half-created sandbox is torn down before returning.
    pub async fn create(
        &self,
        language: Language,
        code: &str,
        limits: &ResourceLimits,
    ) -> EngineResult<SandboxHandle> {
        let mut handle = SandboxHandle::pending(SandboxId::generate(), Arc::clone(&self.runtime));
        let spec = LaunchSpec {
            id: handle.id.clone(),
            image: self.images.for_language(language).to_string(),
            command: language.command(code),
            limits: limits.clone(),
        };

        match guarded(self.runtime.launch(&spec)).await {
            Ok(()) => {
                handle.status = SandboxStatus::Running;
                handle.started_at = Instant::now();
                info!(sandbox = %handle.id.short(), image = %spec.image, cpu_quota = limits.cpu_quota, "Sandbox started");
                Ok(handle)
            }
            Err(e) => {
                let err = EngineError::SandboxCreation(format!("{e:#}"));
                error!(sandbox = %handle.id.short(), error = %err, "Sandbox launch failed");
                self.terminate(&mut handle).await;
                Err(err)
            }
        }
    }

    /// Wait up to `timeout` for the sandbox to exit and collect its output.
    pub async fn wait(&self, handle: &SandboxHandle, timeout: Duration) -> ExecutionOutcome {
        let runtime = handle.runtime();
        let exit_code = match tokio::time::timeout(timeout, runtime.wait_exit(handle.id())).await
        {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                return ExecutionOutcome::Failed {
                    reason: format!("{e:#}"),
                }
            }
            Err(_) => {
                info!(sandbox = %handle.id.short(), timeout_ms = timeout.as_millis(), "Sandbox timed out");
                return ExecutionOutcome::TimedOut;
            }
        };
        let elapsed = handle.started_at.elapsed();

        match runtime.logs(handle.id()).await {
            Ok(output) => {
                info!(sandbox = %handle.id.short(), exit_code, "Sandbox finished");
                ExecutionOutcome::Exited {
                    exit_code,
                    output: truncate_output(output.combined(), self.max_output_bytes),
                    elapsed,
                }
            }
            Err(e) => ExecutionOutcome::Failed {
                reason: format!("failed to collect output: {e:#}"),
            },
        }
    }

    /// Stop and remove the sandbox. Idempotent, never fails, bounded in time.
    pub async fn terminate(&self, handle: &mut SandboxHandle) {
        if handle.status == SandboxStatus::Removed {
            debug!(sandbox = %handle.id.short(), "Sandbox already removed");
            return;
        }

        let id = handle.id.clone();
        if tokio::time::timeout(self.cleanup_timeout, self.teardown(handle))
            .await
            .is_err()
        {
            self.cleanup_failed(
                &id,
                "teardown",
                &anyhow::anyhow!("gave up after {:?}", self.cleanup_timeout),
            );
        }

        handle.status = SandboxStatus::Removed;
        self.removed.fetch_add(1, Ordering::Relaxed);
    }

    async fn teardown(&self, handle: &mut SandboxHandle) {
        let runtime = Arc::clone(&handle.runtime);
        let id = &handle.id;

        match guarded(runtime.state(id)).await {
            Ok(ContainerState::Running) => match guarded(runtime.kill(id)).await {
                Ok(()) => {
                    debug!(sandbox = %id.short(), "Sandbox killed");
                    handle.status = SandboxStatus::Killed;
                }
                Err(e) => self.cleanup_failed(id, "kill", &e),
            },
            Ok(ContainerState::Exited(code)) if handle.status == SandboxStatus::Running => {
                handle.status = SandboxStatus::Exited(code);
            }
            Ok(_) => {}
            Err(e) => self.cleanup_failed(id, "inspect", &e),
        }

        // Removal is attempted whatever the inspection said.
        match guarded(runtime.remove(&handle.id)).await {
            Ok(()) => info!(sandbox = %handle.id.short(), "Sandbox removed"),
            Err(e) => self.cleanup_failed(&handle.id, "remove", &e),
        }
    }

    fn cleanup_failed(&self, id: &SandboxId, step: &str, e: &anyhow::Error) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
        let err = EngineError::Cleanup(format!("{step}: {e:#}"));
        warn!(sandbox = %id.short(), error = %err, "Sandbox cleanup step failed");
    }

    /// Handles that reached `Removed` through this manager.
    pub fn removed_count(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    /// Cleanup steps that failed and were swallowed.
    pub fn cleanup_failures(&self) -> u64 {
        self.cleanup_failures.load(Ordering::Relaxed)
    }
}

/// Run a runtime call, turning a panic inside it into an error.
async fn guarded<T>(call: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(anyhow::anyhow!("runtime call panicked: {}", panic_message(panic.as_ref()))))
}

/// Cap output at `max_bytes`, cutting on a character boundary.
fn truncate_output(mut output: String, max_bytes: usize) -> String {
    if output.len() > max_bytes {
        let mut cut = max_bytes;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        output.push_str("\n... [output truncated]");
    }
    output
}
