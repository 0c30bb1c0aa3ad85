//! Execution coordinator.
//!
//! Drives one request end to end: runtime check, sandbox creation, the
//! completion wait raced against metrics sampling, teardown, profile
//! adjustment and response assembly. [`Engine::execute`] always returns a
//! response; nothing inside the pipeline escapes as an error or a panic.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{future, FutureExt, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::assemble;
use crate::backend::SandboxRuntime;
use crate::config::{Config, Floors, SamplingConfig};
use crate::error::{panic_message, EngineError, EngineResult};
use crate::metrics::{MetricsAggregate, MetricsSampler};
use crate::profile::ProfileAdapter;
use crate::request::{ExecutionRequest, ExecutionResponse, Profile};
use crate::sandbox::{SandboxHandle, SandboxManager};

/// Whether the sandbox runtime answered the last probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Connected,
    Disconnected,
}

/// Liveness probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub runtime_status: RuntimeStatus,
}

/// The execution engine.
pub struct Engine {
    runtime: Arc<dyn SandboxRuntime>,
    sandboxes: SandboxManager,
    sampler: MetricsSampler,
    profiles: ProfileAdapter,
    floors: Floors,
    max_timeout: Duration,
    ping_timeout: Duration,
}

impl Engine {
    /// Build an engine around an already constructed runtime.
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: &Config) -> Self {
        Self {
            sandboxes: SandboxManager::new(Arc::clone(&runtime), config),
            runtime,
            sampler: MetricsSampler::new(SamplingConfig::from_section(&config.sampling)),
            profiles: ProfileAdapter::from_config(config),
            floors: config.floors,
            max_timeout: config.max_timeout(),
            ping_timeout: config.ping_timeout(),
        }
    }

    /// Replace the profile adapter, e.g. to plug in another adjustment.
    #[must_use]
    pub fn with_profiles(mut self, profiles: ProfileAdapter) -> Self {
        self.profiles = profiles;
        self
    }

    pub const fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    /// Probe the runtime without running anything.
    pub async fn check_runtime(&self) -> EngineResult<()> {
        match tokio::time::timeout(self.ping_timeout, self.runtime.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::RuntimeUnavailable(format!("{e:#}"))),
            Err(_) => Err(EngineError::RuntimeUnavailable(format!(
                "no answer within {:?}",
                self.ping_timeout
            ))),
        }
    }

    /// Liveness probe.
    pub async fn health(&self) -> HealthReport {
        let runtime_status = match self.check_runtime().await {
            Ok(()) => RuntimeStatus::Connected,
            Err(e) => {
                debug!(error = %e, "Health probe failed");
                RuntimeStatus::Disconnected
            }
        };
        HealthReport {
            status: "OK".into(),
            runtime_status,
        }
    }

    /// Remove sandboxes left over from earlier runs. Never fails.
    pub async fn shutdown(&self) {
        match self.runtime.sweep().await {
            Ok(0) => debug!("No leftover sandboxes"),
            Ok(count) => info!(count, "Swept leftover sandboxes"),
            Err(e) => warn!(error = %e, "Sandbox sweep failed"),
        }
    }

    /// Execute one request. Exactly one response per call.
    #[instrument(
        skip_all,
        fields(
            function_id = request.function_id(),
            language = %request.language(),
            profile = %request.profile(),
        )
    )]
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResponse {
        let started = Instant::now();

        if request.timeout() > self.max_timeout {
            let err = EngineError::Validation(format!(
                "timeout_ms {} exceeds the maximum of {}",
                request.timeout().as_millis(),
                self.max_timeout.as_millis()
            ));
            return assemble::failure(&err, Duration::ZERO, &self.floors);
        }

        if let Err(err) = self.check_runtime().await {
            warn!(error = %err, "Rejecting execution");
            return assemble::failure(&err, Duration::ZERO, &self.floors);
        }

        let limits = self.profiles.limits(request.profile());
        let created = AssertUnwindSafe(self.sandboxes.create(request.language(), request.code(), limits))
            .catch_unwind()
            .await;
        let mut handle = match created {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => return assemble::failure(&err, started.elapsed(), &self.floors),
            Err(panic) => {
                let err = EngineError::Internal(panic_message(panic.as_ref()));
                error!(error = %err, "Sandbox creation panicked");
                return assemble::failure(&err, started.elapsed(), &self.floors);
            }
        };

        let run = AssertUnwindSafe(self.run(&mut handle, request))
            .catch_unwind()
            .await;
        self.sandboxes.terminate(&mut handle).await;

        match run {
            Ok(response) => {
                info!(
                    status = ?response.status,
                    execution_time_ms = response.execution_time_ms,
                    memory_usage_mb = response.memory_usage_mb,
                    cpu_usage_percent = response.cpu_usage_percent,
                    "Execution finished"
                );
                response
            }
            Err(panic) => {
                let err = EngineError::Internal(panic_message(panic.as_ref()));
                error!(error = %err, "Execution pipeline panicked");
                assemble::failure(&err, started.elapsed(), &self.floors)
            }
        }
    }

    /// Run the same request once per profile, one after another.
    pub async fn compare(
        &self,
        request: &ExecutionRequest,
        profiles: &[Profile],
    ) -> Vec<(Profile, ExecutionResponse)> {
        let mut results = Vec::with_capacity(profiles.len());
        for &profile in profiles {
            let response = self.execute(&request.with_profile(profile)).await;
            results.push((profile, response));
        }
        results
    }

    async fn run(&self, handle: &mut SandboxHandle, request: &ExecutionRequest) -> ExecutionResponse {
        let timeout = request.timeout();
        let deadline = handle.started_at() + timeout;
        let mut samples = Vec::new();

        let outcome = {
            let handle = &*handle;
            let wait = self.sandboxes.wait(handle, timeout);
            let sampling = self.sampler.sample(handle, deadline).for_each(|sample| {
                samples.push(sample);
                future::ready(())
            });
            tokio::pin!(wait, sampling);

            tokio::select! {
                biased;
                outcome = &mut wait => outcome,
                () = &mut sampling => wait.await,
            }
        };
        handle.record(&outcome);

        let aggregate = MetricsAggregate::from_samples(&samples, &self.floors);
        debug!(
            samples = aggregate.sample_count,
            peak_memory_mb = aggregate.peak_memory_mb,
            mean_cpu_percent = aggregate.mean_cpu_percent,
            "Metrics aggregated"
        );

        let measured = assemble::measure(&outcome, &aggregate, handle.started_at().elapsed());
        let reported = self.profiles.adjust(request.profile(), measured);
        assemble::assemble(outcome, reported, timeout)
    }
}
