//! Resource sampling of a running sandbox.
//!
//! The sampler is a finite stream: it polls the sandbox on a fixed interval
//! and ends when the sandbox stops running, the deadline passes, or the
//! sample cap is hit. It only reads from the runtime, so it can run next to
//! the completion wait on the same handle.

use futures::stream::{self, Stream, StreamExt};
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::backend::StatsSnapshot;
use crate::config::{Floors, SamplingConfig};
use crate::error::EngineError;
use crate::sandbox::SandboxHandle;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One point-in-time resource reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSample {
    pub taken_at: Instant,
    pub memory_bytes: u64,
    /// Cumulative container CPU usage, (current, previous).
    pub cpu_usage: (u64, u64),
    /// Cumulative host CPU usage, (current, previous).
    pub system_cpu: (u64, u64),
    pub online_cpus: u32,
}

impl MetricsSample {
    /// Build a sample from a raw reading.
    ///
    /// Returns `None` when the reading carries neither a memory value nor a
    /// usable CPU delta.
    pub fn from_snapshot(snapshot: StatsSnapshot, taken_at: Instant) -> Option<Self> {
        let sample = Self {
            taken_at,
            memory_bytes: snapshot.memory_bytes,
            cpu_usage: (snapshot.cpu_total, snapshot.precpu_total),
            system_cpu: (snapshot.system_cpu, snapshot.presystem_cpu),
            online_cpus: snapshot.online_cpus.max(1),
        };
        if sample.memory_bytes == 0 && sample.cpu_percent().is_none() {
            return None;
        }
        Some(sample)
    }

    /// Host CPU time elapsed between the two readings, if positive.
    pub fn system_cpu_delta(&self) -> Option<u64> {
        self.system_cpu
            .0
            .checked_sub(self.system_cpu.1)
            .filter(|delta| *delta > 0)
    }

    /// CPU utilisation in percent, clamped to `[0, 100]`.
    pub fn cpu_percent(&self) -> Option<f64> {
        let system_delta = self.system_cpu_delta()?;
        let cpu_delta = self.cpu_usage.0.checked_sub(self.cpu_usage.1)?;
        let percent =
            cpu_delta as f64 / system_delta as f64 * f64::from(self.online_cpus) * 100.0;
        Some(percent.clamp(0.0, 100.0))
    }

    pub fn memory_mb(&self) -> Option<f64> {
        (self.memory_bytes > 0).then(|| self.memory_bytes as f64 / BYTES_PER_MB)
    }
}

/// Peak memory and mean CPU of one execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsAggregate {
    pub peak_memory_mb: f64,
    pub mean_cpu_percent: f64,
    /// Number of samples the values were derived from.
    pub sample_count: usize,
}

impl MetricsAggregate {
    /// Summarise samples, never reporting less than the floors.
    pub fn from_samples(samples: &[MetricsSample], floors: &Floors) -> Self {
        let peak_memory_mb = samples
            .iter()
            .filter_map(MetricsSample::memory_mb)
            .fold(None, |peak: Option<f64>, mb| Some(peak.map_or(mb, |p| p.max(mb))));

        let cpu: Vec<f64> = samples
            .iter()
            .filter_map(MetricsSample::cpu_percent)
            .filter(|percent| *percent > 0.0)
            .collect();
        let mean_cpu_percent =
            (!cpu.is_empty()).then(|| cpu.iter().sum::<f64>() / cpu.len() as f64);

        Self {
            peak_memory_mb: peak_memory_mb.map_or(floors.memory_mb, |mb| mb.max(floors.memory_mb)),
            mean_cpu_percent: mean_cpu_percent
                .map_or(floors.cpu_percent, |cpu| cpu.max(floors.cpu_percent)),
            sample_count: samples.len(),
        }
    }

    /// Aggregate for an execution with nothing measured.
    pub const fn floor(floors: &Floors) -> Self {
        Self {
            peak_memory_mb: floors.memory_mb,
            mean_cpu_percent: floors.cpu_percent,
            sample_count: 0,
        }
    }
}

/// Polls a sandbox for resource samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSampler {
    config: SamplingConfig,
}

impl MetricsSampler {
    pub const fn new(config: SamplingConfig) -> Self {
        Self { config }
    }

    /// Lazily sample `handle` every interval until it stops running, the
    /// deadline passes, or the sample cap is reached.
    ///
    /// A failed read is logged and skipped, never recorded as a sample.
    pub fn sample<'a>(
        &self,
        handle: &'a SandboxHandle,
        deadline: Instant,
    ) -> impl Stream<Item = MetricsSample> + Send + 'a {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        stream::unfold(ticker, move |mut ticker| async move {
            let runtime = handle.runtime();
            let id = handle.id();
            loop {
                if timeout_at(deadline, ticker.tick()).await.is_err() {
                    return None;
                }

                let Ok(state) = timeout_at(deadline, runtime.state(id)).await else {
                    return None;
                };
                match state {
                    Ok(state) if state.is_running() => {}
                    Ok(state) => {
                        debug!(sandbox = %id, ?state, "Sandbox no longer running, sampling stops");
                        return None;
                    }
                    Err(e) => {
                        let err = EngineError::MetricsCollection(format!("{e:#}"));
                        warn!(sandbox = %id, error = %err, "Skipping metrics tick");
                        continue;
                    }
                }

                let Ok(stats) = timeout_at(deadline, runtime.stats(id)).await else {
                    return None;
                };
                match stats {
                    Ok(snapshot) => {
                        if let Some(sample) = MetricsSample::from_snapshot(snapshot, Instant::now()) {
                            return Some((sample, ticker));
                        }
                        debug!(sandbox = %id, "Discarding empty stats reading");
                    }
                    Err(e) => {
                        let err = EngineError::MetricsCollection(format!("{e:#}"));
                        warn!(sandbox = %id, error = %err, "Skipping metrics tick");
                    }
                }
            }
        })
        .take(self.config.max_samples)
    }
}
