//! Engine configuration.
//!
//! Configuration is JSON, read from a file given on the command line or from
//! the `SANDBOX_ENGINE_CONFIG` environment variable. Every field has a
//! default, so an empty object (or no configuration at all) yields a working
//! engine.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::error::EngineError;
use crate::request::Language;

/// Environment variable holding inline JSON configuration.
pub const CONFIG_ENV_VAR: &str = "SANDBOX_ENGINE_CONFIG";

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Container CLI binary.
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Runtime image per language.
    #[serde(default)]
    pub images: ImageConfig,

    /// Hard memory ceiling of every sandbox, in megabytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u64,

    /// CFS period the CPU quotas are expressed against, in microseconds.
    #[serde(default = "default_cpu_period")]
    pub cpu_period: u64,

    /// Optional process-count ceiling.
    #[serde(default)]
    pub pids_limit: Option<u64>,

    /// Largest timeout a request may ask for.
    #[serde(default = "default_max_timeout")]
    pub max_timeout_ms: u64,

    /// Captured output beyond this many bytes is truncated.
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    #[serde(default)]
    pub sampling: SamplingSection,

    #[serde(default)]
    pub floors: Floors,

    /// Upper bound on sandbox teardown.
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_ms: u64,

    /// Upper bound on the runtime reachability probe.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    #[serde(default)]
    pub profiles: ProfilesSection,
}

/// Runtime images, keyed by language.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub python: String,
    pub javascript: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            python: "python:3.9-alpine".into(),
            javascript: "node:18-alpine".into(),
        }
    }
}

impl ImageConfig {
    pub fn for_language(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.python,
            Language::Javascript => &self.javascript,
        }
    }
}

/// Metrics polling configuration (as read from JSON).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingSection {
    pub interval_ms: u64,
    pub max_samples: usize,
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            max_samples: 600,
        }
    }
}

/// Parsed sampling configuration with `Duration` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingConfig {
    /// Pause between two polls of the same sandbox.
    pub interval: Duration,

    /// Hard cap on samples taken for one execution.
    pub max_samples: usize,
}

impl SamplingConfig {
    pub const fn from_section(section: &SamplingSection) -> Self {
        Self {
            interval: Duration::from_millis(section.interval_ms),
            max_samples: section.max_samples,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self::from_section(&SamplingSection::default())
    }
}

/// Values reported when nothing valid was measured.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Floors {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

impl Default for Floors {
    fn default() -> Self {
        Self {
            memory_mb: 8.0,
            cpu_percent: 20.0,
        }
    }
}

/// Per-profile settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfilesSection {
    #[serde(default = "ProfileSection::standard")]
    pub standard: ProfileSection,

    #[serde(default = "ProfileSection::hardened")]
    pub hardened: ProfileSection,
}

impl Default for ProfilesSection {
    fn default() -> Self {
        Self {
            standard: ProfileSection::standard(),
            hardened: ProfileSection::hardened(),
        }
    }
}

/// Resource limits and reporting adjustment of one profile.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileSection {
    /// CPU quota in microseconds per `cpu_period`.
    pub cpu_quota: u64,

    /// Extra `--security-opt` values.
    #[serde(default)]
    pub security_opt: Vec<String>,

    /// Alternate container runtime (e.g. `runsc`), if installed.
    #[serde(default)]
    pub runtime: Option<String>,

    /// Multiplicative overhead applied to reported values.
    #[serde(default)]
    pub multipliers: Option<MultiplierSection>,
}

impl ProfileSection {
    pub fn standard() -> Self {
        Self {
            cpu_quota: 50_000,
            security_opt: Vec::new(),
            runtime: None,
            multipliers: None,
        }
    }

    pub fn hardened() -> Self {
        Self {
            cpu_quota: 40_000,
            security_opt: vec!["no-new-privileges".into()],
            runtime: None,
            multipliers: Some(MultiplierSection::default()),
        }
    }
}

/// Overhead factors for time, memory and CPU.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct MultiplierSection {
    pub time: f64,
    pub memory: f64,
    pub cpu: f64,
}

impl Default for MultiplierSection {
    fn default() -> Self {
        Self {
            time: 1.15,
            memory: 1.10,
            cpu: 1.05,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            images: ImageConfig::default(),
            memory_limit_mb: default_memory_limit(),
            cpu_period: default_cpu_period(),
            pids_limit: None,
            max_timeout_ms: default_max_timeout(),
            max_output_bytes: default_max_output(),
            sampling: SamplingSection::default(),
            floors: Floors::default(),
            cleanup_timeout_ms: default_cleanup_timeout(),
            ping_timeout_ms: default_ping_timeout(),
            profiles: ProfilesSection::default(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Priority: explicit file > `SANDBOX_ENGINE_CONFIG` env var > defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = if let Some(path) = path {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_json(&json)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else if let Ok(json) = std::env::var(CONFIG_ENV_VAR) {
            Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV_VAR}"))?
        } else {
            debug!("No configuration given, using defaults");
            Self::default()
        };

        config.validate().context("Configuration rejected")?;
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: String| Err(EngineError::Config(msg));

        if self.memory_limit_mb == 0 {
            return fail("memory_limit_mb must be positive".into());
        }
        if self.cpu_period == 0 {
            return fail("cpu_period must be positive".into());
        }
        if self.max_timeout_ms == 0 {
            return fail("max_timeout_ms must be positive".into());
        }
        if self.sampling.interval_ms == 0 || self.sampling.max_samples == 0 {
            return fail("sampling interval and sample cap must be positive".into());
        }
        if self.floors.memory_mb <= 0.0 || self.floors.cpu_percent <= 0.0 {
            return fail("metric floors must be positive".into());
        }
        for (name, profile) in [
            ("standard", &self.profiles.standard),
            ("hardened", &self.profiles.hardened),
        ] {
            if profile.cpu_quota == 0 {
                return fail(format!("profile '{name}': cpu_quota must be positive"));
            }
            if let Some(m) = profile.multipliers {
                if m.time <= 0.0 || m.memory <= 0.0 || m.cpu <= 0.0 {
                    return fail(format!("profile '{name}': multipliers must be positive"));
                }
            }
        }
        match self.profiles.hardened.multipliers {
            Some(m) if m.time > 1.0 && m.memory > 1.0 && m.cpu > 1.0 => Ok(()),
            None => Ok(()),
            Some(_) => fail("profile 'hardened': multipliers must all exceed 1".into()),
        }
    }

    pub const fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub const fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

fn default_docker_bin() -> String {
    "docker".into()
}

const fn default_memory_limit() -> u64 {
    128
}

const fn default_cpu_period() -> u64 {
    100_000
}

const fn default_max_timeout() -> u64 {
    300_000
}

const fn default_max_output() -> usize {
    64 * 1024
}

const fn default_cleanup_timeout() -> u64 {
    10_000
}

const fn default_ping_timeout() -> u64 {
    3_000
}
