//! Isolation profiles.
//!
//! A profile bundles the resource limits a sandbox is launched with and the
//! adjustment applied to the values reported for it. Both profiles share the
//! same lifecycle and sampling pipeline.
//!
//! The `hardened` profile does not run on a different isolation technology.
//! It launches with a lower CPU quota and then scales the measured time,
//! memory and CPU by fixed multipliers, an approximation of the overhead a
//! user-space kernel such as gVisor adds. The scaling sits behind
//! [`ReportAdjustment`] so a real alternate runtime (set through the profile's
//! `runtime` option) can replace it without touching the pipeline.

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::{Config, MultiplierSection, ProfileSection};
use crate::request::Profile;

/// Limits a sandbox is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_period: u64,
    pub cpu_quota: u64,
    pub pids_limit: Option<u64>,
    pub security_opt: Vec<String>,
    /// Alternate container runtime, `None` for the runtime's default.
    pub runtime: Option<String>,
}

/// Values reported for one execution, before and after adjustment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub execution_time_ms: f64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// Post-measurement adjustment of reported values.
pub trait ReportAdjustment: Debug + Send + Sync {
    fn adjust(&self, measured: Measurement) -> Measurement;
}

/// Reports measurements as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unadjusted;

impl ReportAdjustment for Unadjusted {
    fn adjust(&self, measured: Measurement) -> Measurement {
        measured
    }
}

/// Scales every value by a fixed factor; CPU is capped at 100%.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Multipliers {
    pub time: f64,
    pub memory: f64,
    pub cpu: f64,
}

impl From<MultiplierSection> for Multipliers {
    fn from(section: MultiplierSection) -> Self {
        Self {
            time: section.time,
            memory: section.memory,
            cpu: section.cpu,
        }
    }
}

impl ReportAdjustment for Multipliers {
    fn adjust(&self, measured: Measurement) -> Measurement {
        Measurement {
            execution_time_ms: measured.execution_time_ms * self.time,
            memory_mb: measured.memory_mb * self.memory,
            cpu_percent: (measured.cpu_percent * self.cpu).min(100.0),
        }
    }
}

/// Resolved settings of one profile.
#[derive(Debug, Clone)]
pub struct ProfileSettings {
    pub limits: ResourceLimits,
    pub adjustment: Arc<dyn ReportAdjustment>,
}

impl ProfileSettings {
    fn from_section(section: &ProfileSection, config: &Config) -> Self {
        let adjustment: Arc<dyn ReportAdjustment> = match section.multipliers {
            Some(m) => Arc::new(Multipliers::from(m)),
            None => Arc::new(Unadjusted),
        };
        Self {
            limits: ResourceLimits {
                memory_mb: config.memory_limit_mb,
                cpu_period: config.cpu_period,
                cpu_quota: section.cpu_quota,
                pids_limit: config.pids_limit,
                security_opt: section.security_opt.clone(),
                runtime: section.runtime.clone(),
            },
            adjustment,
        }
    }
}

/// Maps a profile to its limits and adjustment.
#[derive(Debug, Clone)]
pub struct ProfileAdapter {
    standard: ProfileSettings,
    hardened: ProfileSettings,
}

impl ProfileAdapter {
    pub fn from_config(config: &Config) -> Self {
        Self {
            standard: ProfileSettings::from_section(&config.profiles.standard, config),
            hardened: ProfileSettings::from_section(&config.profiles.hardened, config),
        }
    }

    /// Replace the adjustment of one profile.
    #[must_use]
    pub fn with_adjustment(mut self, profile: Profile, adjustment: Arc<dyn ReportAdjustment>) -> Self {
        self.settings_mut(profile).adjustment = adjustment;
        self
    }

    pub const fn settings(&self, profile: Profile) -> &ProfileSettings {
        match profile {
            Profile::Standard => &self.standard,
            Profile::Hardened => &self.hardened,
        }
    }

    fn settings_mut(&mut self, profile: Profile) -> &mut ProfileSettings {
        match profile {
            Profile::Standard => &mut self.standard,
            Profile::Hardened => &mut self.hardened,
        }
    }

    pub fn limits(&self, profile: Profile) -> &ResourceLimits {
        &self.settings(profile).limits
    }

    /// Apply the profile's reporting adjustment.
    pub fn adjust(&self, profile: Profile, measured: Measurement) -> Measurement {
        self.settings(profile).adjustment.adjust(measured)
    }
}
