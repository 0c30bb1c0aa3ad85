//! Request and response contract of the execution engine.
//!
//! An [`ExecutionRequest`] can only be built through validation, so every
//! value the coordinator sees already has a supported language, a supported
//! profile and a positive timeout.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Languages the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
}

impl Language {
    pub const ALL: [Self; 2] = [Self::Python, Self::Javascript];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
        }
    }

    /// Interpreter argv that runs `code` inline, without touching the filesystem.
    pub fn command(self, code: &str) -> Vec<String> {
        let (interpreter, flag) = match self {
            Self::Python => ("python", "-c"),
            Self::Javascript => ("node", "-e"),
        };
        vec![interpreter.to_string(), flag.to_string(), code.to_string()]
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Self::Python),
            "javascript" => Ok(Self::Javascript),
            other => Err(EngineError::Validation(format!(
                "unsupported language '{other}', expected one of: python, javascript"
            ))),
        }
    }
}

/// Isolation profile a request runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Standard,
    Hardened,
}

impl Profile {
    pub const ALL: [Self; 2] = [Self::Standard, Self::Hardened];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Hardened => "hardened",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "hardened" => Ok(Self::Hardened),
            other => Err(EngineError::Validation(format!(
                "unsupported profile '{other}', expected one of: standard, hardened"
            ))),
        }
    }
}

/// Request as it arrives on the wire, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawExecutionRequest {
    pub function_id: i64,
    pub code: String,
    pub language: String,
    pub timeout_ms: i64,
    pub profile: String,
}

/// A validated, immutable execution request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawExecutionRequest")]
pub struct ExecutionRequest {
    function_id: i64,
    code: String,
    language: Language,
    timeout: Duration,
    profile: Profile,
}

impl ExecutionRequest {
    /// Build a request, rejecting a zero timeout.
    pub fn new(
        function_id: i64,
        code: impl Into<String>,
        language: Language,
        timeout: Duration,
        profile: Profile,
    ) -> Result<Self, EngineError> {
        if timeout.is_zero() {
            return Err(EngineError::Validation(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(Self {
            function_id,
            code: code.into(),
            language,
            timeout,
            profile,
        })
    }

    pub const fn function_id(&self) -> i64 {
        self.function_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub const fn language(&self) -> Language {
        self.language
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub const fn profile(&self) -> Profile {
        self.profile
    }

    /// Same request under another profile.
    #[must_use]
    pub fn with_profile(&self, profile: Profile) -> Self {
        Self {
            profile,
            ..self.clone()
        }
    }
}

impl TryFrom<RawExecutionRequest> for ExecutionRequest {
    type Error = EngineError;

    fn try_from(raw: RawExecutionRequest) -> Result<Self, Self::Error> {
        let language = raw.language.parse()?;
        let profile = raw.profile.parse()?;
        let timeout_ms = u64::try_from(raw.timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "timeout_ms must be a positive integer, got {}",
                    raw.timeout_ms
                ))
            })?;
        Self::new(
            raw.function_id,
            raw.code,
            language,
            Duration::from_millis(timeout_ms),
            profile,
        )
    }
}

/// Final status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

/// Response contract returned for every accepted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error_message: String,
    pub execution_time_ms: f64,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
}
