//! Docker CLI backend implementation.
//!
//! Drives the `docker` binary as a child process. Resource counters are read
//! from the Engine API over `docker system dial-stdio`, which the CLI only
//! exposes pre-formatted otherwise.

use std::process::{Output, Stdio};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::{
    CapturedOutput, ContainerState, LaunchSpec, SandboxId, SandboxRuntime, StatsSnapshot,
    MANAGED_LABEL,
};
use crate::config::Config;

/// Backend that runs sandboxes as Docker containers.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// Create a backend driving the given CLI binary.
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.docker_bin.clone())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a CLI command to completion and return its raw output.
    async fn output(&self, args: &[&str]) -> Result<Output> {
        self.command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {} {}", self.bin, args.join(" ")))
    }

    /// Run a CLI command and return its trimmed stdout, failing on non-zero exit.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} {} failed: {}",
                self.bin,
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Issue a GET against the Engine API and return the response body.
    async fn engine_get(&self, path: &str) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.bin)
            .args(["system", "dial-stdio"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {} system dial-stdio", self.bin))?;

        let mut stdin = child.stdin.take().context("Failed to open dial-stdio stdin")?;
        let mut stdout = child.stdout.take().context("Failed to open dial-stdio stdout")?;

        // HTTP/1.0 makes the daemon close the connection after one response.
        let request = format!("GET {path} HTTP/1.0\r\nHost: docker\r\n\r\n");
        stdin
            .write_all(request.as_bytes())
            .await
            .context("Failed to write Engine API request")?;
        stdin.flush().await?;

        let mut response = Vec::new();
        stdout
            .read_to_end(&mut response)
            .await
            .context("Failed to read Engine API response")?;
        drop(stdin);
        if let Err(e) = child.wait().await {
            debug!(error = %e, "dial-stdio helper did not exit cleanly");
        }

        parse_http_response(&response)
    }
}

/// Split an HTTP/1.x response and return the body of a 200 reply.
fn parse_http_response(raw: &[u8]) -> Result<Vec<u8>> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .context("Malformed Engine API response: no header terminator")?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let body = &raw[split + 4..];

    let status_line = head.lines().next().unwrap_or_default();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .with_context(|| format!("Malformed Engine API status line: {status_line:?}"))?;

    if code != 200 {
        anyhow::bail!(
            "Engine API returned {code}: {}",
            String::from_utf8_lossy(body).trim()
        );
    }
    Ok(body.to_vec())
}

/// Build the `docker run` argument list for a launch.
fn run_args(spec: &LaunchSpec) -> Vec<String> {
    let limits = &spec.limits;
    let memory = format!("{}m", limits.memory_mb);

    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.id.to_string(),
        "--label".to_string(),
        MANAGED_LABEL.to_string(),
        "--network".to_string(),
        "none".to_string(),
        "--memory".to_string(),
        memory.clone(),
        "--memory-swap".to_string(),
        memory,
        "--cpu-period".to_string(),
        limits.cpu_period.to_string(),
        "--cpu-quota".to_string(),
        limits.cpu_quota.to_string(),
    ];

    if let Some(pids) = limits.pids_limit {
        args.extend(["--pids-limit".to_string(), pids.to_string()]);
    }
    for opt in &limits.security_opt {
        args.extend(["--security-opt".to_string(), opt.clone()]);
    }
    if let Some(ref runtime) = limits.runtime {
        args.extend(["--runtime".to_string(), runtime.clone()]);
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Parse `{{.State.Status}} {{.State.ExitCode}}`.
fn parse_state(line: &str) -> ContainerState {
    let mut parts = line.split_whitespace();
    let status = parts.next().unwrap_or_default();
    let exit_code = parts.next().and_then(|c| c.parse().ok()).unwrap_or(-1);
    match status {
        "created" => ContainerState::Created,
        "running" => ContainerState::Running,
        "exited" | "dead" => ContainerState::Exited(exit_code),
        other => ContainerState::Other(other.to_string()),
    }
}

fn is_missing(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr);
    stderr.contains("No such object") || stderr.contains("No such container")
}

/// Subset of the Engine API stats document.
#[derive(Debug, Default, Deserialize)]
struct RawStats {
    #[serde(default)]
    memory_stats: RawMemory,
    #[serde(default)]
    cpu_stats: RawCpu,
    #[serde(default)]
    precpu_stats: RawCpu,
}

#[derive(Debug, Default, Deserialize)]
struct RawMemory {
    #[serde(default)]
    usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawCpu {
    #[serde(default)]
    cpu_usage: RawCpuUsage,
    #[serde(default)]
    system_cpu_usage: u64,
    #[serde(default)]
    online_cpus: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RawCpuUsage {
    #[serde(default)]
    total_usage: u64,
    #[serde(default)]
    percpu_usage: Option<Vec<u64>>,
}

impl RawStats {
    fn into_snapshot(self) -> StatsSnapshot {
        let online_cpus = if self.cpu_stats.online_cpus > 0 {
            self.cpu_stats.online_cpus
        } else {
            self.cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .and_then(|per_cpu| u32::try_from(per_cpu.len()).ok())
                .filter(|n| *n > 0)
                .unwrap_or(1)
        };

        StatsSnapshot {
            memory_bytes: self.memory_stats.usage,
            cpu_total: self.cpu_stats.cpu_usage.total_usage,
            precpu_total: self.precpu_stats.cpu_usage.total_usage,
            system_cpu: self.cpu_stats.system_cpu_usage,
            presystem_cpu: self.precpu_stats.system_cpu_usage,
            online_cpus,
        }
    }
}

#[async_trait]
impl SandboxRuntime for DockerCli {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        let version = self
            .run(&["version", "--format", "{{.Server.Version}}"])
            .await
            .context("Docker daemon is not reachable")?;
        debug!(version = %version, "Docker daemon reachable");
        Ok(())
    }

    #[instrument(skip(self, spec), fields(sandbox = %spec.id, image = %spec.image))]
    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        let args = run_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let container = self.run(&args).await?;
        debug!(container = %&container[..container.len().min(12)], "Container started");
        Ok(())
    }

    async fn state(&self, id: &SandboxId) -> Result<ContainerState> {
        let output = self
            .output(&[
                "inspect",
                "--format",
                "{{.State.Status}} {{.State.ExitCode}}",
                id.as_str(),
            ])
            .await?;
        if !output.status.success() {
            if is_missing(&output.stderr) {
                return Ok(ContainerState::Missing);
            }
            anyhow::bail!(
                "docker inspect failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(parse_state(&String::from_utf8_lossy(&output.stdout)))
    }

    #[instrument(skip(self), fields(sandbox = %id))]
    async fn wait_exit(&self, id: &SandboxId) -> Result<i32> {
        let code = self.run(&["wait", id.as_str()]).await?;
        code.parse()
            .with_context(|| format!("Unexpected docker wait output: {code:?}"))
    }

    async fn logs(&self, id: &SandboxId) -> Result<CapturedOutput> {
        let output = self.output(&["logs", id.as_str()]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "docker logs failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn stats(&self, id: &SandboxId) -> Result<StatsSnapshot> {
        let body = self
            .engine_get(&format!("/containers/{id}/stats?stream=false"))
            .await?;
        let raw: RawStats =
            serde_json::from_slice(&body).context("Failed to parse container stats")?;
        Ok(raw.into_snapshot())
    }

    #[instrument(skip(self), fields(sandbox = %id))]
    async fn kill(&self, id: &SandboxId) -> Result<()> {
        self.run(&["kill", id.as_str()]).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(sandbox = %id))]
    async fn remove(&self, id: &SandboxId) -> Result<()> {
        let output = self.output(&["rm", "-f", id.as_str()]).await?;
        if output.status.success() || is_missing(&output.stderr) {
            return Ok(());
        }
        anyhow::bail!(
            "docker rm failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }

    async fn sweep(&self) -> Result<usize> {
        let filter = format!("label={MANAGED_LABEL}");
        let listing = self.run(&["ps", "-aq", "--filter", &filter]).await?;
        let ids: Vec<&str> = listing.split_whitespace().collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut args = vec!["rm", "-f"];
        args.extend(&ids);
        self.run(&args).await?;
        info!(count = ids.len(), "Removed leftover sandboxes");
        Ok(ids.len())
    }
}
