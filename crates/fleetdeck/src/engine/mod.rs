//! Container engine CLI wrapper.
//!
//! Drives the docker CLI through discrete async subprocess calls. The control
//! plane never talks to the engine socket directly; everything is a
//! command-line invocation so the same binary works inside a container with
//! only the engine CLI mounted.

mod error;
mod types;

pub use error::{EngineError, EngineResult};
pub use types::{
    ContainerStats, RunSpec, VolumeMount, validate_container_name, validate_image_name,
    validate_network_name,
};

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use types::{parse_published_port, parse_stats_lines, parse_status_lines};

/// Engine operations consumed by the registry, health remediator, and
/// topology controller. Behind a trait so tests can substitute a mock.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Map container name -> status string for all (or only running) containers.
    async fn status_map(&self, all: bool) -> EngineResult<HashMap<String, String>>;

    /// Status string for a single container, `None` when it does not exist.
    async fn container_status(&self, name: &str) -> EngineResult<Option<String>>;

    /// Whether a container with this exact name is currently running.
    async fn is_running(&self, name: &str) -> EngineResult<bool>;

    /// Remove a container. With `force`, running containers are killed first.
    /// Removing a container that does not exist is not an error.
    async fn remove(&self, name: &str, force: bool) -> EngineResult<()>;

    /// Run a detached container, returning its ID.
    async fn run(&self, spec: &RunSpec) -> EngineResult<String>;

    /// Create the named network if it does not already exist.
    async fn ensure_network(&self, name: &str) -> EngineResult<()>;

    /// Published host port for `container_port/tcp`, if any.
    async fn published_port(&self, name: &str, container_port: u16) -> EngineResult<Option<u16>>;

    /// One resource snapshot for every running container.
    async fn stats_all(&self) -> EngineResult<Vec<ContainerStats>>;

    /// Last `tail` log lines (stdout and stderr interleaved).
    async fn logs(&self, name: &str, tail: u32) -> EngineResult<String>;

    /// Run a shell command inside a container with a deadline. Tries bash,
    /// falls back to sh. Returns (exit_code, stdout, stderr).
    async fn exec_shell(
        &self,
        name: &str,
        command: &str,
        as_root: bool,
        timeout: Duration,
    ) -> EngineResult<(i32, String, String)>;

    /// Prune unused engine data (containers, images, build cache, volumes).
    async fn prune(&self) -> EngineResult<()>;
}

/// Container engine client shelling out to the configured binary.
#[derive(Debug, Clone)]
pub struct Engine {
    binary: String,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl Engine {
    /// Create an engine client for the given CLI binary.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn output(&self, args: &[&str]) -> EngineResult<std::process::Output> {
        debug!("engine: {} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::command(args.first().copied().unwrap_or(""), e.to_string()))
    }

    /// Run a command and fail on non-zero exit, returning stdout.
    async fn checked_output(&self, args: &[&str]) -> EngineResult<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::command(
                args.first().copied().unwrap_or(""),
                stderr.trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl EngineApi for Engine {
    async fn status_map(&self, all: bool) -> EngineResult<HashMap<String, String>> {
        let mut args = vec!["ps", "--format", "{{.Names}}\t{{.Status}}"];
        if all {
            args.push("-a");
        }
        let stdout = self.checked_output(&args).await?;
        Ok(parse_status_lines(&stdout))
    }

    async fn container_status(&self, name: &str) -> EngineResult<Option<String>> {
        validate_container_name(name)?;
        let filter = format!("name=^{}$", name);
        let stdout = self
            .checked_output(&["ps", "-a", "--filter", &filter, "--format", "{{.Status}}"])
            .await?;
        let status = stdout.trim();
        if status.is_empty() {
            return Ok(None);
        }
        Ok(Some(status.to_string()))
    }

    async fn is_running(&self, name: &str) -> EngineResult<bool> {
        validate_container_name(name)?;
        let filter = format!("name=^{}$", name);
        let stdout = self.checked_output(&["ps", "-q", "-f", &filter]).await?;
        Ok(!stdout.trim().is_empty())
    }

    async fn remove(&self, name: &str, force: bool) -> EngineResult<()> {
        validate_container_name(name)?;
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(name);
        let output = self.output(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // "no such container" is fine: transitions remove unconditionally
            // to tolerate partial prior state.
            if stderr.to_lowercase().contains("no such container") {
                return Ok(());
            }
            return Err(EngineError::command("rm", stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> EngineResult<String> {
        spec.validate()?;

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        if let Some(ref policy) = spec.restart {
            args.push("--restart".to_string());
            args.push(policy.clone());
        }
        if let Some(ref network) = spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for (host, container) in &spec.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", host, container));
        }
        for mount in &spec.volumes {
            args.push("-v".to_string());
            if mount.read_only {
                args.push(format!("{}:{}:ro", mount.host, mount.container));
            } else {
                args.push(format!("{}:{}", mount.host, mount.container));
            }
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.checked_output(&arg_refs).await?;
        Ok(stdout.trim().to_string())
    }

    async fn ensure_network(&self, name: &str) -> EngineResult<()> {
        validate_network_name(name)?;
        let inspect = self.output(&["network", "inspect", name]).await?;
        if inspect.status.success() {
            return Ok(());
        }
        let create = self.output(&["network", "create", name]).await?;
        if !create.status.success() {
            let stderr = String::from_utf8_lossy(&create.stderr);
            // Lost the race with another creator: the network now exists,
            // which is all this call promises.
            if stderr.to_lowercase().contains("already exists") {
                return Ok(());
            }
            return Err(EngineError::command(
                "network create",
                stderr.trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn published_port(&self, name: &str, container_port: u16) -> EngineResult<Option<u16>> {
        validate_container_name(name)?;
        let port_spec = format!("{}/tcp", container_port);
        let output = self.output(&["port", name, &port_spec]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_published_port(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    async fn stats_all(&self) -> EngineResult<Vec<ContainerStats>> {
        let stdout = self
            .checked_output(&[
                "stats",
                "--no-stream",
                "--format",
                "{{.Name}}|{{.CPUPerc}}|{{.MemPerc}}",
            ])
            .await?;
        Ok(parse_stats_lines(&stdout))
    }

    async fn logs(&self, name: &str, tail: u32) -> EngineResult<String> {
        validate_container_name(name)?;
        let tail_arg = tail.to_string();
        let output = self.output(&["logs", "--tail", &tail_arg, name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such container") {
                return Err(EngineError::ContainerNotFound(name.to_string()));
            }
            return Err(EngineError::command("logs", stderr.trim().to_string()));
        }
        // The engine writes container stderr to our stderr; interleave both.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(format!("{}{}", stdout, stderr))
    }

    async fn exec_shell(
        &self,
        name: &str,
        command: &str,
        as_root: bool,
        timeout: Duration,
    ) -> EngineResult<(i32, String, String)> {
        validate_container_name(name)?;

        for shell in ["/bin/bash", "/bin/sh"] {
            let mut args = vec!["exec"];
            if as_root {
                args.push("-u");
                args.push("root");
            }
            args.extend([name, shell, "-lc", command]);

            let run = Command::new(&self.binary)
                .args(&args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output();

            let output = match tokio::time::timeout(timeout, run).await {
                Ok(result) => {
                    result.map_err(|e| EngineError::command("exec", e.to_string()))?
                }
                Err(_) => return Err(EngineError::ExecTimeout(timeout.as_secs())),
            };

            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // Shell missing in the image: try the next one.
            if !output.status.success()
                && stderr.contains("executable file not found")
                && shell == "/bin/bash"
            {
                continue;
            }
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            return Ok((output.status.code().unwrap_or(-1), stdout, stderr));
        }
        Err(EngineError::command("exec", "no usable shell in container"))
    }

    async fn prune(&self) -> EngineResult<()> {
        // Best-effort sweep; individual prune failures do not stop the rest.
        for args in [
            ["system", "prune", "-af"].as_slice(),
            ["builder", "prune", "-af"].as_slice(),
            ["image", "prune", "-af"].as_slice(),
            ["volume", "prune", "-f"].as_slice(),
        ] {
            if let Err(err) = self.checked_output(args).await {
                debug!("prune step {:?} failed: {}", args, err);
            }
        }
        Ok(())
    }
}
