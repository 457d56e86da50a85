//! Instance manager CLI wrapper.
//!
//! `fleetdeck-manager` is the higher-level command surface that owns instance
//! data (create/start/stop/delete/rebuild/...), keyed by instance name. The
//! control plane shells out to it and relays captured output verbatim on
//! failure. When the primary binary is missing or does not recognize a
//! subcommand, a repo-managed copy of the script under the state directory is
//! tried as a fallback.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::process::Command;

/// Result type for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors from the instance manager surface.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The manager binary could not be found or spawned.
    #[error("instance manager not available: {0}")]
    NotAvailable(String),

    /// The manager exited non-zero; stdout/stderr are relayed for diagnosis.
    #[error("manager {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Instance already exists (create-time uniqueness guard).
    #[error("instance '{0}' already exists")]
    AlreadyExists(String),

    /// Invalid instance name.
    #[error("invalid instance name: {0}")]
    InvalidName(String),
}

/// Captured outcome of a manager invocation.
#[derive(Debug, Clone)]
pub struct ManagerOutcome {
    pub ok: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Validate an instance name: alphanumeric plus hyphen, non-empty.
pub fn validate_instance_name(name: &str) -> ManagerResult<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(ManagerError::InvalidName(name.to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ManagerError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Manager operations consumed by the orchestrator, mockable for tests.
#[async_trait]
pub trait ManagerApi: Send + Sync {
    /// Run a manager subcommand with the given arguments.
    async fn run(&self, args: &[&str]) -> ManagerResult<ManagerOutcome>;

    /// `url <name>`: the manager's own notion of an instance URL.
    async fn instance_url(&self, name: &str) -> Option<String>;

    /// `port <name>`: the manager-recorded host port for an instance.
    async fn instance_port(&self, name: &str) -> Option<u16>;
}

/// Shell-out implementation of [`ManagerApi`].
#[derive(Debug, Clone)]
pub struct InstanceManager {
    binary: String,
    fallback_script: PathBuf,
}

impl InstanceManager {
    /// Create a manager client. `state_dir` hosts the repo-managed fallback
    /// script at `<state>/server/fleetdeck-manager`.
    pub fn new(binary: impl Into<String>, state_dir: &Path) -> Self {
        Self {
            binary: binary.into(),
            fallback_script: state_dir.join("server").join("fleetdeck-manager"),
        }
    }

    async fn invoke(program: &str, prefix: &[&str], args: &[&str]) -> std::io::Result<ManagerOutcome> {
        let output = Command::new(program)
            .args(prefix)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(ManagerOutcome {
            ok: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Whether the primary outcome looks like "command not recognized" and
    /// the fallback script should be tried.
    fn needs_fallback(outcome: &ManagerOutcome) -> bool {
        if outcome.ok {
            return false;
        }
        let err = format!("{}\n{}", outcome.stderr, outcome.stdout).to_lowercase();
        err.contains("usage:") || err.contains("unknown") || err.contains("not found")
    }

    async fn run_fallback(&self, args: &[&str]) -> Option<ManagerOutcome> {
        let script = &self.fallback_script;
        if !script.is_file() {
            return None;
        }
        let script_str = script.to_string_lossy();
        let executable = is_executable(script);
        debug!(
            "manager fallback: {} (executable={})",
            script_str, executable
        );
        let result = if executable {
            Self::invoke(&script_str, &[], args).await
        } else {
            Self::invoke("bash", &[&script_str], args).await
        };
        result.ok()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[async_trait]
impl ManagerApi for InstanceManager {
    async fn run(&self, args: &[&str]) -> ManagerResult<ManagerOutcome> {
        let primary = match Self::invoke(&self.binary, &[], args).await {
            Ok(outcome) => outcome,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ManagerOutcome {
                ok: false,
                exit_code: 127,
                stdout: String::new(),
                stderr: "not found".to_string(),
            },
            Err(err) => return Err(ManagerError::NotAvailable(err.to_string())),
        };

        if Self::needs_fallback(&primary) {
            if let Some(fallback) = self.run_fallback(args).await {
                return Ok(fallback);
            }
            if primary.exit_code == 127 {
                return Err(ManagerError::NotAvailable(format!(
                    "{} not found and no fallback script at {}",
                    self.binary,
                    self.fallback_script.display()
                )));
            }
        }
        Ok(primary)
    }

    async fn instance_url(&self, name: &str) -> Option<String> {
        validate_instance_name(name).ok()?;
        let outcome = self.run(&["url", name]).await.ok()?;
        if !outcome.ok || outcome.stdout.is_empty() {
            return None;
        }
        Some(outcome.stdout)
    }

    async fn instance_port(&self, name: &str) -> Option<u16> {
        validate_instance_name(name).ok()?;
        let outcome = self.run(&["port", name]).await.ok()?;
        if !outcome.ok {
            return None;
        }
        outcome.stdout.trim().parse().ok()
    }
}

/// Turn a failed outcome into a [`ManagerError`] carrying the captured output.
pub fn outcome_to_error(command: &str, outcome: &ManagerOutcome) -> ManagerError {
    ManagerError::CommandFailed {
        command: command.to_string(),
        exit_code: outcome.exit_code,
        stdout: outcome.stdout.clone(),
        stderr: outcome.stderr.clone(),
    }
}

impl ManagerOutcome {
    /// The message worth showing an operator: stderr, falling back to stdout.
    pub fn failure_message(&self) -> String {
        if !self.stderr.is_empty() {
            self.stderr.clone()
        } else {
            self.stdout.clone()
        }
    }
}

/// Log-and-continue helper for best-effort manager calls inside background
/// workers, where failures are swallowed after cleanup.
pub async fn run_logged(manager: &dyn ManagerApi, args: &[&str]) {
    match manager.run(args).await {
        Ok(outcome) if !outcome.ok => {
            warn!(
                "manager {:?} exited {}: {}",
                args,
                outcome.exit_code,
                outcome.failure_message()
            );
        }
        Err(err) => warn!("manager {:?} unavailable: {}", args, err),
        Ok(_) => {}
    }
}
