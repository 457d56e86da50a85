//! Engine value types and input validation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};

/// A host path mounted into a container.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    /// Path on the host.
    pub host: String,
    /// Path inside the container.
    pub container: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }
}

/// Specification for `run`-ing a detached container.
///
/// Covers exactly the knobs the control plane needs: the edge router, the
/// control-plane companion, and the presentation container are all started
/// through this.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    /// Container name.
    pub name: String,
    /// OCI image to run.
    pub image: String,
    /// Command and arguments appended after the image.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Host port -> container port mappings.
    pub ports: Vec<(u16, u16)>,
    /// Volume mounts.
    pub volumes: Vec<VolumeMount>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Container labels (edge-router routing rules ride on these).
    pub labels: Vec<(String, String)>,
    /// Restart policy (e.g. "unless-stopped").
    pub restart: Option<String>,
}

impl RunSpec {
    /// Create a new run spec for the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push((host_port, container_port));
        self
    }

    pub fn volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn restart(mut self, policy: impl Into<String>) -> Self {
        self.restart = Some(policy.into());
        self
    }

    /// Validate all fields before handing them to the engine CLI.
    pub fn validate(&self) -> EngineResult<()> {
        validate_container_name(&self.name)?;
        validate_image_name(&self.image)?;
        if let Some(ref network) = self.network {
            validate_network_name(network)?;
        }
        for (key, _) in &self.env {
            validate_env_key(key)?;
        }
        for mount in &self.volumes {
            validate_volume_path(&mount.host)?;
            validate_volume_path(&mount.container)?;
        }
        Ok(())
    }
}

/// One row of `stats --no-stream` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Container name as reported by the engine.
    pub name: String,
    /// CPU usage percentage.
    pub cpu_percent: f64,
    /// Memory usage percentage.
    pub mem_percent: f64,
}

/// Parse `stats --no-stream --format "{{.Name}}|{{.CPUPerc}}|{{.MemPerc}}"`.
///
/// Malformed rows are skipped rather than failing the snapshot.
pub fn parse_stats_lines(output: &str) -> Vec<ContainerStats> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut parts = line.split('|');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let cpu = parse_percent(parts.next().unwrap_or(""));
            let mem = parse_percent(parts.next().unwrap_or(""));
            Some(ContainerStats {
                name: name.to_string(),
                cpu_percent: cpu,
                mem_percent: mem,
            })
        })
        .collect()
}

fn parse_percent(raw: &str) -> f64 {
    raw.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Parse `ps -a --format "{{.Names}}\t{{.Status}}"` into a name -> status map.
pub fn parse_status_lines(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (name, status) = line.split_once('\t')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), status.trim().to_string()))
        })
        .collect()
}

/// Parse the first line of `port <name> <port>/tcp` output into a host port.
///
/// The engine prints bindings like `0.0.0.0:20001` (one per address family).
pub fn parse_published_port(output: &str) -> Option<u16> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let (_, port) = line.trim().rsplit_once(':')?;
    port.parse().ok()
}

// ============================================================================
// Input validation
// ============================================================================

/// Validate a container name or ID.
///
/// Names are alphanumeric with hyphens and underscores; IDs are hex. Both
/// fit the same character class.
pub fn validate_container_name(name: &str) -> EngineResult<()> {
    if name.is_empty() {
        return Err(EngineError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }
    if name.len() > 128 {
        return Err(EngineError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid) {
        return Err(EngineError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric, '-', '_' are allowed",
            name
        )));
    }
    Ok(())
}

/// Validate an OCI image name (`[registry/][namespace/]name[:tag][@digest]`).
pub fn validate_image_name(image: &str) -> EngineResult<()> {
    if image.is_empty() {
        return Err(EngineError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(EngineError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }
    let valid = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };
    if !image.chars().all(valid) || image.contains("..") {
        return Err(EngineError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }
    Ok(())
}

/// Validate an engine network name.
pub fn validate_network_name(name: &str) -> EngineResult<()> {
    if name.is_empty() {
        return Err(EngineError::InvalidInput(
            "network name cannot be empty".to_string(),
        ));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid) {
        return Err(EngineError::InvalidInput(format!(
            "network name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}

fn validate_env_key(key: &str) -> EngineResult<()> {
    if key.is_empty() {
        return Err(EngineError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    }
    let first = key.chars().next().unwrap();
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(EngineError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid) {
        return Err(EngineError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }
    Ok(())
}

fn validate_volume_path(path: &str) -> EngineResult<()> {
    if path.is_empty() {
        return Err(EngineError::InvalidInput(
            "volume path cannot be empty".to_string(),
        ));
    }
    if path.contains('\0') {
        return Err(EngineError::InvalidInput(
            "volume path cannot contain null bytes".to_string(),
        ));
    }
    let dangerous = [
        '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\',
        '"', '\'', '\n', '\r',
    ];
    if path.chars().any(|c| dangerous.contains(&c)) {
        return Err(EngineError::InvalidInput(format!(
            "volume path '{}' contains shell metacharacters",
            path
        )));
    }
    Ok(())
}
