//! Server configuration.
//!
//! Constructed once at startup (TOML file layered with `FLEETDECK_*`
//! environment variables) and passed by `Arc` into every component. Runtime
//! topology state is deliberately *not* here; that lives in the state-dir
//! env file managed by the topology controller.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP API.
    pub bind: String,

    /// HTTP API port.
    pub port: u16,

    /// State directory: instances, env file, fallback manager script.
    pub state_dir: PathBuf,

    /// Container engine CLI binary.
    pub engine_binary: String,

    /// Instance manager CLI binary.
    pub manager_binary: String,

    /// Engine binary path on the host, mounted into the companion.
    pub host_engine_bin: String,

    /// Engine binary path inside the companion container.
    pub container_engine_bin: String,

    /// HTTP port instances serve on inside their containers.
    pub instance_http_port: u16,

    /// Shared edge network name.
    pub edge_network: String,

    /// Edge router image.
    pub edge_image: String,

    /// Image for the control-plane companion container.
    pub control_plane_image: String,

    /// Image for the presentation (console) container.
    pub web_image: String,

    /// Port the presentation container serves on internally.
    pub web_container_port: u16,

    /// Host used for URL construction when the request carries no Host.
    pub default_host: String,

    /// Authentication settings.
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8250,
            state_dir: PathBuf::from("/var/lib/fleetdeck"),
            engine_binary: "docker".to_string(),
            manager_binary: "fleetdeck-manager".to_string(),
            host_engine_bin: "/usr/bin/docker".to_string(),
            container_engine_bin: "/usr/bin/docker".to_string(),
            instance_http_port: 3000,
            edge_network: "edge".to_string(),
            edge_image: "traefik:v2.11".to_string(),
            control_plane_image: "fleetdeck:latest".to_string(),
            web_image: "nginx:alpine".to_string(),
            web_container_port: 4173,
            default_host: "127.0.0.1".to_string(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Directory holding one subdirectory per instance.
    pub fn instances_dir(&self) -> PathBuf {
        self.state_dir.join("instances")
    }

    /// Key-value env file persisting topology state.
    pub fn env_file(&self) -> PathBuf {
        self.state_dir.join(".env")
    }

    /// Built console bundle served by the presentation container.
    pub fn console_dist_dir(&self) -> PathBuf {
        self.state_dir.join("console").join("dist")
    }

    /// Default config file location (`~/.config/fleetdeck/config.toml`).
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fleetdeck")
            .join("config.toml")
    }

    /// Load configuration from an optional TOML file plus `FLEETDECK_*`
    /// environment variables (double-underscore separator for nesting,
    /// e.g. `FLEETDECK_AUTH__ADMIN_USER`).
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let path = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        let built = Config::builder()
            .add_source(
                File::from(path.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix("FLEETDECK").separator("__"))
            .build()
            .context("building configuration")?;

        let mut config: Self = built
            .try_deserialize()
            .context("deserializing configuration")?;

        if config.state_dir.as_os_str().is_empty() {
            config.state_dir = ServerConfig::default().state_dir;
        }
        Ok(config)
    }
}

/// Names of instance directories under `<state>/instances/`, sorted.
/// Unreadable directories yield an empty list rather than an error.
pub fn list_instance_names(instances_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(instances_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            if !entry.file_type().ok()?.is_dir() {
                return None;
            }
            entry.file_name().into_string().ok()
        })
        .collect();
    names.sort();
    names
}
