//! Instance registry.
//!
//! Computes authoritative instance status on every query by merging
//! container-engine state with transient operation flags. Nothing is stored:
//! the engine is the source of truth and flags are an overlay. The manager's
//! `list` output is the fast path; when it fails (the engine CLI may be
//! unavailable inside the container), the registry degrades to scanning the
//! instance-storage directory and never fails the overall call.

use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::config::{ServerConfig, list_instance_names};
use crate::engine::EngineApi;
use crate::flags::{FlagKind, FlagStore};
use crate::instance_container_name;
use crate::manager::ManagerApi;
use crate::topology::{TopologyController, TopologyMode};

/// User-facing view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub name: String,
    pub status: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Parse one `- <name> -> <status> -> <url>` line block from manager `list`.
fn parse_manager_list(output: &str) -> Vec<InstanceView> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("- "))
        .filter_map(|line| {
            let mut parts = line.split("->").map(str::trim);
            let name = parts.next()?.split_whitespace().next()?.to_string();
            if name.is_empty() {
                return None;
            }
            let status = parts.next().unwrap_or_default().to_string();
            let url = parts.next().unwrap_or_default().to_string();
            Some(InstanceView {
                name,
                status,
                url,
                port: None,
            })
        })
        .collect()
}

/// Merged, topology-aware instance listing.
pub struct InstanceRegistry {
    config: Arc<ServerConfig>,
    engine: Arc<dyn EngineApi>,
    manager: Arc<dyn ManagerApi>,
    flags: FlagStore,
    topology: Arc<TopologyController>,
}

impl InstanceRegistry {
    pub fn new(
        config: Arc<ServerConfig>,
        engine: Arc<dyn EngineApi>,
        manager: Arc<dyn ManagerApi>,
        flags: FlagStore,
        topology: Arc<TopologyController>,
    ) -> Self {
        Self {
            config,
            engine,
            manager,
            flags,
            topology,
        }
    }

    /// List all instances with status and URL resolved for the current
    /// topology mode. `host` is the caller-visible host used to build
    /// direct-mode URLs. Never fails; degraded data is reported as
    /// `"(unknown)"` status.
    pub async fn list(&self, host: &str) -> Vec<InstanceView> {
        let mut views = match self.manager.run(&["list"]).await {
            Ok(outcome) if outcome.ok => parse_manager_list(&outcome.stdout),
            Ok(outcome) => {
                debug!("manager list failed: {}", outcome.failure_message());
                Vec::new()
            }
            Err(err) => {
                debug!("manager list unavailable: {}", err);
                Vec::new()
            }
        };

        if views.is_empty() {
            views = self.list_fallback(host).await;
        } else if self.topology.mode().await == TopologyMode::Direct {
            // Rebuild URLs from the caller's host and the published port so
            // we never hand out container-internal addresses.
            for view in &mut views {
                if let Some(port) = self.lookup_port(&view.name).await {
                    view.port = Some(port);
                    if !host.is_empty() {
                        view.url = format!("http://{}:{}/", host, port);
                    }
                }
            }
        }

        for view in &mut views {
            self.apply_flag_overlay(view);
        }
        views
    }

    /// Published host port for an instance: engine first, manager second.
    async fn lookup_port(&self, name: &str) -> Option<u16> {
        let cname = instance_container_name(name);
        match self
            .engine
            .published_port(&cname, self.config.instance_http_port)
            .await
        {
            Ok(Some(port)) => Some(port),
            _ => self.manager.instance_port(name).await,
        }
    }

    /// Degraded path: enumerate instance directories and resolve each
    /// instance individually.
    async fn list_fallback(&self, host: &str) -> Vec<InstanceView> {
        let names = list_instance_names(&self.config.instances_dir());
        if names.is_empty() {
            return Vec::new();
        }

        // One batch status query; absence of data is not an error.
        let status_map = self.engine.status_map(true).await.unwrap_or_default();

        let mut views = Vec::with_capacity(names.len());
        for name in names {
            let cname = instance_container_name(&name);
            let status = status_map
                .get(&cname)
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| "(unknown)".to_string());
            let url = self
                .topology
                .resolve_url(&name, host)
                .await
                .unwrap_or_default();
            let port = match self.topology.mode().await {
                TopologyMode::Direct => self.lookup_port(&name).await,
                _ => None,
            };
            views.push(InstanceView {
                name,
                status,
                url,
                port,
            });
        }
        views
    }

    /// Overlay precedence: rebuilding flag > updating flag > engine status.
    fn apply_flag_overlay(&self, view: &mut InstanceView) {
        if self.flags.has_fresh(&view.name, FlagKind::Rebuilding) {
            view.status = FlagKind::Rebuilding.display_status().to_string();
        } else if self.flags.has_fresh(&view.name, FlagKind::Updating) {
            view.status = FlagKind::Updating.display_status().to_string();
        }
    }
}
