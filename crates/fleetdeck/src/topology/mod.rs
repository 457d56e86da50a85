//! Fleet topology control.
//!
//! The state machine governing how the fleet is networked:
//!
//! - `Direct`: every instance publishes its own host port.
//! - `Merged`: instances sit behind the shared edge router under
//!   per-instance path prefixes, optionally fronted by a custom domain.
//! - `SinglePort`: merged routing with the edge router bound to one
//!   caller-chosen host port.
//!
//! Exactly one mode is active fleet-wide. Mode and its parameters persist in
//! the state-dir env file so they survive restarts; the file is loaded once
//! at startup into memory and re-written on every transition, with an
//! explicit `reload()` instead of implicit re-reads.
//!
//! Transitions are idempotent and tolerate partial prior state: containers
//! are unconditionally removed and recreated rather than assuming a clean
//! starting point. The transition that moves the control plane's own
//! listener follows a two-phase shape: the replacement listener is started
//! and verified to answer before any step that could take down the
//! currently-serving process.

mod envfile;

pub use envfile::{read_env, write_env_kv};

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{ServerConfig, list_instance_names};
use crate::engine::{EngineApi, EngineError, RunSpec, VolumeMount};
use crate::instance_container_name;
use crate::manager::{ManagerApi, run_logged};
use crate::tasks::Dispatcher;

/// Edge router container name.
pub const EDGE_CONTAINER: &str = "fleetdeck-edge";
/// Control-plane companion container name.
pub const COMPANION_CONTAINER: &str = "fleetdeck-proxy";
/// Presentation (console) container name.
pub const WEB_CONTAINER: &str = "fleetdeck-web";

// Persisted env keys.
const KEY_NO_EDGE: &str = "NO_EDGE";
const KEY_MERGED_MODE: &str = "MERGED_MODE";
const KEY_HTTP_PORT: &str = "HTTP_PORT";
const KEY_BASE_PATH: &str = "BASE_PATH";
const KEY_DOMAIN: &str = "FLEETDECK_DOMAIN";
const KEY_CONSOLE_PORT: &str = "CONSOLE_PORT";
const KEY_DIRECT_PORT_START: &str = "DIRECT_PORT_START";
const KEY_EDGE_NETWORK: &str = "EDGE_NETWORK";
const KEY_ENABLE_CONSOLE: &str = "ENABLE_CONSOLE";

const DEFAULT_BASE_PATH: &str = "/desk";
const DEFAULT_DIRECT_PORT_START: u16 = 20000;

/// Result type for topology operations.
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Errors from topology transitions.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// Requested port is already bound on the host.
    #[error("port {0} appears to be in use; choose a different port")]
    PortInUse(u16),

    /// The replacement control-plane listener never answered.
    #[error("replacement listener on port {0} did not become reachable; aborting transition")]
    ListenerUnverified(u16),

    /// Engine-level failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Persisting the env file failed.
    #[error("failed to persist topology state: {0}")]
    Persist(#[from] std::io::Error),
}

/// The fleet-wide networking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyMode {
    /// Each instance bound to a distinct host port.
    Direct,
    /// All instances behind the edge router under path prefixes.
    Merged,
    /// Merged, with the edge router on one chosen host port.
    SinglePort(u16),
}

impl TopologyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyMode::Direct => "direct",
            TopologyMode::Merged => "merged",
            TopologyMode::SinglePort(_) => "single-port",
        }
    }
}

/// Parsed view of the persisted topology state.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub merged: bool,
    pub http_port: Option<u16>,
    pub base_path: String,
    pub domain: String,
    pub console_port: Option<u16>,
    pub direct_port_start: u16,
    pub edge_network: String,
}

impl Default for TopologySnapshot {
    fn default() -> Self {
        Self::from_env(&BTreeMap::new())
    }
}

impl TopologySnapshot {
    fn from_env(env: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| env.get(key).cloned().unwrap_or_default();
        let merged = env.get(KEY_NO_EDGE).map(String::as_str).unwrap_or("1") == "0";
        Self {
            merged,
            http_port: get(KEY_HTTP_PORT).parse().ok(),
            base_path: normalize_base_path(&get(KEY_BASE_PATH)),
            domain: get(KEY_DOMAIN),
            console_port: get(KEY_CONSOLE_PORT).parse().ok(),
            direct_port_start: get(KEY_DIRECT_PORT_START)
                .parse()
                .unwrap_or(DEFAULT_DIRECT_PORT_START),
            edge_network: {
                let net = get(KEY_EDGE_NETWORK);
                if net.is_empty() { "edge".to_string() } else { net }
            },
        }
    }

    /// Derive the active mode.
    pub fn mode(&self) -> TopologyMode {
        if !self.merged {
            return TopologyMode::Direct;
        }
        match self.http_port {
            Some(port) => TopologyMode::SinglePort(port),
            None => TopologyMode::Merged,
        }
    }
}

/// Normalize a base path to a single leading slash, no trailing slash.
fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_BASE_PATH.to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// In-memory topology state backed by the env file.
#[derive(Debug)]
pub struct TopologyStore {
    path: PathBuf,
    inner: RwLock<TopologySnapshot>,
}

impl TopologyStore {
    /// Load the store from the env file (missing file means defaults).
    pub fn load(path: PathBuf) -> Self {
        let snapshot = TopologySnapshot::from_env(&envfile::read_env(&path));
        Self {
            path,
            inner: RwLock::new(snapshot),
        }
    }

    /// Current snapshot.
    pub async fn snapshot(&self) -> TopologySnapshot {
        self.inner.read().await.clone()
    }

    /// Re-read the env file, replacing the in-memory state. An explicit
    /// operation; nothing reloads implicitly.
    pub async fn reload(&self) {
        let snapshot = TopologySnapshot::from_env(&envfile::read_env(&self.path));
        *self.inner.write().await = snapshot;
    }

    /// Merge updates into the env file and refresh the in-memory state.
    pub async fn persist(
        &self,
        updates: impl IntoIterator<Item = (String, String)>,
    ) -> std::io::Result<()> {
        envfile::write_env_kv(&self.path, updates)?;
        self.reload().await;
        Ok(())
    }
}

/// Mode information exposed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyInfo {
    pub merged: bool,
    pub mode: &'static str,
    #[serde(rename = "basePath")]
    pub base_path: String,
    pub domain: String,
    #[serde(rename = "consolePort")]
    pub console_port: Option<u16>,
    pub ip: String,
}

/// Outcome of a `set_domain` call.
#[derive(Debug, Clone, Serialize)]
pub struct DomainOutcome {
    pub ok: bool,
    pub domain: String,
    pub ip: String,
    pub applied: bool,
}

/// The topology state machine and its transition procedures.
#[derive(Clone)]
pub struct TopologyController {
    config: Arc<ServerConfig>,
    store: Arc<TopologyStore>,
    engine: Arc<dyn EngineApi>,
    manager: Arc<dyn ManagerApi>,
    dispatcher: Dispatcher,
    probe_client: reqwest::Client,
}

impl TopologyController {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<TopologyStore>,
        engine: Arc<dyn EngineApi>,
        manager: Arc<dyn ManagerApi>,
        dispatcher: Dispatcher,
    ) -> Self {
        let probe_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            config,
            store,
            engine,
            manager,
            dispatcher,
            probe_client,
        }
    }

    pub fn store(&self) -> &TopologyStore {
        &self.store
    }

    /// Current mode.
    pub async fn mode(&self) -> TopologyMode {
        self.store.snapshot().await.mode()
    }

    /// Mode info for the given caller-visible host.
    pub async fn info(&self, host: &str) -> TopologyInfo {
        let snap = self.store.snapshot().await;
        TopologyInfo {
            merged: snap.merged,
            mode: snap.mode().as_str(),
            base_path: snap.base_path.clone(),
            domain: snap.domain.clone(),
            console_port: snap.console_port,
            ip: host.to_string(),
        }
    }

    /// Non-destructive bind-and-release probe for a host port.
    pub fn probe_port_free(port: u16) -> TopologyResult<()> {
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => {
                drop(listener);
                Ok(())
            }
            Err(_) => Err(TopologyError::PortInUse(port)),
        }
    }

    /// Switch the fleet to `SinglePort(port)`.
    ///
    /// The port is probed synchronously; a conflict fails the call with no
    /// state mutated. The multi-step procedure itself runs on a background
    /// task so the HTTP response for this call can be returned before any
    /// disruptive step completes.
    pub fn enable_single_port(&self, port: u16) -> TopologyResult<()> {
        Self::probe_port_free(port)?;
        let ctl = self.clone();
        self.dispatcher.spawn("enable-single-port", async move {
            if let Err(err) = ctl.enact_enable_single_port(port).await {
                error!("enable-single-port({}) failed: {}", port, err);
            }
        });
        Ok(())
    }

    /// The full single-port procedure. Runs on a background task.
    async fn enact_enable_single_port(&self, port: u16) -> TopologyResult<()> {
        let snap = self.store.snapshot().await;
        let edge_network = self.config.edge_network.clone();

        // Phase 1: persist the new mode so recreated instances pick it up.
        self.store
            .persist([
                (KEY_NO_EDGE.to_string(), "0".to_string()),
                (KEY_MERGED_MODE.to_string(), "1".to_string()),
                (KEY_HTTP_PORT.to_string(), port.to_string()),
                (KEY_EDGE_NETWORK.to_string(), edge_network.clone()),
                (KEY_ENABLE_CONSOLE.to_string(), "1".to_string()),
                (KEY_BASE_PATH.to_string(), snap.base_path.clone()),
            ])
            .await?;

        self.engine.ensure_network(&edge_network).await?;

        // Replace the edge router.
        self.engine.remove(EDGE_CONTAINER, true).await?;
        self.engine.run(&self.edge_spec(port, &edge_network)).await?;

        // Start the replacement control-plane listener before anything that
        // could remove the currently-serving process.
        self.engine.remove(COMPANION_CONTAINER, true).await?;
        self.engine
            .run(&self.companion_spec(&edge_network))
            .await?;

        // Phase 2: only proceed to the disruptive tail once the replacement
        // answers through the edge router.
        if !self.verify_replacement_listener(port).await {
            return Err(TopologyError::ListenerUnverified(port));
        }

        info!("replacement listener verified on :{}; recreating instances", port);
        self.recreate_all_instances().await;
        Ok(())
    }

    /// Switch the fleet back to `Direct`, optionally pinning the console to
    /// a caller-specified direct port.
    pub fn disable_single_port(&self, console_port: Option<u16>) {
        let ctl = self.clone();
        self.dispatcher.spawn("disable-single-port", async move {
            if let Err(err) = ctl.enact_disable_single_port(console_port).await {
                error!("disable-single-port failed: {}", err);
            }
        });
    }

    /// Effective console port a disable transition will use.
    pub async fn effective_console_port(&self, requested: Option<u16>) -> u16 {
        let snap = self.store.snapshot().await;
        requested
            .or(snap.console_port)
            .unwrap_or(snap.direct_port_start)
    }

    async fn enact_disable_single_port(&self, console_port: Option<u16>) -> TopologyResult<()> {
        let mut updates = vec![
            (KEY_NO_EDGE.to_string(), "1".to_string()),
            (KEY_MERGED_MODE.to_string(), "0".to_string()),
            (KEY_ENABLE_CONSOLE.to_string(), "1".to_string()),
        ];
        if let Some(port) = console_port {
            updates.push((KEY_CONSOLE_PORT.to_string(), port.to_string()));
        }
        self.store.persist(updates).await?;

        // Tear down the merged-mode plumbing.
        self.engine.remove(COMPANION_CONTAINER, true).await?;
        self.engine.remove(EDGE_CONTAINER, true).await?;

        // Rejoin every instance to direct networking.
        self.recreate_all_instances().await;

        // Recreate the externally-reachable console listener on a direct port.
        let port = self.effective_console_port(console_port).await;
        self.engine.remove(WEB_CONTAINER, true).await?;
        if let Err(err) = self.engine.run(&self.web_spec(Some(port))).await {
            warn!("starting {} on :{} failed: {}", WEB_CONTAINER, port, err);
        }
        Ok(())
    }

    /// Persist a custom domain, manage the presentation container, and
    /// optionally apply merged-mode routing to the whole fleet.
    pub async fn set_domain(
        &self,
        domain: &str,
        apply: bool,
        host: &str,
    ) -> TopologyResult<DomainOutcome> {
        self.store
            .persist([(KEY_DOMAIN.to_string(), domain.to_string())])
            .await?;

        // Presentation container follows the domain's presence.
        self.engine.remove(WEB_CONTAINER, true).await?;
        if !domain.is_empty() {
            if let Err(err) = self.engine.run(&self.web_spec(None)).await {
                warn!("starting {} failed: {}", WEB_CONTAINER, err);
            }
        }

        if apply {
            self.store
                .persist([
                    (KEY_NO_EDGE.to_string(), "0".to_string()),
                    (KEY_MERGED_MODE.to_string(), "1".to_string()),
                    (
                        KEY_EDGE_NETWORK.to_string(),
                        self.config.edge_network.clone(),
                    ),
                    (KEY_ENABLE_CONSOLE.to_string(), "1".to_string()),
                ])
                .await?;

            let ctl = self.clone();
            let network = self.config.edge_network.clone();
            self.dispatcher.spawn("apply-domain", async move {
                if let Err(err) = ctl.engine.ensure_network(&network).await {
                    error!("apply-domain: ensure network failed: {}", err);
                    return;
                }
                ctl.recreate_all_instances().await;
            });
        }

        Ok(DomainOutcome {
            ok: true,
            domain: domain.to_string(),
            ip: host.to_string(),
            applied: apply,
        })
    }

    /// Resolve the topology-aware URL for one instance.
    ///
    /// Direct mode combines the caller-visible host with the instance's
    /// published port (engine first, manager as fallback). Merged modes
    /// combine the base path with the instance name, substituting the
    /// custom domain when set.
    pub async fn resolve_url(&self, name: &str, host: &str) -> Option<String> {
        let snap = self.store.snapshot().await;
        let host = if host.is_empty() {
            self.config.default_host.as_str()
        } else {
            host
        };
        match snap.mode() {
            TopologyMode::Direct => {
                let cname = instance_container_name(name);
                let port = match self
                    .engine
                    .published_port(&cname, self.config.instance_http_port)
                    .await
                {
                    Ok(Some(port)) => Some(port),
                    _ => self.manager.instance_port(name).await,
                };
                match port {
                    Some(port) => Some(format!("http://{}:{}/", host, port)),
                    // Last resort: whatever the manager believes the URL is.
                    None => self.manager.instance_url(name).await,
                }
            }
            TopologyMode::Merged => {
                let authority = if snap.domain.is_empty() {
                    host.to_string()
                } else {
                    snap.domain.clone()
                };
                Some(format!("http://{}{}/{}/", authority, snap.base_path, name))
            }
            TopologyMode::SinglePort(port) => {
                let authority = if snap.domain.is_empty() {
                    format!("{}:{}", host, port)
                } else {
                    snap.domain.clone()
                };
                Some(format!("http://{}{}/{}/", authority, snap.base_path, name))
            }
        }
    }

    /// Force-recreate every known instance so each rejoins the current
    /// topology. Per-instance failures are logged and do not stop the sweep.
    pub async fn recreate_all_instances(&self) {
        let names = list_instance_names(&self.config.instances_dir());
        for name in names {
            let cname = instance_container_name(&name);
            if let Err(err) = self.engine.remove(&cname, true).await {
                warn!("removing {} failed: {}", cname, err);
            }
            run_logged(self.manager.as_ref(), &["start", &name]).await;
        }
    }

    /// Poll the health endpoint through the edge router until the
    /// replacement listener answers, bounded to ~5 seconds.
    async fn verify_replacement_listener(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}/api/health", port);
        for _ in 0..10 {
            if let Ok(resp) = self.probe_client.get(&url).send().await {
                if resp.status().is_success() {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        false
    }

    fn edge_spec(&self, port: u16, network: &str) -> RunSpec {
        RunSpec::new(EDGE_CONTAINER, &self.config.edge_image)
            .restart("unless-stopped")
            .port(port, 80)
            .volume(VolumeMount::read_only(
                "/var/run/docker.sock",
                "/var/run/docker.sock",
            ))
            .network(network)
            .command(vec![
                "--providers.docker=true".to_string(),
                "--providers.docker.exposedbydefault=false".to_string(),
                "--entrypoints.web.address=:80".to_string(),
                "--api.dashboard=true".to_string(),
            ])
    }

    fn companion_spec(&self, network: &str) -> RunSpec {
        let state_dir = self.config.state_dir.to_string_lossy().to_string();
        let auth = &self.config.auth;
        RunSpec::new(COMPANION_CONTAINER, &self.config.control_plane_image)
            .restart("unless-stopped")
            .network(network)
            .volume(VolumeMount::new(state_dir.clone(), state_dir.clone()))
            .volume(VolumeMount::new(
                "/var/run/docker.sock",
                "/var/run/docker.sock",
            ))
            .volume(VolumeMount::read_only(
                "/usr/local/bin/fleetdeck-manager",
                "/usr/local/bin/fleetdeck-manager",
            ))
            .volume(VolumeMount::read_only(
                &self.config.host_engine_bin,
                &self.config.container_engine_bin,
            ))
            .env("FLEETDECK_STATE_DIR", state_dir)
            .env(
                "FLEETDECK_AUTH__ADMIN_USER",
                auth.admin_user.clone().unwrap_or_default(),
            )
            .env(
                "FLEETDECK_AUTH__ADMIN_PASS",
                auth.admin_pass.clone().unwrap_or_default(),
            )
            .label("traefik.enable", "true")
            .label(
                "traefik.http.routers.fleetdeck.rule",
                "PathPrefix(`/api`)",
            )
            .label("traefik.http.routers.fleetdeck.entrypoints", "web")
            .label(
                "traefik.http.services.fleetdeck.loadbalancer.server.port",
                self.config.port.to_string(),
            )
    }

    fn web_spec(&self, direct_port: Option<u16>) -> RunSpec {
        let dist = self.config.console_dist_dir().to_string_lossy().to_string();
        let container_port = self.config.web_container_port;
        let mut spec = RunSpec::new(WEB_CONTAINER, &self.config.web_image)
            .restart("unless-stopped")
            .volume(VolumeMount::read_only(dist, "/usr/share/nginx/html"));
        spec = match direct_port {
            Some(port) => spec.port(port, container_port),
            None => spec.port(container_port, container_port),
        };
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_from(pairs: &[(&str, &str)]) -> TopologySnapshot {
        let env = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TopologySnapshot::from_env(&env)
    }

    #[test]
    fn test_mode_defaults_to_direct() {
        let snap = TopologySnapshot::default();
        assert_eq!(snap.mode(), TopologyMode::Direct);
        assert_eq!(snap.base_path, DEFAULT_BASE_PATH);
        assert_eq!(snap.direct_port_start, DEFAULT_DIRECT_PORT_START);
    }

    #[test]
    fn test_mode_derivation() {
        let merged = snapshot_from(&[("NO_EDGE", "0")]);
        assert_eq!(merged.mode(), TopologyMode::Merged);

        let single = snapshot_from(&[("NO_EDGE", "0"), ("HTTP_PORT", "20002")]);
        assert_eq!(single.mode(), TopologyMode::SinglePort(20002));

        // HTTP_PORT without merged flag is still direct
        let direct = snapshot_from(&[("NO_EDGE", "1"), ("HTTP_PORT", "20002")]);
        assert_eq!(direct.mode(), TopologyMode::Direct);
    }

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path(""), "/desk");
        assert_eq!(normalize_base_path("/desk/"), "/desk");
        assert_eq!(normalize_base_path("vm"), "/vm");
        assert_eq!(normalize_base_path("/custom"), "/custom");
    }

    #[test]
    fn test_probe_port_conflict() {
        // Bind a listener on an ephemeral port, then probe it.
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = TopologyController::probe_port_free(port).unwrap_err();
        assert!(matches!(err, TopologyError::PortInUse(p) if p == port));
        drop(listener);
        // After release the probe succeeds.
        assert!(TopologyController::probe_port_free(port).is_ok());
    }

    #[tokio::test]
    async fn test_store_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopologyStore::load(dir.path().join(".env"));
        assert_eq!(store.snapshot().await.mode(), TopologyMode::Direct);

        store
            .persist([
                (KEY_NO_EDGE.to_string(), "0".to_string()),
                (KEY_HTTP_PORT.to_string(), "20002".to_string()),
            ])
            .await
            .unwrap();
        assert_eq!(
            store.snapshot().await.mode(),
            TopologyMode::SinglePort(20002)
        );

        // A fresh store over the same file sees the persisted mode.
        let reopened = TopologyStore::load(dir.path().join(".env"));
        assert_eq!(
            reopened.snapshot().await.mode(),
            TopologyMode::SinglePort(20002)
        );
    }
}
