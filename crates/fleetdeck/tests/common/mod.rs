//! Shared test harness: an app wired to mock engine/manager implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;

use fleetdeck::api::{AppState, create_router};
use fleetdeck::auth::AuthConfig;
use fleetdeck::config::ServerConfig;
use fleetdeck::engine::{ContainerStats, EngineApi, EngineResult, RunSpec};
use fleetdeck::manager::{ManagerApi, ManagerOutcome, ManagerResult};

/// Engine mock: serves canned data and records every mutation.
#[derive(Default)]
pub struct MockEngine {
    pub statuses: Mutex<HashMap<String, String>>,
    pub published: Mutex<HashMap<String, u16>>,
    pub removed: Mutex<Vec<String>>,
    pub ran: Mutex<Vec<String>>,
}

#[async_trait]
impl EngineApi for MockEngine {
    async fn status_map(&self, _all: bool) -> EngineResult<HashMap<String, String>> {
        Ok(self.statuses.lock().unwrap().clone())
    }

    async fn container_status(&self, name: &str) -> EngineResult<Option<String>> {
        Ok(self.statuses.lock().unwrap().get(name).cloned())
    }

    async fn is_running(&self, name: &str) -> EngineResult<bool> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.starts_with("Up"))
            .unwrap_or(false))
    }

    async fn remove(&self, name: &str, _force: bool) -> EngineResult<()> {
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> EngineResult<String> {
        self.ran.lock().unwrap().push(spec.name.clone());
        Ok("container-id".to_string())
    }

    async fn ensure_network(&self, _name: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn published_port(&self, name: &str, _container_port: u16) -> EngineResult<Option<u16>> {
        Ok(self.published.lock().unwrap().get(name).copied())
    }

    async fn stats_all(&self) -> EngineResult<Vec<ContainerStats>> {
        Ok(vec![ContainerStats {
            name: "fleetdeck_alpha".to_string(),
            cpu_percent: 12.5,
            mem_percent: 40.0,
        }])
    }

    async fn logs(&self, _name: &str, _tail: u32) -> EngineResult<String> {
        Ok("log line\n".to_string())
    }

    async fn exec_shell(
        &self,
        _name: &str,
        _command: &str,
        _as_root: bool,
        _timeout: Duration,
    ) -> EngineResult<(i32, String, String)> {
        Ok((0, "done\n".to_string(), String::new()))
    }

    async fn prune(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Manager mock: canned `list` output, success for everything else,
/// recording each invocation.
#[derive(Default)]
pub struct MockManager {
    pub list_output: Mutex<String>,
    pub calls: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ManagerApi for MockManager {
    async fn run(&self, args: &[&str]) -> ManagerResult<ManagerOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push(args.iter().map(|s| s.to_string()).collect());
        let stdout = if args.first() == Some(&"list") {
            self.list_output.lock().unwrap().clone()
        } else {
            String::new()
        };
        Ok(ManagerOutcome {
            ok: true,
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn instance_url(&self, _name: &str) -> Option<String> {
        None
    }

    async fn instance_port(&self, _name: &str) -> Option<u16> {
        None
    }
}

/// A router plus handles into its mocks and state.
pub struct TestHarness {
    pub app: Router,
    pub state: AppState,
    pub engine: Arc<MockEngine>,
    pub manager: Arc<MockManager>,
    _state_dir: TempDir,
}

/// Build a test app with the given auth configuration.
pub fn harness_with_auth(auth: AuthConfig) -> TestHarness {
    let state_dir = TempDir::new().expect("tempdir");
    let config = ServerConfig {
        state_dir: state_dir.path().to_path_buf(),
        auth,
        ..Default::default()
    };
    let engine = Arc::new(MockEngine::default());
    let manager = Arc::new(MockManager::default());
    let state = AppState::with_parts(config, engine.clone(), manager.clone(), None);
    let app = create_router(state.clone());
    TestHarness {
        app,
        state,
        engine,
        manager,
        _state_dir: state_dir,
    }
}

/// Test app with auth disabled (open mode).
pub fn harness() -> TestHarness {
    harness_with_auth(AuthConfig::default())
}

impl TestHarness {
    /// Register an instance directory the way the manager would.
    pub fn seed_instance(&self, name: &str) {
        std::fs::create_dir_all(self.state.config.instances_dir().join(name)).expect("seed");
    }
}
