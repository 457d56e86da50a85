//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::config::ServerConfig;
use crate::engine::{Engine, EngineApi};
use crate::flags::FlagStore;
use crate::guard::ResourceGuard;
use crate::health::HealthRemediator;
use crate::manager::{InstanceManager, ManagerApi};
use crate::registry::InstanceRegistry;
use crate::tasks::Dispatcher;
use crate::topology::{TopologyController, TopologyStore};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub engine: Arc<dyn EngineApi>,
    pub manager: Arc<dyn ManagerApi>,
    pub flags: FlagStore,
    pub dispatcher: Dispatcher,
    pub topology: Arc<TopologyController>,
    pub registry: Arc<InstanceRegistry>,
    pub health: Arc<HealthRemediator>,
    pub auth: AuthState,
    pub guard: Option<Arc<dyn ResourceGuard>>,
}

impl AppState {
    /// Wire up the real engine and manager behind the orchestrator.
    pub fn build(config: ServerConfig) -> Self {
        let engine: Arc<dyn EngineApi> = Arc::new(Engine::new(&config.engine_binary));
        let manager: Arc<dyn ManagerApi> = Arc::new(InstanceManager::new(
            &config.manager_binary,
            &config.state_dir,
        ));
        Self::with_parts(config, engine, manager, None)
    }

    /// Assemble state from explicit engine/manager implementations. Tests
    /// inject mocks here.
    pub fn with_parts(
        config: ServerConfig,
        engine: Arc<dyn EngineApi>,
        manager: Arc<dyn ManagerApi>,
        guard: Option<Arc<dyn ResourceGuard>>,
    ) -> Self {
        let config = Arc::new(config);
        let auth = AuthState::new(config.auth.clone());
        let flags = FlagStore::new(config.instances_dir());
        let dispatcher = Dispatcher::new();
        let store = Arc::new(TopologyStore::load(config.env_file()));
        let topology = Arc::new(TopologyController::new(
            config.clone(),
            store,
            engine.clone(),
            manager.clone(),
            dispatcher.clone(),
        ));
        let registry = Arc::new(InstanceRegistry::new(
            config.clone(),
            engine.clone(),
            manager.clone(),
            flags.clone(),
            topology.clone(),
        ));
        let health = Arc::new(HealthRemediator::new(
            topology.clone(),
            engine.clone(),
            manager.clone(),
        ));
        Self {
            config,
            engine,
            manager,
            flags,
            dispatcher,
            topology,
            registry,
            health,
            auth,
            guard,
        }
    }
}
