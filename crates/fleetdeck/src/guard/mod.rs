//! Resource guard interface.
//!
//! The embedded resource-guard subsystem (memory/CPU/swap watchdogs over the
//! fleet) is an external collaborator: the control plane only consumes it
//! through this trait. No implementation ships in this crate; deployments
//! wire one in when constructing the server.

use async_trait::async_trait;

/// Result type for guard calls.
pub type GuardResult<T> = Result<T, GuardError>;

/// Errors surfaced by a guard implementation.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// Unknown or read-only configuration key.
    #[error("unknown guard config key: {0}")]
    UnknownKey(String),

    /// The guard failed internally.
    #[error("guard error: {0}")]
    Internal(String),
}

/// Status / set-config / run-once / tail-logs surface of the resource guard.
#[async_trait]
pub trait ResourceGuard: Send + Sync {
    /// Current configuration and latest stats snapshot.
    async fn status(&self) -> GuardResult<serde_json::Value>;

    /// Update one configuration key.
    async fn set_config(&self, key: &str, value: serde_json::Value) -> GuardResult<()>;

    /// Trigger one guard pass outside the regular schedule.
    async fn run_once(&self) -> GuardResult<()>;

    /// Tail of the guard's log, if it keeps one.
    async fn tail_logs(&self) -> GuardResult<Option<String>>;
}
