//! API request handlers.
//!
//! Thin delegation onto the orchestrator components. Handlers validate
//! input, pick the caller-visible host off the request, and relay captured
//! manager/engine output verbatim on failure.

use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::AUTH_COOKIE;
use crate::flags::FlagKind;
use crate::instance_container_name;
use crate::manager::{run_logged, validate_instance_name};
use crate::registry::InstanceView;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// In-instance exec deadline.
const EXEC_TIMEOUT: Duration = Duration::from_secs(10);
/// Log lines returned by the logs endpoint.
const LOG_TAIL: u32 = 400;
/// Default single-port mode port when the caller names none.
const DEFAULT_SINGLE_PORT: u16 = 20002;

/// Caller-visible host: forwarded host wins, port stripped.
fn caller_host(headers: &HeaderMap) -> String {
    let raw = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    raw.split(':').next().unwrap_or_default().to_string()
}

fn validate_app_name(app: &str) -> ApiResult<()> {
    if app.is_empty()
        || !app
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::bad_request(format!("invalid app name: {}", app)));
    }
    Ok(())
}

fn checked_name(name: &str) -> ApiResult<()> {
    validate_instance_name(name).map_err(ApiError::from)
}

// ============================================================================
// Health and auth
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub password: String,
}

/// Console login: checks the configured console password and mints a signed
/// bearer token, also set as a cookie for browser convenience.
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Response {
    let Some(expected) = state.config.auth.console_password.clone() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": "not-configured"})),
        )
            .into_response();
    };
    if body.password != expected {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"ok": false, "error": "invalid"})),
        )
            .into_response();
    }
    let ttl = Duration::from_secs(state.config.auth.token_ttl_secs);
    let (token, expiry) = state.auth.tokens().issue(ttl);
    let cookie = format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/",
        AUTH_COOKIE, token
    );
    (
        [(header::SET_COOKIE, cookie)],
        Json(json!({"ok": true, "token": token, "expiry": expiry})),
    )
        .into_response()
}

/// Whether the request carries a valid token.
pub async fn auth_status(State(state): State<AppState>, headers: HeaderMap) -> Json<serde_json::Value> {
    let ok = state
        .auth
        .request_token(&headers)
        .map(|t| state.auth.tokens().verify(&t))
        .unwrap_or(false);
    Json(json!({"ok": ok}))
}

// ============================================================================
// Instance listing and lifecycle
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub instances: Vec<InstanceView>,
}

/// List all instances with merged status and topology-aware URLs.
pub async fn list_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<ListResponse> {
    let host = caller_host(&headers);
    Json(ListResponse {
        instances: state.registry.list(&host).await,
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
}

/// Create an instance and auto-start it.
///
/// Uniqueness guard: the per-name lock excludes a concurrent mutation of the
/// same name, and an existing instance directory or live container is a
/// conflict before the manager is ever invoked.
pub async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = body.name.trim();
    checked_name(name)?;

    let Some(_guard) = state.dispatcher.try_lock_instance(name) else {
        return Err(ApiError::conflict(format!(
            "instance '{}' has an operation in flight",
            name
        )));
    };

    let cname = instance_container_name(name);
    if state.config.instances_dir().join(name).is_dir()
        || matches!(state.engine.container_status(&cname).await, Ok(Some(_)))
    {
        return Err(ApiError::conflict(format!(
            "instance '{}' already exists",
            name
        )));
    }

    let outcome = state.manager.run(&["create", name]).await?;
    if outcome.exit_code == 125 {
        // Engine-level name conflict; try to start whatever exists.
        run_logged(state.manager.as_ref(), &["start", name]).await;
        return Err(ApiError::conflict(
            if outcome.stderr.is_empty() {
                "instance already exists or container conflict".to_string()
            } else {
                outcome.stderr
            },
        ));
    }
    if !outcome.ok {
        return Err(ApiError::internal(outcome.failure_message()));
    }

    run_logged(state.manager.as_ref(), &["start", name]).await;
    Ok(Json(json!({"ok": true})))
}

/// Start an instance. Safe-start: rejected when already running.
pub async fn start_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(&name)?;
    let cname = instance_container_name(&name);
    if state.engine.is_running(&cname).await.unwrap_or(false) {
        return Err(ApiError::conflict("instance already running"));
    }
    let outcome = state.manager.run(&["start", &name]).await?;
    if !outcome.ok {
        return Err(ApiError::internal(outcome.failure_message()));
    }
    Ok(Json(json!({"ok": true})))
}

/// Stop an instance.
pub async fn stop_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(&name)?;
    let outcome = state.manager.run(&["stop", &name]).await?;
    if !outcome.ok {
        return Err(ApiError::internal(outcome.failure_message()));
    }
    Ok(Json(json!({"ok": true})))
}

/// Restart an instance, relaying captured output.
pub async fn restart_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(&name)?;
    let outcome = state.manager.run(&["restart", &name]).await?;
    Ok(Json(json!({
        "ok": outcome.ok,
        "output": outcome.stdout,
        "error": outcome.stderr,
    })))
}

/// Delete an instance and its data.
pub async fn delete_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(&name)?;
    let outcome = state.manager.run(&["delete", &name]).await?;
    if !outcome.ok {
        return Err(ApiError::internal(outcome.failure_message()));
    }
    Ok(Json(json!({"ok": true})))
}

/// Reset: delete, recreate, and start in the background. Purges instance
/// data; the caller is expected to have confirmed.
pub async fn reset_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(&name)?;
    let manager = state.manager.clone();
    let target = name.clone();
    state
        .dispatcher
        .spawn_for_instance(&name, "reset", async move {
            run_logged(manager.as_ref(), &["delete", &target]).await;
            run_logged(manager.as_ref(), &["create", &target]).await;
            run_logged(manager.as_ref(), &["start", &target]).await;
        });
    Ok(Json(json!({"ok": true, "started": true})))
}

/// Update packages inside an instance, in the background, with the
/// `updating` flag visible while it runs.
pub async fn update_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(&name)?;
    state.flags.set(&name, FlagKind::Updating, true);
    let manager = state.manager.clone();
    let flags = state.flags.clone();
    let target = name.clone();
    state
        .dispatcher
        .spawn_for_instance(&name, "update", async move {
            run_logged(manager.as_ref(), &["update", &target]).await;
            // cleared unconditionally, success or not
            flags.set(&target, FlagKind::Updating, false);
        });
    Ok(Json(json!({"ok": true, "started": true})))
}

/// Clean package caches and temp files inside an instance. Best-effort.
pub async fn clean_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(&name)?;
    let cname = instance_container_name(&name);
    let steps = [
        "apt-get update || true",
        "apt-get -y autoremove || true",
        "apt-get -y autoclean || true",
        "apt-get -y clean || true",
        "rm -rf /var/cache/apt/archives/* || true",
        "rm -rf /var/lib/apt/lists/* || true",
        "rm -rf /tmp/* /var/tmp/* || true",
        "mkdir -p /var/lib/apt/lists || true",
    ];
    for step in steps {
        let _ = state
            .engine
            .exec_shell(&cname, step, true, Duration::from_secs(60))
            .await;
    }
    Ok(Json(json!({"ok": true})))
}

// ============================================================================
// Health check
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    #[serde(default)]
    pub nofix: Option<String>,
}

fn is_truthy(value: &Option<String>) -> bool {
    matches!(
        value.as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

/// Probe an instance and, unless `nofix` is set, remediate an unhealthy one.
pub async fn check_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<CheckQuery>,
) -> ApiResult<Response> {
    checked_name(&name)?;
    let no_fix = is_truthy(&query.nofix);
    let host = caller_host(&headers);
    let report = state.health.check(&name, &host, no_fix).await;

    if !report.ok && no_fix {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "ok": false,
                "code": report.code,
                "url": report.url,
                "output": "no-fix mode",
            })),
        )
            .into_response());
    }
    Ok(Json(report).into_response())
}

// ============================================================================
// Instance inspection (console surface)
// ============================================================================

/// Raw engine status string for one instance.
pub async fn instance_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(&name)?;
    let cname = instance_container_name(&name);
    let status = state.engine.container_status(&cname).await?;
    Ok(Json(json!({
        "ok": true,
        "status": status.unwrap_or_else(|| "not-found".to_string()),
    })))
}

/// Tail of an instance's container logs.
pub async fn instance_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(&name)?;
    let cname = instance_container_name(&name);
    let logs = state.engine.logs(&cname, LOG_TAIL).await?;
    Ok(Json(json!({"ok": true, "logs": logs})))
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub cmd: String,
}

/// Run a short-lived command inside an instance.
pub async fn exec_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<ExecRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(&name)?;
    if body.cmd.trim().is_empty() {
        return Err(ApiError::bad_request("missing cmd"));
    }
    let cname = instance_container_name(&name);
    let (code, stdout, stderr) = state
        .engine
        .exec_shell(&cname, &body.cmd, false, EXEC_TIMEOUT)
        .await?;
    Ok(Json(json!({
        "ok": code == 0,
        "returncode": code,
        "output": stdout,
        "error_output": stderr,
    })))
}

/// Per-instance resource usage snapshot.
pub async fn instance_stats(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.engine.stats_all().await?;
    let mut vms = serde_json::Map::new();
    for row in stats {
        let name = crate::instance_name_from_container(&row.name)
            .unwrap_or(&row.name)
            .to_string();
        vms.insert(
            name,
            json!({
                "cpu_percent": row.cpu_percent,
                "mem_percent": row.mem_percent,
                "container_name": row.name,
            }),
        );
    }
    Ok(Json(json!({"ok": true, "vms": vms})))
}

// ============================================================================
// App passthrough
// ============================================================================

async fn app_command(
    state: &AppState,
    command: &str,
    name: &str,
    app: &str,
) -> ApiResult<Json<serde_json::Value>> {
    checked_name(name)?;
    validate_app_name(app)?;
    let outcome = state.manager.run(&[command, name, app]).await?;
    Ok(Json(json!({
        "ok": outcome.ok,
        "output": outcome.stdout,
        "error": outcome.stderr,
    })))
}

pub async fn app_install(
    State(state): State<AppState>,
    Path((name, app)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    app_command(&state, "app-install", &name, &app).await
}

pub async fn app_status(
    State(state): State<AppState>,
    Path((name, app)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    app_command(&state, "app-status", &name, &app).await
}

pub async fn app_uninstall(
    State(state): State<AppState>,
    Path((name, app)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    app_command(&state, "app-uninstall", &name, &app).await
}

pub async fn app_reinstall(
    State(state): State<AppState>,
    Path((name, app)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    app_command(&state, "app-reinstall", &name, &app).await
}

// ============================================================================
// Bulk operations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct NamesRequest {
    #[serde(default)]
    pub names: Vec<String>,
}

fn checked_names(names: &[String]) -> ApiResult<()> {
    if names.is_empty() {
        return Err(ApiError::bad_request("No instance names provided"));
    }
    for name in names {
        checked_name(name)?;
    }
    Ok(())
}

/// Recreate the named instances synchronously, relaying manager output.
pub async fn recreate_instances(
    State(state): State<AppState>,
    Json(body): Json<NamesRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_names(&body.names)?;
    let mut args: Vec<&str> = vec!["recreate"];
    args.extend(body.names.iter().map(String::as_str));
    let outcome = state.manager.run(&args).await?;
    Ok(Json(json!({
        "ok": outcome.ok,
        "output": outcome.stdout,
        "error": outcome.stderr,
    })))
}

/// Rebuild images and recreate the named instances in the background. The
/// `rebuilding` flag is visible until the work finishes.
pub async fn rebuild_instances(
    State(state): State<AppState>,
    Json(body): Json<NamesRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_names(&body.names)?;
    spawn_flagged_bulk(&state, "rebuild", body.names);
    Ok(Json(json!({"ok": true, "started": true})))
}

/// Update the source checkout, rebuild the image, and recreate instances in
/// the background. With no names, targets every known instance.
pub async fn update_and_rebuild(
    State(state): State<AppState>,
    Json(body): Json<NamesRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let targets = if body.names.is_empty() {
        crate::config::list_instance_names(&state.config.instances_dir())
    } else {
        body.names
    };
    checked_names(&targets)?;
    spawn_flagged_bulk(&state, "update-and-rebuild", targets);
    Ok(Json(json!({"ok": true, "started": true})))
}

fn spawn_flagged_bulk(state: &AppState, command: &'static str, names: Vec<String>) {
    for name in &names {
        state.flags.set(name, FlagKind::Rebuilding, true);
    }
    let manager = state.manager.clone();
    let flags = state.flags.clone();
    state.dispatcher.spawn(command, async move {
        let mut args: Vec<&str> = vec![command];
        args.extend(names.iter().map(String::as_str));
        run_logged(manager.as_ref(), &args).await;
        for name in &names {
            flags.set(name, FlagKind::Rebuilding, false);
        }
    });
}

/// Reset every known instance in the background, serialized per instance.
pub async fn reset_all_instances(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let names = crate::config::list_instance_names(&state.config.instances_dir());
    let count = names.len();
    for name in names {
        let manager = state.manager.clone();
        let target = name.clone();
        state
            .dispatcher
            .spawn_for_instance(&name, "reset-all", async move {
                run_logged(manager.as_ref(), &["delete", &target]).await;
                run_logged(manager.as_ref(), &["create", &target]).await;
                run_logged(manager.as_ref(), &["start", &target]).await;
            });
    }
    Ok(Json(json!({"ok": true, "started": true, "count": count})))
}

/// Delete every instance, relaying manager output.
pub async fn delete_all_instances(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.manager.run(&["delete-all"]).await?;
    Ok(Json(json!({
        "ok": outcome.ok,
        "output": outcome.stdout,
        "error": outcome.stderr,
    })))
}

// ============================================================================
// Topology
// ============================================================================

/// Current topology mode info.
pub async fn topology_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<crate::topology::TopologyInfo> {
    let host = caller_host(&headers);
    Json(state.topology.info(&host).await)
}

#[derive(Debug, Deserialize)]
pub struct PortRequest {
    #[serde(default)]
    pub port: Option<u16>,
}

/// Switch to single-port mode. The port is conflict-checked synchronously;
/// the transition runs in the background so this response can be written
/// before the serving listener is replaced.
pub async fn enable_single_port(
    State(state): State<AppState>,
    Json(body): Json<PortRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let port = body.port.unwrap_or(DEFAULT_SINGLE_PORT);
    state.topology.enable_single_port(port)?;
    info!("single-port mode enabling on :{}", port);
    Ok(Json(json!({
        "ok": true,
        "message": format!(
            "Enabling single-port mode on :{}. The control plane may move to http://<host>:{}/api shortly.",
            port, port
        ),
    })))
}

/// Switch back to direct mode.
pub async fn disable_single_port(
    State(state): State<AppState>,
    Json(body): Json<PortRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let effective = state.topology.effective_console_port(body.port).await;
    state.topology.disable_single_port(body.port);
    Ok(Json(json!({
        "ok": true,
        "port": effective,
        "message": format!(
            "Disabling single-port mode; the console will run on http://<host>:{}/.",
            effective
        ),
    })))
}

#[derive(Debug, Deserialize)]
pub struct DomainRequest {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub apply: bool,
}

/// Persist a custom domain and manage the presentation container; with
/// `apply`, flip the fleet to merged routing in the background.
pub async fn set_domain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DomainRequest>,
) -> ApiResult<Json<crate::topology::DomainOutcome>> {
    let domain = body.domain.trim();
    if !domain.is_empty()
        && !domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(ApiError::bad_request(format!("invalid domain: {}", domain)));
    }
    let host = caller_host(&headers);
    let outcome = state.topology.set_domain(domain, body.apply, &host).await?;
    Ok(Json(outcome))
}

// ============================================================================
// Maintenance and guard
// ============================================================================

/// Prune unused engine data in the background.
pub async fn prune_engine(State(state): State<AppState>) -> Json<serde_json::Value> {
    let engine = state.engine.clone();
    state.dispatcher.spawn("prune", async move {
        let _ = engine.prune().await;
    });
    Json(json!({"ok": true, "started": true}))
}

fn guard_of(state: &AppState) -> ApiResult<std::sync::Arc<dyn crate::guard::ResourceGuard>> {
    state
        .guard
        .clone()
        .ok_or_else(|| ApiError::ServiceUnavailable("resource guard not configured".to_string()))
}

/// Resource guard status and stats.
pub async fn guard_status(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let guard = guard_of(&state)?;
    let status = guard
        .status()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({"ok": true, "status": status})))
}

#[derive(Debug, Deserialize)]
pub struct GuardSetRequest {
    pub key: String,
    #[serde(default)]
    pub val: serde_json::Value,
}

/// Update one resource guard config key.
pub async fn guard_set(
    State(state): State<AppState>,
    Json(body): Json<GuardSetRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let guard = guard_of(&state)?;
    guard
        .set_config(&body.key, body.val)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({"ok": true})))
}

/// Trigger one guard pass in the background.
pub async fn guard_run_once(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let guard = guard_of(&state)?;
    state.dispatcher.spawn("guard-run-once", async move {
        if let Err(err) = guard.run_once().await {
            log::warn!("guard run-once failed: {}", err);
        }
    });
    Ok(Json(json!({"ok": true, "started": true})))
}

/// Tail of the guard's logs as plain text.
pub async fn guard_logs(State(state): State<AppState>) -> ApiResult<Response> {
    let guard = guard_of(&state)?;
    let logs = guard
        .tail_logs()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    match logs {
        Some(text) if !text.is_empty() => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response()),
        _ => Err(ApiError::not_found("no logs")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_host() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "example.com:8250".parse().unwrap());
        assert_eq!(caller_host(&headers), "example.com");

        headers.insert("x-forwarded-host", "front.example.com".parse().unwrap());
        assert_eq!(caller_host(&headers), "front.example.com");

        assert_eq!(caller_host(&HeaderMap::new()), "");
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy(&Some("1".to_string())));
        assert!(is_truthy(&Some("true".to_string())));
        assert!(is_truthy(&Some("yes".to_string())));
        assert!(is_truthy(&Some("on".to_string())));
        assert!(!is_truthy(&Some("0".to_string())));
        assert!(!is_truthy(&None));
    }

    #[test]
    fn test_validate_app_name() {
        assert!(validate_app_name("chrome").is_ok());
        assert!(validate_app_name("lib-office_7").is_ok());
        assert!(validate_app_name("").is_err());
        assert!(validate_app_name("bad app").is_err());
        assert!(validate_app_name("semi;colon").is_err());
    }
}
