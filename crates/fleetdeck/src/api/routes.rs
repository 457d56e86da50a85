//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::auth::{auth_required, token_required};

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let auth_state = state.auth.clone();

    // Public routes (no authentication)
    let public_routes = Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/auth/login", post(handlers::login))
        .route("/api/auth/status", get(handlers::auth_status))
        .with_state(state.clone());

    // Primary surface: shared-secret credential or signed token.
    let protected_routes = Router::new()
        // Instance listing and lifecycle
        .route("/api/instances", get(handlers::list_instances))
        .route("/api/instances", post(handlers::create_instance))
        .route("/api/instances/{name}/start", post(handlers::start_instance))
        .route("/api/instances/{name}/stop", post(handlers::stop_instance))
        .route(
            "/api/instances/{name}/restart",
            post(handlers::restart_instance),
        )
        .route(
            "/api/instances/{name}/delete",
            post(handlers::delete_instance),
        )
        .route("/api/instances/{name}/reset", post(handlers::reset_instance))
        .route(
            "/api/instances/{name}/update",
            post(handlers::update_instance),
        )
        .route("/api/instances/{name}/clean", post(handlers::clean_instance))
        .route("/api/instances/{name}/check", post(handlers::check_instance))
        .route(
            "/api/instances/{name}/status",
            get(handlers::instance_status),
        )
        // App passthrough
        .route(
            "/api/instances/{name}/apps/{app}/install",
            post(handlers::app_install),
        )
        .route(
            "/api/instances/{name}/apps/{app}/status",
            get(handlers::app_status),
        )
        .route(
            "/api/instances/{name}/apps/{app}/uninstall",
            post(handlers::app_uninstall),
        )
        .route(
            "/api/instances/{name}/apps/{app}/reinstall",
            post(handlers::app_reinstall),
        )
        // Bulk operations
        .route(
            "/api/instances/recreate",
            post(handlers::recreate_instances),
        )
        .route("/api/instances/rebuild", post(handlers::rebuild_instances))
        .route(
            "/api/instances/update-and-rebuild",
            post(handlers::update_and_rebuild),
        )
        .route(
            "/api/instances/reset-all",
            post(handlers::reset_all_instances),
        )
        .route(
            "/api/instances/delete-all",
            post(handlers::delete_all_instances),
        )
        // Topology
        .route("/api/topology", get(handlers::topology_info))
        .route(
            "/api/topology/single-port/enable",
            post(handlers::enable_single_port),
        )
        .route(
            "/api/topology/single-port/disable",
            post(handlers::disable_single_port),
        )
        .route("/api/topology/domain", post(handlers::set_domain))
        // Maintenance and resource guard
        .route("/api/maintenance/prune", post(handlers::prune_engine))
        .route("/api/guard/status", get(handlers::guard_status))
        .route("/api/guard/config", post(handlers::guard_set))
        .route("/api/guard/run-once", post(handlers::guard_run_once))
        .route("/api/guard/logs", get(handlers::guard_logs))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            auth_state.clone(),
            auth_required,
        ));

    // Console surface: signed token only. The companion console reuses these
    // without knowing the shared secret.
    let console_routes = Router::new()
        .route("/api/instances/{name}/logs", get(handlers::instance_logs))
        .route("/api/instances/{name}/exec", post(handlers::exec_instance))
        .route("/api/instances/stats", get(handlers::instance_stats))
        .with_state(state)
        .layer(middleware::from_fn_with_state(auth_state, token_required));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(console_routes)
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer from the configured origins. No configured origins
/// means same-origin only.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::COOKIE,
    ];

    let origins: Vec<HeaderValue> = state
        .auth
        .config()
        .allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")))
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    }
}
