//! API integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{harness, harness_with_auth};

use fleetdeck::auth::AuthConfig;
use fleetdeck::flags::FlagKind;
use fleetdeck::topology::TopologyMode;

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::GET)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn secured_auth() -> AuthConfig {
    AuthConfig {
        admin_user: Some("admin".to_string()),
        admin_pass: Some("hunter2".to_string()),
        console_password: Some("console-pw".to_string()),
        ..Default::default()
    }
}

/// Health endpoint works without authentication.
#[tokio::test]
async fn test_health_endpoint() {
    let h = harness();
    let response = h.app.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Protected endpoints require credentials once auth is configured.
#[tokio::test]
async fn test_instances_requires_auth() {
    let h = harness_with_auth(secured_auth());
    let response = h.app.oneshot(get("/api/instances")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Basic credentials and a minted bearer token are interchangeable.
#[tokio::test]
async fn test_basic_and_token_auth() {
    let h = harness_with_auth(secured_auth());

    let basic = STANDARD.encode("admin:hunter2");
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/instances")
                .method(Method::GET)
                .header(header::AUTHORIZATION, format!("Basic {}", basic))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (token, _) = h
        .state
        .auth
        .tokens()
        .issue(std::time::Duration::from_secs(60));
    let response = h
        .app
        .oneshot(
            Request::builder()
                .uri("/api/instances")
                .method(Method::GET)
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// Console login mints a token and sets the auth cookie.
#[tokio::test]
async fn test_login_flow() {
    let h = harness_with_auth(secured_auth());

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/api/auth/login",
            json!({"password": "console-pw"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(cookie.contains("fleetdeck_auth="));

    let json = body_json(response).await;
    assert_eq!(json["ok"], true);
    let token = json["token"].as_str().unwrap().to_string();
    assert!(h.state.auth.tokens().verify(&token));

    // wrong password
    let response = h
        .app
        .clone()
        .oneshot(post_json("/api/auth/login", json!({"password": "nope"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Login reports not-configured when no console password is set.
#[tokio::test]
async fn test_login_not_configured() {
    let h = harness();
    let response = h
        .app
        .oneshot(post_json("/api/auth/login", json!({"password": "x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Listing parses manager output, rebuilds direct-mode URLs from the
/// caller's host, and overlays transient flags.
#[tokio::test]
async fn test_list_instances_with_flag_overlay() {
    let h = harness();
    *h.manager.list_output.lock().unwrap() =
        "- alpha -> Up 2 hours -> http://172.17.0.2:3000/\n- beta -> Exited (0) ->\n".to_string();
    h.engine
        .published
        .lock()
        .unwrap()
        .insert("fleetdeck_alpha".to_string(), 20005);
    h.state.flags.set("beta", FlagKind::Rebuilding, true);

    let response = h
        .app
        .oneshot(
            Request::builder()
                .uri("/api/instances")
                .method(Method::GET)
                .header(header::HOST, "fleet.example.com:8250")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let instances = json["instances"].as_array().unwrap();
    assert_eq!(instances.len(), 2);

    // direct mode: URL rebuilt from caller host + published port
    assert_eq!(instances[0]["name"], "alpha");
    assert_eq!(instances[0]["url"], "http://fleet.example.com:20005/");
    assert_eq!(instances[0]["port"], 20005);

    // rebuilding flag outranks the engine-reported status
    assert_eq!(instances[1]["name"], "beta");
    assert_eq!(instances[1]["status"], "Rebuilding...");
}

/// Degraded path: manager list empty, instances enumerated from disk, and
/// missing engine data reported as "(unknown)".
#[tokio::test]
async fn test_list_fallback_reports_unknown() {
    let h = harness();
    h.seed_instance("gamma");

    let response = h.app.oneshot(get("/api/instances")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let instances = json["instances"].as_array().unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0]["name"], "gamma");
    assert_eq!(instances[0]["status"], "(unknown)");
}

/// Create validates names and refuses duplicates before touching the manager.
#[tokio::test]
async fn test_create_instance() {
    let h = harness();

    let response = h
        .app
        .clone()
        .oneshot(post_json("/api/instances", json!({"name": "bad name!"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = h
        .app
        .clone()
        .oneshot(post_json("/api/instances", json!({"name": "delta"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let calls = h.manager.calls.lock().unwrap().clone();
    assert!(calls.contains(&vec!["create".to_string(), "delta".to_string()]));
    assert!(calls.contains(&vec!["start".to_string(), "delta".to_string()]));

    // an existing instance directory is a conflict
    h.seed_instance("epsilon");
    let response = h
        .app
        .oneshot(post_json("/api/instances", json!({"name": "epsilon"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

/// Safe-start rejects an already-running instance.
#[tokio::test]
async fn test_start_rejects_running_instance() {
    let h = harness();
    h.engine
        .statuses
        .lock()
        .unwrap()
        .insert("fleetdeck_alpha".to_string(), "Up 5 minutes".to_string());

    let response = h
        .app
        .oneshot(post_json("/api/instances/alpha/start", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(h.manager.calls.lock().unwrap().is_empty());
}

/// Enabling single-port mode on an occupied port is a conflict and leaves
/// the persisted topology mode unchanged.
#[tokio::test]
async fn test_enable_single_port_conflict() {
    let h = harness();
    let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let response = h
        .app
        .oneshot(post_json(
            "/api/topology/single-port/enable",
            json!({"port": port}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    assert_eq!(h.state.topology.mode().await, TopologyMode::Direct);
    // nothing was dispatched against the engine
    assert!(h.engine.ran.lock().unwrap().is_empty());
    assert!(h.engine.removed.lock().unwrap().is_empty());
}

/// A free port is accepted and the transition is dispatched.
#[tokio::test]
async fn test_enable_single_port_dispatches() {
    let h = harness();
    let response = h
        .app
        .oneshot(post_json(
            "/api/topology/single-port/enable",
            json!({"port": 0}),
        ))
        .await
        .unwrap();
    // port 0 binds anywhere; the call itself succeeds immediately
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["ok"], true);
}

/// Topology info reflects the persisted direct-mode defaults.
#[tokio::test]
async fn test_topology_info_defaults() {
    let h = harness();
    let response = h
        .app
        .oneshot(
            Request::builder()
                .uri("/api/topology")
                .method(Method::GET)
                .header(header::HOST, "10.0.0.5")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["merged"], false);
    assert_eq!(json["mode"], "direct");
    assert_eq!(json["basePath"], "/desk");
    assert_eq!(json["ip"], "10.0.0.5");
}

/// Report-only check performs no container removal on an unreachable
/// instance.
#[tokio::test]
async fn test_check_no_fix_is_read_only() {
    let h = harness();
    h.seed_instance("alpha");

    let response = h
        .app
        .oneshot(post_json("/api/instances/alpha/check?nofix=1", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["ok"], false);
    assert_eq!(json["output"], "no-fix mode");
    assert!(h.engine.removed.lock().unwrap().is_empty());
    // manager never asked to recreate either
    let calls = h.manager.calls.lock().unwrap();
    assert!(!calls.iter().any(|c| c.first().map(String::as_str) == Some("start")));
}

/// Reset runs delete/create/start in the background.
#[tokio::test]
async fn test_reset_instance_background() {
    let h = harness();
    let response = h
        .app
        .oneshot(post_json("/api/instances/alpha/reset", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["started"], true);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let calls = h.manager.calls.lock().unwrap().clone();
    assert!(calls.contains(&vec!["delete".to_string(), "alpha".to_string()]));
    assert!(calls.contains(&vec!["create".to_string(), "alpha".to_string()]));
    assert!(calls.contains(&vec!["start".to_string(), "alpha".to_string()]));
}

/// Bulk rebuild sets the rebuilding flag and clears it when the manager
/// call finishes.
#[tokio::test]
async fn test_rebuild_sets_and_clears_flags() {
    let h = harness();
    let response = h
        .app
        .oneshot(post_json(
            "/api/instances/rebuild",
            json!({"names": ["alpha", "beta"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // mock manager completes instantly; flags must already be cleared
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!h.state.flags.has_fresh("alpha", FlagKind::Rebuilding));
    assert!(!h.state.flags.has_fresh("beta", FlagKind::Rebuilding));

    let calls = h.manager.calls.lock().unwrap().clone();
    assert!(calls.contains(&vec![
        "rebuild".to_string(),
        "alpha".to_string(),
        "beta".to_string()
    ]));
}

/// Recreate relays the manager outcome synchronously.
#[tokio::test]
async fn test_recreate_relays_manager_output() {
    let h = harness();
    let response = h
        .app
        .clone()
        .oneshot(post_json("/api/instances/recreate", json!({"names": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = h
        .app
        .oneshot(post_json(
            "/api/instances/recreate",
            json!({"names": ["alpha"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["ok"], true);
}

/// Console-surface endpoints take tokens only, not the shared secret.
#[tokio::test]
async fn test_console_surface_is_token_only() {
    let h = harness_with_auth(secured_auth());

    let basic = STANDARD.encode("admin:hunter2");
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/instances/stats")
                .method(Method::GET)
                .header(header::AUTHORIZATION, format!("Basic {}", basic))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (token, _) = h
        .state
        .auth
        .tokens()
        .issue(std::time::Duration::from_secs(60));
    let response = h
        .app
        .oneshot(
            Request::builder()
                .uri("/api/instances/stats")
                .method(Method::GET)
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["vms"]["alpha"]["container_name"], "fleetdeck_alpha");
}

/// URL resolution follows the persisted topology mode: path-prefixed in
/// single-port mode, back to a direct host:port form after disabling.
#[tokio::test]
async fn test_resolve_url_follows_mode_transitions() {
    let h = harness();
    h.engine
        .published
        .lock()
        .unwrap()
        .insert("fleetdeck_alpha".to_string(), 20010);

    // default: direct mode
    let url = h.state.topology.resolve_url("alpha", "myhost").await;
    assert_eq!(url.as_deref(), Some("http://myhost:20010/"));

    // flip the persisted state to single-port and reload explicitly
    fleetdeck::topology::write_env_kv(
        &h.state.config.env_file(),
        [
            ("NO_EDGE".to_string(), "0".to_string()),
            ("HTTP_PORT".to_string(), "20002".to_string()),
        ],
    )
    .unwrap();
    h.state.topology.store().reload().await;
    assert_eq!(h.state.topology.mode().await, TopologyMode::SinglePort(20002));

    let url = h.state.topology.resolve_url("alpha", "myhost").await;
    assert_eq!(url.as_deref(), Some("http://myhost:20002/desk/alpha/"));

    // back to direct: every instance resolves to host:port, not a path
    fleetdeck::topology::write_env_kv(
        &h.state.config.env_file(),
        [("NO_EDGE".to_string(), "1".to_string())],
    )
    .unwrap();
    h.state.topology.store().reload().await;

    let url = h.state.topology.resolve_url("alpha", "myhost").await.unwrap();
    assert_eq!(url, "http://myhost:20010/");
    assert!(!url.contains("/desk/"));
}

/// A custom domain substitutes the authority in merged-mode URLs.
#[tokio::test]
async fn test_resolve_url_uses_custom_domain() {
    let h = harness();
    fleetdeck::topology::write_env_kv(
        &h.state.config.env_file(),
        [
            ("NO_EDGE".to_string(), "0".to_string()),
            ("FLEETDECK_DOMAIN".to_string(), "fleet.example.com".to_string()),
        ],
    )
    .unwrap();
    h.state.topology.store().reload().await;

    let url = h.state.topology.resolve_url("alpha", "ignored-host").await;
    assert_eq!(
        url.as_deref(),
        Some("http://fleet.example.com/desk/alpha/")
    );
}

/// Guard endpoints report unavailable when no guard is wired in.
#[tokio::test]
async fn test_guard_unconfigured() {
    let h = harness();
    let response = h.app.oneshot(get("/api/guard/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
