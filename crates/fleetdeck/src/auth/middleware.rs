//! Authentication middleware.
//!
//! The primary surface accepts either the static shared-secret credential
//! (HTTP Basic) or a valid signed bearer token, making the two schemes
//! interchangeable for endpoints the companion console UI reuses. A stricter
//! token-only middleware protects the console-specific surface. All auth
//! rejection happens before any orchestrator logic runs.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use thiserror::Error;

use super::config::AuthConfig;
use super::token::TokenService;

/// Cookie carrying the console token for browser clients.
pub const AUTH_COOKIE: &str = "fleetdeck_auth";

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No usable credential on the request.
    #[error("authentication required")]
    MissingCredentials,

    /// Credential presented but rejected.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Token presented but rejected (bad MAC, malformed, or expired).
    #[error("invalid or expired token")]
    InvalidToken,
}

#[derive(Debug, Serialize)]
struct AuthErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let code = match self {
            AuthError::MissingCredentials => "missing_credentials",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::InvalidToken => "invalid_token",
        };
        let body = Json(AuthErrorBody {
            error: self.to_string(),
            code,
        });
        (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                "Basic realm=\"Fleetdeck\"",
            )],
            body,
        )
            .into_response()
    }
}

/// Shared authentication state.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    tokens: TokenService,
}

impl AuthState {
    pub fn new(config: AuthConfig) -> Self {
        let tokens = TokenService::new(config.effective_token_secret());
        Self {
            config: Arc::new(config),
            tokens,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Whether any request credential satisfies the primary surface.
    fn primary_allows(&self, headers: &HeaderMap) -> bool {
        if !self.config.auth_enabled() {
            return true;
        }
        if let Some((user, pass)) = basic_credentials(headers) {
            if self.config.credentials_match(&user, &pass) {
                return true;
            }
        }
        self.request_token(headers)
            .map(|t| self.tokens.verify(&t))
            .unwrap_or(false)
    }

    /// Bearer header, X-Auth-Token header, or auth cookie, in that order.
    pub fn request_token(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(token) = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(bearer_token)
        {
            return Some(token.to_string());
        }
        if let Some(token) = headers.get("X-Auth-Token").and_then(|h| h.to_str().ok()) {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
        headers
            .get(header::COOKIE)
            .and_then(|h| h.to_str().ok())
            .and_then(|cookies| cookie_value(cookies, AUTH_COOKIE))
            .map(str::to_string)
    }
}

/// Extract a Bearer token from an Authorization header value.
fn bearer_token(header_value: &str) -> Option<&str> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?;
    if token.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(token)
}

/// Decode Basic credentials from an Authorization header.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())?;
    let encoded = header_value
        .split_once(' ')
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("basic"))
        .map(|(_, rest)| rest.trim())?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name).then(|| value.trim())
    })
}

/// Primary-surface middleware: shared secret or token.
pub async fn auth_required(
    State(auth): State<AuthState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    if auth.primary_allows(req.headers()) {
        Ok(next.run(req).await)
    } else {
        Err(AuthError::MissingCredentials)
    }
}

/// Console-surface middleware: signed token only.
pub async fn token_required(
    State(auth): State<AuthState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(token) = auth.request_token(req.headers()) else {
        return Err(AuthError::MissingCredentials);
    };
    if auth.tokens().verify(&token) {
        Ok(next.run(req).await)
    } else {
        Err(AuthError::InvalidToken)
    }
}
