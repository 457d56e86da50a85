//! Authentication configuration.

use serde::{Deserialize, Serialize};

/// Fallback signing secret used when none is configured. Fine for throwaway
/// single-host setups; anything reachable from a network should configure
/// `token_secret`.
const DEFAULT_TOKEN_SECRET: &str = "fleetdeck-secret";

/// Authentication configuration.
///
/// Two parallel schemes protect the API: a static shared-secret credential
/// (`admin_user`/`admin_pass`, presented as HTTP Basic) and signed bearer
/// tokens minted against `console_password` for the companion console UI.
/// When no admin credential is configured the API runs open, matching a
/// trusted-host deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared-secret username. Auth is enforced only when both user and
    /// pass are set.
    pub admin_user: Option<String>,

    /// Shared-secret password.
    pub admin_pass: Option<String>,

    /// HMAC signing secret for bearer tokens.
    pub token_secret: Option<String>,

    /// Password the console login endpoint checks before minting a token.
    /// Unset means console login is not configured (404 on login).
    pub console_password: Option<String>,

    /// Token lifetime in seconds.
    pub token_ttl_secs: u64,

    /// Allowed CORS origins. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_user: None,
            admin_pass: None,
            token_secret: None,
            console_password: None,
            token_ttl_secs: 24 * 3600,
            allowed_origins: Vec::new(),
        }
    }
}

impl AuthConfig {
    /// Whether the shared-secret scheme is enforced.
    pub fn auth_enabled(&self) -> bool {
        matches!((&self.admin_user, &self.admin_pass), (Some(u), Some(p)) if !u.is_empty() && !p.is_empty())
    }

    /// Effective token signing secret.
    pub fn effective_token_secret(&self) -> String {
        self.token_secret
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_SECRET.to_string())
    }

    /// Check the static shared-secret credential.
    pub fn credentials_match(&self, user: &str, pass: &str) -> bool {
        match (&self.admin_user, &self.admin_pass) {
            (Some(u), Some(p)) => u == user && p == pass,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_disabled_by_default() {
        let config = AuthConfig::default();
        assert!(!config.auth_enabled());
        assert!(!config.credentials_match("admin", "pass"));
    }

    #[test]
    fn test_auth_enabled_with_credentials() {
        let config = AuthConfig {
            admin_user: Some("admin".to_string()),
            admin_pass: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert!(config.auth_enabled());
        assert!(config.credentials_match("admin", "hunter2"));
        assert!(!config.credentials_match("admin", "wrong"));
        assert!(!config.credentials_match("other", "hunter2"));
    }

    #[test]
    fn test_empty_credentials_do_not_enable_auth() {
        let config = AuthConfig {
            admin_user: Some(String::new()),
            admin_pass: Some(String::new()),
            ..Default::default()
        };
        assert!(!config.auth_enabled());
    }

    #[test]
    fn test_effective_token_secret_fallback() {
        let config = AuthConfig::default();
        assert_eq!(config.effective_token_secret(), DEFAULT_TOKEN_SECRET);

        let configured = AuthConfig {
            token_secret: Some("explicit".to_string()),
            ..Default::default()
        };
        assert_eq!(configured.effective_token_secret(), "explicit");
    }
}
