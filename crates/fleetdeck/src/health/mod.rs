//! Instance reachability checks and bounded auto-remediation.
//!
//! A check resolves the instance's topology-aware URL, issues a HEAD probe,
//! and classifies 2xx–3xx as healthy. An unhealthy instance is remediated by
//! force-removing its container and asking the instance manager to recreate
//! it, then re-probing on a fixed budget. Callers that only want a diagnosis
//! pass `no_fix`, which guarantees no state is mutated.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::engine::EngineApi;
use crate::instance_container_name;
use crate::manager::{ManagerApi, run_logged};
use crate::topology::TopologyController;

/// HEAD probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(8);
/// Re-probe attempts after a remediation.
const RETRY_ATTEMPTS: u32 = 8;
/// Delay between re-probe attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Outcome of a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub code: u16,
    pub url: String,
    pub fixed: bool,
}

/// Probes instances and remediates the unreachable ones.
pub struct HealthRemediator {
    topology: Arc<TopologyController>,
    engine: Arc<dyn EngineApi>,
    manager: Arc<dyn ManagerApi>,
    client: reqwest::Client,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl HealthRemediator {
    pub fn new(
        topology: Arc<TopologyController>,
        engine: Arc<dyn EngineApi>,
        manager: Arc<dyn ManagerApi>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            // 3xx counts as healthy; don't chase the redirect.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            topology,
            engine,
            manager,
            client,
            retry_attempts: RETRY_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Shrink the retry budget/delay; tests use this to keep the loop fast.
    #[cfg(test)]
    pub(crate) fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    /// Check one instance. With `no_fix`, report-only: no container is
    /// removed and no recreation is requested regardless of the outcome.
    pub async fn check(&self, name: &str, host: &str, no_fix: bool) -> HealthReport {
        let mut url = self
            .topology
            .resolve_url(name, host)
            .await
            .unwrap_or_default();
        let mut code = self.probe(&url).await;
        if is_healthy(code) {
            return HealthReport {
                ok: true,
                code,
                url,
                fixed: false,
            };
        }
        if no_fix {
            return HealthReport {
                ok: false,
                code,
                url,
                fixed: false,
            };
        }

        // Remediate: force-recreate and re-probe on a fixed budget.
        info!("instance '{}' unhealthy (code {}); recreating", name, code);
        let cname = instance_container_name(name);
        if let Err(err) = self.engine.remove(&cname, true).await {
            warn!("removing {} failed: {}", cname, err);
        }
        run_logged(self.manager.as_ref(), &["start", name]).await;

        let mut fixed = false;
        for _ in 0..self.retry_attempts {
            tokio::time::sleep(self.retry_delay).await;
            url = self
                .topology
                .resolve_url(name, host)
                .await
                .unwrap_or_default();
            code = self.probe(&url).await;
            if is_healthy(code) {
                fixed = true;
                break;
            }
        }
        HealthReport {
            ok: is_healthy(code),
            code,
            url,
            fixed,
        }
    }

    /// HEAD probe; 0 for network failure or an unprobeable URL. A trailing
    /// slash is enforced to satisfy path-prefix routers.
    async fn probe(&self, url: &str) -> u16 {
        if url.is_empty() {
            return 0;
        }
        let url = if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{}/", url)
        };
        match self.client.head(&url).send().await {
            Ok(resp) => resp.status().as_u16(),
            Err(_) => 0,
        }
    }
}

fn is_healthy(code: u16) -> bool {
    (200..400).contains(&code)
}
