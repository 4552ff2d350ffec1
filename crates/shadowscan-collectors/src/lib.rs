//! shadowscan-collectors: platform adapters for automation discovery.
//!
//! One module per SaaS platform family, each implementing the
//! `shadowscan_core::Collector` capability set. Adapters keep fetching thin
//! (authorized HTTP through the shared [`http`] layer) and do their real work
//! in pure parse/aggregate functions over platform JSON, which is where the
//! unit tests live.

pub mod http;

mod google;
mod microsoft;
mod slack;

pub use google::GoogleWorkspaceCollector;
pub use microsoft::Microsoft365Collector;
pub use slack::SlackCollector;

use shadowscan_core::{CollectorRegistry, HostRateLimiter};
use std::sync::Arc;

/// OAuth client settings for one platform app registration.
#[derive(Debug, Clone, Default)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Directory tenant for platforms that scope token endpoints by tenant.
    pub tenant_id: Option<String>,
}

impl OAuthClientConfig {
    /// Loads client settings from `{PREFIX}_CLIENT_ID` / `{PREFIX}_CLIENT_SECRET`
    /// / `{PREFIX}_TENANT_ID`. Missing vars yield empty fields; adapters then
    /// fail refresh with an auth error rather than at startup.
    pub fn from_env(prefix: &str) -> Self {
        let var = |suffix: &str| {
            std::env::var(format!("{prefix}_{suffix}"))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            client_id: var("CLIENT_ID").unwrap_or_default(),
            client_secret: var("CLIENT_SECRET").unwrap_or_default(),
            tenant_id: var("TENANT_ID"),
        }
    }
}

/// Builds a registry with every built-in adapter, sharing one per-host rate
/// limiter across platforms.
pub fn default_registry(
    per_host_rps: f64,
    slack: OAuthClientConfig,
    google: OAuthClientConfig,
    microsoft: OAuthClientConfig,
) -> CollectorRegistry {
    let rate_limiter = Arc::new(HostRateLimiter::new(per_host_rps));
    let mut registry = CollectorRegistry::new();
    registry.register(Arc::new(SlackCollector::new(
        Arc::clone(&rate_limiter),
        slack.client_id,
        slack.client_secret,
    )));
    registry.register(Arc::new(GoogleWorkspaceCollector::new(
        Arc::clone(&rate_limiter),
        google.client_id,
        google.client_secret,
    )));
    registry.register(Arc::new(Microsoft365Collector::new(
        rate_limiter,
        microsoft.client_id,
        microsoft.client_secret,
        microsoft.tenant_id.unwrap_or_else(|| "common".to_string()),
    )));
    registry
}
