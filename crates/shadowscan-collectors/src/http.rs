//! Shared HTTP plumbing for platform adapters.
//!
//! Thin wrapper over reqwest that owns the three things every adapter needs:
//! bearer-token headers, per-host rate limiting, and the mapping from HTTP
//! status codes into the collector error taxonomy. Platform-specific error
//! bodies (e.g. Slack's `ok: false` envelope) are mapped by the adapters
//! themselves — only they know their platform's codes.

use shadowscan_core::{CollectorError, HostRateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Rate-limit fallback when the platform sends no Retry-After header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
/// Per-request timeout; sub-method deadlines bound the whole method.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct PlatformHttp {
    client: reqwest::Client,
    rate_limiter: Arc<HostRateLimiter>,
}

impl PlatformHttp {
    pub fn new(rate_limiter: Arc<HostRateLimiter>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            rate_limiter,
        }
    }

    /// Authorized GET returning the parsed JSON body. Waits for a rate-limit
    /// slot for the target host, honors cancellation mid-flight, and maps
    /// non-success statuses into the taxonomy (`permission_scope` names the
    /// scope this endpoint needs, for 403 mapping).
    pub async fn get_json(
        &self,
        url: &str,
        bearer: &str,
        permission_scope: &str,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, CollectorError> {
        self.rate_limiter.acquire(host_of(url)).await;

        let request = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {bearer}"));
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CollectorError::Transient("request cancelled".to_string()));
            }
            sent = request.send() => sent.map_err(|e| {
                CollectorError::Transient(format!("request to {} failed: {e}", host_of(url)))
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            return Err(map_status(status, retry_after, permission_scope));
        }
        response
            .json()
            .await
            .map_err(|e| CollectorError::Transient(format!("invalid JSON from platform: {e}")))
    }

    /// Form-encoded POST for OAuth token endpoints. No rate limiting: token
    /// endpoints sit on separate auth hosts with their own budgets.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<serde_json::Value, CollectorError> {
        let response = self.client.post(url).form(form).send().await.map_err(|e| {
            CollectorError::Transient(format!("token request to {} failed: {e}", host_of(url)))
        })?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            return Err(match status.as_u16() {
                400 | 401 => CollectorError::Auth(format!("token endpoint rejected request ({status})")),
                _ => map_status(status, retry_after, ""),
            });
        }
        response
            .json()
            .await
            .map_err(|e| CollectorError::Transient(format!("invalid JSON from token endpoint: {e}")))
    }
}

/// Host component of a URL, for rate-limit bucketing.
pub fn host_of(url: &str) -> &str {
    let after_scheme = url.split("://").nth(1).unwrap_or(url);
    after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(after_scheme)
}

fn parse_retry_after(response: &reqwest::Response) -> Duration {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Status-code half of the taxonomy mapping, shared by every adapter.
pub fn map_status(
    status: reqwest::StatusCode,
    retry_after: Duration,
    permission_scope: &str,
) -> CollectorError {
    match status.as_u16() {
        401 => CollectorError::Auth(format!("platform rejected credentials ({status})")),
        403 => CollectorError::Permission {
            scope: permission_scope.to_string(),
        },
        429 => CollectorError::RateLimited { retry_after },
        s if s >= 500 => CollectorError::Transient(format!("platform error {status}")),
        _ => CollectorError::Fatal(format!("unexpected platform response {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://slack.com/api/users.list"), "slack.com");
        assert_eq!(
            host_of("https://admin.googleapis.com/admin/directory/v1?x=1"),
            "admin.googleapis.com"
        );
        assert_eq!(host_of("graph.microsoft.com/v1.0"), "graph.microsoft.com");
    }

    #[test]
    fn status_mapping_follows_taxonomy() {
        let d = Duration::from_secs(3);
        assert!(matches!(
            map_status(reqwest::StatusCode::UNAUTHORIZED, d, "s"),
            CollectorError::Auth(_)
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::FORBIDDEN, d, "admin.scope"),
            CollectorError::Permission { scope } if scope == "admin.scope"
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::TOO_MANY_REQUESTS, d, "s"),
            CollectorError::RateLimited { retry_after } if retry_after == d
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::BAD_GATEWAY, d, "s"),
            CollectorError::Transient(_)
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::NOT_FOUND, d, "s"),
            CollectorError::Fatal(_)
        ));
    }
}
