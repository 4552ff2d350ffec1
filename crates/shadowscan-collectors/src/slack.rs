//! Slack adapter (`chat` platform).
//!
//! Discovery methods:
//! - `bot_listing` — workspace members flagged as bots (`users.list`).
//! - `audit_log_oauth_authorize` — third-party app installs from the team
//!   integration log, with scopes unioned across install events for the same
//!   app.
//! - `webhook_listing` — incoming-webhook rows from the same log.
//!
//! Slack wraps most failures in a 200 response with `ok: false`; the error
//! string is mapped into the collector taxonomy here, at the adapter
//! boundary.

use crate::http::{host_of, PlatformHttp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shadowscan_core::{
    with_retry, AutomationType, CollectContext, Collector, CollectorError, HostRateLimiter,
    OwnerInfo, PlatformConnection, PlatformType, RawCandidate, RefreshedToken, SourceMethod,
    TokenRefresher,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

const DEFAULT_BASE_URL: &str = "https://slack.com/api";
const PAGE_LIMIT: usize = 200;

pub struct SlackCollector {
    http: PlatformHttp,
    base_url: String,
    client_id: String,
    client_secret: String,
}

impl SlackCollector {
    pub fn new(rate_limiter: Arc<HostRateLimiter>, client_id: String, client_secret: String) -> Self {
        Self {
            http: PlatformHttp::new(rate_limiter),
            base_url: DEFAULT_BASE_URL.to_string(),
            client_id,
            client_secret,
        }
    }

    /// Point the adapter at a different API root (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch(
        &self,
        ctx: &CollectContext,
        endpoint: &str,
        scope: &str,
    ) -> Result<Value, CollectorError> {
        let url = format!("{}/{endpoint}?limit={PAGE_LIMIT}", self.base_url);
        let body = with_retry(endpoint, &ctx.cancel, || {
            self.http
                .get_json(&url, &ctx.credential.secret, scope, &ctx.cancel)
        })
        .await?;
        check_envelope(&body, scope)?;
        Ok(body)
    }
}

/// Maps Slack's `ok: false` error strings into the taxonomy.
fn check_envelope(body: &Value, scope: &str) -> Result<(), CollectorError> {
    if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(());
    }
    let code = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    Err(match code {
        "invalid_auth" | "token_revoked" | "token_expired" | "account_inactive"
        | "not_authed" => CollectorError::Auth(format!("slack: {code}")),
        "missing_scope" | "access_denied" | "not_allowed_token_type" => {
            CollectorError::Permission {
                scope: scope.to_string(),
            }
        }
        "ratelimited" | "rate_limited" => CollectorError::RateLimited {
            retry_after: std::time::Duration::from_secs(1),
        },
        "internal_error" | "service_unavailable" => {
            CollectorError::Transient(format!("slack: {code}"))
        }
        other => CollectorError::Fatal(format!("slack: {other}")),
    })
}

fn epoch_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    let secs = match value.get(key) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    }?;
    DateTime::from_timestamp(secs, 0)
}

/// Bot members from a `users.list` payload. Deleted members are skipped.
pub fn parse_bot_members(body: &Value) -> Vec<RawCandidate> {
    let mut out = Vec::new();
    let Some(members) = body.get("members").and_then(Value::as_array) else {
        return out;
    };
    for member in members {
        let is_bot = member.get("is_bot").and_then(Value::as_bool).unwrap_or(false);
        let deleted = member.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        if !is_bot || deleted {
            continue;
        }
        let Some(id) = member.get("id").and_then(Value::as_str) else {
            continue;
        };
        let name = member
            .get("profile")
            .and_then(|p| p.get("real_name"))
            .and_then(Value::as_str)
            .or_else(|| member.get("name").and_then(Value::as_str))
            .unwrap_or(id);
        out.push(RawCandidate {
            external_id: id.to_string(),
            name: name.to_string(),
            type_hint: AutomationType::Bot,
            source_method: SourceMethod::BotListing,
            trigger_hint: None,
            actions: vec!["post_messages".to_string()],
            scopes: Default::default(),
            owner_info: OwnerInfo::default(),
            modified_at: epoch_field(member, "updated"),
            platform_metadata: serde_json::json!({
                "team_id": member.get("team_id").and_then(Value::as_str),
                "app_user": true,
            }),
            raw_evidence: format!("slack bot user {name} ({id})"),
        });
    }
    out
}

/// Third-party app installs from a `team.integrationLogs` payload. Multiple
/// install events for one app collapse into a single candidate whose scopes
/// are the union of every event's scopes.
pub fn parse_integration_logs(body: &Value) -> Vec<RawCandidate> {
    let mut by_app: BTreeMap<String, RawCandidate> = BTreeMap::new();
    let Some(logs) = body.get("logs").and_then(Value::as_array) else {
        return Vec::new();
    };
    for log in logs {
        let service_type = log.get("service_type").and_then(Value::as_str).unwrap_or("");
        if service_type.eq_ignore_ascii_case("Incoming Webhook") {
            continue; // surfaced by webhook_listing instead
        }
        let Some(app_id) = log
            .get("app_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            continue;
        };
        let name = log
            .get("app_type")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(app_id);
        let scopes: Vec<String> = log
            .get("scope")
            .and_then(Value::as_str)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let event_date = epoch_field(log, "date");
        let user_id = log.get("user_id").and_then(Value::as_str);
        let user_name = log.get("user_name").and_then(Value::as_str);

        let entry = by_app.entry(app_id.to_string()).or_insert_with(|| RawCandidate {
            external_id: app_id.to_string(),
            name: name.to_string(),
            type_hint: AutomationType::Integration,
            source_method: SourceMethod::AuditLogOauthAuthorize,
            trigger_hint: None,
            actions: Vec::new(),
            scopes: Default::default(),
            owner_info: OwnerInfo {
                user_id: user_id.map(str::to_string),
                email: None,
                display_name: user_name.map(str::to_string),
                project_id: None,
            },
            modified_at: None,
            platform_metadata: serde_json::json!({ "service_type": service_type }),
            raw_evidence: format!("slack app {name} ({app_id})"),
        });
        entry.scopes.extend(scopes);
        if entry.modified_at.map(|m| Some(m) < event_date).unwrap_or(true) {
            entry.modified_at = event_date;
        }
    }
    by_app.into_values().collect()
}

/// Incoming-webhook rows from a `team.integrationLogs` payload.
pub fn parse_webhooks(body: &Value) -> Vec<RawCandidate> {
    let mut by_id: BTreeMap<String, RawCandidate> = BTreeMap::new();
    let Some(logs) = body.get("logs").and_then(Value::as_array) else {
        return Vec::new();
    };
    for log in logs {
        let service_type = log.get("service_type").and_then(Value::as_str).unwrap_or("");
        if !service_type.eq_ignore_ascii_case("Incoming Webhook") {
            continue;
        }
        let Some(service_id) = log
            .get("service_id")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
        else {
            continue;
        };
        let channel = log.get("channel").and_then(Value::as_str).unwrap_or("");
        let user_name = log.get("user_name").and_then(Value::as_str);
        by_id
            .entry(service_id.clone())
            .or_insert_with(|| RawCandidate {
                external_id: format!("webhook-{service_id}"),
                name: format!("Incoming webhook {channel}"),
                type_hint: AutomationType::Webhook,
                source_method: SourceMethod::WebhookListing,
                trigger_hint: Some("http_post".to_string()),
                actions: vec![format!("post_to:{channel}")],
                scopes: Default::default(),
                owner_info: OwnerInfo {
                    user_id: log.get("user_id").and_then(Value::as_str).map(str::to_string),
                    email: None,
                    display_name: user_name.map(str::to_string),
                    project_id: None,
                },
                modified_at: epoch_field(log, "date"),
                platform_metadata: serde_json::json!({ "channel": channel }),
                raw_evidence: format!("slack incoming webhook to {channel}"),
            });
    }
    by_id.into_values().collect()
}

async fn emit_all(
    tx: &mpsc::Sender<RawCandidate>,
    mut candidates: Vec<RawCandidate>,
) -> Result<(), CollectorError> {
    RawCandidate::sort_for_emit(&mut candidates);
    for candidate in candidates {
        if tx.send(candidate).await.is_err() {
            // Receiver gone: session is shutting down.
            return Ok(());
        }
    }
    Ok(())
}

#[async_trait]
impl TokenRefresher for SlackCollector {
    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken, CollectorError> {
        let url = format!("{}/oauth.v2.access", self.base_url);
        let body = self
            .http
            .post_form(
                &url,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", &self.client_id),
                    ("client_secret", &self.client_secret),
                ],
            )
            .await?;
        check_envelope(&body, "")?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| CollectorError::Auth("slack: refresh returned no access_token".into()))?
            .to_string();
        let expires_at = body
            .get("expires_in")
            .and_then(Value::as_i64)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        Ok(RefreshedToken {
            access_token,
            refresh_token: body
                .get("refresh_token")
                .and_then(Value::as_str)
                .map(str::to_string),
            expires_at,
        })
    }
}

#[async_trait]
impl Collector for SlackCollector {
    fn platform_type(&self) -> PlatformType {
        PlatformType::Chat
    }

    fn sub_methods(&self, _connection: &PlatformConnection) -> Vec<SourceMethod> {
        vec![
            SourceMethod::BotListing,
            SourceMethod::AuditLogOauthAuthorize,
            SourceMethod::WebhookListing,
        ]
    }

    async fn collect(
        &self,
        ctx: &CollectContext,
        method: SourceMethod,
        tx: mpsc::Sender<RawCandidate>,
    ) -> Result<(), CollectorError> {
        let candidates = match method {
            SourceMethod::BotListing => {
                let body = self.fetch(ctx, "users.list", "users:read").await?;
                parse_bot_members(&body)
            }
            SourceMethod::AuditLogOauthAuthorize => {
                let body = self.fetch(ctx, "team.integrationLogs", "admin").await?;
                parse_integration_logs(&body)
            }
            SourceMethod::WebhookListing => {
                let body = self.fetch(ctx, "team.integrationLogs", "admin").await?;
                parse_webhooks(&body)
            }
            other => {
                return Err(CollectorError::Fatal(format!(
                    "slack adapter does not implement {}",
                    other.as_str()
                )))
            }
        };
        tracing::debug!(
            target: "shadowscan::collector::slack",
            method = method.as_str(),
            host = host_of(&self.base_url),
            count = candidates.len(),
            "sub-method produced candidates"
        );
        emit_all(&tx, candidates).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_members_filtered_from_users_list() {
        let body = serde_json::json!({
            "ok": true,
            "members": [
                { "id": "U001", "name": "alice", "is_bot": false },
                {
                    "id": "B042", "name": "deploybot", "is_bot": true,
                    "updated": 1700000000,
                    "profile": { "real_name": "Deploy Bot" },
                    "team_id": "T1"
                },
                { "id": "B043", "name": "oldbot", "is_bot": true, "deleted": true }
            ]
        });
        let bots = parse_bot_members(&body);
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0].external_id, "B042");
        assert_eq!(bots[0].name, "Deploy Bot");
        assert_eq!(bots[0].type_hint, AutomationType::Bot);
        assert!(bots[0].modified_at.is_some());
    }

    #[test]
    fn integration_log_scopes_are_unioned_per_app() {
        let body = serde_json::json!({
            "ok": true,
            "logs": [
                {
                    "app_id": "A777", "app_type": "Acme Sync", "service_type": "app",
                    "scope": "channels:read,chat:write", "date": "1700000100",
                    "user_id": "U1", "user_name": "alice", "change_type": "added"
                },
                {
                    "app_id": "A777", "app_type": "Acme Sync", "service_type": "app",
                    "scope": "files:read, chat:write", "date": "1700000200",
                    "user_id": "U2", "user_name": "bob", "change_type": "expanded"
                },
                {
                    "app_id": "A888", "app_type": "Other App", "service_type": "app",
                    "scope": "commands", "date": "1700000050",
                    "user_id": "U1", "user_name": "alice", "change_type": "added"
                }
            ]
        });
        let apps = parse_integration_logs(&body);
        assert_eq!(apps.len(), 2);
        let acme = apps.iter().find(|c| c.external_id == "A777").unwrap();
        let scopes: Vec<&str> = acme.scopes.iter().map(String::as_str).collect();
        assert_eq!(scopes, vec!["channels:read", "chat:write", "files:read"]);
        // Latest install event drives the modification time.
        assert_eq!(
            acme.modified_at,
            DateTime::from_timestamp(1700000200, 0)
        );
    }

    #[test]
    fn webhooks_come_from_webhook_rows_only() {
        let body = serde_json::json!({
            "ok": true,
            "logs": [
                {
                    "app_id": "A777", "app_type": "Acme Sync", "service_type": "app",
                    "scope": "chat:write", "date": "1700000100"
                },
                {
                    "service_id": "12345", "service_type": "Incoming Webhook",
                    "channel": "#alerts", "date": "1700000300",
                    "user_id": "U9", "user_name": "carol"
                }
            ]
        });
        let hooks = parse_webhooks(&body);
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].external_id, "webhook-12345");
        assert_eq!(hooks[0].type_hint, AutomationType::Webhook);
        assert_eq!(hooks[0].owner_info.display_name.as_deref(), Some("carol"));
        // And the integration parser skipped the webhook row.
        let apps = parse_integration_logs(&body);
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].external_id, "A777");
    }

    #[test]
    fn envelope_errors_map_to_taxonomy() {
        let auth = serde_json::json!({ "ok": false, "error": "invalid_auth" });
        assert!(matches!(
            check_envelope(&auth, "users:read"),
            Err(CollectorError::Auth(_))
        ));
        let scope = serde_json::json!({ "ok": false, "error": "missing_scope" });
        assert!(matches!(
            check_envelope(&scope, "admin"),
            Err(CollectorError::Permission { scope }) if scope == "admin"
        ));
        let limited = serde_json::json!({ "ok": false, "error": "ratelimited" });
        assert!(matches!(
            check_envelope(&limited, ""),
            Err(CollectorError::RateLimited { .. })
        ));
        let ok = serde_json::json!({ "ok": true });
        assert!(check_envelope(&ok, "").is_ok());
    }
}
