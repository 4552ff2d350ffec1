//! Microsoft 365 adapter (`collab_suite` platform).
//!
//! Discovery methods:
//! - `oauth_app_inventory` — Graph service principals joined with their
//!   delegated OAuth2 permission grants; one candidate per app id with the
//!   union of granted scopes.
//! - `audit_log_oauth_authorize` — directory audit entries for
//!   "Consent to application".
//! - `webhook_listing` — Graph change-notification subscriptions.

use crate::http::PlatformHttp;
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

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const LOGIN_BASE: &str = "https://login.microsoftonline.com";

pub struct Microsoft365Collector {
    http: PlatformHttp,
    graph_base: String,
    login_base: String,
    client_id: String,
    client_secret: String,
    tenant_id: String,
}

impl Microsoft365Collector {
    pub fn new(
        rate_limiter: Arc<HostRateLimiter>,
        client_id: String,
        client_secret: String,
        tenant_id: String,
    ) -> Self {
        Self {
            http: PlatformHttp::new(rate_limiter),
            graph_base: GRAPH_BASE.to_string(),
            login_base: LOGIN_BASE.to_string(),
            client_id,
            client_secret,
            tenant_id,
        }
    }

    /// Point Graph and login endpoints at one root (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base = base_url.into();
        self.graph_base = base.clone();
        self.login_base = base;
        self
    }

    async fn fetch(
        &self,
        ctx: &CollectContext,
        url: String,
        scope: &str,
    ) -> Result<Value, CollectorError> {
        with_retry(scope, &ctx.cancel, || {
            self.http
                .get_json(&url, &ctx.credential.secret, scope, &ctx.cancel)
        })
        .await
    }
}

fn rfc3339(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

/// Joins service principals with their delegated permission grants: one
/// candidate per app id, scopes unioned across every grant.
pub fn parse_service_principals(principals: &Value, grants: &Value) -> Vec<RawCandidate> {
    // Scope union per servicePrincipal object id.
    let mut scopes_by_principal: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(grant_rows) = grants.get("value").and_then(Value::as_array) {
        for grant in grant_rows {
            let Some(principal_id) = grant.get("clientId").and_then(Value::as_str) else {
                continue;
            };
            let scope_list = grant
                .get("scope")
                .and_then(Value::as_str)
                .map(|s| {
                    s.split_whitespace()
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            scopes_by_principal
                .entry(principal_id.to_string())
                .or_default()
                .extend(scope_list);
        }
    }

    let mut out = Vec::new();
    let Some(rows) = principals.get("value").and_then(Value::as_array) else {
        return out;
    };
    for principal in rows {
        let Some(object_id) = principal.get("id").and_then(Value::as_str) else {
            continue;
        };
        let app_id = principal
            .get("appId")
            .and_then(Value::as_str)
            .unwrap_or(object_id);
        let name = principal
            .get("displayName")
            .and_then(Value::as_str)
            .unwrap_or(app_id);
        let scopes = scopes_by_principal.remove(object_id).unwrap_or_default();
        out.push(RawCandidate {
            external_id: app_id.to_string(),
            name: name.to_string(),
            type_hint: AutomationType::Integration,
            source_method: SourceMethod::OauthAppInventory,
            trigger_hint: None,
            actions: Vec::new(),
            scopes: scopes.into_iter().collect(),
            owner_info: OwnerInfo::default(),
            modified_at: rfc3339(principal.get("createdDateTime")),
            platform_metadata: serde_json::json!({
                "publisher": principal.get("publisherName").and_then(Value::as_str),
                "sign_in_audience": principal.get("signInAudience").and_then(Value::as_str),
            }),
            raw_evidence: format!("service principal {name} ({app_id})"),
        });
    }
    out
}

/// "Consent to application" entries from the directory audit log, scopes
/// unioned per target app.
pub fn parse_consent_audits(body: &Value) -> Vec<RawCandidate> {
    let mut by_app: BTreeMap<String, RawCandidate> = BTreeMap::new();
    let Some(rows) = body.get("value").and_then(Value::as_array) else {
        return Vec::new();
    };
    for row in rows {
        if row.get("activityDisplayName").and_then(Value::as_str)
            != Some("Consent to application")
        {
            continue;
        }
        let target = row
            .get("targetResources")
            .and_then(Value::as_array)
            .and_then(|t| t.first());
        let Some(app_id) = target
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            continue;
        };
        let name = target
            .and_then(|t| t.get("displayName"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(app_id);
        // Consent properties carry the granted scopes as a space-separated list.
        let scopes: Vec<String> = target
            .and_then(|t| t.get("modifiedProperties"))
            .and_then(Value::as_array)
            .and_then(|props| {
                props.iter().find(|p| {
                    p.get("displayName").and_then(Value::as_str) == Some("ConsentAction.Permissions")
                })
            })
            .and_then(|p| p.get("newValue"))
            .and_then(Value::as_str)
            .map(|s| {
                s.split([' ', ','])
                    .map(str::trim)
                    .filter(|s| !s.is_empty() && !s.starts_with('['))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let initiator = row
            .get("initiatedBy")
            .and_then(|i| i.get("user"))
            .and_then(|u| u.get("userPrincipalName"))
            .and_then(Value::as_str);
        let event_time = rfc3339(row.get("activityDateTime"));

        let entry = by_app.entry(app_id.to_string()).or_insert_with(|| RawCandidate {
            external_id: app_id.to_string(),
            name: name.to_string(),
            type_hint: AutomationType::Integration,
            source_method: SourceMethod::AuditLogOauthAuthorize,
            trigger_hint: None,
            actions: Vec::new(),
            scopes: Default::default(),
            owner_info: OwnerInfo {
                user_id: None,
                email: initiator.map(str::to_string),
                display_name: None,
                project_id: None,
            },
            modified_at: None,
            platform_metadata: serde_json::json!({ "event": "consent_to_application" }),
            raw_evidence: format!("consent event for {name} ({app_id})"),
        });
        entry.scopes.extend(scopes);
        if entry.modified_at.map(|m| Some(m) < event_time).unwrap_or(true) {
            entry.modified_at = event_time;
        }
    }
    by_app.into_values().collect()
}

/// Graph change-notification subscriptions.
pub fn parse_subscriptions(body: &Value) -> Vec<RawCandidate> {
    let Some(rows) = body.get("value").and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|sub| {
            let id = sub.get("id").and_then(Value::as_str)?;
            let resource = sub.get("resource").and_then(Value::as_str).unwrap_or("");
            let notification_url = sub
                .get("notificationUrl")
                .and_then(Value::as_str)
                .unwrap_or("");
            Some(RawCandidate {
                external_id: id.to_string(),
                name: format!("Graph subscription on {resource}"),
                type_hint: AutomationType::Webhook,
                source_method: SourceMethod::WebhookListing,
                trigger_hint: Some("change_notification".to_string()),
                actions: vec![format!("notify:{notification_url}")],
                scopes: Default::default(),
                owner_info: OwnerInfo::default(),
                modified_at: rfc3339(sub.get("expirationDateTime")),
                platform_metadata: serde_json::json!({
                    "resource": resource,
                    "change_type": sub.get("changeType").and_then(Value::as_str),
                }),
                raw_evidence: format!("graph subscription {resource} -> {notification_url}"),
            })
        })
        .collect()
}

async fn emit_all(
    tx: &mpsc::Sender<RawCandidate>,
    mut candidates: Vec<RawCandidate>,
) -> Result<(), CollectorError> {
    RawCandidate::sort_for_emit(&mut candidates);
    for candidate in candidates {
        if tx.send(candidate).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

#[async_trait]
impl TokenRefresher for Microsoft365Collector {
    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken, CollectorError> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_base, self.tenant_id
        );
        let body = self
            .http
            .post_form(
                &url,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", &self.client_id),
                    ("client_secret", &self.client_secret),
                    ("scope", "https://graph.microsoft.com/.default"),
                ],
            )
            .await?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CollectorError::Auth("microsoft: refresh returned no access_token".into())
            })?
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
impl Collector for Microsoft365Collector {
    fn platform_type(&self) -> PlatformType {
        PlatformType::CollabSuite
    }

    fn sub_methods(&self, _connection: &PlatformConnection) -> Vec<SourceMethod> {
        vec![
            SourceMethod::OauthAppInventory,
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
            SourceMethod::OauthAppInventory => {
                let principals = self
                    .fetch(
                        ctx,
                        format!("{}/servicePrincipals", self.graph_base),
                        "Application.Read.All",
                    )
                    .await?;
                let grants = self
                    .fetch(
                        ctx,
                        format!("{}/oauth2PermissionGrants", self.graph_base),
                        "Directory.Read.All",
                    )
                    .await?;
                parse_service_principals(&principals, &grants)
            }
            SourceMethod::AuditLogOauthAuthorize => {
                let url = format!(
                    "{}/auditLogs/directoryAudits?$filter={}",
                    self.graph_base,
                    urlencoding::encode("activityDisplayName eq 'Consent to application'")
                );
                let body = self.fetch(ctx, url, "AuditLog.Read.All").await?;
                parse_consent_audits(&body)
            }
            SourceMethod::WebhookListing => {
                let body = self
                    .fetch(
                        ctx,
                        format!("{}/subscriptions", self.graph_base),
                        "Subscription.Read.All",
                    )
                    .await?;
                parse_subscriptions(&body)
            }
            other => {
                return Err(CollectorError::Fatal(format!(
                    "microsoft adapter does not implement {}",
                    other.as_str()
                )))
            }
        };
        tracing::debug!(
            target: "shadowscan::collector::microsoft",
            method = method.as_str(),
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
    fn principals_join_grants_by_object_id() {
        let principals = serde_json::json!({
            "value": [
                {
                    "id": "obj-1", "appId": "app-guid-1", "displayName": "Flow Runner",
                    "createdDateTime": "2025-03-01T00:00:00Z",
                    "publisherName": "Contoso"
                },
                { "id": "obj-2", "appId": "app-guid-2", "displayName": "Quiet App" }
            ]
        });
        let grants = serde_json::json!({
            "value": [
                { "clientId": "obj-1", "scope": "Mail.Read Files.Read.All" },
                { "clientId": "obj-1", "scope": "Mail.Read User.Read" }
            ]
        });
        let candidates = parse_service_principals(&principals, &grants);
        assert_eq!(candidates.len(), 2);
        let flow = candidates
            .iter()
            .find(|c| c.external_id == "app-guid-1")
            .unwrap();
        let scopes: Vec<&str> = flow.scopes.iter().map(String::as_str).collect();
        assert_eq!(scopes, vec!["Files.Read.All", "Mail.Read", "User.Read"]);
        let quiet = candidates
            .iter()
            .find(|c| c.external_id == "app-guid-2")
            .unwrap();
        assert!(quiet.scopes.is_empty());
    }

    #[test]
    fn consent_audits_union_scopes_per_app() {
        let row = |time: &str, scopes: &str| {
            serde_json::json!({
                "activityDisplayName": "Consent to application",
                "activityDateTime": time,
                "initiatedBy": { "user": { "userPrincipalName": "admin@contoso.com" } },
                "targetResources": [{
                    "id": "app-guid-9",
                    "displayName": "Summarizer",
                    "modifiedProperties": [{
                        "displayName": "ConsentAction.Permissions",
                        "newValue": scopes
                    }]
                }]
            })
        };
        let body = serde_json::json!({
            "value": [
                row("2025-04-01T09:00:00Z", "Mail.Read openid"),
                row("2025-04-03T09:00:00Z", "Files.Read.All openid")
            ]
        });
        let candidates = parse_consent_audits(&body);
        assert_eq!(candidates.len(), 1);
        let scopes: Vec<&str> = candidates[0].scopes.iter().map(String::as_str).collect();
        assert_eq!(scopes, vec!["Files.Read.All", "Mail.Read", "openid"]);
        assert_eq!(
            candidates[0].modified_at,
            Some(DateTime::parse_from_rfc3339("2025-04-03T09:00:00Z").unwrap().with_timezone(&Utc))
        );
    }

    #[test]
    fn subscriptions_become_webhook_candidates() {
        let body = serde_json::json!({
            "value": [{
                "id": "sub-1",
                "resource": "me/mailFolders('Inbox')/messages",
                "notificationUrl": "https://hooks.vendor.io/graph",
                "changeType": "created",
                "expirationDateTime": "2025-07-01T00:00:00Z"
            }]
        });
        let candidates = parse_subscriptions(&body);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].type_hint, AutomationType::Webhook);
        assert!(candidates[0].raw_evidence.contains("hooks.vendor.io"));
    }
}
