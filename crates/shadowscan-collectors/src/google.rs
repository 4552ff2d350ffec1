//! Google Workspace adapter (`workspace_suite` platform).
//!
//! Discovery methods:
//! - `oauth_app_inventory` — OAuth tokens granted by the connecting user
//!   (Directory API `tokens.list`), one candidate per client id.
//! - `audit_log_oauth_authorize` — admin reports `token` activity filtered to
//!   `authorize` events; scopes observed across events for the same client id
//!   are unioned into one candidate.
//! - `script_content_scan` — Apps Script projects found via Drive, with
//!   project source fetched and scanned. A script whose content we may not
//!   read still surfaces as a candidate, just with no actions or evidence.
//! - `service_account_audit` — IAM service accounts of the workspace project.
//!   Skipped entirely for consumer connections (no hosted-domain marker).

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

const DIRECTORY_BASE: &str = "https://admin.googleapis.com";
const DRIVE_BASE: &str = "https://www.googleapis.com";
const SCRIPT_BASE: &str = "https://script.googleapis.com";
const IAM_BASE: &str = "https://iam.googleapis.com";
const TOKEN_BASE: &str = "https://oauth2.googleapis.com";

/// Apps Script services that read as automation capabilities.
const SCRIPT_SERVICES: &[(&str, &str)] = &[
    ("UrlFetchApp", "external_fetch"),
    ("GmailApp", "gmail_access"),
    ("MailApp", "send_mail"),
    ("DriveApp", "drive_access"),
    ("SpreadsheetApp", "spreadsheet_access"),
    ("CalendarApp", "calendar_access"),
];

pub struct GoogleWorkspaceCollector {
    http: PlatformHttp,
    directory_base: String,
    drive_base: String,
    script_base: String,
    iam_base: String,
    token_base: String,
    client_id: String,
    client_secret: String,
}

impl GoogleWorkspaceCollector {
    pub fn new(rate_limiter: Arc<HostRateLimiter>, client_id: String, client_secret: String) -> Self {
        Self {
            http: PlatformHttp::new(rate_limiter),
            directory_base: DIRECTORY_BASE.to_string(),
            drive_base: DRIVE_BASE.to_string(),
            script_base: SCRIPT_BASE.to_string(),
            iam_base: IAM_BASE.to_string(),
            token_base: TOKEN_BASE.to_string(),
            client_id,
            client_secret,
        }
    }

    /// Point every API family at one root (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base = base_url.into();
        self.directory_base = base.clone();
        self.drive_base = base.clone();
        self.script_base = base.clone();
        self.iam_base = base.clone();
        self.token_base = base;
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

    async fn collect_oauth_apps(
        &self,
        ctx: &CollectContext,
    ) -> Result<Vec<RawCandidate>, CollectorError> {
        let url = format!(
            "{}/admin/directory/v1/users/{}/tokens",
            self.directory_base,
            urlencoding::encode(&ctx.connection.platform_user_id)
        );
        let body = self
            .fetch(ctx, url, "admin.directory.user.security")
            .await?;
        Ok(parse_token_inventory(&body))
    }

    async fn collect_token_audit(
        &self,
        ctx: &CollectContext,
    ) -> Result<Vec<RawCandidate>, CollectorError> {
        let url = format!(
            "{}/admin/reports/v1/activity/users/all/applications/token?eventName=authorize",
            self.directory_base
        );
        let body = self.fetch(ctx, url, "admin.reports.audit.readonly").await?;
        Ok(parse_token_audit(&body))
    }

    async fn collect_scripts(
        &self,
        ctx: &CollectContext,
    ) -> Result<Vec<RawCandidate>, CollectorError> {
        let list_url = format!(
            "{}/drive/v3/files?q={}&fields=files(id,name,modifiedTime,owners)",
            self.drive_base,
            urlencoding::encode("mimeType='application/vnd.google-apps.script'")
        );
        let listing = self.fetch(ctx, list_url, "drive.readonly").await?;
        let files = listing
            .get("files")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut candidates = Vec::with_capacity(files.len());
        for file in &files {
            let Some(script_id) = file.get("id").and_then(Value::as_str) else {
                continue;
            };
            let content_url = format!("{}/v1/projects/{script_id}/content", self.script_base);
            let source = match self.fetch(ctx, content_url, "script.projects.readonly").await {
                Ok(content) => Some(collect_script_source(&content)),
                // Unreadable script content degrades to an empty contribution
                // for this script; the project itself is still inventoried.
                Err(CollectorError::Permission { scope }) => {
                    tracing::debug!(
                        target: "shadowscan::collector::google",
                        script_id,
                        scope,
                        "script content not readable; emitting bare candidate"
                    );
                    None
                }
                Err(other) => return Err(other),
            };
            candidates.push(script_candidate(file, script_id, source));
        }
        Ok(candidates)
    }

    async fn collect_service_accounts(
        &self,
        ctx: &CollectContext,
    ) -> Result<Vec<RawCandidate>, CollectorError> {
        let project = ctx
            .connection
            .metadata
            .get("project_id")
            .and_then(Value::as_str)
            .unwrap_or("-");
        let url = format!(
            "{}/v1/projects/{}/serviceAccounts",
            self.iam_base,
            urlencoding::encode(project)
        );
        let body = self.fetch(ctx, url, "iam.serviceAccounts.list").await?;
        Ok(parse_service_accounts(&body))
    }
}

fn rfc3339_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

/// One candidate per OAuth client id from a `tokens.list` payload.
pub fn parse_token_inventory(body: &Value) -> Vec<RawCandidate> {
    let mut by_client: BTreeMap<String, RawCandidate> = BTreeMap::new();
    let Some(items) = body.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    for item in items {
        let Some(client_id) = item
            .get("clientId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            continue;
        };
        let name = item
            .get("displayText")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(client_id);
        let scopes: Vec<String> = item
            .get("scopes")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let entry = by_client
            .entry(client_id.to_string())
            .or_insert_with(|| RawCandidate {
                external_id: client_id.to_string(),
                name: name.to_string(),
                type_hint: AutomationType::Integration,
                source_method: SourceMethod::OauthAppInventory,
                trigger_hint: None,
                actions: Vec::new(),
                scopes: Default::default(),
                owner_info: OwnerInfo::default(),
                modified_at: None,
                platform_metadata: serde_json::json!({
                    "native_app": item.get("nativeApp").and_then(Value::as_bool).unwrap_or(false),
                    "anonymous": item.get("anonymous").and_then(Value::as_bool).unwrap_or(false),
                }),
                raw_evidence: format!("oauth client {name} ({client_id})"),
            });
        entry.scopes.extend(scopes);
    }
    by_client.into_values().collect()
}

/// Authorize events from the admin reports `token` activity. Events for the
/// same client id merge into one candidate with unioned scopes.
pub fn parse_token_audit(body: &Value) -> Vec<RawCandidate> {
    let mut by_client: BTreeMap<String, RawCandidate> = BTreeMap::new();
    let Some(items) = body.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    for item in items {
        let event_time = item
            .get("id")
            .and_then(|id| rfc3339_field(id, "time"));
        let actor_email = item
            .get("actor")
            .and_then(|a| a.get("email"))
            .and_then(Value::as_str);
        let Some(events) = item.get("events").and_then(Value::as_array) else {
            continue;
        };
        for event in events {
            if event.get("name").and_then(Value::as_str) != Some("authorize") {
                continue;
            }
            let mut client_id = None;
            let mut app_name = None;
            let mut scopes: Vec<String> = Vec::new();
            if let Some(parameters) = event.get("parameters").and_then(Value::as_array) {
                for param in parameters {
                    match param.get("name").and_then(Value::as_str) {
                        Some("client_id") => {
                            client_id = param.get("value").and_then(Value::as_str);
                        }
                        Some("app_name") => {
                            app_name = param.get("value").and_then(Value::as_str);
                        }
                        Some("scope") => {
                            if let Some(multi) = param.get("multiValue").and_then(Value::as_array) {
                                scopes.extend(
                                    multi.iter().filter_map(Value::as_str).map(str::to_string),
                                );
                            } else if let Some(single) =
                                param.get("value").and_then(Value::as_str)
                            {
                                scopes.push(single.to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
            let Some(client_id) = client_id.filter(|s| !s.is_empty()) else {
                continue;
            };
            let name = app_name.filter(|s| !s.is_empty()).unwrap_or(client_id);
            let entry = by_client
                .entry(client_id.to_string())
                .or_insert_with(|| RawCandidate {
                    external_id: client_id.to_string(),
                    name: name.to_string(),
                    type_hint: AutomationType::Integration,
                    source_method: SourceMethod::AuditLogOauthAuthorize,
                    trigger_hint: None,
                    actions: Vec::new(),
                    scopes: Default::default(),
                    owner_info: OwnerInfo {
                        user_id: None,
                        email: actor_email.map(str::to_string),
                        display_name: None,
                        project_id: None,
                    },
                    modified_at: None,
                    platform_metadata: serde_json::json!({ "event": "oauth_authorize" }),
                    raw_evidence: format!("oauth authorize event for {name} ({client_id})"),
                });
            entry.scopes.extend(scopes);
            if entry.modified_at.map(|m| Some(m) < event_time).unwrap_or(true) {
                entry.modified_at = event_time;
            }
        }
    }
    by_client.into_values().collect()
}

/// Concatenates the source of every file in an Apps Script project payload.
pub fn collect_script_source(content: &Value) -> String {
    let Some(files) = content.get("files").and_then(Value::as_array) else {
        return String::new();
    };
    files
        .iter()
        .filter_map(|f| f.get("source").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

fn script_candidate(file: &Value, script_id: &str, source: Option<String>) -> RawCandidate {
    let name = file
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(script_id);
    let owner = file
        .get("owners")
        .and_then(Value::as_array)
        .and_then(|o| o.first());
    let (actions, trigger_hint, evidence) = match source {
        Some(source) => {
            let mut actions: Vec<String> = SCRIPT_SERVICES
                .iter()
                .filter(|(marker, _)| source.contains(marker))
                .map(|(_, action)| action.to_string())
                .collect();
            actions.sort();
            let trigger = if source.contains("ScriptApp.newTrigger") {
                Some("time_driven".to_string())
            } else {
                None
            };
            (actions, trigger, source)
        }
        None => (Vec::new(), None, String::new()),
    };
    RawCandidate {
        external_id: script_id.to_string(),
        name: name.to_string(),
        type_hint: AutomationType::Script,
        source_method: SourceMethod::ScriptContentScan,
        trigger_hint,
        actions,
        scopes: Default::default(),
        owner_info: OwnerInfo {
            user_id: None,
            email: owner
                .and_then(|o| o.get("emailAddress"))
                .and_then(Value::as_str)
                .map(str::to_string),
            display_name: owner
                .and_then(|o| o.get("displayName"))
                .and_then(Value::as_str)
                .map(str::to_string),
            project_id: None,
        },
        modified_at: rfc3339_field(file, "modifiedTime"),
        platform_metadata: serde_json::json!({ "mime_type": "application/vnd.google-apps.script" }),
        raw_evidence: evidence,
    }
}

/// Service accounts of the workspace project.
pub fn parse_service_accounts(body: &Value) -> Vec<RawCandidate> {
    let Some(accounts) = body.get("accounts").and_then(Value::as_array) else {
        return Vec::new();
    };
    accounts
        .iter()
        .filter_map(|account| {
            let email = account.get("email").and_then(Value::as_str)?;
            let project = account
                .get("projectId")
                .and_then(Value::as_str)
                .map(str::to_string);
            let name = account
                .get("displayName")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(email);
            Some(RawCandidate {
                external_id: email.to_string(),
                name: name.to_string(),
                type_hint: AutomationType::ServiceAccount,
                source_method: SourceMethod::ServiceAccountAudit,
                trigger_hint: None,
                actions: Vec::new(),
                scopes: Default::default(),
                owner_info: OwnerInfo {
                    user_id: account
                        .get("uniqueId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    email: Some(email.to_string()),
                    display_name: None,
                    project_id: project,
                },
                modified_at: None,
                platform_metadata: serde_json::json!({ "kind": "iam_service_account" }),
                raw_evidence: format!("service account {email}"),
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
impl TokenRefresher for GoogleWorkspaceCollector {
    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken, CollectorError> {
        let url = format!("{}/token", self.token_base);
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
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CollectorError::Auth("google: refresh returned no access_token".into())
            })?
            .to_string();
        let expires_at = body
            .get("expires_in")
            .and_then(Value::as_i64)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        Ok(RefreshedToken {
            access_token,
            refresh_token: None,
            expires_at,
        })
    }
}

#[async_trait]
impl Collector for GoogleWorkspaceCollector {
    fn platform_type(&self) -> PlatformType {
        PlatformType::WorkspaceSuite
    }

    fn sub_methods(&self, connection: &PlatformConnection) -> Vec<SourceMethod> {
        let mut methods = vec![
            SourceMethod::OauthAppInventory,
            SourceMethod::AuditLogOauthAuthorize,
            SourceMethod::ScriptContentScan,
        ];
        // Consumer accounts have no IAM surface to audit.
        if connection.is_hosted_workspace() {
            methods.push(SourceMethod::ServiceAccountAudit);
        }
        methods
    }

    async fn collect(
        &self,
        ctx: &CollectContext,
        method: SourceMethod,
        tx: mpsc::Sender<RawCandidate>,
    ) -> Result<(), CollectorError> {
        let candidates = match method {
            SourceMethod::OauthAppInventory => self.collect_oauth_apps(ctx).await?,
            SourceMethod::AuditLogOauthAuthorize => self.collect_token_audit(ctx).await?,
            SourceMethod::ScriptContentScan => self.collect_scripts(ctx).await?,
            SourceMethod::ServiceAccountAudit => self.collect_service_accounts(ctx).await?,
            other => {
                return Err(CollectorError::Fatal(format!(
                    "google adapter does not implement {}",
                    other.as_str()
                )))
            }
        };
        tracing::debug!(
            target: "shadowscan::collector::google",
            method = method.as_str(),
            count = candidates.len(),
            "sub-method produced candidates"
        );
        emit_all(&tx, candidates).await
    }
}
