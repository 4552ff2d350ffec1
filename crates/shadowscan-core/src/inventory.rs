//! Automation inventory — durable SQLite store.
//!
//! Owns the relational schema for organizations, platform connections,
//! discovery runs, and discovered automations. The persister half upserts
//! scored candidates idempotently: the same `(connection_id, external_id)`
//! observed again is a *re-observation* — mutable fields and `last_seen_at`
//! advance, identity and `first_discovered_at` never change.
//!
//! Semi-structured fields (`actions`, `permissions_required`, `owner_info`,
//! `platform_metadata`) are stored as JSON-encoded TEXT; timestamps are
//! ISO-8601 (RFC 3339) strings so nested values round-trip without loss.

use crate::error::StoreError;
use crate::shared::{
    AutomationType, ConnectionStatus, DiscoveredAutomation, DiscoveryRun, OwnerInfo,
    PlatformConnection, PlatformType, RiskAssessment, RiskLevel, RunStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Organization record. Created externally; the pipeline only reads it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Organization {
    pub id: String,
    pub slug: String,
    pub plan_tier: String,
}

/// Input for registering a platform connection.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub organization_id: String,
    pub platform_type: PlatformType,
    pub platform_user_id: String,
    pub platform_workspace_id: Option<String>,
    pub permissions_granted: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Result of one automation upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(v)?)
}

fn from_json<T: serde::de::DeserializeOwned + Default>(s: Option<String>) -> T {
    s.as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

/// Durable inventory store. Opens a fresh SQLite connection per operation with
/// FK enforcement and a busy timeout so concurrent sub-methods do not trip
/// `SQLITE_BUSY` during parallel upserts.
#[derive(Clone)]
pub struct InventoryStore {
    db_path: PathBuf,
}

impl InventoryStore {
    /// Opens (creating if needed) the inventory database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let this = Self {
            db_path: path.as_ref().to_path_buf(),
        };
        this.init()?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn conn(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        // FK constraints are OFF by default in SQLite; enforce per connection.
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL,
                plan_tier TEXT NOT NULL DEFAULT 'free'
            );

            CREATE TABLE IF NOT EXISTS platform_connections (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                platform_type TEXT NOT NULL,
                platform_user_id TEXT NOT NULL,
                platform_workspace_id TEXT NULL,
                status TEXT NOT NULL,
                permissions_granted TEXT NOT NULL DEFAULT '[]',
                expires_at TEXT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (organization_id, platform_type, platform_user_id, platform_workspace_id)
            );

            CREATE INDEX IF NOT EXISTS idx_connections_org ON platform_connections(organization_id);

            CREATE TABLE IF NOT EXISTS encrypted_credentials (
                platform_connection_id TEXT NOT NULL,
                credential_type TEXT NOT NULL,
                ciphertext BLOB NOT NULL,
                encryption_key_id TEXT NOT NULL,
                expires_at TEXT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (platform_connection_id, credential_type)
            );

            CREATE TABLE IF NOT EXISTS discovery_runs (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                platform_connection_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT NULL,
                automations_found INTEGER NOT NULL DEFAULT 0,
                errors_count INTEGER NOT NULL DEFAULT 0,
                error_details TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_connection ON discovery_runs(platform_connection_id, started_at);

            CREATE TABLE IF NOT EXISTS discovered_automations (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                platform_connection_id TEXT NOT NULL,
                discovery_run_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                name TEXT NOT NULL,
                automation_type TEXT NOT NULL,
                status TEXT NOT NULL,
                trigger_type TEXT NULL,
                actions TEXT NOT NULL DEFAULT '[]',
                permissions_required TEXT NOT NULL DEFAULT '[]',
                owner_info TEXT NOT NULL DEFAULT '{}',
                platform_metadata TEXT NOT NULL DEFAULT '{}',
                risk_level TEXT NOT NULL,
                risk_score INTEGER NOT NULL,
                risk_factors TEXT NOT NULL DEFAULT '[]',
                is_ai_platform INTEGER NOT NULL DEFAULT 0,
                ai_platform_name TEXT NULL,
                assessed_at TEXT NOT NULL,
                first_discovered_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                missed_runs INTEGER NOT NULL DEFAULT 0,
                UNIQUE (platform_connection_id, external_id)
            );

            CREATE INDEX IF NOT EXISTS idx_automations_org ON discovered_automations(organization_id);
            CREATE INDEX IF NOT EXISTS idx_automations_run ON discovered_automations(discovery_run_id);
            CREATE INDEX IF NOT EXISTS idx_automations_seen ON discovered_automations(last_seen_at);
            "#,
        )
        .map_err(StoreError::Db)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Organizations
    // -------------------------------------------------------------------------

    pub fn upsert_organization(&self, org: &Organization) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO organizations (id, slug, plan_tier) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET slug = excluded.slug, plan_tier = excluded.plan_tier
            "#,
            params![org.id, org.slug, org.plan_tier],
        )?;
        Ok(())
    }

    pub fn get_organization(&self, id: &str) -> Result<Option<Organization>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, slug, plan_tier FROM organizations WHERE id = ?1",
                params![id],
                |r| {
                    Ok(Organization {
                        id: r.get(0)?,
                        slug: r.get(1)?,
                        plan_tier: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // -------------------------------------------------------------------------
    // Platform connections
    // -------------------------------------------------------------------------

    /// Registers a connection in `pending` state. The table's uniqueness
    /// constraint makes a duplicate (org, platform, user, workspace) an error.
    pub fn create_connection(&self, new: NewConnection) -> Result<PlatformConnection, StoreError> {
        let now = Utc::now();
        let record = PlatformConnection {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: new.organization_id,
            platform_type: new.platform_type,
            platform_user_id: new.platform_user_id,
            platform_workspace_id: new.platform_workspace_id,
            status: ConnectionStatus::Pending,
            permissions_granted: new.permissions_granted,
            expires_at: new.expires_at,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO platform_connections
                (id, organization_id, platform_type, platform_user_id, platform_workspace_id,
                 status, permissions_granted, expires_at, metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.id,
                record.organization_id,
                record.platform_type.as_str(),
                record.platform_user_id,
                record.platform_workspace_id,
                record.status.as_str(),
                to_json(&record.permissions_granted)?,
                record.expires_at.map(ts),
                to_json(&record.metadata)?,
                ts(record.created_at),
                ts(record.updated_at),
            ],
        )?;
        Ok(record)
    }

    fn connection_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<PlatformConnection> {
        let platform_type: String = r.get(2)?;
        let status: String = r.get(5)?;
        Ok(PlatformConnection {
            id: r.get(0)?,
            organization_id: r.get(1)?,
            platform_type: PlatformType::parse(&platform_type).unwrap_or(PlatformType::Chat),
            platform_user_id: r.get(3)?,
            platform_workspace_id: r.get(4)?,
            status: ConnectionStatus::parse(&status).unwrap_or(ConnectionStatus::Error),
            permissions_granted: from_json(r.get::<_, Option<String>>(6)?),
            expires_at: parse_opt_ts(r.get(7)?),
            metadata: from_json(r.get::<_, Option<String>>(8)?),
            created_at: parse_ts(&r.get::<_, String>(9)?),
            updated_at: parse_ts(&r.get::<_, String>(10)?),
        })
    }

    const CONNECTION_COLS: &'static str = "id, organization_id, platform_type, platform_user_id, \
        platform_workspace_id, status, permissions_granted, expires_at, metadata, created_at, updated_at";

    pub fn get_connection(&self, id: &str) -> Result<Option<PlatformConnection>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM platform_connections WHERE id = ?1",
            Self::CONNECTION_COLS
        );
        let row = conn
            .query_row(&sql, params![id], Self::connection_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_connections(&self, org_id: &str) -> Result<Vec<PlatformConnection>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM platform_connections WHERE organization_id = ?1 ORDER BY created_at",
            Self::CONNECTION_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![org_id], Self::connection_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_connection_status(
        &self,
        id: &str,
        status: ConnectionStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE platform_connections SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), ts(Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("connection", id.to_string()));
        }
        Ok(())
    }

    /// Removes a connection row. Automations referencing it survive and list
    /// with `platform_type = NULL` through the read model's LEFT JOIN.
    pub fn delete_connection(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM platform_connections WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Discovery runs
    // -------------------------------------------------------------------------

    pub fn create_run(
        &self,
        organization_id: &str,
        connection_id: &str,
    ) -> Result<DiscoveryRun, StoreError> {
        let run = DiscoveryRun {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            connection_id: connection_id.to_string(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            automations_found: 0,
            errors_count: 0,
            error_details: None,
        };
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO discovery_runs
                (id, organization_id, platform_connection_id, status, started_at,
                 completed_at, automations_found, errors_count, error_details)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0, 0, NULL)
            "#,
            params![
                run.id,
                run.organization_id,
                run.connection_id,
                run.status.as_str(),
                ts(run.started_at),
            ],
        )?;
        Ok(run)
    }

    pub fn mark_run_in_progress(&self, run_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE discovery_runs SET status = ?1 WHERE id = ?2",
            params![RunStatus::InProgress.as_str(), run_id],
        )?;
        Ok(())
    }

    /// Writes the terminal run row: status, counters, completion time.
    pub fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        automations_found: u32,
        errors_count: u32,
        error_details: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE discovery_runs
            SET status = ?1, completed_at = ?2, automations_found = ?3,
                errors_count = ?4, error_details = ?5
            WHERE id = ?6
            "#,
            params![
                status.as_str(),
                ts(Utc::now()),
                automations_found,
                errors_count,
                error_details,
                run_id
            ],
        )?;
        Ok(())
    }

    fn run_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<DiscoveryRun> {
        let status: String = r.get(3)?;
        Ok(DiscoveryRun {
            id: r.get(0)?,
            organization_id: r.get(1)?,
            connection_id: r.get(2)?,
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
            started_at: parse_ts(&r.get::<_, String>(4)?),
            completed_at: parse_opt_ts(r.get(5)?),
            automations_found: r.get(6)?,
            errors_count: r.get(7)?,
            error_details: r.get(8)?,
        })
    }

    const RUN_COLS: &'static str = "id, organization_id, platform_connection_id, status, \
        started_at, completed_at, automations_found, errors_count, error_details";

    pub fn get_run(&self, run_id: &str) -> Result<Option<DiscoveryRun>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM discovery_runs WHERE id = ?1", Self::RUN_COLS);
        let row = conn
            .query_row(&sql, params![run_id], Self::run_from_row)
            .optional()?;
        Ok(row)
    }

    /// Most recent run for a connection, by start time.
    pub fn latest_run(&self, connection_id: &str) -> Result<Option<DiscoveryRun>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM discovery_runs WHERE platform_connection_id = ?1 \
             ORDER BY started_at DESC, id LIMIT 1",
            Self::RUN_COLS
        );
        let row = conn
            .query_row(&sql, params![connection_id], Self::run_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_runs(
        &self,
        connection_id: &str,
        limit: usize,
    ) -> Result<Vec<DiscoveryRun>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM discovery_runs WHERE platform_connection_id = ?1 \
             ORDER BY started_at DESC, id LIMIT ?2",
            Self::RUN_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![connection_id, limit as i64], Self::run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Automations (write side)
    // -------------------------------------------------------------------------

    /// Upserts one scored automation. Insert sets both timestamps to now;
    /// re-observation advances `last_seen_at`, reactivates the row, resets the
    /// missed-run counter, and leaves `id` / `first_discovered_at` untouched.
    pub fn upsert_automation(
        &self,
        organization_id: &str,
        connection_id: &str,
        run_id: &str,
        candidate: &crate::shared::RawCandidate,
        risk: &RiskAssessment,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let conn = self.conn()?;

        // Persist the raw evidence inside platform_metadata so the detector
        // can be re-run over history without re-collection.
        let mut metadata = candidate.platform_metadata.clone();
        if !candidate.raw_evidence.is_empty() {
            if let serde_json::Value::Object(ref mut map) = metadata {
                map.insert(
                    "raw_evidence".to_string(),
                    serde_json::Value::String(candidate.raw_evidence.clone()),
                );
            } else if metadata.is_null() {
                metadata = serde_json::json!({ "raw_evidence": candidate.raw_evidence });
            }
        }
        let scopes: Vec<&str> = candidate.scopes.iter().map(|s| s.as_str()).collect();

        let existed: bool = conn
            .query_row(
                "SELECT 1 FROM discovered_automations \
                 WHERE platform_connection_id = ?1 AND external_id = ?2",
                params![connection_id, candidate.external_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        conn.execute(
            r#"
            INSERT INTO discovered_automations
                (id, organization_id, platform_connection_id, discovery_run_id, external_id,
                 name, automation_type, status, trigger_type, actions, permissions_required,
                 owner_info, platform_metadata, risk_level, risk_score, risk_factors,
                 is_ai_platform, ai_platform_name, assessed_at,
                 first_discovered_at, last_seen_at, is_active, missed_runs)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?20, 1, 0)
            ON CONFLICT(platform_connection_id, external_id) DO UPDATE SET
                discovery_run_id = excluded.discovery_run_id,
                name = excluded.name,
                automation_type = excluded.automation_type,
                status = excluded.status,
                trigger_type = excluded.trigger_type,
                actions = excluded.actions,
                permissions_required = excluded.permissions_required,
                owner_info = excluded.owner_info,
                platform_metadata = excluded.platform_metadata,
                risk_level = excluded.risk_level,
                risk_score = excluded.risk_score,
                risk_factors = excluded.risk_factors,
                is_ai_platform = excluded.is_ai_platform,
                ai_platform_name = excluded.ai_platform_name,
                assessed_at = excluded.assessed_at,
                last_seen_at = excluded.last_seen_at,
                is_active = 1,
                missed_runs = 0
            "#,
            params![
                uuid::Uuid::new_v4().to_string(),
                organization_id,
                connection_id,
                run_id,
                candidate.external_id,
                candidate.name,
                candidate.type_hint.as_str(),
                "active",
                candidate.trigger_hint,
                to_json(&candidate.actions)?,
                to_json(&scopes)?,
                to_json(&candidate.owner_info)?,
                to_json(&metadata)?,
                risk.risk_level.as_str(),
                risk.risk_score,
                to_json(&risk.risk_factors)?,
                risk.is_ai_platform as i64,
                risk.ai_platform_name,
                ts(risk.assessed_at),
                ts(now),
            ],
        )?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    /// Distinct automation rows attributed to a run; the finalize step records
    /// this as the run's `automations_found`.
    pub fn count_run_automations(&self, run_id: &str) -> Result<u32, StoreError> {
        let conn = self.conn()?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM discovered_automations WHERE discovery_run_id = ?1",
            params![run_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Soft-deletion sweep run at finalize: active rows of this connection not
    /// touched by the completed run gain a missed-run tick; rows reaching the
    /// threshold flip `is_active = false`. No rows are removed.
    pub fn apply_missed_run_policy(
        &self,
        connection_id: &str,
        run_id: &str,
        threshold: u32,
    ) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE discovered_automations
            SET missed_runs = missed_runs + 1
            WHERE platform_connection_id = ?1 AND is_active = 1 AND discovery_run_id != ?2
            "#,
            params![connection_id, run_id],
        )?;
        let deactivated = conn.execute(
            r#"
            UPDATE discovered_automations
            SET is_active = 0
            WHERE platform_connection_id = ?1 AND is_active = 1 AND missed_runs >= ?2
            "#,
            params![connection_id, threshold],
        )?;
        Ok(deactivated as u64)
    }

    pub(crate) fn automation_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<DiscoveredAutomation> {
        let automation_type: String = r.get(6)?;
        let risk_level: String = r.get(13)?;
        let platform_type: Option<String> = r.get(22)?;
        Ok(DiscoveredAutomation {
            id: r.get(0)?,
            organization_id: r.get(1)?,
            connection_id: r.get(2)?,
            discovery_run_id: r.get(3)?,
            external_id: r.get(4)?,
            name: r.get(5)?,
            automation_type: AutomationType::parse(&automation_type)
                .unwrap_or(AutomationType::Integration),
            status: r.get(7)?,
            trigger_type: r.get(8)?,
            actions: from_json(r.get::<_, Option<String>>(9)?),
            permissions_required: from_json(r.get::<_, Option<String>>(10)?),
            owner_info: from_json::<OwnerInfo>(r.get::<_, Option<String>>(11)?),
            platform_metadata: from_json(r.get::<_, Option<String>>(12)?),
            risk: RiskAssessment {
                risk_level: RiskLevel::parse(&risk_level).unwrap_or(RiskLevel::Low),
                risk_score: r.get(14)?,
                risk_factors: from_json(r.get::<_, Option<String>>(15)?),
                is_ai_platform: r.get::<_, i64>(16)? != 0,
                ai_platform_name: r.get(17)?,
                assessed_at: parse_ts(&r.get::<_, String>(18)?),
            },
            first_discovered_at: parse_ts(&r.get::<_, String>(19)?),
            last_seen_at: parse_ts(&r.get::<_, String>(20)?),
            is_active: r.get::<_, i64>(21)? != 0,
            platform_type: platform_type.as_deref().and_then(PlatformType::parse),
        })
    }

    /// Column list shared by the read model; `platform_type` is joined from
    /// the connection and is NULL for deleted connections.
    pub(crate) const AUTOMATION_COLS: &'static str = "a.id, a.organization_id, a.platform_connection_id, \
        a.discovery_run_id, a.external_id, a.name, a.automation_type, a.status, a.trigger_type, \
        a.actions, a.permissions_required, a.owner_info, a.platform_metadata, a.risk_level, \
        a.risk_score, a.risk_factors, a.is_ai_platform, a.ai_platform_name, a.assessed_at, \
        a.first_discovered_at, a.last_seen_at, a.is_active, c.platform_type";

    /// Rewrites only the risk columns of one automation row. Used when the
    /// detector is re-run over stored evidence without re-collection.
    pub fn update_risk(
        &self,
        automation_id: &str,
        risk: &RiskAssessment,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE discovered_automations
            SET risk_level = ?1, risk_score = ?2, risk_factors = ?3,
                is_ai_platform = ?4, ai_platform_name = ?5, assessed_at = ?6
            WHERE id = ?7
            "#,
            params![
                risk.risk_level.as_str(),
                risk.risk_score,
                to_json(&risk.risk_factors)?,
                risk.is_ai_platform as i64,
                risk.ai_platform_name,
                ts(risk.assessed_at),
                automation_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("automation", automation_id.to_string()));
        }
        Ok(())
    }

    /// Every automation row of one organization, unpaginated. Feeds bulk
    /// re-assessment; the API layer goes through the paginated listing.
    pub fn all_automations(&self, org_id: &str) -> Result<Vec<DiscoveredAutomation>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM discovered_automations a \
             LEFT JOIN platform_connections c ON c.id = a.platform_connection_id \
             WHERE a.organization_id = ?1 ORDER BY a.id",
            Self::AUTOMATION_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![org_id], Self::automation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fetch one automation by identity (test and reconciliation seam).
    pub fn get_automation(
        &self,
        connection_id: &str,
        external_id: &str,
    ) -> Result<Option<DiscoveredAutomation>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM discovered_automations a \
             LEFT JOIN platform_connections c ON c.id = a.platform_connection_id \
             WHERE a.platform_connection_id = ?1 AND a.external_id = ?2",
            Self::AUTOMATION_COLS
        );
        let row = conn
            .query_row(&sql, params![connection_id, external_id], |r| {
                Self::automation_from_row(r)
            })
            .optional()?;
        Ok(row)
    }
}

// -----------------------------------------------------------------------------
// Persister — striped upsert serialization
// -----------------------------------------------------------------------------

/// Write-side wrapper serializing concurrent upserts per
/// `(connection_id, external_id)` via a striped lock, so two sub-methods
/// observing the same automation cannot interleave a re-observation.
pub struct Persister {
    store: Arc<InventoryStore>,
    stripes: Vec<tokio::sync::Mutex<()>>,
}

impl Persister {
    pub fn new(store: Arc<InventoryStore>, stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            store,
            stripes: (0..stripes).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    fn stripe_for(&self, connection_id: &str, external_id: &str) -> &tokio::sync::Mutex<()> {
        let mut hasher = DefaultHasher::new();
        connection_id.hash(&mut hasher);
        external_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[idx]
    }

    pub fn store(&self) -> &Arc<InventoryStore> {
        &self.store
    }

    /// Serialized upsert of one scored candidate.
    pub async fn persist(
        &self,
        organization_id: &str,
        connection_id: &str,
        run_id: &str,
        candidate: &crate::shared::RawCandidate,
        risk: &RiskAssessment,
    ) -> Result<UpsertOutcome, StoreError> {
        let _guard = self
            .stripe_for(connection_id, &candidate.external_id)
            .lock()
            .await;
        self.store
            .upsert_automation(organization_id, connection_id, run_id, candidate, risk)
    }
}
