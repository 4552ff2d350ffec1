//! Inventory read model.
//!
//! Serves the API layer: filtered listing with stable pagination, per-tenant
//! stats, and vendor grouping. Every listing goes through a LEFT JOIN on
//! `platform_connections` so each row exposes its connection's
//! `platform_type` — and a deleted connection yields `platform_type = NULL`
//! without dropping the automation row.
//!
//! Filter values arrive as raw strings from the API layer and are validated
//! here, before any authorization or query work.

use crate::error::StoreError;
use crate::inventory::InventoryStore;
use crate::shared::{AutomationType, DiscoveredAutomation, PlatformType, RiskLevel, VendorGroup};
use rusqlite::params_from_iter;
use std::collections::BTreeMap;

const DEFAULT_PAGE_LIMIT: u32 = 20;
const MAX_PAGE_LIMIT: u32 = 200;

/// Raw listing request as received from the API layer.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub platform_type: Option<String>,
    pub automation_type: Option<String>,
    pub risk_level: Option<String>,
    pub is_active: Option<bool>,
    /// Case-insensitive substring match on name and external id.
    pub search: Option<String>,
    pub group_by: Option<String>,
    /// 1-based page number.
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

/// Grouping mode after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    None,
    Vendor,
}

/// Validated listing parameters.
#[derive(Debug, Clone)]
pub struct ValidatedList {
    pub platform_type: Option<PlatformType>,
    pub automation_type: Option<AutomationType>,
    pub risk_level: Option<RiskLevel>,
    pub is_active: Option<bool>,
    pub search: Option<String>,
    pub group_by: GroupBy,
    pub page: u32,
    pub limit: u32,
}

impl ListRequest {
    /// Validates raw filter values. Rejection happens here, before any
    /// authorization or database work.
    pub fn validate(&self) -> Result<ValidatedList, StoreError> {
        let platform_type = match self.platform_type.as_deref() {
            None | Some("") => None,
            Some(s) => Some(PlatformType::parse(s).ok_or_else(|| {
                StoreError::InvalidFilter(format!("unknown platform_type: {s:?}"))
            })?),
        };
        let automation_type = match self.automation_type.as_deref() {
            None | Some("") => None,
            Some(s) => Some(AutomationType::parse(s).ok_or_else(|| {
                StoreError::InvalidFilter(format!("unknown automation_type: {s:?}"))
            })?),
        };
        let risk_level = match self.risk_level.as_deref() {
            None | Some("") => None,
            Some(s) => Some(
                RiskLevel::parse(s)
                    .ok_or_else(|| StoreError::InvalidFilter(format!("unknown risk_level: {s:?}")))?,
            ),
        };
        let group_by = match self.group_by.as_deref() {
            None | Some("") | Some("none") => GroupBy::None,
            Some("vendor") => GroupBy::Vendor,
            Some(s) => {
                return Err(StoreError::InvalidFilter(format!(
                    "unknown group_by: {s:?} (expected \"none\" or \"vendor\")"
                )))
            }
        };
        let page = self.page.unwrap_or(1);
        if page == 0 {
            return Err(StoreError::InvalidFilter("page must be >= 1".into()));
        }
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(StoreError::InvalidFilter(format!(
                "limit must be in 1..={MAX_PAGE_LIMIT}"
            )));
        }
        Ok(ValidatedList {
            platform_type,
            automation_type,
            risk_level,
            is_active: self.is_active,
            search: self
                .search
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            group_by,
            page,
            limit,
        })
    }
}

/// One page of listing results.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u32,
}

/// Aggregated inventory counts for one organization.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct InventoryStats {
    pub total: u32,
    /// Per joined platform type; rows with a deleted connection count under `"unknown"`.
    pub by_platform: BTreeMap<String, u32>,
    pub by_risk_level: BTreeMap<String, u32>,
    pub by_automation_type: BTreeMap<String, u32>,
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

impl InventoryStore {
    /// Filtered, paginated listing for one organization. Ordering is
    /// `last_seen_at DESC, first_discovered_at DESC, id` so paging is
    /// deterministic across identical snapshots.
    pub fn list_automations(
        &self,
        org_id: &str,
        filter: &ValidatedList,
    ) -> Result<Page<DiscoveredAutomation>, StoreError> {
        let mut where_sql = String::from("a.organization_id = ?");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(org_id.to_string())];

        if let Some(pt) = filter.platform_type {
            where_sql.push_str(" AND c.platform_type = ?");
            args.push(Box::new(pt.as_str().to_string()));
        }
        if let Some(at) = filter.automation_type {
            where_sql.push_str(" AND a.automation_type = ?");
            args.push(Box::new(at.as_str().to_string()));
        }
        if let Some(rl) = filter.risk_level {
            where_sql.push_str(" AND a.risk_level = ?");
            args.push(Box::new(rl.as_str().to_string()));
        }
        if let Some(active) = filter.is_active {
            where_sql.push_str(" AND a.is_active = ?");
            args.push(Box::new(active as i64));
        }
        if let Some(ref search) = filter.search {
            where_sql.push_str(
                " AND (a.name LIKE ? ESCAPE '\\' OR a.external_id LIKE ? ESCAPE '\\')",
            );
            let needle = format!("%{}%", escape_like(search));
            args.push(Box::new(needle.clone()));
            args.push(Box::new(needle));
        }

        let conn = self.conn()?;
        let count_sql = format!(
            "SELECT COUNT(*) FROM discovered_automations a \
             LEFT JOIN platform_connections c ON c.id = a.platform_connection_id \
             WHERE {where_sql}"
        );
        let total: u32 = conn.query_row(
            &count_sql,
            params_from_iter(args.iter().map(|a| a.as_ref())),
            |r| r.get(0),
        )?;

        let offset = (filter.page - 1) as i64 * filter.limit as i64;
        let list_sql = format!(
            "SELECT {} FROM discovered_automations a \
             LEFT JOIN platform_connections c ON c.id = a.platform_connection_id \
             WHERE {where_sql} \
             ORDER BY a.last_seen_at DESC, a.first_discovered_at DESC, a.id \
             LIMIT {} OFFSET {}",
            Self::AUTOMATION_COLS,
            filter.limit,
            offset,
        );
        let mut stmt = conn.prepare(&list_sql)?;
        let items = stmt
            .query_map(params_from_iter(args.iter().map(|a| a.as_ref())), |r| {
                Self::automation_from_row(r)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            page: filter.page,
            limit: filter.limit,
            total,
        })
    }

    /// Per-platform, per-risk-level, and per-type counts for one organization.
    pub fn automation_stats(&self, org_id: &str) -> Result<InventoryStats, StoreError> {
        let conn = self.conn()?;
        let mut stats = InventoryStats::default();

        stats.total = conn.query_row(
            "SELECT COUNT(*) FROM discovered_automations WHERE organization_id = ?1",
            [org_id],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT COALESCE(c.platform_type, 'unknown'), COUNT(*) \
             FROM discovered_automations a \
             LEFT JOIN platform_connections c ON c.id = a.platform_connection_id \
             WHERE a.organization_id = ?1 GROUP BY 1",
        )?;
        let rows = stmt.query_map([org_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?;
        for row in rows {
            let (k, v) = row?;
            stats.by_platform.insert(k, v);
        }

        let mut stmt = conn.prepare(
            "SELECT risk_level, COUNT(*) FROM discovered_automations \
             WHERE organization_id = ?1 GROUP BY risk_level",
        )?;
        let rows = stmt.query_map([org_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?;
        for row in rows {
            let (k, v) = row?;
            stats.by_risk_level.insert(k, v);
        }

        let mut stmt = conn.prepare(
            "SELECT automation_type, COUNT(*) FROM discovered_automations \
             WHERE organization_id = ?1 GROUP BY automation_type",
        )?;
        let rows = stmt.query_map([org_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?;
        for row in rows {
            let (k, v) = row?;
            stats.by_automation_type.insert(k, v);
        }

        Ok(stats)
    }

    /// Groups an organization's automations by `(vendor_name, platform_type)`.
    /// The vendor name derives from the AI-signal output when present, else
    /// from the normalized automation name. Groups are sorted by descending
    /// risk, then descending size, then name.
    pub fn group_by_vendor(&self, org_id: &str) -> Result<Vec<VendorGroup>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM discovered_automations a \
             LEFT JOIN platform_connections c ON c.id = a.platform_connection_id \
             WHERE a.organization_id = ?1 \
             ORDER BY a.last_seen_at DESC, a.first_discovered_at DESC, a.id",
            Self::AUTOMATION_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([org_id], |r| Self::automation_from_row(r))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut groups: BTreeMap<(String, Option<String>), VendorGroup> = BTreeMap::new();
        for automation in rows {
            let (vendor_name, is_ai_vendor) = match automation.risk.ai_platform_name {
                Some(ref vendor) => (vendor.clone(), true),
                None => (normalize_vendor_name(&automation.name), false),
            };
            let key = (
                vendor_name.to_lowercase(),
                automation.platform_type.map(|p| p.as_str().to_string()),
            );
            let entry = groups.entry(key).or_insert_with(|| VendorGroup {
                vendor_name,
                platform_type: automation.platform_type,
                count: 0,
                highest_risk_level: RiskLevel::Low,
                is_ai_vendor,
                automations: Vec::new(),
            });
            entry.count += 1;
            entry.is_ai_vendor |= is_ai_vendor;
            if automation.risk.risk_level > entry.highest_risk_level {
                entry.highest_risk_level = automation.risk.risk_level;
            }
            entry.automations.push(automation);
        }

        let mut out: Vec<VendorGroup> = groups.into_values().collect();
        out.sort_by(|a, b| {
            b.highest_risk_level
                .cmp(&a.highest_risk_level)
                .then_with(|| b.count.cmp(&a.count))
                .then_with(|| a.vendor_name.cmp(&b.vendor_name))
        });
        Ok(out)
    }
}

/// Normalizes an automation name into a vendor label: trimmed, whitespace
/// collapsed. Non-AI vendors keep their platform-reported casing.
fn normalize_vendor_name(name: &str) -> String {
    let collapsed: Vec<&str> = name.split_whitespace().collect();
    if collapsed.is_empty() {
        "unknown".to_string()
    } else {
        collapsed.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_unknown_group_by_before_anything_else() {
        let req = ListRequest {
            group_by: Some("invalid".into()),
            ..Default::default()
        };
        match req.validate() {
            Err(StoreError::InvalidFilter(msg)) => assert!(msg.contains("group_by")),
            other => panic!("expected InvalidFilter, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_bad_enum_values_and_bounds() {
        assert!(ListRequest {
            platform_type: Some("mainframe".into()),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ListRequest {
            risk_level: Some("severe".into()),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ListRequest {
            page: Some(0),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ListRequest {
            limit: Some(0),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ListRequest {
            limit: Some(100_000),
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn validate_defaults() {
        let v = ListRequest::default().validate().unwrap();
        assert_eq!(v.page, 1);
        assert_eq!(v.limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(v.group_by, GroupBy::None);
        assert!(v.platform_type.is_none());
    }

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("50%_done\\x"), "50\\%\\_done\\\\x");
    }

    #[test]
    fn vendor_name_normalization() {
        assert_eq!(normalize_vendor_name("  Zapier   Inc  "), "Zapier Inc");
        assert_eq!(normalize_vendor_name(""), "unknown");
    }
}
