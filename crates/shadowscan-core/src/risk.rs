//! Risk scoring — a total, deterministic function over scored evidence.
//!
//! `risk_factors` is an ordered list of human-readable reasons; the ordering
//! is part of the public contract and must be stable across runs for the same
//! inputs. An AI-platform match overrides the additive model with a fixed
//! score and `high` level.

use crate::detector::{AiSignal, VendorCatalog};
use crate::shared::{AutomationType, RawCandidate, RiskAssessment, RiskLevel};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Scope count at which "k OAuth scopes granted" becomes a factor.
const SCOPE_COUNT_FACTOR_MIN: usize = 5;
/// Additive model: base score plus per-factor weight, capped at 100.
const BASE_SCORE: u8 = 30;
const FACTOR_WEIGHT: u8 = 15;

/// Per-connection context the scorer needs beyond the candidate itself.
#[derive(Debug, Clone, Default)]
pub struct ScoreContext {
    /// Project/tenant the connection's workspace belongs to, when known.
    /// Service accounts owned by a different project gain a factor.
    pub workspace_project: Option<String>,
}

/// Deterministic risk scorer over the shared vendor catalog.
pub struct RiskScorer {
    catalog: Arc<VendorCatalog>,
    ai_platform_score: u8,
}

impl RiskScorer {
    pub fn new(catalog: Arc<VendorCatalog>, ai_platform_score: u8) -> Self {
        Self {
            catalog,
            ai_platform_score,
        }
    }

    /// Scores one candidate. Pure function of (candidate, signal, context,
    /// catalog): identical inputs always produce identical output.
    pub fn score(
        &self,
        candidate: &RawCandidate,
        signal: &AiSignal,
        ctx: &ScoreContext,
    ) -> RiskAssessment {
        let mut factors: Vec<String> = Vec::new();
        let sens = &self.catalog.scope_sensitivity;

        if signal.is_ai_platform {
            let vendor = signal
                .ai_platform_vendor
                .as_deref()
                .unwrap_or("unknown");
            factors.push(format!("AI platform integration: {vendor}"));
        }

        let scope_count = candidate.scopes.len();
        if scope_count >= SCOPE_COUNT_FACTOR_MIN {
            factors.push(format!("{scope_count} OAuth scopes granted"));
        }

        let drive = sens.drive_matches(&candidate.scopes);
        if !drive.is_empty() {
            factors.push(format!("Drive access: {} scope(s)", drive.len()));
        }
        let mail = sens.mail_matches(&candidate.scopes);
        if !mail.is_empty() {
            factors.push(format!("Mail access: {} scope(s)", mail.len()));
        }
        let admin = sens.admin_matches(&candidate.scopes);
        if !admin.is_empty() {
            factors.push(format!("Admin access: {} scope(s)", admin.len()));
        }

        if self
            .catalog
            .mentions_automation_platform(&[&candidate.name, &candidate.raw_evidence])
        {
            factors.push("Third-party automation platform detected".to_string());
        }

        for host in external_fetch_hosts(&candidate.raw_evidence) {
            factors.push(format!("External URL fetch: {host}"));
        }

        if candidate.type_hint == AutomationType::ServiceAccount {
            if let Some(ref project) = candidate.owner_info.project_id {
                let external = match ctx.workspace_project {
                    Some(ref own) => !own.eq_ignore_ascii_case(project),
                    None => true,
                };
                if external {
                    factors.push("Service account belongs to external project".to_string());
                }
            }
        }

        let (risk_score, risk_level) = if signal.is_ai_platform {
            (self.ai_platform_score, RiskLevel::High)
        } else {
            let score = BASE_SCORE.saturating_add(
                FACTOR_WEIGHT.saturating_mul(factors.len().min(255) as u8),
            );
            let score = score.min(100);
            let level = match factors.len() {
                0 => RiskLevel::Low,
                1 | 2 => RiskLevel::Medium,
                3 | 4 => RiskLevel::High,
                _ => RiskLevel::Critical,
            };
            (score, level)
        };

        RiskAssessment {
            risk_level,
            risk_score,
            risk_factors: factors,
            is_ai_platform: signal.is_ai_platform,
            ai_platform_name: signal.ai_platform_name.clone(),
            assessed_at: Utc::now(),
        }
    }
}

/// Extracts distinct external hosts referenced by `http(s)://` URLs in script
/// evidence, sorted lexicographically for stable factor ordering.
fn external_fetch_hosts(evidence: &str) -> Vec<String> {
    let mut hosts: BTreeSet<String> = BTreeSet::new();
    let lower = evidence.to_lowercase();
    for marker in ["https://", "http://"] {
        let mut rest = lower.as_str();
        while let Some(pos) = rest.find(marker) {
            let after = &rest[pos + marker.len()..];
            let host: String = after
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
                .collect();
            if host.contains('.') {
                hosts.insert(host);
            }
            rest = after;
        }
    }
    hosts.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::AiSignalDetector;
    use crate::shared::{OwnerInfo, SourceMethod};

    fn candidate(name: &str, scopes: &[&str], evidence: &str) -> RawCandidate {
        RawCandidate {
            external_id: format!("ext-{name}"),
            name: name.to_string(),
            type_hint: AutomationType::Integration,
            source_method: SourceMethod::OauthAppInventory,
            trigger_hint: None,
            actions: vec![],
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            owner_info: OwnerInfo::default(),
            modified_at: None,
            platform_metadata: serde_json::Value::Null,
            raw_evidence: evidence.to_string(),
        }
    }

    fn scorer() -> (AiSignalDetector, RiskScorer) {
        let catalog = Arc::new(VendorCatalog::builtin());
        (
            AiSignalDetector::new((*catalog).clone(), 70),
            RiskScorer::new(catalog, 85),
        )
    }

    #[test]
    fn ai_platform_override_is_exact() {
        let (detector, scorer) = scorer();
        let c = candidate("ChatGPT", &["drive.readonly", "userinfo.email"], "");
        let signal = detector.detect(&c);
        let risk = scorer.score(&c, &signal, &ScoreContext::default());
        assert!(risk.is_ai_platform);
        assert_eq!(risk.risk_score, 85);
        assert_eq!(risk.risk_level, RiskLevel::High);
        assert!(risk
            .risk_factors
            .contains(&"AI platform integration: openai".to_string()));
    }

    #[test]
    fn zero_factors_is_low_thirty() {
        let (detector, scorer) = scorer();
        let c = candidate("Test App", &["email", "profile", "drive"], "");
        let signal = detector.detect(&c);
        let risk = scorer.score(&c, &signal, &ScoreContext::default());
        assert!(!risk.is_ai_platform);
        assert!(risk.risk_factors.is_empty());
        assert_eq!(risk.risk_score, 30);
        assert_eq!(risk.risk_level, RiskLevel::Low);
    }

    #[test]
    fn factor_counts_map_to_levels() {
        let (detector, scorer) = scorer();

        // One factor: drive-sensitive scope.
        let c = candidate("Sync Tool", &["drive.readonly"], "");
        let risk = scorer.score(&c, &detector.detect(&c), &ScoreContext::default());
        assert_eq!(risk.risk_factors.len(), 1);
        assert_eq!(risk.risk_score, 45);
        assert_eq!(risk.risk_level, RiskLevel::Medium);

        // Three factors: scope count, drive, mail.
        let c = candidate(
            "Backup Suite",
            &["drive.readonly", "gmail.readonly", "calendar.readonly", "email", "openid"],
            "",
        );
        let risk = scorer.score(&c, &detector.detect(&c), &ScoreContext::default());
        assert_eq!(risk.risk_factors.len(), 3, "{:?}", risk.risk_factors);
        assert_eq!(risk.risk_score, 75);
        assert_eq!(risk.risk_level, RiskLevel::High);

        // Five factors reach critical.
        let c = candidate(
            "Zapier Mega Connector",
            &[
                "drive.readonly",
                "gmail.modify",
                "admin.directory.user",
                "calendar.events",
                "email",
            ],
            "fetch('https://hooks.example-relay.com/x')",
        );
        let risk = scorer.score(&c, &detector.detect(&c), &ScoreContext::default());
        assert!(risk.risk_factors.len() >= 5, "{:?}", risk.risk_factors);
        assert_eq!(risk.risk_level, RiskLevel::Critical);
        assert_eq!(risk.risk_score, 100.min(30 + 15 * risk.risk_factors.len() as u8));
    }

    #[test]
    fn factor_order_is_stable() {
        let (detector, scorer) = scorer();
        let mut c = candidate(
            "Zapier GPT-4 bridge",
            &[
                "drive.readonly",
                "gmail.modify",
                "admin.directory.user",
                "email",
                "openid",
                "profile",
            ],
            "POST https://api.openai.com/v1/chat/completions and https://alt-relay.io/hook",
        );
        c.type_hint = AutomationType::Script;
        let signal = detector.detect(&c);
        let first = scorer.score(&c, &signal, &ScoreContext::default());
        for _ in 0..5 {
            let again = scorer.score(&c, &signal, &ScoreContext::default());
            assert_eq!(again.risk_factors, first.risk_factors);
            assert_eq!(again.risk_score, first.risk_score);
            assert_eq!(again.risk_level, first.risk_level);
        }
        // AI factor leads; URL-fetch factors are sorted by host.
        assert_eq!(first.risk_factors[0], "AI platform integration: openai");
        let url_factors: Vec<&String> = first
            .risk_factors
            .iter()
            .filter(|f| f.starts_with("External URL fetch:"))
            .collect();
        assert_eq!(
            url_factors,
            vec![
                "External URL fetch: alt-relay.io",
                "External URL fetch: api.openai.com"
            ]
        );
    }

    #[test]
    fn external_service_account_gains_factor() {
        let (detector, scorer) = scorer();
        let mut c = candidate("ci-deployer", &[], "");
        c.type_hint = AutomationType::ServiceAccount;
        c.owner_info.project_id = Some("vendor-project-123".into());
        let ctx = ScoreContext {
            workspace_project: Some("acme-prod".into()),
        };
        let risk = scorer.score(&c, &detector.detect(&c), &ctx);
        assert!(risk
            .risk_factors
            .contains(&"Service account belongs to external project".to_string()));

        // Same project: no factor.
        let ctx = ScoreContext {
            workspace_project: Some("vendor-project-123".into()),
        };
        let risk = scorer.score(&c, &detector.detect(&c), &ctx);
        assert!(risk.risk_factors.is_empty());
    }

    #[test]
    fn host_extraction_dedupes_and_sorts() {
        let hosts = external_fetch_hosts(
            "https://b.example.com/a https://a.example.com/z http://b.example.com/q notaurl",
        );
        assert_eq!(hosts, vec!["a.example.com", "b.example.com"]);
        assert!(external_fetch_hosts("no urls here").is_empty());
    }
}
