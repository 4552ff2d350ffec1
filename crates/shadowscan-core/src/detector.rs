//! AI-signal detection over candidate evidence.
//!
//! Deterministic classifier: given a candidate's name, external id, observed
//! scopes, and raw evidence blob, decide whether it integrates with a known
//! AI platform. The vendor catalog (tokens, hostnames, key prefixes, scope
//! sensitivity) is configuration loaded from TOML, so the detector can be
//! re-run over historical evidence without re-collection and without code
//! changes when vendors ship new products.
//!
//! Rules, evaluated in order (first match wins for the vendor attribution,
//! all matched signals accumulate):
//! 1. name or external id contains a vendor token (case-insensitive)
//! 2. raw evidence contains a vendor API hostname or API-key prefix
//! 3. a sensitive scope combined with (1) or (2) raises confidence

use crate::error::StoreError;
use crate::shared::RawCandidate;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Confidence granted by a vendor-token match in name/external id.
const TOKEN_MATCH_CONFIDENCE: u8 = 80;
/// Confidence granted by an AI hostname or key prefix in raw evidence.
const EVIDENCE_MATCH_CONFIDENCE: u8 = 75;
/// Boost when a sensitive scope accompanies another signal.
const SENSITIVE_SCOPE_BOOST: u8 = 15;

/// Coarse vendor family reported with a positive signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiPlatformType {
    Openai,
    Anthropic,
    GoogleAi,
    MicrosoftAi,
    Perplexity,
    Other,
}

/// One curated vendor entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorEntry {
    pub name: String,
    pub display_name: String,
    pub vendor_type: AiPlatformType,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub key_prefixes: Vec<String>,
}

/// Scope patterns per sensitivity category. A scope matches a pattern when it
/// equals it, ends with it, or extends it with a `.` segment — so both dotted
/// short forms (`drive.readonly`) and full scope URLs match, while a bare
/// word like `drive` stays non-sensitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeSensitivity {
    #[serde(default)]
    pub drive: Vec<String>,
    #[serde(default)]
    pub mail: Vec<String>,
    #[serde(default)]
    pub calendar: Vec<String>,
    #[serde(default)]
    pub admin: Vec<String>,
}

impl ScopeSensitivity {
    fn pattern_matches(scope: &str, pattern: &str) -> bool {
        let scope = scope.to_lowercase();
        let pattern = pattern.to_lowercase();
        scope == pattern
            || scope.ends_with(&pattern)
            || scope.starts_with(&format!("{pattern}."))
    }

    fn category_matches<'a>(
        patterns: &[String],
        scopes: impl Iterator<Item = &'a String>,
    ) -> Vec<String> {
        scopes
            .filter(|s| patterns.iter().any(|p| Self::pattern_matches(s, p)))
            .cloned()
            .collect()
    }

    /// Scopes in `scopes` that fall into the drive category, and likewise for
    /// the other accessors. Used by both the detector (any-sensitive check)
    /// and the risk scorer (per-category counts).
    pub fn drive_matches(&self, scopes: &BTreeSet<String>) -> Vec<String> {
        Self::category_matches(&self.drive, scopes.iter())
    }

    pub fn mail_matches(&self, scopes: &BTreeSet<String>) -> Vec<String> {
        Self::category_matches(&self.mail, scopes.iter())
    }

    pub fn calendar_matches(&self, scopes: &BTreeSet<String>) -> Vec<String> {
        Self::category_matches(&self.calendar, scopes.iter())
    }

    pub fn admin_matches(&self, scopes: &BTreeSet<String>) -> Vec<String> {
        Self::category_matches(&self.admin, scopes.iter())
    }

    pub fn any_sensitive(&self, scopes: &BTreeSet<String>) -> bool {
        !self.drive_matches(scopes).is_empty()
            || !self.mail_matches(scopes).is_empty()
            || !self.calendar_matches(scopes).is_empty()
            || !self.admin_matches(scopes).is_empty()
    }
}

/// Curated AI-vendor catalog. Configuration, not code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorCatalog {
    #[serde(default)]
    pub vendors: Vec<VendorEntry>,
    #[serde(default)]
    pub automation_platform_tokens: Vec<String>,
    #[serde(default)]
    pub scope_sensitivity: ScopeSensitivity,
}

static BUILTIN_CATALOG: Lazy<VendorCatalog> = Lazy::new(|| {
    toml::from_str(include_str!("../resources/ai_vendors.toml"))
        .expect("embedded vendor catalog is valid TOML")
});

impl VendorCatalog {
    /// The embedded default catalog.
    pub fn builtin() -> Self {
        BUILTIN_CATALOG.clone()
    }

    /// Loads a catalog from a TOML file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StoreError::InvalidFilter(format!(
                "vendor catalog unreadable at {}: {e}",
                path.as_ref().display()
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| StoreError::InvalidFilter(format!("vendor catalog parse error: {e}")))
    }

    /// Loads from the configured path when set, else the embedded default.
    pub fn load(path: Option<&str>) -> Self {
        match path {
            Some(p) => match Self::load_from_path(p) {
                Ok(catalog) => catalog,
                Err(e) => {
                    tracing::warn!(
                        target: "shadowscan::detector",
                        error = %e,
                        "falling back to embedded vendor catalog"
                    );
                    Self::builtin()
                }
            },
            None => Self::builtin(),
        }
    }

    /// True when the name/evidence mentions a third-party automation platform.
    pub fn mentions_automation_platform(&self, haystacks: &[&str]) -> bool {
        self.automation_platform_tokens.iter().any(|token| {
            let token = token.to_lowercase();
            haystacks.iter().any(|h| h.to_lowercase().contains(&token))
        })
    }
}

/// Detection verdict for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSignal {
    pub is_ai_platform: bool,
    pub ai_platform_name: Option<String>,
    /// Catalog slug of the matched vendor (e.g. `openai`); feeds risk factors.
    pub ai_platform_vendor: Option<String>,
    pub ai_platform_type: Option<AiPlatformType>,
    /// 0–100.
    pub confidence: u8,
    /// All matched signals in evaluation order.
    pub detected_signals: Vec<String>,
}

impl AiSignal {
    fn none() -> Self {
        Self {
            is_ai_platform: false,
            ai_platform_name: None,
            ai_platform_vendor: None,
            ai_platform_type: None,
            confidence: 0,
            detected_signals: Vec::new(),
        }
    }
}

/// Deterministic AI-signal detector over a vendor catalog.
pub struct AiSignalDetector {
    catalog: VendorCatalog,
    confidence_threshold: u8,
}

impl AiSignalDetector {
    pub fn new(catalog: VendorCatalog, confidence_threshold: u8) -> Self {
        Self {
            catalog,
            confidence_threshold,
        }
    }

    pub fn catalog(&self) -> &VendorCatalog {
        &self.catalog
    }

    /// Classifies one candidate. Pure function of the candidate and catalog.
    pub fn detect(&self, candidate: &RawCandidate) -> AiSignal {
        let mut signal = AiSignal::none();
        let name = candidate.name.to_lowercase();
        let external_id = candidate.external_id.to_lowercase();
        let evidence = candidate.raw_evidence.to_lowercase();

        // Rule 1: vendor token in name or external id.
        for vendor in &self.catalog.vendors {
            for token in &vendor.tokens {
                let token_lc = token.to_lowercase();
                if name.contains(&token_lc) || external_id.contains(&token_lc) {
                    signal
                        .detected_signals
                        .push(format!("vendor token match: {token} ({})", vendor.name));
                    if signal.ai_platform_name.is_none() {
                        signal.ai_platform_name = Some(vendor.display_name.clone());
                        signal.ai_platform_vendor = Some(vendor.name.clone());
                        signal.ai_platform_type = Some(vendor.vendor_type);
                    }
                    signal.confidence = signal.confidence.max(TOKEN_MATCH_CONFIDENCE);
                }
            }
        }

        // Rule 2: AI API hostname in evidence.
        if !evidence.is_empty() {
            for vendor in &self.catalog.vendors {
                for host in &vendor.hostnames {
                    if evidence.contains(&host.to_lowercase()) {
                        signal
                            .detected_signals
                            .push(format!("AI hostname in evidence: {host} ({})", vendor.name));
                        if signal.ai_platform_name.is_none() {
                            signal.ai_platform_name = Some(vendor.display_name.clone());
                            signal.ai_platform_vendor = Some(vendor.name.clone());
                            signal.ai_platform_type = Some(vendor.vendor_type);
                        }
                        signal.confidence = signal.confidence.max(EVIDENCE_MATCH_CONFIDENCE);
                    }
                }
            }

            // Key prefixes, longest first so `sk-ant-` attributes to Anthropic
            // before the generic `sk-` catches it.
            let mut prefixed: Vec<(&VendorEntry, &String)> = self
                .catalog
                .vendors
                .iter()
                .flat_map(|v| v.key_prefixes.iter().map(move |p| (v, p)))
                .collect();
            prefixed.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.name.cmp(&b.0.name)));
            for (vendor, prefix) in prefixed {
                if evidence.contains(&prefix.to_lowercase()) {
                    signal
                        .detected_signals
                        .push(format!("API key prefix in evidence: {prefix} ({})", vendor.name));
                    if signal.ai_platform_name.is_none() {
                        signal.ai_platform_name = Some(vendor.display_name.clone());
                        signal.ai_platform_vendor = Some(vendor.name.clone());
                        signal.ai_platform_type = Some(vendor.vendor_type);
                    }
                    signal.confidence = signal.confidence.max(EVIDENCE_MATCH_CONFIDENCE);
                    break;
                }
            }
        }

        // Rule 3: sensitive scope in combination with an earlier signal.
        if signal.confidence > 0
            && self
                .catalog
                .scope_sensitivity
                .any_sensitive(&candidate.scopes)
        {
            signal
                .detected_signals
                .push("sensitive scope granted alongside AI signal".to_string());
            signal.confidence = signal.confidence.saturating_add(SENSITIVE_SCOPE_BOOST).min(100);
        }

        signal.is_ai_platform = signal.confidence >= self.confidence_threshold;
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{AutomationType, OwnerInfo, SourceMethod};

    fn candidate(name: &str, external_id: &str, scopes: &[&str], evidence: &str) -> RawCandidate {
        RawCandidate {
            external_id: external_id.to_string(),
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

    fn detector() -> AiSignalDetector {
        AiSignalDetector::new(VendorCatalog::builtin(), 70)
    }

    #[test]
    fn chatgpt_by_name_with_sensitive_scope() {
        let d = detector();
        let c = candidate(
            "ChatGPT",
            "77377267392-xxx.apps.googleusercontent.com",
            &["drive.readonly", "userinfo.email", "userinfo.profile", "openid"],
            "",
        );
        let s = d.detect(&c);
        assert!(s.is_ai_platform);
        assert_eq!(s.ai_platform_name.as_deref(), Some("OpenAI / ChatGPT"));
        assert_eq!(s.ai_platform_type, Some(AiPlatformType::Openai));
        assert_eq!(s.confidence, 95); // 80 token + 15 sensitive-scope boost
        assert!(s.detected_signals.len() >= 2);
    }

    #[test]
    fn plain_app_is_not_ai() {
        let d = detector();
        let c = candidate("Test App", "123.apps.example.com", &["email", "profile", "drive"], "");
        let s = d.detect(&c);
        assert!(!s.is_ai_platform);
        assert_eq!(s.confidence, 0);
        assert!(s.detected_signals.is_empty());
        assert!(s.ai_platform_name.is_none());
    }

    #[test]
    fn hostname_in_script_evidence_crosses_threshold_alone() {
        let d = detector();
        let c = candidate(
            "nightly-sync",
            "script-9",
            &[],
            "function run() { UrlFetchApp.fetch('https://api.openai.com/v1/chat/completions'); }",
        );
        let s = d.detect(&c);
        assert!(s.is_ai_platform);
        assert_eq!(s.confidence, 75);
        assert_eq!(s.ai_platform_name.as_deref(), Some("OpenAI / ChatGPT"));
    }

    #[test]
    fn anthropic_key_prefix_wins_over_generic() {
        let d = detector();
        let c = candidate(
            "exporter",
            "script-12",
            &[],
            "const KEY = 'sk-ant-api03-abcdef';",
        );
        let s = d.detect(&c);
        assert!(s.is_ai_platform);
        assert_eq!(s.ai_platform_type, Some(AiPlatformType::Anthropic));
    }

    #[test]
    fn sensitive_scope_alone_is_no_signal() {
        let d = detector();
        let c = candidate("Backup Tool", "backup-1", &["drive.readonly", "gmail.readonly"], "");
        let s = d.detect(&c);
        assert!(!s.is_ai_platform);
        assert_eq!(s.confidence, 0);
    }

    #[test]
    fn detection_is_deterministic() {
        let d = detector();
        let c = candidate(
            "Claude for Sheets",
            "app-7",
            &["drive.readonly"],
            "https://api.anthropic.com/v1/messages",
        );
        let first = d.detect(&c);
        for _ in 0..10 {
            let again = d.detect(&c);
            assert_eq!(again.confidence, first.confidence);
            assert_eq!(again.detected_signals, first.detected_signals);
            assert_eq!(again.ai_platform_name, first.ai_platform_name);
        }
    }

    #[test]
    fn scope_pattern_excludes_bare_words() {
        let sens = VendorCatalog::builtin().scope_sensitivity;
        let scopes: BTreeSet<String> = ["drive".to_string()].into_iter().collect();
        assert!(sens.drive_matches(&scopes).is_empty());
        let scopes: BTreeSet<String> =
            ["https://www.googleapis.com/auth/drive.readonly".to_string()]
                .into_iter()
                .collect();
        assert_eq!(sens.drive_matches(&scopes).len(), 1);
    }

    #[test]
    fn automation_platform_tokens_match() {
        let catalog = VendorCatalog::builtin();
        assert!(catalog.mentions_automation_platform(&["Zapier Interface", ""]));
        assert!(!catalog.mentions_automation_platform(&["Quarterly Report Bot", ""]));
    }
}
