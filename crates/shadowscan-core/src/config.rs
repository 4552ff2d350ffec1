//! Pipeline configuration loaded from environment.
//!
//! Every knob has a safe default; unset or malformed values fall back silently
//! so a bare environment still runs. Change behavior without code edits.

use std::time::Duration;

/// Discovery pipeline configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | SHADOWSCAN_SESSION_TIMEOUT_SECS | 300 | Hard deadline per discovery session. |
/// | SHADOWSCAN_SUBMETHOD_TIMEOUT_SECS | 30 | Timeout per collector sub-method. |
/// | SHADOWSCAN_MAX_CANDIDATE_BACKLOG | 256 | Bounded channel capacity between collectors and scoring. |
/// | SHADOWSCAN_REFRESH_WINDOW_SECS | 300 | Refresh a token expiring within this window. |
/// | SHADOWSCAN_AI_CONFIDENCE_THRESHOLD | 70 | Minimum detector confidence for `is_ai_platform`. |
/// | SHADOWSCAN_VENDOR_CATALOG | (embedded) | Path to the AI vendor catalog TOML. |
/// | SHADOWSCAN_AI_PLATFORM_SCORE | 85 | Fixed risk score for AI-platform automations. |
/// | SHADOWSCAN_PER_HOST_RPS | 5.0 | Token-bucket refill rate per platform host. |
/// | SHADOWSCAN_PERSISTER_STRIPES | 256 | Striped-lock count for per-automation upsert serialization. |
/// | SHADOWSCAN_MISSED_RUNS_TO_DEACTIVATE | 3 | Consecutive missed runs before `is_active = false`. |
/// | SHADOWSCAN_EXPOSE_TECHNICAL_ERRORS | false | Include diagnostic detail in `discovery.failed` events. |
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub session_timeout: Duration,
    pub submethod_timeout: Duration,
    pub max_candidate_backlog: usize,
    pub refresh_window: Duration,
    pub ai_confidence_threshold: u8,
    pub vendor_catalog_path: Option<String>,
    pub ai_platform_score: u8,
    pub per_host_rps: f64,
    pub persister_stripes: usize,
    pub missed_runs_to_deactivate: u32,
    pub expose_technical_errors: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(300),
            submethod_timeout: Duration::from_secs(30),
            max_candidate_backlog: 256,
            refresh_window: Duration::from_secs(300),
            ai_confidence_threshold: 70,
            vendor_catalog_path: None,
            ai_platform_score: 85,
            per_host_rps: 5.0,
            persister_stripes: 256,
            missed_runs_to_deactivate: 3,
            expose_technical_errors: false,
        }
    }
}

impl DiscoveryConfig {
    /// Load from environment. Unset or invalid => defaults (see struct docs).
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            session_timeout: env_duration_secs("SHADOWSCAN_SESSION_TIMEOUT_SECS", d.session_timeout),
            submethod_timeout: env_duration_secs(
                "SHADOWSCAN_SUBMETHOD_TIMEOUT_SECS",
                d.submethod_timeout,
            ),
            max_candidate_backlog: env_usize(
                "SHADOWSCAN_MAX_CANDIDATE_BACKLOG",
                d.max_candidate_backlog,
            )
            .max(1),
            refresh_window: env_duration_secs("SHADOWSCAN_REFRESH_WINDOW_SECS", d.refresh_window),
            ai_confidence_threshold: env_u8(
                "SHADOWSCAN_AI_CONFIDENCE_THRESHOLD",
                d.ai_confidence_threshold,
            )
            .min(100),
            vendor_catalog_path: env_opt_string("SHADOWSCAN_VENDOR_CATALOG"),
            ai_platform_score: env_u8("SHADOWSCAN_AI_PLATFORM_SCORE", d.ai_platform_score).min(100),
            per_host_rps: env_f64("SHADOWSCAN_PER_HOST_RPS", d.per_host_rps).max(0.1),
            persister_stripes: env_usize("SHADOWSCAN_PERSISTER_STRIPES", d.persister_stripes)
                .max(1),
            missed_runs_to_deactivate: env_u32(
                "SHADOWSCAN_MISSED_RUNS_TO_DEACTIVATE",
                d.missed_runs_to_deactivate,
            )
            .max(1),
            expose_technical_errors: env_bool("SHADOWSCAN_EXPOSE_TECHNICAL_ERRORS", false),
        }
    }

    /// Refresh window as a chrono duration for expiry arithmetic.
    pub fn refresh_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.refresh_window).unwrap_or(chrono::Duration::minutes(5))
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name).ok().as_deref().map(str::trim) {
        None | Some("") => default,
        Some(v) => v.eq_ignore_ascii_case("true") || v == "1",
    }
}

fn env_u8(name: &str, default: u8) -> u8 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_duration_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|raw| {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
