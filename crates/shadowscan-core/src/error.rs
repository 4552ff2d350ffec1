//! Error taxonomy for the discovery pipeline.
//!
//! Collectors are the only place that sees raw platform failures; they map
//! every platform error into [`CollectorError`] at the adapter boundary.
//! Everything upstream (orchestrator, progress bus, API layer) branches only
//! on the taxonomy, never on platform-specific codes.

use std::time::Duration;
use thiserror::Error;

/// Failure raised by a collector sub-method or adapter.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Credentials rejected by the platform. Aborts the whole adapter.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The connection lacks a scope required by one sub-method. The sub-method
    /// contributes empty; the session continues.
    #[error("insufficient permissions (missing scope: {scope})")]
    Permission { scope: String },

    /// Platform asked us to back off. Retried up to the sub-method budget.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Duration },

    /// Network / 5xx failure. Retried with exponential backoff.
    #[error("transient platform error: {0}")]
    Transient(String),

    /// Unrecoverable adapter error; all of its sub-methods count as failed.
    #[error("fatal collector error: {0}")]
    Fatal(String),
}

impl CollectorError {
    /// Only `RateLimited` and `Transient` are eligible for retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectorError::RateLimited { .. } | CollectorError::Transient(_)
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CollectorError::Auth(_) => ErrorCategory::Authentication,
            CollectorError::Permission { .. } => ErrorCategory::Permission,
            CollectorError::RateLimited { .. } => ErrorCategory::RateLimit,
            CollectorError::Transient(_) => ErrorCategory::Network,
            CollectorError::Fatal(_) => ErrorCategory::Internal,
        }
    }
}

/// Failure resolving stored credentials for a connection. All variants are
/// fatal for the session (category `authentication`), except `Storage` during
/// a write, which aborts only the write.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no stored credentials for connection {0}")]
    NotFound(String),

    #[error("credentials for connection {0} are expired and not refreshable")]
    Expired(String),

    /// Ciphertext failed to decrypt: wrong key, tampering, or corruption.
    #[error("stored credentials for connection {0} are corrupt: {1}")]
    Corrupt(String, String),

    /// No usable cipher (missing master key); encryption at rest cannot run.
    #[error("credential cipher unavailable: {0}")]
    CipherUnavailable(String),

    #[error("credential storage error: {0}")]
    Storage(#[from] StoreError),

    /// The platform refresh call failed; carries the collector taxonomy.
    #[error("token refresh failed: {0}")]
    Refresh(#[source] CollectorError),
}

/// Durable-store failure (SQLite or payload encoding).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Filter/parameter validation failure, rejected before any query work.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),
}

/// Client-facing category for a failed session. Ordered by severity: when all
/// sub-methods of an adapter fail, the session reports the most severe
/// category observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    // Declaration order is severity order (least severe first) so that the
    // derived Ord makes `max()` pick the most severe.
    Internal,
    Network,
    RateLimit,
    Permission,
    Authentication,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Permission => "permission",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Network => "network",
            ErrorCategory::Internal => "internal",
        }
    }
}

/// Session-level failure reported through the progress bus and run row.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("credential resolution failed: {0}")]
    Credentials(#[from] CredentialError),

    #[error("no collector registered for platform type {0}")]
    NoAdapter(String),

    #[error("a discovery session is already running for connection {0}")]
    AlreadyRunning(String),

    #[error("all discovery sub-methods failed ({category:?}): {detail}")]
    AllSubMethodsFailed {
        category: ErrorCategory,
        detail: String,
    },

    #[error("session cancelled: {0}")]
    Cancelled(String),

    #[error("storage failure during discovery: {0}")]
    Store(#[from] StoreError),
}

impl DiscoveryError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DiscoveryError::Credentials(_) => ErrorCategory::Authentication,
            DiscoveryError::NoAdapter(_) => ErrorCategory::Internal,
            DiscoveryError::AlreadyRunning(_) => ErrorCategory::Internal,
            DiscoveryError::AllSubMethodsFailed { category, .. } => *category,
            DiscoveryError::Cancelled(_) => ErrorCategory::Internal,
            DiscoveryError::Store(_) => ErrorCategory::Internal,
        }
    }
}
