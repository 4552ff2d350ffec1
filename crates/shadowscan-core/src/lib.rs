//! shadowscan-core: discovery pipeline and risk engine.
//!
//! Discovers shadow automations (bots, OAuth apps, scripts, service accounts,
//! webhooks) across an organization's SaaS tenants, attributes them to owners,
//! and assigns risk driven by AI-platform signals and over-privileged access.
//! This crate carries the whole pipeline: credential store, collector
//! capability layer, AI-signal detector, risk scorer, inventory persistence
//! and read model, progress bus, and the discovery orchestrator. Platform
//! adapters live in `shadowscan-collectors`.

mod cipher;
mod collector;
mod config;
mod credentials;
mod detector;
mod error;
mod inventory;
mod orchestrator;
mod progress;
mod query;
mod risk;
mod secure_buf;
mod shared;

pub use cipher::{Cipher, CipherError};
pub use collector::{
    with_retry, CollectContext, Collector, CollectorRegistry, HostRateLimiter, TokenRefresher,
};
pub use config::DiscoveryConfig;
pub use credentials::CredentialStore;
pub use detector::{
    AiPlatformType, AiSignal, AiSignalDetector, ScopeSensitivity, VendorCatalog, VendorEntry,
};
pub use error::{CollectorError, CredentialError, DiscoveryError, ErrorCategory, StoreError};
pub use inventory::{
    InventoryStore, NewConnection, Organization, Persister, UpsertOutcome,
};
pub use orchestrator::DiscoveryOrchestrator;
pub use progress::{AutomationAdded, DiscoveryEvent, ProgressBus, Stage};
pub use query::{GroupBy, InventoryStats, ListRequest, Page, ValidatedList};
pub use risk::{RiskScorer, ScoreContext};
pub use secure_buf::SecretBuf;
pub use shared::{
    AutomationType, ConnectionStatus, CredentialType, DiscoveredAutomation, DiscoveryRun,
    OAuthCredential, OwnerInfo, PlatformConnection, PlatformType, RawCandidate, RefreshedToken,
    RiskAssessment, RiskLevel, RunStatus, SourceMethod, VendorGroup,
};
