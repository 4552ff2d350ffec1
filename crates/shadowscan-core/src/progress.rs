//! Progress bus — per-connection discovery event stream.
//!
//! Each connection id owns one broadcast channel; subscribers attach by
//! connection id and observe that session's events in FIFO order. Delivery is
//! best-effort: a slow or disconnected subscriber misses events (the channel
//! drops the oldest), and missed events are never re-delivered — clients
//! reconcile through the inventory read model on reconnect. Every session
//! produces at least one `progress` event per stage transition and exactly
//! one terminal event.

use crate::error::ErrorCategory;
use crate::shared::{DiscoveryRun, RiskLevel};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

/// Per-connection channel capacity. Subscribers further behind than this lose
/// the oldest events, which the delivery contract allows.
const CHANNEL_CAPACITY: usize = 64;

/// Observable stages of a discovery session, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Authenticate,
    Enumerate,
    Analyze,
    Persist,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Authenticate => "authenticate",
            Stage::Enumerate => "enumerate",
            Stage::Analyze => "analyze",
            Stage::Persist => "persist",
            Stage::Finalize => "finalize",
        }
    }

    /// Nominal completion percentage reported when the stage begins.
    pub fn progress_pct(&self) -> u8 {
        match self {
            Stage::Authenticate => 10,
            Stage::Enumerate => 30,
            Stage::Analyze => 60,
            Stage::Persist => 80,
            Stage::Finalize => 95,
        }
    }
}

/// Compact automation summary carried by `automation.added`.
#[derive(Debug, Clone, Serialize)]
pub struct AutomationAdded {
    pub automation_id: String,
    pub external_id: String,
    pub name: String,
    pub risk_level: RiskLevel,
    pub is_ai_platform: bool,
}

/// One event on a connection's discovery stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    Progress {
        connection_id: String,
        stage: Stage,
        /// 0–100.
        progress: u8,
        message: String,
    },
    Complete {
        connection_id: String,
        run_summary: DiscoveryRun,
    },
    Failed {
        connection_id: String,
        error: String,
        error_category: ErrorCategory,
        /// Diagnostic detail; populated only in non-production configurations.
        #[serde(skip_serializing_if = "Option::is_none")]
        technical_error: Option<String>,
    },
    AutomationAdded {
        connection_id: String,
        automation: AutomationAdded,
    },
    /// Keep-alive emitted while a session is idle.
    Ping { connection_id: String },
}

impl DiscoveryEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryEvent::Progress { .. } => "discovery.progress",
            DiscoveryEvent::Complete { .. } => "discovery.complete",
            DiscoveryEvent::Failed { .. } => "discovery.failed",
            DiscoveryEvent::AutomationAdded { .. } => "automation.added",
            DiscoveryEvent::Ping { .. } => "discovery.ping",
        }
    }

    pub fn connection_id(&self) -> &str {
        match self {
            DiscoveryEvent::Progress { connection_id, .. }
            | DiscoveryEvent::Complete { connection_id, .. }
            | DiscoveryEvent::Failed { connection_id, .. }
            | DiscoveryEvent::AutomationAdded { connection_id, .. }
            | DiscoveryEvent::Ping { connection_id } => connection_id,
        }
    }

    /// True for the session-closing events (`complete` / `failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DiscoveryEvent::Complete { .. } | DiscoveryEvent::Failed { .. }
        )
    }
}

/// Fan-out broker for discovery events, keyed by connection id.
#[derive(Default)]
pub struct ProgressBus {
    channels: DashMap<String, broadcast::Sender<DiscoveryEvent>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, connection_id: &str) -> broadcast::Sender<DiscoveryEvent> {
        self.channels
            .entry(connection_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribes to one connection's event stream. Events published before
    /// the subscription are not replayed.
    pub fn subscribe(&self, connection_id: &str) -> broadcast::Receiver<DiscoveryEvent> {
        self.sender(connection_id).subscribe()
    }

    /// Publishes one event to the connection's subscribers. Events with no
    /// live subscriber are dropped, per the delivery contract.
    pub fn publish(&self, event: DiscoveryEvent) {
        let sender = self.sender(event.connection_id());
        tracing::debug!(
            target: "shadowscan::progress",
            kind = event.kind(),
            connection_id = event.connection_id(),
            "publishing discovery event"
        );
        let _ = sender.send(event);
    }
}
