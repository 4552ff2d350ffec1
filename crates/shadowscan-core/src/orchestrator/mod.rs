//! Discovery orchestrator — runs one discovery session per connection.
//!
//! A session walks the staged protocol `authenticate → enumerate → analyze →
//! persist → finalize`, fanning sub-methods out concurrently and feeding every
//! produced candidate through the detector, the scorer, and the persister.
//! Stage transitions and the single terminal outcome are published on the
//! progress bus. One orchestrator instance owns each run row for the
//! session's lifetime; a second `run_discovery` for the same connection is
//! rejected while a session is active.

mod session;

use crate::collector::CollectorRegistry;
use crate::config::DiscoveryConfig;
use crate::credentials::CredentialStore;
use crate::detector::AiSignalDetector;
use crate::error::{DiscoveryError, StoreError};
use crate::inventory::{InventoryStore, Persister};
use crate::progress::{DiscoveryEvent, ProgressBus};
use crate::risk::RiskScorer;
use crate::shared::DiscoveryRun;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub struct DiscoveryOrchestrator {
    config: DiscoveryConfig,
    inventory: Arc<InventoryStore>,
    persister: Arc<Persister>,
    credentials: Arc<CredentialStore>,
    registry: Arc<CollectorRegistry>,
    detector: Arc<AiSignalDetector>,
    scorer: Arc<RiskScorer>,
    bus: Arc<ProgressBus>,
    /// Cancellation tokens of in-flight sessions, keyed by connection id.
    active: DashMap<String, CancellationToken>,
}

impl DiscoveryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DiscoveryConfig,
        inventory: Arc<InventoryStore>,
        credentials: Arc<CredentialStore>,
        registry: Arc<CollectorRegistry>,
        detector: Arc<AiSignalDetector>,
        scorer: Arc<RiskScorer>,
        bus: Arc<ProgressBus>,
    ) -> Self {
        let persister = Arc::new(Persister::new(
            Arc::clone(&inventory),
            config.persister_stripes,
        ));
        Self {
            config,
            inventory,
            persister,
            credentials,
            registry,
            detector,
            scorer,
            bus,
            active: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn inventory(&self) -> &Arc<InventoryStore> {
        &self.inventory
    }

    /// Starts a discovery session for one connection. Returns the created run
    /// synchronously; the session itself runs in the background and reports
    /// through the progress bus.
    pub fn run_discovery(
        self: &Arc<Self>,
        organization_id: &str,
        connection_id: &str,
    ) -> Result<DiscoveryRun, DiscoveryError> {
        let connection = self
            .inventory
            .get_connection(connection_id)?
            .ok_or_else(|| StoreError::NotFound("connection", connection_id.to_string()))?;
        if connection.organization_id != organization_id {
            return Err(
                StoreError::NotFound("connection", connection_id.to_string()).into(),
            );
        }

        let cancel = CancellationToken::new();
        // Claim the per-connection slot; entry-based insert keeps the check
        // and the claim atomic.
        {
            let entry = self.active.entry(connection_id.to_string());
            match entry {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(DiscoveryError::AlreadyRunning(connection_id.to_string()));
                }
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(cancel.clone());
                }
            }
        }

        let run = match self.inventory.create_run(organization_id, connection_id) {
            Ok(run) => run,
            Err(e) => {
                self.active.remove(connection_id);
                return Err(e.into());
            }
        };

        tracing::info!(
            target: "shadowscan::orchestrator",
            run_id = %run.id,
            connection_id,
            platform_type = connection.platform_type.as_str(),
            "discovery session accepted"
        );

        let this = Arc::clone(self);
        let spawned_run = run.clone();
        tokio::spawn(async move {
            this.drive_session(spawned_run, connection, cancel).await;
        });
        Ok(run)
    }

    /// Requests cooperative cancellation of the connection's active session.
    /// Returns false when no session is running.
    pub fn cancel(&self, connection_id: &str) -> bool {
        match self.active.get(connection_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Subscribes to the connection's discovery event stream.
    pub fn subscribe(&self, connection_id: &str) -> broadcast::Receiver<DiscoveryEvent> {
        self.bus.subscribe(connection_id)
    }

    /// Latest run for a connection (serves the run-status collaborator).
    pub fn latest_run(&self, connection_id: &str) -> Result<Option<DiscoveryRun>, StoreError> {
        self.inventory.latest_run(connection_id)
    }

    /// Replays the detector and scorer over every stored automation of one
    /// organization, using the persisted raw evidence — no re-collection.
    /// Only the risk columns change. Returns the number of rows reassessed.
    pub fn reassess(&self, organization_id: &str) -> Result<u32, StoreError> {
        let rows = self.inventory.all_automations(organization_id)?;
        let mut reassessed = 0u32;
        for row in rows {
            let raw_evidence = row
                .platform_metadata
                .get("raw_evidence")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let candidate = crate::shared::RawCandidate {
                external_id: row.external_id.clone(),
                name: row.name.clone(),
                type_hint: row.automation_type,
                // Source method does not influence scoring; any value works
                // for a replay.
                source_method: crate::shared::SourceMethod::OauthAppInventory,
                trigger_hint: row.trigger_type.clone(),
                actions: row.actions.clone(),
                scopes: row.permissions_required.iter().cloned().collect(),
                owner_info: row.owner_info.clone(),
                modified_at: None,
                platform_metadata: row.platform_metadata.clone(),
                raw_evidence,
            };
            let signal = self.detector.detect(&candidate);
            let workspace_project = self
                .inventory
                .get_connection(&row.connection_id)?
                .and_then(|c| {
                    c.metadata
                        .get("project_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                });
            let risk = self.scorer.score(
                &candidate,
                &signal,
                &crate::risk::ScoreContext { workspace_project },
            );
            self.inventory.update_risk(&row.id, &risk)?;
            reassessed += 1;
        }
        tracing::info!(
            target: "shadowscan::orchestrator",
            organization_id,
            reassessed,
            "risk reassessment over stored evidence complete"
        );
        Ok(reassessed)
    }
}
