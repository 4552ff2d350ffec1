//! Session driver: the staged pipeline for one discovery run.

use super::DiscoveryOrchestrator;
use crate::collector::CollectContext;
use crate::error::{CollectorError, CredentialError, ErrorCategory};
use crate::progress::{AutomationAdded, DiscoveryEvent, Stage};
use crate::risk::ScoreContext;
use crate::shared::{
    ConnectionStatus, DiscoveryRun, PlatformConnection, RunStatus, SourceMethod,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Keep-alive cadence while a session is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Successful session statistics.
struct SessionStats {
    errors_count: u32,
}

/// Session-level failure, already categorized for clients.
struct SessionFailure {
    category: ErrorCategory,
    message: String,
    technical: Option<String>,
}

impl DiscoveryOrchestrator {
    /// Drives one session end to end and guarantees exactly one terminal
    /// event and one finalized run row, whatever happens inside.
    pub(super) async fn drive_session(
        self: Arc<Self>,
        run: DiscoveryRun,
        connection: PlatformConnection,
        cancel: CancellationToken,
    ) {
        let connection_id = run.connection_id.clone();

        let heartbeat = {
            let bus = Arc::clone(&self.bus);
            let connection_id = connection_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                            bus.publish(DiscoveryEvent::Ping {
                                connection_id: connection_id.clone(),
                            });
                        }
                    }
                }
            })
        };

        // The session deadline propagates the same token as a caller cancel;
        // the flag lets the terminal message name the actual trigger.
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let deadline_task = {
            let cancel = cancel.clone();
            let deadline_hit = Arc::clone(&deadline_hit);
            let timeout = self.config.session_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline_hit.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        };

        let result = self.execute_session(&run, &connection, &cancel).await;

        heartbeat.abort();
        deadline_task.abort();

        let automations_found = self
            .inventory
            .count_run_automations(&run.id)
            .unwrap_or_default();

        let cancelled = cancel.is_cancelled();
        let (status, errors_count, error_details, terminal) = if cancelled {
            let reason = if deadline_hit.load(Ordering::SeqCst) {
                "session deadline exceeded"
            } else {
                "cancelled by caller"
            };
            let errors_count = match &result {
                Ok(stats) => stats.errors_count,
                Err(_) => 0,
            };
            (
                RunStatus::Cancelled,
                errors_count,
                Some(format!("cancelled: {reason}")),
                DiscoveryEvent::Failed {
                    connection_id: connection_id.clone(),
                    error: format!("discovery cancelled ({reason})"),
                    error_category: ErrorCategory::Internal,
                    technical_error: None,
                },
            )
        } else {
            match result {
                Ok(stats) => {
                    if let Err(e) = self.inventory.apply_missed_run_policy(
                        &connection_id,
                        &run.id,
                        self.config.missed_runs_to_deactivate,
                    ) {
                        tracing::warn!(
                            target: "shadowscan::orchestrator",
                            run_id = %run.id,
                            error = %e,
                            "missed-run sweep failed"
                        );
                    }
                    let summary = DiscoveryRun {
                        status: RunStatus::Completed,
                        completed_at: Some(Utc::now()),
                        automations_found,
                        errors_count: stats.errors_count,
                        error_details: None,
                        ..run.clone()
                    };
                    (
                        RunStatus::Completed,
                        stats.errors_count,
                        None,
                        DiscoveryEvent::Complete {
                            connection_id: connection_id.clone(),
                            run_summary: summary,
                        },
                    )
                }
                Err(failure) => (
                    RunStatus::Failed,
                    1,
                    Some(failure.message.clone()),
                    DiscoveryEvent::Failed {
                        connection_id: connection_id.clone(),
                        error: failure.message,
                        error_category: failure.category,
                        technical_error: if self.config.expose_technical_errors {
                            failure.technical
                        } else {
                            None
                        },
                    },
                ),
            }
        };

        if let Err(e) = self.inventory.finalize_run(
            &run.id,
            status,
            automations_found,
            errors_count,
            error_details.as_deref(),
        ) {
            tracing::error!(
                target: "shadowscan::orchestrator",
                run_id = %run.id,
                error = %e,
                "failed to finalize run row"
            );
        }

        // Release the per-connection slot before the terminal event goes out,
        // so a subscriber reacting to it can start the next session at once.
        self.active.remove(&connection_id);
        self.bus.publish(DiscoveryEvent::Progress {
            connection_id: connection_id.clone(),
            stage: Stage::Finalize,
            progress: Stage::Finalize.progress_pct(),
            message: format!("{automations_found} automation(s) recorded"),
        });
        self.bus.publish(terminal);
        tracing::info!(
            target: "shadowscan::orchestrator",
            run_id = %run.id,
            connection_id = %connection_id,
            status = status.as_str(),
            automations_found,
            errors_count,
            "discovery session finished"
        );
    }

    async fn execute_session(
        &self,
        run: &DiscoveryRun,
        connection: &PlatformConnection,
        cancel: &CancellationToken,
    ) -> Result<SessionStats, SessionFailure> {
        let connection_id = &run.connection_id;
        self.inventory
            .mark_run_in_progress(&run.id)
            .map_err(|e| SessionFailure {
                category: ErrorCategory::Internal,
                message: "failed to start discovery run".to_string(),
                technical: Some(e.to_string()),
            })?;

        // --- authenticate -----------------------------------------------------
        self.progress(connection_id, Stage::Authenticate, "resolving credentials");

        let adapter = self
            .registry
            .get(connection.platform_type)
            .ok_or_else(|| SessionFailure {
                category: ErrorCategory::Internal,
                message: format!(
                    "no collector available for platform {}",
                    connection.platform_type.as_str()
                ),
                technical: None,
            })?;

        let credential = match self
            .credentials
            .get_valid_credentials(connection_id, adapter.as_ref())
            .await
        {
            Ok(credential) => credential,
            Err(err) => {
                if matches!(err, CredentialError::Expired(_)) {
                    let _ = self
                        .inventory
                        .set_connection_status(connection_id, ConnectionStatus::Expired);
                }
                return Err(SessionFailure {
                    category: ErrorCategory::Authentication,
                    message: "could not obtain valid platform credentials".to_string(),
                    technical: Some(err.to_string()),
                });
            }
        };
        if connection.status == ConnectionStatus::Pending {
            let _ = self
                .inventory
                .set_connection_status(connection_id, ConnectionStatus::Active);
        }

        // --- enumerate --------------------------------------------------------
        let methods = adapter.sub_methods(connection);
        self.progress(
            connection_id,
            Stage::Enumerate,
            &format!("running {} discovery method(s)", methods.len()),
        );
        if methods.is_empty() {
            return Ok(SessionStats { errors_count: 0 });
        }

        let (tx, mut rx) = mpsc::channel(self.config.max_candidate_backlog);
        // Child token so an adapter abort (auth/fatal) stops producers while
        // the consumer keeps draining in-flight upserts.
        let producer_cancel = cancel.child_token();

        let mut producers = Vec::with_capacity(methods.len());
        for method in methods.iter().copied() {
            let adapter = Arc::clone(&adapter);
            let tx = tx.clone();
            let ctx = CollectContext {
                connection: connection.clone(),
                credential: credential.clone(),
                cancel: producer_cancel.clone(),
            };
            let abort_siblings = producer_cancel.clone();
            let submethod_timeout = self.config.submethod_timeout;
            producers.push(tokio::spawn(async move {
                let result = tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        Err(CollectorError::Transient("sub-method cancelled".to_string()))
                    }
                    collected = tokio::time::timeout(
                        submethod_timeout,
                        adapter.collect(&ctx, method, tx),
                    ) => match collected {
                        Ok(inner) => inner,
                        Err(_) => Err(CollectorError::Transient(format!(
                            "sub-method {} timed out",
                            method.as_str()
                        ))),
                    },
                };
                if matches!(
                    result,
                    Err(CollectorError::Auth(_)) | Err(CollectorError::Fatal(_))
                ) {
                    // Global failures abort every sub-method of this adapter.
                    abort_siblings.cancel();
                }
                (method, result)
            }));
        }
        drop(tx);

        // --- analyze / persist ------------------------------------------------
        self.progress(connection_id, Stage::Analyze, "scoring discovered candidates");

        let score_ctx = ScoreContext {
            workspace_project: connection
                .metadata
                .get("project_id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        };

        let consumer = {
            let detector = Arc::clone(&self.detector);
            let scorer = Arc::clone(&self.scorer);
            let persister = Arc::clone(&self.persister);
            let bus = Arc::clone(&self.bus);
            let cancel = cancel.clone();
            let organization_id = run.organization_id.clone();
            let connection_id = connection_id.clone();
            let run_id = run.id.clone();
            tokio::spawn(async move {
                let mut persist_errors = 0u32;
                let mut persist_fatal: Option<String> = None;
                loop {
                    let candidate = tokio::select! {
                        biased;
                        // On cancel: the current upsert has already completed
                        // (we only wait here between items); queued candidates
                        // are dropped.
                        _ = cancel.cancelled() => break,
                        item = rx.recv() => match item {
                            Some(candidate) => candidate,
                            None => break,
                        },
                    };

                    let signal = detector.detect(&candidate);
                    let risk = scorer.score(&candidate, &signal, &score_ctx);
                    let mut attempt = persister
                        .persist(&organization_id, &connection_id, &run_id, &candidate, &risk)
                        .await;
                    if attempt.is_err() {
                        // One storage retry before the session gives up.
                        attempt = persister
                            .persist(&organization_id, &connection_id, &run_id, &candidate, &risk)
                            .await;
                    }
                    match attempt {
                        Ok(_) => {
                            if let Ok(Some(row)) =
                                persister.store().get_automation(&connection_id, &candidate.external_id)
                            {
                                bus.publish(DiscoveryEvent::AutomationAdded {
                                    connection_id: connection_id.clone(),
                                    automation: AutomationAdded {
                                        automation_id: row.id,
                                        external_id: row.external_id,
                                        name: row.name,
                                        risk_level: row.risk.risk_level,
                                        is_ai_platform: row.risk.is_ai_platform,
                                    },
                                });
                            }
                        }
                        Err(e) => {
                            persist_errors += 1;
                            tracing::error!(
                                target: "shadowscan::orchestrator",
                                external_id = %candidate.external_id,
                                error = %e,
                                "automation upsert failed after retry"
                            );
                            persist_fatal = Some(e.to_string());
                            break;
                        }
                    }
                }
                (persist_errors, persist_fatal)
            })
        };

        let mut method_errors: Vec<(SourceMethod, CollectorError)> = Vec::new();
        let mut succeeded = 0usize;
        for producer in producers {
            match producer.await {
                Ok((_, Ok(()))) => succeeded += 1,
                Ok((method, Err(err))) => {
                    tracing::warn!(
                        target: "shadowscan::orchestrator",
                        connection_id = %connection_id,
                        method = method.as_str(),
                        error = %err,
                        "discovery sub-method failed"
                    );
                    method_errors.push((method, err));
                }
                Err(join_err) => {
                    method_errors.push((
                        SourceMethod::OauthAppInventory,
                        CollectorError::Fatal(format!("sub-method task panicked: {join_err}")),
                    ));
                }
            }
        }

        self.progress(connection_id, Stage::Persist, "persisting scored automations");

        let (persist_errors, persist_fatal) = consumer.await.unwrap_or((0, None));

        if let Some(detail) = persist_fatal {
            return Err(SessionFailure {
                category: ErrorCategory::Internal,
                message: "failed to persist discovered automations".to_string(),
                technical: Some(detail),
            });
        }

        let adapter_aborted = method_errors.iter().any(|(_, e)| {
            matches!(e, CollectorError::Auth(_) | CollectorError::Fatal(_))
        });
        if adapter_aborted {
            let _ = self
                .inventory
                .set_connection_status(connection_id, ConnectionStatus::Error);
        }

        if succeeded == 0 && !method_errors.is_empty() && !cancel.is_cancelled() {
            let category = method_errors
                .iter()
                .map(|(_, e)| e.category())
                .max()
                .unwrap_or(ErrorCategory::Internal);
            let detail = method_errors
                .iter()
                .map(|(m, e)| format!("{}: {e}", m.as_str()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(SessionFailure {
                category,
                message: "all discovery methods failed for this connection".to_string(),
                technical: Some(detail),
            });
        }

        Ok(SessionStats {
            errors_count: method_errors.len() as u32 + persist_errors,
        })
    }

    fn progress(&self, connection_id: &str, stage: Stage, message: &str) {
        self.bus.publish(DiscoveryEvent::Progress {
            connection_id: connection_id.to_string(),
            stage,
            progress: stage.progress_pct(),
            message: message.to_string(),
        });
    }
}
