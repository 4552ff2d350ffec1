//! Integration tests for the inventory store and read model: JOIN survival,
//! filtered listing, deterministic pagination, stats, vendor grouping, and
//! metadata round-trips.

use chrono::Utc;
use shadowscan_core::{
    AutomationType, InventoryStore, ListRequest, NewConnection, Organization, OwnerInfo,
    PlatformType, RawCandidate, RiskAssessment, RiskLevel, SourceMethod, StoreError,
    UpsertOutcome,
};
use std::sync::Arc;

struct Rig {
    _dir: tempfile::TempDir,
    store: Arc<InventoryStore>,
    connection_id: String,
    run_id: String,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InventoryStore::open(dir.path().join("inventory.db")).unwrap());
    store
        .upsert_organization(&Organization {
            id: "org-1".into(),
            slug: "acme".into(),
            plan_tier: "team".into(),
        })
        .unwrap();
    let connection = store
        .create_connection(NewConnection {
            organization_id: "org-1".into(),
            platform_type: PlatformType::WorkspaceSuite,
            platform_user_id: "admin@acme.test".into(),
            platform_workspace_id: None,
            permissions_granted: vec![],
            expires_at: None,
            metadata: serde_json::json!({ "hosted_domain": "acme.test" }),
        })
        .unwrap();
    let run = store.create_run("org-1", &connection.id).unwrap();
    Rig {
        _dir: dir,
        store,
        connection_id: connection.id,
        run_id: run.id,
    }
}

fn candidate(external_id: &str, name: &str) -> RawCandidate {
    RawCandidate {
        external_id: external_id.to_string(),
        name: name.to_string(),
        type_hint: AutomationType::Integration,
        source_method: SourceMethod::OauthAppInventory,
        trigger_hint: None,
        actions: vec!["sync".into()],
        scopes: ["email".to_string()].into_iter().collect(),
        owner_info: OwnerInfo::default(),
        modified_at: None,
        platform_metadata: serde_json::json!({}),
        raw_evidence: String::new(),
    }
}

fn low_risk() -> RiskAssessment {
    RiskAssessment {
        risk_level: RiskLevel::Low,
        risk_score: 30,
        risk_factors: vec![],
        is_ai_platform: false,
        ai_platform_name: None,
        assessed_at: Utc::now(),
    }
}

fn ai_risk(vendor_display: &str) -> RiskAssessment {
    RiskAssessment {
        risk_level: RiskLevel::High,
        risk_score: 85,
        risk_factors: vec!["AI platform integration: openai".to_string()],
        is_ai_platform: true,
        ai_platform_name: Some(vendor_display.to_string()),
        assessed_at: Utc::now(),
    }
}

#[test]
fn deleted_connection_survives_listing_with_null_platform_type() {
    let rig = rig();
    rig.store
        .upsert_automation(
            "org-1",
            &rig.connection_id,
            &rig.run_id,
            &candidate("app-1", "Survivor"),
            &low_risk(),
        )
        .unwrap();

    // Sanity: platform type joins through while the connection exists.
    let page = rig
        .store
        .list_automations("org-1", &ListRequest::default().validate().unwrap())
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(
        page.items[0].platform_type,
        Some(PlatformType::WorkspaceSuite)
    );

    rig.store.delete_connection(&rig.connection_id).unwrap();

    let page = rig
        .store
        .list_automations("org-1", &ListRequest::default().validate().unwrap())
        .unwrap();
    assert_eq!(page.total, 1, "row must not drop with its connection");
    assert_eq!(page.items[0].platform_type, None);
    assert_eq!(page.items[0].name, "Survivor");
}

#[test]
fn reobservation_updates_mutables_and_keeps_identity() {
    let rig = rig();
    let first = rig
        .store
        .upsert_automation(
            "org-1",
            &rig.connection_id,
            &rig.run_id,
            &candidate("app-1", "Original Name"),
            &low_risk(),
        )
        .unwrap();
    assert_eq!(first, UpsertOutcome::Inserted);

    let row1 = rig
        .store
        .get_automation(&rig.connection_id, "app-1")
        .unwrap()
        .unwrap();

    std::thread::sleep(std::time::Duration::from_millis(10));

    let mut renamed = candidate("app-1", "Renamed App");
    renamed.scopes.insert("drive.readonly".into());
    let second = rig
        .store
        .upsert_automation("org-1", &rig.connection_id, &rig.run_id, &renamed, &low_risk())
        .unwrap();
    assert_eq!(second, UpsertOutcome::Updated);

    let row2 = rig
        .store
        .get_automation(&rig.connection_id, "app-1")
        .unwrap()
        .unwrap();
    assert_eq!(row2.id, row1.id);
    assert_eq!(row2.first_discovered_at, row1.first_discovered_at);
    assert!(row2.last_seen_at > row1.last_seen_at);
    assert_eq!(row2.name, "Renamed App");
    assert_eq!(
        row2.permissions_required,
        vec!["drive.readonly", "email"]
    );
}

#[test]
fn listing_filters_and_rejects_invalid_values() {
    let rig = rig();
    rig.store
        .upsert_automation(
            "org-1",
            &rig.connection_id,
            &rig.run_id,
            &candidate("app-ai", "ChatGPT"),
            &ai_risk("OpenAI / ChatGPT"),
        )
        .unwrap();
    rig.store
        .upsert_automation(
            "org-1",
            &rig.connection_id,
            &rig.run_id,
            &candidate("app-plain", "Mail Merge"),
            &low_risk(),
        )
        .unwrap();

    // risk_level filter
    let high_only = rig
        .store
        .list_automations(
            "org-1",
            &ListRequest {
                risk_level: Some("high".into()),
                ..Default::default()
            }
            .validate()
            .unwrap(),
        )
        .unwrap();
    assert_eq!(high_only.total, 1);
    assert_eq!(high_only.items[0].external_id, "app-ai");

    // search filter
    let searched = rig
        .store
        .list_automations(
            "org-1",
            &ListRequest {
                search: Some("merge".into()),
                ..Default::default()
            }
            .validate()
            .unwrap(),
        )
        .unwrap();
    assert_eq!(searched.total, 1);
    assert_eq!(searched.items[0].external_id, "app-plain");

    // invalid group_by rejected before any query work
    let err = ListRequest {
        group_by: Some("invalid".into()),
        ..Default::default()
    }
    .validate()
    .unwrap_err();
    assert!(matches!(err, StoreError::InvalidFilter(_)));

    // other organizations see nothing
    let other = rig
        .store
        .list_automations("org-2", &ListRequest::default().validate().unwrap())
        .unwrap();
    assert_eq!(other.total, 0);
}

#[test]
fn pagination_is_deterministic_and_complete() {
    let rig = rig();
    for i in 0..25 {
        rig.store
            .upsert_automation(
                "org-1",
                &rig.connection_id,
                &rig.run_id,
                &candidate(&format!("app-{i:02}"), &format!("App {i:02}")),
                &low_risk(),
            )
            .unwrap();
    }

    let mut seen = Vec::new();
    for page_no in 1..=3 {
        let page = rig
            .store
            .list_automations(
                "org-1",
                &ListRequest {
                    page: Some(page_no),
                    limit: Some(10),
                    ..Default::default()
                }
                .validate()
                .unwrap(),
            )
            .unwrap();
        assert_eq!(page.total, 25);
        seen.extend(page.items.into_iter().map(|a| a.id));
    }
    assert_eq!(seen.len(), 25);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 25, "no row lost or duplicated across pages");

    // Identical snapshot, identical ordering.
    let again = rig
        .store
        .list_automations(
            "org-1",
            &ListRequest {
                limit: Some(200),
                ..Default::default()
            }
            .validate()
            .unwrap(),
        )
        .unwrap();
    let twice = rig
        .store
        .list_automations(
            "org-1",
            &ListRequest {
                limit: Some(200),
                ..Default::default()
            }
            .validate()
            .unwrap(),
        )
        .unwrap();
    let ids_a: Vec<&str> = again.items.iter().map(|a| a.id.as_str()).collect();
    let ids_b: Vec<&str> = twice.items.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids_a, ids_b);
}

#[test]
fn stats_count_by_platform_risk_and_type() {
    let rig = rig();
    rig.store
        .upsert_automation(
            "org-1",
            &rig.connection_id,
            &rig.run_id,
            &candidate("app-ai", "ChatGPT"),
            &ai_risk("OpenAI / ChatGPT"),
        )
        .unwrap();
    let mut bot = candidate("bot-1", "Deploy Bot");
    bot.type_hint = AutomationType::Bot;
    rig.store
        .upsert_automation("org-1", &rig.connection_id, &rig.run_id, &bot, &low_risk())
        .unwrap();

    let stats = rig.store.automation_stats("org-1").unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_platform.get("workspace_suite"), Some(&2));
    assert_eq!(stats.by_risk_level.get("high"), Some(&1));
    assert_eq!(stats.by_risk_level.get("low"), Some(&1));
    assert_eq!(stats.by_automation_type.get("integration"), Some(&1));
    assert_eq!(stats.by_automation_type.get("bot"), Some(&1));
}

#[test]
fn vendor_grouping_uses_ai_name_and_flags_ai_vendors() {
    let rig = rig();
    rig.store
        .upsert_automation(
            "org-1",
            &rig.connection_id,
            &rig.run_id,
            &candidate("app-ai", "ChatGPT for Sheets"),
            &ai_risk("OpenAI / ChatGPT"),
        )
        .unwrap();
    rig.store
        .upsert_automation(
            "org-1",
            &rig.connection_id,
            &rig.run_id,
            &candidate("app-z1", "Zapier Interface"),
            &low_risk(),
        )
        .unwrap();
    rig.store
        .upsert_automation(
            "org-1",
            &rig.connection_id,
            &rig.run_id,
            &candidate("app-z2", "zapier   interface"),
            &low_risk(),
        )
        .unwrap();

    let groups = rig.store.group_by_vendor("org-1").unwrap();
    assert_eq!(groups.len(), 2);

    // Highest risk sorts first.
    assert_eq!(groups[0].vendor_name, "OpenAI / ChatGPT");
    assert!(groups[0].is_ai_vendor);
    assert_eq!(groups[0].highest_risk_level, RiskLevel::High);
    assert_eq!(groups[0].count, 1);

    // Case/whitespace variants of the same vendor name collapse.
    assert_eq!(groups[1].count, 2);
    assert!(!groups[1].is_ai_vendor);
    assert_eq!(groups[1].platform_type, Some(PlatformType::WorkspaceSuite));
}

#[test]
fn semi_structured_fields_round_trip_without_loss() {
    let rig = rig();
    let mut tricky = candidate("app-tricky", r#"Quote"Back\slash 𝄞 app"#);
    tricky.platform_metadata = serde_json::json!({
        "nested": {
            "quote": "she said \"hi\"",
            "backslash": "C:\\temp\\x",
            "astral": "clef: 𝄞 emoji: 🤖",
            "number": 42.5,
            "flag": true,
            "when": "2025-06-01T12:34:56Z"
        }
    });
    tricky.owner_info = OwnerInfo {
        user_id: Some("U\\1".into()),
        email: Some("owner@example.com".into()),
        display_name: Some("Owner \"The Boss\"".into()),
        project_id: None,
    };
    rig.store
        .upsert_automation("org-1", &rig.connection_id, &rig.run_id, &tricky, &low_risk())
        .unwrap();

    let row = rig
        .store
        .get_automation(&rig.connection_id, "app-tricky")
        .unwrap()
        .unwrap();
    assert_eq!(row.name, r#"Quote"Back\slash 𝄞 app"#);
    assert_eq!(row.platform_metadata, tricky.platform_metadata);
    assert_eq!(row.owner_info, tricky.owner_info);
}

#[test]
fn run_lifecycle_and_history() {
    let rig = rig();
    rig.store.mark_run_in_progress(&rig.run_id).unwrap();
    rig.store
        .upsert_automation(
            "org-1",
            &rig.connection_id,
            &rig.run_id,
            &candidate("app-1", "App"),
            &low_risk(),
        )
        .unwrap();
    let found = rig.store.count_run_automations(&rig.run_id).unwrap();
    rig.store
        .finalize_run(
            &rig.run_id,
            shadowscan_core::RunStatus::Completed,
            found,
            0,
            None,
        )
        .unwrap();

    let latest = rig.store.latest_run(&rig.connection_id).unwrap().unwrap();
    assert_eq!(latest.id, rig.run_id);
    assert_eq!(latest.status, shadowscan_core::RunStatus::Completed);
    assert_eq!(latest.automations_found, 1);
    assert!(latest.completed_at.is_some());

    let history = rig.store.list_runs(&rig.connection_id, 10).unwrap();
    assert_eq!(history.len(), 1);
}
