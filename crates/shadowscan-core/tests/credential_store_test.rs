//! Integration tests: credential store dual-storage consistency and
//! single-flight refresh.

use async_trait::async_trait;
use chrono::Utc;
use shadowscan_core::{
    Cipher, CollectorError, CredentialError, CredentialStore, CredentialType, InventoryStore,
    NewConnection, PlatformType, RefreshedToken, TokenRefresher,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn test_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    for (i, b) in key.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(13).wrapping_add(7);
    }
    key
}

struct CountingRefresher {
    calls: AtomicUsize,
}

impl CountingRefresher {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken, CollectorError> {
        assert_eq!(refresh_token, "refresh-secret");
        self.calls.fetch_add(1, Ordering::SeqCst);
        // A short pause widens the race window for the single-flight check.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Ok(RefreshedToken {
            access_token: "fresh-access-token".to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        })
    }
}

struct Rig {
    _dir: tempfile::TempDir,
    inventory: Arc<InventoryStore>,
    credentials: Arc<CredentialStore>,
    connection_id: String,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let inventory = Arc::new(InventoryStore::open(dir.path().join("inventory.db")).unwrap());
    inventory
        .upsert_organization(&shadowscan_core::Organization {
            id: "org-1".into(),
            slug: "acme".into(),
            plan_tier: "team".into(),
        })
        .unwrap();
    let connection = inventory
        .create_connection(NewConnection {
            organization_id: "org-1".into(),
            platform_type: PlatformType::Chat,
            platform_user_id: "U100".into(),
            platform_workspace_id: Some("T100".into()),
            permissions_granted: vec![],
            expires_at: None,
            metadata: serde_json::json!({}),
        })
        .unwrap();
    let key = test_key();
    let cipher = Arc::new(Cipher::new(Some(("test-key", &key))));
    let credentials = Arc::new(CredentialStore::new(
        Arc::clone(&inventory),
        cipher,
        chrono::Duration::minutes(5),
    ));
    Rig {
        _dir: dir,
        inventory,
        credentials,
        connection_id: connection.id,
    }
}

#[tokio::test]
async fn store_then_get_returns_stored_value_warm_and_cold() {
    let rig = rig();
    let refresher = CountingRefresher::new();
    let expires = Utc::now() + chrono::Duration::hours(2);
    rig.credentials
        .store(
            &rig.connection_id,
            CredentialType::AccessToken,
            "xoxb-access-1",
            Some(expires),
        )
        .unwrap();

    // Warm cache read.
    let cred = rig
        .credentials
        .get_valid_credentials(&rig.connection_id, &refresher)
        .await
        .unwrap();
    assert_eq!(cred.secret, "xoxb-access-1");

    // Cold read: a restart with an empty cache must produce identical results
    // after the first miss-and-load.
    rig.credentials.clear_cache();
    let cred = rig
        .credentials
        .get_valid_credentials(&rig.connection_id, &refresher)
        .await
        .unwrap();
    assert_eq!(cred.secret, "xoxb-access-1");
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 0, "no refresh expected");
}

#[tokio::test]
async fn missing_credentials_surface_not_found() {
    let rig = rig();
    let refresher = CountingRefresher::new();
    let err = rig
        .credentials
        .get_valid_credentials(&rig.connection_id, &refresher)
        .await
        .unwrap_err();
    assert!(matches!(err, CredentialError::NotFound(_)));
}

#[tokio::test]
async fn expired_without_refresh_token_is_expired() {
    let rig = rig();
    let refresher = CountingRefresher::new();
    rig.credentials
        .store(
            &rig.connection_id,
            CredentialType::AccessToken,
            "dead-token",
            Some(Utc::now() - chrono::Duration::minutes(1)),
        )
        .unwrap();
    let err = rig
        .credentials
        .get_valid_credentials(&rig.connection_id, &refresher)
        .await
        .unwrap_err();
    assert!(matches!(err, CredentialError::Expired(_)));
}

#[tokio::test]
async fn concurrent_refresh_is_single_flight() {
    let rig = rig();
    // Access token expiring inside the default 5 minute refresh window.
    rig.credentials
        .store(
            &rig.connection_id,
            CredentialType::AccessToken,
            "stale-access",
            Some(Utc::now() + chrono::Duration::seconds(10)),
        )
        .unwrap();
    rig.credentials
        .store(
            &rig.connection_id,
            CredentialType::RefreshToken,
            "refresh-secret",
            None,
        )
        .unwrap();

    let refresher = Arc::new(CountingRefresher::new());
    let mut handles = Vec::new();
    for _ in 0..10 {
        let credentials = Arc::clone(&rig.credentials);
        let refresher = Arc::clone(&refresher);
        let connection_id = rig.connection_id.clone();
        handles.push(tokio::spawn(async move {
            credentials
                .get_valid_credentials(&connection_id, refresher.as_ref())
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        let cred = handle.await.unwrap();
        assert_eq!(cred.secret, "fresh-access-token");
    }
    assert_eq!(
        refresher.calls.load(Ordering::SeqCst),
        1,
        "exactly one platform refresh for ten concurrent callers"
    );
}

#[tokio::test]
async fn corrupt_ciphertext_is_fatal_for_connection() {
    let rig = rig();
    let refresher = CountingRefresher::new();
    rig.credentials
        .store(
            &rig.connection_id,
            CredentialType::AccessToken,
            "good-token",
            None,
        )
        .unwrap();

    // Tamper with the durable row, then force a cold read.
    let conn = rusqlite::Connection::open(rig.inventory.path()).unwrap();
    conn.execute(
        "UPDATE encrypted_credentials SET ciphertext = X'00010203040506070809101112131415'",
        [],
    )
    .unwrap();
    rig.credentials.clear_cache();

    let err = rig
        .credentials
        .get_valid_credentials(&rig.connection_id, &refresher)
        .await
        .unwrap_err();
    assert!(matches!(err, CredentialError::Corrupt(_, _)));
}

#[tokio::test]
async fn revoke_purges_both_copies_and_marks_connection() {
    let rig = rig();
    let refresher = CountingRefresher::new();
    rig.credentials
        .store(
            &rig.connection_id,
            CredentialType::AccessToken,
            "to-be-revoked",
            None,
        )
        .unwrap();
    rig.credentials.revoke(&rig.connection_id).unwrap();

    let err = rig
        .credentials
        .get_valid_credentials(&rig.connection_id, &refresher)
        .await
        .unwrap_err();
    assert!(matches!(err, CredentialError::NotFound(_)));

    let connection = rig
        .inventory
        .get_connection(&rig.connection_id)
        .unwrap()
        .unwrap();
    assert_eq!(
        connection.status,
        shadowscan_core::ConnectionStatus::Revoked
    );
}
