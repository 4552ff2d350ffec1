//! Credential store — write-through cache over encrypted durable rows.
//!
//! Secrets live twice: encrypted in the `encrypted_credentials` table and
//! decrypted in an in-memory cache. The two always agree: `store` persists
//! the encrypted copy first and only then updates the cache, so a successful
//! `store` followed by `get_valid_credentials` on the same id returns the new
//! value, and a restart with a cold cache reproduces identical reads after
//! the first miss-and-load.
//!
//! Refresh is single-flight per connection: concurrent readers that find a
//! token inside the refresh window wait on one latch, and only the winner
//! performs the platform refresh — everyone else observes its result.

use crate::cipher::Cipher;
use crate::collector::TokenRefresher;
use crate::error::{CredentialError, StoreError};
use crate::inventory::InventoryStore;
use crate::shared::{ConnectionStatus, CredentialType, OAuthCredential};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

pub struct CredentialStore {
    store: Arc<InventoryStore>,
    cipher: Arc<Cipher>,
    /// Decrypted cache keyed by `(connection_id, credential_type)`.
    cache: DashMap<(String, CredentialType), OAuthCredential>,
    /// Per-connection single-flight refresh latches.
    refresh_latches: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    refresh_window: chrono::Duration,
}

impl CredentialStore {
    pub fn new(
        store: Arc<InventoryStore>,
        cipher: Arc<Cipher>,
        refresh_window: chrono::Duration,
    ) -> Self {
        Self {
            store,
            cipher,
            cache: DashMap::new(),
            refresh_latches: DashMap::new(),
            refresh_window,
        }
    }

    /// Persists one credential: encrypted row first, cache second. A durable
    /// write failure aborts before the cache is touched.
    pub fn store(
        &self,
        connection_id: &str,
        credential_type: CredentialType,
        secret: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), CredentialError> {
        let (ciphertext, key_id) = self
            .cipher
            .encrypt(secret.as_bytes())
            .map_err(|e| CredentialError::CipherUnavailable(e.to_string()))?;

        let conn = self.store.conn().map_err(StoreError::Db)?;
        conn.execute(
            r#"
            INSERT INTO encrypted_credentials
                (platform_connection_id, credential_type, ciphertext, encryption_key_id,
                 expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(platform_connection_id, credential_type) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                encryption_key_id = excluded.encryption_key_id,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                connection_id,
                credential_type.as_str(),
                ciphertext,
                key_id,
                expires_at.map(|d| d.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| CredentialError::Storage(StoreError::Db(e)))?;

        self.cache.insert(
            (connection_id.to_string(), credential_type),
            OAuthCredential {
                connection_id: connection_id.to_string(),
                credential_type,
                secret: secret.to_string(),
                expires_at,
            },
        );
        tracing::debug!(
            target: "shadowscan::credentials",
            connection_id,
            credential_type = credential_type.as_str(),
            "credential stored (encrypted row + cache)"
        );
        Ok(())
    }

    /// Loads one credential: cache hit, else durable row decrypted into the
    /// cache. `None` when no row exists.
    fn load(
        &self,
        connection_id: &str,
        credential_type: CredentialType,
    ) -> Result<Option<OAuthCredential>, CredentialError> {
        let key = (connection_id.to_string(), credential_type);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Some(cached.clone()));
        }

        let conn = self.store.conn().map_err(StoreError::Db)?;
        let row: Option<(Vec<u8>, String, Option<String>)> = conn
            .query_row(
                "SELECT ciphertext, encryption_key_id, expires_at FROM encrypted_credentials \
                 WHERE platform_connection_id = ?1 AND credential_type = ?2",
                params![connection_id, credential_type.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(|e| CredentialError::Storage(StoreError::Db(e)))?;

        let Some((ciphertext, key_id, expires_at)) = row else {
            return Ok(None);
        };
        let secret = self
            .cipher
            .decrypt_str(&ciphertext, &key_id)
            .map_err(|e| CredentialError::Corrupt(connection_id.to_string(), e.to_string()))?;
        let credential = OAuthCredential {
            connection_id: connection_id.to_string(),
            credential_type,
            secret,
            expires_at: expires_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc)),
        };
        self.cache.insert(key, credential.clone());
        Ok(Some(credential))
    }

    /// Resolves a usable access token for a connection, refreshing through
    /// the platform's `refresh_token` capability when the token is inside the
    /// refresh window and a refresh token exists. At most one refresh runs
    /// per connection at a time; concurrent callers share its result.
    pub async fn get_valid_credentials<R>(
        &self,
        connection_id: &str,
        refresher: &R,
    ) -> Result<OAuthCredential, CredentialError>
    where
        R: TokenRefresher + ?Sized,
    {
        let access = self
            .load(connection_id, CredentialType::AccessToken)?
            .ok_or_else(|| CredentialError::NotFound(connection_id.to_string()))?;

        let now = Utc::now();
        if !access.expires_within(now, self.refresh_window) {
            return Ok(access);
        }

        let refresh = self.load(connection_id, CredentialType::RefreshToken)?;
        let Some(refresh) = refresh else {
            // No refresh capability: still-valid tokens pass through, dead
            // ones surface as expired.
            if access.expires_at.map(|at| at <= now).unwrap_or(false) {
                return Err(CredentialError::Expired(connection_id.to_string()));
            }
            return Ok(access);
        };

        let latch = self
            .refresh_latches
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = latch.lock().await;

        // Re-check under the latch: a concurrent caller may have refreshed
        // while we waited.
        if let Some(current) = self.load(connection_id, CredentialType::AccessToken)? {
            if !current.expires_within(Utc::now(), self.refresh_window) {
                return Ok(current);
            }
        }

        tracing::info!(
            target: "shadowscan::credentials",
            connection_id,
            "access token inside refresh window; performing platform refresh"
        );
        let refreshed = refresher
            .refresh_token(&refresh.secret)
            .await
            .map_err(CredentialError::Refresh)?;

        self.store(
            connection_id,
            CredentialType::AccessToken,
            &refreshed.access_token,
            refreshed.expires_at,
        )?;
        if let Some(new_refresh) = refreshed.refresh_token.as_deref() {
            self.store(
                connection_id,
                CredentialType::RefreshToken,
                new_refresh,
                None,
            )?;
        }

        self.load(connection_id, CredentialType::AccessToken)?
            .ok_or_else(|| CredentialError::NotFound(connection_id.to_string()))
    }

    /// Removes all credentials for a connection from cache and durable
    /// storage, and marks the connection `revoked`.
    pub fn revoke(&self, connection_id: &str) -> Result<(), CredentialError> {
        let conn = self.store.conn().map_err(StoreError::Db)?;
        conn.execute(
            "DELETE FROM encrypted_credentials WHERE platform_connection_id = ?1",
            params![connection_id],
        )
        .map_err(|e| CredentialError::Storage(StoreError::Db(e)))?;

        self.cache
            .retain(|(conn_id, _), _| conn_id != connection_id);
        self.store
            .set_connection_status(connection_id, ConnectionStatus::Revoked)?;
        tracing::info!(
            target: "shadowscan::credentials",
            connection_id,
            "credentials revoked and purged"
        );
        Ok(())
    }

    /// Drops the in-memory cache. Reads fall back to durable rows; used by
    /// tests to model a process restart.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
