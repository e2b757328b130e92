//! Secret store access and decryption.
//!
//! Secrets are fetched once per run as an organization-scoped batch, then
//! decrypted on demand as the script looks them up. Every non-success path
//! resolves to a null value for the script; nothing here throws into the
//! sandbox. Usage timestamps are recorded fire-and-forget.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::Engine as _;
use sqlx::PgPool;

use pact_core::automation::capability::SecretResolution;
use pact_core::types::DbId;
use pact_db::models::secret::SecretRecord;
use pact_db::repositories::SecretRepo;

/// AES-256-GCM key length.
pub const SECRET_KEY_BYTES: usize = 32;

/// Nonce length prefixed to every encrypted blob.
pub const NONCE_BYTES: usize = 12;

/// Errors from secret handling.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secrets master key is invalid: {0}")]
    Key(String),

    #[error("failed to encrypt secret value")]
    Encrypt,

    #[error("failed to decrypt secret value")]
    Decrypt,

    #[error("encrypted blob is malformed")]
    Malformed,

    #[error("secret store error: {0}")]
    Store(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Cipher
// ---------------------------------------------------------------------------

/// AES-256-GCM cipher over the deployment's secrets master key.
///
/// Blob layout: 12-byte random nonce followed by the ciphertext. Plaintext
/// exists only in memory, only for the duration of a lookup.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Build a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, SecretError> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| SecretError::Key(e.to_string()))?;

        if key_bytes.len() != SECRET_KEY_BYTES {
            return Err(SecretError::Key(format!(
                "expected {SECRET_KEY_BYTES} bytes, got {}",
                key_bytes.len()
            )));
        }

        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes)),
        })
    }

    /// Encrypt a plaintext value into a nonce-prefixed blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, SecretError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a nonce-prefixed blob back to the plaintext value.
    pub fn decrypt(&self, blob: &[u8]) -> Result<String, SecretError> {
        if blob.len() <= NONCE_BYTES {
            return Err(SecretError::Malformed);
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_BYTES);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| SecretError::Decrypt)
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Backing store for encrypted secret records.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// List all secrets for one organization. Implementations must scope
    /// strictly to the given organization.
    async fn list_for_organization(
        &self,
        organization_id: &str,
    ) -> Result<Vec<SecretRecord>, sqlx::Error>;

    /// Record that a secret was read.
    async fn touch_last_used(&self, id: DbId) -> Result<(), sqlx::Error>;
}

/// Postgres-backed secret store.
pub struct PgSecretStore {
    pool: PgPool,
}

impl PgSecretStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecretStore for PgSecretStore {
    async fn list_for_organization(
        &self,
        organization_id: &str,
    ) -> Result<Vec<SecretRecord>, sqlx::Error> {
        SecretRepo::list_for_organization(&self.pool, organization_id).await
    }

    async fn touch_last_used(&self, id: DbId) -> Result<(), sqlx::Error> {
        SecretRepo::touch_last_used(&self.pool, id).await
    }
}

// ---------------------------------------------------------------------------
// Per-run batch + accessor
// ---------------------------------------------------------------------------

/// The secrets fetched for one run.
///
/// Read-only and confined to the run that fetched it; batches are never
/// cached or shared across executions.
#[derive(Debug)]
pub struct RunSecrets {
    organization_id: String,
    records: Vec<SecretRecord>,
}

impl RunSecrets {
    /// A batch with no records, used when the fetch itself failed.
    pub fn empty(organization_id: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            records: Vec::new(),
        }
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    /// Secret names (never values) for the capability context.
    pub fn names(&self) -> Vec<String> {
        self.records.iter().map(|r| r.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Fetches and decrypts organization secrets for runs.
pub struct SecretAccessor {
    store: Arc<dyn SecretStore>,
    cipher: SecretCipher,
}

impl SecretAccessor {
    pub fn new(store: Arc<dyn SecretStore>, cipher: SecretCipher) -> Self {
        Self { store, cipher }
    }

    /// Batch-fetch the organization's secrets for one run. Called once at
    /// load time; lookups during the run resolve against this batch.
    pub async fn fetch_for_run(&self, organization_id: &str) -> Result<RunSecrets, SecretError> {
        let records = self.store.list_for_organization(organization_id).await?;
        Ok(RunSecrets {
            organization_id: organization_id.to_string(),
            records,
        })
    }

    /// Resolve one secret from a run's batch, decrypting on demand.
    ///
    /// A successful resolution records usage fire-and-forget; a decryption
    /// failure degrades to [`SecretResolution::Undecryptable`] rather than
    /// failing the run.
    pub fn resolve(&self, batch: &RunSecrets, name: &str) -> SecretResolution {
        let Some(record) = batch.records.iter().find(|r| r.name == name) else {
            return SecretResolution::NotFound;
        };

        match self.cipher.decrypt(&record.encrypted_value) {
            Ok(value) => {
                self.note_used(record.id);
                SecretResolution::Resolved(value)
            }
            Err(err) => {
                tracing::warn!(
                    secret_id = record.id,
                    organization_id = %batch.organization_id,
                    error = %err,
                    "stored secret could not be decrypted"
                );
                SecretResolution::Undecryptable
            }
        }
    }

    /// Fire-and-forget `last_used_at` update; failures are logged, never
    /// escalated into the run.
    fn note_used(&self, id: DbId) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.touch_last_used(id).await {
                tracing::warn!(secret_id = id, error = %err, "failed to record secret usage");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
