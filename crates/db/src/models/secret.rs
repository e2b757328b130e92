//! Organization-scoped secret records.

use sqlx::FromRow;

use pact_core::types::{DbId, Timestamp};

/// One stored secret, scoped to a single organization.
///
/// `encrypted_value` is the AES-256-GCM blob (12-byte nonce prefix +
/// ciphertext). Deliberately not `Serialize`: the blob must never ride
/// along into a response or log by accident. Decryption lives in the
/// engine's secret accessor; this crate only moves bytes.
#[derive(Debug, Clone, FromRow)]
pub struct SecretRecord {
    pub id: DbId,
    pub organization_id: String,
    pub name: String,
    pub encrypted_value: Vec<u8>,
    /// Best-effort usage tracking; updated fire-and-forget on lookup.
    pub last_used_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for inserting a new secret.
#[derive(Debug, Clone)]
pub struct CreateSecret {
    pub organization_id: String,
    pub name: String,
    pub encrypted_value: Vec<u8>,
}
