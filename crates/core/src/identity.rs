//! Execution request identity and script storage addressing.
//!
//! Organization and task identifiers double as storage-key components
//! (`{organization_id}/{task_id}.automation.js`), so validation rejects
//! anything that could change the shape of the derived key.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum length of an organization or task identifier.
const MAX_IDENTIFIER_LEN: usize = 128;

/// File suffix of every stored automation script object.
pub const SOURCE_KEY_SUFFIX: &str = ".automation.js";

/// Validate an organization or task identifier.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_IDENTIFIER_LEN` characters.
/// - Must start with an alphanumeric character.
/// - May contain only alphanumeric, hyphen, underscore, or dot characters.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::Validation(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::Validation(format!(
            "{kind} must not exceed {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if !value.chars().next().is_some_and(|c| c.is_alphanumeric()) {
        return Err(CoreError::Validation(format!(
            "{kind} must start with an alphanumeric character"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(format!(
            "{kind} may only contain alphanumeric, hyphen, underscore, or dot characters"
        )));
    }
    Ok(())
}

/// Identifies which script to run and for whom.
///
/// Immutable for the lifetime of one run; the queue controller creates one
/// per triggered automation and the engine never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub organization_id: String,
    pub task_id: String,
    pub sandbox_id: Option<String>,
}

impl ExecutionRequest {
    /// Build a validated request.
    pub fn new(
        organization_id: impl Into<String>,
        task_id: impl Into<String>,
        sandbox_id: Option<String>,
    ) -> Result<Self, CoreError> {
        let organization_id = organization_id.into();
        let task_id = task_id.into();
        validate_identifier("organization id", &organization_id)?;
        validate_identifier("task id", &task_id)?;
        Ok(Self {
            organization_id,
            task_id,
            sandbox_id,
        })
    }

    /// Object-storage key of this request's script source.
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}{SOURCE_KEY_SUFFIX}",
            self.organization_id, self.task_id
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
