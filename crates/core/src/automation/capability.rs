//! The capability surface exposed to automation scripts.
//!
//! A script sees exactly the bindings described here and nothing else: a
//! console sink, org-scoped secret lookup, a budgeted HTTP client, HTML
//! selector queries, and the list of secret *names* available to it. All
//! privileged operations are mediated back to the host through
//! [`CapabilityHost`]; the script-side runner holds no credentials and no
//! ambient process, environment, or filesystem access.

use std::time::Duration;

use async_trait::async_trait;

use crate::identity::ExecutionRequest;

use super::protocol::{HttpCallParams, HttpCallResult};

/// Hard wall-clock deadline for one run. Fixed; not script-configurable.
pub const EXECUTION_DEADLINE: Duration = Duration::from_secs(300);

/// Maximum HTTP requests a single run may issue.
pub const MAX_HTTP_REQUESTS_PER_RUN: u32 = 50;

/// Maximum HTTP request body size (1 MiB).
pub const MAX_HTTP_REQUEST_BYTES: usize = 1024 * 1024;

/// Maximum HTTP response body size (10 MiB).
pub const MAX_HTTP_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Per-request timeout for mediated HTTP calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP methods a script may use.
const ALLOWED_HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

/// Check whether `method` is on the capability allow-list.
pub fn http_method_allowed(method: &str) -> bool {
    ALLOWED_HTTP_METHODS
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(method))
}

/// Outcome of a mediated secret lookup.
///
/// Everything except `Resolved` reaches the script as `null`, never as a
/// thrown error, so a script's defensive `if (!secret)` path is the only
/// one it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretResolution {
    /// The decrypted secret value.
    Resolved(String),
    /// The requesting organization id did not match the run's organization.
    Denied,
    /// No secret with that name exists for the organization.
    NotFound,
    /// The stored blob could not be decrypted.
    Undecryptable,
}

/// The fixed, enumerable binding set for one run.
///
/// Exactly one context exists per [`ExecutionRequest`]; it is built after
/// the run's secrets are fetched and discarded when the run ends. Contexts
/// are never cached or shared between runs.
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    organization_id: String,
    task_id: String,
    secret_names: Vec<String>,
}

impl CapabilityContext {
    /// Build the context for one run. Pure and synchronous: the secrets
    /// were already batch-fetched, and only their names are captured here.
    pub fn build(request: &ExecutionRequest, secret_names: Vec<String>) -> Self {
        Self {
            organization_id: request.organization_id.clone(),
            task_id: request.task_id.clone(),
            secret_names,
        }
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Names (never values) of the secrets this run may look up.
    pub fn secret_names(&self) -> &[String] {
        &self.secret_names
    }

    /// Re-validate a script-supplied organization id against the run's own.
    ///
    /// Guards against a context-construction bug handing the script a
    /// lookup function callable with a forged organization id.
    pub fn authorizes_secret_access(&self, request_organization_id: &str) -> bool {
        request_organization_id == self.organization_id
    }
}

/// Host-side servicing of mediated capability calls.
///
/// Implementations perform the actual secret decryption, HTTP transport,
/// and HTML parsing. Policy (organization re-validation, request budgets,
/// size caps) is enforced by the sandbox pump before calls reach the host.
#[async_trait]
pub trait CapabilityHost: Send + Sync {
    /// Resolve a secret by name for the run's organization.
    async fn secret_get(&self, context: &CapabilityContext, name: &str) -> SecretResolution;

    /// Perform an HTTP request on the script's behalf.
    async fn http_request(
        &self,
        context: &CapabilityContext,
        params: &HttpCallParams,
    ) -> Result<HttpCallResult, String>;

    /// Run a CSS selector query over an HTML document, returning the text
    /// (or attribute value) of each match.
    fn html_select(
        &self,
        html: &str,
        selector: &str,
        attr: Option<&str>,
    ) -> Result<Vec<String>, String>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ExecutionRequest;

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("org_1", "t_1", None).expect("valid request")
    }

    #[test]
    fn context_captures_names_not_values() {
        let context =
            CapabilityContext::build(&request(), vec!["api_token".into(), "portal_pw".into()]);
        assert_eq!(context.secret_names(), ["api_token", "portal_pw"]);
        assert_eq!(context.organization_id(), "org_1");
        assert_eq!(context.task_id(), "t_1");
    }

    #[test]
    fn same_organization_is_authorized() {
        let context = CapabilityContext::build(&request(), vec![]);
        assert!(context.authorizes_secret_access("org_1"));
    }

    #[test]
    fn mismatched_organization_is_denied() {
        let context = CapabilityContext::build(&request(), vec![]);
        assert!(!context.authorizes_secret_access("org_2"));
        assert!(!context.authorizes_secret_access(""));
    }

    #[test]
    fn http_method_allow_list() {
        assert!(http_method_allowed("GET"));
        assert!(http_method_allowed("post"));
        assert!(http_method_allowed("Delete"));
        assert!(!http_method_allowed("TRACE"));
        assert!(!http_method_allowed("CONNECT"));
        assert!(!http_method_allowed(""));
    }
}
