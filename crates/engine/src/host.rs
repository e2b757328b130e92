//! The engine's capability host: real transport behind the mediated
//! capability surface.
//!
//! One host exists per run, holding that run's secret batch. Policy
//! (organization re-validation, request budgets, size caps) is enforced by
//! the sandbox pump before calls arrive here; this type performs the
//! actual decryption, HTTP transport, and HTML parsing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use scraper::{Html, Selector};

use pact_core::automation::capability::{
    CapabilityContext, CapabilityHost, SecretResolution, MAX_HTTP_RESPONSE_BYTES,
};
use pact_core::automation::protocol::{HttpCallParams, HttpCallResult};

use crate::secrets::{RunSecrets, SecretAccessor};

/// Per-run capability host.
pub struct EngineCapabilityHost {
    secrets: Arc<SecretAccessor>,
    batch: RunSecrets,
    http: reqwest::Client,
}

impl EngineCapabilityHost {
    pub fn new(secrets: Arc<SecretAccessor>, batch: RunSecrets, http: reqwest::Client) -> Self {
        Self {
            secrets,
            batch,
            http,
        }
    }
}

#[async_trait]
impl CapabilityHost for EngineCapabilityHost {
    async fn secret_get(&self, context: &CapabilityContext, name: &str) -> SecretResolution {
        // The pump already re-validated the script-supplied organization
        // id; this guards the batch itself against a miswired context.
        if self.batch.organization_id() != context.organization_id() {
            return SecretResolution::Denied;
        }

        self.secrets.resolve(&self.batch, name)
    }

    async fn http_request(
        &self,
        _context: &CapabilityContext,
        params: &HttpCallParams,
    ) -> Result<HttpCallResult, String> {
        let method = reqwest::Method::from_bytes(params.method.as_bytes())
            .map_err(|_| format!("invalid http method: {}", params.method))?;

        let mut request = self.http.request(method, &params.url);
        for (name, value) in &params.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &params.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("http request failed: {e}"))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("failed to read response body: {e}"))?;

        if bytes.len() > MAX_HTTP_RESPONSE_BYTES {
            return Err(format!(
                "response body too large: {} > {MAX_HTTP_RESPONSE_BYTES}",
                bytes.len()
            ));
        }

        Ok(HttpCallResult {
            status,
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    fn html_select(
        &self,
        html: &str,
        selector: &str,
        attr: Option<&str>,
    ) -> Result<Vec<String>, String> {
        let selector =
            Selector::parse(selector).map_err(|_| format!("invalid css selector: {selector}"))?;
        let document = Html::parse_document(html);

        Ok(document
            .select(&selector)
            .map(|element| match attr {
                Some(attr) => element.value().attr(attr).unwrap_or_default().to_string(),
                None => element.text().collect::<Vec<_>>().join(""),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use base64::Engine as _;

    use crate::secrets::{SecretCipher, SecretStore, SECRET_KEY_BYTES};

    use super::*;

    fn host_without_secrets() -> EngineCapabilityHost {
        struct EmptyStore;

        #[async_trait]
        impl SecretStore for EmptyStore {
            async fn list_for_organization(
                &self,
                _organization_id: &str,
            ) -> Result<Vec<pact_db::models::secret::SecretRecord>, sqlx::Error> {
                Ok(Vec::new())
            }

            async fn touch_last_used(&self, _id: i64) -> Result<(), sqlx::Error> {
                Ok(())
            }
        }

        let key = base64::engine::general_purpose::STANDARD.encode([1u8; SECRET_KEY_BYTES]);
        let cipher = SecretCipher::from_base64(&key).expect("cipher");
        let accessor = Arc::new(SecretAccessor::new(Arc::new(EmptyStore), cipher));
        EngineCapabilityHost::new(accessor, RunSecrets::empty("org_1"), reqwest::Client::new())
    }

    #[test]
    fn html_select_extracts_text() {
        let host = host_without_secrets();
        let html = r#"<html><body>
            <ul><li class="row">one</li><li class="row">two</li></ul>
        </body></html>"#;

        let matches = host.html_select(html, "li.row", None).expect("select");
        assert_eq!(matches, vec!["one", "two"]);
    }

    #[test]
    fn html_select_extracts_attributes() {
        let host = host_without_secrets();
        let html = r#"<a href="/reports/1">first</a><a href="/reports/2">second</a>"#;

        let matches = host.html_select(html, "a", Some("href")).expect("select");
        assert_eq!(matches, vec!["/reports/1", "/reports/2"]);
    }

    #[test]
    fn html_select_rejects_bad_selector() {
        let host = host_without_secrets();
        let err = host.html_select("<p>x</p>", "p[", None).expect_err("bad selector");
        assert!(err.contains("invalid css selector"));
    }

    #[test]
    fn html_select_no_matches_is_empty() {
        let host = host_without_secrets();
        let matches = host
            .html_select("<p>x</p>", "table td", None)
            .expect("select");
        assert!(matches.is_empty());
    }
}
