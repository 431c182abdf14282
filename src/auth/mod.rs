//! Caller authorization against the external credential-verification service.
//!
//! The router performs two kinds of authentication. This module covers the
//! first: deciding whether the *caller* may use a route at all. The second -
//! credentials the router injects *toward the backend* - lives in
//! [`passthrough`].

pub mod passthrough;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use tracing::{error, info};

use crate::config::ConfigAuth;

/// Header carrying the shared inter-service trust key.
pub const INTER_SERVICE_HEADER: &str = "x-inter-service-key";

/// Identity of an authorized caller, as returned by the auth service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthToken {
    #[serde(rename = "UserId")]
    pub user_id: i64,
    #[serde(default, rename = "Identity")]
    pub identity: String,
}

/// Outcome of an authorization check.
#[derive(Debug)]
pub enum AuthOutcome {
    /// The request may proceed. The token is present when a user session was
    /// verified, absent for anonymous and inter-service access.
    Allowed(Option<AuthToken>),
    /// The request must stop; write `status`/`message` to the client.
    Denied {
        status: StatusCode,
        message: String,
    },
}

/// The authorization seam. Production uses [`AuthClient`]; tests substitute
/// their own implementations.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Check that the caller behind `headers` holds `permission`.
    async fn authorize(&self, headers: &HeaderMap, permission: &str) -> AuthOutcome;

    /// Record a user action in the central audit log.
    async fn add_to_audit_log(
        &self,
        headers: &HeaderMap,
        did_what: &str,
        to_what: &str,
        context: &str,
    ) -> Result<(), (StatusCode, String)>;
}

/// HTTP client for the external auth service.
pub struct AuthClient {
    client: reqwest::Client,
    config: ConfigAuth,
}

impl AuthClient {
    pub fn new(client: reqwest::Client, config: ConfigAuth) -> Self {
        Self { client, config }
    }

    /// A peer service presenting the shared key is trusted without a user
    /// session. The signing scheme itself belongs to the auth service; the
    /// router only honors the verdict.
    fn is_trusted_peer(&self, headers: &HeaderMap) -> bool {
        if self.config.inter_service_key.is_empty() {
            return false;
        }
        headers
            .get(INTER_SERVICE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == self.config.inter_service_key)
            .unwrap_or(false)
    }

    /// Copy the caller's credentials onto an outgoing auth-service request.
    fn forward_credentials(
        &self,
        mut builder: reqwest::RequestBuilder,
        headers: &HeaderMap,
    ) -> reqwest::RequestBuilder {
        for name in [http::header::AUTHORIZATION, http::header::COOKIE] {
            for value in headers.get_all(&name) {
                builder = builder.header(&name, value);
            }
        }
        builder
    }
}

#[async_trait]
impl Authorizer for AuthClient {
    async fn authorize(&self, headers: &HeaderMap, permission: &str) -> AuthOutcome {
        if permission.is_empty() {
            return AuthOutcome::Allowed(None);
        }

        if self.is_trusted_peer(headers) {
            return AuthOutcome::Allowed(None);
        }

        let url = format!("{}/check", self.config.url.trim_end_matches('/'));
        let request = self
            .forward_credentials(self.client.get(&url), headers)
            .query(&[("perm", permission)]);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, url = %url, "Auth service unreachable");
                return AuthOutcome::Denied {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    message: format!("Authorization service unreachable: {e}"),
                };
            }
        };

        let status = response.status();
        if status == StatusCode::OK {
            match response.json::<AuthToken>().await {
                Ok(token) => AuthOutcome::Allowed(Some(token)),
                Err(e) => {
                    error!(error = %e, "Malformed auth service response");
                    AuthOutcome::Denied {
                        status: StatusCode::SERVICE_UNAVAILABLE,
                        message: format!("Malformed authorization response: {e}"),
                    }
                }
            }
        } else {
            let message = response.text().await.unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED {
                // Unauthorized requests are routine; keep them out of the
                // error stream.
                info!(permission = permission, "Authorization refused");
            } else {
                error!(status = %status, permission = permission, message = %message, "Authorization failed");
            }
            AuthOutcome::Denied { status, message }
        }
    }

    async fn add_to_audit_log(
        &self,
        headers: &HeaderMap,
        did_what: &str,
        to_what: &str,
        context: &str,
    ) -> Result<(), (StatusCode, String)> {
        let url = format!("{}/auditlog", self.config.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "DidWhat": did_what,
            "ToWhat": to_what,
            "Context": context,
        });

        let response = self
            .forward_credentials(self.client.post(&url), headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("Audit log service unreachable: {e}"),
                )
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response.text().await.unwrap_or_default();
            Err((status, message))
        }
    }
}
