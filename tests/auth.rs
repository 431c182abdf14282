//! Authorization through a live router: the external auth service contract
//! and the trait seam for custom authorizers.

mod helpers;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap as AxumHeaderMap;
use frontdoor::auth::{AuthOutcome, Authorizer, INTER_SERVICE_HEADER};
use helpers::{spawn_echo_backend, spawn_router, spawn_router_with_authorizer};
use http::{HeaderMap, StatusCode};
use tokio::net::TcpListener;

/// Mock credential-verification service: `Authorization: Bearer good` is the
/// only accepted session.
async fn spawn_auth_service() -> std::net::SocketAddr {
    use axum::routing::get;

    async fn check(headers: AxumHeaderMap) -> axum::response::Response {
        let authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if authorization == "Bearer good" {
            axum::response::IntoResponse::into_response(axum::Json(serde_json::json!({
                "UserId": 42,
                "Identity": "sam",
            })))
        } else {
            axum::response::IntoResponse::into_response((
                axum::http::StatusCode::UNAUTHORIZED,
                "no valid session",
            ))
        }
    }

    let app = axum::Router::new().route("/check", get(check));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn guarded_config(
    backend: std::net::SocketAddr,
    auth: std::net::SocketAddr,
    inter_service_key: &str,
) -> String {
    format!(
        r#"{{
            "Auth": {{ "URL": "http://{auth}", "InterServiceKey": "{inter_service_key}" }},
            "Targets": {{
                "GUARDED": {{
                    "URL": "http://{backend}",
                    "RequirePermission": "enabled"
                }}
            }},
            "Routes": {{
                "/guarded/(.*)": "{{GUARDED}}/$1",
                "/open/(.*)": "http://{backend}/$1"
            }}
        }}"#
    )
}

#[tokio::test]
async fn permissioned_routes_require_a_verified_session() {
    let backend = spawn_echo_backend().await;
    let auth = spawn_auth_service().await;
    let router = spawn_router(&guarded_config(backend, auth, "")).await;
    let client = reqwest::Client::new();

    // No credentials: the auth service's refusal passes through.
    let response = client
        .get(format!("http://{router}/guarded/data"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(response.text().await.unwrap(), "no valid session\n");

    // A verified session forwards.
    let response = client
        .get(format!("http://{router}/guarded/data"))
        .header("authorization", "Bearer good")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("Method GET URL /data"));

    // Routes without a permission stay anonymous.
    let response = client
        .get(format!("http://{router}/open/data"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn trusted_peers_skip_user_verification() {
    let backend = spawn_echo_backend().await;
    let auth = spawn_auth_service().await;
    let router = spawn_router(&guarded_config(backend, auth, "sekrit")).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{router}/guarded/data"))
        .header(INTER_SERVICE_HEADER, "sekrit")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // The wrong key falls back to user verification and fails.
    let response = client
        .get(format!("http://{router}/guarded/data"))
        .header(INTER_SERVICE_HEADER, "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

struct DenyEverything;

#[async_trait]
impl Authorizer for DenyEverything {
    async fn authorize(&self, _headers: &HeaderMap, permission: &str) -> AuthOutcome {
        if permission.is_empty() {
            return AuthOutcome::Allowed(None);
        }
        AuthOutcome::Denied {
            status: StatusCode::FORBIDDEN,
            message: "computer says no".to_string(),
        }
    }

    async fn add_to_audit_log(
        &self,
        _headers: &HeaderMap,
        _did_what: &str,
        _to_what: &str,
        _context: &str,
    ) -> Result<(), (StatusCode, String)> {
        Ok(())
    }
}

#[tokio::test]
async fn custom_authorizers_plug_into_the_pipeline() {
    let backend = spawn_echo_backend().await;
    let auth = spawn_auth_service().await;
    let router = spawn_router_with_authorizer(
        &guarded_config(backend, auth, ""),
        Arc::new(DenyEverything),
    )
    .await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{router}/guarded/data"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    assert_eq!(response.text().await.unwrap(), "computer says no\n");

    // Anonymous routes bypass the authorizer entirely.
    let response = client
        .get(format!("http://{router}/open/data"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}
