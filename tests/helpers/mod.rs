//! Test backends and router bootstrap shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use frontdoor::auth::Authorizer;
use frontdoor::config::Config;
use frontdoor::server::Server;
use tokio::net::TcpListener;

/// Echo backend: responds to every request with
/// `Method <m> URL <p> BODY <b>` so tests can verify exactly what the router
/// delivered. Two special paths exist: `/show-headers` reports selected
/// request headers as JSON, and `/big.html` serves a compressible HTML body.
pub async fn spawn_echo_backend() -> SocketAddr {
    let app = axum::Router::new().fallback(echo);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn echo(req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();

    if parts.uri.path().starts_with("/show-headers") {
        let header = |name: &str| {
            parts
                .headers
                .get_all(name)
                .iter()
                .map(|v| v.to_str().unwrap_or_default().to_string())
                .collect::<Vec<_>>()
        };
        return axum::Json(serde_json::json!({
            "x-original-path": header("x-original-path"),
            "x-forwarded-for": header("x-forwarded-for"),
            "x-custom": header("x-custom"),
            "connection": header("connection"),
        }))
        .into_response();
    }

    if parts.uri.path() == "/big.html" {
        let body = "a".repeat(4096);
        return ([(axum::http::header::CONTENT_TYPE, "text/html")], body).into_response();
    }

    format!(
        "Method {} URL {} BODY {}",
        parts.method,
        parts.uri.path(),
        String::from_utf8_lossy(&bytes)
    )
    .into_response()
}

/// Build a router from the given JSON config and serve it on an ephemeral
/// port. Returns the bound address.
pub async fn spawn_router(config_json: &str) -> SocketAddr {
    let config = Config::from_json(config_json).expect("test config parses");
    let server = Server::new(&config).expect("router builds");
    serve(server).await
}

/// Same, but with a caller-supplied authorizer.
pub async fn spawn_router_with_authorizer(
    config_json: &str,
    authorizer: Arc<dyn Authorizer>,
) -> SocketAddr {
    let config = Config::from_json(config_json).expect("test config parses");
    let server = Server::with_authorizer(&config, authorizer).expect("router builds");
    serve(server).await
}

async fn serve(server: Arc<Server>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve_listener(listener, false));
    addr
}
