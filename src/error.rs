//! Request-time error types and their HTTP response mapping.
//!
//! Startup/validation failures live in [`crate::config::ConfigError`]; this
//! module covers everything that can go wrong while serving a single request.

use bytes::Bytes;
use http::StatusCode;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::Response;
use thiserror::Error;

/// Boxed error type used by streaming response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The single response body type produced by the router.
///
/// Error pages use [`Full`], forwarded responses use a stream body, and
/// upgrade responses are empty; boxing unifies them for the connection driver.
pub type RouterBody = UnsyncBoxBody<Bytes, BoxError>;

/// Build a complete in-memory body.
pub fn full_body(body: impl Into<Bytes>) -> RouterBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Build an empty body.
pub fn empty_body() -> RouterBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// Errors that can occur while routing and forwarding a single request.
#[derive(Debug, Error)]
pub enum RouterError {
    /// No route matched, or the rewritten host failed the whitelist check.
    /// The two are deliberately indistinguishable to the client.
    #[error("Route not found")]
    RouteNotFound,

    /// The Host header is on the blacklist.
    #[error("Illegal hostname: {0}")]
    IllegalHost(String),

    /// The backend transport failed before response headers arrived.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The rewritten URL carries a scheme no forwarder handles.
    #[error("Unrecognized forwarding URL: {0}")]
    UnknownScheme(String),

    /// The rewritten URL could not be parsed into scheme/host/path.
    #[error("Invalid forwarding URL: {0}")]
    InvalidTarget(String),

    /// A request to the ECS API did not match the expected URL shape.
    #[error("Unkown url to ECS API")]
    EcsUrl,

    /// Pass-through token acquisition failed; fails the current request only.
    #[error("{0}")]
    TokenRefresh(String),

    /// The caller may not reach this resource (e.g. another user's storage).
    #[error("{0}")]
    Forbidden(String),

    /// An upstream policy RPC (authorization or audit) rejected the request;
    /// its status code is forwarded to the client.
    #[error("{message}")]
    Denied {
        status: StatusCode,
        message: String,
    },

    /// UDP forwarding failed (pool exhausted or socket error).
    #[error("{0}")]
    Udp(String),

    /// Anything that indicates a router-side defect rather than a routing or
    /// backend condition.
    #[error("{0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

pub type RouterResult<T> = Result<T, RouterError>;

impl RouterError {
    /// Convert the error into the HTTP response written to the client.
    ///
    /// Bodies end with a newline, matching the plain-text error convention
    /// the backends and existing clients expect.
    pub fn to_response(&self) -> Response<RouterBody> {
        let (status, message) = match self {
            RouterError::RouteNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            RouterError::IllegalHost(_) => (StatusCode::IM_A_TEAPOT, String::new()),
            RouterError::Upstream(msg) => (StatusCode::GATEWAY_TIMEOUT, msg.clone()),
            RouterError::UnknownScheme(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unrecognized forwarding URL".to_string(),
            ),
            RouterError::EcsUrl => (StatusCode::BAD_REQUEST, self.to_string()),
            RouterError::TokenRefresh(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            RouterError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            RouterError::Denied { status, message } => (*status, message.clone()),
            RouterError::InvalidTarget(_)
            | RouterError::Udp(_)
            | RouterError::Internal(_)
            | RouterError::Io(_)
            | RouterError::Http(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let mut body = message;
        if !body.ends_with('\n') {
            body.push('\n');
        }

        Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full_body(body))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(full_body("Internal Server Error\n"));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_not_found_maps_to_404() {
        let resp = RouterError::RouteNotFound.to_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn illegal_host_maps_to_418() {
        let resp = RouterError::IllegalHost("yahoo.mail.com".into()).to_response();
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
    }

    #[test]
    fn upstream_maps_to_504() {
        let resp = RouterError::Upstream("connect refused".into()).to_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn denied_forwards_status() {
        let resp = RouterError::Denied {
            status: StatusCode::UNAUTHORIZED,
            message: "no session".into(),
        }
        .to_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
