//! Protocol-specific forwarders and the request plumbing they share.
//!
//! The server dispatches on the rewritten URL's scheme; each submodule owns
//! one protocol. Everything here streams: request and response bodies are
//! copied chunk by chunk, never collected (UDP excepted, where the body is
//! one datagram by definition).

pub mod http;
pub mod sse;
pub mod udp;
pub mod ws;

pub use udp::UdpConnectionPool;

use std::net::SocketAddr;

use ::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use ::http::{HeaderMap, HeaderValue};

/// Copy inbound headers onto the outbound request.
///
/// `Connection: close` is dropped: forwarding it would instruct the backend
/// to close its TCP connection after a single request, defeating the outbound
/// transport's keep-alive and surfacing as spurious EOFs on connection reuse.
/// Everything else passes through with value multiplicity intact, except the
/// transport-owned framing headers (`Host`, `Content-Length`,
/// `Transfer-Encoding`), which the outbound client derives from the rewritten
/// URL and the streamed body.
pub fn copy_request_headers(src: &HeaderMap) -> HeaderMap {
    let mut dst = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if name == HOST || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        if name == CONNECTION && value.as_bytes().eq_ignore_ascii_case(b"close") {
            continue;
        }
        dst.append(name, value.clone());
    }
    dst
}

/// The request URI exactly as the client composed it, up to (but excluding)
/// the first `?`.
///
/// Downstream request-signature verification needs the path the client
/// signed, not the rewritten one, so the raw request URI is sliced rather
/// than re-encoded from parsed components.
pub fn original_path(request_uri: &str) -> &str {
    match request_uri.find('?') {
        Some(question) => &request_uri[..question],
        None => request_uri,
    }
}

/// Append the client's address (port stripped) to `X-Forwarded-For`.
pub fn append_forwarded_for(outbound: &mut HeaderMap, peer: &SocketAddr) {
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        outbound.append("x-forwarded-for", value);
    }
}

/// Stamp the original request path onto the outbound request.
pub fn add_x_original_path(outbound: &mut HeaderMap, request_uri: &str) {
    if let Ok(value) = HeaderValue::from_str(original_path(request_uri)) {
        outbound.append("x-original-path", value);
    }
}
