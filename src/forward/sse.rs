//! Server-sent events forwarded through an HTTP/2 cleartext upgrade.
//!
//! Backends expose long-lived event streams over h2c so that the browser
//! carries them on its multiplexed HTTPS connection instead of burning one of
//! its few HTTP/1.1 connection slots. The router's job is to ask the backend
//! for the upgrade and then relay the stream: small chunks, flushed as they
//! arrive, until the backend ends the stream or the client goes away.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http::header::{ACCEPT, CONNECTION, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, Response};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tracing::info;

use crate::error::{BoxError, RouterBody, RouterError, RouterResult};

/// Event streams may idle for a long time; cap them at twenty minutes.
const SSE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Relay copies at most this many bytes per write so events reach the client
/// promptly even when the backend batches its output.
const SSE_CHUNK: usize = 255;

/// Forward an SSE request. `newurl` carries the route's SSE scheme variant;
/// `secure` selects whether the backend leg is https.
pub async fn forward_sse(
    client: &reqwest::Client,
    method: Method,
    mut outbound: HeaderMap,
    newurl: &str,
    secure: bool,
) -> RouterResult<Response<RouterBody>> {
    let url = if secure {
        newurl.replacen("sses://", "https://", 1)
    } else {
        newurl.replacen("sse://", "http://", 1)
    };

    outbound.append(ACCEPT, HeaderValue::from_static("text/event-stream"));
    outbound.insert(CONNECTION, HeaderValue::from_static("Upgrade, HTTP2-Settings"));
    outbound.insert(UPGRADE, HeaderValue::from_static("h2c"));
    let settings = HeaderValue::from_str(&http2_settings_payload())
        .map_err(|e| RouterError::Internal(format!("Invalid HTTP2-Settings value: {e}")))?;
    outbound.insert("http2-settings", settings);

    let response = client
        .request(method, &url)
        .headers(outbound)
        .timeout(SSE_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            info!(error = %e, url = %url, "SSE backend request failed");
            RouterError::Internal(e.to_string())
        })?;

    let status = response.status();
    let headers = response.headers().clone();

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if name == CONNECTION || name == TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }

    let body = StreamBody::new(rechunk(response.bytes_stream().boxed()).map(|r| r.map(Frame::data)));
    builder
        .body(body.boxed_unsync())
        .map_err(|e| RouterError::Internal(format!("Failed to build response: {e}")))
}

/// Split the backend stream into chunks of at most [`SSE_CHUNK`] bytes.
/// Each chunk becomes its own frame, which the connection flushes
/// immediately. A read error ends the stream; there is nothing useful left
/// to tell a client that is mid-stream.
fn rechunk<S>(upstream: S) -> impl Stream<Item = Result<Bytes, BoxError>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    futures_util::stream::unfold(
        (upstream, BytesMut::new(), false),
        |(mut upstream, mut pending, done)| async move {
            if done {
                return None;
            }
            loop {
                if !pending.is_empty() {
                    let take = pending.len().min(SSE_CHUNK);
                    let chunk = pending.split_to(take).freeze();
                    return Some((Ok(chunk), (upstream, pending, false)));
                }
                match upstream.next().await {
                    Some(Ok(bytes)) => {
                        pending.extend_from_slice(&bytes);
                    }
                    Some(Err(e)) => {
                        info!(error = %e, "Could not read SSE body");
                        return None;
                    }
                    None => return None,
                }
            }
        },
    )
}

/// The HTTP2-Settings handshake payload: (identifier, value) pairs encoded
/// big-endian, then base64 (URL-safe alphabet, no padding) per RFC 7540 §3.2.1.
fn http2_settings_payload() -> String {
    // SETTINGS_MAX_CONCURRENT_STREAMS = 10, SETTINGS_INITIAL_WINDOW_SIZE = 65535
    let settings: [(u16, u32); 2] = [(0x3, 10), (0x4, 65535)];
    let mut buf = Vec::with_capacity(settings.len() * 6);
    for (id, value) in settings {
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&value.to_be_bytes());
    }
    URL_SAFE_NO_PAD.encode(buf)
}
