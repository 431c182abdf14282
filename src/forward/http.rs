//! HTTP(S) forwarding.
//!
//! The outbound request copies the inbound method and headers and streams the
//! body through untouched; the response streams back the same way. The only
//! transformation the router ever applies to content is the optional gzip
//! pass, and that too is streaming: each upstream chunk is fed through the
//! encoder and whatever compressed bytes fall out are flushed to the client.

use std::collections::HashSet;
use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use flate2::write::GzEncoder;
use flate2::Compression;
use http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    TRANSFER_ENCODING, VARY,
};
use http::{HeaderMap, Response};
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::Request;
use tracing::warn;

use crate::error::{BoxError, RouterBody, RouterError, RouterResult};

/// Forward one HTTP request to `newurl` and stream the response back.
pub async fn forward_http(
    client: &reqwest::Client,
    gzip_whitelist: &HashSet<String>,
    response_header_timeout: Option<Duration>,
    req: Request<Incoming>,
    outbound: HeaderMap,
    newurl: &str,
) -> RouterResult<Response<RouterBody>> {
    let url = reqwest::Url::parse(newurl)
        .map_err(|e| RouterError::InvalidTarget(format!("{newurl}: {e}")))?;

    let (parts, body) = req.into_parts();
    let accept_encoding = parts
        .headers
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let body_stream = BodyStream::new(body)
        .try_filter_map(|frame| async move { Ok::<_, hyper::Error>(frame.into_data().ok()) });

    let send = client
        .request(parts.method, url)
        .headers(outbound)
        .body(reqwest::Body::wrap_stream(body_stream))
        .send();

    let response = match response_header_timeout {
        Some(timeout) => tokio::time::timeout(timeout, send).await.map_err(|_| {
            RouterError::Upstream(format!(
                "timed out waiting for response headers from {newurl}"
            ))
        })?,
        None => send.await,
    }
    .map_err(|e| RouterError::Upstream(e.to_string()))?;

    let status = response.status();
    let headers = response.headers().clone();

    // Only compress when the backend hasn't already, the client can take it,
    // and the content type (sans parameters) is whitelisted.
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let trimmed_type = content_type.split(';').next().unwrap_or_default();
    let apply_gzip = headers.get(CONTENT_ENCODING).is_none()
        && accept_encoding.contains("gzip")
        && gzip_whitelist.contains(trimmed_type);

    let declared_length: Option<u64> = if headers.get(TRANSFER_ENCODING).is_none() {
        headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    } else {
        None
    };

    let upstream = count_body(response.bytes_stream().boxed(), declared_length);

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if name == CONNECTION || name == TRANSFER_ENCODING {
            continue;
        }
        if apply_gzip && name == CONTENT_LENGTH {
            // Compressing invalidates the original length, and the final
            // compressed size isn't known without buffering.
            continue;
        }
        builder = builder.header(name, value);
    }

    let body: RouterBody = if apply_gzip {
        builder = builder.header(CONTENT_ENCODING, "gzip");
        if headers.get(VARY).is_none() {
            builder = builder.header(VARY, "Accept-Encoding");
        }
        StreamBody::new(gzip_stream(upstream).map_ok(Frame::data)).boxed_unsync()
    } else {
        StreamBody::new(upstream.map_ok(Frame::data)).boxed_unsync()
    };

    builder
        .body(body)
        .map_err(|e| RouterError::Internal(format!("Failed to build response: {e}")))
}

/// Pass the body through while tracking how many bytes actually flowed; a
/// non-chunked response whose copied byte count disagrees with its declared
/// `Content-Length` logs a warning but is not failed.
fn count_body<S>(
    stream: S,
    declared: Option<u64>,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Unpin
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin + Send + 'static,
{
    futures_util::stream::unfold(
        (stream, 0u64, false),
        move |(mut stream, written, done)| async move {
            if done {
                return None;
            }
            match stream.next().await {
                Some(Ok(chunk)) => {
                    let written = written + chunk.len() as u64;
                    Some((Ok(chunk), (stream, written, false)))
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to copy response body");
                    Some((Err(Box::new(e) as BoxError), (stream, written, true)))
                }
                None => {
                    if let Some(declared) = declared {
                        if declared > 0 && written != declared {
                            warn!(
                                declared = declared,
                                copied = written,
                                "Incorrect amount of data copied from response body"
                            );
                        }
                    }
                    None
                }
            }
        },
    )
    .boxed()
}

/// Streaming gzip: every upstream chunk is written through the encoder and
/// sync-flushed so compressed output keeps pace with the backend instead of
/// pooling in a buffer.
fn gzip_stream<S>(upstream: S) -> impl Stream<Item = Result<Bytes, BoxError>>
where
    S: Stream<Item = Result<Bytes, BoxError>> + Unpin,
{
    enum State<S> {
        Streaming(S, GzEncoder<Vec<u8>>),
        Done,
    }

    futures_util::stream::unfold(
        State::Streaming(upstream, GzEncoder::new(Vec::new(), Compression::default())),
        |state| async move {
            let State::Streaming(mut upstream, mut encoder) = state else {
                return None;
            };
            loop {
                match upstream.next().await {
                    Some(Ok(chunk)) => {
                        if let Err(e) = encoder
                            .write_all(&chunk)
                            .and_then(|()| encoder.flush())
                        {
                            return Some((Err(Box::new(e) as BoxError), State::Done));
                        }
                        let compressed = std::mem::take(encoder.get_mut());
                        if compressed.is_empty() {
                            continue;
                        }
                        return Some((
                            Ok(Bytes::from(compressed)),
                            State::Streaming(upstream, encoder),
                        ));
                    }
                    Some(Err(e)) => return Some((Err(e), State::Done)),
                    None => {
                        return match encoder.finish() {
                            Ok(tail) => Some((Ok(Bytes::from(tail)), State::Done)),
                            Err(e) => Some((Err(Box::new(e) as BoxError), State::Done)),
                        };
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[tokio::test]
    async fn gzip_stream_round_trips() {
        let chunks: Vec<Result<Bytes, BoxError>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"streaming ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let stream = futures_util::stream::iter(chunks);

        let compressed: Vec<Bytes> = gzip_stream(stream.boxed())
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
            .await;
        // One compressed chunk per input chunk, plus the trailer.
        assert!(compressed.len() >= 2);

        let joined: Vec<u8> = compressed.concat();
        let mut decoder = GzDecoder::new(&joined[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello streaming world");
    }
}
