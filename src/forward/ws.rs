//! WebSocket forwarding.
//!
//! The router completes the client's upgrade handshake itself, dials the
//! backend with the rewritten `ws://` URL, and then runs two copy loops until
//! both directions have finished. Closing either side tears the other down.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::header::{
    CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderValue, Response, StatusCode};
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error};

use crate::error::{empty_body, RouterBody, RouterError, RouterResult};
use crate::translator::split_url;

/// RFC 6455 handshake GUID.
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Accept the client's WebSocket upgrade and splice it to the backend at
/// `newurl`. The returned response completes the handshake; the copy loops
/// run in a spawned task that lives as long as the connection.
pub async fn forward_websocket(
    req: Request<Incoming>,
    newurl: &str,
) -> RouterResult<Response<RouterBody>> {
    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RouterError::Internal("Missing Sec-WebSocket-Key header".to_string()))?;

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID);
    let accept = BASE64_STANDARD.encode(hasher.finalize());

    let backend_request = build_backend_request(&req, newurl)?;

    let newurl = newurl.to_string();
    tokio::spawn(async move {
        if let Err(e) = splice(req, backend_request).await {
            error!(error = %e, url = %newurl, "WebSocket forwarding ended with error");
        }
    });

    let accept = HeaderValue::from_str(&accept)
        .map_err(|e| RouterError::Internal(format!("Invalid accept key: {e}")))?;
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(empty_body())
        .map_err(|e| RouterError::Internal(format!("Failed to build response: {e}")))
}

/// The backend handshake reuses the client's headers, minus the ones the
/// handshake itself owns (key, version, extensions) and the connection
/// management set, which the WebSocket client supplies afresh.
fn build_backend_request(
    req: &Request<Incoming>,
    newurl: &str,
) -> RouterResult<Request<()>> {
    let (_, host, _) =
        split_url(newurl).ok_or_else(|| RouterError::InvalidTarget(newurl.to_string()))?;

    let mut builder = Request::builder().uri(newurl).header(HOST, host);
    for (name, value) in req.headers() {
        if name == HOST
            || name == CONNECTION
            || name == UPGRADE
            || name == SEC_WEBSOCKET_KEY
            || name == SEC_WEBSOCKET_VERSION
            || name == SEC_WEBSOCKET_EXTENSIONS
        {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .body(())
        .map_err(|e| RouterError::InvalidTarget(format!("{newurl}: {e}")))
}

async fn splice(
    req: Request<Incoming>,
    backend_request: Request<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let upgraded = hyper::upgrade::on(req).await?;
    let client_ws =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

    let (backend_ws, _) = tokio_tungstenite::connect_async(backend_request).await?;

    let (client_tx, client_rx) = client_ws.split();
    let (backend_tx, backend_rx) = backend_ws.split();

    let to_backend = tokio::spawn(copy_messages(client_rx, backend_tx));
    let to_client = tokio::spawn(copy_messages(backend_rx, client_tx));

    // The handler is done only once both directions have drained.
    let _ = to_backend.await;
    let _ = to_client.await;
    debug!("WebSocket forwarding finished");
    Ok(())
}

/// Pump messages from one side to the other. A close frame (or any read or
/// write failure) ends the loop and closes the destination, which in turn
/// ends the opposite loop.
async fn copy_messages<R, W>(mut from: R, mut to: W)
where
    R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    W: Sink<Message> + Unpin,
{
    while let Some(message) = from.next().await {
        match message {
            Ok(message) if message.is_close() => break,
            Ok(message) => {
                if to.send(message).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = to.send(Message::Close(None)).await;
    let _ = to.close().await;
}
