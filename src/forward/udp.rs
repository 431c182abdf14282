//! UDP forwarding and the bounded outbound socket pool.
//!
//! UDP is connectionless, so forwarding is trivial: the whole request body is
//! one datagram. The pool exists to avoid ephemeral-port exhaustion when many
//! requests fan out to the same telemetry destinations: each destination gets
//! one connected socket, reused for the life of the process. The map lock is
//! held only across lookup and insert, never across socket I/O (datagram
//! sends on a shared socket are safe without it).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use http::{Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{empty_body, RouterBody, RouterError, RouterResult};
use crate::translator::split_url;

pub const DEFAULT_UDP_POOL_LIMIT: usize = 100;

/// Bounded map of destination `host:port` to a connected outbound socket.
///
/// Invariant: the pool never holds more than `limit` sockets. Once the cap is
/// reached, sends to new destinations fail fast rather than allocate.
#[derive(Debug)]
pub struct UdpConnectionPool {
    conns: Mutex<HashMap<String, Arc<UdpSocket>>>,
    limit: usize,
}

impl Default for UdpConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpConnectionPool {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_UDP_POOL_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            limit,
        }
    }

    /// Number of live pooled sockets.
    pub fn size(&self) -> usize {
        self.conns.lock().expect("udp pool lock poisoned").len()
    }

    /// Send one datagram to `dest` (`host:port`), reusing or allocating the
    /// destination's socket. Partial writes are ignored; a datagram either
    /// goes out whole or the OS reports an error.
    pub async fn send(&self, dest: &str, payload: &[u8]) -> RouterResult<()> {
        let socket = match self.lookup(dest)? {
            Some(socket) => socket,
            None => self.allocate(dest).await?,
        };

        socket
            .send(payload)
            .await
            .map_err(|e| RouterError::Udp(format!("UDP send to {dest} failed: {e}")))?;
        Ok(())
    }

    fn lookup(&self, dest: &str) -> RouterResult<Option<Arc<UdpSocket>>> {
        let conns = self.conns.lock().expect("udp pool lock poisoned");
        if let Some(socket) = conns.get(dest) {
            return Ok(Some(socket.clone()));
        }
        if conns.len() >= self.limit {
            return Err(RouterError::Udp(
                "UDP connection pool limit reached".to_string(),
            ));
        }
        Ok(None)
    }

    async fn allocate(&self, dest: &str) -> RouterResult<Arc<UdpSocket>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| RouterError::Udp(format!("UDP bind failed: {e}")))?;
        socket
            .connect(dest)
            .await
            .map_err(|e| RouterError::Udp(format!("UDP connect to {dest} failed: {e}")))?;
        let socket = Arc::new(socket);

        let mut conns = self.conns.lock().expect("udp pool lock poisoned");
        if let Some(existing) = conns.get(dest) {
            // Lost the allocation race; the first socket in wins.
            return Ok(existing.clone());
        }
        if conns.len() >= self.limit {
            return Err(RouterError::Udp(
                "UDP connection pool limit reached".to_string(),
            ));
        }
        conns.insert(dest.to_string(), socket.clone());
        debug!(dest = dest, pool_size = conns.len(), "Pooled new UDP socket");
        Ok(socket)
    }
}

/// Forward the request body as a single datagram to the rewritten
/// `udp://host:port` destination.
pub async fn forward_udp(
    pool: &UdpConnectionPool,
    body: Incoming,
    newurl: &str,
) -> RouterResult<Response<RouterBody>> {
    let (_, host, _) =
        split_url(newurl).ok_or_else(|| RouterError::InvalidTarget(newurl.to_string()))?;

    let payload = body.collect().await?.to_bytes();
    pool.send(host, &payload).await?;

    Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .map_err(|e| RouterError::Internal(format!("Failed to build response: {e}")))
}
