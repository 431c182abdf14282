//! frontdoor - reverse-proxy request router.
//!
//! frontdoor sits between external clients and a fleet of backend services.
//! Every inbound request flows through a single pipeline:
//!
//! 1. The front server ([`server::Server`]) accepts the connection and handles
//!    the endpoints the router owns itself (ping, HTTPS redirect, static WSDL).
//! 2. The URL translator ([`translator::RouteSet`]) rewrites the incoming URL
//!    into a backend URL using a compile-once, match-many rule table.
//! 3. The authorization client ([`auth::AuthClient`]) checks the caller's
//!    permission against the external auth service when the route demands it.
//! 4. Pass-through authentication ([`auth::passthrough`]) injects per-target
//!    credentials toward the backend.
//! 5. The forwarder ([`forward`]) dispatches on the rewritten URL's scheme:
//!    HTTP(S), SSE over h2c, WebSocket, or UDP.
//!
//! Bodies stream end to end; the router never buffers a whole request or
//! response (the single exception is UDP, where the request body becomes one
//! datagram).

pub mod auth;
pub mod config;
pub mod error;
pub mod forward;
pub mod server;
pub mod translator;
