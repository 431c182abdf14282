//! Configuration schema.
//!
//! The configuration document is JSON with PascalCase keys:
//!
//! ```json
//! {
//!   "HTTP": {
//!     "Port": 80,
//!     "EnableHTTPS": true,
//!     "AutomaticGzip": { "Whitelist": ["text/html"] }
//!   },
//!   "Targets": {
//!     "Crud": {
//!       "URL": "http://crud",
//!       "RequirePermission": "enabled",
//!       "PassThroughAuth": { "Type": "SitePro", "Username": "u", "Password": "p" }
//!     }
//!   },
//!   "Routes": {
//!     "/crud/(.*)": "{Crud}/$1",
//!     "/tile/(.*)": { "Target": "http://$1", "ValidHosts": ["tile1"] }
//!   }
//! }
//! ```
//!
//! Route values are kept as raw [`serde_json::Value`]s and shape-checked by
//! hand in [`Config::route_specs`](crate::config::Config::route_specs) so
//! that a malformed entry fails with a message naming the offending match.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "HTTP")]
    pub http: ConfigHttp,
    #[serde(rename = "Targets")]
    pub targets: BTreeMap<String, ConfigTarget>,
    #[serde(rename = "Routes")]
    pub routes: BTreeMap<String, Value>,
    #[serde(rename = "Proxy")]
    pub proxy: String,
    #[serde(rename = "AccessLog")]
    pub access_log: String,
    #[serde(rename = "ErrorLog")]
    pub error_log: String,
    #[serde(rename = "LogLevel")]
    pub log_level: String,
    #[serde(rename = "DebugRoutes")]
    pub debug_routes: bool,
    #[serde(rename = "StaticWsdlDir")]
    pub static_wsdl_dir: String,
    #[serde(rename = "Auth")]
    pub auth: ConfigAuth,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigHttp {
    /// Listen port. 0 means the default of 80.
    #[serde(rename = "Port")]
    pub port: u16,
    /// Optional second plain-HTTP listen port. 0 disables it.
    #[serde(rename = "SecondaryPort")]
    pub secondary_port: u16,
    /// HTTPS listen port. 0 means 443 when HTTPS is enabled.
    #[serde(rename = "HTTPSPort")]
    pub https_port: u16,
    #[serde(rename = "EnableHTTPS")]
    pub enable_https: bool,
    /// Redirect insecure requests to the domain root over to HTTPS.
    #[serde(rename = "RedirectHTTP")]
    pub redirect_http: bool,
    #[serde(rename = "CertFile")]
    pub cert_file: String,
    #[serde(rename = "CertKeyFile")]
    pub cert_key_file: String,
    /// Disable keep-alive on the outbound transport (no idle connection reuse).
    #[serde(rename = "DisableKeepAlive")]
    pub disable_keep_alive: bool,
    /// Max idle outbound connections per backend host. 0 leaves the
    /// transport's own default in place.
    #[serde(rename = "MaxIdleConnections")]
    pub max_idle_connections: usize,
    /// Seconds to wait for backend response headers. 0 disables the timeout.
    #[serde(rename = "ResponseHeaderTimeout")]
    pub response_header_timeout: u64,
    #[serde(rename = "AutomaticGzip")]
    pub automatic_gzip: ConfigGzip,
}

impl ConfigHttp {
    /// The effective primary HTTP port (80 when unconfigured).
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            80
        } else {
            self.port
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigGzip {
    /// Content types (without parameters) eligible for automatic gzip.
    #[serde(rename = "Whitelist")]
    pub whitelist: Vec<String>,
}

impl ConfigGzip {
    pub fn whitelist_set(&self) -> HashSet<String> {
        self.whitelist.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigTarget {
    #[serde(rename = "URL")]
    pub url: String,
    /// Route traffic to this target through the configured outbound proxy.
    #[serde(rename = "UseProxy")]
    pub use_proxy: bool,
    /// Permission token the caller must hold. Empty allows anonymous access.
    #[serde(rename = "RequirePermission")]
    pub require_permission: String,
    #[serde(rename = "PassThroughAuth")]
    pub pass_through_auth: ConfigPassThroughAuth,
}

/// Pass-through credential kinds form a closed set; dispatch over them is
/// exhaustive in [`crate::auth::passthrough`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum PassThroughKind {
    #[default]
    None,
    PureHub,
    SitePro,
    #[serde(rename = "ECS")]
    Ecs,
    CouchDB,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigPassThroughAuth {
    #[serde(rename = "Type")]
    pub kind: PassThroughKind,
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "LoginURL")]
    pub login_url: String,
}

/// Contract with the external authorization service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigAuth {
    /// Base URL of the credential-verification service.
    #[serde(rename = "URL")]
    pub url: String,
    /// Shared key for inter-service trust. Empty disables the shortcut.
    #[serde(rename = "InterServiceKey")]
    pub inter_service_key: String,
}

impl Default for ConfigAuth {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:2003".to_string(),
            inter_service_key: String::new(),
        }
    }
}
