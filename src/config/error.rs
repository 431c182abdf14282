//! Configuration and startup validation errors.
//!
//! Every variant here is fatal at startup: the process prints the message and
//! exits 1. Exact wording matters for several variants because operators (and
//! the test suite) match on it when diagnosing a bad route table.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error loading '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Error parsing configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Replacement URL ({match_pattern} -> {target}) may not be empty")]
    EmptyReplacement {
        match_pattern: String,
        target: String,
    },

    #[error(
        "Match {match_pattern} has invalid value type. Must be either a string, or an object with 'Target' and 'ValidHosts'"
    )]
    InvalidRouteValue { match_pattern: String },

    #[error("Error decoding route {match_pattern}: {detail}")]
    RouteDecode {
        match_pattern: String,
        detail: String,
    },

    #[error("Route {match_pattern} needs to have a list of ValidHosts")]
    MissingValidHosts { match_pattern: String },

    #[error("In route for '{match_pattern}': {detail}")]
    InvalidValidHosts {
        match_pattern: String,
        detail: String,
    },

    #[error("Route target ({name}) not defined")]
    UnknownTarget { name: String },

    #[error("Route replacement URL format incorrect {url}")]
    BadReplacementUrl { url: String },

    #[error("Target URL format incorrect {url}")]
    BadTargetUrl { url: String },

    #[error("Failed to compile regex '{pattern}': {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },

    #[error(
        "httpbridge target must specify a port number only. The \"{host}\" portion of \"{url}\" is invalid."
    )]
    HttpBridgePort { host: String, url: String },

    #[error("Invalid proxy URL: {url}")]
    BadProxyUrl { url: String },

    #[error("Invalid HTTP_PORT environment variable '{0}'")]
    InvalidPortEnv(String),

    #[error("Failed to load TLS material from {path}: {detail}")]
    Tls { path: String, detail: String },

    #[error("Failed to build outbound HTTP client: {0}")]
    Client(String),
}
