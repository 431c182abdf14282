//! Configuration loading and route-table shape checking.

use std::path::Path;

use serde_json::Value;

use super::error::ConfigError;
use super::schema::Config;

/// The interpreted right-hand side of a route entry, before regex
/// compilation and target resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Replacement URL, possibly a `{TargetName}suffix` reference.
    pub target: String,
    /// Hostname whitelist patterns; required when the replacement hostname
    /// is templated from a capture group.
    pub valid_hosts: Vec<String>,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(contents: &str) -> Result<Config, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Interpret and shape-check every route entry.
    ///
    /// Runs in two passes so that a structurally hopeless entry (wrong value
    /// type, empty replacement) is reported before finer-grained decode
    /// errors, regardless of which field the JSON parser would trip on first.
    pub fn route_specs(&self) -> Result<Vec<(String, RouteSpec)>, ConfigError> {
        // Pass 1: every entry must yield a non-empty replacement string.
        for (pattern, value) in &self.routes {
            let target = route_target_str(pattern, value)?;
            if target.is_empty() {
                return Err(ConfigError::EmptyReplacement {
                    match_pattern: pattern.clone(),
                    target: String::new(),
                });
            }
        }

        // Pass 2: decode the object form's fields.
        let mut specs = Vec::with_capacity(self.routes.len());
        for (pattern, value) in &self.routes {
            let target = route_target_str(pattern, value)?;
            let valid_hosts = match value {
                Value::String(_) => Vec::new(),
                Value::Object(map) => decode_valid_hosts(pattern, map.get("ValidHosts"))?,
                _ => unreachable!("rejected in pass 1"),
            };
            specs.push((
                pattern.clone(),
                RouteSpec {
                    target,
                    valid_hosts,
                },
            ));
        }
        Ok(specs)
    }
}

/// Extract the replacement string from a route value, tolerating a wrong-typed
/// `Target` field (that surfaces as an empty replacement, which pass 1 turns
/// into the empty-replacement error).
fn route_target_str(pattern: &str, value: &Value) -> Result<String, ConfigError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Object(map) => Ok(map
            .get("Target")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()),
        _ => Err(ConfigError::InvalidRouteValue {
            match_pattern: pattern.to_string(),
        }),
    }
}

fn decode_valid_hosts(pattern: &str, value: Option<&Value>) -> Result<Vec<String>, ConfigError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = value else {
        return Err(ConfigError::RouteDecode {
            match_pattern: pattern.to_string(),
            detail: "ValidHosts must be a list of strings".to_string(),
        });
    };
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                ConfigError::RouteDecode {
                    match_pattern: pattern.to_string(),
                    detail: "ValidHosts entries must be strings".to_string(),
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PassThroughKind;

    #[test]
    fn parses_full_config() {
        let cfg = Config::from_json(
            r#"{
                "AccessLog": "access.log",
                "ErrorLog": "error.log",
                "LogLevel": "debug",
                "DebugRoutes": true,
                "Proxy": "http://proxy:3128",
                "HTTP": {
                    "Port": 5002,
                    "SecondaryPort": 5003,
                    "HTTPSPort": 5443,
                    "EnableHTTPS": true,
                    "RedirectHTTP": true,
                    "DisableKeepAlive": false,
                    "MaxIdleConnections": 50,
                    "ResponseHeaderTimeout": 60,
                    "AutomaticGzip": { "Whitelist": ["text/html", "application/json"] }
                },
                "Targets": {
                    "Docs": {
                        "URL": "http://127.0.0.1:5984",
                        "UseProxy": true,
                        "RequirePermission": "enabled",
                        "PassThroughAuth": {
                            "Type": "CouchDB",
                            "Username": "admin",
                            "Password": "secret"
                        }
                    }
                },
                "Routes": {
                    "/docs/(.*)": "{Docs}/$1"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.http.port, 5002);
        assert_eq!(cfg.http.effective_port(), 5002);
        assert_eq!(cfg.http.response_header_timeout, 60);
        assert!(cfg.http.automatic_gzip.whitelist_set().contains("text/html"));
        assert!(cfg.debug_routes);
        assert_eq!(cfg.proxy, "http://proxy:3128");

        let docs = &cfg.targets["Docs"];
        assert!(docs.use_proxy);
        assert_eq!(docs.require_permission, "enabled");
        assert_eq!(docs.pass_through_auth.kind, PassThroughKind::CouchDB);

        let specs = cfg.route_specs().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].1.target, "{Docs}/$1");
    }

    #[test]
    fn default_port_is_80() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg.http.port, 0);
        assert_eq!(cfg.http.effective_port(), 80);
    }

    #[test]
    fn route_value_must_be_string_or_object() {
        let cfg = Config::from_json(r#"{"Routes": {"/a/(.*)": 123}}"#).unwrap();
        let err = cfg.route_specs().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Match /a/(.*) has invalid value type. Must be either a string, or an object with 'Target' and 'ValidHosts'"
        );
    }

    #[test]
    fn empty_replacement_is_rejected() {
        let cfg = Config::from_json(r#"{"Routes": {"/a/(.*)": {}}}"#).unwrap();
        let err = cfg.route_specs().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Replacement URL (/a/(.*) -> ) may not be empty"
        );
    }

    #[test]
    fn non_string_target_reads_as_empty_replacement() {
        let cfg = Config::from_json(r#"{"Routes": {"/a/(.*)": {"Target": 123}}}"#).unwrap();
        let err = cfg.route_specs().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Replacement URL (/a/(.*) -> ) may not be empty"
        );
    }

    #[test]
    fn valid_hosts_must_be_a_string_list() {
        let cfg = Config::from_json(
            r#"{"Routes": {"/a/(.*)": {"Target": "http://$1", "ValidHosts": 123}}}"#,
        )
        .unwrap();
        let err = cfg.route_specs().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error decoding route /a/(.*): ValidHosts must be a list of strings"
        );

        let cfg = Config::from_json(
            r#"{"Routes": {"/a/(.*)": {"Target": "http://$1", "ValidHosts": [1, 2]}}}"#,
        )
        .unwrap();
        let err = cfg.route_specs().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error decoding route /a/(.*): ValidHosts entries must be strings"
        );
    }
}
