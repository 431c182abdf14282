//! URL translation: the compile-once, match-many route table.
//!
//! A [`RouteSet`] is built from configuration at startup and is immutable
//! afterwards, so the per-request hot path takes no locks. Lookup is
//! longest-literal-prefix first: the literal slice of each match pattern (up
//! to its first `(`) is indexed in a hash map, and only the single winning
//! route's regex ever runs against a request. Rewriting applies the regex to
//! the full request URI (path + raw query) so capture groups may incorporate
//! query material; the prefix lookup itself uses only the path.
//!
//! Routes with templated hostnames (`http://$1`) must carry a host whitelist.
//! Every whitelist pattern is forced to end with `$`; without the anchor it
//! would be trivial to extend an allowed hostname with a port (`maps` to
//! `maps:8080`) or a suffix (`maps` to `maps.attacker.com`).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::RwLock;

use crate::config::{Config, ConfigError, ConfigPassThroughAuth};

/// Forwarding protocol selected by the rewritten URL's scheme prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Unknown,
    Ws,
    Udp,
    Http,
    Https,
    /// Server-sent events over an h2c upgrade toward a plain-HTTP backend.
    Sse,
    /// Server-sent events over an h2c upgrade toward an HTTPS backend.
    SseSecure,
    /// Out-of-band backend identified solely by a port number.
    HttpBridge,
}

impl Scheme {
    /// Classify a URL by its scheme prefix. Longer prefixes are tested first
    /// so `httpbridge:` is never mistaken for `http:`.
    pub fn of(url: &str) -> Scheme {
        const TABLE: &[(&str, Scheme)] = &[
            ("httpbridge:", Scheme::HttpBridge),
            ("https:", Scheme::Https),
            ("http:", Scheme::Http),
            ("sses:", Scheme::SseSecure),
            ("sse:", Scheme::Sse),
            ("udp:", Scheme::Udp),
            ("ws:", Scheme::Ws),
        ];
        for (prefix, scheme) in TABLE {
            if url.starts_with(prefix) {
                return *scheme;
            }
        }
        Scheme::Unknown
    }
}

/// Machine-to-machine token shared by all users of a target.
#[derive(Debug, Clone)]
pub struct TokenState {
    pub token: String,
    pub expires: DateTime<Utc>,
}

impl Default for TokenState {
    fn default() -> Self {
        Self {
            token: String::new(),
            expires: DateTime::UNIX_EPOCH,
        }
    }
}

/// Pass-through credential state for one target.
///
/// `config` is immutable; `state` is read under the read lock on the hot
/// path and written only while refreshing an expired token.
#[derive(Debug)]
pub struct PassThroughAuth {
    pub config: ConfigPassThroughAuth,
    pub state: RwLock<TokenState>,
}

impl PassThroughAuth {
    pub fn new(config: ConfigPassThroughAuth) -> Self {
        Self {
            config,
            state: RwLock::new(TokenState::default()),
        }
    }
}

/// A named backend. Multiple routes may share one target; the target is
/// immutable apart from the token state, which carries its own lock.
#[derive(Debug)]
pub struct Target {
    /// The replacement string is appended to this.
    pub base_url: String,
    /// Route traffic to this target via the outbound proxy.
    pub use_proxy: bool,
    /// Non-empty means the caller must be authorized before forwarding.
    pub require_permission: String,
    pub auth: PassThroughAuth,
}

impl Target {
    fn inline(base_url: String) -> Arc<Target> {
        Arc::new(Target {
            base_url,
            use_proxy: false,
            require_permission: String::new(),
            auth: PassThroughAuth::new(ConfigPassThroughAuth::default()),
        })
    }

    pub fn scheme(&self) -> Scheme {
        Scheme::of(&self.base_url)
    }
}

/// A rewrite rule mapping an incoming URL to a target URL.
#[derive(Debug)]
pub struct Route {
    pub pattern: String,
    compiled: Regex,
    pub replace: String,
    pub target: Arc<Target>,
    valid_hosts: Vec<Regex>,
}

impl Route {
    fn host_is_valid(&self, host: &str) -> bool {
        self.valid_hosts.iter().any(|re| re.is_match(host))
    }
}

/// Result of translating one request URL.
#[derive(Debug, Clone)]
pub struct Translation {
    /// The rewritten backend URL.
    pub url: String,
    /// Permission the caller must hold; empty allows anonymous access.
    pub require_permission: String,
    /// The backend target, shared with every route pointing at it.
    pub target: Arc<Target>,
}

/// The translator's external contract, kept as a capability set so a future
/// sharded or hot-reloadable implementation can slot in behind it.
pub trait UrlTranslator: Send + Sync {
    /// Rewrite an incoming request. `None` means no route matched (or the
    /// rewritten host failed the whitelist check; the two are deliberately
    /// indistinguishable).
    fn translate(&self, path: &str, request_uri: &str) -> Option<Translation>;

    /// The outbound proxy to use when talking to `host`, if any.
    fn proxy_for(&self, host: &str) -> Option<String>;

    /// All configured routes, for startup diagnostics.
    fn all_routes(&self) -> &[Arc<Route>];
}

/// The live route table.
pub struct RouteSet {
    routes: Vec<Arc<Route>>,
    proxy: Option<String>,

    // Cached state, computed from `routes` at construction.
    prefix_hash: HashMap<String, Arc<Route>>,
    prefix_lengths: Vec<usize>,
    target_hash: HashMap<String, Arc<Target>>,
}

impl RouteSet {
    /// Compile a configuration into a runnable route table, performing all
    /// startup sanity checks.
    pub fn from_config(config: &Config) -> Result<RouteSet, ConfigError> {
        let specs = config.route_specs()?;

        let proxy = if config.proxy.is_empty() {
            None
        } else {
            split_url(&config.proxy).ok_or_else(|| ConfigError::BadProxyUrl {
                url: config.proxy.clone(),
            })?;
            Some(config.proxy.clone())
        };

        let mut named: BTreeMap<&str, Arc<Target>> = BTreeMap::new();
        for (name, ctarget) in &config.targets {
            named.insert(
                name,
                Arc::new(Target {
                    base_url: ctarget.url.clone(),
                    use_proxy: ctarget.use_proxy,
                    require_permission: ctarget.require_permission.clone(),
                    auth: PassThroughAuth::new(ctarget.pass_through_auth.clone()),
                }),
            );
        }

        let mut routes = Vec::with_capacity(specs.len());
        for (pattern, spec) in specs {
            let valid_hosts = parse_valid_hosts(&spec.valid_hosts).map_err(|detail| {
                ConfigError::InvalidValidHosts {
                    match_pattern: pattern.clone(),
                    detail,
                }
            })?;

            let (target, replace) = if let Some((name, suffix)) = split_named_target(&spec.target)
            {
                let target = named
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownTarget {
                        name: name.to_string(),
                    })?
                    .clone();
                (target, suffix.to_string())
            } else {
                let (scheme, host, path) =
                    split_url(&spec.target).ok_or_else(|| ConfigError::BadReplacementUrl {
                        url: spec.target.clone(),
                    })?;
                // A dollar in the hostname means the hostname comes from the
                // request URL; such routes must whitelist what they may reach.
                if host.contains('$') && valid_hosts.is_empty() {
                    return Err(ConfigError::MissingValidHosts {
                        match_pattern: pattern.clone(),
                    });
                }
                (
                    Target::inline(format!("{scheme}://{host}")),
                    path.to_string(),
                )
            };

            let compiled = Regex::new(&pattern).map_err(|source| ConfigError::Regex {
                pattern: pattern.clone(),
                source,
            })?;

            routes.push(Arc::new(Route {
                pattern,
                compiled,
                replace,
                target,
                valid_hosts,
            }));
        }

        let mut set = RouteSet {
            routes,
            proxy,
            prefix_hash: HashMap::new(),
            prefix_lengths: Vec::new(),
            target_hash: HashMap::new(),
        };
        set.verify_httpbridge_urls()?;
        set.compute_caches()?;
        Ok(set)
    }

    fn compute_caches(&mut self) -> Result<(), ConfigError> {
        let mut lengths: Vec<usize> = Vec::new();
        for route in &self.routes {
            // The literal prefix runs up to the first capture; a pattern with
            // no captures is its own prefix. Duplicate prefixes collapse,
            // last one wins.
            let key = match route.pattern.find('(') {
                Some(open) => &route.pattern[..open],
                None => route.pattern.as_str(),
            };
            self.prefix_hash.insert(key.to_string(), route.clone());

            let (_, host, _) =
                split_url(&route.target.base_url).ok_or_else(|| ConfigError::BadTargetUrl {
                    url: route.target.base_url.clone(),
                })?;
            if !host.is_empty() {
                self.target_hash
                    .insert(host.to_string(), route.target.clone());
            }

            if !lengths.contains(&key.len()) {
                lengths.push(key.len());
            }
        }
        lengths.sort_unstable_by(|a, b| b.cmp(a));
        self.prefix_lengths = lengths;
        Ok(())
    }

    /// httpbridge backends are addressed by port number alone.
    fn verify_httpbridge_urls(&self) -> Result<(), ConfigError> {
        for route in &self.routes {
            if route.target.scheme() != Scheme::HttpBridge {
                continue;
            }
            let url = &route.target.base_url;
            let host = split_url(url)
                .map(|(_, host, _)| host)
                .unwrap_or_default();
            let port: u16 = host.parse().unwrap_or(0);
            if port == 0 || host != port.to_string() {
                return Err(ConfigError::HttpBridgePort {
                    host: host.to_string(),
                    url: url.clone(),
                });
            }
        }
        Ok(())
    }

    /// Longest literal prefix wins. Matching is on the path only; the query
    /// string participates in rewriting but never in route selection.
    fn match_route(&self, path: &str) -> Option<&Arc<Route>> {
        for &length in &self.prefix_lengths {
            if path.len() < length {
                continue;
            }
            // A slice that lands mid-character cannot equal any UTF-8 key.
            let Some(prefix) = path.get(..length) else {
                continue;
            };
            if let Some(route) = self.prefix_hash.get(prefix) {
                return Some(route);
            }
        }
        None
    }
}

impl UrlTranslator for RouteSet {
    fn translate(&self, path: &str, request_uri: &str) -> Option<Translation> {
        let route = self.match_route(path)?;

        let template = format!("{}{}", route.target.base_url, route.replace);
        let rewritten = route
            .compiled
            .replace_all(request_uri, template.as_str())
            .into_owned();

        if !route.valid_hosts.is_empty() {
            let (_, host, _) = split_url(&rewritten)?;
            if !route.host_is_valid(host) {
                return None;
            }
        }

        Some(Translation {
            url: rewritten,
            require_permission: route.target.require_permission.clone(),
            target: route.target.clone(),
        })
    }

    fn proxy_for(&self, host: &str) -> Option<String> {
        let target = self.target_hash.get(host)?;
        // Hosts outside the configured target list are legitimate (templated
        // hostname routes reach arbitrary whitelisted backends); they simply
        // never go through the proxy.
        if !target.use_proxy {
            return None;
        }
        self.proxy.clone()
    }

    fn all_routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}

/// Split `{Name}suffix` into the named-target reference and its path suffix.
fn split_named_target(replacement: &str) -> Option<(&str, &str)> {
    let rest = replacement.strip_prefix('{')?;
    let close = rest.find('}')?;
    Some((&rest[..close], &rest[close + 1..]))
}

/// Split a URL into (scheme, host[:port], path). Hand-rolled because
/// replacement templates like `http://$1` are not parseable by a strict URI
/// type, yet their shape is all the translator needs.
pub fn split_url(url: &str) -> Option<(&str, &str, &str)> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.is_empty() {
        return None;
    }
    match rest.find('/') {
        Some(slash) => Some((scheme, &rest[..slash], &rest[slash..])),
        None => Some((scheme, rest, "")),
    }
}

fn parse_valid_hosts(patterns: &[String]) -> Result<Vec<Regex>, String> {
    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        if pattern.is_empty() {
            return Err("ValidHosts entry may not be an empty string".to_string());
        }
        // Force the terminator: without it, a valid hostname is trivially
        // extended with a port ("maps" to "maps:8080") or a suffix
        // ("maps" to "maps.attacker.example"). Prefix extension stays legal.
        let mut anchored = pattern.clone();
        if !anchored.ends_with('$') {
            anchored.push('$');
        }
        compiled.push(
            Regex::new(&anchored)
                .map_err(|e| format!("Failed to compile regex '{pattern}': {e}"))?,
        );
    }
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn route_set(cfg_json: &str) -> RouteSet {
        let cfg = Config::from_json(cfg_json).expect("config parses");
        RouteSet::from_config(&cfg).expect("route set builds")
    }

    fn expect_invalid(cfg_json: &str, want: &str) {
        let err = match Config::from_json(cfg_json) {
            Err(e) => e.to_string(),
            Ok(cfg) => match RouteSet::from_config(&cfg) {
                Err(e) => e.to_string(),
                Ok(_) => panic!("expected failure '{want}', but config was accepted"),
            },
        };
        assert_eq!(err, want);
    }

    /// `expect_out` empty means the route must not match.
    fn verify(rs: &RouteSet, in_url: &str, expect_out: &str) {
        let path = in_url.split('?').next().unwrap_or(in_url);
        let got = rs
            .translate(path, in_url)
            .map(|t| t.url)
            .unwrap_or_default();
        assert_eq!(got, expect_out, "route match failed for '{in_url}'");
    }

    #[test]
    fn longest_prefix_wins() {
        let rs = route_set(
            r#"{
                "Routes": {
                    "/no-trailing-slash(.*)": "http://abc.com/555$1",
                    "/abc/long/(.*)": "http://abc.com/long/$1",
                    "/abc/(.*)": "http://abc.com/123/$1",
                    "/static": "http://abc.com/noise",
                    "/(.*)": "http://127.0.0.1/www/$1"
            }}"#,
        );

        verify(&rs, "/abc/long/777", "http://abc.com/long/777");
        verify(&rs, "/static", "http://abc.com/noise");
        verify(&rs, "/abc/xyz/", "http://abc.com/123/xyz/");
        verify(&rs, "/abc/xyz", "http://abc.com/123/xyz");
        verify(&rs, "/abc/", "http://abc.com/123/");
        verify(&rs, "/", "http://127.0.0.1/www/");
        verify(&rs, "/1/2/3", "http://127.0.0.1/www/1/2/3");
        verify(&rs, "/no-trailing-slash666", "http://abc.com/555666");
    }

    #[test]
    fn unmatched_paths_return_none() {
        let rs = route_set(r#"{"Routes": {"/abc/(.*)": "https://abc.com/123/$1"}}"#);
        verify(&rs, "/", "");
        verify(&rs, "/abc", "");
        verify(&rs, "/abc/", "https://abc.com/123/");
    }

    #[test]
    fn multiple_captures_swap() {
        let rs = route_set(r#"{"Routes": {"/abc/([^/]*)/(.*)": "http://abc/$2/$1"}}"#);
        verify(&rs, "/abc/a/b", "http://abc/b/a");
    }

    #[test]
    fn query_string_rides_through_captures() {
        let rs = route_set(r#"{"Routes": {"/nom/(.*)": "https://nominatim.example.org/$1"}}"#);
        verify(
            &rs,
            "/nom/search.php?q=stellenbosch&format=json",
            "https://nominatim.example.org/search.php?q=stellenbosch&format=json",
        );
    }

    #[test]
    fn host_whitelist_gates_templated_hostnames() {
        let rs = route_set(
            r#"{
                "Routes": {
                    "/tile/(.*)": {
                        "Target": "http://$1",
                        "ValidHosts": ["good1", ".\\.maptile\\.example\\.com"]
                }
            }}"#,
        );

        verify(&rs, "/tile/good1/abc", "http://good1/abc");
        verify(
            &rs,
            "/tile/a.maptile.example.com/123.png",
            "http://a.maptile.example.com/123.png",
        );
        verify(
            &rs,
            "/tile/b.maptile.example.com/123.png",
            "http://b.maptile.example.com/123.png",
        );
        verify(&rs, "/tile/badhost/two", "");
        // The forced end anchor rejects port and suffix extension.
        verify(&rs, "/tile/good1:8080/two", "");
        // Prefix extension is allowed.
        verify(&rs, "/tile/foobar.good1/two", "http://foobar.good1/two");
    }

    #[test]
    fn named_targets_resolve() {
        let rs = route_set(
            r#"{
                "Targets": { "Crud": { "URL": "http://127.0.0.1:2013" } },
                "Routes": { "/crud/(.*)": "{Crud}/$1" }
            }"#,
        );
        verify(&rs, "/crud/reload_schema", "http://127.0.0.1:2013/reload_schema");
    }

    #[test]
    fn invalid_configs_fail_with_exact_messages() {
        expect_invalid(
            r#"{"Routes": {"/tile/(.*)": "http://$1"}}"#,
            "Route /tile/(.*) needs to have a list of ValidHosts",
        );
        expect_invalid(
            r#"{"Routes": {"/tile/(.*)": {"Target": "http://$1", "ValidHosts": []}}}"#,
            "Route /tile/(.*) needs to have a list of ValidHosts",
        );
        expect_invalid(
            r#"{"Routes": {"/tile/(.*)": {"Target": 123}}}"#,
            "Replacement URL (/tile/(.*) -> ) may not be empty",
        );
        expect_invalid(
            r#"{"Routes": {"/tile/(.*)": {}}}"#,
            "Replacement URL (/tile/(.*) -> ) may not be empty",
        );
        expect_invalid(
            r#"{"Routes": {"/tile/(.*)": 123}}"#,
            "Match /tile/(.*) has invalid value type. Must be either a string, or an object with 'Target' and 'ValidHosts'",
        );
        expect_invalid(
            r#"{"Routes": {"/tile/(.*)": {"Target": "http://$1", "ValidHosts": [""]}}}"#,
            "In route for '/tile/(.*)': ValidHosts entry may not be an empty string",
        );
        expect_invalid(
            r#"{"Routes": {"/crud/(.*)": "{Crud}/$1"}}"#,
            "Route target (Crud) not defined",
        );
    }

    #[test]
    fn httpbridge_targets_must_be_bare_ports() {
        let rs = route_set(r#"{"Routes": {"/bridge/(.*)": "httpbridge://2005/$1"}}"#);
        assert_eq!(rs.all_routes().len(), 1);

        expect_invalid(
            r#"{"Routes": {"/bridge/(.*)": "httpbridge://backend:2005/$1"}}"#,
            "httpbridge target must specify a port number only. The \"backend:2005\" portion of \"httpbridge://backend:2005\" is invalid.",
        );
    }

    #[test]
    fn scheme_classification() {
        assert_eq!(Scheme::of("http://a/b"), Scheme::Http);
        assert_eq!(Scheme::of("https://a/b"), Scheme::Https);
        assert_eq!(Scheme::of("ws://a/b"), Scheme::Ws);
        assert_eq!(Scheme::of("udp://a:2055"), Scheme::Udp);
        assert_eq!(Scheme::of("sse://a/b"), Scheme::Sse);
        assert_eq!(Scheme::of("sses://a/b"), Scheme::SseSecure);
        assert_eq!(Scheme::of("httpbridge://2005"), Scheme::HttpBridge);
        assert_eq!(Scheme::of("gopher://a"), Scheme::Unknown);
    }

    #[test]
    fn proxy_lookup_is_per_target() {
        let rs = route_set(
            r#"{
                "Proxy": "http://proxy.example:3128",
                "Targets": {
                    "Far": { "URL": "http://far.example:8080", "UseProxy": true },
                    "Near": { "URL": "http://near.example" }
                },
                "Routes": {
                    "/far/(.*)": "{Far}/$1",
                    "/near/(.*)": "{Near}/$1"
                }
            }"#,
        );
        assert_eq!(
            rs.proxy_for("far.example:8080"),
            Some("http://proxy.example:3128".to_string())
        );
        assert_eq!(rs.proxy_for("near.example"), None);
        assert_eq!(rs.proxy_for("unknown.example"), None);
    }

    #[test]
    fn duplicate_literal_prefixes_collapse_last_wins() {
        // Both patterns share the literal prefix "/a/"; the map keeps the
        // later entry. Documented behavior, relied on by configs that
        // override a route by redefining it.
        let rs = route_set(
            r#"{"Routes": {
                "/a/(.*)": "http://first/$1",
                "/a/(.+)": "http://second/$1"
            }}"#,
        );
        verify(&rs, "/a/x", "http://second/x");
    }

    #[test]
    fn split_url_accepts_templates() {
        assert_eq!(split_url("http://$1"), Some(("http", "$1", "")));
        assert_eq!(
            split_url("udp://flow.example:2055/x"),
            Some(("udp", "flow.example:2055", "/x"))
        );
        assert_eq!(split_url("not-a-url"), None);
    }
}
