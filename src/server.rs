//! The front server: listeners, the per-request pipeline, and the endpoints
//! the router owns itself.
//!
//! One [`Server`] value carries every process-wide singleton (the compiled
//! route table, the shared outbound client, the UDP pool, the authorizer) and
//! is threaded through all connection tasks behind an `Arc`.

use std::collections::HashSet;
use std::convert::Infallible;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, HOST, LOCATION};
use http::{Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::auth::passthrough;
use crate::auth::{AuthClient, AuthOutcome, Authorizer};
use crate::config::{Config, ConfigError, ConfigHttp};
use crate::error::{full_body, RouterBody, RouterError, RouterResult};
use crate::forward::http::forward_http;
use crate::forward::sse::forward_sse;
use crate::forward::udp::forward_udp;
use crate::forward::ws::forward_websocket;
use crate::forward::{
    add_x_original_path, append_forwarded_for, copy_request_headers, UdpConnectionPool,
};
use crate::translator::{RouteSet, Scheme, UrlTranslator};

/// Tracing target for per-request access log events.
pub const ACCESS_LOG_TARGET: &str = "access";

/// Hostnames rejected outright; requests for them are malware noise.
const HOST_BLACKLIST: &[&str] = &["yahoo.mail.com"];

const DEFAULT_WSDL_DIR: &str = "/etc/frontdoor/wsdl";

pub struct Server {
    http: ConfigHttp,
    debug_routes: bool,
    gzip_whitelist: HashSet<String>,
    response_header_timeout: Option<Duration>,
    wsdl_match: Regex,
    wsdl_dir: PathBuf,
    translator: Arc<dyn UrlTranslator>,
    client: reqwest::Client,
    authorizer: Arc<dyn Authorizer>,
    udp_pool: UdpConnectionPool,
}

impl Server {
    /// Build a server from configuration, wiring the production authorizer.
    pub fn new(config: &Config) -> Result<Arc<Server>, ConfigError> {
        Self::build(config, None)
    }

    /// Build a server with a caller-supplied authorizer (used by tests and
    /// by embedders that bring their own credential verification).
    pub fn with_authorizer(
        config: &Config,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Arc<Server>, ConfigError> {
        Self::build(config, Some(authorizer))
    }

    fn build(
        config: &Config,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Result<Arc<Server>, ConfigError> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let translator: Arc<dyn UrlTranslator> = Arc::new(RouteSet::from_config(config)?);
        let client = build_outbound_client(config, translator.clone())?;
        let authorizer = authorizer
            .unwrap_or_else(|| Arc::new(AuthClient::new(client.clone(), config.auth.clone())));

        let response_header_timeout = match config.http.response_header_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        info!(
            disable_keep_alive = config.http.disable_keep_alive,
            max_idle_connections = config.http.max_idle_connections,
            response_header_timeout_secs = config.http.response_header_timeout,
            routes = translator.all_routes().len(),
            "Router starting"
        );
        if config.debug_routes {
            for route in translator.all_routes() {
                debug!(pattern = %route.pattern, target = %route.target.base_url, "route");
            }
        }

        Ok(Arc::new(Server {
            http: config.http.clone(),
            debug_routes: config.debug_routes,
            gzip_whitelist: config.http.automatic_gzip.whitelist_set(),
            response_header_timeout,
            wsdl_match: Regex::new(r"([^/]\w+)\.(wsdl)$").expect("valid regex"),
            wsdl_dir: if config.static_wsdl_dir.is_empty() {
                PathBuf::from(DEFAULT_WSDL_DIR)
            } else {
                PathBuf::from(&config.static_wsdl_dir)
            },
            translator,
            client,
            authorizer,
            udp_pool: UdpConnectionPool::new(),
        }))
    }

    /// Bind every configured listener and serve until the first one fails.
    /// Returns that first error; it becomes the process exit status.
    pub async fn listen_and_serve(self: &Arc<Self>) -> std::io::Result<()> {
        let (tx, mut rx) = mpsc::channel::<std::io::Result<()>>(3);

        let primary = format!("0.0.0.0:{}", self.http.effective_port());
        tokio::spawn(self.clone().run_plain_listener(primary, tx.clone()));

        if self.http.secondary_port != 0 {
            let secondary = format!("0.0.0.0:{}", self.http.secondary_port);
            tokio::spawn(self.clone().run_plain_listener(secondary, tx.clone()));
        }

        if self.http.enable_https {
            let port = if self.http.https_port == 0 {
                443
            } else {
                self.http.https_port
            };
            let secure = format!("0.0.0.0:{port}");
            tokio::spawn(self.clone().run_tls_listener(secure, tx.clone()));
        }
        drop(tx);

        while let Some(result) = rx.recv().await {
            if let Err(e) = result {
                error!(error = %e, "Router exiting; first listener error");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run_plain_listener(
        self: Arc<Self>,
        addr: String,
        tx: mpsc::Sender<std::io::Result<()>>,
    ) {
        loop {
            let result: std::io::Result<()> = async {
                let listener = TcpListener::bind(&addr).await?;
                info!(addr = %addr, "HTTP listener started");
                self.clone().serve_listener(listener, false).await
            }
            .await;

            if should_restart_listener(&result) {
                warn!(addr = %addr, "Automatically restarting listener after transient network error");
                continue;
            }
            let _ = tx.send(result).await;
            return;
        }
    }

    async fn run_tls_listener(
        self: Arc<Self>,
        addr: String,
        tx: mpsc::Sender<std::io::Result<()>>,
    ) {
        loop {
            let result: std::io::Result<()> = async {
                if running_in_container() {
                    self.fetch_certs().await?;
                }
                let acceptor =
                    build_tls_acceptor(&self.http.cert_file, &self.http.cert_key_file)?;
                let listener = TcpListener::bind(&addr).await?;
                info!(addr = %addr, "HTTPS listener started");
                self.clone().serve_tls_listener(listener, acceptor).await
            }
            .await;

            if should_restart_listener(&result) {
                warn!(addr = %addr, "Automatically restarting listener after transient network error");
                continue;
            }
            let _ = tx.send(result).await;
            return;
        }
    }

    /// Accept connections on `listener` and serve each in its own task.
    pub async fn serve_listener(
        self: Arc<Self>,
        listener: TcpListener,
        is_secure: bool,
    ) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_connection(stream, peer, is_secure).await;
            });
        }
    }

    async fn serve_tls_listener(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
    ) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let server = self.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => server.serve_connection(tls, peer, true).await,
                    Err(e) => debug!(error = %e, peer = %peer, "TLS handshake failed"),
                }
            });
        }
    }

    async fn serve_connection<I>(self: Arc<Self>, io: I, peer: SocketAddr, is_secure: bool)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            async move {
                let started = Instant::now();
                let method = req.method().clone();
                let uri = req.uri().clone();

                let response = match server.route_request(is_secure, peer, req).await {
                    Ok(response) => response,
                    Err(e) => e.to_response(),
                };

                info!(
                    target: ACCESS_LOG_TARGET,
                    client = %peer,
                    method = %method,
                    uri = %uri,
                    status = response.status().as_u16(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "request"
                );
                Ok::<_, Infallible>(response)
            }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        if let Err(e) = builder
            .serve_connection_with_upgrades(TokioIo::new(io), service)
            .await
        {
            debug!(error = %e, peer = %peer, "Connection ended with error");
        }
    }

    /// The single routing pipeline every request flows through.
    async fn route_request(
        self: Arc<Self>,
        is_secure: bool,
        peer: SocketAddr,
        req: Request<Incoming>,
    ) -> RouterResult<Response<RouterBody>> {
        let request_uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());
        let path = req.uri().path().to_string();

        // Static WSDL bypass.
        if let Some(found) = self.wsdl_match.find(&request_uri) {
            let filename = found.as_str().to_string();
            return self.serve_wsdl(&filename).await;
        }

        let host_header = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let uri_host = req
            .uri()
            .authority()
            .map(|a| a.as_str())
            .unwrap_or_default();
        if HOST_BLACKLIST.contains(&host_header.as_str()) || HOST_BLACKLIST.contains(&uri_host) {
            error!(host = %host_header, "Illegal hostname - closing connection");
            return Err(RouterError::IllegalHost(host_header));
        }

        // Redirect insecure requests for the domain root to HTTPS. Raw IPs
        // and localhost are left untouched.
        if self.http.redirect_http && !is_secure {
            let host_name = host_header.split(':').next().unwrap_or_default();
            if !host_name.is_empty()
                && host_name != "localhost"
                && host_name.parse::<IpAddr>().is_err()
            {
                if request_uri == "/manifest.appcache" {
                    // A 404 here invalidates stale appcache manifests on
                    // clients that cached the site before the HTTPS move.
                    info!("Appcache manifest cleared");
                    return Ok(status_response(StatusCode::NOT_FOUND, ""));
                }
                if request_uri == "/" || request_uri.is_empty() {
                    return Ok(self.redirect_to_https(host_name, &path));
                }
            }
        }

        if request_uri == "/router/ping" {
            return Ok(self.pong());
        }

        let Some(translation) = self.translator.translate(&path, &request_uri) else {
            return Err(RouterError::RouteNotFound);
        };
        if self.debug_routes {
            info!(from = %request_uri, to = %translation.url, "Translated route");
        }

        let auth_token = match self
            .authorizer
            .authorize(req.headers(), &translation.require_permission)
            .await
        {
            AuthOutcome::Allowed(token) => token,
            AuthOutcome::Denied { status, message } => {
                return Err(RouterError::Denied { status, message });
            }
        };

        let mut outbound = copy_request_headers(req.headers());
        append_forwarded_for(&mut outbound, &peer);
        add_x_original_path(&mut outbound, &request_uri);

        passthrough::apply(
            &self.client,
            self.authorizer.as_ref(),
            auth_token.as_ref(),
            req.headers(),
            &request_uri,
            &path,
            &translation.target,
            &mut outbound,
        )
        .await?;

        match Scheme::of(&translation.url) {
            Scheme::Http | Scheme::Https => {
                forward_http(
                    &self.client,
                    &self.gzip_whitelist,
                    self.response_header_timeout,
                    req,
                    outbound,
                    &translation.url,
                )
                .await
            }
            Scheme::Sse => {
                forward_sse(
                    &self.client,
                    req.method().clone(),
                    outbound,
                    &translation.url,
                    false,
                )
                .await
            }
            Scheme::SseSecure => {
                forward_sse(
                    &self.client,
                    req.method().clone(),
                    outbound,
                    &translation.url,
                    true,
                )
                .await
            }
            Scheme::Ws => forward_websocket(req, &translation.url).await,
            Scheme::Udp => forward_udp(&self.udp_pool, req.into_body(), &translation.url).await,
            Scheme::HttpBridge => {
                // Validated at startup; the bridge transport is handled out
                // of band, not by this forwarder.
                error!(to = %translation.url, "httpbridge target reached the HTTP forwarder");
                Err(RouterError::UnknownScheme(translation.url))
            }
            Scheme::Unknown => {
                error!(from = %request_uri, to = %translation.url, "Unrecognized scheme");
                Err(RouterError::UnknownScheme(translation.url))
            }
        }
    }

    async fn serve_wsdl(&self, filename: &str) -> RouterResult<Response<RouterBody>> {
        let path = self.wsdl_dir.join(filename);
        match tokio::fs::read(&path).await {
            Ok(contents) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/xml; charset=utf-8")
                .body(full_body(contents))
                .map_err(|e| RouterError::Internal(format!("Failed to build response: {e}"))),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "WSDL file not served");
                Ok(status_response(StatusCode::NOT_FOUND, "404 page not found\n"))
            }
        }
    }

    fn redirect_to_https(&self, host_name: &str, path: &str) -> Response<RouterBody> {
        let target = if self.http.https_port != 0 {
            format!("https://{host_name}:{}{path}", self.http.https_port)
        } else {
            format!("https://{host_name}{path}")
        };
        info!(to = %target, "Redirecting request to HTTPS");

        let mut response = status_response(StatusCode::MOVED_PERMANENTLY, "");
        response
            .headers_mut()
            .insert(CACHE_CONTROL, http::HeaderValue::from_static("no-store"));
        if let Ok(location) = http::HeaderValue::from_str(&target) {
            response.headers_mut().insert(LOCATION, location);
        }
        response
    }

    fn pong(&self) -> Response<RouterBody> {
        let body = format!("{{\"Timestamp\":{}}}", Utc::now().timestamp());
        status_response(StatusCode::OK, body)
    }

    async fn fetch_certs(&self) -> std::io::Result<()> {
        let base = std::env::var("CONFIG_SERVICE_URL").map_err(|_| {
            std::io::Error::other("CONFIG_SERVICE_URL is required to fetch TLS material")
        })?;

        for path in [&self.http.cert_file, &self.http.cert_key_file] {
            let path = Path::new(path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| std::io::Error::other("certificate path has no file name"))?;
            let url = format!("{}/{name}", base.trim_end_matches('/'));

            let bytes = self
                .client
                .get(&url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(std::io::Error::other)?
                .bytes()
                .await
                .map_err(std::io::Error::other)?;
            tokio::fs::write(path, &bytes).await?;
            info!(path = %path.display(), "Fetched TLS material from config service");
        }
        Ok(())
    }
}

fn status_response(status: StatusCode, body: impl Into<bytes::Bytes>) -> Response<RouterBody> {
    let mut response = Response::new(full_body(body.into()));
    *response.status_mut() = status;
    response
}

/// Certain benign OS-level errors occur frequently under load; rather than
/// shut the process down, the affected listener fires itself up again.
fn should_restart_listener(result: &std::io::Result<()>) -> bool {
    match result {
        Err(e) => e
            .to_string()
            .contains("specified network name is no longer available"),
        Ok(()) => false,
    }
}

fn running_in_container() -> bool {
    std::env::var("RUNNING_IN_CONTAINER")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// The shared outbound transport. Its connection pool is internally
/// thread-safe; every forwarder, the token refresher, and the auth client
/// ride on this one client.
fn build_outbound_client(
    config: &Config,
    translator: Arc<dyn UrlTranslator>,
) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .tcp_nodelay(true);

    if config.http.disable_keep_alive {
        builder = builder.pool_max_idle_per_host(0);
    } else if config.http.max_idle_connections > 0 {
        builder = builder.pool_max_idle_per_host(config.http.max_idle_connections);
    }

    if config.proxy.is_empty() {
        builder = builder.no_proxy();
    } else {
        let proxy_url =
            reqwest::Url::parse(&config.proxy).map_err(|_| ConfigError::BadProxyUrl {
                url: config.proxy.clone(),
            })?;
        builder = builder.proxy(reqwest::Proxy::custom(move |url: &reqwest::Url| {
            let host = url.host_str()?;
            let key = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            translator
                .proxy_for(&key)
                .or_else(|| translator.proxy_for(host))
                .map(|_| proxy_url.clone())
        }));
    }

    builder
        .build()
        .map_err(|e| ConfigError::Client(e.to_string()))
}

fn build_tls_acceptor(cert_path: &str, key_path: &str) -> std::io::Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()?;

    let key_file = std::fs::File::open(key_path)?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))?
        .ok_or_else(|| std::io::Error::other(format!("no private key found in {key_path}")))?;

    // rustls always honors the server's cipher-suite preference order.
    let config = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(std::io::Error::other)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_network_name_errors_restart() {
        let err: std::io::Result<()> = Err(std::io::Error::other(
            "accept: the specified network name is no longer available.",
        ));
        assert!(should_restart_listener(&err));

        let err: std::io::Result<()> =
            Err(std::io::Error::other("address already in use"));
        assert!(!should_restart_listener(&err));
        assert!(!should_restart_listener(&Ok(())));
    }

    #[test]
    fn wsdl_pattern_matches_trailing_wsdl_files() {
        let re = Regex::new(r"([^/]\w+)\.(wsdl)$").unwrap();
        assert_eq!(
            re.find("/services/asset.wsdl").map(|m| m.as_str()),
            Some("asset.wsdl")
        );
        assert!(re.find("/services/asset.wsdl?x=1").is_none());
        assert!(re.find("/plain/path").is_none());
    }
}
