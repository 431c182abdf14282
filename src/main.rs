//! frontdoor binary: configuration loading, environment overrides, logging
//! bootstrap, and the listener run loop.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use frontdoor::config::{Config, ConfigError};
use frontdoor::server::{Server, ACCESS_LOG_TARGET};

const DEFAULT_CONFIG_PATH: &str = "/etc/frontdoor/config.json";

#[derive(Parser, Debug)]
#[command(author, version, about = "Reverse-proxy request router", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the effective HTTP port to stdout and exit
    #[arg(long)]
    show_http_port: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let path = cli.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = Config::from_file(&path)?;
    apply_env_overrides(&mut config)?;

    if cli.show_http_port {
        println!("{}", config.http.effective_port());
        return Ok(());
    }

    init_logging(&config)?;

    let server = Server::new(&config)?;
    server.listen_and_serve().await?;
    Ok(())
}

/// Deployment environments override the config file for two settings: the
/// HTTP port, and forcing the HTTPS redirect off.
fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if std::env::var("DISABLE_HTTPS_REDIRECT").as_deref() == Ok("1") {
        config.http.redirect_http = false;
    }

    if let Ok(port) = std::env::var("HTTP_PORT") {
        if !port.is_empty() {
            config.http.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidPortEnv(port.clone()))?;
        }
    }
    Ok(())
}

/// Two JSON-formatted layers share one filter: access events (target
/// `access`) go to the access log, everything else to the error log. Either
/// stream falls back to stdout when no file is configured; rotation of the
/// files themselves is external.
fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if config.log_level.is_empty() {
        "info"
    } else {
        &config.log_level
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let error_writer = make_writer(&config.error_log)?;
    let access_writer = make_writer(&config.access_log)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_writer(error_writer)
                .with_filter(filter_fn(|meta| meta.target() != ACCESS_LOG_TARGET)),
        )
        .with(
            fmt::layer()
                .json()
                .with_writer(access_writer)
                .with_filter(filter_fn(|meta| meta.target() == ACCESS_LOG_TARGET)),
        )
        .init();
    Ok(())
}

fn make_writer(path: &str) -> std::io::Result<BoxMakeWriter> {
    if path.is_empty() {
        return Ok(BoxMakeWriter::new(std::io::stdout));
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(BoxMakeWriter::new(Arc::new(file)))
}
