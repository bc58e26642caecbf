//! Tollgate - inspection proxy for AI-provider traffic.
//!
//! This binary wires the proxy to its collaborators:
//! - DLP inspector (`INSPECTOR_URL`, otherwise every request is allowed)
//! - Settings source (`SETTINGS_URL`, otherwise the safe default snapshot)
//! - Telemetry sink (`TELEMETRY_URL`, otherwise the log)
//!
//! and runs until Ctrl-C.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tollgate_core::{
    DomainPolicy, HttpInspector, HttpSettings, HttpTelemetry, Inspector, PassiveInspector,
    PolicySnapshot, SettingsSource, StaticSettings, TelemetrySink, TracingTelemetry,
};
use tollgate_proxy::{
    Limits, ProxyConfig, ProxyServer, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_INSPECTION_BYTES,
    DEFAULT_MAX_MEMORY_MB, DEFAULT_PROXY_PORT,
};

/// Tollgate - TLS-terminating inspection proxy for AI-provider APIs
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    bind: IpAddr,

    /// Directory holding the root CA key and certificate
    #[arg(long, env = "CERTS_DIR")]
    certs_dir: Option<PathBuf>,

    /// Forward requests when the inspector fails or times out
    #[arg(long, env = "FAIL_OPEN", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    fail_open: bool,

    /// Inspection timeout in milliseconds
    #[arg(long, env = "INSPECTION_TIMEOUT_MS", default_value_t = 10_000)]
    inspection_timeout_ms: u64,

    /// Bodies above this size are rejected with 413
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: u64,

    /// Bodies above this size are streamed without inspection
    #[arg(long, env = "MAX_INSPECTION_BYTES", default_value_t = DEFAULT_MAX_INSPECTION_BYTES)]
    max_inspection_bytes: u64,

    /// Resident memory above which the watchdog warns
    #[arg(long, env = "MAX_MEMORY_MB", default_value_t = DEFAULT_MAX_MEMORY_MB)]
    max_memory_mb: u64,

    /// DLP inspection endpoint
    #[arg(long, env = "INSPECTOR_URL")]
    inspector_url: Option<String>,

    /// Policy settings endpoint
    #[arg(long, env = "SETTINGS_URL")]
    settings_url: Option<String>,

    /// Audit record endpoint
    #[arg(long, env = "TELEMETRY_URL")]
    telemetry_url: Option<String>,

    /// JSON file with extra passthrough, AI and desktop-app domains
    #[arg(long, env = "DOMAINS_FILE")]
    domains_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("dev", "tollgate", "Tollgate").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tollgate={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("tollgate")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Size and time limits from the command line.
fn limits_from(args: &Args) -> anyhow::Result<Limits> {
    if args.max_inspection_bytes > args.max_body_bytes {
        bail!(
            "MAX_INSPECTION_BYTES ({}) must not exceed MAX_BODY_BYTES ({})",
            args.max_inspection_bytes,
            args.max_body_bytes
        );
    }
    if args.inspection_timeout_ms == 0 {
        bail!("INSPECTION_TIMEOUT_MS must be greater than zero");
    }

    Ok(Limits {
        max_body_bytes: args.max_body_bytes,
        max_inspection_bytes: args.max_inspection_bytes,
        inspection_timeout: Duration::from_millis(args.inspection_timeout_ms),
        fail_open: args.fail_open,
        max_memory_mb: args.max_memory_mb,
        ..Limits::default()
    })
}

/// Builds the proxy configuration and its collaborators.
fn build_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let limits = limits_from(args)?;

    let policy = match &args.domains_file {
        Some(path) => DomainPolicy::with_defaults_and_file(path)
            .with_context(|| format!("Failed to load domains file {:?}", path))?,
        None => DomainPolicy::with_defaults(),
    };

    let config = match &args.certs_dir {
        Some(dir) => ProxyConfig::with_ca_dir(dir),
        None => ProxyConfig::new()?,
    };

    let inspector: Arc<dyn Inspector> = match &args.inspector_url {
        Some(url) => Arc::new(HttpInspector::new(url)),
        None => {
            tracing::warn!("No inspector configured, every request will be allowed");
            Arc::new(PassiveInspector)
        }
    };
    let settings: Arc<dyn SettingsSource> = match &args.settings_url {
        Some(url) => Arc::new(HttpSettings::new(url)),
        None => Arc::new(StaticSettings::new(PolicySnapshot::default())),
    };
    let telemetry: Arc<dyn TelemetrySink> = match &args.telemetry_url {
        Some(url) => Arc::new(HttpTelemetry::spawn(url)),
        None => Arc::new(TracingTelemetry),
    };

    Ok(config
        .with_addr(SocketAddr::new(args.bind, args.port))
        .with_limits(limits)
        .with_policy(policy)
        .with_inspector(inspector)
        .with_settings(settings)
        .with_telemetry(telemetry))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Tollgate {}...", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Args: {:?}", args);

    let config = build_config(&args)?;
    let server = ProxyServer::new(config).context("Failed to set up the root CA")?;

    println!("Root CA certificate: {}", server.ca_cert_path().display());
    println!("Install it in the client trust store before routing traffic through the proxy.");

    let handle = server.start().await?;
    println!("Listening on {} (PAC: http://{}/proxy.pac)", handle.addr(), handle.addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutdown requested");
    handle.stop().await;

    tracing::info!("Tollgate shutting down");
    Ok(())
}
