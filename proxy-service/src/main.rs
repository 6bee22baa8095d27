//! `switchyard` — dynamic API-configurable reverse proxy.
//!
//! Two listen surfaces: the public proxy port carries end-user HTTP and
//! WebSocket traffic, and the management port exposes the authenticated
//! `/api/routes` control plane.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxy_service::config::{auth_token_from_env, AUTH_TOKEN_ENV};
use proxy_service::{ProxyConfig, ProxyService};

#[derive(Parser, Debug)]
#[command(name = "switchyard", version)]
#[command(about = "Dynamic reverse proxy with a runtime routing API", long_about = None)]
struct Cli {
    /// Public-facing IP of the proxy
    #[arg(long, default_value = "0.0.0.0")]
    ip: IpAddr,

    /// Public-facing port of the proxy
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Inward-facing IP for API requests
    #[arg(long, default_value = "127.0.0.1")]
    api_ip: IpAddr,

    /// Inward-facing port for API requests (defaults to --port + 1)
    #[arg(long)]
    api_port: Option<u16>,

    /// Default proxy target (proto://host[:port])
    #[arg(long)]
    default_target: Option<String>,

    /// Alternate server for handling proxy errors (proto://host[:port])
    #[arg(long)]
    error_target: Option<String>,

    /// Directory of static error pages (<code>.html, error.html)
    #[arg(long)]
    error_path: Option<PathBuf>,

    /// Accepted for compatibility; HTTPS redirection is not supported
    #[arg(long)]
    redirect_port: Option<u16>,

    /// Avoid prepending target paths to proxied requests
    #[arg(long)]
    no_prepend_path: bool,

    /// Don't include the routing prefix in proxied requests
    #[arg(long)]
    no_include_prefix: bool,

    /// Seconds to wait for the first upstream response byte (0 = no limit)
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Idle seconds allowed once streaming has begun (0 = no limit)
    #[arg(long, default_value_t = 0)]
    proxy_timeout: u64,

    /// Don't add X-Forwarded-* headers to proxied requests
    #[arg(long)]
    no_x_forward: bool,

    /// Change the origin of the Host header to the target URL
    #[arg(long)]
    change_origin: bool,

    /// Custom header added to proxied requests; repeatable (NAME:VALUE)
    #[arg(long = "custom-header", value_parser = parse_custom_header)]
    custom_header: Vec<(String, String)>,

    /// Storage backend identifier (memory, database, or a registered name)
    #[arg(long, default_value = "memory")]
    storage_backend: String,

    /// Log level (debug, info, warning, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write our PID to a file
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

fn parse_custom_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("a single colon was expected in custom header: {raw}")),
    }
}

fn level_filter(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "warning" | "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level_filter(&cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.redirect_port.is_some() {
        bail!("--redirect-port is not supported");
    }
    if cli.error_target.is_some() && cli.error_path.is_some() {
        bail!("cannot specify both --error-target and --error-path, pick one");
    }

    let error_target = cli
        .error_target
        .as_deref()
        .map(url::Url::parse)
        .transpose()
        .context("invalid --error-target")?;

    let auth_token = match auth_token_from_env() {
        Some(token) => token,
        None => {
            let token = uuid::Uuid::new_v4().simple().to_string();
            warn!(
                "{AUTH_TOKEN_ENV} not set; generated token for this run: {token}"
            );
            token
        }
    };

    let config = ProxyConfig {
        ip: cli.ip,
        port: cli.port,
        api_ip: cli.api_ip,
        api_port: cli.api_port.unwrap_or(cli.port + 1),
        default_target: cli.default_target,
        error_target,
        error_path: cli.error_path,
        prepend_path: !cli.no_prepend_path,
        include_prefix: !cli.no_include_prefix,
        x_forward: !cli.no_x_forward,
        change_origin: cli.change_origin,
        custom_headers: cli.custom_header,
        timeout: Duration::from_secs(cli.timeout),
        proxy_timeout: Duration::from_secs(cli.proxy_timeout),
        auth_token: Some(auth_token),
        storage_backend: cli.storage_backend,
    };

    let service = ProxyService::from_config(config).context("configuration failed")?;
    let handle = service.start().await.context("failed to start listeners")?;
    handle.ready_rx.await.ok();

    let pid_file = cli.pid_file;
    if let Some(path) = &pid_file {
        let pid = std::process::id().to_string();
        info!(pid = %pid, path = %path.display(), "writing pid file");
        std::fs::write(path, pid).context("failed to write pid file")?;
    }

    let mut finished_rx = handle.finished_rx;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            let _ = handle.shutdown_tx.send(());
            let _ = (&mut finished_rx).await;
        }
        _ = &mut finished_rx => {
            warn!("listeners stopped unexpectedly");
        }
    }

    if let Some(path) = &pid_file {
        let _ = std::fs::remove_file(path);
    }

    info!("shutdown complete");
    Ok(())
}
