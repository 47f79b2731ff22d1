//! Replay Proxy Binary
//!
//! Command line, configuration loading and startup for the archival replay proxy. The proxy
//! itself lives in `replay-proxy-core`.

use anyhow::{Context, Result};
use clap::Parser;
use replay_proxy_core::{CertificateAuthority, GatewayConfig, ProxyConfig, ProxyServer};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;

pub mod logging;
use logging::LoggingConfig;


#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON configuration file; flags and environment override its values
    #[arg(long, env = "REPLAY_PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on for HTTP/HTTPS traffic
    #[arg(long, env = "REPLAY_PROXY_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Port to listen on for HTTP/HTTPS traffic
    #[arg(long, env = "REPLAY_PROXY_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// Port to expose the Admin API (health/metrics)
    #[arg(long, env = "REPLAY_PROXY_ADMIN_PORT")]
    pub admin_port: Option<u16>,

    /// Root of the proxy's own domain family, e.g. "pywb.proxy"
    #[arg(long, env = "REPLAY_PROXY_ROOT_DOMAIN")]
    pub root_domain: Option<String>,

    /// Directory holding the signing root (created on first start)
    #[arg(long, env = "REPLAY_PROXY_CA_DIR")]
    pub ca_dir: Option<PathBuf>,

    /// Serve captures from this JSON capture index
    #[arg(long, env = "REPLAY_PROXY_INDEX", conflicts_with = "remote")]
    pub index: Option<PathBuf>,

    /// Serve captures from a pywb-compatible server at this base URL
    #[arg(long, env = "REPLAY_PROXY_REMOTE")]
    pub remote: Option<String>,

    /// Collections offered by the remote server
    #[arg(long = "collection", env = "REPLAY_PROXY_COLLECTIONS", value_delimiter = ',')]
    pub collections: Vec<String>,

    /// Seconds to wait for any single gateway call
    #[arg(long, env = "REPLAY_PROXY_GATEWAY_TIMEOUT")]
    pub gateway_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "REPLAY_PROXY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit JSON formatted logs
    #[arg(long, env = "REPLAY_PROXY_LOG_JSON")]
    pub log_json: bool,
}

/// Everything the binary reads from its config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }
}

/// Config file (or defaults), then flags and `REPLAY_PROXY_*` variables on top.
pub fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    let proxy = &mut config.proxy;

    if let Some(addr) = &args.listen_addr {
        proxy.listen_address = addr.clone();
    }
    if let Some(port) = args.listen_port {
        proxy.listen_port = port;
    }
    if let Some(port) = args.admin_port {
        proxy.admin_port = port;
    }
    if let Some(root) = &args.root_domain {
        proxy.routing.root_domain = root.to_ascii_lowercase();
    }
    if let Some(dir) = &args.ca_dir {
        proxy.certificate_config.cert_store_path = dir.display().to_string();
    }
    if let Some(secs) = args.gateway_timeout {
        proxy.gateway_timeout_secs = secs;
    }

    if let Some(index) = &args.index {
        proxy.gateway = GatewayConfig::Index {
            path: index.display().to_string(),
        };
    } else if let Some(base_url) = &args.remote {
        let aggregate_collection = match &proxy.gateway {
            GatewayConfig::Remote {
                aggregate_collection,
                ..
            } => aggregate_collection.clone(),
            GatewayConfig::Index { .. } => "all".to_string(),
        };
        proxy.gateway = GatewayConfig::Remote {
            base_url: base_url.clone(),
            collections: args.collections.clone(),
            aggregate_collection,
        };
    } else if !args.collections.is_empty() {
        match &mut proxy.gateway {
            GatewayConfig::Remote { collections, .. } => *collections = args.collections.clone(),
            GatewayConfig::Index { .. } => {
                anyhow::bail!("--collection only applies to a remote gateway")
            }
        }
    }

    if let Some(level) = &args.log_level {
        if !logging::levels::is_valid_level(level) {
            anyhow::bail!("Unknown log level {:?}", level);
        }
        config.logging.level = level.to_lowercase();
    }
    if args.log_json {
        config.logging.json_format = true;
    }

    config
        .proxy
        .validate()
        .context("Configuration rejected")?;
    Ok(config)
}

/// Open the signing root and serve until `shutdown` resolves.
pub async fn run_proxy<F>(config: ProxyConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!("Starting Replay Proxy...");
    tracing::info!("  Listen: {}:{}", config.listen_address, config.listen_port);
    tracing::info!("  Admin:  {}:{}", config.listen_address, config.admin_port);
    tracing::info!("  Root:   {}", config.routing.root_domain);

    let ca = CertificateAuthority::load_or_create(&config.certificate_config).with_context(|| {
        format!(
            "Failed to open certificate authority in {}",
            config.certificate_config.cert_store_path
        )
    })?;

    ProxyServer::new(config, ca)
        .run_until(shutdown)
        .await
        .context("Proxy server failed")
}
