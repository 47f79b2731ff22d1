//! Configuration types and utilities

use crate::error::ProxyError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Fixed download path of the root certificate in PEM form.
pub const PEM_DOWNLOAD_PATH: &str = "/replay-proxy-ca.pem";
/// Fixed download path of the root certificate and key as a PKCS12 bundle.
pub const P12_DOWNLOAD_PATH: &str = "/replay-proxy-ca.p12";

/// Static Proxy Startup Configuration
/// These settings are set at startup and do not change during runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyStartupConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Port to listen on
    pub listen_port: u16,
    /// Admin API port
    pub admin_port: u16,
    /// Magic domain family and session cookie
    pub routing: RoutingConfig,
    /// Certificate configuration
    pub certificate_config: CertificateConfig,
    /// Where captures come from
    pub gateway: GatewayConfig,
    /// Upper bound for any single gateway call
    pub gateway_timeout_secs: u64,
}

impl Default for ProxyStartupConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 8080,
            admin_port: 9091,
            routing: RoutingConfig::default(),
            certificate_config: CertificateConfig::default(),
            gateway: GatewayConfig::default(),
            gateway_timeout_secs: 15,
        }
    }
}

impl ProxyStartupConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            ProxyError::Configuration(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.routing.validate()?;
        if self.listen_port == self.admin_port {
            return Err(ProxyError::Configuration(format!(
                "Proxy and admin API cannot share port {}",
                self.listen_port
            )));
        }
        if self.gateway_timeout_secs == 0 {
            return Err(ProxyError::Configuration(
                "gateway_timeout_secs must be positive".to_string(),
            ));
        }
        match &self.gateway {
            GatewayConfig::Index { path } if path.is_empty() => Err(ProxyError::Configuration(
                "Index gateway needs a path".to_string(),
            )),
            GatewayConfig::Remote { base_url, .. } => url::Url::parse(base_url)
                .map(|_| ())
                .map_err(|e| {
                    ProxyError::Configuration(format!("Invalid gateway base_url {}: {}", base_url, e))
                }),
            _ => Ok(()),
        }
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}

/// The proxy's own domain family and session cookie settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Apex of the magic domain family, e.g. `replay.proxy`
    pub root_domain: String,
    /// Name of the session cookie
    pub cookie_name: String,
    /// Collection label that pins aggregate mode (`all.<root>`)
    pub aggregate_label: String,
    /// Directory whose files override the built-in `/static/` assets
    pub static_dir: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            root_domain: "replay.proxy".to_string(),
            cookie_name: "__replay_proxy_sesh".to_string(),
            aggregate_label: "all".to_string(),
            static_dir: None,
        }
    }
}

impl RoutingConfig {
    pub fn with_root_domain(root_domain: &str) -> Self {
        Self {
            root_domain: root_domain.to_ascii_lowercase(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let root = &self.root_domain;
        let labels_ok = !root.is_empty()
            && root.split('.').all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            });
        if !labels_ok {
            return Err(ProxyError::Configuration(format!(
                "root_domain {:?} is not a valid DNS name",
                root
            )));
        }
        if self.cookie_name.is_empty() || self.cookie_name.contains([';', '=', ' ']) {
            return Err(ProxyError::Configuration(format!(
                "cookie_name {:?} is not a valid cookie name",
                self.cookie_name
            )));
        }
        if self.aggregate_label.is_empty() || self.aggregate_label.contains('.') {
            return Err(ProxyError::Configuration(format!(
                "aggregate_label {:?} must be a single DNS label",
                self.aggregate_label
            )));
        }
        Ok(())
    }

    /// True for the root domain and anything underneath it.
    pub fn is_magic_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.');
        host.eq_ignore_ascii_case(&self.root_domain)
            || host
                .len()
                .checked_sub(self.root_domain.len() + 1)
                .map(|cut| {
                    host.as_bytes()[cut] == b'.'
                        && host.as_bytes()[cut + 1..]
                            .eq_ignore_ascii_case(self.root_domain.as_bytes())
                })
                .unwrap_or(false)
    }

    /// `<label>.<root>`
    pub fn magic_host(&self, label: &str) -> String {
        format!("{}.{}", label, self.root_domain)
    }

    pub fn select_host(&self) -> String {
        self.magic_host("select")
    }

    pub fn query_host(&self) -> String {
        self.magic_host("query")
    }
}

/// Certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// Directory holding `ca.pem`, `ca.key` and `ca.p12`
    pub cert_store_path: String,
    /// Root certificate validity in days
    pub ca_validity_days: u32,
    /// Leaf certificate validity in days
    pub validity_days: u32,
    /// Password protecting the PKCS12 bundle
    pub p12_password: String,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            cert_store_path: "./certs".to_string(),
            ca_validity_days: 3650,
            validity_days: 365,
            p12_password: String::new(),
        }
    }
}

/// Archive backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum GatewayConfig {
    /// Capture index loaded from a JSON file
    Index { path: String },
    /// pywb-compatible CDX and replay endpoints
    Remote {
        base_url: String,
        collections: Vec<String>,
        /// Backend collection that searches everything
        #[serde(default = "default_aggregate_collection")]
        aggregate_collection: String,
    },
}

fn default_aggregate_collection() -> String {
    "all".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig::Index {
            path: "./archive-index.json".to_string(),
        }
    }
}

// Legacy ProxyConfig type alias for backward compatibility
pub type ProxyConfig = ProxyStartupConfig;
