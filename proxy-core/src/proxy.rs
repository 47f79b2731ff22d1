use crate::{
    admin::{start_admin_server, Metrics},
    ca::CertificateAuthority,
    certificates::{AuthorityIssuer, HostCertificateCache},
    config::ProxyConfig,
    error::ProxyError,
    gateway,
    handlers::ReplayHandler,
    routing::RoutingEngine,
    session_store::SessionStore,
    Result,
};
use hudsucker::ProxyBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

pub struct ProxyServer {
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    metrics: Arc<Metrics>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, ca: CertificateAuthority) -> Self {
        Self {
            config,
            ca: Arc::new(ca),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.config.validate()?;

        let addr: SocketAddr = format!("{}:{}", self.config.listen_address, self.config.listen_port)
            .parse()
            .map_err(|e| {
                ProxyError::Configuration(format!(
                    "Invalid listen address {}: {}",
                    self.config.listen_address, e
                ))
            })?;
        info!("Starting proxy server on {}", addr);
        info!(
            "Magic domain {} (session cookie {})",
            self.config.routing.root_domain, self.config.routing.cookie_name
        );

        // Start Admin Server
        let admin_address = self.config.listen_address.clone();
        let admin_port = self.config.admin_port;
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = start_admin_server(&admin_address, admin_port, metrics).await {
                error!("Admin server failed: {}", e);
            }
        });

        let gateway = gateway::from_config(&self.config.gateway)?;

        let issuer = AuthorityIssuer::new(
            Arc::clone(&self.ca),
            self.config.certificate_config.validity_days,
        );
        let certificates = HostCertificateCache::new(Arc::new(issuer), self.metrics.clone());

        let sessions = Arc::new(SessionStore::new(self.metrics.clone()));
        let engine = RoutingEngine::new(
            self.config.routing.clone(),
            sessions,
            gateway,
            self.config.gateway_timeout(),
            self.metrics.clone(),
        );
        let handler = ReplayHandler::new(Arc::new(engine), self.ca.clone(), self.metrics.clone());

        let proxy = ProxyBuilder::new()
            .with_addr(addr)
            .with_rustls_client()
            .with_ca(certificates)
            .with_http_handler(handler)
            .build();

        proxy
            .start(shutdown)
            .await
            .map_err(|e| ProxyError::Network(format!("Proxy failed: {}", e)))?;

        info!("Proxy server on {} stopped", addr);
        Ok(())
    }
}
