//! Per-host leaf certificates for TLS interception.
//!
//! Every intercepted hostname gets exactly one leaf, issued lazily on its first CONNECT and
//! reused for the lifetime of the process.

use crate::admin::Metrics;
use crate::ca::{CertificateAuthority, SignedLeaf};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use hudsucker::certificate_authority::CertificateAuthority as InterceptionAuthority;
use hudsucker::hyper::http::uri::Authority;
use hudsucker::rustls::{
    self,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Signs leaf certificates for intercepted hosts.
pub trait CertificateIssuer: Send + Sync + 'static {
    fn issue(&self, hostname: &str) -> Result<SignedLeaf>;
}

/// Issuer backed by the persisted root authority.
pub struct AuthorityIssuer {
    authority: Arc<CertificateAuthority>,
    validity_days: u32,
}

impl AuthorityIssuer {
    pub fn new(authority: Arc<CertificateAuthority>, validity_days: u32) -> Self {
        Self {
            authority,
            validity_days,
        }
    }
}

impl CertificateIssuer for AuthorityIssuer {
    fn issue(&self, hostname: &str) -> Result<SignedLeaf> {
        self.authority.sign_leaf(hostname, self.validity_days)
    }
}

/// Self-signed leaves with no authority behind them, for tests and local experiments.
#[derive(Debug, Default)]
pub struct SelfSignedIssuer;

impl CertificateIssuer for SelfSignedIssuer {
    fn issue(&self, hostname: &str) -> Result<SignedLeaf> {
        let mut params = CertificateParams::new(vec![hostname.to_string()]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::issuance(hostname, e))?;
        let cert_der = cert
            .serialize_der()
            .map_err(|e| ProxyError::issuance(hostname, e))?;

        Ok(SignedLeaf {
            cert_der,
            key_der: cert.serialize_private_key_der(),
        })
    }
}

/// A leaf ready to be presented during the TLS handshake.
pub struct HostCertificate {
    pub hostname: String,
    pub cert_der: Vec<u8>,
    server_config: Arc<ServerConfig>,
}

impl HostCertificate {
    fn new(hostname: String, leaf: SignedLeaf) -> Result<Self> {
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::Certificate(leaf.cert_der.clone())],
                rustls::PrivateKey(leaf.key_der),
            )
            .map_err(|e| ProxyError::issuance(&hostname, e))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            hostname,
            cert_der: leaf.cert_der,
            server_config: Arc::new(config),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

type Slot = Arc<OnceCell<Arc<HostCertificate>>>;

/// Hostname-keyed leaf cache with at most one issuance per hostname.
///
/// Concurrent first requests for the same host share one in-flight slot; only the first runs
/// the issuer and the rest wait for its result. A failed issuance leaves the slot empty, so the
/// next CONNECT retries.
#[derive(Clone)]
pub struct HostCertificateCache {
    issuer: Arc<dyn CertificateIssuer>,
    entries: Arc<DashMap<String, Slot>>,
    metrics: Arc<Metrics>,
}

impl HostCertificateCache {
    pub fn new(issuer: Arc<dyn CertificateIssuer>, metrics: Arc<Metrics>) -> Self {
        Self {
            issuer,
            entries: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub async fn get_or_issue(&self, hostname: &str) -> Result<Arc<HostCertificate>> {
        let hostname = normalize_hostname(hostname);
        if hostname.is_empty() {
            return Err(ProxyError::issuance("", "empty hostname"));
        }

        // The map guard is dropped before any awaiting happens.
        let slot: Slot = self
            .entries
            .entry(hostname.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let cert = slot
            .get_or_try_init(|| self.issue(hostname.clone()))
            .await
            .map_err(|e| {
                self.metrics.issuance_failures.fetch_add(1, Ordering::Relaxed);
                e
            })?;
        Ok(Arc::clone(cert))
    }

    async fn issue(&self, hostname: String) -> Result<Arc<HostCertificate>> {
        debug!("Issuing leaf certificate for {}", hostname);
        let issuer = Arc::clone(&self.issuer);
        let host = hostname.clone();

        let leaf = tokio::task::spawn_blocking(move || issuer.issue(&host))
            .await
            .map_err(|e| ProxyError::issuance(&hostname, e))??;
        let cert = HostCertificate::new(hostname, leaf)?;

        self.metrics.certificates_issued.fetch_add(1, Ordering::Relaxed);
        info!("Issued leaf certificate for {}", cert.hostname);
        Ok(Arc::new(cert))
    }

    /// Hostnames with a finished leaf.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InterceptionAuthority for HostCertificateCache {
    async fn gen_server_config(&self, authority: &Authority) -> Arc<ServerConfig> {
        match self.get_or_issue(authority.host()).await {
            Ok(cert) => cert.server_config(),
            Err(e) => {
                // Fails this handshake only; the next CONNECT tries again.
                warn!("{}", e);
                Arc::new(
                    ServerConfig::builder()
                        .with_safe_defaults()
                        .with_no_client_auth()
                        .with_cert_resolver(Arc::new(RefuseHandshake)),
                )
            }
        }
    }
}

/// Resolver that has no certificate to offer, which aborts the handshake.
#[derive(Debug)]
struct RefuseHandshake;

impl ResolvesServerCert for RefuseHandshake {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        None
    }
}

fn normalize_hostname(hostname: &str) -> String {
    hostname
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Wraps another issuer and counts signing operations.
    struct CountingIssuer<I> {
        inner: I,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl<I: CertificateIssuer> CountingIssuer<I> {
        fn new(inner: I, delay: Duration) -> Self {
            Self {
                inner,
                calls: AtomicUsize::new(0),
                delay,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl<I: CertificateIssuer> CertificateIssuer for CountingIssuer<I> {
        fn issue(&self, hostname: &str) -> Result<SignedLeaf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.issue(hostname)
        }
    }

    /// Fails the first `failures` calls.
    struct FlakyIssuer {
        failures: AtomicUsize,
    }

    impl CertificateIssuer for FlakyIssuer {
        fn issue(&self, hostname: &str) -> Result<SignedLeaf> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProxyError::issuance(hostname, "signer offline"));
            }
            SelfSignedIssuer.issue(hostname)
        }
    }

    /// Refuses one hostname, signs every other.
    struct RefusingIssuer {
        refused: &'static str,
    }

    impl CertificateIssuer for RefusingIssuer {
        fn issue(&self, hostname: &str) -> Result<SignedLeaf> {
            if hostname == self.refused {
                return Err(ProxyError::issuance(hostname, "signer refused"));
            }
            SelfSignedIssuer.issue(hostname)
        }
    }

    /// Feed a client hello for `host` to a server built from `config`.
    fn server_answers_hello(config: Arc<ServerConfig>, host: &str) -> bool {
        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let mut client = rustls::ClientConnection::new(
            Arc::new(client_config),
            rustls::ServerName::try_from(host).unwrap(),
        )
        .unwrap();
        let mut server = rustls::ServerConnection::new(config).unwrap();

        let mut hello = Vec::new();
        client.write_tls(&mut hello).unwrap();
        server.read_tls(&mut hello.as_slice()).unwrap();
        server.process_new_packets().is_ok() && server.wants_write()
    }

    fn san_of(cert: &HostCertificate) -> Vec<String> {
        let (_, parsed) = x509_parser::parse_x509_certificate(&cert.cert_der).unwrap();
        let san = parsed.subject_alternative_name().unwrap().unwrap();
        san.value
            .general_names
            .iter()
            .map(|name| match name {
                x509_parser::extensions::GeneralName::DNSName(dns) => dns.to_string(),
                other => format!("{:?}", other),
            })
            .collect()
    }

    fn cache_with(issuer: Arc<dyn CertificateIssuer>) -> HostCertificateCache {
        HostCertificateCache::new(issuer, Arc::new(Metrics::default()))
    }

    #[tokio::test]
    async fn test_distinct_hosts_get_distinct_leaves() {
        let cache = cache_with(Arc::new(SelfSignedIssuer));

        let a = cache.get_or_issue("iana.org").await.unwrap();
        let b = cache.get_or_issue("example.com").await.unwrap();

        assert_ne!(a.cert_der, b.cert_der);
        assert_eq!(san_of(&a), vec!["iana.org".to_string()]);
        assert_eq!(san_of(&b), vec!["example.com".to_string()]);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_repeat_lookup_returns_cached_leaf() {
        let issuer = Arc::new(CountingIssuer::new(SelfSignedIssuer, Duration::ZERO));
        let cache = cache_with(issuer.clone());

        let first = cache.get_or_issue("iana.org").await.unwrap();
        let second = cache.get_or_issue("IANA.org.").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_issue_once() {
        let issuer = Arc::new(CountingIssuer::new(
            SelfSignedIssuer,
            Duration::from_millis(50),
        ));
        let cache = cache_with(issuer.clone());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.get_or_issue("new.example.org").await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(issuer.calls(), 1, "exactly one signing operation");
        assert!(results.iter().all(|cert| Arc::ptr_eq(cert, &results[0])));
    }

    #[tokio::test]
    async fn test_failed_issuance_is_retried() {
        let cache = cache_with(Arc::new(FlakyIssuer {
            failures: AtomicUsize::new(1),
        }));

        let err = cache.get_or_issue("iana.org").await.err().unwrap();
        assert!(matches!(err, ProxyError::Issuance { .. }));
        assert_eq!(cache.metrics.issuance_failures.load(Ordering::Relaxed), 1);
        assert!(cache.is_empty());

        let cert = cache.get_or_issue("iana.org").await.unwrap();
        assert_eq!(cert.hostname, "iana.org");
    }

    #[tokio::test]
    async fn test_authority_issuer_signs_with_root() {
        let dir = tempfile::tempdir().unwrap();
        let authority = Arc::new(CertificateAuthority::new(dir.path()).unwrap());
        let cache = cache_with(Arc::new(AuthorityIssuer::new(authority.clone(), 30)));

        let cert = cache.get_or_issue("iana.org").await.unwrap();
        let (_, leaf) = x509_parser::parse_x509_certificate(&cert.cert_der).unwrap();
        let (_, root) = x509_parser::parse_x509_certificate(authority.ca_cert_der()).unwrap();
        assert_eq!(leaf.issuer().to_string(), root.subject().to_string());
        assert_eq!(cache.metrics.certificates_issued.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_server_config_for_authority() {
        let cache = cache_with(Arc::new(SelfSignedIssuer));
        let authority: Authority = "iana.org:443".parse().unwrap();

        let config = cache.gen_server_config(&authority).await;
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_issuance_refuses_only_that_host() {
        let cache = cache_with(Arc::new(RefusingIssuer {
            refused: "broken.example",
        }));

        let refused = cache
            .gen_server_config(&"broken.example:443".parse().unwrap())
            .await;
        assert!(!server_answers_hello(refused, "broken.example"));
        assert_eq!(cache.metrics.issuance_failures.load(Ordering::Relaxed), 1);

        let served = cache.gen_server_config(&"iana.org:443".parse().unwrap()).await;
        assert!(server_answers_hello(served, "iana.org"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_hostname_normalization() {
        assert_eq!(normalize_hostname("IANA.org."), "iana.org");
        assert_eq!(normalize_hostname("[::1]"), "::1");
    }
}
