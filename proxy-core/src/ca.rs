use crate::config::CertificateConfig;
use crate::error::ProxyError;
use crate::Result;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

const CA_COMMON_NAME: &str = "Replay Proxy CA";
const CA_ORGANIZATION: &str = "Replay Proxy HTTPS Interception";

/// Downloadable forms of the root certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityArtifact {
    Pem,
    Pkcs12,
}

impl AuthorityArtifact {
    pub fn content_type(&self) -> &'static str {
        match self {
            AuthorityArtifact::Pem => "application/x-x509-ca-cert",
            AuthorityArtifact::Pkcs12 => "application/x-pkcs12",
        }
    }
}

/// A leaf certificate and its private key, both DER.
#[derive(Debug, Clone)]
pub struct SignedLeaf {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Root signing authority for intercepted hosts.
///
/// Created once on first start and loaded from disk afterwards. A root whose files are present
/// but unusable is never replaced: users may already trust its fingerprint.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    cert_pem: String,
    cert_der: Vec<u8>,
    p12_der: Vec<u8>,
}

struct AuthorityPaths {
    cert: PathBuf,
    key: PathBuf,
    p12: PathBuf,
}

impl AuthorityPaths {
    fn new(ca_dir: &Path) -> Self {
        Self {
            cert: ca_dir.join("ca.pem"),
            key: ca_dir.join("ca.key"),
            p12: ca_dir.join("ca.p12"),
        }
    }
}

impl CertificateAuthority {
    /// Load the authority stored in `ca_dir`, or create it there with default settings.
    pub fn new(ca_dir: &Path) -> Result<Self> {
        let config = CertificateConfig {
            cert_store_path: ca_dir.display().to_string(),
            ..Default::default()
        };
        Self::load_or_create(&config)
    }

    pub fn load_or_create(config: &CertificateConfig) -> Result<Self> {
        let ca_dir = Path::new(&config.cert_store_path);
        let paths = AuthorityPaths::new(ca_dir);

        match (paths.cert.exists(), paths.key.exists()) {
            (true, true) => Self::load(&paths, &config.p12_password),
            (false, false) => {
                if !ca_dir.exists() {
                    fs::create_dir_all(ca_dir).map_err(|e| {
                        ProxyError::AuthorityUnavailable(format!(
                            "Cannot create {}: {}",
                            ca_dir.display(),
                            e
                        ))
                    })?;
                }
                Self::generate_and_save(&paths, config)
            }
            (cert, _) => Err(ProxyError::AuthorityUnavailable(format!(
                "Only half of the authority is present in {} (missing {})",
                ca_dir.display(),
                if cert { "ca.key" } else { "ca.pem" }
            ))),
        }
    }

    fn load(paths: &AuthorityPaths, p12_password: &str) -> Result<Self> {
        let cert_pem = fs::read_to_string(&paths.cert).map_err(|e| unavailable(&paths.cert, e))?;
        let key_pem = fs::read_to_string(&paths.key).map_err(|e| unavailable(&paths.key, e))?;

        let mut authority = Self::from_pem(&cert_pem, &key_pem, p12_password)?;

        // The bundle is written once at creation; a missing file is rebuilt in memory only.
        match fs::read(&paths.p12) {
            Ok(bytes) => authority.p12_der = bytes,
            Err(_) => warn!("{} missing, serving a regenerated bundle", paths.p12.display()),
        }

        info!("Loaded certificate authority from {}", paths.cert.display());
        Ok(authority)
    }

    /// Create a CertificateAuthority from PEM strings (cert and key).
    ///
    /// The certificate is kept byte for byte, so the served root always matches the one users
    /// installed.
    pub fn from_pem(cert_pem: &str, key_pem: &str, p12_password: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem).map_err(|e| {
            ProxyError::AuthorityUnavailable(format!("Failed to parse CA key: {}", e))
        })?;
        let cert_der = pem_to_der(cert_pem)?;

        {
            let (_, parsed) = x509_parser::parse_x509_certificate(&cert_der).map_err(|e| {
                ProxyError::AuthorityUnavailable(format!("Failed to parse CA certificate: {}", e))
            })?;
            let spki: &[u8] = &parsed.tbs_certificate.subject_pki.subject_public_key.data;
            if spki != key_pair.public_key_raw() {
                return Err(ProxyError::AuthorityUnavailable(
                    "CA key does not belong to CA certificate".to_string(),
                ));
            }
            if !parsed.validity().is_valid() {
                warn!("Certificate authority is outside its validity period");
            }
        }

        let key_der = key_pair.serialize_der();
        let params = CertificateParams::from_ca_cert_der(&cert_der, key_pair).map_err(|e| {
            ProxyError::AuthorityUnavailable(format!("Failed to load CA parameters: {}", e))
        })?;
        let ca_cert = Certificate::from_params(params).map_err(|e| {
            ProxyError::AuthorityUnavailable(format!("Failed to rebuild CA signer: {}", e))
        })?;

        let p12_der = build_pkcs12(&cert_der, &key_der, p12_password)?;

        Ok(Self {
            ca_cert,
            cert_pem: cert_pem.to_string(),
            cert_der,
            p12_der,
        })
    }

    /// Generate a new Root CA and save it to disk
    fn generate_and_save(paths: &AuthorityPaths, config: &CertificateConfig) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(i64::from(config.ca_validity_days));

        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256).map_err(|e| {
            ProxyError::AuthorityUnavailable(format!("Failed to generate CA key: {}", e))
        })?;
        params.key_pair = Some(key_pair);

        let cert = Certificate::from_params(params).map_err(|e| {
            ProxyError::AuthorityUnavailable(format!("Failed to generate CA cert: {}", e))
        })?;

        // Every serialize call re-signs, so serialize exactly once and derive the DER from it.
        let cert_pem = cert.serialize_pem().map_err(|e| {
            ProxyError::AuthorityUnavailable(format!("Failed to serialize CA cert: {}", e))
        })?;
        let cert_der = pem_to_der(&cert_pem)?;
        let key_pem = cert.serialize_private_key_pem();
        let key_der = cert.serialize_private_key_der();
        let p12_der = build_pkcs12(&cert_der, &key_der, &config.p12_password)?;

        fs::write(&paths.cert, &cert_pem).map_err(|e| unavailable(&paths.cert, e))?;
        fs::write(&paths.key, &key_pem).map_err(|e| unavailable(&paths.key, e))?;
        fs::write(&paths.p12, &p12_der).map_err(|e| unavailable(&paths.p12, e))?;

        info!("Created certificate authority at {}", paths.cert.display());

        Ok(Self {
            ca_cert: cert,
            cert_pem,
            cert_der,
            p12_der,
        })
    }

    /// Sign a leaf certificate whose only subject alternative name is `hostname`.
    pub fn sign_leaf(&self, hostname: &str, validity_days: u32) -> Result<SignedLeaf> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san_for(hostname)];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(i64::from(validity_days));

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::issuance(hostname, format!("bad parameters: {}", e)))?;
        let cert_der = cert
            .serialize_der_with_signer(&self.ca_cert)
            .map_err(|e| ProxyError::issuance(hostname, format!("signing failed: {}", e)))?;

        Ok(SignedLeaf {
            cert_der,
            key_der: cert.serialize_private_key_der(),
        })
    }

    /// Get the Root CA certificate in PEM format.
    pub fn ca_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Get the Root CA certificate in DER format.
    pub fn ca_cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Root certificate and key as a PKCS12 bundle.
    pub fn pkcs12_der(&self) -> &[u8] {
        &self.p12_der
    }

    pub fn artifact(&self, artifact: AuthorityArtifact) -> &[u8] {
        match artifact {
            AuthorityArtifact::Pem => self.cert_pem.as_bytes(),
            AuthorityArtifact::Pkcs12 => &self.p12_der,
        }
    }
}

fn san_for(hostname: &str) -> SanType {
    match hostname.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(hostname.to_string()),
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> ProxyError {
    ProxyError::AuthorityUnavailable(format!("{}: {}", path.display(), err))
}

fn pem_to_der(cert_pem: &str) -> Result<Vec<u8>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).map_err(|e| {
        ProxyError::AuthorityUnavailable(format!("CA certificate is not valid PEM: {}", e))
    })?;
    Ok(pem.contents)
}

fn build_pkcs12(cert_der: &[u8], key_der: &[u8], password: &str) -> Result<Vec<u8>> {
    p12::PFX::new(cert_der, key_der, None, password, CA_COMMON_NAME)
        .map(|pfx| pfx.to_der())
        .ok_or_else(|| {
            ProxyError::AuthorityUnavailable("Failed to build PKCS12 bundle".to_string())
        })
}
