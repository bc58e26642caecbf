//! Certificate Authority management for MITM proxy.
//!
//! Generates and persists the root CA used to sign per-domain leaf
//! certificates, and issues those leaves on first use.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

pub use crate::error::CaManagerError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "tollgate-ca.crt";
const CA_KEY_FILENAME: &str = "tollgate-ca.key";

/// Common name of the root certificate.
pub const CA_COMMON_NAME: &str = "Tollgate Interception Root CA";

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Manages the root CA files for the MITM proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager using the default Tollgate data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("dev", "tollgate", "Tollgate")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        Ok(Self::new(project_dirs.data_dir().join("certs")))
    }

    /// Returns the CA directory.
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the CA exists, generating and persisting it if necessary.
    ///
    /// Failing to persist a new CA is fatal for the caller: without it no
    /// client can be made to trust intercepted connections.
    pub fn ensure_ca(&self) -> Result<CertificateAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new root CA certificate and key and writes them as PEM.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir).map_err(|e| CaManagerError::Write(e.to_string()))?;

        let key_pair = generate_rsa_key_pair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, "Tollgate");
        params.distinguished_name = dn;

        // rcgen marks both extensions critical.
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.key_identifier_method = KeyIdMethod::Sha256;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaManagerError::Write(e.to_string()))?;
        write_private_key(&self.key_path(), &key_pair.serialize_pem())?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Loads the persisted CA.
    pub fn load_authority(&self) -> Result<CertificateAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;
        CertificateAuthority::from_pem(&cert_pem, &key_pem)
    }

    /// Reads the CA certificate as DER bytes (for trust store installation).
    pub fn read_cert_der(&self) -> Result<Vec<u8>, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        Ok(parse_cert_pem(&cert_pem)?.to_vec())
    }
}

/// A per-domain certificate signed by the root CA.
pub struct LeafCertificate {
    domain: String,
    cert_pem: String,
    key_pem: String,
    server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
    /// Domain this certificate was issued for.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Certificate in PEM form.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Private key in PEM form.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// TLS server configuration presenting this certificate.
    ///
    /// ALPN is pinned to HTTP/1.1; the request parser does not speak h2.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// The loaded root CA plus the leaf cache.
///
/// The cache never evicts. Two connections racing on a cold domain may both
/// generate a leaf; the later insert wins and both certificates are valid.
pub struct CertificateAuthority {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    issuer: Issuer<'static, KeyPair>,
    leaves: RwLock<HashMap<String, Arc<LeafCertificate>>>,
}

impl CertificateAuthority {
    /// Builds the authority from a PEM certificate and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaManagerError> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;
        let cert_der = parse_cert_pem(cert_pem)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            cert_der,
            issuer,
            leaves: RwLock::new(HashMap::new()),
        })
    }

    /// Root certificate in PEM form.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Root certificate in DER form.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Number of cached leaf certificates.
    pub fn cached_leaf_count(&self) -> usize {
        self.leaves.read().len()
    }

    /// Returns the leaf for `domain`, issuing and caching it on first use.
    pub fn cert_for_domain(&self, domain: &str) -> Result<Arc<LeafCertificate>, CaManagerError> {
        if let Some(leaf) = self.leaves.read().get(domain) {
            tracing::trace!(domain, "Leaf certificate cache hit");
            return Ok(Arc::clone(leaf));
        }

        let leaf = Arc::new(self.issue_leaf(domain)?);
        self.leaves
            .write()
            .insert(domain.to_string(), Arc::clone(&leaf));
        tracing::debug!(domain, "Issued leaf certificate");
        Ok(leaf)
    }

    /// Async form of [`cert_for_domain`](Self::cert_for_domain).
    ///
    /// Cache hits return immediately; a cold domain is issued on the blocking
    /// pool because RSA key generation can take hundreds of milliseconds.
    pub async fn leaf_for_domain(
        self: &Arc<Self>,
        domain: &str,
    ) -> Result<Arc<LeafCertificate>, CaManagerError> {
        if let Some(leaf) = self.leaves.read().get(domain) {
            return Ok(Arc::clone(leaf));
        }

        let authority = Arc::clone(self);
        let owned = domain.to_string();
        tokio::task::spawn_blocking(move || authority.cert_for_domain(&owned))
            .await
            .map_err(|e| CaManagerError::Signing {
                domain: domain.to_string(),
                reason: format!("issuing task failed: {}", e),
            })?
    }

    fn issue_leaf(&self, domain: &str) -> Result<LeafCertificate, CaManagerError> {
        let signing_err = |e: &dyn std::fmt::Display| CaManagerError::Signing {
            domain: domain.to_string(),
            reason: e.to_string(),
        };

        let key_pair = generate_rsa_key_pair()?;

        let is_ip = domain.parse::<std::net::IpAddr>().is_ok();
        let sans = if is_ip {
            vec![domain.to_string()]
        } else {
            vec![domain.to_string(), format!("*.{}", domain)]
        };

        let mut params = CertificateParams::new(sans).map_err(|e| signing_err(&e))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| signing_err(&e))?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let chain = vec![cert.der().clone(), self.cert_der.clone()];

        let mut server_config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| signing_err(&e))?
        .with_no_client_auth()
        .with_single_cert(chain, key_der)
        .map_err(|e| signing_err(&e))?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(LeafCertificate {
            domain: domain.to_string(),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            server_config: Arc::new(server_config),
        })
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached_leaves", &self.cached_leaf_count())
            .finish_non_exhaustive()
    }
}

/// Generates a 2048-bit RSA key, or ECDSA P-256 if the backend cannot.
fn generate_rsa_key_pair() -> Result<KeyPair, CaManagerError> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .or_else(|e| {
            tracing::warn!("RSA key generation unavailable ({}), using ECDSA P-256", e);
            KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        })
        .map_err(|e| CaManagerError::Generation(e.to_string()))
}

fn parse_cert_pem(cert_pem: &str) -> Result<CertificateDer<'static>, CaManagerError> {
    rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .next()
        .ok_or_else(|| CaManagerError::Parse("no certificate in PEM".into()))?
        .map_err(|e| CaManagerError::Parse(e.to_string()))
}

/// Writes the private key readable by the owner only.
fn write_private_key(path: &Path, pem: &str) -> Result<(), CaManagerError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .map_err(|e| CaManagerError::Write(e.to_string()))?;
    file.write_all(pem.as_bytes())
        .map_err(|e| CaManagerError::Write(e.to_string()))
}
