//! Certificate Authority (CA) Management
//!
//! This module handles:
//! - Root CA generation (2048-bit RSA, 10-year validity) and persistence as PEM
//! - Loading an existing root CA unchanged on later starts
//! - Per-domain leaf certificate synthesis signed by the root (SHA-256)
//! - Leaf caching for the process lifetime

use super::cert_cache::{CacheStats, CertCache};
use super::error::{MitmError, Result};
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
    PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tracing::{debug, info, warn};

/// File name of the persisted root certificate
pub const CA_CERT_FILE: &str = "ca.crt";

/// File name of the persisted root private key
pub const CA_KEY_FILE: &str = "ca.key";

/// Key algorithm used for the root and for leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyAlgorithm {
    /// 2048-bit RSA with SHA-256 signatures
    #[default]
    Rsa2048,
    /// NIST P-256 ECDSA with SHA-256 signatures (fast, for tests and embedded use)
    EcdsaP256,
}

impl FromStr for KeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rsa2048" | "rsa" => Ok(Self::Rsa2048),
            "ecdsa-p256" | "ecdsa" | "p256" => Ok(Self::EcdsaP256),
            other => Err(format!("unknown key algorithm '{}'", other)),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa2048 => f.write_str("rsa2048"),
            Self::EcdsaP256 => f.write_str("ecdsa-p256"),
        }
    }
}

/// CA configuration
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Path to CA certificate file
    pub cert_path: PathBuf,

    /// Path to CA private key file
    pub key_path: PathBuf,

    /// Common name of the root certificate
    pub common_name: String,

    /// Organization name for root and leaf subjects
    pub organization: String,

    /// Organizational unit of the root certificate
    pub organizational_unit: String,

    /// Organizational unit of leaf certificates
    pub leaf_organizational_unit: String,

    /// Country code for root and leaf subjects
    pub country: String,

    /// Root certificate validity in days
    pub ca_validity_days: i64,

    /// Leaf certificate validity in days
    pub leaf_validity_days: i64,

    pub key_algorithm: KeyAlgorithm,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from(CA_CERT_FILE),
            key_path: PathBuf::from(CA_KEY_FILE),
            common_name: "KProxy CA".to_string(),
            organization: "KProxy".to_string(),
            organizational_unit: "KProxy Certificate Authority".to_string(),
            leaf_organizational_unit: "KProxy Proxy Server".to_string(),
            country: "US".to_string(),
            ca_validity_days: 3650,
            leaf_validity_days: 365,
            key_algorithm: KeyAlgorithm::default(),
        }
    }
}

impl CaConfig {
    /// Configuration storing `ca.crt` and `ca.key` inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cert_path: dir.join(CA_CERT_FILE),
            key_path: dir.join(CA_KEY_FILE),
            ..Default::default()
        }
    }
}

/// Forged end-entity certificate for one intercepted domain
pub struct LeafCertificate {
    domain: String,
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
    ca_der: CertificateDer<'static>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl LeafCertificate {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Chain served to clients: leaf first, then the root
    pub fn certificate_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone(), self.ca_der.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }
}

impl fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("domain", &self.domain)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Root certificate and key used to sign leaves
struct Signer {
    cert: Certificate,
    key: KeyPair,
    der: CertificateDer<'static>,
}

/// Certificate Authority for MITM interception
///
/// Owns the root CA and issues leaf certificates for intercepted domains.
pub struct CertificateAuthority {
    config: CaConfig,
    cert_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    signer: Arc<Signer>,
    cache: CertCache<LeafCertificate>,
}

impl CertificateAuthority {
    /// Load the persisted root CA, or generate and persist a new one
    ///
    /// When both files exist they are loaded and left untouched, so repeated
    /// calls across restarts keep the same trust root.
    pub async fn initialize(config: CaConfig) -> Result<Self> {
        info!(
            cert_path = %config.cert_path.display(),
            key_path = %config.key_path.display(),
            "Initializing Certificate Authority"
        );

        let cert_exists = fs::try_exists(&config.cert_path).await.unwrap_or(false);
        let key_exists = fs::try_exists(&config.key_path).await.unwrap_or(false);

        let root = match (cert_exists, key_exists) {
            (true, true) => Self::load_root(&config).await?,
            (false, false) => Self::create_root(&config).await?,
            _ => {
                warn!(
                    cert_exists,
                    key_exists, "Incomplete CA key/cert pair on disk, regenerating both"
                );
                Self::create_root(&config).await?
            }
        };

        info!(
            not_after = %root.not_after,
            key_algorithm = %config.key_algorithm,
            "Certificate Authority ready"
        );

        Ok(Self {
            config,
            cert_pem: root.cert_pem,
            not_before: root.not_before,
            not_after: root.not_after,
            signer: Arc::new(root.signer),
            cache: CertCache::new(),
        })
    }

    async fn create_root(config: &CaConfig) -> Result<RootMaterial> {
        info!("Generating new CA certificate and private key");

        let generate_config = config.clone();
        let root = tokio::task::spawn_blocking(move || generate_root(&generate_config))
            .await
            .map_err(|e| MitmError::ca_generation(format!("Key generation task failed: {}", e)))??;

        Self::save_root(config, &root.cert_pem, &root.signer.key.serialize_pem()).await?;

        Ok(root)
    }

    async fn load_root(config: &CaConfig) -> Result<RootMaterial> {
        info!("Loading existing CA from disk");

        let cert_pem = fs::read_to_string(&config.cert_path)
            .await
            .map_err(|e| MitmError::ca_load(format!("Failed to read cert file: {}", e)))?;
        let key_pem = fs::read_to_string(&config.key_path)
            .await
            .map_err(|e| MitmError::ca_load(format!("Failed to read key file: {}", e)))?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse private key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse certificate: {}", e)))?;
        let not_before = params.not_before;
        let not_after = params.not_after;

        // Re-signing the parsed params yields an issuer with the persisted
        // subject and key; the on-disk PEM stays the exported root.
        let cert = params
            .self_signed(&key)
            .map_err(|e| MitmError::ca_load(format!("Failed to rebuild issuer: {}", e)))?;
        let der = pem_to_der(&cert_pem)?;

        Ok(RootMaterial {
            cert_pem,
            not_before,
            not_after,
            signer: Signer { cert, key, der },
        })
    }

    async fn save_root(config: &CaConfig, cert_pem: &str, key_pem: &str) -> Result<()> {
        for path in [&config.cert_path, &config.key_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).await.map_err(|e| {
                    MitmError::ca_generation(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        fs::write(&config.cert_path, cert_pem)
            .await
            .map_err(|e| MitmError::ca_generation(format!("Failed to save certificate: {}", e)))?;
        fs::write(&config.key_path, key_pem)
            .await
            .map_err(|e| MitmError::ca_generation(format!("Failed to save private key: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&config.key_path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| {
                    MitmError::ca_generation(format!("Failed to restrict key permissions: {}", e))
                })?;
        }

        info!(cert_path = %config.cert_path.display(), "CA certificate and key saved");
        Ok(())
    }

    /// Leaf certificate for `domain`, generated and cached on first use
    pub async fn leaf_for(&self, domain: &str) -> Result<Arc<LeafCertificate>> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Err(MitmError::cert_generation(domain, "empty domain"));
        }

        self.cache
            .get_or_generate(&domain, || {
                let signer = Arc::clone(&self.signer);
                let config = self.config.clone();
                let target = domain.clone();
                let label = domain.clone();
                async move {
                    debug!(domain = %label, "Generating leaf certificate");
                    tokio::task::spawn_blocking(move || generate_leaf(&signer, &config, &target))
                        .await
                        .map_err(|e| MitmError::cert_generation(label, e.to_string()))?
                }
            })
            .await
    }

    /// Root certificate PEM exactly as persisted
    pub fn root_certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn root_certificate_der(&self) -> &CertificateDer<'static> {
        &self.signer.der
    }

    pub fn cert_path(&self) -> &Path {
        &self.config.cert_path
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Get leaf cache statistics
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }
}

struct RootMaterial {
    cert_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    signer: Signer,
}

fn generate_root(config: &CaConfig) -> Result<RootMaterial> {
    let key = generate_key_pair(config.key_algorithm).map_err(MitmError::ca_generation)?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.common_name.as_str());
    distinguished_name.push(DnType::CountryName, config.country.as_str());
    distinguished_name.push(DnType::OrganizationName, config.organization.as_str());
    distinguished_name.push(
        DnType::OrganizationalUnitName,
        config.organizational_unit.as_str(),
    );
    params.distinguished_name = distinguished_name;

    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + Duration::days(config.ca_validity_days);
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(random_serial());

    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];

    let cert = params
        .self_signed(&key)
        .map_err(|e| MitmError::ca_generation(format!("Failed to self-sign certificate: {}", e)))?;

    Ok(RootMaterial {
        cert_pem: cert.pem(),
        not_before,
        not_after,
        signer: Signer {
            der: cert.der().clone(),
            cert,
            key,
        },
    })
}

fn generate_leaf(signer: &Signer, config: &CaConfig, domain: &str) -> Result<LeafCertificate> {
    let key = generate_key_pair(config.key_algorithm)
        .map_err(|e| MitmError::cert_generation(domain, e))?;

    // SAN is a DNS name, or an IP address for IP literals
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| MitmError::cert_generation(domain, format!("Invalid SAN: {}", e)))?;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, domain);
    distinguished_name.push(DnType::CountryName, config.country.as_str());
    distinguished_name.push(DnType::OrganizationName, config.organization.as_str());
    distinguished_name.push(
        DnType::OrganizationalUnitName,
        config.leaf_organizational_unit.as_str(),
    );
    params.distinguished_name = distinguished_name;

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + Duration::days(config.leaf_validity_days);
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(random_serial());

    let cert = params
        .signed_by(&key, &signer.cert, &signer.key)
        .map_err(|e| MitmError::cert_generation(domain, format!("Failed to sign: {}", e)))?;

    Ok(LeafCertificate {
        domain: domain.to_string(),
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        cert_der: cert.der().clone(),
        key_der: PrivatePkcs8KeyDer::from(key.serialize_der()),
        ca_der: signer.der.clone(),
        not_before,
        not_after,
    })
}

fn generate_key_pair(algorithm: KeyAlgorithm) -> std::result::Result<KeyPair, String> {
    match algorithm {
        KeyAlgorithm::Rsa2048 => {
            let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
                .map_err(|e| format!("RSA key generation failed: {}", e))?;
            let pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| format!("RSA key encoding failed: {}", e))?;
            KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256)
                .map_err(|e| format!("RSA key import failed: {}", e))
        }
        KeyAlgorithm::EcdsaP256 => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| format!("ECDSA key generation failed: {}", e)),
    }
}

/// Random positive 128-bit serial
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::from_slice(&bytes)
}

fn pem_to_der(pem: &str) -> Result<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .ok_or_else(|| MitmError::ca_load("No certificate found in PEM"))?
        .map_err(|e| MitmError::ca_load(format!("Invalid certificate PEM: {}", e)))
}

/// Lowercase, strip IPv6 brackets and a trailing dot
fn normalize_domain(domain: &str) -> String {
    domain
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}
