//! Certificate Authority
//!
//! Signs leaf certificates for intercepted server names. The CA is either
//! generated in memory at startup or loaded from PEM files; leaves are
//! cached per host.

use super::cert_cache::{CacheStats, CertCache};
use super::error::CaError;
use p256::pkcs8::EncodePrivateKey;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Common name of generated CAs
pub const CA_COMMON_NAME: &str = "piperelay trusted CA";

/// Validity of generated CA and leaf certificates
pub const VALIDITY_DAYS: i64 = 90;

/// Default number of cached leaf certificates
pub const DEFAULT_CACHE_SIZE: usize = 1000;

/// Host a leaf certificate is issued for
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// DNS name (e.g., example.test)
    Domain(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Identify the host from the client's server name
    ///
    /// Clients that send no server name (or an address literal) get a
    /// certificate for `fallback`, normally the listener's local address.
    pub fn from_server_name(server_name: &str, fallback: IpAddr) -> Self {
        let server_name = server_name.trim_end_matches('.');
        if server_name.is_empty() {
            return Self::IpAddress(fallback);
        }
        if let Ok(ip) = server_name.parse::<IpAddr>() {
            return Self::IpAddress(ip);
        }
        Self::Domain(server_name.to_ascii_lowercase())
    }
}

impl std::fmt::Display for HostIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(name) => f.write_str(name),
            Self::IpAddress(ip) => write!(f, "{ip}"),
        }
    }
}

/// Leaf certificate chain and its private key
pub struct IssuedCert {
    chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
}

impl IssuedCert {
    pub fn new(chain: Vec<CertificateDer<'static>>, key_der: Vec<u8>) -> Self {
        Self { chain, key_der }
    }

    /// Leaf first, then the CA
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }

    /// PKCS#8 private key of the leaf
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// Certificate Authority for TLS interception
pub struct CertificateAuthority {
    /// Issuer used to sign leaves
    ca_cert: Certificate,

    /// CA private key
    ca_key: KeyPair,

    /// CA certificate as served in chains and exported
    ca_der: CertificateDer<'static>,
    ca_pem: String,

    /// Leaf cache, absent when disabled
    cache: Option<Mutex<CertCache>>,
}

impl CertificateAuthority {
    /// Generate a fresh CA
    pub fn generate(cache_size: usize) -> Result<Self, CaError> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = distinguished_name;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(VALIDITY_DAYS);
        params.serial_number = Some(random_serial());

        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::generation(format!("Failed to generate key pair: {e}")))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| CaError::generation(format!("Failed to self-sign certificate: {e}")))?;

        info!(common_name = CA_COMMON_NAME, "generated certificate authority");

        Ok(Self {
            ca_der: ca_cert.der().clone(),
            ca_pem: ca_cert.pem(),
            ca_cert,
            ca_key,
            cache: CertCache::new(cache_size).map(Mutex::new),
        })
    }

    /// Load a CA from PEM files
    ///
    /// The key must be PKCS#8 encoded.
    pub fn load(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        cache_size: usize,
    ) -> Result<Self, CaError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        info!(cert = %cert_path.display(), key = %key_path.display(), "loading certificate authority");

        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| CaError::load(format!("Failed to read cert file: {e}")))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| CaError::load(format!("Failed to read key file: {e}")))?;

        Self::from_pem(&cert_pem, &key_pem, cache_size)
    }

    /// Build a CA from PEM text
    ///
    /// The key may be PKCS#8 or a SEC1 `EC PRIVATE KEY` on P-256, and must
    /// belong to the certificate.
    pub fn from_pem(cert_pem: &str, key_pem: &str, cache_size: usize) -> Result<Self, CaError> {
        let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| CaError::load(format!("Failed to read private key PEM: {e}")))?
            .ok_or_else(|| CaError::load("No private key found in PEM"))?;
        let ca_key = key_pair(&key_der)?;

        let ca_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::load("No certificate found in PEM"))?
            .map_err(|e| CaError::load(format!("Failed to read certificate PEM: {e}")))?;

        // Rebuild the issuer from the original subject and key identifier so
        // leaves chain to the certificate clients trust
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| CaError::load(format!("Failed to parse certificate: {e}")))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| CaError::load(format!("Failed to reconstruct certificate: {e}")))?;

        if public_key_info(&ca_der)? != public_key_info(ca_cert.der())? {
            return Err(CaError::load("Private key does not match the CA certificate"));
        }

        Ok(Self {
            ca_cert,
            ca_key,
            ca_der,
            ca_pem: cert_pem.to_string(),
            cache: CertCache::new(cache_size).map(Mutex::new),
        })
    }

    /// Get or issue a leaf certificate for `host`
    pub async fn issue(&self, host: &HostIdentifier) -> Result<Arc<IssuedCert>, CaError> {
        if let Some(cache) = &self.cache {
            if let Some(cert) = cache.lock().await.get(host) {
                debug!(host = %host, "certificate cache hit");
                return Ok(cert);
            }
        }

        debug!(host = %host, "generating certificate");
        let cert = Arc::new(self.sign_leaf(host)?);

        if let Some(cache) = &self.cache {
            cache.lock().await.insert(host.clone(), Arc::clone(&cert));
        }
        Ok(cert)
    }

    fn sign_leaf(&self, host: &HostIdentifier) -> Result<IssuedCert, CaError> {
        let mut params = CertificateParams::default();
        let mut distinguished_name = DistinguishedName::new();

        match host {
            HostIdentifier::Domain(domain) => {
                distinguished_name.push(DnType::CommonName, domain.as_str());
                let dns_name = Ia5String::try_from(domain.as_str())
                    .map_err(|e| CaError::issue(domain, e))?;
                params.subject_alt_names = vec![SanType::DnsName(dns_name)];
            }
            HostIdentifier::IpAddress(ip) => {
                distinguished_name.push(DnType::CommonName, ip.to_string());
                params.subject_alt_names = vec![SanType::IpAddress(*ip)];
            }
        }
        params.distinguished_name = distinguished_name;

        // One day in the past for clock skew
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(VALIDITY_DAYS);
        params.serial_number = Some(random_serial());

        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::issue(host.to_string(), e))?;
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(|e| CaError::issue(host.to_string(), format!("Failed to sign: {e}")))?;

        Ok(IssuedCert::new(
            vec![cert.der().clone(), self.ca_der.clone()],
            key.serialize_der(),
        ))
    }

    /// CA certificate PEM, for client installation
    pub fn cert_pem(&self) -> &str {
        &self.ca_pem
    }

    /// CA private key PEM
    pub fn key_pem(&self) -> String {
        self.ca_key.serialize_pem()
    }

    /// CA certificate DER, for trust stores
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_der
    }

    pub async fn cache_stats(&self) -> CacheStats {
        match &self.cache {
            Some(cache) => cache.lock().await.stats(),
            None => CacheStats::default(),
        }
    }
}

fn key_pair(key: &PrivateKeyDer<'_>) -> Result<KeyPair, CaError> {
    let pkcs8 = match key {
        PrivateKeyDer::Pkcs8(der) => der.secret_pkcs8_der().to_vec(),
        PrivateKeyDer::Sec1(der) => {
            let secret = p256::SecretKey::from_sec1_der(der.secret_sec1_der())
                .map_err(|e| CaError::load(format!("Failed to parse EC private key: {e}")))?;
            secret
                .to_pkcs8_der()
                .map_err(|e| CaError::load(format!("Failed to convert EC private key: {e}")))?
                .as_bytes()
                .to_vec()
        }
        _ => return Err(CaError::load("Private key must be PKCS#8 or SEC1")),
    };
    KeyPair::try_from(pkcs8.as_slice())
        .map_err(|e| CaError::load(format!("Failed to parse private key: {e}")))
}

/// DER SubjectPublicKeyInfo of a certificate
fn public_key_info(der: &CertificateDer<'_>) -> Result<Vec<u8>, CaError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| CaError::load(format!("Failed to parse certificate: {e}")))?;
    Ok(cert.public_key().raw.to_vec())
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Positive, non-zero leading byte
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::from(bytes.to_vec())
}
