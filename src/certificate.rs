//! Self-signed TLS identity for the proxy listener
//!
//! Every start generates a fresh RSA-2048 key and a certificate for
//! `CN=localhost` whose Subject Alternative Names cover `localhost`, the
//! loopback address, the Android emulator host alias and every LAN address
//! the proxy can be reached on.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use rustls::crypto::ring as ring_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Validity period of a generated certificate
pub const VALIDITY_DAYS: i64 = 365;

/// How far `not_before` is moved into the past to tolerate clock skew
pub const BACKDATE_DAYS: i64 = 1;

/// Address the Android emulator uses to reach the host machine
pub const EMULATOR_HOST_ALIAS: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

const COMMON_NAME: &str = "localhost";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("key pair generation failed")]
    KeyGeneration(#[source] rcgen::Error),

    #[error("certificate construction failed")]
    Build(#[source] rcgen::Error),

    #[error("failed to read certificate bundle")]
    Bundle(#[source] std::io::Error),

    #[error("certificate bundle is missing its {0}")]
    IncompleteBundle(&'static str),

    #[error("TLS configuration rejected the certificate")]
    Tls(#[from] rustls::Error),
}

/// An identity the certificate is valid for
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
}

impl fmt::Display for SubjectAltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns(name) => write!(f, "DNS:{}", name),
            Self::Ip(ip) => write!(f, "IP:{}", ip),
        }
    }
}

/// In-memory key pair and self-signed certificate
pub struct TlsIdentity {
    certificate: CertificateDer<'static>,
    pem_bundle: String,
    subject_alt_names: Vec<SubjectAltName>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl TlsIdentity {
    /// Generate a new key pair and certificate.
    ///
    /// Entries of `ip_addresses` that are not IPv4 literals are skipped.
    pub fn generate<S: AsRef<str>>(ip_addresses: &[S]) -> Result<Self, CertificateError> {
        let subject_alt_names = subject_alt_names(ip_addresses);

        let key_pair =
            KeyPair::generate_for(&PKCS_RSA_SHA256).map_err(CertificateError::KeyGeneration)?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, COMMON_NAME);
        params.distinguished_name = dn;

        params.subject_alt_names = subject_alt_names
            .iter()
            .map(|san| match san {
                SubjectAltName::Dns(name) => name
                    .as_str()
                    .try_into()
                    .map(SanType::DnsName)
                    .map_err(CertificateError::Build),
                SubjectAltName::Ip(ip) => Ok(SanType::IpAddress(*ip)),
            })
            .collect::<Result<_, _>>()?;

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(BACKDATE_DAYS);
        params.not_after = now + Duration::days(VALIDITY_DAYS);

        let not_before = params.not_before;
        let not_after = params.not_after;

        let cert = params
            .self_signed(&key_pair)
            .map_err(CertificateError::Build)?;

        let pem_bundle = format!("{}{}", key_pair.serialize_pem(), cert.pem());

        info!(
            "Generated self-signed certificate for {}",
            subject_alt_names
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            certificate: cert.der().clone(),
            pem_bundle,
            subject_alt_names,
            not_before,
            not_after,
        })
    }

    /// DER encoding of the certificate
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    /// Private key followed by certificate, PEM encoded
    pub fn pem_bundle(&self) -> &str {
        &self.pem_bundle
    }

    pub fn subject_alt_names(&self) -> &[SubjectAltName] {
        &self.subject_alt_names
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Build a rustls server configuration by re-importing the PEM bundle
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, CertificateError> {
        let (chain, key) = parse_pem_bundle(&self.pem_bundle)?;

        let provider = Arc::new(ring_provider::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("subject_alt_names", &self.subject_alt_names)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Fixed names first, then each distinct IPv4 literal from the input
fn subject_alt_names<S: AsRef<str>>(ip_addresses: &[S]) -> Vec<SubjectAltName> {
    let mut names = vec![
        SubjectAltName::Dns(COMMON_NAME.to_string()),
        SubjectAltName::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SubjectAltName::Ip(IpAddr::V4(EMULATOR_HOST_ALIAS)),
    ];
    let mut seen: BTreeSet<SubjectAltName> = names.iter().cloned().collect();

    for raw in ip_addresses {
        let raw = raw.as_ref().trim();
        match raw.parse::<Ipv4Addr>() {
            Ok(ip) => {
                let san = SubjectAltName::Ip(IpAddr::V4(ip));
                if seen.insert(san.clone()) {
                    names.push(san);
                }
            }
            Err(_) => debug!("Skipping invalid IPv4 address for certificate: {:?}", raw),
        }
    }

    names
}

fn parse_pem_bundle(
    pem: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CertificateError> {
    let chain = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(CertificateError::Bundle)?;
    if chain.is_empty() {
        return Err(CertificateError::IncompleteBundle("certificate"));
    }

    let key = rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(CertificateError::Bundle)?
        .ok_or(CertificateError::IncompleteBundle("private key"))?;

    Ok((chain, key))
}
