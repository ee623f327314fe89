//! On-the-fly certificate issuance for intercepted CONNECT targets.
//!
//! Leaves are minted per target fingerprint, signed by an in-memory root
//! which is generated lazily on first use unless one is supplied. Issued
//! leaves are cached and concurrent lookups for the same fingerprint
//! coalesce into a single issuance.

use std::net::IpAddr;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::aws_lc_rs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

const ROOT_VALIDITY_DAYS: i64 = 365 * 2;
const LEAF_VALIDITY_DAYS: i64 = 365 * 10;

/// Fingerprint of a target host, used both as cache key and as issuance
/// input.
///
/// An IP literal keeps its canonical textual form. A registrable domain
/// collapses to its registrable part (so `www.example.com` and
/// `api.example.com` share one certificate covering `example.com` and its
/// subdomains). Hosts without a registrable part, such as `localhost`,
/// are used as-is with no subject alternative names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertKey {
    pub cn: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl CertKey {
    pub fn for_host(host: &str) -> Self {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Self {
                cn: ip.to_string(),
                dns_names: Vec::new(),
                ip_addresses: vec![ip],
            };
        }
        match psl::domain_str(host) {
            Some(domain) => Self {
                cn: domain.to_string(),
                dns_names: vec![domain.to_string(), format!(".{domain}")],
                ip_addresses: Vec::new(),
            },
            None => Self {
                cn: host.to_string(),
                dns_names: Vec::new(),
                ip_addresses: Vec::new(),
            },
        }
    }
}

/// A freshly issued leaf, ready to terminate TLS, plus the subject data it
/// was minted from so callers can inspect it without re-parsing X.509.
pub struct IssuedCert {
    pub server_config: Arc<ServerConfig>,
    pub cert_der: CertificateDer<'static>,
    pub cn: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

struct CaRoot {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl CaRoot {
    fn generate() -> Result<Self, rcgen::Error> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "mproxy root");
        dn.push(DnType::OrganizationName, "mproxy");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = params.not_before + Duration::days(ROOT_VALIDITY_DAYS);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign];

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }
}

/// Certificate issuer backed by a self-signed in-memory root.
pub struct SelfSignedIssuer {
    root: tokio::sync::OnceCell<Arc<CaRoot>>,
}

impl Default for SelfSignedIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl SelfSignedIssuer {
    /// Issuer with a lazily generated root. The root is created on the
    /// first issuance and reused for the lifetime of the issuer.
    pub fn new() -> Self {
        Self {
            root: tokio::sync::OnceCell::new(),
        }
    }

    /// Issuer signing with a caller-supplied root. The certificate's
    /// primary usage must permit certificate signing.
    pub fn with_root(cert: rcgen::Certificate, key: KeyPair) -> Self {
        Self {
            root: tokio::sync::OnceCell::new_with(Some(Arc::new(CaRoot { cert, key }))),
        }
    }

    async fn root(&self) -> crate::Result<&Arc<CaRoot>> {
        self.root
            .get_or_try_init(|| async {
                let root = tokio::task::spawn_blocking(CaRoot::generate).await??;
                tracing::debug!("generated in-memory root certificate");
                Ok(Arc::new(root))
            })
            .await
    }

    /// Mint a leaf for the given fingerprint. Key generation and signing
    /// run on the blocking pool.
    pub async fn issue(&self, key: &CertKey) -> crate::Result<IssuedCert> {
        let root = self.root().await?.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || issue_leaf(&root, &key)).await?
    }
}

fn issue_leaf(root: &CaRoot, key: &CertKey) -> crate::Result<IssuedCert> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, key.cn.as_str());
    dn.push(DnType::OrganizationName, "mproxy");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(LEAF_VALIDITY_DAYS);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    for name in &key.dns_names {
        params
            .subject_alt_names
            .push(SanType::DnsName(name.as_str().try_into()?));
    }
    for ip in &key.ip_addresses {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }

    let leaf_key = KeyPair::generate()?;
    let cert = params.signed_by(&leaf_key, &root.cert, &root.key)?;
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(leaf_key.serialized_der().to_vec().into());

    let provider = Arc::new(aws_lc_rs::default_provider());
    let server_config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)?;

    Ok(IssuedCert {
        server_config: Arc::new(server_config),
        cert_der,
        cn: key.cn.clone(),
        dns_names: key.dns_names.clone(),
        ip_addresses: key.ip_addresses.clone(),
    })
}

#[derive(Default)]
struct CertEntry {
    leaf: tokio::sync::OnceCell<Arc<IssuedCert>>,
}

/// Bounded cache of issued leaves keyed by fingerprint.
///
/// Lookup is two-level: the cache itself hands out the entry for a key in
/// O(1), and the entry serializes materialization so that concurrent
/// lookups for one fingerprint perform exactly one issuance while
/// distinct fingerprints issue in parallel.
#[derive(Clone)]
pub struct CertCache {
    entries: moka::sync::Cache<String, Arc<CertEntry>>,
    issuer: Arc<SelfSignedIssuer>,
}

impl CertCache {
    /// A `capacity` of zero means unbounded.
    pub fn new(issuer: Arc<SelfSignedIssuer>, capacity: u64) -> Self {
        let capacity = if capacity == 0 { u64::MAX } else { capacity };
        Self {
            entries: moka::sync::Cache::builder().max_capacity(capacity).build(),
            issuer,
        }
    }

    /// Return the cached leaf for `host`, issuing it first if needed.
    pub async fn leaf_for(&self, host: &str) -> crate::Result<Arc<IssuedCert>> {
        let key = CertKey::for_host(host);
        let entry = self
            .entries
            .get_with(key.cn.clone(), || Arc::new(CertEntry::default()));
        let leaf = entry
            .leaf
            .get_or_try_init(|| async { self.issuer.issue(&key).await.map(Arc::new) })
            .await?;
        Ok(leaf.clone())
    }
}
