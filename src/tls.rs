//! TLS contexts, development certificates, and certificate inspection.
//!
//! Security policy here is fixed and not caller-tunable: TLS 1.2 and 1.3
//! only, the ring crypto provider pinned explicitly, and only the
//! forward-secret suites rustls ships. The single escape hatch is the
//! client-side `verify_ssl = false` switch for development against
//! self-signed servers, and every use of it is logged at WARN.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use serde::Serialize;
use tracing::warn;

use crate::error::RoomcastError;

/// Validity window for auto-generated development certificates.
pub const DEV_CERT_VALID_DAYS: u32 = 365;

const TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds the server-side TLS configuration from PEM files.
///
/// A CA bundle enables client-certificate verification against it. With
/// `require_client_cert` the handshake demands a certificate; without it
/// clients may still connect anonymously and any certificate they do
/// present is verified. Requiring client certificates without a bundle
/// to verify them against is a configuration error.
///
/// # Errors
///
/// Returns [`RoomcastError::Certificate`] for unreadable or unparsable
/// PEM files, a cert/key mismatch, or `require_client_cert` without
/// `ca_file`.
pub fn server_tls_config(
    cert_file: &Path,
    key_file: &Path,
    ca_file: Option<&Path>,
    require_client_cert: bool,
) -> Result<Arc<ServerConfig>, RoomcastError> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;
    let builder =
        ServerConfig::builder_with_provider(crypto_provider()).with_protocol_versions(TLS_VERSIONS)?;

    let config = match (require_client_cert, ca_file) {
        (false, None) => builder.with_no_client_auth().with_single_cert(certs, key)?,
        (true, None) => {
            return Err(RoomcastError::Certificate(
                "client certificate verification requires a CA bundle (ca_file)".into(),
            ));
        }
        (required, Some(ca)) => {
            let verifier = client_cert_verifier(ca, required)?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
    };
    Ok(Arc::new(config))
}

/// Client-certificate verifier over a CA bundle. When `required` is off
/// the verifier allows anonymous clients through while still checking any
/// certificate that is presented.
fn client_cert_verifier(
    ca: &Path,
    required: bool,
) -> Result<Arc<dyn ClientCertVerifier>, RoomcastError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots
            .add(cert)
            .map_err(|err| RoomcastError::Certificate(format!("CA bundle: {err}")))?;
    }
    let builder = WebPkiClientVerifier::builder(Arc::new(roots));
    let builder = if required {
        builder
    } else {
        builder.allow_unauthenticated()
    };
    builder
        .build()
        .map_err(|err| RoomcastError::Certificate(format!("client verifier: {err}")))
}

/// Builds a server TLS configuration around a fresh self-signed
/// certificate. Backs the `auto_cert` option; development only.
///
/// # Errors
///
/// Returns [`RoomcastError::Certificate`] when generation or assembly
/// fails.
pub fn dev_server_config(
    common_name: &str,
    subject_alt_names: &[String],
) -> Result<Arc<ServerConfig>, RoomcastError> {
    let (cert_pem, key_pem) =
        generate_self_signed_cert(common_name, subject_alt_names, DEV_CERT_VALID_DAYS)?;
    let certs = parse_certs(cert_pem.as_bytes(), "generated certificate")?;
    let key = parse_private_key(key_pem.as_bytes(), "generated key")?;
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(TLS_VERSIONS)?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Builds the client-side TLS configuration.
///
/// Verification uses the webpki root bundle plus any certificates from
/// `ca_file`. `verify_ssl = false` disables certificate chain validation
/// entirely (signature checks on the handshake itself remain).
///
/// # Errors
///
/// Returns [`RoomcastError::Certificate`] for an unreadable or unparsable
/// CA bundle.
pub fn client_tls_config(
    verify_ssl: bool,
    ca_file: Option<&Path>,
) -> Result<Arc<ClientConfig>, RoomcastError> {
    let builder =
        ClientConfig::builder_with_provider(crypto_provider()).with_protocol_versions(TLS_VERSIONS)?;

    if !verify_ssl {
        warn!("TLS certificate verification is DISABLED; development use only");
        let config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    if let Some(ca) = ca_file {
        for cert in load_certs(ca)? {
            roots
                .add(cert)
                .map_err(|err| RoomcastError::Certificate(format!("CA bundle: {err}")))?;
        }
    }
    let config = builder.with_root_certificates(roots).with_no_client_auth();
    Ok(Arc::new(config))
}

/// Generates a self-signed certificate and private key as PEM strings.
///
/// The common name is always included as a subject alternative name;
/// entries that parse as IP addresses become IP SANs. Keys are ECDSA
/// P-256.
///
/// # Errors
///
/// Returns [`RoomcastError::Certificate`] when key generation or signing
/// fails.
pub fn generate_self_signed_cert(
    common_name: &str,
    subject_alt_names: &[String],
    valid_days: u32,
) -> Result<(String, String), RoomcastError> {
    let mut sans = subject_alt_names.to_vec();
    if !sans.iter().any(|san| san == common_name) {
        sans.insert(0, common_name.to_owned());
    }

    let mut params = rcgen::CertificateParams::new(sans)
        .map_err(|err| RoomcastError::Certificate(format!("certificate params: {err}")))?;
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    dn.push(rcgen::DnType::OrganizationName, "Development");
    params.distinguished_name = dn;

    let now = Utc::now();
    let until = now + chrono::Duration::days(i64::from(valid_days));
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    params.not_after = rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|err| RoomcastError::Certificate(format!("key generation: {err}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|err| RoomcastError::Certificate(format!("self-signing: {err}")))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Inspection result for a certificate file. Never an `Err`: failures are
/// reported through the `error` field so operational tooling always gets a
/// full row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateReport {
    /// Certificate parsed and is not expired.
    pub valid: bool,
    /// `not_after` is in the past.
    pub expired: bool,
    /// Valid but within `min_days_remaining` of expiry.
    pub expiring_soon: bool,
    /// Subject distinguished name.
    pub subject: Option<String>,
    /// Issuer distinguished name.
    pub issuer: Option<String>,
    /// Validity window start.
    pub not_before: Option<DateTime<Utc>>,
    /// Validity window end.
    pub not_after: Option<DateTime<Utc>>,
    /// Whole days until expiry (negative if expired).
    pub days_remaining: Option<i64>,
    /// Read or parse failure, when inspection could not complete.
    pub error: Option<String>,
}

impl CertificateReport {
    fn failed(error: String) -> Self {
        Self {
            valid: false,
            expired: false,
            expiring_soon: false,
            subject: None,
            issuer: None,
            not_before: None,
            not_after: None,
            days_remaining: None,
            error: Some(error),
        }
    }
}

/// Inspects a PEM certificate file and reports its validity window.
#[must_use]
pub fn validate_certificate(cert_file: &Path, min_days_remaining: i64) -> CertificateReport {
    match inspect_certificate(cert_file, min_days_remaining) {
        Ok(report) => report,
        Err(err) => CertificateReport::failed(err.to_string()),
    }
}

fn inspect_certificate(
    cert_file: &Path,
    min_days_remaining: i64,
) -> Result<CertificateReport, RoomcastError> {
    let data = std::fs::read(cert_file).map_err(|err| {
        RoomcastError::Certificate(format!("read {}: {err}", cert_file.display()))
    })?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&data)
        .map_err(|err| RoomcastError::Certificate(format!("PEM parse: {err}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|err| RoomcastError::Certificate(format!("X.509 parse: {err}")))?;

    let not_before_ts = cert.validity().not_before.timestamp();
    let not_after_ts = cert.validity().not_after.timestamp();
    let now = Utc::now().timestamp();
    let expired = not_after_ts <= now;
    let days_remaining = (not_after_ts - now) / 86_400;

    Ok(CertificateReport {
        valid: !expired,
        expired,
        expiring_soon: !expired && days_remaining < min_days_remaining,
        subject: Some(cert.subject().to_string()),
        issuer: Some(cert.issuer().to_string()),
        not_before: DateTime::from_timestamp(not_before_ts, 0),
        not_after: DateTime::from_timestamp(not_after_ts, 0),
        days_remaining: Some(days_remaining),
        error: None,
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, RoomcastError> {
    let data = std::fs::read(path)
        .map_err(|err| RoomcastError::Certificate(format!("read {}: {err}", path.display())))?;
    parse_certs(&data, &path.display().to_string())
}

fn parse_certs(pem: &[u8], origin: &str) -> Result<Vec<CertificateDer<'static>>, RoomcastError> {
    let mut reader = pem;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|err| RoomcastError::Certificate(format!("parse {origin}: {err}")))?;
    if certs.is_empty() {
        return Err(RoomcastError::Certificate(format!(
            "no certificates in {origin}"
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, RoomcastError> {
    let data = std::fs::read(path)
        .map_err(|err| RoomcastError::Certificate(format!("read {}: {err}", path.display())))?;
    parse_private_key(&data, &path.display().to_string())
}

fn parse_private_key(pem: &[u8], origin: &str) -> Result<PrivateKeyDer<'static>, RoomcastError> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| RoomcastError::Certificate(format!("parse {origin}: {err}")))?
        .ok_or_else(|| RoomcastError::Certificate(format!("no private key in {origin}")))
}

/// Chain validation disabled; handshake signature checks stay real.
#[derive(Debug)]
struct NoVerification {
    supported: WebPkiSupportedAlgorithms,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            supported: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}
