//! Ephemeral self-signed certificate generation
//!
//! Used when the endpoint is started without any configured identity. The
//! generated identity lives only as long as the process and changes on every
//! restart, so clients have to pin it out of band or skip verification.

use crate::cert::info::CertificateInfo;
use crate::common::GenerationError;
use rand::rngs::{OsRng, SmallRng};
use rand::{Rng, RngCore, SeedableRng};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;

/// Validity period of generated certificates, in years
pub const VALIDITY_YEARS: i32 = 10;

/// Size of the random serial number, in bytes (128 bits)
const SERIAL_LEN: usize = 16;

const LABEL_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Mixed into the name seed so back-to-back calls never share a seed
static NAME_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A freshly generated self-signed identity
///
/// `dns_name` is always the certificate's first DNS subject-alt-name when the
/// default template is used, and `key_pem`/`cert_pem` hold the key pair that
/// signed `certificate`.
pub struct GeneratedCertificate {
    /// DNS name the certificate was issued for
    pub dns_name: String,
    /// Parsed form of the signed certificate
    pub certificate: CertificateInfo,
    /// PKCS#8 private key, PEM `PRIVATE KEY` block
    pub key_pem: String,
    /// Signed certificate, PEM `CERTIFICATE` block
    pub cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
}

impl GeneratedCertificate {
    /// Certificate in DER form
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Private key in DER form
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }
}

impl std::fmt::Debug for GeneratedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedCertificate")
            .field("dns_name", &self.dns_name)
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

/// Generate a self-signed P-256 certificate
///
/// `server_name` is used verbatim as the DNS name when non-empty; otherwise a
/// random two-label name is synthesized. When `template` is given its fields are
/// kept (except for the validity end, which is always reset) and its first DNS
/// subject-alt-name becomes the returned DNS name.
pub fn generate_certificate(
    server_name: &str,
    template: Option<CertificateParams>,
) -> Result<GeneratedCertificate, GenerationError> {
    let key_pair =
        KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(GenerationError::KeyPair)?;

    let mut dns_name = if server_name.is_empty() {
        random_server_name()
    } else {
        server_name.to_string()
    };

    let now = OffsetDateTime::now_utc();
    let mut params = match template {
        None => default_template(&dns_name, now)?,
        Some(template) => {
            if let Some(name) = first_dns_name(&template) {
                dns_name = name;
            }
            template
        }
    };

    // rcgen derives the signature algorithm and public key from `key_pair` at
    // signing time, so nothing the template carried for them can leak in.
    params.not_after = years_after(now, VALIDITY_YEARS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(GenerationError::Signing)?;
    let cert_der = cert.der().clone();
    let certificate = CertificateInfo::from_der(&cert_der).map_err(GenerationError::Parse)?;

    Ok(GeneratedCertificate {
        dns_name,
        certificate,
        key_pem: key_pair.serialize_pem(),
        cert_pem: cert.pem(),
        cert_der,
        key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
    })
}

fn default_template(
    dns_name: &str,
    now: OffsetDateTime,
) -> Result<CertificateParams, GenerationError> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial()?);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, dns_name);
    params.distinguished_name = distinguished_name;

    let san = dns_name
        .to_string()
        .try_into()
        .map_err(|e: rcgen::Error| GenerationError::InvalidName {
            name: dns_name.to_string(),
            reason: e.to_string(),
        })?;
    params.subject_alt_names = vec![SanType::DnsName(san)];

    params.not_before = now;
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    // Emits basicConstraints with cA=false
    params.is_ca = IsCa::ExplicitNoCa;

    Ok(params)
}

fn random_serial() -> Result<SerialNumber, GenerationError> {
    let mut bytes = [0u8; SERIAL_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| GenerationError::Serial(e.to_string()))?;
    Ok(SerialNumber::from_slice(&bytes))
}

fn first_dns_name(params: &CertificateParams) -> Option<String> {
    params.subject_alt_names.iter().find_map(|san| match san {
        SanType::DnsName(name) if !name.as_str().is_empty() => Some(name.as_str().to_string()),
        _ => None,
    })
}

fn years_after(now: OffsetDateTime, years: i32) -> OffsetDateTime {
    // Feb 29 has no counterpart in a non-leap target year
    now.replace_year(now.year() + years)
        .unwrap_or_else(|_| now + time::Duration::days(i64::from(years) * 365 + 3))
}

/// Synthesize a pseudo-random hostname such as `qdkwe.xo`
///
/// The name only has to avoid colliding with a real host; it is never a trust
/// anchor. It therefore comes from a fast generator seeded from the clock and
/// is predictable, unlike the key material and serial which use the OS source.
pub fn random_server_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    #[allow(clippy::cast_possible_truncation)]
    let seed = (nanos as u64)
        ^ NAME_SEQUENCE
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let mut rng = SmallRng::seed_from_u64(seed);

    let first_len = rng.gen_range(3..=7);
    let second_len = rng.gen_range(1..=3);
    let first = random_label(&mut rng, first_len);
    let second = random_label(&mut rng, second_len);
    format!("{first}.{second}")
}

fn random_label(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| char::from(LABEL_ALPHABET[rng.gen_range(0..LABEL_ALPHABET.len())]))
        .collect()
}
