//! Structured view of a DER certificate

use ::time::OffsetDateTime;
use x509_parser::prelude::*;

/// Fields of an X.509 certificate the endpoint cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name, if present
    pub subject_common_name: Option<String>,
    /// Issuer common name, if present
    pub issuer_common_name: Option<String>,
    /// DNS subject-alt-names in certificate order
    pub dns_names: Vec<String>,
    /// Serial number as colon separated hex
    pub serial: String,
    /// Start of validity, unix seconds
    pub not_before: i64,
    /// End of validity, unix seconds
    pub not_after: i64,
    /// Subject equals issuer and the signature verifies with the certificate's own key
    pub self_signed: bool,
    /// Extended key usage includes server authentication
    pub server_auth: bool,
}

impl CertificateInfo {
    /// Parse a DER encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| e.to_string())?;

        let dns_names = cert
            .subject_alternative_name()
            .map_err(|e| e.to_string())?
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some((*dns).to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let server_auth = cert
            .extended_key_usage()
            .map_err(|e| e.to_string())?
            .is_some_and(|ext| ext.value.server_auth);

        let self_signed = cert.subject() == cert.issuer() && cert.verify_signature(None).is_ok();

        Ok(Self {
            subject_common_name: common_name(cert.subject()),
            issuer_common_name: common_name(cert.issuer()),
            dns_names,
            serial: cert.raw_serial_as_string(),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            self_signed,
            server_auth,
        })
    }

    /// Whether the current time falls inside the validity window
    pub fn is_valid_now(&self) -> bool {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.not_before <= now && now <= self.not_after
    }

    /// First DNS subject-alt-name, if any
    pub fn primary_dns_name(&self) -> Option<&str> {
        self.dns_names.first().map(String::as_str)
    }
}

fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_garbage() {
        assert!(CertificateInfo::from_der(b"not a certificate").is_err());
    }
}
