//! PKCS#12 (A1) certificate loading and TLS client context construction.
//!
//! Only the first private key bag and the first certificate bag of the
//! container are used. Containers carrying a full chain still yield just
//! the leaf; no chain of trust is assembled here.

use crate::error::CertificateError;
use reqwest::tls::Version;
use reqwest::{ClientBuilder, Identity};
use std::fmt;
use std::path::Path;
use tracing::debug;

const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";
const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Mutual-TLS client configuration derived from a certificate container.
///
/// Peer certificate validation is always on; there is no switch to turn
/// it off.
#[derive(Clone)]
pub struct TlsContext {
    identity: Identity,
    min_version: Version,
}

impl TlsContext {
    /// Minimum protocol version negotiated with the remote service.
    pub fn min_version(&self) -> Version {
        self.min_version
    }

    /// Apply the client identity and protocol floor to an HTTP client builder.
    pub fn apply(&self, builder: ClientBuilder) -> ClientBuilder {
        builder
            .use_rustls_tls()
            .identity(self.identity.clone())
            .min_tls_version(self.min_version)
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("min_version", &self.min_version)
            .finish_non_exhaustive()
    }
}

/// Key, certificate and TLS context extracted from a PKCS#12 container.
///
/// Read-only once created; share it between transport clients with `Arc`.
#[derive(Clone)]
pub struct CertificateMaterial {
    private_key_pem: String,
    certificate_pem: String,
    tls: TlsContext,
}

impl CertificateMaterial {
    /// Decrypt a PKCS#12 container and build the TLS client context.
    ///
    /// A wrong password and a corrupt container produce the same
    /// [`CertificateError::Decrypt`] error.
    pub fn load(container: &[u8], password: &str) -> Result<Self, CertificateError> {
        if container.is_empty() || password.is_empty() {
            return Err(CertificateError::MissingInput);
        }

        let pfx = p12::PFX::parse(container)
            .map_err(|e| CertificateError::Decrypt(format!("{:?}", e)))?;

        if !pfx.verify_mac(password) {
            return Err(CertificateError::Decrypt(
                "integrity check failed".to_string(),
            ));
        }

        let key_der = pfx
            .key_bags(password)
            .map_err(|e| CertificateError::Decrypt(format!("{:?}", e)))?
            .into_iter()
            .next()
            .ok_or(CertificateError::MissingPrivateKey)?;

        let cert_der = pfx
            .cert_x509_bags(password)
            .map_err(|e| CertificateError::Decrypt(format!("{:?}", e)))?
            .into_iter()
            .next()
            .ok_or(CertificateError::MissingCertificate)?;

        let private_key_pem = pem::encode(&pem::Pem::new(PRIVATE_KEY_TAG, key_der));
        let certificate_pem = pem::encode(&pem::Pem::new(CERTIFICATE_TAG, cert_der));

        let bundle = format!("{}{}", private_key_pem, certificate_pem);
        let identity = Identity::from_pem(bundle.as_bytes())
            .map_err(|e| CertificateError::Tls(e.to_string()))?;

        debug!("Certificate material extracted from PKCS#12 container");

        Ok(Self {
            private_key_pem,
            certificate_pem,
            tls: TlsContext {
                identity,
                min_version: Version::TLS_1_2,
            },
        })
    }

    /// Read a container from disk and load it.
    pub fn from_file(path: impl AsRef<Path>, password: &str) -> Result<Self, CertificateError> {
        let container = std::fs::read(path.as_ref())?;
        Self::load(&container, password)
    }

    /// PEM-encoded PKCS#8 private key.
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// PEM-encoded leaf certificate.
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn tls(&self) -> &TlsContext {
        &self.tls
    }
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("private_key_pem", &"<redacted>")
            .field("certificate_pem", &self.certificate_pem)
            .field("tls", &self.tls)
            .finish()
    }
}
