//! Error types for the NFS-e SOAP client.

use thiserror::Error;

/// Failures while turning a PKCS#12 container into TLS client material.
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("certificate container and password are required")]
    MissingInput,

    /// Wrong password and corrupt data are reported the same way.
    #[error("failed to decrypt or parse PKCS#12 container: {0}")]
    Decrypt(String),

    #[error("PKCS#12 container has no private key bag")]
    MissingPrivateKey,

    #[error("PKCS#12 container has no certificate bag")]
    MissingCertificate,

    #[error("TLS client context rejected certificate material: {0}")]
    Tls(String),

    #[error("failed to read certificate file: {0}")]
    Io(#[from] std::io::Error),
}

/// NFS-e client errors.
#[derive(Error, Debug)]
pub enum SoapError {
    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Unknown or empty remote operation name. Never retried.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Every attempt failed; carries the last underlying failure.
    #[error("remote call '{operation}' failed: {message}")]
    RemoteCall { operation: String, message: String },

    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote call timed out after {0} ms")]
    Timeout(u64),

    #[error("invalid request data: {0}")]
    Validation(String),

    #[error("could not resolve municipal registration: {0}")]
    Registration(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SoapError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SoapError::Transport(format!("request timed out: {err}"))
        } else {
            SoapError::Transport(err.to_string())
        }
    }
}
