//! NFS-e client for municipal SOAP webservices.
//!
//! Issues, queries and cancels electronic service invoices through a legacy
//! SOAP webservice authenticated with a PKCS#12 (A1) client certificate.
//!
//! # Features
//!
//! - PKCS#12 extraction into a mutual-TLS client context (TLS 1.2 minimum)
//! - Lazily connected SOAP transports with single-flight connection setup
//! - Fixed-interval retry of failed remote calls
//! - Fault detection and heuristic success/error classification of responses
//! - RPS and cancellation request documents
//!
//! # Example
//!
//! ```ignore
//! use nfse_soap_client::{CertificateMaterial, ClientConfig, InvoiceService, ResponseInterpreter};
//! use std::sync::Arc;
//!
//! let config = ClientConfig::from_file("nfse.yaml")?;
//! let material = CertificateMaterial::from_file(
//!     &config.certificate.path,
//!     &config.certificate.resolve_password()?,
//! )?;
//! let service = InvoiceService::new(&config, Arc::new(material))?;
//!
//! let envelope = service.query("1024").await?;
//! let result = ResponseInterpreter::default().normalize(Some(&envelope), Some("ConsultarNfseResponse"));
//! ```

pub mod certificate;
pub mod config;
pub mod error;
pub mod hash;
pub mod interpreter;
pub mod parser;
pub mod rps;
pub mod service;
pub mod transport;

pub use certificate::CertificateMaterial;
pub use config::ClientConfig;
pub use error::{CertificateError, SoapError};
pub use interpreter::{NormalizedResult, ResponseInterpreter};
pub use parser::SoapEnvelope;
pub use service::InvoiceService;
pub use transport::{OperationArgs, TransportClient};
