//! Configuration types for the NFS-e client.

use crate::error::SoapError;
use crate::transport::TransportOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Main configuration for the NFS-e client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Webservice environment to talk to
    pub environment: Environment,

    /// Base URLs per environment
    pub endpoints: EndpointsConfig,

    /// PKCS#12 certificate used for mutual TLS
    pub certificate: CertificateConfig,

    /// Taxpayer identity and webservice credentials
    pub taxpayer: TaxpayerConfig,

    /// Timeouts, retries and User-Agent
    pub transport: TransportOptions,
}

impl ClientConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, SoapError> {
        serde_yaml::from_str(yaml).map_err(|e| SoapError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SoapError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Base URL of the selected environment.
    pub fn base_url(&self) -> &str {
        self.endpoints.base_url(self.environment)
    }
}

/// Webservice environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    /// Homologation environment; invoices issued here have no fiscal value
    #[default]
    Staging,
}

/// Base URLs of the services, one per environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub production: String,
    pub staging: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            production: "https://nfse.prefeitura.gov.br/ws".to_string(),
            staging: "https://homologacao.nfse.prefeitura.gov.br/ws".to_string(),
        }
    }
}

impl EndpointsConfig {
    pub fn base_url(&self, environment: Environment) -> &str {
        let url = match environment {
            Environment::Production => &self.production,
            Environment::Staging => &self.staging,
        };
        url.trim_end_matches('/')
    }
}

/// Certificate file settings.
///
/// The password may be given inline or through an environment variable;
/// the inline value wins when both are set.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// Path to the `.pfx`/`.p12` container
    pub path: PathBuf,
    pub password: Option<String>,
    pub password_env: Option<String>,
}

impl CertificateConfig {
    pub fn resolve_password(&self) -> Result<String, SoapError> {
        resolve_secret("certificate password", &self.password, &self.password_env)
    }
}

impl fmt::Debug for CertificateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateConfig")
            .field("path", &self.path)
            .field("password", &redacted(&self.password))
            .field("password_env", &self.password_env)
            .finish()
    }
}

/// Taxpayer (service provider) settings.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxpayerConfig {
    /// Provider CNPJ
    pub cnpj: String,

    /// CPF of the webservice user
    pub user_cpf: String,

    /// Webservice user password (inline)
    pub password: Option<String>,

    /// Environment variable holding the webservice user password
    pub password_env: Option<String>,

    /// IBGE municipality code
    pub municipality_code: String,

    /// Municipal registration; looked up remotely when absent
    pub municipal_registration: Option<String>,
}

impl TaxpayerConfig {
    pub fn resolve_password(&self) -> Result<String, SoapError> {
        resolve_secret("taxpayer password", &self.password, &self.password_env)
    }
}

impl fmt::Debug for TaxpayerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaxpayerConfig")
            .field("cnpj", &self.cnpj)
            .field("user_cpf", &self.user_cpf)
            .field("password", &redacted(&self.password))
            .field("password_env", &self.password_env)
            .field("municipality_code", &self.municipality_code)
            .field("municipal_registration", &self.municipal_registration)
            .finish()
    }
}

fn redacted(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

fn resolve_secret(
    what: &str,
    inline: &Option<String>,
    env_var: &Option<String>,
) -> Result<String, SoapError> {
    if let Some(value) = inline.as_ref().filter(|v| !v.is_empty()) {
        return Ok(value.clone());
    }

    match env_var {
        Some(name) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                SoapError::Config(format!("{} variable {} is not set", what, name))
            }),
        None => Err(SoapError::Config(format!("{} is not configured", what))),
    }
}
