//! SOAP transport client with a cached connection and bounded retry.
//!
//! A [`TransportClient`] is bound to one service description. The first
//! call fetches that description through the mutual-TLS HTTP client and
//! keeps the resulting connection for the lifetime of the client.
//! Concurrent first callers share a single in-flight connection attempt.
//!
//! Every failed attempt is retried after a fixed interval, whatever the
//! failure was. Deterministic failures (a rejected argument, say) are
//! therefore repeated until the attempt budget runs out.

use crate::certificate::CertificateMaterial;
use crate::error::SoapError;
use crate::interpreter::fault_message;
use crate::parser::{build_request_envelope, parse_envelope, parse_service_description};
use crate::parser::{ServiceDescription, SoapEnvelope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Ordered flat key/value arguments of a remote operation.
///
/// Order is preserved because document/literal services validate the
/// element sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationArgs(Vec<(String, String)>);

impl OperationArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Per-attempt timeout in milliseconds
    pub timeout_ms: u64,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Fixed wait between attempts in milliseconds
    pub retry_interval_ms: u64,

    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            max_retries: 2,
            retry_interval_ms: 1_000,
            user_agent: format!("nfse-soap-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransportOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.saturating_add(1),
            interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

/// Fixed-interval retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Wait between consecutive attempts
    pub interval: Duration,
}

/// Location of one remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Service name used in logs and errors
    pub service: String,
    /// URL requests are posted to
    pub location: String,
    /// URL of the service description
    pub wsdl_url: String,
}

impl EndpointDescriptor {
    /// Describe a service whose WSDL lives at `{location}?WSDL`.
    pub fn new(service: impl Into<String>, location: impl Into<String>) -> Self {
        let location = location.into();
        Self {
            service: service.into(),
            wsdl_url: format!("{}?WSDL", location),
            location,
        }
    }
}

/// Establishes connections to a SOAP service.
#[async_trait]
pub trait SoapConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Arc<dyn SoapConnection>, SoapError>;
}

/// An established connection able to run remote operations.
#[async_trait]
pub trait SoapConnection: Send + Sync {
    /// Whether the connected service exposes `operation`.
    fn has_operation(&self, operation: &str) -> bool;

    /// Run `operation` and return the raw response document.
    async fn call(&self, operation: &str, args: &OperationArgs) -> Result<String, SoapError>;
}

/// Connector speaking SOAP 1.1 over HTTPS with a client certificate.
pub struct HttpConnector {
    material: Arc<CertificateMaterial>,
    options: TransportOptions,
}

impl HttpConnector {
    pub fn new(material: Arc<CertificateMaterial>, options: TransportOptions) -> Self {
        Self { material, options }
    }

    fn build_client(&self) -> Result<reqwest::Client, SoapError> {
        self.material
            .tls()
            .apply(reqwest::Client::builder())
            .timeout(self.options.timeout())
            .user_agent(self.options.user_agent.clone())
            .build()
            .map_err(|e| SoapError::Transport(format!("failed to build HTTP client: {}", e)))
    }
}

#[async_trait]
impl SoapConnector for HttpConnector {
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Arc<dyn SoapConnection>, SoapError> {
        let client = self.build_client()?;

        debug!(service = %endpoint.service, wsdl = %endpoint.wsdl_url, "Fetching service description");

        let response = client.get(&endpoint.wsdl_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SoapError::Transport(format!(
                "service description request returned HTTP {}",
                status.as_u16()
            )));
        }
        let description = parse_service_description(&response.text().await?)?;

        info!(
            service = %endpoint.service,
            location = %endpoint.location,
            operations = description.operations.len(),
            "Connected to SOAP service"
        );

        // Requests always go to the configured location, whatever address
        // the description advertises.
        Ok(Arc::new(HttpSoapConnection {
            client,
            location: endpoint.location.clone(),
            description,
        }))
    }
}

struct HttpSoapConnection {
    client: reqwest::Client,
    location: String,
    description: ServiceDescription,
}

#[async_trait]
impl SoapConnection for HttpSoapConnection {
    fn has_operation(&self, operation: &str) -> bool {
        self.description.has_operation(operation)
    }

    async fn call(&self, operation: &str, args: &OperationArgs) -> Result<String, SoapError> {
        let envelope =
            build_request_envelope(&self.description.target_namespace, operation, args);

        let response = self
            .client
            .post(&self.location)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{}\"", self.description.soap_action(operation)))
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            return Ok(text);
        }

        let reason = parse_envelope(&text)
            .ok()
            .and_then(|envelope| fault_message(&envelope))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
        Err(SoapError::Transport(format!("HTTP {}: {}", status.as_u16(), reason)))
    }
}

/// Lazily connected SOAP client for a single service.
pub struct TransportClient {
    endpoint: EndpointDescriptor,
    retry: RetryPolicy,
    timeout: Duration,
    connector: Arc<dyn SoapConnector>,
    connection: OnceCell<Arc<dyn SoapConnection>>,
}

impl TransportClient {
    /// Create a client that connects over HTTPS with the given certificate.
    pub fn new(
        endpoint: EndpointDescriptor,
        material: Arc<CertificateMaterial>,
        options: TransportOptions,
    ) -> Self {
        let connector = Arc::new(HttpConnector::new(material, options.clone()));
        Self::with_connector(endpoint, options, connector)
    }

    /// Create a client on top of any connector.
    pub fn with_connector(
        endpoint: EndpointDescriptor,
        options: TransportOptions,
        connector: Arc<dyn SoapConnector>,
    ) -> Self {
        Self {
            endpoint,
            retry: options.retry_policy(),
            timeout: options.timeout(),
            connector,
            connection: OnceCell::new(),
        }
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Whether a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    /// Invoke a remote operation, retrying failed attempts.
    ///
    /// Returns the parsed response envelope. Faults inside a successful
    /// response are left for the caller to interpret.
    pub async fn invoke(
        &self,
        operation: &str,
        args: &OperationArgs,
    ) -> Result<SoapEnvelope, SoapError> {
        if operation.trim().is_empty() {
            return Err(SoapError::InvalidOperation(
                "operation name is required".to_string(),
            ));
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(operation, args).await {
                Ok(envelope) => {
                    debug!(
                        service = %self.endpoint.service,
                        operation = %operation,
                        attempt = attempt,
                        "SOAP call succeeded"
                    );
                    return Ok(envelope);
                }
                Err(err @ SoapError::InvalidOperation(_)) => return Err(err),
                Err(err) => {
                    warn!(
                        service = %self.endpoint.service,
                        operation = %operation,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %err,
                        "SOAP call failed"
                    );
                    last_error = err.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.interval).await;
                    }
                }
            }
        }

        Err(SoapError::RemoteCall {
            operation: operation.to_string(),
            message: last_error,
        })
    }

    /// One attempt, connection setup included, bounded by the timeout.
    async fn attempt(
        &self,
        operation: &str,
        args: &OperationArgs,
    ) -> Result<SoapEnvelope, SoapError> {
        tokio::time::timeout(self.timeout, self.connect_and_call(operation, args))
            .await
            .map_err(|_| SoapError::Timeout(self.timeout.as_millis() as u64))?
    }

    async fn connect_and_call(
        &self,
        operation: &str,
        args: &OperationArgs,
    ) -> Result<SoapEnvelope, SoapError> {
        let connection = self.connection().await?;

        if !connection.has_operation(operation) {
            return Err(SoapError::InvalidOperation(format!(
                "service '{}' does not expose operation '{}'",
                self.endpoint.service, operation
            )));
        }

        let xml = connection.call(operation, args).await?;
        parse_envelope(&xml)
    }

    /// Shared connection, created at most once.
    async fn connection(&self) -> Result<Arc<dyn SoapConnection>, SoapError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                debug!(service = %self.endpoint.service, "Establishing SOAP connection");
                self.connector.connect(&self.endpoint).await
            })
            .await?;
        Ok(Arc::clone(connection))
    }
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("endpoint", &self.endpoint)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("connected", &self.is_connected())
            .finish()
    }
}
