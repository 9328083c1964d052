//! Invoice service facade.
//!
//! Ties the three webservice groups together: the entry service receives
//! RPS batches and cancellations, the output service answers queries and
//! the utility service resolves the provider's municipal registration.

use crate::certificate::CertificateMaterial;
use crate::config::{ClientConfig, TaxpayerConfig};
use crate::error::SoapError;
use crate::hash::password_hash;
use crate::interpreter::fault_message;
use crate::parser::SoapEnvelope;
use crate::rps::{build_cancel_xml, build_rps_batch_xml, CancellationRequest, Invoice, ProviderIdentity};
use crate::transport::{EndpointDescriptor, OperationArgs, TransportClient};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Field names that may carry the municipal registration, tried in order.
const REGISTRATION_FIELDS: &[&str] = &["InscricaoMunicipal", "inscricaoMunicipal", "inscricao"];

/// Webservice groups, each published as its own service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceGroup {
    Entry,
    Output,
    Utility,
}

impl ServiceGroup {
    pub fn service_name(&self) -> &'static str {
        match self {
            ServiceGroup::Entry => "WSEntrada",
            ServiceGroup::Output => "WSSaida",
            ServiceGroup::Utility => "WSUtil",
        }
    }

    /// Endpoint of this group under `base_url`.
    pub fn endpoint(&self, base_url: &str) -> EndpointDescriptor {
        let name = self.service_name();
        EndpointDescriptor::new(
            name,
            format!("{}/{}.asmx", base_url.trim_end_matches('/'), name),
        )
    }
}

/// Remote operations used by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceOperation {
    EnviarLoteRps,
    CancelarNfse,
    ConsultarNfse,
    ConsultarLoteRps,
    ConsultarInscricaoMunicipal,
}

impl ServiceOperation {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceOperation::EnviarLoteRps => "EnviarLoteRps",
            ServiceOperation::CancelarNfse => "CancelarNfse",
            ServiceOperation::ConsultarNfse => "ConsultarNfse",
            ServiceOperation::ConsultarLoteRps => "ConsultarLoteRps",
            ServiceOperation::ConsultarInscricaoMunicipal => "ConsultarInscricaoMunicipal",
        }
    }

    pub fn group(&self) -> ServiceGroup {
        match self {
            ServiceOperation::EnviarLoteRps | ServiceOperation::CancelarNfse => ServiceGroup::Entry,
            ServiceOperation::ConsultarNfse | ServiceOperation::ConsultarLoteRps => {
                ServiceGroup::Output
            }
            ServiceOperation::ConsultarInscricaoMunicipal => ServiceGroup::Utility,
        }
    }

    /// Body element wrapping the operation's response.
    pub fn response_key(&self) -> String {
        format!("{}Response", self.name())
    }

    /// Element inside the response wrapper carrying the result fields.
    pub fn result_key(&self) -> String {
        format!("{}Result", self.name())
    }

    /// Path of the result node, as accepted by
    /// [`ResponseInterpreter::normalize`](crate::interpreter::ResponseInterpreter::normalize).
    pub fn result_path(&self) -> String {
        format!("{}/{}", self.response_key(), self.result_key())
    }
}

/// Resolved webservice credentials.
#[derive(Clone)]
pub struct Credentials {
    pub cnpj: String,
    pub user_cpf: String,
    /// Already hashed; the plain password is not kept
    pub password_hash: String,
    pub municipality_code: String,
    pub municipal_registration: Option<String>,
}

impl Credentials {
    pub fn from_config(config: &TaxpayerConfig) -> Result<Self, SoapError> {
        if config.cnpj.trim().is_empty() {
            return Err(SoapError::Config("taxpayer CNPJ is not configured".to_string()));
        }
        if config.user_cpf.trim().is_empty() {
            return Err(SoapError::Config("webservice user CPF is not configured".to_string()));
        }

        Ok(Self {
            cnpj: config.cnpj.trim().to_string(),
            user_cpf: config.user_cpf.trim().to_string(),
            password_hash: password_hash(&config.resolve_password()?),
            municipality_code: config.municipality_code.trim().to_string(),
            municipal_registration: config
                .municipal_registration
                .as_ref()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("cnpj", &self.cnpj)
            .field("user_cpf", &self.user_cpf)
            .field("password_hash", &"<redacted>")
            .field("municipality_code", &self.municipality_code)
            .field("municipal_registration", &self.municipal_registration)
            .finish()
    }
}

/// Issues, queries and cancels NFS-e.
///
/// The municipal registration is resolved on first need and kept for the
/// lifetime of the service.
#[derive(Debug)]
pub struct InvoiceService {
    credentials: Credentials,
    entry: TransportClient,
    output: TransportClient,
    utility: TransportClient,
    registration: OnceCell<String>,
}

impl InvoiceService {
    /// Build the service with one HTTPS transport per group, all sharing
    /// the same certificate material.
    pub fn new(config: &ClientConfig, material: Arc<CertificateMaterial>) -> Result<Self, SoapError> {
        let credentials = Credentials::from_config(&config.taxpayer)?;
        let base_url = config.base_url();
        let client = |group: ServiceGroup| {
            TransportClient::new(
                group.endpoint(base_url),
                Arc::clone(&material),
                config.transport.clone(),
            )
        };

        info!(
            environment = ?config.environment,
            base_url = %base_url,
            "NFS-e service configured"
        );

        Ok(Self::from_clients(
            credentials,
            client(ServiceGroup::Entry),
            client(ServiceGroup::Output),
            client(ServiceGroup::Utility),
        ))
    }

    /// Build the service from existing transport clients.
    pub fn from_clients(
        credentials: Credentials,
        entry: TransportClient,
        output: TransportClient,
        utility: TransportClient,
    ) -> Self {
        Self {
            credentials,
            entry,
            output,
            utility,
            registration: OnceCell::new(),
        }
    }

    /// Whether the municipal registration has been resolved.
    pub fn is_ready(&self) -> bool {
        self.registration.initialized()
    }

    /// Municipal registration of the provider, resolving it if needed.
    pub async fn registration(&self) -> Result<&str, SoapError> {
        self.registration
            .get_or_try_init(|| self.resolve_registration())
            .await
            .map(String::as_str)
    }

    /// Send one RPS for conversion into an NFS-e.
    pub async fn issue(&self, invoice: &Invoice) -> Result<SoapEnvelope, SoapError> {
        invoice.validate()?;
        let provider = self.provider().await?;
        let xml = build_rps_batch_xml(invoice, &provider)?;

        info!(rps_number = invoice.rps_number, "Issuing NFS-e");

        let args = self
            .auth_args()
            .with("codigoMunicipio", self.credentials.municipality_code.as_str())
            .with("xml", xml);
        self.call(ServiceOperation::EnviarLoteRps, &args).await
    }

    /// Look up an issued NFS-e by number.
    pub async fn query(&self, invoice_number: &str) -> Result<SoapEnvelope, SoapError> {
        let registration = self.registration().await?;
        let invoice_number = required("invoice number", invoice_number)?;

        debug!(invoice_number = %invoice_number, "Querying NFS-e");

        let args = self
            .auth_args()
            .with("inscricaoMunicipal", registration)
            .with("numeroNota", invoice_number);
        self.call(ServiceOperation::ConsultarNfse, &args).await
    }

    /// Cancel an issued NFS-e.
    pub async fn cancel(&self, request: &CancellationRequest) -> Result<SoapEnvelope, SoapError> {
        request.validate()?;
        let provider = self.provider().await?;
        let xml = build_cancel_xml(request, &provider)?;

        info!(invoice_number = %request.invoice_number, "Cancelling NFS-e");

        let args = self
            .auth_args()
            .with("codigoMunicipio", self.credentials.municipality_code.as_str())
            .with("xml", xml);
        self.call(ServiceOperation::CancelarNfse, &args).await
    }

    /// Check the processing state of a submitted RPS batch.
    pub async fn query_batch(&self, protocol: &str) -> Result<SoapEnvelope, SoapError> {
        let registration = self.registration().await?;
        let protocol = required("batch protocol", protocol)?;

        debug!(protocol = %protocol, "Querying RPS batch");

        let args = self
            .auth_args()
            .with("inscricaoMunicipal", registration)
            .with("protocolo", protocol);
        self.call(ServiceOperation::ConsultarLoteRps, &args).await
    }

    async fn resolve_registration(&self) -> Result<String, SoapError> {
        if let Some(configured) = &self.credentials.municipal_registration {
            debug!("Using configured municipal registration");
            return Ok(configured.clone());
        }

        let args = self.auth_args().with("cnpj", self.credentials.cnpj.as_str());
        let envelope = self
            .call(ServiceOperation::ConsultarInscricaoMunicipal, &args)
            .await?;

        if let Some(message) = fault_message(&envelope) {
            return Err(SoapError::Registration(message));
        }

        let registration = envelope
            .body
            .map(Value::Object)
            .as_ref()
            .and_then(find_registration)
            .ok_or_else(|| {
                SoapError::Registration("response carries no municipal registration".to_string())
            })?;

        info!("Municipal registration resolved");
        Ok(registration)
    }

    async fn provider(&self) -> Result<ProviderIdentity, SoapError> {
        Ok(ProviderIdentity {
            cnpj: self.credentials.cnpj.clone(),
            municipal_registration: self.registration().await?.to_string(),
        })
    }

    fn auth_args(&self) -> OperationArgs {
        OperationArgs::new()
            .with("cpfUsuario", self.credentials.user_cpf.as_str())
            .with("hashSenha", self.credentials.password_hash.as_str())
    }

    fn client(&self, group: ServiceGroup) -> &TransportClient {
        match group {
            ServiceGroup::Entry => &self.entry,
            ServiceGroup::Output => &self.output,
            ServiceGroup::Utility => &self.utility,
        }
    }

    async fn call(
        &self,
        operation: ServiceOperation,
        args: &OperationArgs,
    ) -> Result<SoapEnvelope, SoapError> {
        self.client(operation.group())
            .invoke(operation.name(), args)
            .await
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, SoapError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SoapError::Validation(format!("{} is required", field)));
    }
    Ok(value)
}

/// Depth-first search for the first non-empty registration field.
fn find_registration(value: &Value) -> Option<String> {
    match value {
        Value::Object(fields) => REGISTRATION_FIELDS
            .iter()
            .filter_map(|name| fields.get(*name))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(String::from)
            .or_else(|| fields.values().find_map(find_registration)),
        Value::Array(items) => items.iter().find_map(find_registration),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{NormalizedResult, ResponseInterpreter};
    use crate::transport::{SoapConnection, SoapConnector, TransportOptions};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<(String, OperationArgs)>>>;

    struct ScriptedConnector {
        calls: Calls,
        responses: HashMap<&'static str, String>,
    }

    struct ScriptedConnection {
        calls: Calls,
        responses: HashMap<&'static str, String>,
    }

    #[async_trait]
    impl SoapConnector for ScriptedConnector {
        async fn connect(
            &self,
            _endpoint: &EndpointDescriptor,
        ) -> Result<Arc<dyn SoapConnection>, SoapError> {
            Ok(Arc::new(ScriptedConnection {
                calls: Arc::clone(&self.calls),
                responses: self.responses.clone(),
            }))
        }
    }

    #[async_trait]
    impl SoapConnection for ScriptedConnection {
        fn has_operation(&self, operation: &str) -> bool {
            self.responses.contains_key(operation)
        }

        async fn call(&self, operation: &str, args: &OperationArgs) -> Result<String, SoapError> {
            self.calls
                .lock()
                .unwrap()
                .push((operation.to_string(), args.clone()));
            Ok(self.responses[operation].clone())
        }
    }

    /// Document/literal reply: `{Op}Response` wrapping `{Op}Result`.
    fn reply(operation: &str, result: &str) -> String {
        format!(
            r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><{op}Response><{op}Result>{}</{op}Result></{op}Response></soap:Body></soap:Envelope>"#,
            result,
            op = operation
        )
    }

    fn credentials(registration: Option<&str>) -> Credentials {
        Credentials {
            cnpj: "11222333000181".to_string(),
            user_cpf: "12345678909".to_string(),
            password_hash: password_hash("segredo"),
            municipality_code: "3550308".to_string(),
            municipal_registration: registration.map(String::from),
        }
    }

    fn service(registration: Option<&str>) -> (InvoiceService, Calls) {
        let calls: Calls = Arc::default();
        let mut responses = HashMap::new();
        let results = [
            (
                "ConsultarInscricaoMunicipal",
                "<Contribuinte><InscricaoMunicipal>998877</InscricaoMunicipal></Contribuinte>",
            ),
            ("EnviarLoteRps", "<status>1</status><protocolo>P-1</protocolo>"),
            ("CancelarNfse", "<status>1</status>"),
            ("ConsultarNfse", "<status>1</status><mensagem>ok</mensagem>"),
            ("ConsultarLoteRps", "<situacao>Processado</situacao>"),
        ];
        for (operation, result) in results {
            responses.insert(operation, reply(operation, result));
        }

        let client = |group: ServiceGroup| {
            TransportClient::with_connector(
                group.endpoint("https://nfse.test/ws"),
                TransportOptions::default(),
                Arc::new(ScriptedConnector {
                    calls: Arc::clone(&calls),
                    responses: responses.clone(),
                }),
            )
        };

        let service = InvoiceService::from_clients(
            credentials(registration),
            client(ServiceGroup::Entry),
            client(ServiceGroup::Output),
            client(ServiceGroup::Utility),
        );
        (service, calls)
    }

    fn invoice() -> Invoice {
        Invoice::builder()
            .rps_number(5)
            .issue_date(NaiveDate::from_ymd_opt(2026, 5, 4).unwrap())
            .service("01.07", "Desenvolvimento de software")
            .amount_cents(100_000)
            .iss_rate_bp(200)
            .taker("11222333000181", "Cliente SA")
            .build()
            .unwrap()
    }

    fn operations(calls: &Calls) -> Vec<String> {
        calls.lock().unwrap().iter().map(|(op, _)| op.clone()).collect()
    }

    #[test]
    fn test_group_endpoints() {
        let endpoint = ServiceGroup::Output.endpoint("https://nfse.test/ws/");
        assert_eq!(endpoint.location, "https://nfse.test/ws/WSSaida.asmx");
        assert_eq!(endpoint.wsdl_url, "https://nfse.test/ws/WSSaida.asmx?WSDL");
        assert_eq!(ServiceOperation::CancelarNfse.group(), ServiceGroup::Entry);
        assert_eq!(ServiceOperation::ConsultarLoteRps.response_key(), "ConsultarLoteRpsResponse");
        assert_eq!(
            ServiceOperation::ConsultarNfse.result_path(),
            "ConsultarNfseResponse/ConsultarNfseResult"
        );
    }

    #[tokio::test]
    async fn test_registration_resolved_once() {
        let (service, calls) = service(None);
        assert!(!service.is_ready());

        assert_eq!(service.registration().await.unwrap(), "998877");
        assert_eq!(service.registration().await.unwrap(), "998877");
        assert!(service.is_ready());

        assert_eq!(operations(&calls), vec!["ConsultarInscricaoMunicipal"]);
        let calls = calls.lock().unwrap();
        let args = &calls[0].1;
        assert_eq!(args.get("cnpj"), Some("11222333000181"));
        assert_eq!(args.get("cpfUsuario"), Some("12345678909"));
    }

    #[tokio::test]
    async fn test_configured_registration_skips_lookup() {
        let (service, calls) = service(Some("123"));
        service.query("77").await.unwrap();

        assert_eq!(operations(&calls), vec!["ConsultarNfse"]);
        let calls = calls.lock().unwrap();
        let args = &calls[0].1;
        assert_eq!(args.get("inscricaoMunicipal"), Some("123"));
        assert_eq!(args.get("numeroNota"), Some("77"));
    }

    #[tokio::test]
    async fn test_issue_sends_rps_xml() {
        let (service, calls) = service(None);
        let envelope = service.issue(&invoice()).await.unwrap();
        let result = ResponseInterpreter::default().normalize(
            Some(&envelope),
            Some(ServiceOperation::EnviarLoteRps.result_path().as_str()),
        );
        assert!(result.success);
        assert_eq!(result.data.unwrap()["protocolo"], "P-1");

        assert_eq!(
            operations(&calls),
            vec!["ConsultarInscricaoMunicipal", "EnviarLoteRps"]
        );
        let calls = calls.lock().unwrap();
        let args = &calls[1].1;
        assert_eq!(args.get("codigoMunicipio"), Some("3550308"));
        let xml = args.get("xml").unwrap();
        assert!(xml.contains("<InscricaoMunicipal>998877</InscricaoMunicipal>"));
        assert!(xml.contains("<Numero>5</Numero>"));
    }

    #[tokio::test]
    async fn test_cancel_and_query_batch() {
        let (service, calls) = service(Some("123"));

        service
            .cancel(&CancellationRequest::new("10", "Emitida em duplicidade"))
            .await
            .unwrap();
        service.query_batch("P-1").await.unwrap();

        assert_eq!(operations(&calls), vec!["CancelarNfse", "ConsultarLoteRps"]);
        let calls = calls.lock().unwrap();
        assert!(calls[0].1.get("xml").unwrap().contains("<NumeroNota>10</NumeroNota>"));
        assert_eq!(calls[1].1.get("protocolo"), Some("P-1"));
    }

    #[tokio::test]
    async fn test_invalid_input_not_sent() {
        let (service, calls) = service(Some("123"));
        assert!(matches!(service.query(" ").await, Err(SoapError::Validation(_))));
        assert!(matches!(
            service.cancel(&CancellationRequest::new("10", "")).await,
            Err(SoapError::Validation(_))
        ));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_result_interpreted_from_nested_node() {
        let (service, _calls) = service(Some("123"));

        let envelope = service.query("77").await.unwrap();
        let result = ResponseInterpreter::default().normalize(
            Some(&envelope),
            Some(ServiceOperation::ConsultarNfse.result_path().as_str()),
        );
        assert_eq!(result, NormalizedResult::ok(json!({"status": "1", "mensagem": "ok"})));

        let envelope = service.query_batch("P-1").await.unwrap();
        let result = ResponseInterpreter::default().normalize(
            Some(&envelope),
            Some(ServiceOperation::ConsultarLoteRps.result_path().as_str()),
        );
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_registration_lookup() {
        let (service, calls) = service(None);

        let mut invoice = invoice();
        invoice.amount_cents = 0;
        assert!(matches!(service.issue(&invoice).await, Err(SoapError::Validation(_))));
        assert!(matches!(
            service.cancel(&CancellationRequest::new("10", " ")).await,
            Err(SoapError::Validation(_))
        ));

        assert!(calls.lock().unwrap().is_empty());
        assert!(!service.is_ready());
    }

    #[test]
    fn test_find_registration_nested() {
        let body = json!({"R": {"Lista": [{"x": "1"}, {"inscricao": " 42 "}]}});
        assert_eq!(find_registration(&body).as_deref(), Some("42"));
        assert_eq!(find_registration(&json!({"R": {"inscricao": ""}})), None);
    }

    #[test]
    fn test_credentials_from_config_hash_password() {
        let config = TaxpayerConfig {
            cnpj: "11222333000181".to_string(),
            user_cpf: "12345678909".to_string(),
            password: Some("segredo".to_string()),
            municipal_registration: Some("  ".to_string()),
            ..Default::default()
        };
        let credentials = Credentials::from_config(&config).unwrap();
        assert_eq!(credentials.password_hash, password_hash("segredo"));
        assert!(credentials.municipal_registration.is_none());
        assert!(!format!("{:?}", credentials).contains(&credentials.password_hash));
    }
}
