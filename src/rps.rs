//! RPS batch and cancellation request documents.
//!
//! These are plain field-to-tag mappings. Every value is escaped; inputs are
//! validated before any XML is produced.

use crate::error::SoapError;
use chrono::NaiveDate;
use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};

const CPF_DIGITS: usize = 11;
const CNPJ_DIGITS: usize = 14;
const MAX_DESCRIPTION_LEN: usize = 2000;
const MAX_CANCEL_REASON_LEN: usize = 255;
/// 100% expressed in basis points
const MAX_RATE_BP: u32 = 10_000;

/// Service provider identity stamped on every request document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    pub cnpj: String,
    pub municipal_registration: String,
}

/// Service taker (customer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taker {
    /// CPF (11 digits) or CNPJ (14 digits); punctuation is ignored
    pub document: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Invoice data carried by one RPS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub rps_number: u64,
    #[serde(default = "default_series")]
    pub rps_series: String,
    #[serde(default = "today")]
    pub issue_date: NaiveDate,
    /// Municipal service list code
    pub service_code: String,
    pub description: String,
    pub amount_cents: u64,
    /// ISS rate in basis points (250 = 2.50%)
    pub iss_rate_bp: u32,
    #[serde(default)]
    pub iss_withheld: bool,
    pub taker: Taker,
}

fn default_series() -> String {
    "A".to_string()
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

impl Invoice {
    pub fn builder() -> InvoiceBuilder {
        InvoiceBuilder::default()
    }

    pub fn validate(&self) -> Result<(), SoapError> {
        if self.rps_number == 0 {
            return Err(SoapError::Validation("RPS number must be positive".to_string()));
        }
        require("RPS series", &self.rps_series)?;
        require("service code", &self.service_code)?;
        require("service description", &self.description)?;
        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(SoapError::Validation(format!(
                "service description exceeds {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }
        if self.amount_cents == 0 {
            return Err(SoapError::Validation("service amount must be positive".to_string()));
        }
        if self.iss_rate_bp > MAX_RATE_BP {
            return Err(SoapError::Validation(format!(
                "ISS rate {} exceeds 100%",
                format_hundredths(u64::from(self.iss_rate_bp))
            )));
        }
        tax_document(&self.taker.document)?;
        require("taker name", &self.taker.name)?;
        Ok(())
    }
}

/// Fluent construction of an [`Invoice`].
#[derive(Debug, Clone, Default)]
pub struct InvoiceBuilder {
    rps_number: Option<u64>,
    rps_series: Option<String>,
    issue_date: Option<NaiveDate>,
    service_code: Option<String>,
    description: Option<String>,
    amount_cents: Option<u64>,
    iss_rate_bp: Option<u32>,
    iss_withheld: bool,
    taker_document: Option<String>,
    taker_name: Option<String>,
    taker_email: Option<String>,
}

impl InvoiceBuilder {
    pub fn rps_number(mut self, number: u64) -> Self {
        self.rps_number = Some(number);
        self
    }

    pub fn rps_series(mut self, series: impl Into<String>) -> Self {
        self.rps_series = Some(series.into());
        self
    }

    pub fn issue_date(mut self, date: NaiveDate) -> Self {
        self.issue_date = Some(date);
        self
    }

    pub fn service(mut self, code: impl Into<String>, description: impl Into<String>) -> Self {
        self.service_code = Some(code.into());
        self.description = Some(description.into());
        self
    }

    pub fn amount_cents(mut self, cents: u64) -> Self {
        self.amount_cents = Some(cents);
        self
    }

    pub fn iss_rate_bp(mut self, rate: u32) -> Self {
        self.iss_rate_bp = Some(rate);
        self
    }

    pub fn iss_withheld(mut self, withheld: bool) -> Self {
        self.iss_withheld = withheld;
        self
    }

    pub fn taker(mut self, document: impl Into<String>, name: impl Into<String>) -> Self {
        self.taker_document = Some(document.into());
        self.taker_name = Some(name.into());
        self
    }

    pub fn taker_email(mut self, email: impl Into<String>) -> Self {
        self.taker_email = Some(email.into());
        self
    }

    /// Assemble and validate the invoice.
    pub fn build(self) -> Result<Invoice, SoapError> {
        let invoice = Invoice {
            rps_number: self.rps_number.ok_or_else(|| missing("RPS number"))?,
            rps_series: self.rps_series.unwrap_or_else(default_series),
            issue_date: self.issue_date.unwrap_or_else(today),
            service_code: self.service_code.ok_or_else(|| missing("service code"))?,
            description: self.description.ok_or_else(|| missing("service description"))?,
            amount_cents: self.amount_cents.ok_or_else(|| missing("service amount"))?,
            iss_rate_bp: self.iss_rate_bp.ok_or_else(|| missing("ISS rate"))?,
            iss_withheld: self.iss_withheld,
            taker: Taker {
                document: self.taker_document.ok_or_else(|| missing("taker document"))?,
                name: self.taker_name.ok_or_else(|| missing("taker name"))?,
                email: self.taker_email,
            },
        };
        invoice.validate()?;
        Ok(invoice)
    }
}

/// Request to cancel an issued NFS-e.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRequest {
    pub invoice_number: String,
    pub reason: String,
    #[serde(default)]
    pub verification_code: Option<String>,
}

impl CancellationRequest {
    pub fn new(invoice_number: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            invoice_number: invoice_number.into(),
            reason: reason.into(),
            verification_code: None,
        }
    }

    pub fn with_verification_code(mut self, code: impl Into<String>) -> Self {
        self.verification_code = Some(code.into());
        self
    }

    pub fn validate(&self) -> Result<(), SoapError> {
        require("invoice number", &self.invoice_number)?;
        if !self.invoice_number.trim().chars().all(|c| c.is_ascii_digit()) {
            return Err(SoapError::Validation(format!(
                "invoice number '{}' must be numeric",
                self.invoice_number
            )));
        }
        require("cancellation reason", &self.reason)?;
        if self.reason.chars().count() > MAX_CANCEL_REASON_LEN {
            return Err(SoapError::Validation(format!(
                "cancellation reason exceeds {} characters",
                MAX_CANCEL_REASON_LEN
            )));
        }
        Ok(())
    }
}

/// Build the RPS batch document sent to the entry service.
pub fn build_rps_batch_xml(
    invoice: &Invoice,
    provider: &ProviderIdentity,
) -> Result<String, SoapError> {
    invoice.validate()?;
    let provider_cnpj = provider_cnpj(provider)?;
    let taker_document = tax_document(&invoice.taker.document)?;

    let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><LoteRps>"#);
    push_provider(&mut xml, &provider_cnpj, &provider.municipal_registration);

    xml.push_str("<Rps>");
    element(&mut xml, "Numero", &invoice.rps_number.to_string());
    element(&mut xml, "Serie", &invoice.rps_series);
    element(&mut xml, "DataEmissao", &invoice.issue_date.format("%Y-%m-%d").to_string());

    xml.push_str("<Servico>");
    element(&mut xml, "CodigoServico", &invoice.service_code);
    element(&mut xml, "Discriminacao", &invoice.description);
    element(&mut xml, "ValorServicos", &format_hundredths(invoice.amount_cents));
    element(&mut xml, "Aliquota", &format_hundredths(u64::from(invoice.iss_rate_bp)));
    element(&mut xml, "IssRetido", if invoice.iss_withheld { "1" } else { "2" });
    xml.push_str("</Servico>");

    xml.push_str("<Tomador><CpfCnpj>");
    element(&mut xml, taker_document.tag(), taker_document.digits());
    xml.push_str("</CpfCnpj>");
    element(&mut xml, "RazaoSocial", &invoice.taker.name);
    if let Some(email) = invoice.taker.email.as_deref().filter(|e| !e.trim().is_empty()) {
        element(&mut xml, "Email", email);
    }
    xml.push_str("</Tomador></Rps></LoteRps>");

    Ok(xml)
}

/// Build the cancellation document sent to the entry service.
pub fn build_cancel_xml(
    request: &CancellationRequest,
    provider: &ProviderIdentity,
) -> Result<String, SoapError> {
    request.validate()?;
    let provider_cnpj = provider_cnpj(provider)?;

    let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><CancelamentoNfse>"#);
    push_provider(&mut xml, &provider_cnpj, &provider.municipal_registration);
    element(&mut xml, "NumeroNota", request.invoice_number.trim());
    if let Some(code) = request.verification_code.as_deref().filter(|c| !c.trim().is_empty()) {
        element(&mut xml, "CodigoVerificacao", code.trim());
    }
    element(&mut xml, "MotivoCancelamento", request.reason.trim());
    xml.push_str("</CancelamentoNfse>");

    Ok(xml)
}

/// Normalized CPF or CNPJ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaxDocument {
    Cpf(String),
    Cnpj(String),
}

impl TaxDocument {
    fn tag(&self) -> &'static str {
        match self {
            TaxDocument::Cpf(_) => "Cpf",
            TaxDocument::Cnpj(_) => "Cnpj",
        }
    }

    pub fn digits(&self) -> &str {
        match self {
            TaxDocument::Cpf(d) | TaxDocument::Cnpj(d) => d,
        }
    }
}

/// Parse a CPF or CNPJ, accepting the usual `.`, `-` and `/` punctuation.
pub fn tax_document(raw: &str) -> Result<TaxDocument, SoapError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '.' | '-' | '/' | ' '))
        .collect();

    if !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Err(SoapError::Validation(format!(
            "tax document '{}' contains invalid characters",
            raw
        )));
    }

    match cleaned.len() {
        CPF_DIGITS => Ok(TaxDocument::Cpf(cleaned)),
        CNPJ_DIGITS => Ok(TaxDocument::Cnpj(cleaned)),
        n => Err(SoapError::Validation(format!(
            "tax document must have {} or {} digits, got {}",
            CPF_DIGITS, CNPJ_DIGITS, n
        ))),
    }
}

fn provider_cnpj(provider: &ProviderIdentity) -> Result<String, SoapError> {
    require("provider municipal registration", &provider.municipal_registration)?;
    match tax_document(&provider.cnpj)? {
        TaxDocument::Cnpj(digits) => Ok(digits),
        TaxDocument::Cpf(_) => Err(SoapError::Validation(
            "provider document must be a CNPJ".to_string(),
        )),
    }
}

fn push_provider(xml: &mut String, cnpj: &str, registration: &str) {
    xml.push_str("<Prestador>");
    element(xml, "Cnpj", cnpj);
    element(xml, "InscricaoMunicipal", registration.trim());
    xml.push_str("</Prestador>");
}

fn element(xml: &mut String, tag: &str, value: &str) {
    xml.push('<');
    xml.push_str(tag);
    xml.push('>');
    xml.push_str(&escape(value));
    xml.push_str("</");
    xml.push_str(tag);
    xml.push('>');
}

/// 12345 -> "123.45"
fn format_hundredths(value: u64) -> String {
    format!("{}.{:02}", value / 100, value % 100)
}

fn require(field: &str, value: &str) -> Result<(), SoapError> {
    if value.trim().is_empty() {
        return Err(missing(field));
    }
    Ok(())
}

fn missing(field: &str) -> SoapError {
    SoapError::Validation(format!("{} is required", field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ProviderIdentity {
        ProviderIdentity {
            cnpj: "11.222.333/0001-81".to_string(),
            municipal_registration: "123456".to_string(),
        }
    }

    fn invoice() -> Invoice {
        Invoice::builder()
            .rps_number(42)
            .issue_date(NaiveDate::from_ymd_opt(2026, 3, 15).unwrap())
            .service("01.07", "Suporte técnico & manutenção <mensal>")
            .amount_cents(150_050)
            .iss_rate_bp(250)
            .taker("123.456.789-09", "Maria Souza")
            .taker_email("maria@example.com")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let invoice = invoice();
        assert_eq!(invoice.rps_series, "A");
        assert!(!invoice.iss_withheld);
    }

    #[test]
    fn test_builder_reports_missing_field() {
        let err = Invoice::builder().rps_number(1).build().unwrap_err();
        assert!(err.to_string().contains("service code is required"));
    }

    #[test]
    fn test_rps_xml_fields() {
        let xml = build_rps_batch_xml(&invoice(), &provider()).unwrap();

        assert!(xml.contains("<Prestador><Cnpj>11222333000181</Cnpj><InscricaoMunicipal>123456</InscricaoMunicipal></Prestador>"));
        assert!(xml.contains("<Numero>42</Numero><Serie>A</Serie><DataEmissao>2026-03-15</DataEmissao>"));
        assert!(xml.contains("<ValorServicos>1500.50</ValorServicos>"));
        assert!(xml.contains("<Aliquota>2.50</Aliquota>"));
        assert!(xml.contains("<IssRetido>2</IssRetido>"));
        assert!(xml.contains("<CpfCnpj><Cpf>12345678909</Cpf></CpfCnpj>"));
        assert!(xml.contains("<Email>maria@example.com</Email>"));
        assert!(xml.contains("Suporte técnico &amp; manutenção &lt;mensal&gt;"));
    }

    #[test]
    fn test_invalid_amount_rejected() {
        let mut invoice = invoice();
        invoice.amount_cents = 0;
        assert!(matches!(
            build_rps_batch_xml(&invoice, &provider()),
            Err(SoapError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_rate_rejected() {
        let mut invoice = invoice();
        invoice.iss_rate_bp = 10_001;
        assert!(invoice.validate().is_err());
    }

    #[test]
    fn test_tax_document_lengths() {
        assert!(matches!(tax_document("123.456.789-09"), Ok(TaxDocument::Cpf(_))));
        assert!(matches!(tax_document("11.222.333/0001-81"), Ok(TaxDocument::Cnpj(_))));
        assert!(tax_document("1234").is_err());
        assert!(tax_document("123.456.789-0X").is_err());
    }

    #[test]
    fn test_provider_must_be_cnpj() {
        let provider = ProviderIdentity {
            cnpj: "123.456.789-09".to_string(),
            municipal_registration: "1".to_string(),
        };
        assert!(build_rps_batch_xml(&invoice(), &provider).is_err());
    }

    #[test]
    fn test_cancel_xml() {
        let request = CancellationRequest::new("2024", "Serviço não prestado")
            .with_verification_code("AB12-CD34");
        let xml = build_cancel_xml(&request, &provider()).unwrap();

        assert!(xml.contains("<NumeroNota>2024</NumeroNota>"));
        assert!(xml.contains("<CodigoVerificacao>AB12-CD34</CodigoVerificacao>"));
        assert!(xml.contains("<MotivoCancelamento>Serviço não prestado</MotivoCancelamento>"));
    }

    #[test]
    fn test_cancel_requires_numeric_number_and_reason() {
        assert!(CancellationRequest::new("12a", "motivo").validate().is_err());
        assert!(CancellationRequest::new("12", " ").validate().is_err());
        assert!(CancellationRequest::new("12", "x".repeat(256)).validate().is_err());
    }

    #[test]
    fn test_invoice_from_yaml() {
        let yaml = r#"
rps_number: 7
issue_date: 2026-01-02
service_code: "01.07"
description: Consultoria
amount_cents: 10000
iss_rate_bp: 500
taker:
  document: "11222333000181"
  name: ACME Ltda
"#;
        let invoice: Invoice = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(invoice.rps_series, "A");
        assert!(invoice.taker.email.is_none());
        assert!(invoice.validate().is_ok());
    }
}
