//! Interpretation of SOAP responses into a uniform success/error result.
//!
//! The remote service does not follow a single response schema: status and
//! message fields change name between operations. The interpreter therefore
//! tries an ordered list of candidate names for each of them and falls back
//! to returning the raw node instead of rejecting unknown shapes.

use crate::error::SoapError;
use crate::parser::{parse_envelope, SoapEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status field names, tried in order.
pub const STATUS_FIELDS: &[&str] = &["status", "situacao", "Status"];

/// Error message field names, tried in order.
pub const MESSAGE_FIELDS: &[&str] = &["mensagem", "MsgErro", "erro"];

const SUCCESS_STATUS: &str = "1";
const PROCESSED_MARKER: &str = "processado";

/// Uniform outcome of a remote call.
///
/// `success == false` implies `data == None`, and `success == true`
/// implies `error == None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl NormalizedResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Either a raw response document or an envelope parsed from one.
#[derive(Debug, Clone, Copy)]
pub enum EnvelopeSource<'a> {
    Xml(&'a str),
    Parsed(&'a SoapEnvelope),
}

impl<'a> From<&'a str> for EnvelopeSource<'a> {
    fn from(xml: &'a str) -> Self {
        EnvelopeSource::Xml(xml)
    }
}

impl<'a> From<&'a String> for EnvelopeSource<'a> {
    fn from(xml: &'a String) -> Self {
        EnvelopeSource::Xml(xml.as_str())
    }
}

impl<'a> From<&'a SoapEnvelope> for EnvelopeSource<'a> {
    fn from(envelope: &'a SoapEnvelope) -> Self {
        EnvelopeSource::Parsed(envelope)
    }
}

/// Compose `"[{code}] {message} - Detalhe: {detail}"` for a faulted
/// envelope, leaving out the parts that are absent.
pub fn fault_message(envelope: &SoapEnvelope) -> Option<String> {
    let fault = envelope.fault.as_ref()?;

    let mut text = String::new();
    if let Some(code) = &fault.code {
        text.push_str(&format!("[{}] ", code));
    }
    text.push_str(&fault.message);
    if let Some(detail) = &fault.detail {
        text.push_str(" - Detalhe: ");
        text.push_str(detail);
    }
    Some(text.trim_end().to_string())
}

/// Heuristic response interpreter.
#[derive(Debug, Clone)]
pub struct ResponseInterpreter {
    status_fields: Vec<String>,
    message_fields: Vec<String>,
}

impl Default for ResponseInterpreter {
    fn default() -> Self {
        Self::new(STATUS_FIELDS, MESSAGE_FIELDS)
    }
}

impl ResponseInterpreter {
    /// Create an interpreter with custom candidate field lists.
    pub fn new(status_fields: &[&str], message_fields: &[&str]) -> Self {
        Self {
            status_fields: status_fields.iter().map(|s| s.to_string()).collect(),
            message_fields: message_fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn parse(&self, xml: &str) -> Result<SoapEnvelope, SoapError> {
        parse_envelope(xml)
    }

    /// Whether the envelope carries a protocol fault. Raw XML is parsed first.
    pub fn has_fault<'a>(&self, source: impl Into<EnvelopeSource<'a>>) -> Result<bool, SoapError> {
        match source.into() {
            EnvelopeSource::Xml(xml) => Ok(parse_envelope(xml)?.has_fault()),
            EnvelopeSource::Parsed(envelope) => Ok(envelope.has_fault()),
        }
    }

    pub fn fault_message(&self, envelope: &SoapEnvelope) -> Option<String> {
        fault_message(envelope)
    }

    /// Classify a response.
    ///
    /// `expected_result_key` names a body element, or a nested one as a
    /// `/`-separated path such as `ConsultarNfseResponse/ConsultarNfseResult`.
    /// Without it, or when the body lacks that node, the whole body is
    /// returned as a success for the caller to inspect.
    pub fn normalize(
        &self,
        envelope: Option<&SoapEnvelope>,
        expected_result_key: Option<&str>,
    ) -> NormalizedResult {
        let Some(envelope) = envelope else {
            return NormalizedResult::failure("empty response");
        };

        let Some(body) = envelope.body.as_ref() else {
            return NormalizedResult::failure("missing body");
        };

        if let Some(message) = fault_message(envelope) {
            return NormalizedResult::failure(message);
        }

        let node = expected_result_key.and_then(|key| result_node(body, key));
        match node {
            None | Some(Value::Null) => NormalizedResult::ok(Value::Object(body.clone())),
            Some(Value::Object(fields)) => self.classify(fields),
            Some(structured @ Value::Array(_)) => NormalizedResult::failure(structured.to_string()),
            Some(scalar) => NormalizedResult::ok(scalar.clone()),
        }
    }

    fn classify(&self, fields: &Map<String, Value>) -> NormalizedResult {
        let status = first_field(fields, &self.status_fields).map(value_text);

        if status.as_deref().is_some_and(is_success_status) {
            return NormalizedResult::ok(Value::Object(fields.clone()));
        }

        let error = first_field(fields, &self.message_fields)
            .map(value_text)
            .unwrap_or_else(|| Value::Object(fields.clone()).to_string());
        NormalizedResult::failure(error)
    }
}

fn result_node<'a>(body: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('/');
    let first = body.get(segments.next()?)?;
    segments.try_fold(first, |node, segment| node.get(segment))
}

fn first_field<'a>(fields: &'a Map<String, Value>, candidates: &[String]) -> Option<&'a Value> {
    candidates
        .iter()
        .filter_map(|name| fields.get(name))
        .find(|value| !value.is_null())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn is_success_status(status: &str) -> bool {
    status == SUCCESS_STATUS || status.to_lowercase().contains(PROCESSED_MARKER)
}
