//! SOAP XML parsing utilities.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand entities).
//! Element names are reduced to their local part, so `ns1:ConsultarNfseResult`
//! and `ConsultarNfseResult` address the same node.

use crate::error::SoapError;
use crate::transport::OperationArgs;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[serde(rename = "1.2")]
    Soap12,
}

/// Parsed SOAP envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct SoapEnvelope {
    /// Detected SOAP version, if the envelope namespace was recognized
    pub version: Option<SoapVersion>,
    /// Body children keyed by local element name
    pub body: Option<Map<String, Value>>,
    /// Protocol fault, when the body carries one
    pub fault: Option<SoapFault>,
    /// Raw XML for further processing
    pub raw_xml: String,
}

impl SoapEnvelope {
    pub fn has_fault(&self) -> bool {
        self.fault.is_some()
    }
}

/// Protocol-level fault carried inside an envelope body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoapFault {
    pub code: Option<String>,
    pub message: String,
    pub detail: Option<String>,
}

/// Operations advertised by a service description (WSDL).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescription {
    /// `targetNamespace` of the definitions element
    pub target_namespace: String,
    /// Operation name -> SOAPAction declared by the first SOAP binding
    pub operations: BTreeMap<String, Option<String>>,
}

impl ServiceDescription {
    pub fn has_operation(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// SOAPAction header value for an operation.
    ///
    /// Falls back to `{targetNamespace}{operation}`, the document/literal default.
    pub fn soap_action(&self, operation: &str) -> String {
        match self.operations.get(operation) {
            Some(Some(action)) if !action.is_empty() => action.clone(),
            _ => format!("{}{}", self.target_namespace, operation),
        }
    }
}

/// Minimal element tree used by the envelope and WSDL readers.
#[derive(Debug, Clone, Default)]
struct XmlElement {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<XmlElement>,
    text: String,
}

impl XmlElement {
    fn from_start(e: &BytesStart) -> Result<Self, SoapError> {
        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|e| SoapError::XmlParse(format!("invalid attribute: {}", e)))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| SoapError::XmlParse(format!("invalid attribute value: {}", e)))?
                .into_owned();
            attributes.push((key, value));
        }

        Ok(Self {
            name: local_name_str(e),
            attributes,
            ..Default::default()
        })
    }

    fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Attribute lookup by local name, ignoring namespace declarations.
    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| {
                !key.starts_with("xmlns")
                    && (key == name || key.rsplit(':').next() == Some(name))
            })
            .map(|(_, value)| value.as_str())
    }

    fn declares_namespace(&self, uri: &str) -> bool {
        self.attributes
            .iter()
            .any(|(key, value)| key.starts_with("xmlns") && value == uri)
    }

    fn text_content(&self) -> String {
        self.text.trim().to_string()
    }

    /// Convert to a JSON-like value: leaf elements become strings, repeated
    /// children become arrays.
    fn to_value(&self) -> Value {
        if self.children.is_empty() {
            return Value::String(self.text_content());
        }

        let mut map = Map::new();
        for child in &self.children {
            let value = child.to_value();
            match map.get_mut(&child.name) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    map.insert(child.name.clone(), value);
                }
            }
        }
        Value::Object(map)
    }

    fn collect_descendants<'a>(&'a self, name: &str, found: &mut Vec<&'a XmlElement>) {
        for child in &self.children {
            if child.name == name {
                found.push(child);
            }
            child.collect_descendants(name, found);
        }
    }

    fn descendants(&self, name: &str) -> Vec<&XmlElement> {
        let mut found = Vec::new();
        self.collect_descendants(name, &mut found);
        found
    }
}

/// Parse an XML document into its root element.
fn parse_document(xml: &str) -> Result<XmlElement, SoapError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                stack.push(XmlElement::from_start(e)?);
            }

            Ok(Event::Empty(ref e)) => {
                let element = XmlElement::from_start(e)?;
                attach(&mut stack, &mut root, element)?;
            }

            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| SoapError::XmlParse("unexpected closing tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }

            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| SoapError::XmlParse(format!("invalid text content: {}", e)))?;
                match stack.last_mut() {
                    Some(current) => current.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => {
                        return Err(SoapError::XmlParse(
                            "text outside of the root element".to_string(),
                        ))
                    }
                }
            }

            Ok(Event::CData(e)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }

            Ok(Event::Eof) => break,

            Err(e) => {
                return Err(SoapError::XmlParse(format!(
                    "at position {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }

            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(SoapError::XmlParse(format!("unclosed element <{}>", open.name)));
    }

    root.ok_or_else(|| SoapError::XmlParse("document has no root element".to_string()))
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), SoapError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_some() => {
            return Err(SoapError::XmlParse("multiple root elements".to_string()));
        }
        None => *root = Some(element),
    }
    Ok(())
}

/// Extract local name from element.
fn local_name_str(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Parse a SOAP response document.
///
/// A document whose root is not an `Envelope` parses successfully but has
/// neither body nor fault.
pub fn parse_envelope(xml: &str) -> Result<SoapEnvelope, SoapError> {
    let root = parse_document(xml)?;

    if root.name != "Envelope" {
        return Ok(SoapEnvelope {
            version: None,
            body: None,
            fault: None,
            raw_xml: xml.to_string(),
        });
    }

    let version = if root.declares_namespace(SOAP_12_NS) {
        Some(SoapVersion::Soap12)
    } else if root.declares_namespace(SOAP_11_NS) {
        Some(SoapVersion::Soap11)
    } else {
        None
    };

    let body_element = root.child("Body");
    let fault = body_element.and_then(|b| b.child("Fault")).map(parse_fault);
    let body = body_element.map(|b| match b.to_value() {
        Value::Object(map) => map,
        _ => Map::new(),
    });

    Ok(SoapEnvelope {
        version,
        body,
        fault,
        raw_xml: xml.to_string(),
    })
}

/// Read a fault in either SOAP 1.1 or SOAP 1.2 layout.
fn parse_fault(fault: &XmlElement) -> SoapFault {
    let code = fault
        .child("faultcode")
        .map(XmlElement::text_content)
        .or_else(|| {
            fault
                .child("Code")
                .and_then(|c| c.child("Value"))
                .map(XmlElement::text_content)
        })
        .filter(|c| !c.is_empty());

    let message = fault
        .child("faultstring")
        .map(XmlElement::text_content)
        .or_else(|| {
            fault
                .child("Reason")
                .and_then(|r| r.child("Text"))
                .map(XmlElement::text_content)
        })
        .unwrap_or_default();

    let detail = fault
        .child("detail")
        .or_else(|| fault.child("Detail"))
        .map(|d| {
            if d.children.is_empty() {
                d.text_content()
            } else {
                d.to_value().to_string()
            }
        })
        .filter(|d| !d.is_empty());

    SoapFault {
        code,
        message,
        detail,
    }
}

/// Extract target namespace and operations from a WSDL document.
pub fn parse_service_description(xml: &str) -> Result<ServiceDescription, SoapError> {
    let root = parse_document(xml)?;
    if root.name != "definitions" {
        return Err(SoapError::XmlParse(format!(
            "expected WSDL definitions, found <{}>",
            root.name
        )));
    }

    let mut description = ServiceDescription {
        target_namespace: root.attr("targetNamespace").unwrap_or_default().to_string(),
        operations: BTreeMap::new(),
    };

    for port_type in root.descendants("portType") {
        for operation in port_type.children.iter().filter(|c| c.name == "operation") {
            if let Some(name) = operation.attr("name") {
                description.operations.entry(name.to_string()).or_insert(None);
            }
        }
    }

    for binding in root.descendants("binding") {
        for operation in binding.children.iter().filter(|c| c.name == "operation") {
            let Some(name) = operation.attr("name") else {
                continue;
            };
            let action = operation
                .child("operation")
                .and_then(|op| op.attr("soapAction"))
                .map(String::from);
            let entry = description.operations.entry(name.to_string()).or_insert(None);
            if entry.is_none() {
                *entry = action;
            }
        }
    }

    Ok(description)
}

/// Build a SOAP 1.1 document/literal request envelope.
pub fn build_request_envelope(namespace: &str, operation: &str, args: &OperationArgs) -> String {
    let mut body = String::new();
    for (name, value) in args.iter() {
        body.push_str(&format!("<{name}>{}</{name}>", escape(value)));
    }

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="{}" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema">
  <soap:Body>
    <{operation} xmlns="{}">{body}</{operation}>
  </soap:Body>
</soap:Envelope>"#,
        SOAP_11_NS,
        escape(namespace),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOAP_11_RESPONSE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <ConsultarNfseResponse xmlns="http://www.nfse.gov.br/ws">
      <ConsultarNfseResult>
        <status>1</status>
        <mensagem>Nota localizada</mensagem>
        <Nota><Numero>10</Numero></Nota>
        <Nota><Numero>11</Numero></Nota>
      </ConsultarNfseResult>
    </ConsultarNfseResponse>
  </soap:Body>
</soap:Envelope>"#;

    const SOAP_11_FAULT: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <soap:Fault>
      <faultcode>soap:Server</faultcode>
      <faultstring>Server was unable to process request.</faultstring>
      <detail>Object reference not set</detail>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#;

    const SOAP_12_FAULT: &str = r#"<?xml version="1.0"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope">
  <env:Body>
    <env:Fault>
      <env:Code><env:Value>env:Receiver</env:Value></env:Code>
      <env:Reason><env:Text xml:lang="pt">Falha interna</env:Text></env:Reason>
    </env:Fault>
  </env:Body>
</env:Envelope>"#;

    const WSDL: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<wsdl:definitions xmlns:soap="http://schemas.xmlsoap.org/wsdl/soap/"
                  xmlns:wsdl="http://schemas.xmlsoap.org/wsdl/"
                  targetNamespace="http://www.nfse.gov.br/ws/">
  <wsdl:portType name="WSSaidaSoap">
    <wsdl:operation name="ConsultarNfse"/>
    <wsdl:operation name="ConsultarLoteRps"/>
  </wsdl:portType>
  <wsdl:binding name="WSSaidaSoap" type="tns:WSSaidaSoap">
    <wsdl:operation name="ConsultarNfse">
      <soap:operation soapAction="http://www.nfse.gov.br/ws/ConsultarNfse" style="document"/>
    </wsdl:operation>
  </wsdl:binding>
  <wsdl:service name="WSSaida">
    <wsdl:port name="WSSaidaSoap" binding="tns:WSSaidaSoap">
      <soap:address location="http://elsewhere.invalid/WSSaida.asmx"/>
    </wsdl:port>
  </wsdl:service>
</wsdl:definitions>"#;

    #[test]
    fn test_parse_soap_11_body() {
        let envelope = parse_envelope(SOAP_11_RESPONSE).unwrap();
        assert_eq!(envelope.version, Some(SoapVersion::Soap11));
        assert!(!envelope.has_fault());

        let body = envelope.body.unwrap();
        let result = &body["ConsultarNfseResponse"]["ConsultarNfseResult"];
        assert_eq!(result["status"], "1");
        assert_eq!(result["mensagem"], "Nota localizada");
        assert_eq!(result["Nota"].as_array().unwrap().len(), 2);
        assert_eq!(result["Nota"][1]["Numero"], "11");
    }

    #[test]
    fn test_parse_soap_11_fault() {
        let envelope = parse_envelope(SOAP_11_FAULT).unwrap();
        let fault = envelope.fault.unwrap();
        assert_eq!(fault.code.as_deref(), Some("soap:Server"));
        assert_eq!(fault.message, "Server was unable to process request.");
        assert_eq!(fault.detail.as_deref(), Some("Object reference not set"));
    }

    #[test]
    fn test_parse_soap_12_fault() {
        let envelope = parse_envelope(SOAP_12_FAULT).unwrap();
        assert_eq!(envelope.version, Some(SoapVersion::Soap12));
        let fault = envelope.fault.unwrap();
        assert_eq!(fault.code.as_deref(), Some("env:Receiver"));
        assert_eq!(fault.message, "Falha interna");
        assert_eq!(fault.detail, None);
    }

    #[test]
    fn test_cdata_payload_kept_as_text() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body><R><conteudo><![CDATA[<nota numero="1"/>]]></conteudo></R></soap:Body>
</soap:Envelope>"#;
        let envelope = parse_envelope(xml).unwrap();
        assert_eq!(envelope.body.unwrap()["R"]["conteudo"], r#"<nota numero="1"/>"#);
    }

    #[test]
    fn test_missing_body() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Header/></soap:Envelope>"#;
        let envelope = parse_envelope(xml).unwrap();
        assert!(envelope.body.is_none());
        assert!(envelope.fault.is_none());
    }

    #[test]
    fn test_malformed_xml_rejected() {
        assert!(matches!(
            parse_envelope("<soap:Envelope><soap:Body></soap:Envelope>"),
            Err(SoapError::XmlParse(_))
        ));
        assert!(matches!(parse_envelope(""), Err(SoapError::XmlParse(_))));
        assert!(matches!(parse_envelope("<a/><b/>"), Err(SoapError::XmlParse(_))));
    }

    #[test]
    fn test_parse_service_description() {
        let description = parse_service_description(WSDL).unwrap();
        assert_eq!(description.target_namespace, "http://www.nfse.gov.br/ws/");
        assert!(description.has_operation("ConsultarNfse"));
        assert!(description.has_operation("ConsultarLoteRps"));
        assert!(!description.has_operation("EnviarLoteRps"));
        assert_eq!(
            description.soap_action("ConsultarNfse"),
            "http://www.nfse.gov.br/ws/ConsultarNfse"
        );
        assert_eq!(
            description.soap_action("ConsultarLoteRps"),
            "http://www.nfse.gov.br/ws/ConsultarLoteRps"
        );
    }

    #[test]
    fn test_build_request_envelope_escapes_arguments() {
        let args = OperationArgs::new()
            .with("cpfUsuario", "12345678901")
            .with("xml", "<Rps><Valor>1&2</Valor></Rps>");
        let xml = build_request_envelope("http://www.nfse.gov.br/ws", "EnviarLoteRps", &args);

        assert!(xml.contains(r#"<EnviarLoteRps xmlns="http://www.nfse.gov.br/ws">"#));
        assert!(xml.contains("<cpfUsuario>12345678901</cpfUsuario>"));
        assert!(xml.contains("&lt;Rps&gt;&lt;Valor&gt;1&amp;2"));

        let parsed = parse_envelope(&xml).unwrap();
        let body = parsed.body.unwrap();
        assert_eq!(body["EnviarLoteRps"]["xml"], "<Rps><Valor>1&2</Valor></Rps>");
    }
}
