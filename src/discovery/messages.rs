//! WS-Discovery (2005/04) message parsing and construction

use crate::error::ProtocolError;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

pub const NS_SOAP_ENV: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub const NS_DISCOVERY: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery";
pub const NS_NETWORK: &str = "http://www.onvif.org/ver10/network/wsdl";
pub const NS_DEVICE: &str = "http://www.onvif.org/ver10/device/wsdl";

const ANONYMOUS_TO: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";
const DISCOVERY_TO: &str = "urn:schemas-xmlsoap-org:ws:2005:04:discovery";
const ACTION_PROBE_MATCHES: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/ProbeMatches";
const ACTION_HELLO: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Hello";
const ACTION_BYE: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Bye";

/// Types this device answers to, as (namespace, local name)
const ADVERTISED_TYPES: &[(&str, &str)] = &[
    (NS_NETWORK, "NetworkVideoTransmitter"),
    (NS_DEVICE, "Device"),
];

/// Qualified name from a Types list; namespace is None when the prefix
/// could not be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub namespace: Option<String>,
    pub local: String,
}

/// A parsed Probe request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Probe {
    pub message_id: Option<String>,
    pub types: Vec<QualifiedName>,
    pub scopes: Vec<String>,
    pub match_by: Option<String>,
}

impl Probe {
    /// An empty Types list matches any device
    pub fn wants_device_types(&self) -> bool {
        self.types.is_empty()
            || self.types.iter().any(|wanted| {
                ADVERTISED_TYPES.iter().any(|(ns, local)| {
                    wanted.local == *local
                        && wanted.namespace.as_deref().map_or(true, |n| n == *ns)
                })
            })
    }

    /// Every requested scope must prefix-match one of `advertised`
    pub fn wants_scopes(&self, advertised: &[String]) -> bool {
        self.scopes
            .iter()
            .all(|wanted| advertised.iter().any(|have| scope_matches(wanted, have)))
    }
}

/// RFC 3986 style prefix match on whole path segments
pub fn scope_matches(wanted: &str, have: &str) -> bool {
    let wanted = wanted.trim_end_matches('/');
    let have = have.trim_end_matches('/');
    if wanted.eq_ignore_ascii_case(have) {
        return true;
    }
    have.len() > wanted.len()
        && have.is_char_boundary(wanted.len())
        && have[..wanted.len()].eq_ignore_ascii_case(wanted)
        && have[wanted.len()..].starts_with('/')
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    MessageId,
    Types,
    Scopes,
}

/// Parse a datagram. Ok(None) means well-formed but not a Probe.
pub fn parse_probe(xml: &str) -> Result<Option<Probe>, ProtocolError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut prefixes: HashMap<String, String> = HashMap::new();
    let mut saw_envelope = false;
    let mut in_body = false;
    let mut is_probe = false;
    let mut field: Option<Field> = None;
    let mut probe = Probe::default();
    let mut raw_types = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                collect_prefixes(&e, &mut prefixes);
                let local = e.local_name();
                match local.as_ref() {
                    b"Envelope" => saw_envelope = true,
                    b"Body" => in_body = true,
                    b"Probe" if in_body => is_probe = true,
                    b"MessageID" if !in_body => field = Some(Field::MessageId),
                    b"Types" if is_probe => field = Some(Field::Types),
                    b"Scopes" if is_probe => {
                        probe.match_by = attribute(&e, b"MatchBy");
                        field = Some(Field::Scopes);
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                collect_prefixes(&e, &mut prefixes);
                match e.local_name().as_ref() {
                    b"Envelope" => saw_envelope = true,
                    b"Probe" if in_body => is_probe = true,
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(current) = field {
                    let text = t
                        .unescape()
                        .map_err(|e| ProtocolError::MalformedXml(e.to_string()))?;
                    match current {
                        Field::MessageId => probe.message_id = Some(text.trim().to_string()),
                        Field::Types => {
                            raw_types.push(' ');
                            raw_types.push_str(&text);
                        }
                        Field::Scopes => probe
                            .scopes
                            .extend(text.split_whitespace().map(str::to_string)),
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"Body" => in_body = false,
                b"MessageID" | b"Types" | b"Scopes" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ProtocolError::MalformedXml(e.to_string())),
            _ => {}
        }
    }

    if !saw_envelope {
        return Err(ProtocolError::UnexpectedMessage {
            expected: "SOAP envelope",
        });
    }
    if !is_probe {
        return Ok(None);
    }

    probe.types = raw_types
        .split_whitespace()
        .map(|qname| resolve_qname(qname, &prefixes))
        .collect();
    Ok(Some(probe))
}

fn collect_prefixes(element: &BytesStart<'_>, prefixes: &mut HashMap<String, String>) {
    for attr in element.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        if let Some(prefix) = key.strip_prefix("xmlns:") {
            if let Ok(value) = attr.unescape_value() {
                prefixes.insert(prefix.to_string(), value.to_string());
            }
        }
    }
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name)
        .and_then(|attr| attr.unescape_value().ok())
        .map(|value| value.to_string())
}

fn resolve_qname(qname: &str, prefixes: &HashMap<String, String>) -> QualifiedName {
    match qname.split_once(':') {
        Some((prefix, local)) => QualifiedName {
            namespace: prefixes.get(prefix).cloned(),
            local: local.to_string(),
        },
        None => QualifiedName {
            namespace: None,
            local: qname.to_string(),
        },
    }
}

/// What the device advertises about itself
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    /// urn:uuid form
    pub address: String,
    pub scopes: Vec<String>,
    pub xaddrs: Vec<String>,
    pub metadata_version: u32,
}

/// AppSequence header values for multicast announcements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppSequence {
    pub instance_id: u64,
    pub message_number: u64,
}

fn envelope(header: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{}" xmlns:a="{}" xmlns:d="{}" xmlns:dn="{}" xmlns:tds="{}">
  <s:Header>{}
  </s:Header>
  <s:Body>{}
  </s:Body>
</s:Envelope>"#,
        NS_SOAP_ENV, NS_ADDRESSING, NS_DISCOVERY, NS_NETWORK, NS_DEVICE, header, body
    )
}

fn endpoint_fields(endpoint: &EndpointInfo) -> String {
    format!(
        r#"
      <a:EndpointReference><a:Address>{}</a:Address></a:EndpointReference>
      <d:Types>dn:NetworkVideoTransmitter tds:Device</d:Types>
      <d:Scopes>{}</d:Scopes>
      <d:XAddrs>{}</d:XAddrs>
      <d:MetadataVersion>{}</d:MetadataVersion>"#,
        escape(endpoint.address.as_str()),
        escape(endpoint.scopes.join(" ").as_str()),
        escape(endpoint.xaddrs.join(" ").as_str()),
        endpoint.metadata_version
    )
}

/// Unicast reply to a Probe
pub fn probe_match(message_id: &str, relates_to: &str, endpoint: &EndpointInfo) -> String {
    let header = format!(
        r#"
    <a:MessageID>{}</a:MessageID>
    <a:RelatesTo>{}</a:RelatesTo>
    <a:To>{}</a:To>
    <a:Action>{}</a:Action>"#,
        escape(message_id),
        escape(relates_to),
        ANONYMOUS_TO,
        ACTION_PROBE_MATCHES
    );
    let body = format!(
        r#"
    <d:ProbeMatches>
      <d:ProbeMatch>{}
      </d:ProbeMatch>
    </d:ProbeMatches>"#,
        endpoint_fields(endpoint)
    );
    envelope(&header, &body)
}

fn announcement_header(message_id: &str, action: &str, sequence: AppSequence) -> String {
    format!(
        r#"
    <a:MessageID>{}</a:MessageID>
    <a:To>{}</a:To>
    <a:Action>{}</a:Action>
    <d:AppSequence InstanceId="{}" MessageNumber="{}"/>"#,
        escape(message_id),
        DISCOVERY_TO,
        action,
        sequence.instance_id,
        sequence.message_number
    )
}

/// Multicast announcement sent when the responder starts
pub fn hello(message_id: &str, sequence: AppSequence, endpoint: &EndpointInfo) -> String {
    let body = format!(
        r#"
    <d:Hello>{}
    </d:Hello>"#,
        endpoint_fields(endpoint)
    );
    envelope(&announcement_header(message_id, ACTION_HELLO, sequence), &body)
}

/// Multicast announcement sent when the responder stops
pub fn bye(message_id: &str, sequence: AppSequence, endpoint: &EndpointInfo) -> String {
    let body = format!(
        r#"
    <d:Bye>
      <a:EndpointReference><a:Address>{}</a:Address></a:EndpointReference>
    </d:Bye>"#,
        escape(endpoint.address.as_str())
    );
    envelope(&announcement_header(message_id, ACTION_BYE, sequence), &body)
}
