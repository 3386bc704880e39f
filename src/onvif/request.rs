use crate::error::ProtocolError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use std::fmt;

pub const NS_DEVICE: &str = "http://www.onvif.org/ver10/device/wsdl";
pub const NS_MEDIA: &str = "http://www.onvif.org/ver10/media/wsdl";
pub const NS_PTZ: &str = "http://www.onvif.org/ver20/ptz/wsdl";
pub const NS_SCHEMA: &str = "http://www.onvif.org/ver10/schema";

/// ONVIF service a request is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Device,
    Media,
    Ptz,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::Device, Service::Media, Service::Ptz];

    pub fn namespace(&self) -> &'static str {
        match self {
            Service::Device => NS_DEVICE,
            Service::Media => NS_MEDIA,
            Service::Ptz => NS_PTZ,
        }
    }

    pub fn from_namespace(namespace: &str) -> Option<Self> {
        match namespace.trim_end_matches('/') {
            NS_DEVICE => Some(Service::Device),
            NS_MEDIA | "http://www.onvif.org/ver20/media/wsdl" => Some(Service::Media),
            NS_PTZ => Some(Service::Ptz),
            _ => None,
        }
    }

    /// Path segment under /onvif/
    pub fn path(&self) -> &'static str {
        match self {
            Service::Device => "device_service",
            Service::Media => "media_service",
            Service::Ptz => "ptz_service",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Service::Device => "device",
            Service::Media => "media",
            Service::Ptz => "ptz",
        };
        f.write_str(name)
    }
}

/// Minimal namespace-resolved element tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub namespace: Option<String>,
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn first_child(&self) -> Option<&XmlElement> {
        self.children.first()
    }

    /// First descendant with local name `name`, depth first
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// Follow a chain of direct children
    pub fn path(&self, names: &[&str]) -> Option<&XmlElement> {
        names.iter().try_fold(self, |element, name| element.child(name))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> &str {
        self.text.trim()
    }
}

fn element_from(namespace: ResolveResult<'_>, start: &BytesStart<'_>) -> Result<XmlElement, ProtocolError> {
    let namespace = match namespace {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).to_string()),
        ResolveResult::Unbound => None,
        ResolveResult::Unknown(prefix) => {
            return Err(ProtocolError::MalformedXml(format!(
                "undeclared namespace prefix '{}'",
                String::from_utf8_lossy(&prefix)
            )))
        }
    };

    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ProtocolError::MalformedXml(e.to_string()))?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|e| ProtocolError::MalformedXml(e.to_string()))?;
        attributes.push((
            String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string(),
            value.to_string(),
        ));
    }

    Ok(XmlElement {
        namespace,
        name: String::from_utf8_lossy(start.local_name().as_ref()).to_string(),
        attributes,
        text: String::new(),
        children: Vec::new(),
    })
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), ProtocolError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(ProtocolError::MalformedXml("multiple root elements".to_string())),
    }
}

/// Parse a whole document into a tree
pub fn parse_document(xml: &str) -> Result<XmlElement, ProtocolError> {
    let mut reader = NsReader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root = None;

    loop {
        match reader.read_resolved_event() {
            Ok((ns, Event::Start(e))) => {
                let element = element_from(ns, &e)?;
                stack.push(element);
            }
            Ok((ns, Event::Empty(e))) => {
                let element = element_from(ns, &e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok((_, Event::Text(t))) => {
                if let Some(top) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| ProtocolError::MalformedXml(e.to_string()))?;
                    top.text.push_str(&text);
                }
            }
            Ok((_, Event::CData(c))) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Ok((_, Event::End(_))) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ProtocolError::MalformedXml("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok((_, Event::Eof)) => break,
            Err(e) => return Err(ProtocolError::MalformedXml(e.to_string())),
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ProtocolError::MalformedXml(
            "unexpected end of document".to_string(),
        ));
    }
    root.ok_or_else(|| ProtocolError::MalformedXml("empty document".to_string()))
}

/// `(namespace, operation)` from a SOAPAction URI
pub fn split_action(action: &str) -> Option<(&str, &str)> {
    let action = action.trim().trim_matches('"');
    let (namespace, operation) = action.rsplit_once('/')?;
    if operation.is_empty() {
        return None;
    }
    Some((namespace, operation))
}

/// The `action` parameter of a SOAP 1.2 Content-Type
pub fn action_from_content_type(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("action")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// A parsed SOAP request
#[derive(Debug, Clone)]
pub struct SoapRequest {
    /// None when neither the action URI nor the body namespace name a service
    pub service: Option<Service>,
    pub operation: String,
    pub header: Option<XmlElement>,
    /// The operation element inside Body
    pub body: XmlElement,
}

impl SoapRequest {
    pub fn parse(xml: &str, action: Option<&str>) -> Result<Self, ProtocolError> {
        let root = parse_document(xml)?;
        if root.name != "Envelope" {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "SOAP envelope",
            });
        }

        let header = root.child("Header").cloned();
        let body = root
            .child("Body")
            .and_then(|body| body.first_child())
            .cloned()
            .ok_or_else(|| ProtocolError::MissingElement("Body".to_string()))?;

        let (service, operation) = match action.and_then(split_action) {
            Some((namespace, operation)) => (
                Service::from_namespace(namespace)
                    .or_else(|| body.namespace.as_deref().and_then(Service::from_namespace)),
                operation.to_string(),
            ),
            None => (
                body.namespace.as_deref().and_then(Service::from_namespace),
                body.name.clone(),
            ),
        };

        Ok(Self {
            service,
            operation,
            header,
            body,
        })
    }

    /// Text of the first descendant of the operation element named `name`
    pub fn value(&self, name: &str) -> Option<&str> {
        self.body
            .find(name)
            .map(XmlElement::text)
            .filter(|text| !text.is_empty())
    }

    pub fn require(&self, name: &str) -> Result<&str, ProtocolError> {
        self.value(name)
            .ok_or_else(|| ProtocolError::MissingElement(name.to_string()))
    }
}
