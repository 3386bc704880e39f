use super::*;
use crate::config::CameraConfig;
use crate::error::ProtocolError;
use crate::identity::CameraIdentity;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROBE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
            xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing"
            xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery"
            xmlns:dn="http://www.onvif.org/ver10/network/wsdl">
  <s:Header>
    <a:MessageID>urn:uuid:0a6dc791-2be6-4991-9af1-454778a1917a</a:MessageID>
    <a:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</a:To>
    <a:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</a:Action>
  </s:Header>
  <s:Body>
    <d:Probe>
      <d:Types>dn:NetworkVideoTransmitter</d:Types>
    </d:Probe>
  </s:Body>
</s:Envelope>"#;

fn probe_with(message_id: &str, types: &str, scopes: &str) -> String {
    format!(
        r#"<e:Envelope xmlns:e="http://www.w3.org/2003/05/soap-envelope"
  xmlns:w="http://schemas.xmlsoap.org/ws/2004/08/addressing"
  xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery"
  xmlns:tds="http://www.onvif.org/ver10/device/wsdl"
  xmlns:x="urn:example:other">
  <e:Header><w:MessageID>{}</w:MessageID></e:Header>
  <e:Body><d:Probe><d:Types>{}</d:Types><d:Scopes>{}</d:Scopes></d:Probe></e:Body>
</e:Envelope>"#,
        message_id, types, scopes
    )
}

fn handler() -> (ProbeHandler, Arc<CameraIdentity>) {
    let mut config = CameraConfig::default();
    config.name = "Front Door".to_string();
    config.model = "VCAM-1".to_string();
    config.uuid = Some("7d3c9a52-0000-4000-8000-000000000001".to_string());
    let identity = Arc::new(CameraIdentity::from_config(&config));
    let handler = ProbeHandler::new(
        Arc::clone(&identity),
        vec!["http://192.168.1.20:8080/onvif/device_service".to_string()],
        Duration::from_secs(5),
    );
    (handler, identity)
}

#[test]
fn test_parse_probe_resolves_type_namespace() {
    let probe = parse_probe(PROBE).unwrap().unwrap();
    assert_eq!(
        probe.message_id.as_deref(),
        Some("urn:uuid:0a6dc791-2be6-4991-9af1-454778a1917a")
    );
    assert_eq!(
        probe.types,
        vec![QualifiedName {
            namespace: Some("http://www.onvif.org/ver10/network/wsdl".to_string()),
            local: "NetworkVideoTransmitter".to_string(),
        }]
    );
    assert!(probe.scopes.is_empty());
    assert!(probe.wants_device_types());
}

#[test]
fn test_non_probe_envelope_is_ignored() {
    let hello = hello(
        "urn:uuid:1",
        AppSequence {
            instance_id: 1,
            message_number: 1,
        },
        &EndpointInfo {
            address: "urn:uuid:2".to_string(),
            scopes: vec![],
            xaddrs: vec![],
            metadata_version: 1,
        },
    );
    assert_eq!(parse_probe(&hello).unwrap(), None);
}

#[test]
fn test_malformed_input_is_an_error() {
    assert!(matches!(
        parse_probe("<s:Envelope><s:Body><d:Probe></s:Body>"),
        Err(ProtocolError::MalformedXml(_))
    ));
    assert!(parse_probe("Probe please").is_err());
}

#[test]
fn test_type_filter() {
    let device = parse_probe(&probe_with("urn:uuid:a", "tds:Device", ""))
        .unwrap()
        .unwrap();
    assert!(device.wants_device_types());

    let other = parse_probe(&probe_with("urn:uuid:b", "x:Printer", ""))
        .unwrap()
        .unwrap();
    assert!(!other.wants_device_types());

    // Right local name in the wrong namespace
    let spoofed = parse_probe(&probe_with("urn:uuid:c", "x:NetworkVideoTransmitter", ""))
        .unwrap()
        .unwrap();
    assert!(!spoofed.wants_device_types());

    let any = parse_probe(&probe_with("urn:uuid:d", "", "")).unwrap().unwrap();
    assert!(any.types.is_empty());
    assert!(any.wants_device_types());
}

#[test]
fn test_scope_prefix_matching() {
    let have = "onvif://www.onvif.org/name/Front_Door";
    assert!(scope_matches("onvif://www.onvif.org/name", have));
    assert!(scope_matches("onvif://www.onvif.org/name/", have));
    assert!(scope_matches(have, have));
    assert!(!scope_matches("onvif://www.onvif.org/na", have));
    assert!(!scope_matches("onvif://www.onvif.org/name/Back_Door", have));
}

#[test]
fn test_probe_match_reply() {
    let (handler, identity) = handler();
    let reply = handler.handle_datagram(PROBE.as_bytes(), Instant::now()).unwrap();

    assert!(reply.contains(
        "<a:RelatesTo>urn:uuid:0a6dc791-2be6-4991-9af1-454778a1917a</a:RelatesTo>"
    ));
    assert!(reply.contains(&format!("<a:Address>{}</a:Address>", identity.uuid)));
    assert!(reply.contains("dn:NetworkVideoTransmitter"));
    assert!(reply.contains("<d:XAddrs>http://192.168.1.20:8080/onvif/device_service</d:XAddrs>"));
    assert!(reply.contains("onvif://www.onvif.org/name/Front_Door"));
    assert!(reply.contains("<d:MetadataVersion>1</d:MetadataVersion>"));
    assert!(reply.contains("/discovery/ProbeMatches</a:Action>"));
}

#[test]
fn test_duplicate_probe_answered_once() {
    let (handler, _) = handler();
    let now = Instant::now();

    assert!(handler.handle_datagram(PROBE.as_bytes(), now).is_some());
    assert!(handler
        .handle_datagram(PROBE.as_bytes(), now + Duration::from_millis(200))
        .is_none());
    // Answered again once the TTL has passed
    assert!(handler
        .handle_datagram(PROBE.as_bytes(), now + Duration::from_secs(6))
        .is_some());
}

#[test]
fn test_probe_without_message_id_is_answered() {
    let (handler, _) = handler();
    let probe = PROBE.replace(
        "<a:MessageID>urn:uuid:0a6dc791-2be6-4991-9af1-454778a1917a</a:MessageID>",
        "",
    );
    let now = Instant::now();

    let first = handler.handle_datagram(probe.as_bytes(), now).unwrap();
    assert!(first.contains("<a:RelatesTo>urn:uuid:"));
    assert!(handler.handle_datagram(probe.as_bytes(), now).is_some());
}

#[test]
fn test_unmatched_scope_gets_no_reply() {
    let (handler, _) = handler();
    let now = Instant::now();

    let wrong = probe_with("urn:uuid:s1", "", "onvif://www.onvif.org/location/mars");
    assert!(handler.handle_datagram(wrong.as_bytes(), now).is_none());

    let right = probe_with(
        "urn:uuid:s2",
        "tds:Device",
        "onvif://www.onvif.org/type onvif://www.onvif.org/hardware/VCAM-1",
    );
    assert!(handler.handle_datagram(right.as_bytes(), now).is_some());
}

#[test]
fn test_garbage_datagrams_are_dropped() {
    let (handler, _) = handler();
    let now = Instant::now();
    assert!(handler.handle_datagram(&[0xff, 0xfe, 0x00], now).is_none());
    assert!(handler.handle_datagram(b"<Envelope><Body>", now).is_none());
    assert!(handler.handle_datagram(b"", now).is_none());
}

#[test]
fn test_rename_bumps_metadata_version() {
    let (handler, identity) = handler();
    assert!(identity.set_name("Back Door"));

    let endpoint = handler.endpoint();
    assert_eq!(endpoint.metadata_version, 2);
    assert!(endpoint
        .scopes
        .contains(&"onvif://www.onvif.org/name/Back_Door".to_string()));

    let reply = handler.handle_datagram(PROBE.as_bytes(), Instant::now()).unwrap();
    assert!(reply.contains("<d:MetadataVersion>2</d:MetadataVersion>"));
}

#[test]
fn test_hello_and_bye_carry_app_sequence() {
    let (handler, identity) = handler();
    let sequence = AppSequence {
        instance_id: 1_700_000_000,
        message_number: 3,
    };

    let hello = hello("urn:uuid:h", sequence, &handler.endpoint());
    assert!(hello.contains(r#"<d:AppSequence InstanceId="1700000000" MessageNumber="3"/>"#));
    assert!(hello.contains("<d:Hello>"));
    assert!(hello.contains("<d:XAddrs>"));

    let bye = bye("urn:uuid:b", sequence, &handler.endpoint());
    assert!(bye.contains("<d:Bye>"));
    assert!(bye.contains(&identity.uuid));
    assert!(!bye.contains("<d:XAddrs>"));
}

#[test]
fn test_reply_text_is_escaped() {
    let endpoint = EndpointInfo {
        address: "urn:uuid:1".to_string(),
        scopes: vec!["onvif://www.onvif.org/name/A&B".to_string()],
        xaddrs: vec![],
        metadata_version: 1,
    };
    let reply = probe_match("urn:uuid:m", "urn:uuid:<r>", &endpoint);
    assert!(reply.contains("A&amp;B"));
    assert!(reply.contains("urn:uuid:&lt;r&gt;"));
}

#[test]
fn test_cache_expiry_and_purge() {
    let mut cache = ProbeMatchCache::new(Duration::from_secs(5));
    let now = Instant::now();
    assert!(cache.check_and_insert("a", now));
    assert!(cache.check_and_insert("b", now + Duration::from_secs(3)));
    assert!(!cache.check_and_insert("a", now + Duration::from_secs(1)));

    cache.purge(now + Duration::from_secs(6));
    assert_eq!(cache.len(), 1);
}
