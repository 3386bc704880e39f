mod cache;
mod messages;
mod responder;
mod socket;
#[cfg(test)]
mod tests;

pub use cache::ProbeMatchCache;
pub use messages::{
    bye, hello, parse_probe, probe_match, scope_matches, AppSequence, EndpointInfo, Probe,
    QualifiedName,
};
pub use responder::{DiscoveryResponder, ProbeHandler};
pub use socket::{MULTICAST_V4, MULTICAST_V6, WS_DISCOVERY_PORT};
