mod auth;
mod request;
mod server;
mod service;
pub mod templates;

pub use auth::{compute_digest, Authenticator, PasswordKind, UsernameToken, MAX_TOKEN_AGE_SECS};
pub use request::{
    action_from_content_type, parse_document, split_action, Service, SoapRequest, XmlElement,
};
pub use server::{router, OnvifServer, OnvifServerBuilder, ServerState, SOAP_CONTENT_TYPE};
pub use service::{Fault, FaultCode, OnvifService, OnvifServiceBuilder, SoapResponse};
