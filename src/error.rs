use thiserror::Error;

#[derive(Error, Debug)]
pub enum VcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unknown {kind} token '{token}'")]
    NotFound { kind: &'static str, token: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration apply failed: {message}")]
    ConfigApply { message: String },

    #[error("{component} did not stop within {timeout_ms}ms")]
    ShutdownTimeout { component: String, timeout_ms: u64 },

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

/// Malformed or unsupported discovery/SOAP input
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed XML: {0}")]
    MalformedXml(String),

    #[error("Not a {expected} message")]
    UnexpectedMessage { expected: &'static str },

    #[error("Missing element: {0}")]
    MissingElement(String),

    #[error("Invalid value for {field}: '{value}'")]
    InvalidValue { field: String, value: String },

    #[error("Action not supported: {0}")]
    ActionNotSupported(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),
}

/// Failures inside the streaming pipeline
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{backend} backend unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("{backend} backend not ready within {timeout_ms}ms")]
    ReadinessTimeout { backend: String, timeout_ms: u64 },

    #[error("Child process '{program}' failed: {message}")]
    ChildProcess { program: String, message: String },

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Transport write failed: {0}")]
    Write(String),

    #[error("No active backend for profile '{0}'")]
    NoActiveBackend(String),
}

impl VcamError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(kind: &'static str, token: S) -> Self {
        Self::NotFound {
            kind,
            token: token.into(),
        }
    }

    pub fn config_apply<S: Into<String>>(message: S) -> Self {
        Self::ConfigApply {
            message: message.into(),
        }
    }

    /// Errors that leave the service running and are reported to the caller only
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::NotFound { .. }
                | Self::Backend(_)
                | Self::ConfigApply { .. }
                | Self::ShutdownTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VcamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(VcamError::not_found("preset", "p1").is_recoverable());
        assert!(VcamError::from(ProtocolError::MalformedXml("eof".into())).is_recoverable());
        assert!(VcamError::from(BackendError::NoActiveBackend("main".into())).is_recoverable());
        assert!(!VcamError::system("boom").is_recoverable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = VcamError::component("relay", "exited");
        assert_eq!(err.to_string(), "Component error in relay: exited");

        let err = VcamError::not_found("preset", "door");
        assert_eq!(err.to_string(), "Unknown preset token 'door'");
    }
}
