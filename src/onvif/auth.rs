use super::request::XmlElement;
use crate::config::AuthConfig;
use crate::error::ProtocolError;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

const PASSWORD_DIGEST_SUFFIX: &str = "#PasswordDigest";
const PASSWORD_TEXT_SUFFIX: &str = "#PasswordText";

/// Clock skew tolerated for tokens created in the future
const FUTURE_TOLERANCE_SECS: i64 = 30;

/// Longest accepted token age; larger configured values are clamped
pub const MAX_TOKEN_AGE_SECS: u64 = 365 * 24 * 60 * 60;

/// Operations answered without credentials so clients can sync clocks first
pub const UNAUTHENTICATED_OPERATIONS: &[&str] = &["GetSystemDateAndTime"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordKind {
    Digest,
    Text,
}

/// WS-Security UsernameToken lifted from a SOAP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameToken {
    pub username: String,
    pub password: String,
    pub kind: PasswordKind,
    pub nonce: Option<String>,
    pub created: Option<String>,
}

impl UsernameToken {
    pub fn from_header(header: &XmlElement) -> Result<Self, ProtocolError> {
        let token = header
            .find("Security")
            .and_then(|security| security.find("UsernameToken"))
            .ok_or_else(|| ProtocolError::NotAuthorized("missing UsernameToken".to_string()))?;

        let username = token
            .child("Username")
            .map(|e| e.text().to_string())
            .ok_or_else(|| ProtocolError::NotAuthorized("missing Username".to_string()))?;
        let password_el = token
            .child("Password")
            .ok_or_else(|| ProtocolError::NotAuthorized("missing Password".to_string()))?;

        // Type defaults to PasswordText when absent
        let kind = match password_el.attr("Type") {
            Some(t) if t.ends_with(PASSWORD_DIGEST_SUFFIX) => PasswordKind::Digest,
            Some(t) if t.ends_with(PASSWORD_TEXT_SUFFIX) => PasswordKind::Text,
            None => PasswordKind::Text,
            Some(other) => {
                return Err(ProtocolError::NotAuthorized(format!(
                    "unsupported password type '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            username,
            password: password_el.text().to_string(),
            kind,
            nonce: token.child("Nonce").map(|e| e.text().to_string()),
            created: token.child("Created").map(|e| e.text().to_string()),
        })
    }
}

/// `base64(sha1(nonce || created || password))`
pub fn compute_digest(nonce_b64: &str, created: &str, password: &str) -> Result<String, ProtocolError> {
    let nonce = STANDARD
        .decode(nonce_b64)
        .map_err(|_| ProtocolError::NotAuthorized("invalid nonce encoding".to_string()))?;

    let mut hasher = Sha1::new();
    hasher.update(&nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    Ok(STANDARD.encode(hasher.finalize()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Validates UsernameTokens against the single configured account
#[derive(Debug, Clone)]
pub struct Authenticator {
    username: String,
    password: String,
    max_age: Duration,
}

impl Authenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>, max_age_secs: u64) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            max_age: Duration::seconds(max_age_secs.min(MAX_TOKEN_AGE_SECS) as i64),
        }
    }

    /// None when authentication is disabled
    pub fn from_config(config: &AuthConfig) -> Option<Self> {
        config.enabled.then(|| {
            Self::new(
                config.username.clone(),
                config.password.clone(),
                config.max_token_age_secs,
            )
        })
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn requires_auth(operation: &str) -> bool {
        !UNAUTHENTICATED_OPERATIONS.contains(&operation)
    }

    pub fn verify(&self, header: Option<&XmlElement>, now: DateTime<Utc>) -> Result<(), ProtocolError> {
        let header =
            header.ok_or_else(|| ProtocolError::NotAuthorized("missing Security header".to_string()))?;
        let token = UsernameToken::from_header(header)?;

        if !constant_time_eq(&token.username, &self.username) {
            return Err(ProtocolError::NotAuthorized("invalid credentials".to_string()));
        }

        match token.kind {
            PasswordKind::Text => {
                if !constant_time_eq(&token.password, &self.password) {
                    return Err(ProtocolError::NotAuthorized("invalid credentials".to_string()));
                }
            }
            PasswordKind::Digest => {
                let nonce = token
                    .nonce
                    .as_deref()
                    .ok_or_else(|| ProtocolError::NotAuthorized("missing Nonce".to_string()))?;
                let created = token
                    .created
                    .as_deref()
                    .ok_or_else(|| ProtocolError::NotAuthorized("missing Created".to_string()))?;

                self.check_freshness(created, now)?;

                let expected = compute_digest(nonce, created, &self.password)?;
                if !constant_time_eq(&token.password, &expected) {
                    return Err(ProtocolError::NotAuthorized("invalid credentials".to_string()));
                }
            }
        }
        Ok(())
    }

    fn check_freshness(&self, created: &str, now: DateTime<Utc>) -> Result<(), ProtocolError> {
        let created = DateTime::parse_from_rfc3339(created)
            .map_err(|_| ProtocolError::NotAuthorized("invalid Created timestamp".to_string()))?
            .with_timezone(&Utc);

        let age = now.signed_duration_since(created);
        if age < -Duration::seconds(FUTURE_TOLERANCE_SECS) {
            return Err(ProtocolError::NotAuthorized(
                "Created timestamp is in the future".to_string(),
            ));
        }
        if age > self.max_age {
            return Err(ProtocolError::NotAuthorized("token expired".to_string()));
        }
        Ok(())
    }
}
