use crate::config::CameraConfig;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// Device identity shared by discovery and the SOAP service.
///
/// Everything except the display name is fixed at construction. Renaming bumps
/// the metadata version so discovery clients refresh cached scopes.
#[derive(Debug)]
pub struct CameraIdentity {
    pub uuid: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub hardware_id: String,
    name: RwLock<String>,
    metadata_version: AtomicU32,
}

impl CameraIdentity {
    pub fn from_config(config: &CameraConfig) -> Self {
        let uuid = match config.uuid.as_deref() {
            Some(id) if id.starts_with("urn:uuid:") => id.to_string(),
            Some(id) if !id.is_empty() => format!("urn:uuid:{}", id),
            _ => format!("urn:uuid:{}", Uuid::new_v4()),
        };

        Self {
            uuid,
            manufacturer: config.manufacturer.clone(),
            model: config.model.clone(),
            serial: config.serial.clone(),
            firmware: config.firmware.clone(),
            hardware_id: config.hardware_id.clone(),
            name: RwLock::new(config.name.clone()),
            metadata_version: AtomicU32::new(1),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Returns true when the name actually changed
    pub fn set_name(&self, name: &str) -> bool {
        let mut current = self.name.write();
        if *current == name {
            return false;
        }
        *current = name.to_string();
        self.metadata_version.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn metadata_version(&self) -> u32 {
        self.metadata_version.load(Ordering::SeqCst)
    }

    /// ONVIF scope URIs advertised in discovery and GetScopes
    pub fn scopes(&self) -> Vec<String> {
        vec![
            "onvif://www.onvif.org/type/video_encoder".to_string(),
            "onvif://www.onvif.org/type/ptz".to_string(),
            "onvif://www.onvif.org/Profile/Streaming".to_string(),
            format!("onvif://www.onvif.org/hardware/{}", scope_segment(&self.model)),
            format!("onvif://www.onvif.org/name/{}", scope_segment(&self.name())),
            "onvif://www.onvif.org/location/anywhere".to_string(),
        ]
    }
}

/// Scope path segments cannot carry spaces
fn scope_segment(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_whitespace() || c == '/' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_normalized() {
        let mut config = CameraConfig::default();
        config.uuid = Some("1234".to_string());
        assert_eq!(CameraIdentity::from_config(&config).uuid, "urn:uuid:1234");

        config.uuid = None;
        assert!(CameraIdentity::from_config(&config).uuid.starts_with("urn:uuid:"));
    }

    #[test]
    fn test_rename_bumps_metadata_version() {
        let identity = CameraIdentity::from_config(&CameraConfig::default());
        let before = identity.metadata_version();

        assert!(identity.set_name("Garage Cam"));
        assert_eq!(identity.metadata_version(), before + 1);
        assert!(!identity.set_name("Garage Cam"));
        assert_eq!(identity.metadata_version(), before + 1);

        assert!(identity
            .scopes()
            .contains(&"onvif://www.onvif.org/name/Garage_Cam".to_string()));
    }
}
