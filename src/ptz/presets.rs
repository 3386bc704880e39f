use super::state::{PtzPosition, PtzPreset};
use crate::error::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const HOME_PRESET_TOKEN: &str = "home";

/// JSON file of presets keyed by token
#[derive(Debug, Clone)]
pub struct PresetStore {
    path: PathBuf,
}

impl PresetStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load presets; a missing file yields just the home preset
    pub fn load(&self) -> Result<BTreeMap<String, PtzPreset>> {
        if !self.path.exists() {
            info!(
                "Preset file {} not found, starting with home preset",
                self.path.display()
            );
            return Ok(Self::seed());
        }

        let raw = fs::read_to_string(&self.path)?;
        let mut presets: BTreeMap<String, PtzPreset> = serde_json::from_str(&raw)?;

        // Key is authoritative for the token
        for (token, preset) in presets.iter_mut() {
            preset.token = token.clone();
        }

        debug!("Loaded {} presets from {}", presets.len(), self.path.display());
        Ok(presets)
    }

    /// Write the full map through a temp file and rename
    pub fn save(&self, presets: &BTreeMap<String, PtzPreset>) -> Result<()> {
        let json = serde_json::to_string_pretty(presets)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Saved {} presets to {}", presets.len(), self.path.display());
        Ok(())
    }

    pub fn seed() -> BTreeMap<String, PtzPreset> {
        let mut presets = BTreeMap::new();
        presets.insert(
            HOME_PRESET_TOKEN.to_string(),
            PtzPreset::new(HOME_PRESET_TOKEN, "Home", PtzPosition::HOME),
        );
        presets
    }
}
