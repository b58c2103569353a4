//! Persisted user settings
//!
//! Stored as a fixed-layout binary blob: the `RPST` magic, a little-endian
//! u16 layout version, then the `bincode` body. Every load validates the
//! bounds below; a blob that fails is discarded and defaults are restored.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Error, Result};

const MAGIC: &[u8; 4] = b"RPST";
const LAYOUT_VERSION: u16 = 1;

pub const BITRATE_MIN_KBPS: u32 = 1_000;
pub const BITRATE_MAX_KBPS: u32 = 15_000;
pub const MTU_MIN: u16 = 1_200;
pub const MTU_MAX: u16 = 1_500;
pub const DEADZONE_MAX: f32 = 50.0;
pub const SENSITIVITY_MIN: f32 = 50.0;
pub const SENSITIVITY_MAX: f32 = 150.0;

/// Stream quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityPreset {
    Performance,
    Balanced,
    Quality,
    Custom,
}

/// Stream resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

impl Resolution {
    pub const SUPPORTED: [Resolution; 5] = [
        Resolution { width: 640, height: 360 },
        Resolution { width: 720, height: 480 },
        Resolution { width: 960, height: 540 },
        Resolution { width: 1280, height: 720 },
        Resolution { width: 1920, height: 1080 },
    ];

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }
}

/// Controller button layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ButtonMapping {
    #[default]
    Default,
    /// Cross and circle exchanged
    SwapConfirm,
}

/// User settings persisted between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub quality: QualityPreset,
    pub resolution: Resolution,
    pub fps: u8,
    pub bitrate_kbps: u32,
    pub hdr: bool,
    pub vsync: bool,
    pub auto_connect: bool,
    pub wake_on_lan: bool,
    pub mtu: u16,
    /// Stick deadzone in percent
    pub deadzone: f32,
    /// Stick sensitivity in percent
    pub sensitivity: f32,
    pub button_mapping: ButtonMapping,
    pub version: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            quality: QualityPreset::Balanced,
            resolution: Resolution { width: 720, height: 480 },
            fps: 60,
            bitrate_kbps: 8_000,
            hdr: false,
            vsync: true,
            auto_connect: false,
            wake_on_lan: true,
            mtu: 1_500,
            deadzone: 15.0,
            sensitivity: 85.0,
            button_mapping: ButtonMapping::Default,
            version: LAYOUT_VERSION,
        }
    }
}

/// A single bound violation
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsIssue {
    pub field: &'static str,
    pub reason: String,
}

/// Validator outcome
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid,
    Invalid(Vec<SettingsIssue>),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }
}

impl Settings {
    /// Check every bounded field
    pub fn validate(&self) -> Validation {
        let mut issues = Vec::new();
        let mut check = |ok: bool, field: &'static str, reason: String| {
            if !ok {
                issues.push(SettingsIssue { field, reason });
            }
        };

        check(
            (BITRATE_MIN_KBPS..=BITRATE_MAX_KBPS).contains(&self.bitrate_kbps),
            "bitrate_kbps",
            format!("{} outside {}..={}", self.bitrate_kbps, BITRATE_MIN_KBPS, BITRATE_MAX_KBPS),
        );
        check(
            (MTU_MIN..=MTU_MAX).contains(&self.mtu),
            "mtu",
            format!("{} outside {}..={}", self.mtu, MTU_MIN, MTU_MAX),
        );
        check(
            self.deadzone.is_finite() && (0.0..=DEADZONE_MAX).contains(&self.deadzone),
            "deadzone",
            format!("{} outside 0..={}", self.deadzone, DEADZONE_MAX),
        );
        check(
            self.sensitivity.is_finite() && (SENSITIVITY_MIN..=SENSITIVITY_MAX).contains(&self.sensitivity),
            "sensitivity",
            format!("{} outside {}..={}", self.sensitivity, SENSITIVITY_MIN, SENSITIVITY_MAX),
        );
        check(
            matches!(self.fps, 30 | 60),
            "fps",
            format!("{} is not 30 or 60", self.fps),
        );
        check(
            self.resolution.is_supported(),
            "resolution",
            format!("{}x{} is not supported", self.resolution.width, self.resolution.height),
        );
        check(
            self.version == LAYOUT_VERSION,
            "version",
            format!("unknown settings version {}", self.version),
        );

        if issues.is_empty() {
            Validation::Valid
        } else {
            Validation::Invalid(issues)
        }
    }

    /// Encode the binary blob
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        let mut blob = Vec::with_capacity(MAGIC.len() + 2 + body.len());
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&LAYOUT_VERSION.to_le_bytes());
        blob.extend_from_slice(&body);
        Ok(blob)
    }

    /// Decode and validate a binary blob
    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        let body = blob
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| Error::InvalidData("settings blob has no magic".into()))?;
        let (version, body) = body
            .split_first_chunk::<2>()
            .ok_or_else(|| Error::InvalidData("settings blob truncated".into()))?;
        let version = u16::from_le_bytes(*version);
        if version != LAYOUT_VERSION {
            return Err(Error::InvalidData(format!("unsupported settings layout {version}")));
        }

        let settings: Settings =
            bincode::deserialize(body).map_err(|e| Error::InvalidData(format!("settings body: {e}")))?;
        match settings.validate() {
            Validation::Valid => Ok(settings),
            Validation::Invalid(issues) => Err(Error::InvalidData(format!(
                "settings out of bounds: {}",
                issues.iter().map(|i| i.field).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// JSON form
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()).into())
    }

    /// Parse and validate the JSON form
    pub fn from_json(text: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Validation::Invalid(issues) = settings.validate() {
            return Err(ConfigError::InvalidValue {
                field: issues[0].field,
                reason: issues[0].reason.clone(),
            }
            .into());
        }
        Ok(settings)
    }

    /// Platform-specific settings file
    pub fn default_path() -> Result<PathBuf> {
        directories::ProjectDirs::from("com", "remoteplay", "remote-play-core")
            .map(|dirs| dirs.data_dir().join("settings.bin"))
            .ok_or_else(|| ConfigError::NoConfigDir.into())
    }

    /// Load strictly, surfacing any read or validation failure
    pub fn try_load(path: &Path) -> Result<Self> {
        let blob = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_bytes(&blob)
    }

    /// Load, restoring defaults when the blob is missing or invalid
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Settings at {} rejected ({}), restoring defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Persist the blob
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Validation::Invalid(issues) = self.validate() {
            return Err(Error::InvalidParam(format!("refusing to save invalid settings: {issues:?}")));
        }
        let blob = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, blob).map_err(|source| {
            ConfigError::Write {
                path: path.display().to_string(),
                source,
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("rp-settings-{}.bin", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_defaults_roundtrip_through_blob() {
        let defaults = Settings::default();
        assert_eq!(defaults.quality, QualityPreset::Balanced);
        assert_eq!(defaults.resolution, Resolution { width: 720, height: 480 });

        let blob = defaults.to_bytes().unwrap();
        let loaded = Settings::from_bytes(&blob).unwrap();
        assert_eq!(loaded, defaults);
        assert_eq!(loaded.validate(), Validation::Valid);
    }

    #[test]
    fn test_blob_layout_is_fixed() {
        let a = Settings::default().to_bytes().unwrap();
        let mut other = Settings::default();
        other.bitrate_kbps = 15_000;
        other.deadzone = 0.0;
        let b = other.to_bytes().unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(&a[..4], b"RPST");
    }

    #[test]
    fn test_bitrate_bounds() {
        let mut s = Settings::default();
        s.bitrate_kbps = 1_000;
        assert!(s.validate().is_valid());
        s.bitrate_kbps = 999;
        assert!(!s.validate().is_valid());
        s.bitrate_kbps = 15_000;
        assert!(s.validate().is_valid());
        s.bitrate_kbps = 15_001;
        assert!(!s.validate().is_valid());
    }

    #[test]
    fn test_other_bounds() {
        let mut s = Settings::default();
        s.mtu = 1_199;
        s.deadzone = 51.0;
        s.sensitivity = 49.0;
        match s.validate() {
            Validation::Invalid(issues) => {
                let fields: Vec<_> = issues.iter().map(|i| i.field).collect();
                assert_eq!(fields, vec!["mtu", "deadzone", "sensitivity"]);
            }
            Validation::Valid => panic!("expected invalid settings"),
        }
    }

    #[test]
    fn test_invalid_blob_restores_defaults() {
        let path = temp_path();
        let mut s = Settings::default();
        s.bitrate_kbps = 20_000;
        // Bypass `save` validation to simulate a corrupted file
        let mut blob = Settings::default().to_bytes().unwrap();
        let body = bincode::serialize(&s).unwrap();
        blob.truncate(6);
        blob.extend_from_slice(&body);
        std::fs::write(&path, blob).unwrap();

        assert!(Settings::try_load(&path).is_err());
        assert_eq!(Settings::load(&path), Settings::default());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Settings::from_bytes(b"nope").is_err());
        assert!(Settings::from_bytes(b"RPST").is_err());
        assert!(Settings::from_bytes(b"RPST\x01\x00\x00").is_err());
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path();
        let mut s = Settings::default();
        s.hdr = true;
        s.button_mapping = ButtonMapping::SwapConfirm;
        s.save(&path).unwrap();
        assert_eq!(Settings::load(&path), s);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut s = Settings::default();
        s.quality = QualityPreset::Quality;
        s.resolution = Resolution { width: 1280, height: 720 };
        let json = s.to_json().unwrap();
        assert_eq!(Settings::from_json(&json).unwrap(), s);
    }
}
