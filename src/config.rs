//! Configuration file handling.
//!
//! Settings live in `~/.config/quest-downgrade/config.toml`. Every field is
//! optional; the CLI and environment override whatever the file provides.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Package whose APK is inspected and patched.
pub const DEFAULT_APP_ID: &str = "com.beatgames.beatsaber";

/// Published list of known source versions and their patch payloads.
pub const DEFAULT_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/ComputerElite/APKDowngrader/main/versions.json";

/// Identity appended to the public key shown on the device.
pub const DEFAULT_KEY_SERVICE: &str = "quest-downgrade";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Android package id of the installed application
    pub app_id: String,

    /// Where the version manifest is fetched from
    pub manifest_url: String,

    /// Local manifest file, used instead of `manifest_url` when set
    pub manifest_path: Option<PathBuf>,

    /// Directory patched APKs are written to
    pub output_dir: PathBuf,

    /// Private key used for ADB authentication
    pub key_path: Option<PathBuf>,

    /// Name shown next to the key in the on-device prompt
    pub key_identity: Option<String>,

    /// Serial of the device to use when several are attached
    pub serial: Option<String>,

    /// Connect to `host:port` over TCP instead of USB
    pub tcp_address: Option<String>,

    /// xdelta3 executable used to apply patches
    pub xdelta_program: PathBuf,

    /// How long to wait for the operator to accept the key on-device
    pub auth_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            manifest_path: None,
            output_dir: PathBuf::from("."),
            key_path: None,
            key_identity: None,
            serial: None,
            tcp_address: None,
            xdelta_program: PathBuf::from("xdelta3"),
            auth_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Default config file location (~/.config/quest-downgrade/config.toml)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(DEFAULT_KEY_SERVICE).join("config.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// used if present and built-in defaults otherwise.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolved key location (~/.config/quest-downgrade/adbkey by default)
    pub fn key_path(&self) -> Option<PathBuf> {
        self.key_path.clone().or_else(|| {
            dirs::config_dir().map(|dir| dir.join(DEFAULT_KEY_SERVICE).join("adbkey"))
        })
    }

    /// `quest-downgrade@<host>` unless configured otherwise
    pub fn key_identity(&self) -> String {
        self.key_identity.clone().unwrap_or_else(|| {
            let host = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string());
            format!("{}@{}", DEFAULT_KEY_SERVICE, host)
        })
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}
