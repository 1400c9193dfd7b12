//! Version manifest.
//!
//! A JSON document listing every source version a downgrade patch exists
//! for:
//!
//! ```json
//! { "versions": [ { "SV": "1.20.0", "SourceByteSize": 123, "download": "https://..." } ] }
//! ```
//!
//! Entry order is significant: the first compatible record is the one used.

use crate::config::Config;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Installed version the patch applies to
    #[serde(rename = "SV")]
    pub source_version: String,

    /// Exact size of the installed APK the patch was built against
    #[serde(rename = "SourceByteSize")]
    pub source_byte_size: u64,

    /// Where the patch payload is downloaded from
    #[serde(rename = "download")]
    pub download: String,

    /// Version the patched APK ends up at, when the manifest says
    #[serde(rename = "TV", default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
}

impl VersionRecord {
    pub fn matches(&self, version: &str, byte_size: u64) -> bool {
        self.source_version == version && self.source_byte_size == byte_size
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    pub versions: Vec<VersionRecord>,
}

impl VersionManifest {
    pub fn new(versions: Vec<VersionRecord>) -> Self {
        Self { versions }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| BridgeError::Manifest(e.to_string()))
    }

    pub async fn load_file(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BridgeError::Manifest(format!("{}: {}", path.display(), e)))?;
        let manifest = Self::from_json(&text)?;
        debug!(
            "Loaded {} manifest entries from {}",
            manifest.versions.len(),
            path.display()
        );
        Ok(manifest)
    }

    pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<Self> {
        let response = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BridgeError::Manifest(format!("GET {}: {}", url, e)))?;
        let text = response
            .text()
            .await
            .map_err(|e| BridgeError::Manifest(format!("GET {}: {}", url, e)))?;
        let manifest = Self::from_json(&text)?;
        info!("Fetched {} manifest entries", manifest.versions.len());
        Ok(manifest)
    }

    /// Local file when configured, otherwise the manifest URL
    pub async fn load(config: &Config, client: &reqwest::Client) -> Result<Self> {
        match &config.manifest_path {
            Some(path) => Self::load_file(path).await,
            None => Self::fetch(client, &config.manifest_url).await,
        }
    }

    /// Records for `version` at exactly `byte_size`, in manifest order
    pub fn compatible(&self, version: &str, byte_size: u64) -> Vec<VersionRecord> {
        self.versions
            .iter()
            .filter(|record| record.matches(version, byte_size))
            .cloned()
            .collect()
    }
}
