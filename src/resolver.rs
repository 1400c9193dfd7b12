//! Resolves which downgrade patches apply to the installed application.
//!
//! The installed version and APK size come from on-device commands whose
//! text output is parsed here:
//!
//! - `dumpsys package <app>`: first `versionName=<token>`
//! - `pm path <app>`: `package:<path>`
//! - `du -b <path> | awk '{print $1}'`: size in bytes

use crate::error::Result;
use crate::manifest::{VersionManifest, VersionRecord};
use crate::services::shell::RemoteShell;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// What is installed on the device right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledApp {
    pub version: String,
    pub apk_path: String,
    pub byte_size: u64,
}

pub fn parse_version_name(output: &str) -> Option<String> {
    static VERSION_NAME: OnceLock<Option<Regex>> = OnceLock::new();
    let re = VERSION_NAME
        .get_or_init(|| Regex::new(r"versionName=(\S+)").ok())
        .as_ref()?;
    re.captures(output).map(|c| c[1].to_string())
}

pub fn parse_package_path(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("package:"))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
}

pub fn parse_byte_size(output: &str) -> Option<u64> {
    let digits: String = output
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

pub struct VersionResolver {
    shell: Arc<dyn RemoteShell>,
    app_id: String,
    manifest: Arc<VersionManifest>,
}

impl std::fmt::Debug for VersionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionResolver")
            .field("app_id", &self.app_id)
            .field("manifest_entries", &self.manifest.versions.len())
            .finish()
    }
}

impl VersionResolver {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        app_id: impl Into<String>,
        manifest: Arc<VersionManifest>,
    ) -> Self {
        Self {
            shell,
            app_id: app_id.into(),
            manifest,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn manifest(&self) -> &VersionManifest {
        &self.manifest
    }

    async fn stdout_of(&self, command: &str) -> Result<String> {
        let output = self.shell.run_command(command).await?;
        if !output.success() {
            warn!(
                "`{}` exited with {:?}: {}",
                command,
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output.stdout)
    }

    /// `None` when the app is not installed
    pub async fn installed_version(&self) -> Result<Option<String>> {
        let out = self
            .stdout_of(&format!("dumpsys package {}", self.app_id))
            .await?;
        Ok(parse_version_name(&out))
    }

    pub async fn apk_path(&self) -> Result<Option<String>> {
        let out = self.stdout_of(&format!("pm path {}", self.app_id)).await?;
        Ok(parse_package_path(&out))
    }

    pub async fn installed_byte_size(&self) -> Result<Option<u64>> {
        match self.apk_path().await? {
            Some(path) => self.byte_size_of(&path).await,
            None => Ok(None),
        }
    }

    async fn byte_size_of(&self, path: &str) -> Result<Option<u64>> {
        let out = self
            .stdout_of(&format!("du -b {} | awk '{{print $1}}'", path))
            .await?;
        Ok(parse_byte_size(&out))
    }

    /// Version, path and size together; `None` if any of them is missing
    pub async fn installed_app(&self) -> Result<Option<InstalledApp>> {
        let Some(version) = self.installed_version().await? else {
            return Ok(None);
        };
        let Some(apk_path) = self.apk_path().await? else {
            return Ok(None);
        };
        let Some(byte_size) = self.byte_size_of(&apk_path).await? else {
            return Ok(None);
        };
        debug!("Installed {} {} ({} bytes)", self.app_id, version, byte_size);
        Ok(Some(InstalledApp {
            version,
            apk_path,
            byte_size,
        }))
    }

    pub fn candidates_for(&self, app: &InstalledApp) -> Vec<VersionRecord> {
        self.manifest.compatible(&app.version, app.byte_size)
    }

    /// Manifest records matching the installed version and size, in order.
    /// Empty when nothing matches or the app is missing.
    pub async fn compatible_downgrades(&self) -> Result<Vec<VersionRecord>> {
        Ok(match self.installed_app().await? {
            Some(app) => self.candidates_for(&app),
            None => Vec::new(),
        })
    }
}
