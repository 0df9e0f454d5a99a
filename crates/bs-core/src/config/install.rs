//! Installation settings and host platform detection

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::InstallError;

/// Script layout a bundle ships for each supported host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "win32_amd64")]
    Win32Amd64,
    #[serde(rename = "ubuntu_amd64")]
    UbuntuAmd64,
}

impl Platform {
    /// Detect the platform from the host OS
    pub fn detect() -> Result<Self, InstallError> {
        match std::env::consts::OS {
            "windows" => Ok(Platform::Win32Amd64),
            "linux" => Ok(Platform::UbuntuAmd64),
            other => Err(InstallError::PlatformUnsupported(other.to_string())),
        }
    }

    /// Name of the per-platform subfolder inside a version folder
    pub fn folder_name(self) -> &'static str {
        match self {
            Platform::Win32Amd64 => "win32_amd64",
            Platform::UbuntuAmd64 => "ubuntu_amd64",
        }
    }

    /// Extension of runnable stage scripts, including the dot
    pub fn script_extension(self) -> &'static str {
        match self {
            Platform::Win32Amd64 => ".ps1",
            Platform::UbuntuAmd64 => ".sh",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder_name())
    }
}

/// Script execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Force a platform instead of detecting it
    pub platform: Option<Platform>,

    /// Interpreter for `.ps1` stage scripts
    pub windows_shell: String,

    /// Interpreter for `.sh` stage scripts
    pub unix_shell: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            platform: None,
            windows_shell: "powershell.exe".to_string(),
            unix_shell: "/bin/bash".to_string(),
        }
    }
}

impl InstallConfig {
    /// Configured override, or the detected host platform
    pub fn resolve_platform(&self) -> Result<Platform, InstallError> {
        match self.platform {
            Some(p) => Ok(p),
            None => Platform::detect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_layout() {
        assert_eq!(Platform::Win32Amd64.folder_name(), "win32_amd64");
        assert_eq!(Platform::UbuntuAmd64.script_extension(), ".sh");
        assert_eq!(Platform::Win32Amd64.script_extension(), ".ps1");
    }

    #[test]
    fn test_override_wins() {
        let config = InstallConfig {
            platform: Some(Platform::Win32Amd64),
            ..Default::default()
        };
        assert_eq!(config.resolve_platform().unwrap(), Platform::Win32Amd64);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_detect_linux() {
        assert_eq!(Platform::detect().unwrap(), Platform::UbuntuAmd64);
    }

    #[test]
    fn test_platform_serde_names() {
        let json = serde_json::to_string(&Platform::UbuntuAmd64).unwrap();
        assert_eq!(json, r#""ubuntu_amd64""#);
    }
}
