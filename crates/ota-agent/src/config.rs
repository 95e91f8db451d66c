//! Agent configuration.
//!
//! A flat, serde-deserializable structure with sensible defaults; loading
//! and merging from files is the caller's concern, the engine only reads.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AgentError;

/// Which package driver manages the Primary's filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Ostree,
    #[default]
    Binary,
}

/// PKCS#11 token settings for hardware-backed keys.
#[derive(Debug, Clone, Deserialize)]
pub struct Pkcs11Config {
    /// Path of the PKCS#11 module shared object.
    pub module: PathBuf,
    /// Token PIN.
    pub pass: String,
}

/// Static configuration for one device agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Director repository base URL.
    pub director_url: String,
    /// Image repository base URL.
    pub image_url: String,
    /// Device gateway base URL (registration, manifests, events).
    pub gateway_url: String,
    /// OSTree server URL handed to OSTree-typed Secondaries.
    pub treehub_url: String,
    /// Device name announced at registration; generated when empty.
    pub device_id: Option<String>,
    /// Primary ECU serial; generated at provisioning when absent.
    pub primary_serial: Option<String>,
    /// Primary ECU hardware identifier.
    pub primary_hardware_id: String,
    /// Seconds between polls of the command loop's driver.
    pub poll_interval_secs: u64,
    /// Metadata store location.
    pub storage_path: PathBuf,
    /// Image staging/installation location for the binary driver, or the
    /// sysroot for the OSTree driver.
    pub images_path: PathBuf,
    /// Package driver selection.
    pub package_driver: DriverKind,
    /// Presence-file whose existence requests a process restart.
    pub reboot_flag: PathBuf,
    /// Whether plaintext (http) repository URLs are allowed.
    pub allow_plaintext: bool,
    /// Whether TLS certificate validation may be skipped.
    pub accept_invalid_certs: bool,
    /// Optional PKCS#11 token configuration.
    pub pkcs11: Option<Pkcs11Config>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            director_url: String::new(),
            image_url: String::new(),
            gateway_url: String::new(),
            treehub_url: String::new(),
            device_id: None,
            primary_serial: None,
            primary_hardware_id: "primary".to_string(),
            poll_interval_secs: 300,
            storage_path: PathBuf::from("/var/sota/storage"),
            images_path: PathBuf::from("/var/sota/images"),
            package_driver: DriverKind::default(),
            reboot_flag: PathBuf::from("/run/ota-agent/need_reboot"),
            allow_plaintext: false,
            accept_invalid_certs: false,
            pkcs11: None,
        }
    }
}

impl AgentConfig {
    /// Loads configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let raw = std::fs::read(path.as_ref())
            .map_err(|err| AgentError::Configuration(format!("read config: {err}")))?;
        serde_json::from_slice(&raw)
            .map_err(|err| AgentError::Configuration(format!("parse config: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unknown fields are tolerated and defaults fill the gaps.
    #[test]
    fn parses_partial_config() {
        let raw = r#"{"director_url": "https://director.example", "poll_interval_secs": 10}"#;
        let config: AgentConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.director_url, "https://director.example");
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.package_driver, DriverKind::Binary);
    }
}
