//! Plain-file package driver.
//!
//! Images are fetched into a staging directory, verified against every
//! declared hash, and promoted into the installed directory on install. A
//! `current.json` marker records the active image; there is no reboot phase,
//! so `install` completes immediately.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uptane_core::{Hash, HashAlgorithm, Target, TargetFormat};

use super::{InstallationResult, InstalledPackage, ProgressFn, ResultCode, VerifyOutcome};
use crate::error::AgentError;
use crate::flow::FlowControlToken;
use crate::transport::Transport;

/// Marker describing the currently installed image.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CurrentMarker {
    filename: String,
    sha256: String,
    length: u64,
}

/// File-staging driver for binary targets.
#[derive(Debug)]
pub struct BinaryDriver {
    root: PathBuf,
    /// Base URL images are fetched from when a target carries no `uri`.
    image_base_url: String,
}

impl BinaryDriver {
    pub fn new(root: impl Into<PathBuf>, image_base_url: &str) -> Result<Self, AgentError> {
        let root = root.into();
        for dir in ["staging", "installed"] {
            fs::create_dir_all(root.join(dir))
                .map_err(|err| AgentError::Configuration(format!("create image dirs: {err}")))?;
        }
        Ok(Self {
            root,
            image_base_url: image_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn staging_path(&self, filename: &str) -> PathBuf {
        self.root.join("staging").join(sanitize(filename))
    }

    fn installed_path(&self, filename: &str) -> PathBuf {
        self.root.join("installed").join(sanitize(filename))
    }

    fn marker_path(&self) -> PathBuf {
        self.root.join("current.json")
    }

    fn read_marker(&self) -> Option<CurrentMarker> {
        let raw = fs::read(self.marker_path()).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    pub async fn fetch<T: Transport>(
        &self,
        target: &Target,
        transport: &T,
        token: &FlowControlToken,
        progress: Option<&ProgressFn>,
    ) -> Result<(), AgentError> {
        if self.verify(target) == VerifyOutcome::Good {
            debug!(target = %target.filename, "image already staged and verified");
            return Ok(());
        }

        let url = target.uri.clone().unwrap_or_else(|| {
            format!("{}/targets/{}", self.image_base_url, target.filename)
        });
        if let Some(report) = progress {
            report(target, "Downloading", 0);
        }
        let bytes = transport.get(&url, target.length, token).await?;
        if let Some(report) = progress {
            report(target, "Verifying", 100);
        }

        // First declared hash that disagrees rejects the whole download;
        // nothing unverified ever lands in staging.
        if bytes.len() as u64 != target.length {
            return Err(AgentError::TargetMismatch(format!(
                "target '{}': downloaded {} bytes, expected {}",
                target.filename,
                bytes.len(),
                target.length
            )));
        }
        for hash in &target.hashes {
            if !hash.matches(&bytes) {
                return Err(AgentError::TargetMismatch(format!(
                    "target '{}': {} digest mismatch",
                    target.filename, hash.algorithm
                )));
            }
        }

        let path = self.staging_path(&target.filename);
        fs::write(&path, &bytes)
            .map_err(|err| AgentError::PackageInstallFailed(format!("stage image: {err}")))?;
        info!(target = %target.filename, bytes = bytes.len(), "image staged");
        Ok(())
    }

    pub fn verify(&self, target: &Target) -> VerifyOutcome {
        let path = self.staging_path(&target.filename);
        match fs::read(&path) {
            Ok(bytes) if target.payload_matches(&bytes) => VerifyOutcome::Good,
            Ok(_) => {
                // Stale or corrupt staging entry; drop it so fetch retries.
                warn!(target = %target.filename, "staged image failed verification, removing");
                let _ = fs::remove_file(&path);
                VerifyOutcome::NotFound
            }
            Err(_) => VerifyOutcome::NotFound,
        }
    }

    pub fn install(&self, target: &Target) -> InstallationResult {
        if target.format == TargetFormat::Ostree {
            return InstallationResult::new(
                &target.filename,
                ResultCode::ValidationFailed,
                "Cannot install an OSTree package with the binary driver",
            );
        }
        if self.verify(target) != VerifyOutcome::Good {
            return InstallationResult::new(
                &target.filename,
                ResultCode::InstallFailed,
                "Image not staged or failed verification",
            );
        }
        if self
            .read_marker()
            .map(|marker| marker.filename == target.filename)
            .unwrap_or(false)
        {
            return InstallationResult::new(
                &target.filename,
                ResultCode::AlreadyProcessed,
                "Package already installed",
            );
        }

        let staged = self.staging_path(&target.filename);
        let installed = self.installed_path(&target.filename);
        if let Err(err) = fs::copy(&staged, &installed) {
            return InstallationResult::new(
                &target.filename,
                ResultCode::InstallFailed,
                format!("promote image: {err}"),
            );
        }
        let marker = CurrentMarker {
            filename: target.filename.clone(),
            sha256: target.sha256().unwrap_or_default().to_string(),
            length: target.length,
        };
        if let Err(err) = write_marker(&self.marker_path(), &marker) {
            return InstallationResult::new(
                &target.filename,
                ResultCode::InstallFailed,
                format!("record installation: {err}"),
            );
        }
        info!(target = %target.filename, "binary image installed");
        InstallationResult::new(&target.filename, ResultCode::Ok, "Installation successful")
    }

    pub fn finalize(&self, target: &Target) -> InstallationResult {
        // Binary installs complete synchronously; nothing to finish.
        InstallationResult::new(&target.filename, ResultCode::Ok, "Nothing to finalize")
    }

    pub fn current(&self) -> Option<Target> {
        let marker = self.read_marker()?;
        Some(Target {
            filename: marker.filename,
            length: marker.length,
            hashes: vec![Hash::new(HashAlgorithm::Sha256, &marker.sha256)],
            ecus: Default::default(),
            uri: None,
            format: TargetFormat::Binary,
        })
    }

    pub fn current_hash(&self) -> String {
        self.read_marker().map(|m| m.sha256).unwrap_or_default()
    }

    pub fn image_updated(&self) -> bool {
        self.read_marker().is_some()
    }

    pub fn installed_packages(&self) -> Vec<InstalledPackage> {
        let mut packages = Vec::new();
        let Ok(entries) = fs::read_dir(self.root.join("installed")) else {
            return packages;
        };
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string() {
                packages.push(InstalledPackage {
                    name,
                    version: String::new(),
                });
            }
        }
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        packages
    }

    pub fn staged_image(&self, target: &Target) -> Result<Vec<u8>, AgentError> {
        fs::read(self.staging_path(&target.filename)).map_err(|err| {
            AgentError::PackageInstallFailed(format!(
                "staged image '{}' unavailable: {err}",
                target.filename
            ))
        })
    }
}

/// Writes the current-image marker atomically via a sibling temp file.
fn write_marker(path: &Path, marker: &CurrentMarker) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(marker)?)?;
    fs::rename(&tmp, path)
}

/// Keeps target filenames from escaping the staging directory.
fn sanitize(filename: &str) -> String {
    filename.replace(['/', '\\'], "_")
}
