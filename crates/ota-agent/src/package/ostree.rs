//! OSTree-style package driver.
//!
//! Targets are content-addressed: the declared SHA-256 is the ref commit to
//! deploy. Pulling stages the commit under the sysroot, installing stages at
//! most one pending deployment, and the deployment only becomes active after
//! a reboot, when `finalize` runs. The booted ref is the single source of
//! truth for what is running.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uptane_core::{Hash, HashAlgorithm, Target, TargetFormat};

use super::{InstallationResult, InstalledPackage, ProgressFn, ResultCode, VerifyOutcome};
use crate::error::AgentError;
use crate::flow::FlowControlToken;
use crate::transport::Transport;

/// The deployment staged for the next boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingDeployment {
    filename: String,
    ref_hash: String,
}

/// The currently booted commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootedRef {
    filename: String,
    ref_hash: String,
}

/// Sysroot-backed OSTree driver.
#[derive(Debug)]
pub struct OstreeDriver {
    sysroot: PathBuf,
    /// OSTree server pulled from when a target carries no `uri`.
    server_url: String,
}

impl OstreeDriver {
    pub fn new(sysroot: impl Into<PathBuf>, server_url: &str) -> Result<Self, AgentError> {
        let sysroot = sysroot.into();
        fs::create_dir_all(sysroot.join("objects"))
            .map_err(|err| AgentError::Configuration(format!("create sysroot: {err}")))?;
        Ok(Self {
            sysroot,
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    fn object_path(&self, ref_hash: &str) -> PathBuf {
        self.sysroot.join("objects").join(ref_hash)
    }

    fn pending_path(&self) -> PathBuf {
        self.sysroot.join("pending_deployment.json")
    }

    fn booted_path(&self) -> PathBuf {
        self.sysroot.join("booted_ref.json")
    }

    fn pending(&self) -> Option<PendingDeployment> {
        let raw = fs::read(self.pending_path()).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn booted(&self) -> Option<BootedRef> {
        let raw = fs::read(self.booted_path()).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// OSTree targets must be routed by their SHA-256 ref commit.
    fn ref_hash(target: &Target) -> Result<&str, AgentError> {
        target.sha256().ok_or_else(|| {
            AgentError::TargetMismatch(format!(
                "OSTree target '{}' carries no SHA-256 ref hash",
                target.filename
            ))
        })
    }

    pub async fn fetch<T: Transport>(
        &self,
        target: &Target,
        transport: &T,
        token: &FlowControlToken,
        progress: Option<&ProgressFn>,
    ) -> Result<(), AgentError> {
        let ref_hash = Self::ref_hash(target)?;
        if self.object_path(ref_hash).exists() {
            debug!(ref_hash, "ref already pulled");
            return Ok(());
        }
        let url = target
            .uri
            .clone()
            .unwrap_or_else(|| format!("{}/objects/{}", self.server_url, ref_hash));
        if let Some(report) = progress {
            report(target, "Receiving objects", 0);
        }
        let bytes = transport.get(&url, target.length, token).await?;
        if let Some(report) = progress {
            report(target, "Receiving objects", 100);
        }
        fs::write(self.object_path(ref_hash), &bytes)
            .map_err(|err| AgentError::PackageInstallFailed(format!("store commit: {err}")))?;
        info!(ref_hash, bytes = bytes.len(), "ostree commit pulled");
        Ok(())
    }

    pub fn verify(&self, target: &Target) -> VerifyOutcome {
        match Self::ref_hash(target) {
            Ok(ref_hash) if self.object_path(ref_hash).exists() => VerifyOutcome::Good,
            _ => VerifyOutcome::NotFound,
        }
    }

    pub fn install(&self, target: &Target) -> InstallationResult {
        if target.format != TargetFormat::Ostree {
            return InstallationResult::new(
                &target.filename,
                ResultCode::ValidationFailed,
                "Cannot install a non-OSTree package on an OSTree system",
            );
        }
        let ref_hash = match Self::ref_hash(target) {
            Ok(hash) => hash.to_string(),
            Err(err) => {
                return InstallationResult::new(
                    &target.filename,
                    ResultCode::ValidationFailed,
                    err.to_string(),
                )
            }
        };
        if self
            .booted()
            .map(|booted| booted.ref_hash == ref_hash)
            .unwrap_or(false)
        {
            return InstallationResult::new(
                &target.filename,
                ResultCode::AlreadyProcessed,
                "Commit already deployed",
            );
        }
        if let Some(pending) = self.pending() {
            // At most one pending deployment; re-installing the same target
            // is idempotent, anything else must wait for the reboot.
            if pending.ref_hash == ref_hash {
                return InstallationResult::new(
                    &target.filename,
                    ResultCode::NeedCompletion,
                    "Deployment already staged, reboot required",
                );
            }
            return InstallationResult::new(
                &target.filename,
                ResultCode::InstallFailed,
                "Another deployment is pending completion",
            );
        }
        if self.verify(target) != VerifyOutcome::Good {
            return InstallationResult::new(
                &target.filename,
                ResultCode::InstallFailed,
                "Commit not pulled",
            );
        }

        let pending = PendingDeployment {
            filename: target.filename.clone(),
            ref_hash,
        };
        match serde_json::to_vec(&pending).map(|raw| fs::write(self.pending_path(), raw)) {
            Ok(Ok(())) => {
                info!(target = %target.filename, "deployment staged, reboot required");
                InstallationResult::new(
                    &target.filename,
                    ResultCode::NeedCompletion,
                    "Deployment staged, reboot required",
                )
            }
            _ => InstallationResult::new(
                &target.filename,
                ResultCode::InstallFailed,
                "Failed to stage deployment",
            ),
        }
    }

    pub fn finalize(&self, target: &Target) -> InstallationResult {
        let expected = match Self::ref_hash(target) {
            Ok(hash) => hash.to_string(),
            Err(err) => {
                return InstallationResult::new(
                    &target.filename,
                    ResultCode::ValidationFailed,
                    err.to_string(),
                )
            }
        };
        // The pending marker is consumed either way; a failed finalize is
        // not retried until the Director re-issues the target.
        let _ = fs::remove_file(self.pending_path());

        match self.booted() {
            Some(booted) if booted.ref_hash == expected => InstallationResult::new(
                &target.filename,
                ResultCode::Ok,
                "Deployment completed",
            ),
            Some(booted) => {
                warn!(
                    expected = %expected,
                    booted = %booted.ref_hash,
                    "booted into an unexpected commit"
                );
                InstallationResult::new(
                    &target.filename,
                    ResultCode::InstallFailed,
                    "Wrong version booted",
                )
            }
            None => InstallationResult::new(
                &target.filename,
                ResultCode::InstallFailed,
                "No booted commit recorded",
            ),
        }
    }

    /// Records the commit the bootloader actually started. On a real system
    /// this is read back from the sysroot; the seam exists so integration
    /// environments can drive reboots.
    pub fn set_booted(&self, filename: &str, ref_hash: &str) -> Result<(), AgentError> {
        let booted = BootedRef {
            filename: filename.to_string(),
            ref_hash: ref_hash.to_string(),
        };
        let raw = serde_json::to_vec(&booted)
            .map_err(|err| AgentError::Parse(err.to_string()))?;
        fs::write(self.booted_path(), raw)
            .map_err(|err| AgentError::PackageInstallFailed(format!("record booted ref: {err}")))
    }

    pub fn current(&self) -> Option<Target> {
        let booted = self.booted()?;
        Some(Target {
            filename: booted.filename,
            length: 0,
            hashes: vec![Hash::new(HashAlgorithm::Sha256, &booted.ref_hash)],
            ecus: Default::default(),
            uri: None,
            format: TargetFormat::Ostree,
        })
    }

    pub fn current_hash(&self) -> String {
        self.booted().map(|b| b.ref_hash).unwrap_or_default()
    }

    pub fn image_updated(&self) -> bool {
        self.pending().is_none() && self.booted().is_some()
    }

    pub fn installed_packages(&self) -> Vec<InstalledPackage> {
        self.booted()
            .map(|booted| {
                vec![InstalledPackage {
                    name: booted.filename,
                    version: booted.ref_hash,
                }]
            })
            .unwrap_or_default()
    }

    pub fn staged_image(&self, target: &Target) -> Result<Vec<u8>, AgentError> {
        let ref_hash = Self::ref_hash(target)?;
        fs::read(self.object_path(ref_hash)).map_err(|err| {
            AgentError::PackageInstallFailed(format!("commit '{ref_hash}' unavailable: {err}"))
        })
    }
}
