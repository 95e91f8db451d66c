//! Package drivers for the Primary ECU.
//!
//! Two back-ends exist: a content-addressed OSTree-style driver whose
//! installs complete across a reboot, and a plain binary driver that stages
//! and promotes image files. Dispatch is by tag; the engine owns exactly one
//! driver and never cares which beyond the type guard at install time.

pub mod binary;
pub mod ostree;

use serde::{Deserialize, Serialize};
use uptane_core::Target;

use crate::error::AgentError;
use crate::flow::FlowControlToken;
use crate::transport::Transport;

pub use binary::BinaryDriver;
pub use ostree::OstreeDriver;

/// Outcome codes of installation operations, as reported in manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    AlreadyProcessed,
    NeedCompletion,
    InstallFailed,
    ValidationFailed,
    InProgress,
}

impl ResultCode {
    /// Numeric code carried in the manifest `operation_result` custom field.
    pub fn numeric(self) -> u32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::AlreadyProcessed => 1,
            ResultCode::ValidationFailed => 3,
            ResultCode::InstallFailed => 4,
            ResultCode::NeedCompletion => 5,
            ResultCode::InProgress => 6,
        }
    }

    /// Outcome string used in the installed-version log.
    pub fn log_outcome(self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::AlreadyProcessed => "already_processed",
            ResultCode::NeedCompletion => "need_completion",
            ResultCode::InstallFailed => "install_failed",
            ResultCode::ValidationFailed => "validation_failed",
            ResultCode::InProgress => "in_progress",
        }
    }
}

/// Result of one installation operation against one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationResult {
    /// Target filename the result refers to.
    pub id: String,
    pub code: ResultCode,
    pub description: String,
}

impl InstallationResult {
    pub fn new(id: impl Into<String>, code: ResultCode, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code,
            description: description.into(),
        }
    }
}

/// One locally installed package, as reported to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

/// Whether a staged image passed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Good,
    NotFound,
}

/// Progress callback invoked during image fetches.
pub type ProgressFn = dyn Fn(&Target, &str, u32) + Send + Sync;

/// The package back-end managing the Primary's filesystem.
#[derive(Debug)]
pub enum PackageDriver {
    Ostree(OstreeDriver),
    Binary(BinaryDriver),
}

impl PackageDriver {
    pub fn name(&self) -> &'static str {
        match self {
            PackageDriver::Ostree(_) => "ostree",
            PackageDriver::Binary(_) => "binary",
        }
    }

    /// True for the OSTree back-end; used by the install-time type guard.
    pub fn is_ostree(&self) -> bool {
        matches!(self, PackageDriver::Ostree(_))
    }

    /// Fetches and verifies one target image. Idempotent: an already
    /// present and verified image short-circuits.
    pub async fn fetch<T: Transport>(
        &self,
        target: &Target,
        transport: &T,
        token: &FlowControlToken,
        progress: Option<&ProgressFn>,
    ) -> Result<(), AgentError> {
        match self {
            PackageDriver::Ostree(driver) => driver.fetch(target, transport, token, progress).await,
            PackageDriver::Binary(driver) => driver.fetch(target, transport, token, progress).await,
        }
    }

    /// Checks whether the target's image is present and verified locally.
    pub fn verify(&self, target: &Target) -> VerifyOutcome {
        match self {
            PackageDriver::Ostree(driver) => driver.verify(target),
            PackageDriver::Binary(driver) => driver.verify(target),
        }
    }

    /// Installs a fetched target; at most one pending deployment results.
    pub fn install(&self, target: &Target) -> InstallationResult {
        match self {
            PackageDriver::Ostree(driver) => driver.install(target),
            PackageDriver::Binary(driver) => driver.install(target),
        }
    }

    /// Completes a pending deployment after reboot.
    pub fn finalize(&self, target: &Target) -> InstallationResult {
        match self {
            PackageDriver::Ostree(driver) => driver.finalize(target),
            PackageDriver::Binary(driver) => driver.finalize(target),
        }
    }

    /// Describes the currently active image of the Primary.
    pub fn current(&self) -> Option<Target> {
        match self {
            PackageDriver::Ostree(driver) => driver.current(),
            PackageDriver::Binary(driver) => driver.current(),
        }
    }

    /// Hash of the currently active image.
    pub fn current_hash(&self) -> String {
        match self {
            PackageDriver::Ostree(driver) => driver.current_hash(),
            PackageDriver::Binary(driver) => driver.current_hash(),
        }
    }

    /// True once the active image matches the last completed installation.
    pub fn image_updated(&self) -> bool {
        match self {
            PackageDriver::Ostree(driver) => driver.image_updated(),
            PackageDriver::Binary(driver) => driver.image_updated(),
        }
    }

    pub fn installed_packages(&self) -> Vec<InstalledPackage> {
        match self {
            PackageDriver::Ostree(driver) => driver.installed_packages(),
            PackageDriver::Binary(driver) => driver.installed_packages(),
        }
    }

    /// Reads a staged image back for distribution to Secondaries.
    pub fn staged_image(&self, target: &Target) -> Result<Vec<u8>, AgentError> {
        match self {
            PackageDriver::Ostree(driver) => driver.staged_image(target),
            PackageDriver::Binary(driver) => driver.staged_image(target),
        }
    }
}
