//! Commands consumed and events emitted by the update engine.
//!
//! Every command produces exactly one terminal event: its `*Complete`
//! variant on success or [`Event::Error`] on failure. Events are broadcast
//! and never block the engine; a slow subscriber only loses its own copies.

use uptane_core::Target;

use crate::package::InstallationResult;

/// Commands accepted by the engine's command channel.
#[derive(Debug, Clone)]
pub enum Command {
    /// Report hardware info and installed packages, then put a manifest.
    SendDeviceData,
    /// Assemble and put the device manifest.
    PutManifest,
    /// Online metadata refresh (Director first, Image when needed).
    FetchMeta,
    /// Offline update check against stored metadata only.
    CheckUpdates,
    /// Download the given approved targets.
    StartDownload(Vec<Target>),
    /// Install the given downloaded targets.
    Install(Vec<Target>),
    /// Stop the command loop.
    Shutdown,
}

impl Command {
    /// Short name used in logs and error events.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SendDeviceData => "SendDeviceData",
            Command::PutManifest => "PutManifest",
            Command::FetchMeta => "FetchMeta",
            Command::CheckUpdates => "CheckUpdates",
            Command::StartDownload(_) => "StartDownload",
            Command::Install(_) => "Install",
            Command::Shutdown => "Shutdown",
        }
    }
}

/// Terminal events broadcast by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    SendDeviceDataComplete,
    PutManifestComplete,
    FetchMetaComplete { updates: Vec<Target> },
    CheckUpdatesComplete { updates: Vec<Target> },
    DownloadComplete { downloaded: Vec<Target>, failed: Vec<String> },
    InstallComplete { results: Vec<InstallationResult> },
    FinalizeComplete { result: InstallationResult },
    Error { command: &'static str, message: String },
}

/// The engine's lifecycle states. Only [`EngineState::NeedsReboot`] has a
/// persisted counterpart (the pending-installation marker); every other
/// state is reconstructed at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Provisioned,
    Idle,
    FetchingMeta,
    UpdatesAvailable,
    Downloading,
    Installing,
    NeedsReboot,
    Finalizing,
}
