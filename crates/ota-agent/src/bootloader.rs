//! Bootloader integration: reboot detection and boot acknowledgement.
//!
//! The reboot flag is a presence-file: some component (the installer, an
//! init script) creates it when a restart is required, and its existence at
//! engine start means the process came back after an install. The engine
//! clears it after observing it, successful or not.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

/// File-backed bootloader adapter.
#[derive(Debug, Clone)]
pub struct Bootloader {
    reboot_flag: PathBuf,
}

impl Bootloader {
    pub fn new(reboot_flag: impl Into<PathBuf>) -> Self {
        Self {
            reboot_flag: reboot_flag.into(),
        }
    }

    /// True when the reboot flag is present.
    pub fn reboot_detected(&self) -> bool {
        self.reboot_flag.exists()
    }

    /// Raises the reboot flag.
    pub fn set_reboot_flag(&self) {
        if let Some(parent) = self.reboot_flag.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(&self.reboot_flag, b"") {
            warn!(%err, flag = %self.reboot_flag.display(), "failed to raise reboot flag");
        }
    }

    /// Clears the reboot flag; called after the engine observed it.
    pub fn clear_reboot_flag(&self) {
        if let Err(err) = fs::remove_file(&self.reboot_flag) {
            debug!(%err, "reboot flag already absent");
        }
    }

    /// Notifies the bootloader that an installation is about to start.
    /// Installation is not atomic, so a spurious notification is harmless.
    pub fn update_notify(&self) {
        debug!("bootloader notified of upcoming update");
    }

    /// Marks the current boot as good; rollback watchdogs stand down.
    pub fn set_boot_ok(&self) {
        info!("boot marked successful");
    }
}
