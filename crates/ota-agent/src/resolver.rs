//! Cross-repository target selection.
//!
//! The Director instructs, the Image repository authorizes, and the local
//! inventory grounds both: a target survives selection only when every ECU
//! it names is known, its hardware routing agrees with reality, it is not
//! already installed everywhere it points, and the Image repository
//! describes the identical payload.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tracing::{error, warn};
use uptane_core::Target;

/// Locally known ECU facts used during selection.
#[derive(Debug, Clone, Default)]
pub struct EcuInventory {
    /// ECU serial to hardware id.
    pub hw_ids: BTreeMap<String, String>,
    /// ECU serial to currently installed image filename.
    pub installed: BTreeMap<String, String>,
}

/// Selection failures that abort the whole iteration.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The Director routed an image to hardware it does not match; treat as
    /// a potential misdirected update and stop.
    #[error("hardware id mismatch for ECU {serial}: director says '{declared}', device has '{actual}'")]
    HardwareMismatch {
        serial: String,
        declared: String,
        actual: String,
    },
}

/// Filters the Director's instructions against Image authorizations and the
/// local inventory. Order is preserved from the Director; duplicates are
/// dropped on first occurrence.
///
/// `image` is `None` during the pre-pass that decides whether the Image
/// repository needs refreshing at all; in that mode the parity check is
/// deferred to the second pass over freshly verified Image targets.
pub fn select(
    director: &[Target],
    image: Option<&[Target]>,
    inventory: &EcuInventory,
) -> Result<Vec<Target>, ResolveError> {
    let mut selected = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    'director: for target in director {
        if !seen.insert(target.filename.as_str()) {
            continue;
        }

        for (serial, declared_hw) in &target.ecus {
            let Some(actual_hw) = inventory.hw_ids.get(serial) else {
                warn!(
                    target = %target.filename,
                    serial,
                    "director names an unknown ECU serial, skipping target"
                );
                continue 'director;
            };
            if actual_hw != declared_hw {
                error!(
                    target = %target.filename,
                    serial,
                    declared = %declared_hw,
                    actual = %actual_hw,
                    "hardware id mismatch, aborting selection"
                );
                return Err(ResolveError::HardwareMismatch {
                    serial: serial.clone(),
                    declared: declared_hw.clone(),
                    actual: actual_hw.clone(),
                });
            }
        }

        // Already installed on every ECU the target names: nothing to do.
        let installed_everywhere = !target.ecus.is_empty()
            && target.ecus.keys().all(|serial| {
                inventory.installed.get(serial).map(String::as_str)
                    == Some(target.filename.as_str())
            });
        if installed_everywhere {
            continue;
        }

        // The Image repository must describe the identical payload.
        if let Some(image) = image {
            let authorized = image
                .iter()
                .find(|candidate| candidate.filename == target.filename);
            match authorized {
                Some(candidate) if candidate.same_payload(target) => {}
                Some(_) => {
                    error!(
                        target = %target.filename,
                        "image repository disagrees on length or hashes, rejecting target"
                    );
                    continue;
                }
                None => {
                    error!(
                        target = %target.filename,
                        "target not present in image repository, rejecting"
                    );
                    continue;
                }
            }
        }

        selected.push(target.clone());
    }

    Ok(selected)
}
