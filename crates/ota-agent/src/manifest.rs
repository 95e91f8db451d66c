//! Device manifest assembly.
//!
//! The manifest the Director receives is a map of per-ECU signed version
//! reports: the Primary's report is built from the package driver and the
//! persisted installation result, each Secondary's report is taken verbatim
//! but re-verified against the Secondary's public key before inclusion.
//! Failing Secondaries are omitted with an error log rather than poisoning
//! the whole manifest.

use serde_json::{json, Map, Value};
use tracing::error;
use uptane_core::{canonical_bytes, Ed25519Signer, PublicKey, SignatureMethod, Target};

use crate::package::{InstallationResult, ResultCode};

/// Builds the Primary's unsigned version report.
pub fn primary_version_report(
    serial: &str,
    current: Option<&Target>,
    result: Option<&InstallationResult>,
) -> Value {
    let installed = match current {
        Some(target) => json!({
            "filepath": target.filename,
            "fileinfo": {
                "hashes": { "sha256": target.sha256().unwrap_or_default() },
                "length": target.length
            }
        }),
        None => json!({
            "filepath": "unknown",
            "fileinfo": { "hashes": { "sha256": "" }, "length": 0 }
        }),
    };
    let mut body = json!({
        "ecu_serial": serial,
        "attacks_detected": "",
        "installed_image": installed,
    });
    if let Some(result) = result {
        body["custom"] = json!({
            "operation_result": {
                "id": result.id,
                "result_code": result.code.numeric(),
                "result_text": result.description,
            }
        });
    }
    body
}

/// Verifies a Secondary's signed manifest against its known public key.
///
/// The first signature block must verify over the canonical bytes of the
/// `signed` section with a supported method.
pub fn verify_ecu_manifest(manifest: &Value, key: &PublicKey) -> bool {
    let (Some(signed), Some(blocks)) = (
        manifest.get("signed"),
        manifest.get("signatures").and_then(Value::as_array),
    ) else {
        return false;
    };
    let Some(first) = blocks.first() else {
        return false;
    };
    let (Some(method), Some(sig)) = (
        first
            .get("method")
            .and_then(Value::as_str)
            .and_then(SignatureMethod::from_wire),
        first.get("sig").and_then(Value::as_str),
    ) else {
        return false;
    };
    key.verify(method, sig, &canonical_bytes(signed))
}

/// Assembles the per-ECU manifest map.
///
/// `secondaries` provides `(serial, manifest, key)` tuples; entries failing
/// verification are dropped.
pub fn assemble(
    primary_serial: &str,
    primary_report: Value,
    signer: &Ed25519Signer,
    secondaries: impl IntoIterator<Item = (String, Value, PublicKey)>,
) -> Value {
    let mut manifests = Map::new();
    manifests.insert(
        primary_serial.to_string(),
        signer.envelope(primary_report),
    );
    for (serial, manifest, key) in secondaries {
        if manifest.get("signed").is_none() || manifest.get("signatures").is_none() {
            error!(%serial, "secondary manifest is corrupted or not signed");
            continue;
        }
        if !verify_ecu_manifest(&manifest, &key) {
            error!(%serial, "secondary manifest verification failed");
            continue;
        }
        manifests.insert(serial, manifest);
    }
    Value::Object(manifests)
}

/// True when any included ECU still reports an in-progress operation; the
/// manifest PUT is skipped in that case to avoid racing a running install.
pub fn has_pending_updates(manifests: &Value) -> bool {
    let Some(map) = manifests.as_object() else {
        return false;
    };
    map.values().any(|manifest| {
        manifest
            .pointer("/signed/custom/operation_result/result_code")
            .and_then(Value::as_u64)
            == Some(ResultCode::InProgress.numeric() as u64)
    })
}

/// Extracts the installed image file path from a verified ECU manifest.
pub fn installed_filepath(manifest: &Value) -> Option<String> {
    manifest
        .pointer("/signed/installed_image/filepath")
        .and_then(Value::as_str)
        .map(str::to_string)
}
