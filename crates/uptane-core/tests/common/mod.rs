// Signing helpers shared across integration tests.
//
// These fixtures produce signed role envelopes so tests can emulate a
// repository without reproducing the signing logic inline.
use data_encoding::BASE64;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uptane_core::Ed25519Signer;

pub const EXPIRES: &str = "2038-01-19T03:14:06Z";
pub const EXPIRED: &str = "2017-01-01T00:00:00Z";

/// One Ed25519 signer per top-level role.
pub struct RoleSigners {
    pub root: Ed25519Signer,
    pub timestamp: Ed25519Signer,
    pub snapshot: Ed25519Signer,
    pub targets: Ed25519Signer,
}

impl RoleSigners {
    /// Deterministic signer set derived from a base seed byte.
    pub fn from_seed(base: u8) -> Self {
        let seeded = |offset: u8| Ed25519Signer::from_seed([base.wrapping_add(offset); 32]);
        Self {
            root: seeded(0),
            timestamp: seeded(1),
            snapshot: seeded(2),
            targets: seeded(3),
        }
    }

    /// Builds an unsigned Root body declaring this key set.
    pub fn root_body(&self, version: u64, expires: &str, root_threshold: u32) -> Value {
        let mut keys = serde_json::Map::new();
        for signer in [&self.root, &self.timestamp, &self.snapshot, &self.targets] {
            let public = signer.public_key();
            keys.insert(public.key_id(), public.to_uptane());
        }
        json!({
            "_type": "Root",
            "version": version,
            "expires": expires,
            "keys": keys,
            "roles": {
                "root": {"keyids": [self.root.public_key().key_id()], "threshold": root_threshold},
                "timestamp": {"keyids": [self.timestamp.public_key().key_id()], "threshold": 1},
                "snapshot": {"keyids": [self.snapshot.public_key().key_id()], "threshold": 1},
                "targets": {"keyids": [self.targets.public_key().key_id()], "threshold": 1}
            }
        })
    }
}

/// Wraps a signed body in an envelope carrying one signature per signer.
pub fn envelope(signed: Value, signers: &[&Ed25519Signer]) -> Vec<u8> {
    let signatures: Vec<Value> = signers
        .iter()
        .map(|signer| {
            let block = signer.sign_canonical(&signed);
            json!({"keyid": block.keyid, "method": block.method, "sig": block.sig})
        })
        .collect();
    serde_json::to_vec(&json!({"signed": signed, "signatures": signatures})).unwrap()
}

/// A Root envelope signed by the given signers.
pub fn root_envelope(
    keys: &RoleSigners,
    version: u64,
    expires: &str,
    signers: &[&Ed25519Signer],
) -> Vec<u8> {
    envelope(keys.root_body(version, expires, 1), signers)
}

/// A Targets envelope over the provided `targets` map.
pub fn targets_envelope(keys: &RoleSigners, version: u64, expires: &str, targets: Value) -> Vec<u8> {
    let signed = json!({
        "_type": "Targets",
        "version": version,
        "expires": expires,
        "targets": targets
    });
    envelope(signed, &[&keys.targets])
}

/// A Snapshot envelope expecting the given Targets version.
pub fn snapshot_envelope(
    keys: &RoleSigners,
    version: u64,
    expires: &str,
    targets_version: u64,
) -> Vec<u8> {
    let signed = json!({
        "_type": "Snapshot",
        "version": version,
        "expires": expires,
        "meta": { "targets.json": {"version": targets_version} }
    });
    envelope(signed, &[&keys.snapshot])
}

/// A Timestamp envelope pinning the exact snapshot bytes.
pub fn timestamp_envelope(
    keys: &RoleSigners,
    version: u64,
    expires: &str,
    snapshot_bytes: &[u8],
) -> Vec<u8> {
    let signed = json!({
        "_type": "Timestamp",
        "version": version,
        "expires": expires,
        "meta": {
            "snapshot.json": {
                "version": version,
                "length": snapshot_bytes.len(),
                "hashes": { "sha256": hex::encode(Sha256::digest(snapshot_bytes)) }
            }
        }
    });
    envelope(signed, &[&keys.timestamp])
}

/// One entry of a `targets` map describing `payload`.
pub fn target_entry(payload: &[u8], ecus: &[(&str, &str)], format: &str) -> Value {
    let mut identifiers = serde_json::Map::new();
    for (serial, hw_id) in ecus {
        identifiers.insert((*serial).to_string(), json!({"hardwareId": hw_id}));
    }
    json!({
        "length": payload.len(),
        "hashes": { "sha256": hex::encode(Sha256::digest(payload)) },
        "custom": {
            "ecuIdentifiers": identifiers,
            "targetFormat": format
        }
    })
}

/// Corrupts a base64 signature while keeping it decodable.
#[allow(dead_code)]
pub fn corrupt_signature(sig: &str) -> String {
    let mut raw = BASE64.decode(sig.as_bytes()).unwrap();
    raw[0] ^= 0xff;
    BASE64.encode(&raw)
}
