// Shared fixtures: role signing helpers plus a scripted transport.
//
// The signing helpers mirror a backend-issued Uptane repository; the
// transport serves canned bytes per URL and records every PUT/POST so tests
// can assert on manifests and reports without a network.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use ota_agent::flow::FlowControlToken;
use ota_agent::transport::{Transport, TransportError};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uptane_core::Ed25519Signer;

pub const EXPIRES: &str = "2038-01-19T03:14:06Z";

/// One Ed25519 signer per top-level role.
pub struct RoleSigners {
    pub root: Ed25519Signer,
    pub timestamp: Ed25519Signer,
    pub snapshot: Ed25519Signer,
    pub targets: Ed25519Signer,
}

impl RoleSigners {
    pub fn from_seed(base: u8) -> Self {
        let seeded = |offset: u8| Ed25519Signer::from_seed([base.wrapping_add(offset); 32]);
        Self {
            root: seeded(0),
            timestamp: seeded(1),
            snapshot: seeded(2),
            targets: seeded(3),
        }
    }

    pub fn root_body(&self, version: u64) -> Value {
        let mut keys = serde_json::Map::new();
        for signer in [&self.root, &self.timestamp, &self.snapshot, &self.targets] {
            let public = signer.public_key();
            keys.insert(public.key_id(), public.to_uptane());
        }
        json!({
            "_type": "Root",
            "version": version,
            "expires": EXPIRES,
            "keys": keys,
            "roles": {
                "root": {"keyids": [self.root.public_key().key_id()], "threshold": 1},
                "timestamp": {"keyids": [self.timestamp.public_key().key_id()], "threshold": 1},
                "snapshot": {"keyids": [self.snapshot.public_key().key_id()], "threshold": 1},
                "targets": {"keyids": [self.targets.public_key().key_id()], "threshold": 1}
            }
        })
    }
}

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

pub fn root_envelope(keys: &RoleSigners, version: u64, signers: &[&Ed25519Signer]) -> Vec<u8> {
    envelope(keys.root_body(version), signers)
}

pub fn targets_envelope(keys: &RoleSigners, version: u64, targets: Value) -> Vec<u8> {
    let signed = json!({
        "_type": "Targets",
        "version": version,
        "expires": EXPIRES,
        "targets": targets
    });
    envelope(signed, &[&keys.targets])
}

pub fn snapshot_envelope(keys: &RoleSigners, version: u64, targets_version: u64) -> Vec<u8> {
    let signed = json!({
        "_type": "Snapshot",
        "version": version,
        "expires": EXPIRES,
        "meta": { "targets.json": {"version": targets_version} }
    });
    envelope(signed, &[&keys.snapshot])
}

pub fn timestamp_envelope(keys: &RoleSigners, version: u64, snapshot_bytes: &[u8]) -> Vec<u8> {
    let signed = json!({
        "_type": "Timestamp",
        "version": version,
        "expires": EXPIRES,
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

/// A `targets` map entry describing `payload`, optionally routed at ECUs.
pub fn target_entry(payload: &[u8], ecus: &[(&str, &str)], format: &str) -> Value {
    let mut identifiers = serde_json::Map::new();
    for (serial, hw_id) in ecus {
        identifiers.insert((*serial).to_string(), json!({"hardwareId": hw_id}));
    }
    let mut entry = json!({
        "length": payload.len(),
        "hashes": { "sha256": hex::encode(Sha256::digest(payload)) },
    });
    if !identifiers.is_empty() || format != "BINARY" {
        entry["custom"] = json!({
            "ecuIdentifiers": identifiers,
            "targetFormat": format,
        });
    }
    entry
}

/// Scripted transport: canned GET bodies, recorded PUTs and POSTs.
#[derive(Default)]
pub struct MockTransport {
    gets: Mutex<HashMap<String, Vec<u8>>>,
    posts: Mutex<HashMap<String, Vec<u8>>>,
    pub puts: Mutex<Vec<(String, Value)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: &str, body: Vec<u8>) {
        self.gets.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn unroute(&self, url: &str) {
        self.gets.lock().unwrap().remove(url);
    }

    pub fn route_post(&self, url: &str, body: Vec<u8>) {
        self.posts.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn puts_to(&self, url_suffix: &str) -> Vec<Value> {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .filter(|(url, _)| url.ends_with(url_suffix))
            .map(|(_, body)| body.clone())
            .collect()
    }
}

impl Transport for MockTransport {
    async fn get(
        &self,
        url: &str,
        limit: u64,
        token: &FlowControlToken,
    ) -> Result<Vec<u8>, TransportError> {
        if !token.can_continue() {
            return Err(TransportError::Cancelled);
        }
        let body = self.gets.lock().unwrap().get(url).cloned();
        match body {
            Some(body) if body.len() as u64 > limit => Err(TransportError::Oversize {
                url: url.to_string(),
                limit,
            }),
            Some(body) => Ok(body),
            None => Err(TransportError::Proxy(404)),
        }
    }

    async fn put(&self, url: &str, body: &Value) -> Result<(), TransportError> {
        self.puts
            .lock()
            .unwrap()
            .push((url.to_string(), body.clone()));
        Ok(())
    }

    async fn post(&self, url: &str, _body: &Value) -> Result<Vec<u8>, TransportError> {
        self.posts
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(TransportError::Proxy(404))
    }
}

pub const DIRECTOR_URL: &str = "https://director.test";
pub const IMAGE_URL: &str = "https://image.test";
pub const GATEWAY_URL: &str = "https://gateway.test";
pub const TREEHUB_URL: &str = "https://treehub.test";

/// Installs a complete signed Director repository (root + targets).
pub fn serve_director(transport: &MockTransport, keys: &RoleSigners, version: u64, targets: Value) {
    let root = root_envelope(keys, 1, &[&keys.root]);
    transport.route(&format!("{DIRECTOR_URL}/root.json"), root.clone());
    transport.route(&format!("{DIRECTOR_URL}/1.root.json"), root);
    transport.route(
        &format!("{DIRECTOR_URL}/targets.json"),
        targets_envelope(keys, version, targets),
    );
}

/// Installs a complete signed Image repository chain.
pub fn serve_image(transport: &MockTransport, keys: &RoleSigners, version: u64, targets: Value) {
    let root = root_envelope(keys, 1, &[&keys.root]);
    transport.route(&format!("{IMAGE_URL}/root.json"), root.clone());
    transport.route(&format!("{IMAGE_URL}/1.root.json"), root);
    let targets_bytes = targets_envelope(keys, version, targets);
    let snapshot = snapshot_envelope(keys, version, version);
    let timestamp = timestamp_envelope(keys, version, &snapshot);
    transport.route(&format!("{IMAGE_URL}/targets.json"), targets_bytes);
    transport.route(&format!("{IMAGE_URL}/snapshot.json"), snapshot);
    transport.route(&format!("{IMAGE_URL}/timestamp.json"), timestamp);
}

/// Registration response accepted by provisioning.
pub fn serve_registration(transport: &MockTransport) {
    transport.route_post(
        &format!("{GATEWAY_URL}/devices"),
        serde_json::to_vec(&json!({
            "ca": "---ca---",
            "cert": "---cert---",
            "pkey": "---pkey---",
        }))
        .unwrap(),
    );
}
