//! Device provisioning.
//!
//! Runs once at engine start and is idempotent: device keys are generated
//! only when absent, registration happens only while no TLS credentials are
//! stored, and the ECU inventory is (re)persisted with the Primary at index
//! zero. Any failure here is fatal; the engine refuses to run unprovisioned.

use serde_json::json;
use tracing::info;
use uptane_core::Ed25519Signer;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::secondary::Secondary;
use crate::storage::{EcuInfo, MetaStore, TlsCreds};
use crate::transport::Transport;

/// The provisioned identity the engine operates under.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub primary_serial: String,
    pub primary_hw_id: String,
}

/// Ensures keys, registration, and the ECU inventory exist.
pub async fn ensure_provisioned<T: Transport>(
    config: &AgentConfig,
    storage: &MetaStore,
    transport: &T,
    secondaries: &[&Secondary],
) -> Result<(DeviceIdentity, Ed25519Signer), AgentError> {
    let signer = match storage.load_key_seed()? {
        Some(seed) => Ed25519Signer::from_seed(seed),
        None => {
            let signer = Ed25519Signer::generate();
            storage.store_key_seed(&signer.seed())?;
            info!("generated device uptane key");
            signer
        }
    };

    let mut ecus = storage.load_ecu_serials()?;
    if ecus.is_empty() {
        let primary_serial = config
            .primary_serial
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        ecus.push(EcuInfo {
            serial: primary_serial,
            hardware_id: config.primary_hardware_id.clone(),
        });
        for secondary in secondaries {
            ecus.push(EcuInfo {
                serial: secondary.serial().to_string(),
                hardware_id: secondary.hw_id().to_string(),
            });
        }
        storage.store_ecu_serials(&ecus)?;
    }
    let primary = ecus[0].clone();

    let device_id = config
        .device_id
        .clone()
        .unwrap_or_else(|| primary.serial.clone());

    if storage.load_tls_creds()?.is_none() {
        let request = json!({
            "deviceId": device_id,
            "ttl": 36000,
            "ecus": ecus.iter().map(|ecu| json!({
                "ecu_serial": ecu.serial,
                "hardware_identifier": ecu.hardware_id,
                "clientKey": signer.public_key().to_uptane(),
            })).collect::<Vec<_>>(),
        });
        let url = format!("{}/devices", config.gateway_url.trim_end_matches('/'));
        let response = transport.post(&url, &request).await?;
        let creds: TlsCreds = serde_json::from_slice(&response).map_err(|err| {
            AgentError::Parse(format!("registration response: {err}"))
        })?;
        storage.store_tls_creds(&creds)?;
        info!(%device_id, "device registered");
    }

    Ok((
        DeviceIdentity {
            device_id,
            primary_serial: primary.serial,
            primary_hw_id: primary.hardware_id,
        },
        signer,
    ))
}
