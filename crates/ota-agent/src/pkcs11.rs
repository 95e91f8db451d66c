//! PKCS#11 token addressing and the process-wide engine handle.
//!
//! Keys and certificates on a hardware token are addressed by
//! `pkcs11:serial=<token_serial>;pin-value=<pin>;id=%<hex_id>` URIs. The
//! engine talking to the token is one logical resource per process: it is
//! initialized on first acquisition and torn down when the last holder goes
//! out of scope, so concurrent users always observe a consistent lifecycle.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::info;

use crate::config::Pkcs11Config;
use crate::error::AgentError;

/// A parsed `pkcs11:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkcs11Uri {
    pub serial: String,
    pub pin: String,
    /// Even-length lowercase hex object id.
    pub id: String,
}

impl Pkcs11Uri {
    /// Parses `pkcs11:serial=...;pin-value=...;id=%<hex>`.
    pub fn parse(uri: &str) -> Result<Self, AgentError> {
        let rest = uri
            .strip_prefix("pkcs11:")
            .ok_or_else(|| AgentError::Configuration(format!("not a pkcs11 uri: '{uri}'")))?;

        let mut serial = None;
        let mut pin = None;
        let mut id = None;
        for attribute in rest.split(';') {
            let Some((name, value)) = attribute.split_once('=') else {
                return Err(AgentError::Configuration(format!(
                    "malformed pkcs11 attribute: '{attribute}'"
                )));
            };
            match name {
                "serial" => serial = Some(value.to_string()),
                "pin-value" => pin = Some(value.to_string()),
                "id" => id = Some(parse_object_id(value)?),
                // Unknown attributes are tolerated per RFC 7512.
                _ => {}
            }
        }

        Ok(Self {
            serial: serial
                .ok_or_else(|| AgentError::Configuration("pkcs11 uri missing serial".into()))?,
            pin: pin
                .ok_or_else(|| AgentError::Configuration("pkcs11 uri missing pin-value".into()))?,
            id: id.ok_or_else(|| AgentError::Configuration("pkcs11 uri missing id".into()))?,
        })
    }
}

/// Decodes `%<hex>` object ids; ids are even-length lowercase hex.
fn parse_object_id(value: &str) -> Result<String, AgentError> {
    let hex_part: String = value.chars().filter(|c| *c != '%').collect();
    let valid = !hex_part.is_empty()
        && hex_part.len() % 2 == 0
        && hex_part
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !valid {
        return Err(AgentError::Configuration(format!(
            "pkcs11 object id '{value}' is not even-length lowercase hex"
        )));
    }
    Ok(hex_part)
}

/// The process-wide token engine. Opaque handle; the actual module loading
/// lives behind the token adapter boundary.
#[derive(Debug)]
pub struct P11Engine {
    module: PathBuf,
}

impl P11Engine {
    pub fn module(&self) -> &PathBuf {
        &self.module
    }
}

impl Drop for P11Engine {
    fn drop(&mut self) {
        // Last holder released the engine; the module handle goes with it.
        info!(module = %self.module.display(), "pkcs11 engine released");
    }
}

/// A scoped, reference-counted hold on the process-wide engine.
#[derive(Debug, Clone)]
pub struct P11EngineGuard {
    engine: Arc<P11Engine>,
}

impl std::ops::Deref for P11EngineGuard {
    type Target = P11Engine;

    fn deref(&self) -> &P11Engine {
        &self.engine
    }
}

fn registry() -> &'static Mutex<Weak<P11Engine>> {
    static REGISTRY: OnceLock<Mutex<Weak<P11Engine>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Weak::new()))
}

impl P11EngineGuard {
    /// Acquires the engine, initializing it on first use. Subsequent calls
    /// while any guard is alive share the same instance.
    pub fn acquire(config: &Pkcs11Config) -> Result<Self, AgentError> {
        let mut slot = registry()
            .lock()
            .map_err(|_| AgentError::Crypto("pkcs11 registry poisoned".to_string()))?;
        if let Some(engine) = slot.upgrade() {
            return Ok(Self { engine });
        }
        info!(module = %config.module.display(), "loading pkcs11 engine");
        let engine = Arc::new(P11Engine {
            module: config.module.clone(),
        });
        *slot = Arc::downgrade(&engine);
        Ok(Self { engine })
    }
}
