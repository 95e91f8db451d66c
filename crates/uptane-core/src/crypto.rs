//! Key and signature primitives for Uptane metadata.
//!
//! Public keys arrive inside Root metadata as `{keytype, keyval:{public}}`
//! objects: Ed25519 material is hex-encoded, RSA material is PEM. Signature
//! verification always operates over canonical JSON bytes produced by
//! [`crate::canonical`]; a malformed key, signature, or method never panics,
//! it simply fails verification.

use data_encoding::BASE64;
use ed25519_dalek::{Signature as DalekSignature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pss, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256, Sha512};

use crate::canonical::canonical_bytes;

/// Supported public key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa2048,
    Rsa4096,
    Ed25519,
    /// Anything the parser did not recognize; never verifies.
    Unknown,
}

impl KeyType {
    /// Parses the wire `keytype` string (case-insensitive).
    pub fn from_wire(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "rsa" => KeyType::Rsa2048,
            "ed25519" => KeyType::Ed25519,
            _ => KeyType::Unknown,
        }
    }

    /// Returns the wire name used when serializing the key.
    pub fn wire_name(self) -> &'static str {
        match self {
            KeyType::Rsa2048 | KeyType::Rsa4096 => "RSA",
            KeyType::Ed25519 => "ED25519",
            KeyType::Unknown => "unknown",
        }
    }
}

/// Supported signature methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMethod {
    /// RSASSA-PSS with SHA-256 digest and MGF1-SHA-256.
    RsassaPssSha256,
    Ed25519,
}

impl SignatureMethod {
    /// Parses the wire `method` string, accepting the legacy `rsassa-pss` alias.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rsassa-pss-sha256" | "rsassa-pss" => Some(SignatureMethod::RsassaPssSha256),
            "ed25519" => Some(SignatureMethod::Ed25519),
            _ => None,
        }
    }

    /// Returns the wire name of the method.
    pub fn wire_name(self) -> &'static str {
        match self {
            SignatureMethod::RsassaPssSha256 => "rsassa-pss-sha256",
            SignatureMethod::Ed25519 => "ed25519",
        }
    }
}

/// One entry of a `signatures` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    pub keyid: String,
    pub method: String,
    pub sig: String,
}

/// A public key as carried in Root metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    keytype: KeyType,
    material: String,
}

impl PublicKey {
    pub fn new(keytype: KeyType, material: impl Into<String>) -> Self {
        Self {
            keytype,
            material: material.into(),
        }
    }

    /// Parses a `{keytype, keyval:{public}}` object.
    ///
    /// Malformed objects yield a key of type [`KeyType::Unknown`] rather than
    /// an error; such a key can never contribute a valid signature.
    pub fn from_uptane(value: &Value) -> Self {
        let keytype = value
            .get("keytype")
            .and_then(Value::as_str)
            .map(KeyType::from_wire)
            .unwrap_or(KeyType::Unknown);
        let material = value
            .pointer("/keyval/public")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let keytype = if material.is_empty() {
            KeyType::Unknown
        } else if keytype == KeyType::Rsa2048 {
            classify_rsa(&material)
        } else {
            keytype
        };
        Self { keytype, material }
    }

    /// Serializes the key back into its wire object form.
    pub fn to_uptane(&self) -> Value {
        json!({
            "keytype": self.keytype.wire_name(),
            "keyval": { "public": self.material },
        })
    }

    pub fn keytype(&self) -> KeyType {
        self.keytype
    }

    pub fn material(&self) -> &str {
        &self.material
    }

    /// Computes the key id: lowercase-hex SHA-256 of the canonical JSON of
    /// the trimmed key material string.
    pub fn key_id(&self) -> String {
        let trimmed = self.material.trim_end_matches('\n');
        let canonical = canonical_bytes(&Value::String(trimmed.to_string()));
        hex::encode(Sha256::digest(&canonical))
    }

    /// Verifies `sig_b64` over `message` with the given method.
    ///
    /// Returns `false` for any malformed input or method/key-type mismatch.
    pub fn verify(&self, method: SignatureMethod, sig_b64: &str, message: &[u8]) -> bool {
        let Ok(sig) = BASE64.decode(sig_b64.as_bytes()) else {
            return false;
        };
        match (method, self.keytype) {
            (SignatureMethod::Ed25519, KeyType::Ed25519) => self.verify_ed25519(&sig, message),
            (SignatureMethod::RsassaPssSha256, KeyType::Rsa2048)
            | (SignatureMethod::RsassaPssSha256, KeyType::Rsa4096) => {
                self.verify_rsa_pss(&sig, message)
            }
            _ => false,
        }
    }

    fn verify_ed25519(&self, sig: &[u8], message: &[u8]) -> bool {
        let Ok(raw) = hex::decode(self.material.trim()) else {
            return false;
        };
        let Ok(key_bytes) = <[u8; 32]>::try_from(raw.as_slice()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = DalekSignature::from_slice(sig) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }

    fn verify_rsa_pss(&self, sig: &[u8], message: &[u8]) -> bool {
        let Some(key) = parse_rsa_pem(&self.material) else {
            return false;
        };
        let digest = Sha256::digest(message);
        key.verify(Pss::new::<Sha256>(), &digest, sig).is_ok()
    }
}

/// Distinguishes RSA 2048 from RSA 4096 by the modulus size; unparseable
/// material stays at the 2048 default and fails verification later.
fn classify_rsa(material: &str) -> KeyType {
    use rsa::traits::PublicKeyParts;
    match parse_rsa_pem(material) {
        Some(key) if key.size() * 8 >= 4096 => KeyType::Rsa4096,
        _ => KeyType::Rsa2048,
    }
}

/// Parses PEM material as SPKI first, falling back to PKCS#1.
fn parse_rsa_pem(material: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(material)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(material))
        .ok()
}

/// An Ed25519 signing key for device and manifest signatures.
#[derive(Clone, Debug)]
pub struct Ed25519Signer {
    signing: SigningKey,
}

impl Ed25519Signer {
    /// Reconstructs a signer from its 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Generates a fresh signer from the OS random source.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Returns the seed for persistence.
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Returns the public half in Uptane form (hex material).
    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(
            KeyType::Ed25519,
            hex::encode(self.signing.verifying_key().to_bytes()),
        )
    }

    /// Signs the canonical form of `signed` and returns the signature block.
    pub fn sign_canonical(&self, signed: &Value) -> SignatureBlock {
        let message = canonical_bytes(signed);
        let signature = self.signing.sign(&message);
        SignatureBlock {
            keyid: self.public_key().key_id(),
            method: SignatureMethod::Ed25519.wire_name().to_string(),
            sig: BASE64.encode(&signature.to_bytes()),
        }
    }

    /// Wraps a signed body into the `{signed, signatures}` wire envelope.
    pub fn envelope(&self, signed: Value) -> Value {
        let block = self.sign_canonical(&signed);
        json!({
            "signed": signed,
            "signatures": [{ "keyid": block.keyid, "method": block.method, "sig": block.sig }],
        })
    }
}

/// Lowercase-hex SHA-256 digest of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Lowercase-hex SHA-512 digest of arbitrary bytes.
pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 32] = [7u8; 32];

    /// SHA-256 digest matches the reference vector.
    #[test]
    fn sha256_reference_vector() {
        assert_eq!(
            sha256_hex(b"This is string for testing").to_uppercase(),
            "7DF106BB55506D91E48AF727CD423B169926BA99DF4BAD53AF4D80E717A1AC9F"
        );
    }

    /// SHA-512 digest matches the reference vector.
    #[test]
    fn sha512_reference_vector() {
        assert_eq!(
            sha512_hex(b"This is string for testing").to_uppercase(),
            "D3780CA0200DA69209D204429E034AEA4F661EF20EF38D3F9A0EFA13E1A9E3B37AE4E16308B720B010B6D53D5C020C11B3B7012705C9060F843D7628FEBC8791"
        );
    }

    /// Key id of a known Ed25519 key matches the reference vector.
    #[test]
    fn key_id_reference_vector() {
        let key = PublicKey::new(
            KeyType::Ed25519,
            "BB9FFA4DCF35A89F6F40C5FA67998DD38B64A8459598CF3DA93853388FDAC760",
        );
        assert_eq!(
            key.key_id(),
            "a6d0f6b52ae833175dd7724899507709231723037845715c7677670e0195f850"
        );
    }

    /// A signature verifies over canonical bytes and fails once tampered.
    #[test]
    fn ed25519_sign_verify_and_tamper() {
        let signer = Ed25519Signer::from_seed(SEED);
        let body = serde_json::json!({"_type": "Targets", "version": 3});
        let block = signer.sign_canonical(&body);
        let key = signer.public_key();

        assert!(key.verify(SignatureMethod::Ed25519, &block.sig, &canonical_bytes(&body)));

        // Prepending bytes to the signature must fail, not panic.
        let tampered = format!("33{}", block.sig);
        assert!(!key.verify(SignatureMethod::Ed25519, &tampered, &canonical_bytes(&body)));
    }

    /// Verification is a function of canonical bytes, not of the textual form.
    #[test]
    fn verification_ignores_textual_layout() {
        let signer = Ed25519Signer::from_seed(SEED);
        let body = serde_json::json!({"b": 1, "a": 2});
        let block = signer.sign_canonical(&body);
        let key = signer.public_key();

        let reordered: Value = serde_json::from_str(r#"{ "a": 2,   "b": 1 }"#).unwrap();
        assert!(key.verify(SignatureMethod::Ed25519, &block.sig, &canonical_bytes(&reordered)));
    }

    /// Unknown key types and mismatched methods never verify.
    #[test]
    fn unknown_key_never_verifies() {
        let key = PublicKey::from_uptane(&serde_json::json!({"keytype": 45}));
        assert_eq!(key.keytype(), KeyType::Unknown);
        assert!(!key.verify(SignatureMethod::Ed25519, "AAAA", b"msg"));

        let ed = Ed25519Signer::from_seed(SEED).public_key();
        assert!(!ed.verify(SignatureMethod::RsassaPssSha256, "AAAA", b"msg"));
    }

    /// Signer round-trips through its persisted seed.
    #[test]
    fn signer_seed_round_trip() {
        let signer = Ed25519Signer::generate();
        let restored = Ed25519Signer::from_seed(signer.seed());
        assert_eq!(signer.public_key(), restored.public_key());
    }
}
