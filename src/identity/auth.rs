//! Request authentication for the API boundary.
//!
//! Canonical request string: `UPPER(method) ":" path ":" timestamp ":"
//! canonical_json(body)`. Canonical JSON sorts object keys lexicographically
//! and uses minimal whitespace, so the signature is stable under key
//! reordering of the input.

use ed25519_dalek::VerifyingKey;
use serde_json::Value;

use crate::errors::AuthError;
use crate::identity::NodeIdentity;

/// Replay window for signed requests, in seconds.
pub const REPLAY_WINDOW_SECS: i64 = 300;

/// Render a JSON value with sorted object keys and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string encodes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single minimal rendering.
        other => out.push_str(&other.to_string()),
    }
}

/// The exact byte string covered by a request signature.
pub fn canonical_request(method: &str, path: &str, timestamp: i64, body: &Value) -> String {
    format!("{}:{}:{}:{}", method.to_uppercase(), path, timestamp, canonical_json(body))
}

/// Sign a request with the node identity. Used by tests and by outbound
/// peer-admin calls; external clients implement the same construction.
pub fn sign_request(
    identity: &NodeIdentity,
    method: &str,
    path: &str,
    timestamp: i64,
    body: &Value,
) -> String {
    identity.sign(canonical_request(method, path, timestamp, body).as_bytes())
}

/// Decode a hex Ed25519 public key, rejecting anything that is not a valid
/// curve point.
pub fn parse_pubkey(pubkey_hex: &str) -> Result<VerifyingKey, AuthError> {
    let bytes = hex::decode(pubkey_hex).map_err(|_| AuthError::UnknownKey)?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| AuthError::UnknownKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| AuthError::UnknownKey)
}

/// Verify a signed request against the replay window and the claimed key.
pub fn verify_request(
    pubkey_hex: &str,
    signature_hex: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    body: &Value,
    now: i64,
) -> Result<(), AuthError> {
    let age = (now - timestamp).abs();
    if age > REPLAY_WINDOW_SECS {
        return Err(AuthError::Expired { age_secs: age });
    }
    parse_pubkey(pubkey_hex)?;
    let msg = canonical_request(method, path, timestamp, body);
    if crate::identity::verify(pubkey_hex, msg.as_bytes(), signature_hex) {
        Ok(())
    } else {
        Err(AuthError::InvalidSignature)
    }
}
