//! Node identity: one Ed25519 keypair per process.
//!
//! The secret key at rest is sealed with AES-256-GCM under a key derived
//! from the operator passphrase via Argon2id. Only the encrypted secret is
//! persisted; the public key lives next to it as plain hex.

pub mod auth;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use zeroize::Zeroize;

use crate::errors::{AuthError, NodeError, NodeResult};
use crate::types::Address;

const SK_FILE: &str = "node_identity.sk";
const PK_FILE: &str = "node_identity.pk";

/// Argon2id parameters stored alongside the ciphertext so older key files
/// stay decryptable after defaults change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub alg: String,
    pub m_cost: u32,
    pub t_cost: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { alg: "argon2id".into(), m_cost: 19_456, t_cost: 2, p: 1 }
    }
}

/// Encrypted secret-key blob as persisted in `node_identity.sk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncBlob {
    pub alg: String,
    pub salt: String,
    pub nonce: String,
    pub kdf: KdfParams,
    pub ct: String,
}

/// The process identity. Read-only after load.
pub struct NodeIdentity {
    signing: SigningKey,
    verifying: VerifyingKey,
    node_id: Address,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity").field("node_id", &self.node_id).finish()
    }
}

impl NodeIdentity {
    /// Generate a fresh Ed25519 keypair.
    pub fn keygen() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        let node_id = hex::encode(verifying.to_bytes());
        Self { signing, verifying, node_id }
    }

    /// Hex public key; doubles as the node id on the mesh.
    pub fn node_id(&self) -> &Address {
        &self.node_id
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    /// Sign a message, returning the hex signature.
    pub fn sign(&self, msg: &[u8]) -> String {
        hex::encode(self.signing.sign(msg).to_bytes())
    }

    /// Persist this identity under `<keys_dir>/node_identity.{sk,pk}`.
    pub fn store_encrypted(&self, keys_dir: &Path, passphrase: &str) -> NodeResult<()> {
        fs::create_dir_all(keys_dir)
            .map_err(|e| NodeError::Fatal(format!("create keys dir: {e}")))?;

        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);

        let kdf = KdfParams::default();
        let mut key = derive_key(passphrase, &salt, &kdf)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| NodeError::Fatal(format!("cipher init: {e}")))?;
        key.zeroize();

        let mut keypair_bytes = self.signing.to_keypair_bytes();
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), keypair_bytes.as_ref())
            .map_err(|e| NodeError::Fatal(format!("seal secret key: {e}")))?;
        keypair_bytes.zeroize();

        let blob = EncBlob {
            alg: "aes-256-gcm".into(),
            salt: B64.encode(salt),
            nonce: B64.encode(nonce),
            kdf,
            ct: B64.encode(ct),
        };
        let encoded = serde_json::to_vec_pretty(&blob)
            .map_err(|e| NodeError::Fatal(format!("encode key file: {e}")))?;
        fs::write(keys_dir.join(SK_FILE), encoded)
            .map_err(|e| NodeError::Fatal(format!("write secret key: {e}")))?;
        fs::write(keys_dir.join(PK_FILE), &self.node_id)
            .map_err(|e| NodeError::Fatal(format!("write public key: {e}")))?;
        Ok(())
    }

    /// Load and unseal the identity. A wrong passphrase surfaces as
    /// `AuthError::BadPassphrase`.
    pub fn load_encrypted(keys_dir: &Path, passphrase: &str) -> NodeResult<Self> {
        let raw = fs::read(keys_dir.join(SK_FILE))
            .map_err(|e| NodeError::Fatal(format!("read secret key: {e}")))?;
        let blob: EncBlob = serde_json::from_slice(&raw)
            .map_err(|e| NodeError::Fatal(format!("parse key file: {e}")))?;
        if blob.alg != "aes-256-gcm" || blob.kdf.alg != "argon2id" {
            return Err(NodeError::Fatal(format!("unsupported key file alg {}", blob.alg)));
        }

        let salt = B64
            .decode(&blob.salt)
            .map_err(|e| NodeError::Fatal(format!("key file salt: {e}")))?;
        let nonce = B64
            .decode(&blob.nonce)
            .map_err(|e| NodeError::Fatal(format!("key file nonce: {e}")))?;
        let ct = B64
            .decode(&blob.ct)
            .map_err(|e| NodeError::Fatal(format!("key file ciphertext: {e}")))?;

        let mut key = derive_key(passphrase, &salt, &blob.kdf)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| NodeError::Fatal(format!("cipher init: {e}")))?;
        key.zeroize();

        let mut keypair_bytes = cipher
            .decrypt(Nonce::from_slice(&nonce), ct.as_ref())
            .map_err(|_| NodeError::Auth(AuthError::BadPassphrase))?;
        let arr: [u8; 64] = keypair_bytes
            .as_slice()
            .try_into()
            .map_err(|_| NodeError::Fatal("secret key has wrong length".into()))?;
        let signing = SigningKey::from_keypair_bytes(&arr)
            .map_err(|_| NodeError::Fatal("secret key bytes rejected".into()))?;
        keypair_bytes.zeroize();

        let verifying = signing.verifying_key();
        let node_id = hex::encode(verifying.to_bytes());
        Ok(Self { signing, verifying, node_id })
    }

    /// Load the persisted identity, or create and persist one on first boot.
    pub fn load_or_generate(keys_dir: &Path, passphrase: &str) -> NodeResult<Self> {
        if keys_dir.join(SK_FILE).exists() {
            let identity = Self::load_encrypted(keys_dir, passphrase)?;
            info!(node_id = %identity.node_id, "node identity unlocked");
            Ok(identity)
        } else {
            let identity = Self::keygen();
            identity.store_encrypted(keys_dir, passphrase)?;
            info!(node_id = %identity.node_id, "node identity generated");
            Ok(identity)
        }
    }
}

/// Default keys directory under the node data dir.
pub fn keys_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(".keys")
}

fn derive_key(passphrase: &str, salt: &[u8], kdf: &KdfParams) -> NodeResult<[u8; 32]> {
    let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p, Some(32))
        .map_err(|e| NodeError::Fatal(format!("kdf params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; 32];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|e| NodeError::Fatal(format!("kdf derive: {e}")))?;
    Ok(out)
}

/// Verify a hex signature from a hex public key. Malformed key material
/// verifies false rather than erroring; callers that need to distinguish use
/// [`auth::parse_pubkey`].
pub fn verify(pubkey_hex: &str, msg: &[u8], signature_hex: &str) -> bool {
    let Ok(pk) = auth::parse_pubkey(pubkey_hex) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(arr) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    pk.verify(msg, &Signature::from_bytes(&arr)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip_and_tamper() {
        let id = NodeIdentity::keygen();
        let msg = b"the basin stays open";
        let sig = id.sign(msg);
        assert!(verify(id.node_id(), msg, &sig));

        // Any altered byte of the message or signature must fail.
        assert!(!verify(id.node_id(), b"the basin stays shut", &sig));
        let mut bad_sig = hex::decode(&sig).unwrap();
        bad_sig[10] ^= 0x01;
        assert!(!verify(id.node_id(), msg, &hex::encode(bad_sig)));
    }

    #[test]
    fn keystore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys_dir(dir.path());
        let id = NodeIdentity::keygen();
        id.store_encrypted(&keys, "correct horse").unwrap();

        let loaded = NodeIdentity::load_encrypted(&keys, "correct horse").unwrap();
        assert_eq!(loaded.node_id(), id.node_id());
        let sig = loaded.sign(b"hello");
        assert!(verify(id.node_id(), b"hello", &sig));
    }

    #[test]
    fn wrong_passphrase_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys_dir(dir.path());
        NodeIdentity::keygen().store_encrypted(&keys, "right").unwrap();

        match NodeIdentity::load_encrypted(&keys, "wrong") {
            Err(NodeError::Auth(AuthError::BadPassphrase)) => {}
            other => panic!("expected BadPassphrase, got {other:?}"),
        }
    }

    #[test]
    fn load_or_generate_is_stable_across_boots() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys_dir(dir.path());
        let first = NodeIdentity::load_or_generate(&keys, "pw").unwrap();
        let second = NodeIdentity::load_or_generate(&keys, "pw").unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }
}
