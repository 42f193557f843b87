//! Hashing and signature primitives.
//!
//! Record content hashes are the first [`RECORD_HASH_SIZE`] bytes of a
//! SHA-256 digest over the record's canonical encoding. Node identity is an
//! ed25519 keypair; the verifying key doubles as the node's [`NodeRef`], so
//! a signed envelope carries everything needed to verify it.
//!
//! Key files are written with owner-only permissions and rejected on load
//! when group or world bits are set.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::id::{NodeRef, RECORD_HASH_SIZE};

/// Size of an ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a serialized secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Computes the 28-byte record content hash over canonical bytes.
#[must_use]
pub fn record_hash(bytes: &[u8]) -> [u8; RECORD_HASH_SIZE] {
    let digest = Sha256::digest(bytes);
    let mut hash = [0u8; RECORD_HASH_SIZE];
    hash.copy_from_slice(&digest[..RECORD_HASH_SIZE]);
    hash
}

/// Computes a full 32-byte SHA-256 digest.
#[must_use]
pub fn digest32(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Errors raised by key handling and signature verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// I/O error during key file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key file contents were not a valid secret key.
    #[error("invalid key material in {path}")]
    InvalidKeyMaterial {
        /// The offending file.
        path: String,
    },

    /// Key file permissions allow access beyond the owner.
    #[error("insecure permissions on key file: {path}")]
    InsecurePermissions {
        /// The offending file.
        path: String,
    },

    /// The sender bytes were not a valid verifying key.
    #[error("invalid verifying key")]
    InvalidVerifyingKey,

    /// The signature did not verify against the payload.
    #[error("signature verification failed")]
    BadSignature,
}

/// A node's signing identity.
pub struct NodeKeypair {
    signing: SigningKey,
}

impl NodeKeypair {
    /// Generates a fresh keypair from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut rng),
        }
    }

    /// Restores a keypair from secret-key bytes.
    #[must_use]
    pub fn from_secret_bytes(bytes: &[u8; SECRET_KEY_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    /// The node reference derived from this keypair.
    #[must_use]
    pub fn reference(&self) -> NodeRef {
        NodeRef::from_bytes(self.signing.verifying_key().to_bytes())
    }

    /// Signs a payload, returning the 64-byte signature.
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.signing.sign(payload).to_bytes().to_vec()
    }

    /// Writes the secret key to `path` with mode 0600.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&self.signing.to_bytes())?;
        Ok(())
    }

    /// Loads a secret key from `path`, rejecting insecure permissions.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let meta = fs::metadata(path)?;
        if meta.permissions().mode() & 0o077 != 0 {
            return Err(CryptoError::InsecurePermissions {
                path: path.display().to_string(),
            });
        }
        let mut file = OpenOptions::new().read(true).open(path)?;
        let mut buf = Zeroizing::new(Vec::with_capacity(SECRET_KEY_SIZE));
        file.read_to_end(&mut buf)?;
        let bytes: [u8; SECRET_KEY_SIZE] =
            buf.as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyMaterial {
                    path: path.display().to_string(),
                })?;
        Ok(Self::from_secret_bytes(&bytes))
    }
}

/// Verifies `signature` over `payload` against the sender's key bytes.
pub fn verify_signature(
    sender: &NodeRef,
    payload: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(sender.as_bytes())
        .map_err(|_| CryptoError::InvalidVerifyingKey)?;
    let sig_bytes: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| CryptoError::BadSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify(payload, &signature)
        .map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn record_hash_is_stable_and_28_bytes() {
        let a = record_hash(b"payload");
        let b = record_hash(b"payload");
        let c = record_hash(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), RECORD_HASH_SIZE);
    }

    #[test]
    fn sign_and_verify() {
        let keys = NodeKeypair::generate();
        let sig = keys.sign(b"hello");
        assert!(verify_signature(&keys.reference(), b"hello", &sig).is_ok());
        assert!(verify_signature(&keys.reference(), b"tampered", &sig).is_err());
    }

    #[test]
    fn key_file_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("node.key");
        let keys = NodeKeypair::generate();
        keys.save(&path).expect("save key");

        let loaded = NodeKeypair::load(&path).expect("load key");
        assert_eq!(loaded.reference(), keys.reference());

        let mode = fs::metadata(&path).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn load_rejects_world_readable_key() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("node.key");
        NodeKeypair::generate().save(&path).expect("save key");
        let mut perms = fs::metadata(&path).expect("stat").permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&path, perms).expect("chmod");

        assert!(matches!(
            NodeKeypair::load(&path),
            Err(CryptoError::InsecurePermissions { .. })
        ));
    }
}
