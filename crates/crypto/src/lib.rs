//! Ed25519 identity keys and the sign/verify oracle consumed by the
//! handshake. No curve arithmetic lives outside this crate.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use veil_types::{Identifier, IDENTIFIER_LEN};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SECRET_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signature")]
    InvalidSignature,
}

/// A peer's long-term identity: an ed25519 keypair. The peer's
/// [`Identifier`] is the SHA-256 digest of the public key.
#[derive(Debug)]
pub struct IdentityKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKey {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; SECRET_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SECRET_KEY_LEN,
                    actual: bytes.len(),
                })?;
        let signing_key = SigningKey::from_bytes(&raw);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LEN] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.verifying_key.to_bytes()
    }

    pub fn identifier(&self) -> Identifier {
        derive_identifier(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Derive the stable peer name from a raw public key.
pub fn derive_identifier(public_key: &[u8; PUBLIC_KEY_LEN]) -> Identifier {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    let digest: [u8; IDENTIFIER_LEN] = hasher.finalize().into();
    Identifier::from_bytes(digest)
}

pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let raw_key: [u8; PUBLIC_KEY_LEN] = public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: PUBLIC_KEY_LEN,
            actual: public_key.len(),
        })?;
    let verifying_key =
        VerifyingKey::from_bytes(&raw_key).map_err(|_| CryptoError::InvalidPublicKey)?;

    let raw_sig: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_bytes(&raw_sig);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}
