use rand::rngs::OsRng;
use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Version byte prepended to the public key hash in an address
pub const VERSION: u8 = 0x00;

/// Number of checksum bytes appended to an address
pub const CHECKSUM_LENGTH: usize = 4;

/// Length of a public key hash (RIPEMD-160 output)
pub const PUB_KEY_HASH_LENGTH: usize = 20;

/// Length of a raw public key: the `x ‖ y` coordinates of the curve point
pub const PUBLIC_KEY_LENGTH: usize = 64;

/// Length of a compact signature: `r ‖ s`
pub const SIGNATURE_LENGTH: usize = 64;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Failed to sign message: {0}")]
    SigningError(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Represents a wallet with a secp256k1 keypair
#[derive(Debug, Clone)]
pub struct Wallet {
    secret_key: SecretKey,
    public_key: Vec<u8>,
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);

        Wallet {
            secret_key,
            public_key: raw_public_key(&public_key),
        }
    }

    /// Creates a wallet from an existing secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret_key = SecretKey::from_slice(secret_key_bytes)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;

        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);

        Ok(Wallet {
            secret_key,
            public_key: raw_public_key(&public_key),
        })
    }

    /// Gets the wallet's address: base58(version ‖ pubKeyHash ‖ checksum)
    pub fn address(&self) -> String {
        address_from_pub_key_hash(&self.public_key_hash())
    }

    /// Gets the wallet's raw public key (`x ‖ y`)
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Gets the hash that outputs owned by this wallet are locked to
    pub fn public_key_hash(&self) -> Vec<u8> {
        public_key_hash(&self.public_key)
    }

    /// Gets the wallet's secret key
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Exports the wallet's secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.secret_key.secret_bytes().to_vec()
    }
}

/// Drops the SEC1 `0x04` tag from an uncompressed point
fn raw_public_key(public_key: &PublicKey) -> Vec<u8> {
    public_key.serialize_uncompressed()[1..].to_vec()
}

/// Rebuilds a public key from its raw `x ‖ y` halves
pub fn public_key_from_raw(raw: &[u8]) -> Result<PublicKey, CryptoError> {
    if raw.len() != PUBLIC_KEY_LENGTH {
        return Err(CryptoError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            PUBLIC_KEY_LENGTH,
            raw.len()
        )));
    }

    let (x, y) = raw.split_at(PUBLIC_KEY_LENGTH / 2);
    let mut encoded = Vec::with_capacity(PUBLIC_KEY_LENGTH + 1);
    encoded.push(0x04);
    encoded.extend_from_slice(x);
    encoded.extend_from_slice(y);

    PublicKey::from_slice(&encoded).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// SHA-256 of arbitrary data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// RIPEMD-160(SHA-256(public_key))
pub fn public_key_hash(public_key: &[u8]) -> Vec<u8> {
    let sha = Sha256::digest(public_key);
    Ripemd160::digest(sha).to_vec()
}

/// First four bytes of the double SHA-256 of the payload
pub fn checksum(payload: &[u8]) -> Vec<u8> {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);

    second[..CHECKSUM_LENGTH].to_vec()
}

/// Encodes a public key hash as a base58check address
pub fn address_from_pub_key_hash(pub_key_hash: &[u8]) -> String {
    let mut versioned = Vec::with_capacity(1 + pub_key_hash.len() + CHECKSUM_LENGTH);
    versioned.push(VERSION);
    versioned.extend_from_slice(pub_key_hash);

    let checksum = checksum(&versioned);
    versioned.extend_from_slice(&checksum);

    bs58::encode(versioned).into_string()
}

/// Decodes an address back into the public key hash it locks to
///
/// Fails if the address is not base58, has the wrong length, or its checksum
/// does not match.
pub fn address_to_pub_key_hash(address: &str) -> Result<Vec<u8>, CryptoError> {
    let full = bs58::decode(address)
        .into_vec()
        .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

    if full.len() != 1 + PUB_KEY_HASH_LENGTH + CHECKSUM_LENGTH {
        return Err(CryptoError::InvalidAddress(format!(
            "{} has length {}",
            address,
            full.len()
        )));
    }

    let (versioned, actual_checksum) = full.split_at(full.len() - CHECKSUM_LENGTH);
    if checksum(versioned) != actual_checksum {
        return Err(CryptoError::InvalidAddress(format!(
            "{} has a bad checksum",
            address
        )));
    }

    Ok(versioned[1..].to_vec())
}

/// Recomputes and compares the checksum embedded in an address
pub fn validate_address(address: &str) -> bool {
    address_to_pub_key_hash(address).is_ok()
}

/// Signs a 32-byte digest, returning the compact `r ‖ s` signature
pub fn sign_digest(secret_key: &SecretKey, digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let secp = Secp256k1::new();
    let message =
        Message::from_digest_slice(digest).map_err(|e| CryptoError::SigningError(e.to_string()))?;

    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_compact().to_vec())
}

/// Verifies a compact `r ‖ s` signature over a 32-byte digest
///
/// A signature of the right length whose scalars are out of range is reported
/// as a failed verification, not an error.
pub fn verify_digest(
    public_key: &PublicKey,
    digest: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(CryptoError::InvalidSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LENGTH,
            signature.len()
        )));
    }

    let (r, s) = signature.split_at(SIGNATURE_LENGTH / 2);
    let mut compact = [0u8; SIGNATURE_LENGTH];
    compact[..SIGNATURE_LENGTH / 2].copy_from_slice(r);
    compact[SIGNATURE_LENGTH / 2..].copy_from_slice(s);

    let signature = match Signature::from_compact(&compact) {
        Ok(signature) => signature,
        Err(_) => return Ok(false),
    };

    let message = Message::from_digest_slice(digest)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    let secp = Secp256k1::verification_only();
    Ok(secp.verify_ecdsa(&message, &signature, public_key).is_ok())
}
