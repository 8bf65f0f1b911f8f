//! Hashing, address derivation and ECDSA signatures

use crate::types::{Address, Hash};
use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

fn secp() -> &'static Secp256k1<All> {
    static CTX: OnceLock<Secp256k1<All>> = OnceLock::new();
    CTX.get_or_init(Secp256k1::new)
}

/// Double SHA-256
pub fn sha256d(data: &[u8]) -> Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(data);
    sha256d::Hash::from_engine(engine).into_inner()
}

/// RIPEMD-160(SHA-256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let digest = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Address owned by a serialized public key
pub fn address_from_public_key(public_key: &[u8]) -> Address {
    Address::from_key_hash(hash160(public_key))
}

/// Verify a 64-byte compact signature over `digest` against a compressed public key
pub fn verify_signature(public_key: &[u8], signature: &[u8], digest: &Hash) -> bool {
    let pubkey = match PublicKey::from_slice(public_key) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let sig = match Signature::from_compact(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    let message = Message::from_digest(*digest);
    secp().verify_ecdsa(&message, &sig, &pubkey).is_ok()
}

/// Signing key with its derived public key and address
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// `None` if the bytes are not a valid secp256k1 scalar
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Option<Self> {
        let secret = SecretKey::from_slice(bytes).ok()?;
        let public = PublicKey::from_secret_key(secp(), &secret);
        Some(KeyPair { secret, public })
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.serialize().to_vec()
    }

    pub fn address(&self) -> Address {
        address_from_public_key(&self.public.serialize())
    }

    /// Compact signature over a 32-byte digest
    pub fn sign(&self, digest: &Hash) -> Vec<u8> {
        let message = Message::from_digest(*digest);
        secp()
            .sign_ecdsa(&message, &self.secret)
            .serialize_compact()
            .to_vec()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256d_empty() {
        // sha256d("") is a well-known constant
        assert_eq!(
            hex::encode(sha256d(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_hash160_length_and_determinism() {
        assert_eq!(hash160(b"abc"), hash160(b"abc"));
        assert_ne!(hash160(b"abc"), hash160(b"abd"));
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::from_secret_bytes(&[7u8; 32]).unwrap();
        let digest = sha256d(b"payload");
        let sig = kp.sign(&digest);
        assert_eq!(sig.len(), 64);
        assert!(verify_signature(&kp.public_key_bytes(), &sig, &digest));

        let other = sha256d(b"other payload");
        assert!(!verify_signature(&kp.public_key_bytes(), &sig, &other));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let digest = sha256d(b"x");
        assert!(!verify_signature(&[0u8; 33], &[0u8; 64], &digest));
        assert!(!verify_signature(&[2u8; 10], &[0u8; 64], &digest));
    }

    #[test]
    fn test_zero_secret_is_invalid() {
        assert!(KeyPair::from_secret_bytes(&[0u8; 32]).is_none());
    }

    #[test]
    fn test_address_matches_public_key() {
        let kp = KeyPair::from_secret_bytes(&[9u8; 32]).unwrap();
        assert_eq!(kp.address(), address_from_public_key(&kp.public_key_bytes()));
        assert_eq!(kp.address().as_str().len(), 40);
    }
}
