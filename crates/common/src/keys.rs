//! WireGuard key material

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

/// Base64 encoded Curve25519 key pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Source of WireGuard keys
pub trait KeyGenerator: Send + Sync {
    fn generate_keypair(&self) -> WgKeyPair;

    fn generate_preshared_key(&self) -> String;
}

/// Generates keys with x25519-dalek and the thread-local RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519KeyGenerator;

impl KeyGenerator for X25519KeyGenerator {
    fn generate_keypair(&self) -> WgKeyPair {
        let mut private_key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private_key_bytes);

        // Clamp the scalar the way `wg genkey` does
        private_key_bytes[0] &= 248;
        private_key_bytes[31] &= 127;
        private_key_bytes[31] |= 64;

        let secret = StaticSecret::from(private_key_bytes);
        let public = PublicKey::from(&secret);

        WgKeyPair {
            private_key: STANDARD.encode(private_key_bytes),
            public_key: STANDARD.encode(public.as_bytes()),
        }
    }

    fn generate_preshared_key(&self) -> String {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        STANDARD.encode(key)
    }
}

/// Derive the public key for a base64 private key
pub fn public_key_for(private_key: &str) -> crate::Result<String> {
    let bytes = STANDARD
        .decode(private_key.trim())
        .map_err(|e| crate::Error::Crypto(format!("invalid private key encoding: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| crate::Error::Crypto("private key must be 32 bytes".to_string()))?;

    let public = PublicKey::from(&StaticSecret::from(bytes));
    Ok(STANDARD.encode(public.as_bytes()))
}
