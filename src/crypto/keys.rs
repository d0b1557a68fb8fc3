//! BabyJubJub EdDSA-Poseidon keys.
//!
//! The issuer signs state transitions and claims with a BabyJubJub key.
//! Signatures are over a single field element, as the circuits expect.

use babyjubjub_rs::{decompress_point, decompress_signature, Fr, PrivateKey};
use ff_ce::to_hex;
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::Num;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroizing;

use crate::field::in_field;

#[derive(Clone, Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("message is not a field element")]
    MessageNotInField,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("key file: {0}")]
    KeyFile(String),
}

/// Affine BabyJubJub point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub x: BigUint,
    pub y: BigUint,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub r8x: BigUint,
    pub r8y: BigUint,
    pub s: BigUint,
    /// Compressed form: packed R8 followed by S, little-endian.
    pub compressed: [u8; 64],
}

/// Signs field elements on behalf of the issuer.
pub trait StateSigner: Send + Sync {
    fn public_key(&self) -> &PublicKey;
    fn sign(&self, message: &BigUint) -> Result<Signature, CryptoError>;
}

pub struct BabyJubJubKey {
    secret: Zeroizing<[u8; 32]>,
    public: PublicKey,
}

impl BabyJubJubKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let secret = Zeroizing::new(bytes);
        let key = PrivateKey::import(secret.to_vec()).map_err(CryptoError::InvalidKey)?;
        let point = key.public();
        let public = PublicKey {
            x: fr_to_biguint(&point.x)?,
            y: fr_to_biguint(&point.y)?,
        };
        Ok(BabyJubJubKey { secret, public })
    }

    /// Parse a 32-byte key from hex, with or without `0x`.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw = Zeroizing::new(
            hex::decode(s.trim().trim_start_matches("0x"))
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        );
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", raw.len())))?;
        Self::from_bytes(bytes)
    }

    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        Self::from_bytes(bytes)
    }

    /// Load the hex key stored at `path`, or generate one and store it there
    /// with owner-only permissions.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        let io = |e: std::io::Error| CryptoError::KeyFile(format!("{}: {e}", path.display()));
        if path.exists() {
            let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(io)?);
            let key = Self::from_hex(&contents)?;
            tracing::info!("Loaded BabyJubJub key from {}", path.display());
            return Ok(key);
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        let key = Self::generate()?;
        let encoded = Zeroizing::new(hex::encode(&key.secret[..]));
        std::fs::write(path, encoded.as_bytes()).map_err(io)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io)?;
        }
        tracing::info!("Generated BabyJubJub key at {}", path.display());
        Ok(key)
    }

    fn private_key(&self) -> Result<PrivateKey, CryptoError> {
        PrivateKey::import(self.secret.to_vec()).map_err(CryptoError::InvalidKey)
    }

    pub fn verify(&self, message: &BigUint, signature: &Signature) -> bool {
        let Ok(key) = self.private_key() else {
            return false;
        };
        match decompress_signature(&signature.compressed) {
            Ok(sig) => babyjubjub_rs::verify(
                key.public(),
                sig,
                BigInt::from_biguint(Sign::Plus, message.clone()),
            ),
            Err(_) => false,
        }
    }
}

impl StateSigner for BabyJubJubKey {
    fn public_key(&self) -> &PublicKey {
        &self.public
    }

    fn sign(&self, message: &BigUint) -> Result<Signature, CryptoError> {
        if !in_field(message) {
            return Err(CryptoError::MessageNotInField);
        }
        let key = self.private_key()?;
        let compressed = key
            .sign(BigInt::from_biguint(Sign::Plus, message.clone()))
            .map_err(CryptoError::Signing)?
            .compress();
        // Packed R8 in the first half, S little-endian in the second.
        let mut packed_r8 = [0u8; 32];
        packed_r8.copy_from_slice(&compressed[..32]);
        let r8 = decompress_point(packed_r8).map_err(CryptoError::Signing)?;
        Ok(Signature {
            r8x: fr_to_biguint(&r8.x)?,
            r8y: fr_to_biguint(&r8.y)?,
            s: BigUint::from_bytes_le(&compressed[32..]),
            compressed,
        })
    }
}

fn fr_to_biguint(fr: &Fr) -> Result<BigUint, CryptoError> {
    BigUint::from_str_radix(&to_hex(fr), 16).map_err(|e| CryptoError::Signing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::modulus;

    const TEST_KEY: &str = "0x819b6b1176c547655f9fed5589eaaf1ef4a32aab9b46a4190d13d5c81a822117";

    #[test]
    fn public_key_is_deterministic() {
        let a = BabyJubJubKey::from_hex(TEST_KEY).unwrap();
        let b = BabyJubJubKey::from_hex(TEST_KEY).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert!(in_field(&a.public_key().x));
        assert!(in_field(&a.public_key().y));
    }

    #[test]
    fn sign_and_verify() {
        let key = BabyJubJubKey::from_hex(TEST_KEY).unwrap();
        let msg = BigUint::from(123456789u64);
        let sig = key.sign(&msg).unwrap();
        assert!(key.verify(&msg, &sig));
        assert!(!key.verify(&BigUint::from(1u8), &sig));
    }

    #[test]
    fn signature_components_repack_to_compressed_form() {
        use ff_ce::PrimeField;

        let key = BabyJubJubKey::from_hex(TEST_KEY).unwrap();
        let sig = key.sign(&BigUint::from(987654321u64)).unwrap();
        assert!(in_field(&sig.r8x));
        assert!(in_field(&sig.r8y));
        assert!(in_field(&sig.s));

        let r8 = babyjubjub_rs::Point {
            x: Fr::from_str(&sig.r8x.to_string()).unwrap(),
            y: Fr::from_str(&sig.r8y.to_string()).unwrap(),
        };
        assert_eq!(r8.compress(), sig.compressed[..32]);
        let mut s = sig.s.to_bytes_le();
        s.resize(32, 0);
        assert_eq!(s, sig.compressed[32..]);
    }

    #[test]
    fn public_key_serializes_as_coordinates() {
        let key = BabyJubJubKey::from_hex(TEST_KEY).unwrap();
        let json = serde_json::to_string(key.public_key()).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, key.public_key());
    }

    #[test]
    fn signing_is_deterministic() {
        let key = BabyJubJubKey::from_hex(TEST_KEY).unwrap();
        let msg = BigUint::from(42u8);
        assert_eq!(key.sign(&msg).unwrap(), key.sign(&msg).unwrap());
    }

    #[test]
    fn out_of_field_message_rejected() {
        let key = BabyJubJubKey::from_hex(TEST_KEY).unwrap();
        assert!(matches!(
            key.sign(modulus()),
            Err(CryptoError::MessageNotInField)
        ));
    }

    #[test]
    fn bad_hex_rejected() {
        assert!(BabyJubJubKey::from_hex("0x1234").is_err());
        assert!(BabyJubJubKey::from_hex("zz").is_err());
    }

    #[test]
    fn generated_keys_differ() {
        let a = BabyJubJubKey::generate().unwrap();
        let b = BabyJubJubKey::generate().unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn key_file_is_created_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("babyjubjub.key");
        let created = BabyJubJubKey::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let loaded = BabyJubJubKey::load_or_generate(&path).unwrap();
        assert_eq!(created.public_key(), loaded.public_key());
    }

    #[test]
    fn corrupt_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("babyjubjub.key");
        std::fs::write(&path, "not hex").unwrap();
        assert!(matches!(
            BabyJubJubKey::load_or_generate(&path),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
