//! Issuer key material.

pub mod keys;

pub use keys::{BabyJubJubKey, CryptoError, PublicKey, Signature, StateSigner};
