#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! # strata-core
//!
//! Primitives shared by the strata gateway daemon and its clients.
//!
//! This crate provides:
//! - SHA-256 hashing with a hex-friendly [`Hash`] type
//! - Public-key parsing and canonicalization (OpenSSH lines, raw and hex keys)
//! - Key fingerprints in the familiar `SHA256:<base64>` form
//! - Signature verification for Ed25519 and ECDSA P-256
//!
//! ## Quick Start
//!
//! ```rust
//! use strata_core::{sha256, Keypair, PublicKey};
//!
//! let hash = sha256(b"hello world");
//! assert_eq!(hash.as_bytes().len(), 32);
//!
//! let keypair = Keypair::generate();
//! let key = PublicKey::parse(keypair.public_key_ssh().as_bytes()).unwrap();
//! let signature = keypair.sign(b"nonce");
//! assert!(key.verify(b"nonce", &signature));
//! ```

pub mod error;
pub mod hashing;
pub mod keys;
pub mod signing;

pub use error::{Error, Result};
pub use hashing::{sha256, sha256_hex, Hash};
pub use keys::{decode_signature, verify_signature, KeyType, PublicKey};
pub use signing::Keypair;

/// Commonly used types
pub mod prelude {
    pub use crate::{sha256, Error, Hash, KeyType, Keypair, PublicKey, Result};
}
