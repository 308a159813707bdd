//! Cryptographic primitives
//!
//! SHA-256 hashing consumed by block headers and message framing.

pub mod hash;

pub use hash::{checksum, double_sha256, sha256};
