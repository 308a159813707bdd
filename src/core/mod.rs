//! Core protocol types
//!
//! This module contains the building blocks everything else is expressed
//! in terms of:
//! - 256-bit hashes (block ids)
//! - The 80-byte block header with compact-target work arithmetic
//! - Little-endian / varint wire serialization
//! - Static per-network parameters (magic, port, seeds, genesis)

pub mod hash256;
pub mod header;
pub mod params;
pub mod serialize;

pub use hash256::Hash256;
pub use header::{BlockHeader, BLOCK_HEADER_SIZE};
pub use params::{Network, Params, MAGIC_MAIN, MAGIC_REGTEST, MAGIC_TESTNET};
pub use serialize::{DecodeError, Decoder, Encoder};
