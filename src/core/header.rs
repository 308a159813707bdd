//! Block header
//!
//! The 80-byte header is the unit this node indexes and gossips. The hash
//! is recomputed on demand rather than cached next to mutable fields, so a
//! header can never be observed with a stale id.

use crate::core::hash256::Hash256;
use crate::core::serialize::{DecodeError, Decoder, Encoder};
use crate::crypto::double_sha256;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// Serialized block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// A block header as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: i32,
    /// Hash of the previous block header
    pub prev_block: Hash256,
    /// Merkle root of the block's transactions
    pub merkle_root: Hash256,
    /// Block creation time (unix seconds)
    pub time: u32,
    /// Compact-encoded proof-of-work target
    pub bits: u32,
    /// Proof-of-work nonce
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialize the 80-byte wire form
    pub fn encode(&self, enc: &mut Encoder) {
        enc.write_i32_le(self.version);
        enc.write_hash(&self.prev_block);
        enc.write_hash(&self.merkle_root);
        enc.write_u32_le(self.time);
        enc.write_u32_le(self.bits);
        enc.write_u32_le(self.nonce);
    }

    /// Deserialize the 80-byte wire form
    pub fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: dec.read_i32_le("header.version")?,
            prev_block: dec.read_hash("header.prev_block")?,
            merkle_root: dec.read_hash("header.merkle_root")?,
            time: dec.read_u32_le("header.time")?,
            bits: dec.read_u32_le("header.bits")?,
            nonce: dec.read_u32_le("header.nonce")?,
        })
    }

    /// Double SHA-256 of the serialized header. Always recomputed.
    pub fn hash(&self) -> Hash256 {
        let mut enc = Encoder::with_capacity(BLOCK_HEADER_SIZE);
        self.encode(&mut enc);
        Hash256::from_bytes(double_sha256(&enc.into_inner()))
    }

    /// Expand the compact `bits` encoding into a 256-bit target.
    /// Returns None for negative, zero, or overflowing encodings.
    pub fn target(&self) -> Option<U256> {
        let exponent = (self.bits >> 24) as usize;
        let mantissa = self.bits & 0x007f_ffff;
        if mantissa == 0 || self.bits & 0x0080_0000 != 0 {
            return None;
        }
        // Overflow: the mantissa's top byte would shift past 256 bits
        if exponent > 34
            || (mantissa > 0xff && exponent > 33)
            || (mantissa > 0xffff && exponent > 32)
        {
            return None;
        }
        let target = if exponent <= 3 {
            U256::from(mantissa >> (8 * (3 - exponent)))
        } else {
            U256::from(mantissa) << (8 * (exponent - 3))
        };
        if target.is_zero() {
            None
        } else {
            Some(target)
        }
    }

    /// Expected work for one block meeting this header's target:
    /// 2^256 / (target + 1), computed as ~target / (target + 1) + 1
    pub fn work(&self) -> U256 {
        match self.target() {
            Some(target) => (!target / (target + U256::one())) + U256::one(),
            None => U256::zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn genesis_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: Hash256::ZERO,
            merkle_root: Hash256::from_str(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            )
            .unwrap(),
            time: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        }
    }

    #[test]
    fn test_genesis_hash() {
        assert_eq!(
            genesis_header().hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let header = genesis_header();
        let mut enc = Encoder::new();
        header.encode(&mut enc);
        let bytes = enc.into_inner();
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE);

        let mut dec = Decoder::new(&bytes);
        let decoded = BlockHeader::decode(&mut dec).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_compact_target_expansion() {
        // 0x1d00ffff expands to 0x00000000ffff << 208
        let target = genesis_header().target().unwrap();
        assert_eq!(target, U256::from(0xffffu64) << 208);
    }

    #[test]
    fn test_work_is_positive_for_valid_bits() {
        let work = genesis_header().work();
        // 2^256 / (2^224 - ish) = slightly above 2^32
        assert!(work > U256::from(u32::MAX));
        assert!(work < U256::from(u64::MAX));
    }

    #[test]
    fn test_invalid_bits_yield_zero_work() {
        let mut header = genesis_header();
        header.bits = 0; // zero mantissa
        assert_eq!(header.work(), U256::zero());
        header.bits = 0x0180_0000; // negative flag
        assert_eq!(header.work(), U256::zero());
        header.bits = 0xff00_ffff; // exponent overflow
        assert_eq!(header.work(), U256::zero());
    }
}
