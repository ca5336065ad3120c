//! Opaque SCAN cursor codec.
//!
//! A cursor is a plain `u64`. Zero means "start a new traversal" on input and
//! "traversal complete" on output. Any other value packs a scan position:
//!
//! ```text
//!  63        56 55       48 47                          16 15            0
//! ┌────────────┬───────────┬──────────────────────────────┬──────────────┐
//! │  reserved  │ generation│            slot              │    shard     │
//! └────────────┴───────────┴──────────────────────────────┴──────────────┘
//! ```
//!
//! The generation is derived from the per-shard slot count, so a cursor produced under
//! a different partition layout is rejected instead of silently skipping keys.

use crate::engine::ShardId;
use crate::error::{EngineError, EngineResult};

const SHARD_BITS: u32 = 16;
const SLOT_BITS: u32 = 32;
const GENERATION_SHIFT: u32 = SHARD_BITS + SLOT_BITS;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;
const SHARD_MASK: u64 = (1 << SHARD_BITS) - 1;
const GENERATION_MASK: u64 = 0xff;

/// A decoded scan position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanCursor {
    pub shard: ShardId,
    pub slot: usize,
}

impl ScanCursor {
    /// Position of a fresh traversal.
    pub const START: ScanCursor = ScanCursor { shard: 0, slot: 0 };

    fn generation(slots_per_shard: usize) -> u64 {
        // Never zero, so an encoded cursor never collides with the start cursor.
        u64::from(slots_per_shard.trailing_zeros()) + 1
    }

    /// Packs this position into its opaque form.
    pub fn encode(&self, slots_per_shard: usize) -> u64 {
        (Self::generation(slots_per_shard) << GENERATION_SHIFT)
            | ((self.slot as u64 & SLOT_MASK) << SHARD_BITS)
            | u64::from(self.shard)
    }

    /// Unpacks and validates a client-supplied cursor.
    pub fn decode(raw: u64, shard_count: usize, slots_per_shard: usize) -> EngineResult<Self> {
        if raw == 0 {
            return Ok(Self::START);
        }

        let invalid = || EngineError::invalid("invalid cursor");
        if raw >> (GENERATION_SHIFT + 8) != 0
            || (raw >> GENERATION_SHIFT) & GENERATION_MASK != Self::generation(slots_per_shard)
        {
            return Err(invalid());
        }

        let cursor = ScanCursor {
            shard: (raw & SHARD_MASK) as ShardId,
            slot: ((raw >> SHARD_BITS) & SLOT_MASK) as usize,
        };
        if cursor.shard as usize >= shard_count || cursor.slot >= slots_per_shard {
            return Err(invalid());
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_start() {
        assert_eq!(ScanCursor::decode(0, 4, 1024).unwrap(), ScanCursor::START);
    }

    #[test]
    fn test_encoded_positions_decode_back() {
        let cursor = ScanCursor { shard: 3, slot: 517 };
        let raw = cursor.encode(1024);
        assert_ne!(raw, 0);
        assert_eq!(ScanCursor::decode(raw, 4, 1024).unwrap(), cursor);

        // Even the start position encodes to a non-zero value mid-traversal.
        assert_ne!(ScanCursor::START.encode(1024), 0);
    }

    #[test]
    fn test_rejects_foreign_cursors() {
        let raw = ScanCursor { shard: 3, slot: 5 }.encode(1024);
        // Different layout generation.
        assert!(ScanCursor::decode(raw, 4, 2048).is_err());
        // Shard out of range.
        assert!(ScanCursor::decode(raw, 2, 1024).is_err());
        // Garbage.
        assert!(ScanCursor::decode(u64::MAX, 4, 1024).is_err());
        assert!(ScanCursor::decode(12345, 4, 1024).is_err());
    }
}
