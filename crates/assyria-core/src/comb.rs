//! Time-ordered ("comb") 128-bit identifiers.
//!
//! Comb identifiers are UUIDv7: a 48-bit millisecond Unix timestamp in the
//! high bytes, then a counter and random bits. `uuid` shares one v7 context
//! per process, so identifiers drawn in sequence strictly increase even
//! within a millisecond and their 8-byte prefix never goes backwards.

use uuid::Uuid;

/// Next comb identifier.
pub fn next_comb() -> Uuid {
    Uuid::now_v7()
}

/// Millisecond timestamp embedded in a comb identifier.
pub fn comb_timestamp(id: &Uuid) -> u64 {
    let mut buf = [0_u8; 8];
    buf[2..].copy_from_slice(&id.as_bytes()[..6]);
    u64::from_be_bytes(buf)
}

/// Ordered 8-byte prefix of a comb identifier.
pub fn comb_prefix(id: &Uuid) -> [u8; 8] {
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&id.as_bytes()[..8]);
    prefix
}
