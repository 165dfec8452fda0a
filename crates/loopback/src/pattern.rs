//! Deterministic test payload generation and verification.
//!
//! The payload is an 8-bit counter starting at a seed value and wrapping
//! modulo 256. Verification regenerates the sequence instead of keeping a
//! copy, so it shares no state with the send path.

use core::fmt;

/// Location and values of the first verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Byte offset of the first differing byte.
    pub index: usize,
    pub expected: u8,
    pub actual: u8,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "index {}: expected {:#04x}, got {:#04x}",
            self.index, self.expected, self.actual
        )
    }
}

/// Fill `buf` with the counter pattern starting at `seed`.
pub fn fill(buf: &mut [u8], seed: u8) {
    for (index, byte) in buf.iter_mut().enumerate() {
        *byte = seed.wrapping_add(index as u8);
    }
}

/// Compare `buf` against the regenerated pattern, reporting the first
/// difference.
pub fn verify(buf: &[u8], seed: u8) -> Result<(), Mismatch> {
    for (index, &actual) in buf.iter().enumerate() {
        let expected = seed.wrapping_add(index as u8);
        if actual != expected {
            return Err(Mismatch {
                index,
                expected,
                actual,
            });
        }
    }
    Ok(())
}
