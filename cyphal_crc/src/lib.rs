//!
//! Stateful CRC accumulators for the two checksums used across the Cyphal transport layer:
//! CRC-16/CCITT-FALSE (CAN multi-frame transfer CRC) and CRC-32C/Castagnoli (serial and UDP).
//!

#![no_std]

use crc_any::{CRCu16, CRCu32};

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no XOR-out.
///
/// Used to protect multi-frame CAN transfers. The two-byte value is appended to the wire stream
/// big-endian (most significant byte first); see `cyphal_can` for that convention — this type's
/// [`value_as_bytes`](Crc16Ccitt::value_as_bytes) returns little-endian bytes as a generic
/// convenience and is not used by the CAN transport directly.
#[derive(Clone)]
pub struct Crc16Ccitt(CRCu16);

impl Crc16Ccitt {
    /// The residue produced by feeding a correctly CRC-terminated stream back through the
    /// accumulator.
    pub const RESIDUE: u16 = 0x0000;

    pub fn new() -> Self {
        Crc16Ccitt(CRCu16::crc16ccitt_false())
    }

    /// Convenience constructor that immediately folds in one or more byte slices.
    pub fn of<'a, I>(slices: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut crc = Self::new();
        for slice in slices {
            crc.add(slice);
        }
        crc
    }

    pub fn add(&mut self, bytes: &[u8]) {
        self.0.digest(bytes);
    }

    pub fn value(&self) -> u16 {
        self.0.get_crc()
    }

    pub fn value_as_bytes(&self) -> [u8; 2] {
        self.value().to_le_bytes()
    }

    pub fn check_residue(&self) -> bool {
        self.value() == Self::RESIDUE
    }
}

impl Default for Crc16Ccitt {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-32C/Castagnoli: poly 0x1EDC6F41, reflected, init 0xFFFFFFFF, XOR-out 0xFFFFFFFF.
///
/// Used by the serial transport (header and payload checksums) and by the generic high-overhead
/// transfer reassembler's trailing transfer CRC.
#[derive(Clone)]
pub struct Crc32c(CRCu32);

impl Crc32c {
    /// The residue produced by feeding a correctly CRC-terminated stream back through the
    /// accumulator. Non-zero because of the non-zero XOR-out.
    pub const RESIDUE: u32 = 0xB798_B438;

    pub fn new() -> Self {
        Crc32c(CRCu32::crc32c())
    }

    pub fn of<'a, I>(slices: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut crc = Self::new();
        for slice in slices {
            crc.add(slice);
        }
        crc
    }

    pub fn add(&mut self, bytes: &[u8]) {
        self.0.digest(bytes);
    }

    pub fn value(&self) -> u32 {
        self.0.get_crc()
    }

    pub fn value_as_bytes(&self) -> [u8; 4] {
        self.value().to_le_bytes()
    }

    pub fn check_residue(&self) -> bool {
        self.value() == Self::RESIDUE
    }
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_check_value() {
        // The standard CRC-16/CCITT-FALSE check value for the ASCII string "123456789".
        let crc = Crc16Ccitt::of([b"123456789".as_ref()]);
        assert_eq!(crc.value(), 0x29B1);
    }

    #[test]
    fn crc16_residue_after_self_append() {
        let mut crc = Crc16Ccitt::new();
        crc.add(b"123");
        let value = crc.value();
        crc.add(&value.to_be_bytes());
        assert!(crc.check_residue());
    }

    #[test]
    fn crc32c_residue_after_self_append() {
        let mut crc = Crc32c::new();
        crc.add(b"123456789");
        let value = crc.value();
        crc.add(&value.to_le_bytes());
        assert!(crc.check_residue());
    }

    #[test]
    fn crc32c_check_value() {
        // The standard CRC-32C check value for the ASCII string "123456789".
        let crc = Crc32c::of([b"123456789".as_ref()]);
        assert_eq!(crc.value(), 0xE306_9283);
    }

    #[test]
    fn of_matches_sequential_add() {
        let a: &[u8] = b"hello, ";
        let b: &[u8] = b"world";
        let combined = Crc32c::of([a, b]);
        let mut sequential = Crc32c::new();
        sequential.add(a);
        sequential.add(b);
        assert_eq!(combined.value(), sequential.value());
    }
}
