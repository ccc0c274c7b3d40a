//! The CAN transfer CRC: CRC-16/CCITT-FALSE, appended to the wire big-endian.

use cyphal_crc::Crc16Ccitt;

/// Thin wrapper matching the byte-at-a-time accumulation style used by the transmitter and
/// receiver: unlike [`Crc16Ccitt::value_as_bytes`] (little-endian, a generic convenience), the CAN
/// wire convention appends this CRC most-significant-byte first (see DESIGN.md).
#[derive(Clone, Default)]
pub struct TransferCrc(Crc16Ccitt);

impl TransferCrc {
    pub fn new() -> Self {
        TransferCrc(Crc16Ccitt::new())
    }

    pub fn add(&mut self, byte: u8) {
        self.0.add(&[byte]);
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.0.add(bytes);
    }

    pub fn get(&self) -> u16 {
        self.0.value()
    }

    /// The two CRC bytes in CAN wire order (most significant byte first).
    pub fn big_endian_bytes(&self) -> [u8; 2] {
        self.get().to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_crc16_ccitt_false() {
        let mut crc = TransferCrc::new();
        crc.add_bytes(b"123456789");
        assert_eq!(crc.get(), 0x29B1);
    }

    #[test]
    fn self_check_residue() {
        let mut crc = TransferCrc::new();
        crc.add_bytes(b"payload");
        let bytes = crc.big_endian_bytes();
        crc.add_bytes(&bytes);
        assert_eq!(crc.get(), 0);
    }
}
