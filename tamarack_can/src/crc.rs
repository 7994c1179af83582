//! Transfer CRC calculation

use core::fmt;

use crc_any::CRCu16;

/// The CRC-16/CCITT-FALSE function applied to transfer payloads
///
/// Appending the CRC of a byte sequence to that sequence, most significant byte first, makes
/// the CRC of the whole evaluate to zero. The receive pipeline relies on that property to
/// validate multi-frame transfers without buffering the trailer separately.
pub struct TransferCrc {
    crc: CRCu16,
}

impl TransferCrc {
    /// Creates a CRC calculator with the initial value 0xffff
    pub fn new() -> Self {
        TransferCrc {
            crc: CRCu16::crc16ccitt_false(),
        }
    }

    /// Adds one byte
    pub fn add(&mut self, byte: u8) {
        self.crc.digest(&[byte]);
    }

    /// Adds a sequence of bytes
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.crc.digest(bytes);
    }

    /// Returns the current CRC value
    pub fn get(&mut self) -> u16 {
        self.crc.get_crc()
    }
}

impl Default for TransferCrc {
    fn default() -> Self {
        TransferCrc::new()
    }
}

impl fmt::Debug for TransferCrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCrc").finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty() {
        assert_eq!(TransferCrc::new().get(), 0xffff);
    }

    #[test]
    fn check_value() {
        // The standard CRC-16/CCITT-FALSE check value
        let mut crc = TransferCrc::new();
        crc.add_bytes(b"123456789");
        assert_eq!(crc.get(), 0x29b1);
    }

    #[test]
    fn byte_at_a_time_matches_slice() {
        let bytes = [0x12, 0x34, 0x56, 0xff, 0x00, 0x01];
        let mut by_byte = TransferCrc::new();
        for &byte in bytes.iter() {
            by_byte.add(byte);
        }
        let mut by_slice = TransferCrc::new();
        by_slice.add_bytes(&bytes);
        assert_eq!(by_byte.get(), by_slice.get());
    }

    #[test]
    fn appended_crc_yields_zero() {
        let payload = [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let mut crc = TransferCrc::new();
        crc.add_bytes(&payload);
        let value = crc.get();
        crc.add((value >> 8) as u8);
        crc.add(value as u8);
        assert_eq!(crc.get(), 0);
    }
}
