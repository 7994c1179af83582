//! CAN frame data types and the frame-level codec

use core::convert::TryFrom;

use tamarack_core::{InvalidValue, TransferId};

/// The maximum number of data bytes in a frame
#[cfg(not(feature = "can-fd"))]
pub const FRAME_CAPACITY: usize = 8;
/// The maximum number of data bytes in a frame
#[cfg(feature = "can-fd")]
pub const FRAME_CAPACITY: usize = 64;

/// A 29-bit extended CAN identifier
///
/// Lower values win bus arbitration, so the derived ordering of this type is the order in
/// which competing frames reach the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanId(u32);

impl CanId {
    /// The largest valid extended CAN ID
    pub const MAX: CanId = CanId(0x1fff_ffff);
}

impl TryFrom<u32> for CanId {
    type Error = InvalidValue;
    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        if bits <= CanId::MAX.0 {
            Ok(CanId(bits))
        } else {
            Err(InvalidValue::default())
        }
    }
}

impl From<CanId> for u32 {
    fn from(id: CanId) -> Self {
        id.0
    }
}

/// A CAN or CAN FD data frame
///
/// The library operates on extended-ID data frames only. Base-ID frames, remote frames, and
/// error frames never reach this type; a driver must filter them out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<I> {
    /// For RX frames: the time when the frame was received.
    /// For TX frames: the transmission deadline.
    timestamp: I,
    /// The 29-bit CAN ID
    id: CanId,
    /// The frame data
    data: heapless::Vec<u8, FRAME_CAPACITY>,
}

impl<I> Frame<I> {
    /// Creates a frame
    ///
    /// # Panics
    ///
    /// This function panics if `data` is longer than `FRAME_CAPACITY`.
    pub fn new(timestamp: I, id: CanId, data: &[u8]) -> Self {
        Frame {
            timestamp,
            id,
            data: heapless::Vec::from_slice(data).expect("frame data too long"),
        }
    }

    /// Returns the timestamp of this frame
    pub fn timestamp(&self) -> I
    where
        I: Clone,
    {
        self.timestamp.clone()
    }

    /// Returns the CAN ID of this frame
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Returns the data in this frame
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// The tail byte, the last data byte of every frame
///
/// Bit layout: `(start << 7) | (end << 6) | (toggle << 5) | transfer_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailByte {
    start: bool,
    end: bool,
    toggle: bool,
    transfer_id: TransferId,
}

impl TailByte {
    /// Creates a tail byte
    pub fn new(start: bool, end: bool, toggle: bool, transfer_id: TransferId) -> Self {
        TailByte {
            start,
            end,
            toggle,
            transfer_id,
        }
    }

    /// Extracts the fields of a tail byte
    pub fn parse(bits: u8) -> Self {
        TailByte {
            start: bits & 0x80 != 0,
            end: bits & 0x40 != 0,
            toggle: bits & 0x20 != 0,
            transfer_id: TransferId::from_truncating(bits),
        }
    }

    /// Returns true if this frame starts a transfer
    pub fn start(&self) -> bool {
        self.start
    }
    /// Returns true if this frame ends a transfer
    pub fn end(&self) -> bool {
        self.end
    }
    /// Returns the toggle bit
    pub fn toggle(&self) -> bool {
        self.toggle
    }
    /// Returns the transfer ID
    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }
}

impl From<TailByte> for u8 {
    fn from(tail: TailByte) -> Self {
        ((tail.start as u8) << 7)
            | ((tail.end as u8) << 6)
            | ((tail.toggle as u8) << 5)
            | u8::from(tail.transfer_id)
    }
}

/// The number of data bytes that each of the 16 DLC values denotes
const DLC_TO_LENGTH: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Rounds a frame length up to the nearest length that a DLC can express
///
/// Lengths up to 8 are returned unchanged; longer lengths round up through the CAN FD steps
/// 12, 16, 20, 24, 32, 48, and 64.
pub fn round_up_frame_length(length: usize) -> usize {
    match length {
        0..=8 => length,
        9..=12 => 12,
        13..=16 => 16,
        17..=20 => 20,
        21..=24 => 24,
        25..=32 => 32,
        33..=48 => 48,
        _ => 64,
    }
}

/// Converts a number of data bytes to the smallest DLC that can carry it
///
/// `length` must not exceed 64.
pub fn length_to_dlc(length: usize) -> u8 {
    match length {
        0..=8 => length as u8,
        9..=12 => 9,
        13..=16 => 10,
        17..=20 => 11,
        21..=24 => 12,
        25..=32 => 13,
        33..=48 => 14,
        _ => 15,
    }
}

/// Converts a DLC to the number of data bytes it denotes
///
/// `dlc` must be less than 16.
pub fn dlc_to_length(dlc: u8) -> usize {
    DLC_TO_LENGTH[usize::from(dlc)]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn can_id_range() {
        assert!(CanId::try_from(0).is_ok());
        assert!(CanId::try_from(0x1fff_ffff).is_ok());
        assert!(CanId::try_from(0x2000_0000).is_err());
    }

    #[test]
    fn tail_byte_round_trip() {
        // Every combination of flags and transfer ID survives encoding and parsing
        for &start in &[false, true] {
            for &end in &[false, true] {
                for &toggle in &[false, true] {
                    for id_bits in 0..32u8 {
                        let tail = TailByte::new(
                            start,
                            end,
                            toggle,
                            TransferId::from_truncating(id_bits),
                        );
                        assert_eq!(TailByte::parse(u8::from(tail)), tail);
                    }
                }
            }
        }
    }

    #[test]
    fn tail_byte_known_values() {
        // Single-frame transfer with ID 23
        let tail = TailByte::new(true, true, true, TransferId::from_truncating(23));
        assert_eq!(u8::from(tail), 0xf7);
        // First frame of a multi-frame transfer with ID 0
        let tail = TailByte::new(true, false, true, TransferId::from_truncating(0));
        assert_eq!(u8::from(tail), 0xa0);
    }

    #[test]
    fn legal_frame_lengths() {
        for length in 0..=8 {
            assert_eq!(round_up_frame_length(length), length);
        }
        assert_eq!(round_up_frame_length(9), 12);
        assert_eq!(round_up_frame_length(12), 12);
        assert_eq!(round_up_frame_length(15), 16);
        assert_eq!(round_up_frame_length(33), 48);
        assert_eq!(round_up_frame_length(49), 64);
        assert_eq!(round_up_frame_length(64), 64);
    }

    #[test]
    fn dlc_length_round_trip() {
        for dlc in 0..16u8 {
            assert_eq!(length_to_dlc(dlc_to_length(dlc)), dlc);
        }
        // Lengths between steps round up to the next DLC
        assert_eq!(length_to_dlc(9), 9);
        assert_eq!(length_to_dlc(11), 9);
        assert_eq!(length_to_dlc(63), 15);
        for length in 0..=64 {
            assert_eq!(dlc_to_length(length_to_dlc(length)), round_up_frame_length(length));
        }
    }
}
