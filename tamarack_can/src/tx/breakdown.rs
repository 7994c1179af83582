//! Accumulation of payload bytes into frame payloads

use tamarack_core::TransferId;

use crate::data::{TailByte, FRAME_CAPACITY};

/// The data bytes of one outgoing frame
pub type FrameData = heapless::Vec<u8, FRAME_CAPACITY>;

/// Collects a stream of payload bytes into MTU-sized frame payloads, appending a tail byte
/// to each
///
/// Feed every payload byte (and padding and CRC bytes, in wire order) through
/// [`add`](Breakdown::add), then call [`finish`](Breakdown::finish) exactly once for the
/// final frame. The start, end, and toggle bits of each tail byte follow from the frame's
/// position in the transfer.
pub struct Breakdown {
    mtu: usize,
    transfer_id: TransferId,
    toggle: bool,
    start: bool,
    data: FrameData,
}

impl Breakdown {
    pub fn new(mtu: usize, transfer_id: TransferId) -> Self {
        debug_assert!(mtu > 1 && mtu <= FRAME_CAPACITY);
        Breakdown {
            mtu,
            transfer_id,
            toggle: true,
            start: true,
            data: FrameData::new(),
        }
    }

    /// Adds a payload byte, returning a completed frame's data if the byte did not fit into
    /// the current frame
    ///
    /// Frames are held back until a byte overflows them, so the bytes still buffered when
    /// the input runs out always form the final frame.
    pub fn add(&mut self, byte: u8) -> Option<FrameData> {
        let completed = if self.data.len() == self.mtu - 1 {
            Some(self.take(false))
        } else {
            None
        };
        self.data.push(byte).expect("Bug: frame data full");
        completed
    }

    /// Appends the final tail byte and returns the data of the last frame
    pub fn finish(mut self) -> FrameData {
        self.take(true)
    }

    fn take(&mut self, end: bool) -> FrameData {
        let tail = TailByte::new(self.start, end, self.toggle, self.transfer_id);
        self.data.push(tail.into()).expect("Bug: frame data full");
        self.start = false;
        self.toggle = !self.toggle;
        core::mem::take(&mut self.data)
    }
}
