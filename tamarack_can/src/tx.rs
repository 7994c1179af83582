//!
//! Cyphal transmission
//!

use core::convert::TryFrom;
use core::iter;

use tamarack_core::transfer::{Header, ServiceHeader, Transfer};
use tamarack_core::NodeId;

use crate::crc::TransferCrc;
use crate::data::{CanId, Frame};
use crate::error::{OutOfMemoryError, PushError};
use crate::queue::FrameSink;
use crate::tx::breakdown::Breakdown;
use crate::{calculate_frame_stats, Mtu};

mod breakdown;
#[cfg(test)]
mod tx_test;

/// Splits outgoing transfers into frames
pub struct Transmitter<Q> {
    /// Queue of frames waiting to be sent
    frame_queue: Q,
    /// Transport MTU
    mtu: usize,
    /// Number of transfers successfully transmitted
    ///
    /// Success means that the frames were placed into the frame queue successfully. CAN bus
    /// errors are ignored.
    transfer_count: u64,
    /// Number of transfers that could not be transmitted
    ///
    /// A failure to allocate memory is considered an error. CAN bus errors are ignored.
    error_count: u64,
}

impl<Q> Transmitter<Q> {
    /// Creates a transmitter
    ///
    /// mtu: The maximum number of bytes in a frame
    pub fn new(mtu: Mtu, frame_queue: Q) -> Self {
        Transmitter {
            frame_queue,
            mtu: mtu as usize,
            transfer_count: 0,
            error_count: 0,
        }
    }

    /// Sets the MTU
    ///
    /// This will take effect on the next call to push().
    pub fn set_mtu(&mut self, mtu: Mtu) {
        self.mtu = mtu as usize;
    }

    /// Returns the MTU in bytes
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Breaks a transfer into frames and enqueues them
    ///
    /// The frames can be retrieved and sent using the queue's peek and pop functions.
    ///
    /// Either every frame of the transfer is enqueued or, on error, none is: space for the
    /// whole transfer is reserved before the first frame is created.
    pub fn push<P, I>(&mut self, transfer: Transfer<P, I>) -> Result<(), PushError>
    where
        P: AsRef<[u8]>,
        Q: FrameSink<I>,
        I: Clone,
    {
        // Convert the transfer payload into borrowed form
        let transfer = Transfer {
            header: transfer.header,
            payload: transfer.payload.as_ref(),
        };

        match self.push_inner(transfer) {
            Ok(()) => {
                self.transfer_count = self.transfer_count.wrapping_add(1);
                Ok(())
            }
            Err(e) => {
                self.error_count = self.error_count.wrapping_add(1);
                Err(e)
            }
        }
    }

    fn push_inner<I>(&mut self, transfer: Transfer<&[u8], I>) -> Result<(), PushError>
    where
        Q: FrameSink<I>,
        I: Clone,
    {
        let frame_stats = calculate_frame_stats(transfer.payload.len(), self.mtu);
        let single_frame = frame_stats.frames == 1;
        if transfer.header.source().is_none() && !single_frame {
            // An anonymous source cannot hold a multi-frame transfer together, because its
            // pseudo-ID is not unique on the bus
            return Err(PushError::AnonymousMultiFrame);
        }
        // Check that enough space is available in the queue for all the frames.
        // Return an error if space is not available.
        self.frame_queue.try_reserve(frame_stats.frames)?;

        // Make an iterator over the payload bytes and padding. Run the CRC on that.
        let mut crc = TransferCrc::new();
        let payload_and_padding = transfer
            .payload
            .iter()
            .cloned()
            .chain(iter::repeat(0).take(frame_stats.last_frame_padding))
            .inspect(|byte| crc.add(*byte));
        // Break into frames
        let can_id = make_can_id(&transfer.header, transfer.payload);
        let mut breakdown = Breakdown::new(self.mtu, transfer.header.transfer_id());
        for byte in payload_and_padding {
            if let Some(frame_data) = breakdown.add(byte) {
                // Filled up a frame
                self.push_frame(transfer.header.timestamp(), can_id, &frame_data)?;
            }
        }
        if !single_frame {
            // The transfer CRC goes ahead of the final tail byte, most significant byte
            // first, so that the receiver's running CRC over payload and trailer comes out
            // to zero
            let crc_value = crc.get();
            let crc_bytes = [(crc_value >> 8) as u8, crc_value as u8];
            for &byte in crc_bytes.iter() {
                if let Some(frame_data) = breakdown.add(byte) {
                    // Filled up a frame
                    self.push_frame(transfer.header.timestamp(), can_id, &frame_data)?;
                }
            }
        }
        let last_frame_data = breakdown.finish();
        self.push_frame(transfer.header.timestamp(), can_id, &last_frame_data)?;
        Ok(())
    }

    /// Creates a frame and adds it to the queue
    fn push_frame<I>(
        &mut self,
        timestamp: I,
        id: CanId,
        data: &[u8],
    ) -> core::result::Result<(), OutOfMemoryError>
    where
        Q: FrameSink<I>,
        I: Clone,
    {
        let frame = Frame::new(timestamp, id, data);
        self.frame_queue.push_frame(frame)
    }

    /// Returns a reference to the frame queue, where outgoing frames are stored
    pub fn frame_queue(&self) -> &Q {
        &self.frame_queue
    }

    /// Returns a mutable reference to the frame queue, where outgoing frames are stored
    pub fn frame_queue_mut(&mut self) -> &mut Q {
        &mut self.frame_queue
    }

    /// Returns the number of transfers successfully transmitted
    ///
    /// Success means that the frames were placed into the frame queue successfully. CAN bus
    /// errors are ignored.
    #[inline]
    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    /// Returns the number of transfers that could not be transmitted
    ///
    /// A failure to allocate memory is considered an error. CAN bus errors are ignored.
    #[inline]
    pub fn error_count(&self) -> u64 {
        self.error_count
    }
}

fn make_can_id<I>(header: &Header<I>, payload: &[u8]) -> CanId {
    let mut bits = 0u32;

    // Common fields for all transfer types
    bits |= u32::from(u8::from(header.priority())) << 26;
    let source_node = header.source().unwrap_or_else(|| make_pseudo_id(payload));
    bits |= u32::from(source_node);

    match header {
        Header::Message(message_header) => {
            // Subject ID
            bits |= u32::from(message_header.subject) << 8;
            // Bits 21 and 22 are transmitted as 1 and ignored on receive
            bits |= (1 << 21) | (1 << 22);
            // Anonymous
            if message_header.source.is_none() {
                bits |= 1 << 24;
            }
        }
        Header::Request(service_header) => {
            bits |= encode_common_service_fields(service_header);
            // Set bit 24 to indicate a request
            bits |= 1 << 24;
        }
        Header::Response(service_header) => {
            bits |= encode_common_service_fields(service_header);
            // Leave bit 24 clear
        }
    }

    CanId::try_from(bits).expect("Generated CAN ID does not fit into 29 bits")
}

/// Encodes the service flag, service ID, and destination node ID into their CAN ID fields
fn encode_common_service_fields<I>(header: &ServiceHeader<I>) -> u32 {
    (u32::from(header.service) << 14) | (u32::from(header.destination) << 7) | (1 << 25)
}

/// Derives a source node pseudo-ID for an anonymous transfer from its payload
///
/// The same payload always maps to the same pseudo-ID.
fn make_pseudo_id(payload: &[u8]) -> NodeId {
    let mut crc = TransferCrc::new();
    crc.add_bytes(payload);
    let mut id = NodeId::from_truncating(crc.get() as u8);
    // Stay off the IDs reserved for diagnostic tools
    while id.is_diagnostic_reserved() {
        id = NodeId::from_truncating(u8::from(id).wrapping_sub(1));
    }
    id
}
