//! Per-source transfer reassembly

use alloc::vec::Vec;

use fallible_collections::FallibleVec;

use tamarack_core::time::Instant;
use tamarack_core::TransferId;

use crate::crc::TransferCrc;
use crate::data::TailByte;
use crate::error::OutOfMemoryError;

/// Reassembly state for one (subscription, source node) pair
///
/// A session survives across transfers: the transfer ID it expects next advances with every
/// completed or abandoned transfer, which is what lets duplicate transfers delivered over
/// redundant interfaces be recognized and dropped.
#[derive(Debug)]
pub(crate) struct Session<I> {
    /// Timestamp of the first frame of the current transfer
    transfer_timestamp: I,
    /// Transfer ID that the next accepted frame must carry
    transfer_id: TransferId,
    /// Toggle value that the next accepted frame must carry
    toggle: bool,
    /// The redundant interface this session currently follows
    iface_index: u8,
    /// Reassembled payload, truncated at the subscription extent
    payload: Vec<u8>,
    /// Payload bytes seen in the current transfer, including bytes the extent truncated
    total_payload_size: usize,
    /// Running CRC over every payload byte of the current transfer
    crc: TransferCrc,
}

impl<I: Instant> Session<I> {
    pub fn new(transfer_timestamp: I, transfer_id: TransferId, iface_index: u8) -> Self {
        Session {
            transfer_timestamp,
            transfer_id,
            toggle: true,
            iface_index,
            payload: Vec::new(),
            total_payload_size: 0,
            crc: TransferCrc::new(),
        }
    }

    /// Handles one frame addressed to this session
    ///
    /// `frame_payload` is the frame data without the tail byte; for the last frame of a
    /// multi-frame transfer it still includes the transfer CRC. If the frame completes a
    /// transfer, the reassembled payload and the timestamp of the transfer's first frame
    /// are returned. Frames that do not fit the session state are dropped silently.
    pub fn update(
        &mut self,
        frame_payload: &[u8],
        timestamp: I,
        tail: TailByte,
        iface_index: u8,
        timeout: &I::Duration,
        extent: usize,
    ) -> Result<Option<(Vec<u8>, I)>, OutOfMemoryError> {
        let timed_out = timestamp.duration_since(&self.transfer_timestamp) > *timeout;
        // A distance of exactly 1 marks the immediately previous transfer: a late duplicate
        // from a redundant interface, not a reason to restart
        let jumped = self.transfer_id.distance(tail.transfer_id()) > 1;
        let need_restart =
            timed_out || (self.iface_index == iface_index && tail.start() && jumped);
        if need_restart {
            self.reset();
            self.transfer_id = tail.transfer_id();
            self.iface_index = iface_index;
            if !tail.start() {
                // Missed the start of this transfer; wait for the next one
                self.transfer_id = self.transfer_id.increment();
                return Ok(None);
            }
        }
        let acceptable = self.iface_index == iface_index
            && tail.toggle() == self.toggle
            && tail.transfer_id() == self.transfer_id;
        if !acceptable {
            return Ok(None);
        }
        self.accept_frame(frame_payload, timestamp, tail, extent)
    }

    fn accept_frame(
        &mut self,
        frame_payload: &[u8],
        timestamp: I,
        tail: TailByte,
        extent: usize,
    ) -> Result<Option<(Vec<u8>, I)>, OutOfMemoryError> {
        if tail.start() {
            self.transfer_timestamp = timestamp;
        }
        let single_frame = tail.start() && tail.end();
        if !single_frame {
            self.crc.add_bytes(frame_payload);
        }
        if let Err(e) = self.write_payload(frame_payload, extent) {
            // This transfer cannot be finished; skip ahead to the next one
            self.reset();
            self.transfer_id = self.transfer_id.increment();
            return Err(e);
        }
        if tail.end() {
            let result = if single_frame || self.crc.get() == 0 {
                let mut payload = core::mem::take(&mut self.payload);
                if !single_frame {
                    // Drop whatever part of the CRC trailer the extent did not already cut off
                    let truncated = self.total_payload_size - payload.len();
                    let crc_in_buffer = 2usize.saturating_sub(truncated);
                    payload.truncate(payload.len() - crc_in_buffer);
                }
                Some((payload, self.transfer_timestamp.clone()))
            } else {
                #[cfg(feature = "log")]
                log::debug!("Transfer CRC mismatch, dropping transfer");
                None
            };
            self.reset();
            self.transfer_id = self.transfer_id.increment();
            Ok(result)
        } else {
            self.toggle = !self.toggle;
            Ok(None)
        }
    }

    /// Returns true if this session's current (or most recent) transfer began more than
    /// `timeout` before `now`
    pub fn is_expired(&self, now: &I, timeout: &I::Duration) -> bool {
        now.duration_since(&self.transfer_timestamp) > *timeout
    }

    /// Appends frame payload bytes to the reassembly buffer, up to the extent
    ///
    /// Bytes beyond the extent are counted but not stored. The buffer is allocated at the
    /// full extent the first time it is needed and never grows after that.
    fn write_payload(&mut self, bytes: &[u8], extent: usize) -> Result<(), OutOfMemoryError> {
        if self.payload.capacity() == 0 && extent != 0 {
            self.payload = FallibleVec::try_with_capacity(extent)?;
        }
        self.total_payload_size += bytes.len();
        let room = extent.saturating_sub(self.payload.len());
        let take = bytes.len().min(room);
        self.payload.extend_from_slice(&bytes[..take]);
        Ok(())
    }

    /// Clears the per-transfer state, keeping the expected transfer ID and the buffer's
    /// allocation
    fn reset(&mut self) {
        self.payload.clear();
        self.total_payload_size = 0;
        self.crc = TransferCrc::new();
        self.toggle = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::convert::TryFrom;
    use tamarack_core::time::{MicrosecondDuration64, Microseconds64};

    const EXTENT: usize = 64;

    fn timeout() -> MicrosecondDuration64 {
        MicrosecondDuration64::new(1_000_000)
    }

    fn tid(bits: u8) -> TransferId {
        TransferId::try_from(bits).unwrap()
    }

    fn new_session(start: u64, transfer_id: u8) -> Session<Microseconds64> {
        Session::new(Microseconds64::new(start), tid(transfer_id), 0)
    }

    #[test]
    fn single_frame_completes() {
        let mut session = new_session(100, 7);
        let tail = TailByte::new(true, true, true, tid(7));
        let result = session
            .update(
                &[1, 2, 3],
                Microseconds64::new(100),
                tail,
                0,
                &timeout(),
                EXTENT,
            )
            .unwrap();
        let (payload, timestamp) = result.unwrap();
        assert_eq!(payload, [1, 2, 3]);
        assert_eq!(timestamp, Microseconds64::new(100));
    }

    #[test]
    fn duplicate_transfer_id_is_dropped() {
        let mut session = new_session(100, 7);
        let tail = TailByte::new(true, true, true, tid(7));
        session
            .update(&[1], Microseconds64::new(100), tail, 0, &timeout(), EXTENT)
            .unwrap()
            .unwrap();
        // The same transfer delivered again, e.g. over a second interface
        let result = session
            .update(&[1], Microseconds64::new(200), tail, 1, &timeout(), EXTENT)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn toggle_mismatch_is_dropped() {
        let mut session = new_session(100, 7);
        let start = TailByte::new(true, false, true, tid(7));
        session
            .update(
                &[0; 7],
                Microseconds64::new(100),
                start,
                0,
                &timeout(),
                EXTENT,
            )
            .unwrap();
        // The second frame must have the toggle cleared; a repeat of the first is ignored
        let result = session
            .update(
                &[0; 7],
                Microseconds64::new(150),
                start,
                0,
                &timeout(),
                EXTENT,
            )
            .unwrap();
        assert!(result.is_none());
        assert_eq!(session.total_payload_size, 7);
    }

    #[test]
    fn timeout_restarts_session() {
        let mut session = new_session(100, 7);
        let start = TailByte::new(true, false, true, tid(7));
        session
            .update(
                &[0; 7],
                Microseconds64::new(100),
                start,
                0,
                &timeout(),
                EXTENT,
            )
            .unwrap();
        // Much later, the same transfer ID starts over and is accepted as a fresh transfer
        let single = TailByte::new(true, true, true, tid(7));
        let late = Microseconds64::new(100 + 2_000_000);
        let result = session
            .update(&[9], late, single, 0, &timeout(), EXTENT)
            .unwrap();
        let (payload, timestamp) = result.unwrap();
        assert_eq!(payload, [9]);
        assert_eq!(timestamp, late);
    }
}
