//! Outgoing frame queues
//!
//! A [`FrameQueue`] holds frames waiting to be transmitted, ordered by CAN arbitration
//! priority (the full 29-bit ID, lower wins) with ties broken in insertion order. Because
//! the ordering spans every queued transfer, a frame that would win bus arbitration is
//! always handed to the driver first, so a long low-priority transfer cannot hold back a
//! later high-priority one.
//!
//! The same frames are indexed a second time by transmission deadline, so expired frames
//! can be removed without scanning the queue. Frames that belong to one transfer share a
//! CAN ID and a deadline, which lets expiry and [`discard_transfer`](FrameQueue::discard_transfer)
//! remove whole transfers atomically.
//!
//! A driver drains the queue with [`peek_frame`](FrameQueueSource::peek_frame), then either
//! [`pop_frame`](FrameQueueSource::pop_frame) after a successful or permanently failed
//! transmission, or [`return_frame`](FrameQueueSource::return_frame) (or simply leaving the
//! frame in place) after a transient failure.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use tamarack_core::time::Instant;

use crate::data::Frame;
use crate::error::OutOfMemoryError;

/// Something that can accept frames for transmission
pub trait FrameSink<I> {
    /// Checks that space for `additional` more frames is available, without adding anything
    fn try_reserve(&mut self, additional: usize) -> Result<(), OutOfMemoryError>;

    /// Adds a frame
    fn push_frame(&mut self, frame: Frame<I>) -> Result<(), OutOfMemoryError>;
}

/// Something that frames can be taken out of, in CAN arbitration order
pub trait FrameQueueSource<I> {
    /// Returns a reference to the next frame to transmit, if any
    fn peek_frame(&self) -> Option<&Frame<I>>;

    /// Removes and returns the next frame to transmit
    fn pop_frame(&mut self) -> Option<Frame<I>>;

    /// Puts a frame back at the front of its priority level, after a transmission attempt
    /// that should be retried
    fn return_frame(&mut self, frame: Frame<I>) -> Result<(), OutOfMemoryError>;
}

/// The position of a frame in arbitration order: CAN ID first, insertion order second
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ArbitrationKey {
    can_id: u32,
    sequence: u64,
}

/// Sequence numbers count up from the midpoint; returned frames count down so that they
/// sort ahead of every frame pushed normally with the same CAN ID
const SEQUENCE_MIDPOINT: u64 = 1 << 63;

/// A bounded queue of outgoing frames, ordered by CAN arbitration priority and indexed by
/// transmission deadline
#[derive(Debug)]
pub struct FrameQueue<I> {
    /// Queued frames in arbitration order
    frames: BTreeMap<ArbitrationKey, Frame<I>>,
    /// The same frames ordered by deadline, for expiry
    deadlines: BTreeSet<(I, ArbitrationKey)>,
    /// The maximum number of frames this queue may hold
    capacity: usize,
    next_push_sequence: u64,
    next_return_sequence: u64,
    /// Frames dropped because their deadline passed or their transfer was discarded
    dropped_frames: u64,
}

impl<I: Instant> FrameQueue<I> {
    /// Creates an empty queue that can hold up to `capacity` frames
    pub fn new(capacity: usize) -> Self {
        FrameQueue {
            frames: BTreeMap::new(),
            deadlines: BTreeSet::new(),
            capacity,
            next_push_sequence: SEQUENCE_MIDPOINT,
            next_return_sequence: SEQUENCE_MIDPOINT - 1,
            dropped_frames: 0,
        }
    }

    /// Returns the maximum number of frames this queue can hold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of frames in the queue
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Returns the number of frames dropped over the life of this queue because their
    /// deadline passed or their transfer was discarded
    pub fn dropped_frame_count(&self) -> u64 {
        self.dropped_frames
    }

    /// Removes every frame whose deadline is at or before `now` and returns the number of
    /// frames removed
    pub fn clean_expired_frames(&mut self, now: &I) -> usize {
        let mut dropped = 0;
        loop {
            let key = match self.deadlines.iter().next() {
                Some((deadline, key)) if *deadline <= *now => (deadline.clone(), *key),
                _ => break,
            };
            self.deadlines.remove(&key);
            self.frames.remove(&key.1);
            dropped += 1;
        }
        if dropped > 0 {
            self.dropped_frames += dropped as u64;
            #[cfg(feature = "log")]
            log::warn!("Dropped {} outgoing frames past their deadline", dropped);
        }
        dropped
    }

    /// Removes the frame at the head of the queue along with every other queued frame of
    /// the same transfer, and returns the number of frames removed
    ///
    /// Drivers call this after a permanent transmission failure: sending the rest of the
    /// transfer would only waste bus time, because the receivers cannot complete it.
    pub fn discard_transfer(&mut self) -> usize {
        let (can_id, deadline) = match self.frames.iter().next() {
            Some((key, frame)) => (key.can_id, frame.timestamp()),
            None => return 0,
        };
        let keys: Vec<ArbitrationKey> = self
            .frames
            .range(
                ArbitrationKey {
                    can_id,
                    sequence: 0,
                }..=ArbitrationKey {
                    can_id,
                    sequence: u64::MAX,
                },
            )
            .filter(|(_, frame)| frame.timestamp() == deadline)
            .map(|(key, _)| *key)
            .collect();
        let dropped = keys.len();
        for key in keys {
            self.remove_key(key);
        }
        self.dropped_frames += dropped as u64;
        dropped
    }

    fn insert(&mut self, key: ArbitrationKey, frame: Frame<I>) {
        self.deadlines.insert((frame.timestamp(), key));
        self.frames.insert(key, frame);
    }

    fn remove_key(&mut self, key: ArbitrationKey) -> Option<Frame<I>> {
        let frame = self.frames.remove(&key)?;
        self.deadlines.remove(&(frame.timestamp(), key));
        Some(frame)
    }
}

impl<I: Instant> FrameSink<I> for FrameQueue<I> {
    fn try_reserve(&mut self, additional: usize) -> Result<(), OutOfMemoryError> {
        if self.frames.len() + additional <= self.capacity {
            Ok(())
        } else {
            Err(OutOfMemoryError::new())
        }
    }

    fn push_frame(&mut self, frame: Frame<I>) -> Result<(), OutOfMemoryError> {
        if self.frames.len() < self.capacity {
            let key = ArbitrationKey {
                can_id: frame.id().into(),
                sequence: self.next_push_sequence,
            };
            self.next_push_sequence += 1;
            self.insert(key, frame);
            Ok(())
        } else {
            Err(OutOfMemoryError::new())
        }
    }
}

impl<I: Instant> FrameQueueSource<I> for FrameQueue<I> {
    fn peek_frame(&self) -> Option<&Frame<I>> {
        self.frames.values().next()
    }

    fn pop_frame(&mut self) -> Option<Frame<I>> {
        let key = *self.frames.keys().next()?;
        self.remove_key(key)
    }

    fn return_frame(&mut self, frame: Frame<I>) -> Result<(), OutOfMemoryError> {
        if self.frames.len() < self.capacity {
            let key = ArbitrationKey {
                can_id: frame.id().into(),
                sequence: self.next_return_sequence,
            };
            self.next_return_sequence -= 1;
            self.insert(key, frame);
            Ok(())
        } else {
            Err(OutOfMemoryError::new())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data::CanId;
    use core::convert::TryFrom;
    use tamarack_core::time::Microseconds64;

    fn frame(id: u32, deadline: u64) -> Frame<Microseconds64> {
        Frame::new(
            Microseconds64::new(deadline),
            CanId::try_from(id).unwrap(),
            &[0x12, 0xf7],
        )
    }

    #[test]
    fn pops_in_arbitration_order() {
        let mut queue = FrameQueue::new(8);
        for &id in &[0x123, 0x100, 0x110] {
            queue.push_frame(frame(id, 1000)).unwrap();
        }
        let ids: Vec<u32> = core::iter::from_fn(|| queue.pop_frame())
            .map(|frame| frame.id().into())
            .collect();
        assert_eq!(ids, [0x100, 0x110, 0x123]);
    }

    #[test]
    fn fifo_within_one_id() {
        let mut queue = FrameQueue::new(8);
        queue
            .push_frame(Frame::new(
                Microseconds64::new(10),
                CanId::try_from(0x100).unwrap(),
                &[1],
            ))
            .unwrap();
        queue
            .push_frame(Frame::new(
                Microseconds64::new(10),
                CanId::try_from(0x100).unwrap(),
                &[2],
            ))
            .unwrap();
        assert_eq!(queue.pop_frame().unwrap().data(), &[1]);
        assert_eq!(queue.pop_frame().unwrap().data(), &[2]);
    }

    #[test]
    fn returned_frame_comes_back_first() {
        let mut queue = FrameQueue::new(8);
        queue
            .push_frame(Frame::new(
                Microseconds64::new(10),
                CanId::try_from(0x100).unwrap(),
                &[1],
            ))
            .unwrap();
        queue
            .push_frame(Frame::new(
                Microseconds64::new(10),
                CanId::try_from(0x100).unwrap(),
                &[2],
            ))
            .unwrap();
        let first = queue.pop_frame().unwrap();
        queue.return_frame(first).unwrap();
        assert_eq!(queue.pop_frame().unwrap().data(), &[1]);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut queue = FrameQueue::new(2);
        assert!(queue.try_reserve(2).is_ok());
        assert!(queue.try_reserve(3).is_err());
        queue.push_frame(frame(0x100, 10)).unwrap();
        queue.push_frame(frame(0x101, 10)).unwrap();
        assert!(queue.try_reserve(1).is_err());
        assert!(queue.push_frame(frame(0x102, 10)).is_err());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn expiry_removes_frames_and_counts_them() {
        let mut queue = FrameQueue::new(8);
        queue.push_frame(frame(0x100, 50)).unwrap();
        queue.push_frame(frame(0x100, 50)).unwrap();
        queue.push_frame(frame(0x200, 900)).unwrap();
        assert_eq!(queue.clean_expired_frames(&Microseconds64::new(49)), 0);
        assert_eq!(queue.clean_expired_frames(&Microseconds64::new(100)), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(u32::from(queue.peek_frame().unwrap().id()), 0x200);
        assert_eq!(queue.dropped_frame_count(), 2);
    }

    #[test]
    fn discard_removes_one_whole_transfer() {
        let mut queue = FrameQueue::new(8);
        // Two frames of one transfer, then another transfer on the same ID
        queue.push_frame(frame(0x100, 50)).unwrap();
        queue.push_frame(frame(0x100, 50)).unwrap();
        queue.push_frame(frame(0x100, 80)).unwrap();
        queue.push_frame(frame(0x300, 50)).unwrap();
        assert_eq!(queue.discard_transfer(), 2);
        assert_eq!(queue.len(), 2);
        // The later transfer on 0x100 and the unrelated 0x300 frame remain
        assert_eq!(u32::from(queue.pop_frame().unwrap().id()), 0x100);
        assert_eq!(u32::from(queue.pop_frame().unwrap().id()), 0x300);
        assert_eq!(queue.dropped_frame_count(), 2);
    }
}
