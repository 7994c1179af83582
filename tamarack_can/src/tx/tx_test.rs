use core::convert::TryFrom;

use tamarack_core::time::Microseconds64;
use tamarack_core::transfer::{Header, MessageHeader, ServiceHeader, Transfer};
use tamarack_core::{NodeId, Priority, ServiceId, SubjectId, TransferId};

use crate::crc::TransferCrc;
use crate::data::Frame;
use crate::error::PushError;
use crate::queue::{FrameQueue, FrameQueueSource};
use crate::tx::Transmitter;
use crate::Mtu;

fn node(bits: u8) -> NodeId {
    NodeId::try_from(bits).unwrap()
}
fn subject(bits: u16) -> SubjectId {
    SubjectId::try_from(bits).unwrap()
}
fn service(bits: u16) -> ServiceId {
    ServiceId::try_from(bits).unwrap()
}

fn message_transfer(
    source: Option<NodeId>,
    subject: SubjectId,
    transfer_id: u8,
    payload: &[u8],
) -> Transfer<&[u8], Microseconds64> {
    Transfer {
        header: Header::Message(MessageHeader {
            timestamp: Microseconds64::new(10_000),
            transfer_id: TransferId::try_from(transfer_id).unwrap(),
            priority: Priority::Nominal,
            subject,
            source,
        }),
        payload,
    }
}

fn drain(transmitter: &mut Transmitter<FrameQueue<Microseconds64>>) -> std::vec::Vec<Frame<Microseconds64>> {
    core::iter::from_fn(|| transmitter.frame_queue_mut().pop_frame()).collect()
}

#[test]
fn heartbeat_can_id() {
    // Heartbeat example from section 4.2.3 of the Cyphal specification
    let mut transmitter = Transmitter::new(Mtu::Can8, FrameQueue::new(4));
    let payload = [0x12, 0x34, 0x56];
    transmitter
        .push(message_transfer(Some(node(42)), subject(7509), 0, &payload))
        .unwrap();
    let frames = drain(&mut transmitter);
    assert_eq!(frames.len(), 1);
    assert_eq!(u32::from(frames[0].id()), 0x107d552a);
    assert_eq!(frames[0].data(), &[0x12, 0x34, 0x56, 0xe0]);
    assert_eq!(transmitter.transfer_count(), 1);
    assert_eq!(transmitter.error_count(), 0);
}

#[test]
fn service_request_can_id() {
    // Node info request example from section 4.2.3 of the Cyphal specification
    let mut transmitter = Transmitter::new(Mtu::Can8, FrameQueue::new(4));
    let transfer: Transfer<&[u8], Microseconds64> = Transfer {
        header: Header::Request(ServiceHeader {
            timestamp: Microseconds64::new(10_000),
            transfer_id: TransferId::try_from(11).unwrap(),
            priority: Priority::Nominal,
            service: service(430),
            source: node(123),
            destination: node(42),
        }),
        payload: &[],
    };
    transmitter.push(transfer).unwrap();
    let frames = drain(&mut transmitter);
    assert_eq!(frames.len(), 1);
    assert_eq!(u32::from(frames[0].id()), 0x136b957b);
    assert_eq!(frames[0].data(), &[0xe0 | 11]);
}

#[test]
fn service_response_can_id() {
    // Node info response example from section 4.2.3 of the Cyphal specification
    let mut transmitter = Transmitter::new(Mtu::Can8, FrameQueue::new(4));
    let transfer: Transfer<&[u8], Microseconds64> = Transfer {
        header: Header::Response(ServiceHeader {
            timestamp: Microseconds64::new(10_000),
            transfer_id: TransferId::try_from(11).unwrap(),
            priority: Priority::Nominal,
            service: service(430),
            source: node(42),
            destination: node(123),
        }),
        payload: &[0xff],
    };
    transmitter.push(transfer).unwrap();
    let frames = drain(&mut transmitter);
    assert_eq!(frames.len(), 1);
    assert_eq!(u32::from(frames[0].id()), 0x126bbdaa);
    assert_eq!(frames[0].data(), &[0xff, 0x40 | 11]);
}

#[test]
fn anonymous_message() {
    let mut transmitter = Transmitter::new(Mtu::Can8, FrameQueue::new(4));
    transmitter
        .push(message_transfer(None, subject(4919), 0, &[]))
        .unwrap();
    let frames = drain(&mut transmitter);
    assert_eq!(frames.len(), 1);
    // CRC of an empty payload is 0xffff; the low 7 bits give 127, which steps down past
    // the two reserved diagnostic IDs to 125
    assert_eq!(u32::from(frames[0].id()), 0x1173377d);
    assert_eq!(frames[0].data(), &[0xe0]);
}

#[test]
fn anonymous_pseudo_id_is_deterministic() {
    let payload = [0xde, 0xad, 0xbe, 0xef];
    let mut transmitter = Transmitter::new(Mtu::Can8, FrameQueue::new(4));
    transmitter
        .push(message_transfer(None, subject(100), 0, &payload))
        .unwrap();
    transmitter
        .push(message_transfer(None, subject(100), 1, &payload))
        .unwrap();
    let frames = drain(&mut transmitter);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].id(), frames[1].id());
}

#[test]
fn anonymous_multi_frame_rejected() {
    let mut transmitter = Transmitter::new(Mtu::Can8, FrameQueue::new(4));
    let payload = [0u8; 8];
    let status = transmitter.push(message_transfer(None, subject(100), 0, &payload));
    assert_eq!(status, Err(PushError::AnonymousMultiFrame));
    assert_eq!(transmitter.error_count(), 1);
    assert!(drain(&mut transmitter).is_empty());
}

#[test]
fn multi_frame_layout() {
    let mut transmitter = Transmitter::new(Mtu::Can8, FrameQueue::new(4));
    let payload: std::vec::Vec<u8> = (0..=10).collect();
    transmitter
        .push(message_transfer(Some(node(5)), subject(100), 3, &payload))
        .unwrap();
    let frames = drain(&mut transmitter);
    assert_eq!(frames.len(), 2);
    // Both frames carry the same CAN ID, so they stay in order through arbitration
    assert_eq!(frames[0].id(), frames[1].id());
    assert_eq!(frames[0].data(), &[0, 1, 2, 3, 4, 5, 6, 0xa0 | 3]);
    let mut crc = TransferCrc::new();
    crc.add_bytes(&payload);
    let crc_value = crc.get();
    assert_eq!(
        frames[1].data(),
        &[
            7,
            8,
            9,
            10,
            (crc_value >> 8) as u8,
            crc_value as u8,
            0x40 | 3
        ]
    );
}

#[test]
fn push_is_atomic_when_queue_is_full() {
    let mut transmitter = Transmitter::new(Mtu::Can8, FrameQueue::new(1));
    let payload = [0u8; 20];
    let status = transmitter.push(message_transfer(Some(node(5)), subject(100), 0, &payload));
    assert!(matches!(status, Err(PushError::Memory(_))));
    // No partial transfer is left behind
    assert!(transmitter.frame_queue().is_empty());
    assert_eq!(transmitter.error_count(), 1);
}
