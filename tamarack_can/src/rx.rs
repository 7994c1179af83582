//!
//! Cyphal reception
//!

mod session;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::convert::TryFrom;
use core::fmt;

use fallible_collections::{FallibleBox, FallibleVec, TryReserveError};

use tamarack_core::time::Instant;
use tamarack_core::transfer::{Header, MessageHeader, ServiceHeader, Transfer, TransferKind};
use tamarack_core::{NodeId, PortId, Priority, ServiceId, SubjectId, TransferId};
use tamarack_filter_config::Filter;

use crate::data::{CanId, Frame, TailByte};
use crate::error::OutOfMemoryError;
use crate::rx::session::Session;

/// One session per node ID
const RX_SESSIONS_PER_SUBSCRIPTION: usize = NodeId::MAX.to_u8() as usize + 1;

/// Transfer subscription state. The application can register its interest in a particular
/// kind of data exchanged over the bus by creating such subscription objects. Frames that
/// carry data for which there is no active subscription will be silently dropped by the
/// library.
struct Subscription<I: Instant> {
    /// A session for each node ID
    sessions: [Option<Box<Session<I>>>; RX_SESSIONS_PER_SUBSCRIPTION],
    /// Maximum time between the first frame of a transfer and any later frame of the same
    /// transfer
    timeout: I::Duration,
    /// Maximum number of payload bytes to keep; the rest of a longer transfer is dropped
    /// but still participates in CRC validation
    extent: usize,
    /// Subject or service ID that this subscription is about
    port_id: PortId,
}

impl<I: Instant> fmt::Debug for Subscription<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("sessions", &DebugSessions(&self.sessions))
            .field("timeout", &self.timeout)
            .field("extent", &self.extent)
            .field("port_id", &self.port_id)
            .finish()
    }
}

/// A debug adapter for the session list
struct DebugSessions<'s, I>(&'s [Option<Box<Session<I>>>; RX_SESSIONS_PER_SUBSCRIPTION]);

impl<I: Instant> fmt::Debug for DebugSessions<'_, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display as a set, showing only the non-empty entries
        f.debug_set()
            .entries(self.0.iter().flat_map(Option::as_deref))
            .finish()
    }
}

impl<I: Instant> Subscription<I> {
    /// Creates a subscription
    pub fn new(timeout: I::Duration, extent: usize, port_id: PortId) -> Self {
        Subscription {
            sessions: init_rx_sessions(),
            timeout,
            extent,
            port_id,
        }
    }

    /// Returns a reference to the active session for the provided node ID
    pub fn session_mut(&mut self, node: NodeId) -> Option<&mut Session<I>> {
        self.sessions[usize::from(node)].as_deref_mut()
    }

    /// Creates a session, replacing any existing session for the same node
    ///
    /// Returns an error if memory allocation fails.
    pub fn create_session(
        &mut self,
        node: NodeId,
        transfer_timestamp: I,
        transfer_id: TransferId,
        iface_index: u8,
    ) -> Result<(), TryReserveError> {
        let session = FallibleBox::try_new(Session::new(
            transfer_timestamp,
            transfer_id,
            iface_index,
        ))?;
        self.sessions[usize::from(node)] = Some(session);
        Ok(())
    }
}

/// Handles subscriptions and assembles incoming frames into transfers
#[derive(Debug)]
pub struct Receiver<I: Instant> {
    /// Subscriptions for messages
    subscriptions_message: BTreeMap<PortId, Box<Subscription<I>>>,
    /// Subscriptions for service requests
    subscriptions_request: BTreeMap<PortId, Box<Subscription<I>>>,
    /// Subscriptions for service responses
    subscriptions_response: BTreeMap<PortId, Box<Subscription<I>>>,
    /// The ID of this node, or None if this node is anonymous
    ///
    /// An anonymous node cannot receive service transfers.
    id: Option<NodeId>,
    /// Number of transfers successfully received
    transfer_count: u64,
    /// Number of transfers that could not be received
    ///
    /// Errors include failure to allocate memory (when handling incoming frames only),
    /// missing frames, and malformed frames.
    error_count: u64,
}

impl<I: Instant> Receiver<I> {
    /// Creates a receiver
    ///
    /// id: The ID of this node. This is used to filter incoming service requests and
    /// responses; pass None to run anonymously and receive only messages.
    pub fn new(id: Option<NodeId>) -> Self {
        Receiver {
            subscriptions_message: BTreeMap::new(),
            subscriptions_request: BTreeMap::new(),
            subscriptions_response: BTreeMap::new(),
            id,
            transfer_count: 0,
            error_count: 0,
        }
    }

    /// Returns the ID of this node, if any
    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    /// Changes the ID of this node
    pub fn set_id(&mut self, id: Option<NodeId>) {
        self.id = id;
    }

    /// Handles an incoming CAN or CAN FD frame
    ///
    /// `iface_index` identifies the redundant interface the frame arrived on. With a single
    /// interface, pass 0. All interfaces feed the same sessions; the first interface to
    /// deliver a complete transfer wins, and late copies of the same transfer are dropped.
    ///
    /// If this frame is the last frame in a transfer, this function returns the completed
    /// transfer. The returned transfer owns its payload, which does not include any tail
    /// bytes or transfer CRC and is truncated to the subscription extent.
    ///
    /// This function returns an error if memory allocation fails. Other unexpected
    /// situations, such as duplicate or malformed frames, do not cause this function to
    /// return an error but do increment the error counter. Valid frames on ports that this
    /// receiver is not subscribed to are silently ignored.
    pub fn accept(
        &mut self,
        frame: Frame<I>,
        iface_index: u8,
    ) -> Result<Option<Transfer<Vec<u8>, I>>, OutOfMemoryError> {
        // Part 1: basic frame checks
        let (header, tail) = match Self::frame_sanity_check(self.id, &frame) {
            Some(data) => data,
            None => {
                // Can't use this frame
                #[cfg(test)]
                std::eprintln!("Frame failed sanity checks, ignoring");
                self.increment_error_count();
                return Ok(None);
            }
        };

        // Part 2: Check for a subscription for this port
        let subscription = match self
            .subscriptions_for_kind(header.kind())
            .get_mut(&header.port_id())
        {
            Some(subscription) => subscription,
            None => {
                // No matching subscription, ignore
                #[cfg(test)]
                std::eprintln!("Frame does not match any subscription, ignoring");
                return Ok(None);
            }
        };
        let extent = subscription.extent;
        let timeout = subscription.timeout.clone();
        let timestamp = frame.timestamp();
        let frame_payload = &frame.data()[..frame.data().len() - 1];

        // Anonymous messages are always single-frame, so they need no session state
        if header.is_anonymous() {
            let payload = copy_payload(frame_payload, extent)?;
            self.increment_transfer_count();
            return Ok(Some(Transfer {
                header: make_header(&header, tail.transfer_id(), timestamp),
                payload,
            }));
        }

        // Part 3: Find or create the session for this source node
        let source = header.source;
        if subscription.session_mut(source).is_none() {
            if !tail.start() {
                // No session, and this is not the start of a transfer. Ignore frame.
                #[cfg(test)]
                std::eprintln!("Frame is not a transfer start, ignoring");
                return Ok(None);
            }
            #[cfg(test)]
            std::eprintln!(
                "Creating new session for transfer ID {:?} from node {:?}",
                tail.transfer_id(),
                source
            );
            let created = subscription.create_session(
                source,
                timestamp.clone(),
                tail.transfer_id(),
                iface_index,
            );
            if created.is_err() {
                self.increment_error_count();
                return Err(OutOfMemoryError::new());
            }
        }
        let session = subscription
            .session_mut(source)
            .expect("Bug: session lookup after creation failed");

        // Part 4: Run the reassembly state machine
        match session.update(frame_payload, timestamp, tail, iface_index, &timeout, extent) {
            Ok(Some((payload, first_frame_timestamp))) => {
                self.increment_transfer_count();
                Ok(Some(Transfer {
                    header: make_header(&header, tail.transfer_id(), first_frame_timestamp),
                    payload,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.increment_error_count();
                Err(e)
            }
        }
    }

    /// Runs basic sanity checks on an incoming frame. Returns the parsed CAN ID fields and
    /// the tail byte if the frame is usable.
    fn frame_sanity_check(
        local_id: Option<NodeId>,
        frame: &Frame<I>,
    ) -> Option<(RawHeader, TailByte)> {
        // Frame must have a tail byte to be valid
        let tail = TailByte::parse(*frame.data().last()?);

        // The first frame of every transfer carries the toggle set
        if tail.start() && !tail.toggle() {
            return None;
        }

        let header = parse_can_id(frame.id()).ok()?;

        match header.kind {
            RawKind::Request { destination, .. } | RawKind::Response { destination, .. } => {
                // Service transfers addressed to another node are not ours to reassemble
                if local_id != Some(destination) {
                    return None;
                }
            }
            RawKind::Message { anonymous, .. } => {
                // Anonymous message transfers must always fit into one frame
                if anonymous && !(tail.start() && tail.end() && tail.toggle()) {
                    return None;
                }
            }
        }

        // OK
        Some((header, tail))
    }

    /// Subscribes to messages on a subject
    ///
    /// This will enable incoming transfers from all nodes on the specified subject ID.
    ///
    /// subject: The subject ID to subscribe to
    ///
    /// extent: The maximum number of payload bytes to keep from each transfer on this
    /// subject (the rest of a longer transfer is dropped, but still participates in CRC
    /// validation)
    ///
    /// timeout: The maximum time between the first and last frames in a transfer (transfers
    /// that do not finish within this time will be dropped)
    ///
    /// If all transfers fit into one frame, the timeout has no meaning and may be zero.
    ///
    pub fn subscribe_message(
        &mut self,
        subject: SubjectId,
        extent: usize,
        timeout: I::Duration,
    ) -> Result<(), OutOfMemoryError> {
        self.subscribe(TransferKind::Message, PortId::from(subject), extent, timeout)
    }

    /// Unsubscribes from messages on a subject
    pub fn unsubscribe_message(&mut self, subject: SubjectId) {
        self.unsubscribe(TransferKind::Message, PortId::from(subject));
    }

    /// Subscribes to requests for a service
    ///
    /// This will enable incoming service request transfers from all nodes on the specified
    /// service ID. The parameters work like those of
    /// [`subscribe_message`](Receiver::subscribe_message).
    pub fn subscribe_request(
        &mut self,
        service: ServiceId,
        extent: usize,
        timeout: I::Duration,
    ) -> Result<(), OutOfMemoryError> {
        self.subscribe(TransferKind::Request, PortId::from(service), extent, timeout)
    }

    /// Unsubscribes from requests for a service
    pub fn unsubscribe_request(&mut self, service: ServiceId) {
        self.unsubscribe(TransferKind::Request, PortId::from(service));
    }

    /// Subscribes to responses for a service
    ///
    /// This will enable incoming service response transfers from all nodes on the specified
    /// service ID. The parameters work like those of
    /// [`subscribe_message`](Receiver::subscribe_message).
    pub fn subscribe_response(
        &mut self,
        service: ServiceId,
        extent: usize,
        timeout: I::Duration,
    ) -> Result<(), OutOfMemoryError> {
        self.subscribe(TransferKind::Response, PortId::from(service), extent, timeout)
    }

    /// Unsubscribes from responses for a service
    pub fn unsubscribe_response(&mut self, service: ServiceId) {
        self.unsubscribe(TransferKind::Response, PortId::from(service));
    }

    fn subscribe(
        &mut self,
        kind: TransferKind,
        port_id: PortId,
        extent: usize,
        timeout: I::Duration,
    ) -> Result<(), OutOfMemoryError> {
        // Remove any existing subscription for the same port, releasing its sessions
        self.unsubscribe(kind, port_id);

        let subscription = FallibleBox::try_new(Subscription::new(timeout, extent, port_id))?;
        self.subscriptions_for_kind(kind)
            .insert(port_id, subscription);
        Ok(())
    }

    fn unsubscribe(&mut self, kind: TransferKind, port_id: PortId) {
        self.subscriptions_for_kind(kind).remove(&port_id);
    }

    fn subscriptions_for_kind(
        &mut self,
        kind: TransferKind,
    ) -> &mut BTreeMap<PortId, Box<Subscription<I>>> {
        match kind {
            TransferKind::Message => &mut self.subscriptions_message,
            TransferKind::Request => &mut self.subscriptions_request,
            TransferKind::Response => &mut self.subscriptions_response,
        }
    }

    /// Releases the session of every transfer that has been inactive for longer than its
    /// subscription's timeout
    ///
    /// Sessions also restart lazily when a late frame arrives, so calling this is not
    /// required for correctness; it only returns buffer memory earlier.
    pub fn clean_expired_sessions(&mut self, now: I) {
        clean_sessions_from_subscriptions(&mut self.subscriptions_message, &now);
        clean_sessions_from_subscriptions(&mut self.subscriptions_request, &now);
        clean_sessions_from_subscriptions(&mut self.subscriptions_response, &now);
    }

    /// Returns the number of transfers successfully received
    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    /// Returns the number of transfers that could not be received correctly
    ///
    /// Errors include failure to allocate memory (when handling incoming frames only),
    /// missing frames, and malformed frames.
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    fn increment_transfer_count(&mut self) {
        self.transfer_count = self.transfer_count.wrapping_add(1)
    }
    fn increment_error_count(&mut self) {
        self.error_count = self.error_count.wrapping_add(1)
    }
}

fn clean_sessions_from_subscriptions<I: Instant>(
    subscriptions: &mut BTreeMap<PortId, Box<Subscription<I>>>,
    now: &I,
) {
    for subscription in subscriptions.values_mut() {
        let timeout = subscription.timeout.clone();
        for slot in subscription.sessions.iter_mut() {
            if let Some(session) = slot.as_deref() {
                if session.is_expired(now, &timeout) {
                    // This session has timed out, delete it.
                    *slot = None;
                }
            }
        }
    }
}

/// Copies a frame payload into an owned buffer, truncating it at the extent
fn copy_payload(payload: &[u8], extent: usize) -> Result<Vec<u8>, OutOfMemoryError> {
    let length = payload.len().min(extent);
    let mut bytes: Vec<u8> = FallibleVec::try_with_capacity(length)?;
    bytes.extend_from_slice(&payload[..length]);
    Ok(bytes)
}

/// The fields of a CAN ID, parsed but not yet associated with a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawHeader {
    priority: Priority,
    source: NodeId,
    kind: RawKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Message {
        anonymous: bool,
        subject: SubjectId,
    },
    Request {
        service: ServiceId,
        destination: NodeId,
    },
    Response {
        service: ServiceId,
        destination: NodeId,
    },
}

impl RawHeader {
    fn kind(&self) -> TransferKind {
        match self.kind {
            RawKind::Message { .. } => TransferKind::Message,
            RawKind::Request { .. } => TransferKind::Request,
            RawKind::Response { .. } => TransferKind::Response,
        }
    }

    fn port_id(&self) -> PortId {
        match self.kind {
            RawKind::Message { subject, .. } => PortId::from(subject),
            RawKind::Request { service, .. } => PortId::from(service),
            RawKind::Response { service, .. } => PortId::from(service),
        }
    }

    fn is_anonymous(&self) -> bool {
        matches!(
            self.kind,
            RawKind::Message {
                anonymous: true,
                ..
            }
        )
    }
}

/// Builds a transfer header from parsed CAN ID fields
fn make_header<I>(raw: &RawHeader, transfer_id: TransferId, timestamp: I) -> Header<I> {
    match raw.kind {
        RawKind::Message { anonymous, subject } => Header::Message(MessageHeader {
            timestamp,
            transfer_id,
            priority: raw.priority,
            subject,
            source: if anonymous { None } else { Some(raw.source) },
        }),
        RawKind::Request {
            service,
            destination,
        } => Header::Request(ServiceHeader {
            timestamp,
            transfer_id,
            priority: raw.priority,
            service,
            source: raw.source,
            destination,
        }),
        RawKind::Response {
            service,
            destination,
        } => Header::Response(ServiceHeader {
            timestamp,
            transfer_id,
            priority: raw.priority,
            service,
            source: raw.source,
            destination,
        }),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CanIdParseError {
    /// Reserved bit 23 was set
    Bit23Set,
    /// On a message frame, reserved bit 7 was set
    Bit7Set,
}

fn parse_can_id(id: CanId) -> Result<RawHeader, CanIdParseError> {
    let bits = u32::from(id);

    if bits.bit_set(23) {
        return Err(CanIdParseError::Bit23Set);
    }
    // Ignore bits 22 and 21

    let priority = Priority::try_from(bits.get_u8(26)).expect("Bug: Invalid priority");
    let source = NodeId::try_from(bits.get_u8(0) & 0x7f).expect("Bug: Invalid source node ID");

    let kind = if bits.bit_set(25) {
        // Service
        let service =
            ServiceId::try_from(bits.get_u16(14) & 0x1ff).expect("Bug: Invalid service ID");
        let destination =
            NodeId::try_from(bits.get_u8(7) & 0x7f).expect("Bug: Invalid destination node ID");
        if bits.bit_set(24) {
            RawKind::Request {
                service,
                destination,
            }
        } else {
            RawKind::Response {
                service,
                destination,
            }
        }
    } else {
        // Message
        if bits.bit_set(7) {
            return Err(CanIdParseError::Bit7Set);
        }
        RawKind::Message {
            anonymous: bits.bit_set(24),
            // Subject ID is 13 bits, 0..=8191
            subject: SubjectId::try_from(bits.get_u16(8) & 0x1fff)
                .expect("Bug: Invalid subject ID"),
        }
    };

    Ok(RawHeader {
        priority,
        source,
        kind,
    })
}

/// Returns a filter that matches message transfers on one subject
///
/// Criteria:
/// * Priority: any
/// * Anonymous: any
/// * Subject ID: matching the provided subject ID
/// * Source node ID: any
pub fn subject_filter(subject: SubjectId) -> Filter {
    let m_id: u32 = 0b0_0000_0110_0000_0000_0000_0000_0000 | u32::from(subject) << 8;
    let mask: u32 = 0b0_0010_1001_1111_1111_1111_1000_0000;
    Filter::new(mask, m_id)
}

/// Returns a filter that matches service request transfers for one service to one node ID
///
/// Criteria:
/// * Priority: any
/// * Request or response: request
/// * Service ID: matching the provided service ID
/// * Destination: matching the provided node ID
/// * Source: any
pub fn request_filter(service: ServiceId, server: NodeId) -> Filter {
    let dynamic_id_bits = u32::from(service) << 14 | u32::from(server) << 7;
    let m_id: u32 = 0b0_0011_0000_0000_0000_0000_0000_0000 | dynamic_id_bits;
    let mask: u32 = 0b0_0011_1111_1111_1111_1111_1000_0000;
    Filter::new(mask, m_id)
}

/// Returns a filter that matches service response transfers for one service to one node ID
///
/// Criteria:
/// * Priority: any
/// * Request or response: response
/// * Service ID: matching the provided service ID
/// * Destination: matching the provided node ID
/// * Source: any
pub fn response_filter(service: ServiceId, client: NodeId) -> Filter {
    let dynamic_id_bits = u32::from(service) << 14 | u32::from(client) << 7;
    let m_id: u32 = 0b0_0010_0000_0000_0000_0000_0000_0000 | dynamic_id_bits;
    let mask: u32 = 0b0_0011_1111_1111_1111_1111_1000_0000;
    Filter::new(mask, m_id)
}

/// Returns 128 empty session slots
fn init_rx_sessions<I>() -> [Option<Box<Session<I>>>; RX_SESSIONS_PER_SUBSCRIPTION] {
    core::array::from_fn(|_| None)
}

/// Basic extension trait for extracting bits from a CAN ID
trait GetBits {
    fn bit_set(self, offset: u32) -> bool;
    fn get_u8(self, offset: u32) -> u8;
    fn get_u16(self, offset: u32) -> u16;
}

impl GetBits for u32 {
    fn bit_set(self, offset: u32) -> bool {
        ((self >> offset) & 1) == 1
    }
    fn get_u8(self, offset: u32) -> u8 {
        (self >> offset) as u8
    }
    fn get_u16(self, offset: u32) -> u16 {
        (self >> offset) as u16
    }
}
