//!
//! # Tamarack: a compact Cyphal/CAN implementation
//!
//! This crate ties the transport layer together into a single-threaded node: it tracks
//! transfer IDs for outgoing transfers, dispatches completed incoming transfers to a
//! handler, and drives the outgoing frame queue against a driver. Everything runs on the
//! caller's stack; there is no background activity and no global state.
//!

#![no_std]

extern crate alloc;

// Reexports from the other tamarack crates
pub use tamarack_can::*;
pub use tamarack_core::transfer;
pub use tamarack_core::*;

use alloc::vec::Vec;

use heapless::LinearMap;

use tamarack_can::queue::{FrameQueueSource, FrameSink};
use tamarack_core::nb;
use tamarack_core::time::{Clock, Instant};
use tamarack_core::transfer::{
    Header, MessageHeader, MessageTransfer, ServiceHeader, ServiceTransfer, Transfer,
};

/// Assembles transfers and manages transfer IDs to send messages
///
/// The subject ID is not part of this struct because it is used as a key in the map of
/// publishers.
pub struct Publisher<I: Instant> {
    /// The ID of the next transfer sent
    next_transfer_id: TransferId,
    /// Timeout for sending a transfer, measured from the time the transfer is pushed
    timeout: I::Duration,
    /// Priority for transfers
    priority: Priority,
    /// ID of this node
    source: NodeId,
}

impl<I: Instant> Publisher<I> {
    /// Creates a message publisher
    ///
    /// node_id: The ID of this node
    ///
    /// priority: The priority to use for messages
    pub fn new(node_id: NodeId, timeout: I::Duration, priority: Priority) -> Self {
        Publisher {
            next_transfer_id: TransferId::const_default(),
            timeout,
            priority,
            source: node_id,
        }
    }

    /// Breaks a payload into frames and enqueues them for sending on a subject
    pub fn publish<Q>(
        &mut self,
        now: I,
        subject: SubjectId,
        payload: &[u8],
        transmitter: &mut Transmitter<Q>,
    ) -> Result<(), PushError>
    where
        Q: FrameSink<I>,
    {
        let deadline = self.timeout.clone() + now;
        let transfer: Transfer<&[u8], I> = Transfer {
            header: Header::Message(MessageHeader {
                timestamp: deadline,
                transfer_id: self.next_transfer_id,
                priority: self.priority,
                subject,
                source: Some(self.source),
            }),
            payload,
        };
        self.next_transfer_id = self.next_transfer_id.increment();

        transmitter.push(transfer)
    }
}

/// A publisher that sends anonymous messages and does not require a node ID
///
/// Anonymous transfers must fit into a single frame.
pub struct AnonymousPublisher {
    /// The priority of transfers from this publisher
    priority: Priority,
    /// The subject to transmit on
    subject: SubjectId,
    /// The ID of the next transfer sent
    next_transfer_id: TransferId,
}

impl AnonymousPublisher {
    /// Creates an anonymous message publisher
    ///
    /// priority: The priority to use for messages
    ///
    /// subject: The subject ID to publish to
    pub fn new(priority: Priority, subject: SubjectId) -> Self {
        AnonymousPublisher {
            priority,
            subject,
            next_transfer_id: TransferId::const_default(),
        }
    }

    /// Enqueues an anonymous message for sending
    ///
    /// The source node pseudo-ID is derived from the payload when the frame is created.
    pub fn send<Q, I>(
        &mut self,
        payload: &[u8],
        deadline: I,
        transmitter: &mut Transmitter<Q>,
    ) -> Result<(), PushError>
    where
        Q: FrameSink<I>,
        I: Instant,
    {
        let transfer: Transfer<&[u8], I> = Transfer {
            header: Header::Message(MessageHeader {
                timestamp: deadline,
                transfer_id: self.next_transfer_id,
                priority: self.priority,
                subject: self.subject,
                source: None,
            }),
            payload,
        };
        self.next_transfer_id = self.next_transfer_id.increment();

        transmitter.push(transfer)
    }
}

/// Assembles transfers and manages transfer IDs to send service requests
pub struct Requester<I: Instant> {
    /// The ID of this node
    this_node: NodeId,
    /// The priority of transfers from this requester
    priority: Priority,
    /// The timeout for sending transfers
    timeout: I::Duration,
    /// The ID of the next transfer sent
    next_transfer_id: TransferId,
}

impl<I: Instant> Requester<I> {
    /// Creates a service request transmitter
    ///
    /// this_node: The ID of this node
    ///
    /// priority: The priority to use for requests
    pub fn new(this_node: NodeId, timeout: I::Duration, priority: Priority) -> Self {
        Requester {
            this_node,
            priority,
            timeout,
            next_transfer_id: TransferId::const_default(),
        }
    }

    /// Breaks a request payload into frames and enqueues them for sending
    pub fn send<Q>(
        &mut self,
        now: I,
        service: ServiceId,
        payload: &[u8],
        destination: NodeId,
        transmitter: &mut Transmitter<Q>,
    ) -> Result<(), PushError>
    where
        Q: FrameSink<I>,
    {
        let deadline = self.timeout.clone() + now;
        let transfer: Transfer<&[u8], I> = Transfer {
            header: Header::Request(ServiceHeader {
                timestamp: deadline,
                transfer_id: self.next_transfer_id,
                priority: self.priority,
                service,
                source: self.this_node,
                destination,
            }),
            payload,
        };
        self.next_transfer_id = self.next_transfer_id.increment();

        transmitter.push(transfer)
    }
}

/// A token from a request that is needed to send a response
#[derive(Debug)]
pub struct ResponseToken {
    /// ID of the service that this is a response for
    service: ServiceId,
    /// ID of the node that sent the request
    client: NodeId,
    /// Transfer ID of the request transfer (and also the response transfer)
    transfer: TransferId,
    /// Priority of the request transfer (and also the response transfer)
    priority: Priority,
}

/// Something that may be able to handle incoming transfers
pub trait TransferHandler<C: Clock> {
    /// Handles an incoming message transfer
    fn handle_message(&mut self, transfer: MessageTransfer<Vec<u8>, C::Instant>);

    /// Handles an incoming service request
    ///
    /// The token and responder can be used to send a response with matching metadata.
    fn handle_request(
        &mut self,
        transfer: ServiceTransfer<Vec<u8>, C::Instant>,
        token: ResponseToken,
        responder: Responder<'_, C>,
    );

    /// Handles an incoming service response
    fn handle_response(&mut self, transfer: ServiceTransfer<Vec<u8>, C::Instant>);
}

/// A high-level interface to Cyphal node functionality
///
/// Type parameters:
/// * `C`: The clock used to get the current time
/// * `H`: The `TransferHandler` that receives incoming transfers
/// * `P`: The maximum number of subjects that can be published
/// * `R`: The maximum number of services for which requests can be sent
///
pub struct Node<C, H, const P: usize, const R: usize>
where
    C: Clock,
{
    clock: C,
    transmitter: Transmitter<FrameQueue<C::Instant>>,
    receiver: Receiver<C::Instant>,
    transfer_handler: H,
    node_id: NodeId,
    publishers: LinearMap<SubjectId, Publisher<C::Instant>, P>,
    // TODO: Need a separate next transfer ID for each destination node
    requesters: LinearMap<ServiceId, Requester<C::Instant>, R>,
}

impl<C, H, const P: usize, const R: usize> Node<C, H, P, R>
where
    C: Clock,
    H: TransferHandler<C>,
{
    /// Creates a node
    ///
    /// queue_capacity: The maximum number of outgoing frames that can be queued at once
    pub fn new(
        clock: C,
        transfer_handler: H,
        node_id: NodeId,
        mtu: Mtu,
        queue_capacity: usize,
    ) -> Self {
        Node {
            transmitter: Transmitter::new(mtu, FrameQueue::new(queue_capacity)),
            receiver: Receiver::new(Some(node_id)),
            clock,
            transfer_handler,
            node_id,
            publishers: LinearMap::new(),
            requesters: LinearMap::new(),
        }
    }

    /// Handles an incoming frame, dispatching any completed transfer to the handler
    pub fn accept_frame(
        &mut self,
        frame: Frame<C::Instant>,
        iface_index: u8,
    ) -> Result<(), OutOfMemoryError> {
        if let Some(transfer) = self.receiver.accept(frame, iface_index)? {
            self.handle_incoming_transfer(transfer);
        }
        Ok(())
    }

    fn handle_incoming_transfer(&mut self, transfer: Transfer<Vec<u8>, C::Instant>) {
        match transfer.header {
            Header::Message(message_header) => {
                let message_transfer = MessageTransfer {
                    header: message_header,
                    payload: transfer.payload,
                };
                self.transfer_handler.handle_message(message_transfer);
            }
            Header::Request(service_header) => {
                let token = ResponseToken {
                    service: service_header.service,
                    client: service_header.source,
                    transfer: service_header.transfer_id,
                    priority: service_header.priority,
                };
                let service_transfer = ServiceTransfer {
                    header: service_header,
                    payload: transfer.payload,
                };
                let responder = Responder {
                    this_node: self.node_id,
                    transmitter: &mut self.transmitter,
                    clock: &mut self.clock,
                };
                self.transfer_handler
                    .handle_request(service_transfer, token, responder);
            }
            Header::Response(service_header) => {
                let service_transfer = ServiceTransfer {
                    header: service_header,
                    payload: transfer.payload,
                };
                self.transfer_handler.handle_response(service_transfer);
            }
        }
    }

    /// Sets up to publish messages on a subject
    pub fn start_publishing_topic(
        &mut self,
        subject: SubjectId,
        timeout: <C::Instant as Instant>::Duration,
        priority: Priority,
    ) -> Result<PublishToken, CapacityError> {
        let token = PublishToken(subject);
        self.publishers
            .insert(subject, Publisher::new(self.node_id, timeout, priority))
            .map(|_| token)
            .map_err(|_| CapacityError(()))
    }

    /// Publishes a message on a previously registered subject
    pub fn publish_to_topic(
        &mut self,
        token: &PublishToken,
        payload: &[u8],
    ) -> Result<(), PushError> {
        let now = self.clock.now();
        // Expired frames make room for the new transfer before capacity is checked
        self.transmitter.frame_queue_mut().clean_expired_frames(&now);
        let publisher = self
            .publishers
            .get_mut(&token.0)
            .expect("Bug: Token exists but no publisher");
        publisher.publish(now, token.0, payload, &mut self.transmitter)
    }

    /// Sets up to send requests for a service
    ///
    /// This also subscribes to the corresponding responses.
    pub fn start_sending_requests(
        &mut self,
        service: ServiceId,
        receive_timeout: <C::Instant as Instant>::Duration,
        response_extent: usize,
        priority: Priority,
    ) -> Result<ServiceToken, CapacityOrMemoryError> {
        let token = ServiceToken(service);
        self.requesters
            .insert(
                service,
                Requester::new(self.node_id, receive_timeout.clone(), priority),
            )
            .map_err(|_| CapacityError(()))?;
        match self
            .receiver
            .subscribe_response(service, response_extent, receive_timeout)
        {
            Ok(()) => Ok(token),
            Err(e) => {
                // Clean up requester
                self.requesters.remove(&service);
                Err(e.into())
            }
        }
    }

    /// Sends a request for a previously registered service
    pub fn send_request(
        &mut self,
        token: &ServiceToken,
        payload: &[u8],
        destination: NodeId,
    ) -> Result<(), PushError> {
        let now = self.clock.now();
        self.transmitter.frame_queue_mut().clean_expired_frames(&now);
        let requester = self
            .requesters
            .get_mut(&token.0)
            .expect("Bug: No requester for token");
        requester.send(now, token.0, payload, destination, &mut self.transmitter)
    }

    /// Subscribes to messages on a subject
    pub fn subscribe_message(
        &mut self,
        subject: SubjectId,
        extent: usize,
        timeout: <C::Instant as Instant>::Duration,
    ) -> Result<(), OutOfMemoryError> {
        self.receiver.subscribe_message(subject, extent, timeout)
    }

    /// Subscribes to requests for a service
    pub fn subscribe_request(
        &mut self,
        service: ServiceId,
        extent: usize,
        timeout: <C::Instant as Instant>::Duration,
    ) -> Result<(), OutOfMemoryError> {
        self.receiver.subscribe_request(service, extent, timeout)
    }

    /// Returns a responder, which can be used to respond to service requests
    pub fn responder(&mut self) -> Responder<'_, C> {
        Responder {
            this_node: self.node_id,
            transmitter: &mut self.transmitter,
            clock: &mut self.clock,
        }
    }

    /// Hands queued outgoing frames to a driver, in CAN arbitration order
    ///
    /// Frames past their deadline are dropped first. For each remaining frame, `try_send`
    /// returns `Ok(())` when the frame was handed to the hardware (the frame is removed),
    /// `Err(nb::Error::WouldBlock)` when the hardware is busy (the frame stays queued and
    /// this function returns), or `Err(nb::Error::Other(_))` on a permanent failure (the
    /// whole transfer is discarded and the error is returned).
    pub fn flush<E, F>(&mut self, mut try_send: F) -> Result<(), E>
    where
        F: FnMut(&Frame<C::Instant>) -> nb::Result<(), E>,
    {
        let now = self.clock.now();
        let queue = self.transmitter.frame_queue_mut();
        queue.clean_expired_frames(&now);
        while let Some(frame) = queue.peek_frame() {
            let status = try_send(frame);
            match status {
                Ok(()) => {
                    queue.pop_frame();
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    queue.discard_transfer();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Drops expired outgoing frames and releases expired receive sessions
    pub fn clean_expired(&mut self) {
        let now = self.clock.now();
        self.transmitter.frame_queue_mut().clean_expired_frames(&now);
        self.receiver.clean_expired_sessions(now);
    }

    /// Returns a reference to the enclosed clock
    pub fn clock(&self) -> &C {
        &self.clock
    }
    /// Returns a mutable reference to the enclosed clock
    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    /// Returns a reference to the transmitter
    pub fn transmitter(&self) -> &Transmitter<FrameQueue<C::Instant>> {
        &self.transmitter
    }
    /// Returns a mutable reference to the transmitter
    pub fn transmitter_mut(&mut self) -> &mut Transmitter<FrameQueue<C::Instant>> {
        &mut self.transmitter
    }

    /// Returns a reference to the receiver
    pub fn receiver(&self) -> &Receiver<C::Instant> {
        &self.receiver
    }
    /// Returns a mutable reference to the receiver
    pub fn receiver_mut(&mut self) -> &mut Receiver<C::Instant> {
        &mut self.receiver
    }

    /// Returns a reference to the transfer handler
    pub fn transfer_handler(&self) -> &H {
        &self.transfer_handler
    }
    /// Returns a mutable reference to the transfer handler
    pub fn transfer_handler_mut(&mut self) -> &mut H {
        &mut self.transfer_handler
    }

    /// Returns the identifier of this node
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

/// Sends responses for incoming service requests
pub struct Responder<'a, C>
where
    C: Clock,
{
    this_node: NodeId,
    transmitter: &'a mut Transmitter<FrameQueue<C::Instant>>,
    clock: &'a mut C,
}

impl<C> Responder<'_, C>
where
    C: Clock,
{
    /// Enqueues a response matching the metadata of a previously received request
    pub fn send_response(
        &mut self,
        token: ResponseToken,
        timeout: <C::Instant as Instant>::Duration,
        payload: &[u8],
    ) -> Result<(), PushError> {
        let now = self.clock.now();
        let deadline = timeout + now;
        let transfer_out: Transfer<&[u8], C::Instant> = Transfer {
            header: Header::Response(ServiceHeader {
                timestamp: deadline,
                transfer_id: token.transfer,
                priority: token.priority,
                service: token.service,
                source: self.this_node,
                destination: token.client,
            }),
            payload,
        };
        self.transmitter.push(transfer_out)
    }
}

/// A token returned from start_publishing_topic that can be used to publish a transfer on
/// the associated subject ID
pub struct PublishToken(SubjectId);

/// A token returned from start_sending_requests that can be used to request a service using
/// the associated service ID
pub struct ServiceToken(ServiceId);

/// An error indicating that an operation ran out of space in a fixed-capacity data structure
#[derive(Debug)]
pub struct CapacityError(());

/// An error from an operation that uses both fixed-capacity structures and allocated memory
#[derive(Debug)]
pub enum CapacityOrMemoryError {
    Capacity(CapacityError),
    OutOfMemory(OutOfMemoryError),
}

impl From<CapacityError> for CapacityOrMemoryError {
    fn from(inner: CapacityError) -> Self {
        CapacityOrMemoryError::Capacity(inner)
    }
}
impl From<OutOfMemoryError> for CapacityOrMemoryError {
    fn from(inner: OutOfMemoryError) -> Self {
        CapacityOrMemoryError::OutOfMemory(inner)
    }
}
