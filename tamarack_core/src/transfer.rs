//! Transfer metadata and transfer types

use crate::{NodeId, Priority, ServiceId, SubjectId, TransferId};

/// The types of transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferKind {
    /// A message broadcast to all nodes on a subject
    Message,
    /// A service request from a client to a server
    Request,
    /// A service response from a server back to the requesting client
    Response,
}

/// The header of a message transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader<I> {
    /// For RX transfers: the time when the first frame was received.
    /// For TX transfers: the transmission deadline for all frames of this transfer.
    pub timestamp: I,
    /// The ID of this transfer
    pub transfer_id: TransferId,
    /// The priority of this transfer
    pub priority: Priority,
    /// The subject of this message
    pub subject: SubjectId,
    /// The source node, or None if this transfer is anonymous
    pub source: Option<NodeId>,
}

/// The header of a service request or response transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHeader<I> {
    /// For RX transfers: the time when the first frame was received.
    /// For TX transfers: the transmission deadline for all frames of this transfer.
    pub timestamp: I,
    /// The ID of this transfer
    pub transfer_id: TransferId,
    /// The priority of this transfer
    pub priority: Priority,
    /// The ID of the service being invoked
    pub service: ServiceId,
    /// The node that sent this transfer
    pub source: NodeId,
    /// The node that this transfer is addressed to
    pub destination: NodeId,
}

/// Transfer metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header<I> {
    Message(MessageHeader<I>),
    Request(ServiceHeader<I>),
    Response(ServiceHeader<I>),
}

impl<I> Header<I> {
    /// Returns the timestamp of this header
    pub fn timestamp(&self) -> I
    where
        I: Clone,
    {
        match self {
            Header::Message(header) => header.timestamp.clone(),
            Header::Request(header) => header.timestamp.clone(),
            Header::Response(header) => header.timestamp.clone(),
        }
    }

    /// Returns the priority of this transfer
    pub fn priority(&self) -> Priority {
        match self {
            Header::Message(header) => header.priority,
            Header::Request(header) => header.priority,
            Header::Response(header) => header.priority,
        }
    }

    /// Returns the transfer ID
    pub fn transfer_id(&self) -> TransferId {
        match self {
            Header::Message(header) => header.transfer_id,
            Header::Request(header) => header.transfer_id,
            Header::Response(header) => header.transfer_id,
        }
    }

    /// Returns the source node ID, or None if this is an anonymous message
    pub fn source(&self) -> Option<NodeId> {
        match self {
            Header::Message(header) => header.source,
            Header::Request(header) => Some(header.source),
            Header::Response(header) => Some(header.source),
        }
    }

    /// Returns the kind of this transfer
    pub fn kind(&self) -> TransferKind {
        match self {
            Header::Message(_) => TransferKind::Message,
            Header::Request(_) => TransferKind::Request,
            Header::Response(_) => TransferKind::Response,
        }
    }

    /// Returns the service header, if this is a request or response
    pub fn service_header(&self) -> Option<&ServiceHeader<I>> {
        match self {
            Header::Message(_) => None,
            Header::Request(header) => Some(header),
            Header::Response(header) => Some(header),
        }
    }
}

/// A transfer, parameterized by the payload storage `A` and the instant type `I`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer<A, I> {
    /// The transfer metadata
    pub header: Header<I>,
    /// The transfer payload, excluding tail bytes and transfer CRC
    pub payload: A,
}

/// A message transfer, known not to be a service transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTransfer<A, I> {
    pub header: MessageHeader<I>,
    pub payload: A,
}

/// A service request or response transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTransfer<A, I> {
    pub header: ServiceHeader<I>,
    pub payload: A,
}
