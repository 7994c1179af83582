//!
//! Common definitions for the Cyphal transport implementation
//!

#![no_std]

pub use nb;

pub mod time;
pub mod transfer;

use core::convert::TryFrom;
use core::fmt;

use fallible_collections::TryReserveError;

/// An error indicating that a value was out of range for its type
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidValue(());

impl Default for InvalidValue {
    fn default() -> Self {
        InvalidValue(())
    }
}

/// An error indicating that memory could not be allocated
#[derive(Debug, PartialEq, Eq)]
pub struct OutOfMemoryError(pub(crate) ());

impl OutOfMemoryError {
    pub const fn new() -> Self {
        OutOfMemoryError(())
    }
}

impl From<TryReserveError> for OutOfMemoryError {
    fn from(_: TryReserveError) -> Self {
        OutOfMemoryError(())
    }
}

impl fmt::Display for OutOfMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of memory")
    }
}

/// Node ID
///
/// Valid node IDs are in the range 0..=127. The value 255 that the wire protocol uses to mark
/// an anonymous source is represented as `Option::<NodeId>::None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u8);

impl NodeId {
    /// The smallest allowed node ID
    pub const MIN: NodeId = NodeId(0);
    /// The largest allowed node ID
    pub const MAX: NodeId = NodeId(127);

    /// Creates a node ID from a byte, discarding any bits that do not fit
    pub const fn from_truncating(bits: u8) -> NodeId {
        NodeId(bits & 0x7f)
    }

    /// Returns this ID as a byte
    pub const fn to_u8(self) -> u8 {
        self.0
    }

    /// Returns true if this ID is one of the two largest IDs, which are reserved for
    /// diagnostic and debugging tools
    pub const fn is_diagnostic_reserved(self) -> bool {
        self.0 >= 126
    }
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidValue;
    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        if bits <= NodeId::MAX.0 {
            Ok(NodeId(bits))
        } else {
            Err(InvalidValue(()))
        }
    }
}

impl From<NodeId> for u8 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}
impl From<NodeId> for u16 {
    fn from(id: NodeId) -> Self {
        id.0.into()
    }
}
impl From<NodeId> for u32 {
    fn from(id: NodeId) -> Self {
        id.0.into()
    }
}
impl From<NodeId> for usize {
    fn from(id: NodeId) -> Self {
        id.0.into()
    }
}

/// Subject ID, in the range 0..=8191
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectId(u16);

impl SubjectId {
    /// The largest allowed subject ID
    pub const MAX: SubjectId = SubjectId(8191);

    /// Returns this ID as a u16
    pub const fn to_u16(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for SubjectId {
    type Error = InvalidValue;
    fn try_from(bits: u16) -> Result<Self, Self::Error> {
        if bits <= SubjectId::MAX.0 {
            Ok(SubjectId(bits))
        } else {
            Err(InvalidValue(()))
        }
    }
}

impl From<SubjectId> for u16 {
    fn from(id: SubjectId) -> Self {
        id.0
    }
}
impl From<SubjectId> for u32 {
    fn from(id: SubjectId) -> Self {
        id.0.into()
    }
}

/// Service ID, in the range 0..=511
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(u16);

impl ServiceId {
    /// The largest allowed service ID
    pub const MAX: ServiceId = ServiceId(511);

    /// Returns this ID as a u16
    pub const fn to_u16(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for ServiceId {
    type Error = InvalidValue;
    fn try_from(bits: u16) -> Result<Self, Self::Error> {
        if bits <= ServiceId::MAX.0 {
            Ok(ServiceId(bits))
        } else {
            Err(InvalidValue(()))
        }
    }
}

impl From<ServiceId> for u16 {
    fn from(id: ServiceId) -> Self {
        id.0
    }
}
impl From<ServiceId> for u32 {
    fn from(id: ServiceId) -> Self {
        id.0.into()
    }
}

/// A subject or service ID, used to look up subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(u16);

impl From<SubjectId> for PortId {
    fn from(subject: SubjectId) -> Self {
        PortId(subject.0)
    }
}
impl From<ServiceId> for PortId {
    fn from(service: ServiceId) -> Self {
        PortId(service.0)
    }
}
impl From<PortId> for u16 {
    fn from(port: PortId) -> Self {
        port.0
    }
}

/// Transfer ID, a 5-bit counter that wraps around modulo 32
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(u8);

impl TransferId {
    /// The largest allowed transfer ID
    pub const MAX: TransferId = TransferId(31);

    /// Returns the default transfer ID (0)
    pub const fn const_default() -> TransferId {
        TransferId(0)
    }

    /// Creates a transfer ID from a byte, discarding any bits that do not fit
    pub const fn from_truncating(bits: u8) -> TransferId {
        TransferId(bits & 0x1f)
    }

    /// Returns the transfer ID one greater than this, wrapping around modulo 32
    pub const fn increment(self) -> TransferId {
        TransferId((self.0 + 1) & 0x1f)
    }

    /// Returns the number of increments that separate `other` from this ID, modulo 32
    pub const fn distance(self, other: TransferId) -> u8 {
        self.0.wrapping_sub(other.0) & 0x1f
    }
}

impl Default for TransferId {
    fn default() -> Self {
        TransferId::const_default()
    }
}

impl TryFrom<u8> for TransferId {
    type Error = InvalidValue;
    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        if bits <= TransferId::MAX.0 {
            Ok(TransferId(bits))
        } else {
            Err(InvalidValue(()))
        }
    }
}

impl From<TransferId> for u8 {
    fn from(id: TransferId) -> Self {
        id.0
    }
}

/// Transfer priority, from 0 (exceptional, highest) to 7 (optional, lowest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Exceptional = 0,
    Immediate = 1,
    Fast = 2,
    High = 3,
    Nominal = 4,
    Low = 5,
    Slow = 6,
    Optional = 7,
}

impl Default for Priority {
    /// Returns Nominal priority
    fn default() -> Self {
        Priority::Nominal
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidValue;
    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            0 => Ok(Priority::Exceptional),
            1 => Ok(Priority::Immediate),
            2 => Ok(Priority::Fast),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Nominal),
            5 => Ok(Priority::Low),
            6 => Ok(Priority::Slow),
            7 => Ok(Priority::Optional),
            _ => Err(InvalidValue(())),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as u8
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_id_range() {
        assert_eq!(Ok(NodeId::MIN), NodeId::try_from(0));
        assert_eq!(Ok(NodeId::MAX), NodeId::try_from(127));
        assert!(NodeId::try_from(128).is_err());
        assert!(NodeId::try_from(255).is_err());
        assert_eq!(NodeId::from_truncating(255), NodeId::MAX);
    }

    #[test]
    fn transfer_id_wraps() {
        let mut id = TransferId::const_default();
        for _ in 0..32 {
            id = id.increment();
        }
        assert_eq!(id, TransferId::const_default());
    }

    #[test]
    fn transfer_id_distance() {
        let five = TransferId::try_from(5).unwrap();
        let six = TransferId::try_from(6).unwrap();
        assert_eq!(six.distance(five), 1);
        assert_eq!(five.distance(six), 31);
        assert_eq!(five.distance(five), 0);
    }

    #[test]
    fn priority_round_trip() {
        for bits in 0..8u8 {
            let priority = Priority::try_from(bits).unwrap();
            assert_eq!(u8::from(priority), bits);
        }
        assert!(Priority::try_from(8).is_err());
    }
}
