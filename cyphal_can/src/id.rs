//! 29-bit extended CAN identifier encode/parse.

use core::convert::TryFrom;

use cyphal_core::id::{NodeId, ServiceId, SubjectId};
use cyphal_core::priority::Priority;
use cyphal_core::specifier::ServiceRole;

/// A validated 29-bit extended CAN identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CanId(u32);

impl CanId {
    const MAX: u32 = (1 << 29) - 1;
}

impl TryFrom<u32> for CanId {
    type Error = InvalidCanId;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value <= Self::MAX {
            Ok(CanId(value))
        } else {
            Err(InvalidCanId)
        }
    }
}

impl From<CanId> for u32 {
    fn from(id: CanId) -> Self {
        id.0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvalidCanId;

/// A message or service header, without the source node ID (which the CAN ID always carries in
/// its low 7 bits, whether or not the sender is anonymous).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MessageHeader {
    pub anonymous: bool,
    pub subject: SubjectId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ServiceHeader {
    pub role: ServiceRole,
    pub destination: NodeId,
    pub service: ServiceId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CanHeaderKind {
    Message(MessageHeader),
    Service(ServiceHeader),
}

/// Everything a CAN ID encodes, fully decoded.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CanHeader {
    pub priority: Priority,
    pub source: NodeId,
    pub kind: CanHeaderKind,
}

impl CanHeader {
    pub const fn is_anonymous(&self) -> bool {
        matches!(
            self.kind,
            CanHeaderKind::Message(MessageHeader { anonymous: true, .. })
        )
    }

    /// The destination node ID, for service transfers only.
    pub const fn destination(&self) -> Option<NodeId> {
        match self.kind {
            CanHeaderKind::Service(ServiceHeader { destination, .. }) => Some(destination),
            CanHeaderKind::Message(_) => None,
        }
    }
}

/// Builds a 29-bit CAN identifier for an outgoing frame.
///
/// `source` is the node ID to embed in bits 0..6. For an anonymous message, pass the pseudo-ID
/// derived from the payload (see [`crate::tx::make_pseudo_id`]); `anonymous` still records the
/// true anonymity of the sender in bit 24.
pub fn make_can_id(priority: Priority, source: NodeId, kind: &CanHeaderKind) -> CanId {
    let mut bits = (priority.to_u8() as u32) << 26;
    bits |= u32::from(source);

    match kind {
        CanHeaderKind::Message(message) => {
            bits |= u32::from(message.subject) << 8;
            // Bits 21 and 22 are fixed at 1 for message frames.
            bits |= (1 << 21) | (1 << 22);
            if message.anonymous {
                bits |= 1 << 24;
            }
        }
        CanHeaderKind::Service(service) => {
            bits |= u32::from(service.service) << 14;
            bits |= u32::from(service.destination) << 7;
            bits |= 1 << 25;
            if service.role == ServiceRole::Request {
                bits |= 1 << 24;
            }
        }
    }

    CanId::try_from(bits).expect("generated CAN ID does not fit into 29 bits")
}

/// Errors that can occur while parsing a CAN identifier into a [`CanHeader`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CanIdParseError {
    /// Reserved bit 23 was set.
    Bit23Set,
    /// On a message header, reserved bit 7 was set.
    Bit7Set,
}

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

/// Decodes a CAN identifier into a [`CanHeader`].
pub fn parse_can_id(id: CanId) -> Result<CanHeader, CanIdParseError> {
    let bits = u32::from(id);

    if bits.bit_set(23) {
        return Err(CanIdParseError::Bit23Set);
    }

    let priority = Priority::try_from(bits.get_u8(26) & 0x7).expect("priority field is 3 bits");
    let source = NodeId::try_from(bits.get_u8(0) & 0x7f).expect("source field is 7 bits");

    let kind = if bits.bit_set(25) {
        let service = ServiceId::try_from(bits.get_u16(14) & 0x1ff).expect("service field is 9 bits");
        let destination = NodeId::try_from(bits.get_u8(7) & 0x7f).expect("destination field is 7 bits");
        let role = if bits.bit_set(24) {
            ServiceRole::Request
        } else {
            ServiceRole::Response
        };
        CanHeaderKind::Service(ServiceHeader {
            role,
            destination,
            service,
        })
    } else {
        if bits.bit_set(7) {
            return Err(CanIdParseError::Bit7Set);
        }
        let subject = SubjectId::try_from(bits.get_u16(8) & 0x1fff).expect("subject field is 13 bits");
        CanHeaderKind::Message(MessageHeader {
            anonymous: bits.bit_set(24),
            subject,
        })
    };

    Ok(CanHeader { priority, source, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(expected: CanHeader, bits: u32) {
        let id = CanId::try_from(bits).unwrap();
        assert_eq!(parse_can_id(id).unwrap(), expected);
        assert_eq!(u32::from(make_can_id(expected.priority, expected.source, &expected.kind)), bits);
    }

    // Worked examples from the Cyphal specification's CAN transport chapter.
    #[test]
    fn heartbeat() {
        check(
            CanHeader {
                source: NodeId::try_from(42).unwrap(),
                priority: Priority::Nominal,
                kind: CanHeaderKind::Message(MessageHeader {
                    anonymous: false,
                    subject: SubjectId::try_from(7509).unwrap(),
                }),
            },
            0x107d552a,
        );
    }

    #[test]
    fn anonymous_string_primitive() {
        check(
            CanHeader {
                source: NodeId::try_from(0x75).unwrap(),
                priority: Priority::Nominal,
                kind: CanHeaderKind::Message(MessageHeader {
                    anonymous: true,
                    subject: SubjectId::try_from(4919).unwrap(),
                }),
            },
            0x11733775,
        );
    }

    #[test]
    fn node_info_request() {
        check(
            CanHeader {
                source: NodeId::try_from(123).unwrap(),
                priority: Priority::Nominal,
                kind: CanHeaderKind::Service(ServiceHeader {
                    role: ServiceRole::Request,
                    service: ServiceId::try_from(430).unwrap(),
                    destination: NodeId::try_from(42).unwrap(),
                }),
            },
            0x136b957b,
        );
    }

    #[test]
    fn node_info_response() {
        check(
            CanHeader {
                source: NodeId::try_from(42).unwrap(),
                priority: Priority::Nominal,
                kind: CanHeaderKind::Service(ServiceHeader {
                    role: ServiceRole::Response,
                    service: ServiceId::try_from(430).unwrap(),
                    destination: NodeId::try_from(123).unwrap(),
                }),
            },
            0x126bbdaa,
        );
    }

    #[test]
    fn reserved_bit_23_rejected() {
        let id = CanId::try_from(1 << 23).unwrap();
        assert_eq!(parse_can_id(id), Err(CanIdParseError::Bit23Set));
    }
}
