//! 32-byte serial frame header and COBS-wrapped frame assembly.

use core::convert::{TryFrom, TryInto};
use core::fmt;

use cyphal_core::priority::{InvalidPriority, Priority};
use cyphal_core::specifier::{DataSpecifier, ServiceRole};
use cyphal_core::id::{InvalidId, NodeId, ServiceId, SubjectId};
use cyphal_core::transfer::TransferId;
use cyphal_crc::Crc32c;

/// Size in bytes of the fixed serial frame header, including its own trailing CRC.
pub const HEADER_SIZE: usize = 32;

const HEADER_CRC_OFFSET: usize = 28;
const ANONYMOUS_NODE_ID: u16 = 0xFFFF;
const BROADCAST_NODE_ID: u16 = 0xFFFF;
const SERVICE_NOT_RESPONSE_BIT: u16 = 1 << 15;
const SERVICE_RESPONSE_BIT: u16 = 1 << 14;
const EOT_BIT: u32 = 1 << 31;

/// The protocol version this crate speaks. Frames with a different version are rejected.
pub const VERSION: u8 = 0;

/// A decoded (or about-to-be-encoded) serial frame header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub priority: Priority,
    pub source_node_id: Option<NodeId>,
    pub destination_node_id: Option<NodeId>,
    pub data_specifier: DataSpecifier,
    pub transfer_id: TransferId,
    pub frame_index: u32,
    pub end_of_transfer: bool,
}

/// A header failed to decode from its 32-byte wire representation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeaderError {
    UnsupportedVersion(u8),
    InvalidPriority,
    InvalidDataSpecifier,
    InvalidNodeId,
    CrcMismatch,
}

impl From<InvalidPriority> for HeaderError {
    fn from(_: InvalidPriority) -> Self {
        HeaderError::InvalidPriority
    }
}

impl From<InvalidId> for HeaderError {
    fn from(_: InvalidId) -> Self {
        HeaderError::InvalidNodeId
    }
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::UnsupportedVersion(v) => write!(f, "unsupported header version {}", v),
            HeaderError::InvalidPriority => f.write_str("invalid priority value"),
            HeaderError::InvalidDataSpecifier => f.write_str("invalid data specifier"),
            HeaderError::InvalidNodeId => f.write_str("invalid node id"),
            HeaderError::CrcMismatch => f.write_str("header CRC-32C mismatch"),
        }
    }
}

impl std::error::Error for HeaderError {}

fn encode_data_specifier(spec: &DataSpecifier) -> u16 {
    match spec {
        DataSpecifier::Message { subject } => subject.to_u16(),
        DataSpecifier::Service { service, role } => {
            let response_bit = match role {
                ServiceRole::Request => 0,
                ServiceRole::Response => SERVICE_RESPONSE_BIT,
            };
            SERVICE_NOT_RESPONSE_BIT | response_bit | service.to_u16()
        }
    }
}

fn decode_data_specifier(bits: u16) -> Result<DataSpecifier, HeaderError> {
    if bits & SERVICE_NOT_RESPONSE_BIT == 0 {
        let subject = SubjectId::try_from(bits)?;
        Ok(DataSpecifier::Message { subject })
    } else {
        let role = if bits & SERVICE_RESPONSE_BIT != 0 {
            ServiceRole::Response
        } else {
            ServiceRole::Request
        };
        let service = ServiceId::try_from(bits & 0x3fff)?;
        Ok(DataSpecifier::Service { service, role })
    }
}

impl Header {
    /// Encodes this header to its 32-byte wire representation, including the trailing CRC-32C of
    /// the preceding 28 bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = VERSION;
        out[1] = self.priority.to_u8();
        let source = self.source_node_id.map(u8::from).map(u16::from).unwrap_or(ANONYMOUS_NODE_ID);
        out[2..4].copy_from_slice(&source.to_le_bytes());
        let destination = self
            .destination_node_id
            .map(u8::from)
            .map(u16::from)
            .unwrap_or(BROADCAST_NODE_ID);
        out[4..6].copy_from_slice(&destination.to_le_bytes());
        out[6..8].copy_from_slice(&encode_data_specifier(&self.data_specifier).to_le_bytes());
        // bytes 8..16 stay zero (reserved).
        out[16..24].copy_from_slice(&self.transfer_id.to_le_bytes());
        let index_with_eot = (self.frame_index & !EOT_BIT) | if self.end_of_transfer { EOT_BIT } else { 0 };
        out[24..28].copy_from_slice(&index_with_eot.to_le_bytes());
        let crc = Crc32c::of([&out[..HEADER_CRC_OFFSET]]);
        out[HEADER_CRC_OFFSET..].copy_from_slice(&crc.value_as_bytes());
        out
    }

    /// Decodes a header from its 32-byte wire representation.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, HeaderError> {
        let crc = Crc32c::of([&bytes[..HEADER_CRC_OFFSET]]);
        let expected = u32::from_le_bytes(bytes[HEADER_CRC_OFFSET..].try_into().unwrap());
        if crc.value() != expected {
            return Err(HeaderError::CrcMismatch);
        }
        let version = bytes[0];
        if version != VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        let priority = Priority::try_from(bytes[1])?;
        let source = u16::from_le_bytes(bytes[2..4].try_into().unwrap());
        let source_node_id = if source == ANONYMOUS_NODE_ID {
            None
        } else {
            Some(NodeId::try_from(u8::try_from(source).map_err(|_| HeaderError::InvalidNodeId)?)?)
        };
        let destination = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        let destination_node_id = if destination == BROADCAST_NODE_ID {
            None
        } else {
            Some(NodeId::try_from(
                u8::try_from(destination).map_err(|_| HeaderError::InvalidNodeId)?,
            )?)
        };
        let data_specifier_bits = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
        let data_specifier =
            decode_data_specifier(data_specifier_bits).map_err(|_| HeaderError::InvalidDataSpecifier)?;
        let transfer_id = TransferId::from_le_bytes(bytes[16..24].try_into().unwrap());
        let index_with_eot = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        Ok(Header {
            priority,
            source_node_id,
            destination_node_id,
            data_specifier,
            transfer_id,
            frame_index: index_with_eot & !EOT_BIT,
            end_of_transfer: index_with_eot & EOT_BIT != 0,
        })
    }
}

/// A frame assembly error: either the header or the payload failed validation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameError {
    Header(HeaderError),
    Cobs,
    TooShort,
    PayloadCrcMismatch,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Header(e) => write!(f, "{}", e),
            FrameError::Cobs => f.write_str("malformed COBS encoding"),
            FrameError::TooShort => f.write_str("decoded frame shorter than header plus payload CRC"),
            FrameError::PayloadCrcMismatch => f.write_str("payload CRC-32C mismatch"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<HeaderError> for FrameError {
    fn from(e: HeaderError) -> Self {
        FrameError::Header(e)
    }
}

/// Encodes `header` and `payload` into the bytes that go on the wire between two `0x00`
/// delimiters: `cobs(header || payload || CRC32C(payload))`. The caller is responsible for
/// writing the delimiters themselves (see [`crate::stream_parser`]).
pub fn encode_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut plain = Vec::with_capacity(HEADER_SIZE + payload.len() + 4);
    plain.extend_from_slice(&header.encode());
    plain.extend_from_slice(payload);
    plain.extend_from_slice(&Crc32c::of([payload]).value_as_bytes());
    cobs::encode_vec(&plain)
}

/// Decodes the COBS region between two delimiters (delimiters themselves excluded) back into a
/// header and payload.
pub fn decode_frame(cobs_region: &[u8]) -> Result<(Header, Vec<u8>), FrameError> {
    let plain = cobs::decode_vec(cobs_region).map_err(|_| FrameError::Cobs)?;
    if plain.len() < HEADER_SIZE + 4 {
        return Err(FrameError::TooShort);
    }
    let header_bytes: [u8; HEADER_SIZE] = plain[..HEADER_SIZE].try_into().unwrap();
    let header = Header::decode(&header_bytes)?;
    let (payload, crc_bytes) = plain[HEADER_SIZE..].split_at(plain.len() - HEADER_SIZE - 4);
    let expected = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    if Crc32c::of([payload]).value() != expected {
        return Err(FrameError::PayloadCrcMismatch);
    }
    Ok((header, payload.to_vec()))
}
