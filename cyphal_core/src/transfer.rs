//! Transfers and the frame shape shared by every transport.

use crate::id::NodeId;
use crate::priority::Priority;
use crate::specifier::DataSpecifier;
use crate::time::Timestamp;

/// A transfer-ID. Each transport interprets this modulo its own wrap-around width (32 for CAN,
/// effectively unbounded for serial/UDP).
pub type TransferId = u64;

/// A fragmented outgoing payload: an ordered list of byte slices that together make up the
/// transfer payload, without requiring them to be copied into one contiguous buffer first.
#[derive(Debug, Copy, Clone)]
pub struct Fragments<'a> {
    fragments: &'a [&'a [u8]],
}

impl<'a> Fragments<'a> {
    pub const fn new(fragments: &'a [&'a [u8]]) -> Self {
        Fragments { fragments }
    }

    pub fn total_len(&self) -> usize {
        self.fragments.iter().map(|f| f.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.fragments.iter().copied()
    }

    /// Iterates over every byte of every fragment, in order.
    pub fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.fragments.iter().flat_map(|f| f.iter().copied())
    }
}

/// An outgoing (or reassembled) transfer: a timestamp, a priority, a transfer-ID, and a payload.
///
/// `P` is the payload representation: [`Fragments`] for outgoing sends, or a single contiguous
/// byte slice/`Vec<u8>` for a transfer that has already been reassembled on the receive side.
#[derive(Debug, Copy, Clone)]
pub struct Transfer<P> {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub transfer_id: TransferId,
    pub payload: P,
}

/// An incoming transfer plus its source node ID (`None` for an anonymous sender).
#[derive(Debug, Clone)]
pub struct TransferFrom<P> {
    pub transfer: Transfer<P>,
    pub source: Option<NodeId>,
}

/// A transfer captured or reconstructed with no session context of its own: full addressing
/// metadata travels with the payload. Used by the capture/spoof/tracer path (C8, C11).
#[derive(Debug, Clone)]
pub struct AlienTransfer<P> {
    pub transfer: Transfer<P>,
    pub source: Option<NodeId>,
    pub destination: Option<NodeId>,
    pub data_specifier: DataSpecifier,
}

/// The fields every wire frame carries, independent of transport. Transport-specific frame types
/// (CAN, serial) extend this with their own addressing fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub priority: Priority,
    pub transfer_id: TransferId,
    pub index: u32,
    pub end_of_transfer: bool,
}

impl FrameHeader {
    /// A transfer is single-frame iff its one frame has index 0 and the end-of-transfer flag set.
    pub const fn is_single_frame(&self) -> bool {
        self.index == 0 && self.end_of_transfer
    }
}
