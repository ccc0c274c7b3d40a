//! In-order CAN transfer reassembly.
//!
//! One [`Receiver`] is owned per source node ID (keyed by the CAN ID's source field, or by the
//! anonymous pseudo-ID for anonymous senders; see [`crate::tx::make_pseudo_id`]). Unlike the
//! generic high-overhead reassembler (`cyphal_transfer::reassembler`), CAN delivers frames
//! in-order, so this state machine tracks a toggle bit instead of a sparse payload array.

use alloc::vec::Vec;

use cyphal_core::id::NodeId;
use cyphal_core::priority::Priority;
use cyphal_core::time::Timestamp;
use cyphal_core::transfer::{Transfer, TransferFrom, TransferId};

use crate::crc::TransferCrc;
use crate::frame::{forward_distance, TailByte};

/// Number of trailing bytes occupied by the CAN transfer CRC (CRC-16/CCITT-FALSE).
const TRANSFER_CRC_LEN: usize = 2;

/// A per-frame protocol violation. These are statistics, not raised errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CanReassemblyError {
    /// A continuation frame (or a restart) arrived without a preceding start-of-transfer frame.
    MissedStartOfTransfer,
    /// A frame carried a transfer-ID different from the one currently being reassembled.
    UnexpectedTransferId,
    /// A frame's toggle bit did not match the expected alternation.
    UnexpectedToggleBit,
    /// The trailing CRC-16/CCITT-FALSE check failed on a completed multi-frame transfer.
    TransferCrcMismatch,
}

/// The outcome of feeding one frame to a [`Receiver`].
pub enum CanOutcome {
    /// The frame was accepted but did not complete a transfer.
    Pending,
    /// The frame completed a transfer.
    Transfer(TransferFrom<Vec<u8>>),
    /// The frame (or an implied prior frame) violated the reassembly protocol.
    Error(CanReassemblyError),
}

/// Reassembles in-order CAN frames from a single source into transfers.
pub struct Receiver {
    source_node_id: Option<NodeId>,
    extent_bytes: usize,
    seen_any: bool,
    timestamp: Timestamp,
    transfer_id: u8,
    toggle: bool,
    payload: Vec<u8>,
    /// Cumulative length of every byte fed to `crc` so far, including bytes that were not
    /// retained in `payload` because the extent-bound cap was reached.
    fed_len: usize,
    crc: TransferCrc,
}

impl Receiver {
    pub fn new(source_node_id: Option<NodeId>, extent_bytes: usize) -> Self {
        Receiver {
            source_node_id,
            extent_bytes,
            seen_any: false,
            timestamp: Timestamp::ZERO,
            transfer_id: 0,
            toggle: true,
            payload: Vec::new(),
            fed_len: 0,
            crc: TransferCrc::new(),
        }
    }

    /// Feeds one frame (the tail byte plus the payload that precedes it, with any DLC padding
    /// still included) to the state machine.
    pub fn accept(
        &mut self,
        timestamp: Timestamp,
        priority: Priority,
        tail: TailByte,
        frame_payload: &[u8],
        transfer_id_timeout_ns: u64,
    ) -> CanOutcome {
        let timed_out = !self.seen_any
            || timestamp
                .monotonic_ns
                .saturating_sub(self.timestamp.monotonic_ns)
                > transfer_id_timeout_ns;
        // A SOT is only a genuine new transfer if it is actually ahead of the one currently being
        // tracked. Forward distance wraps modulo 32, so a replay of the just-completed transfer ID
        // (one behind `self.transfer_id`, e.g. distance 31) must not be mistaken for a transfer 31
        // frames ahead; only distances within the forward half of the modulo count as "ahead".
        let distance = forward_distance(self.transfer_id, tail.transfer_id);
        let not_previous_tid = distance > 1 && distance <= 16;

        if timed_out || (tail.start && not_previous_tid) {
            self.transfer_id = tail.transfer_id;
            self.toggle = tail.toggle;
            self.seen_any = true;
            if !tail.start {
                return CanOutcome::Error(CanReassemblyError::MissedStartOfTransfer);
            }
        }

        if tail.transfer_id != self.transfer_id {
            return CanOutcome::Error(CanReassemblyError::UnexpectedTransferId);
        }
        if tail.toggle != self.toggle {
            return CanOutcome::Error(CanReassemblyError::UnexpectedToggleBit);
        }

        if tail.start {
            self.payload.clear();
            self.fed_len = 0;
            self.crc = TransferCrc::new();
            self.timestamp = timestamp;
        }
        self.toggle = !self.toggle;

        self.crc.add_bytes(frame_payload);
        self.fed_len += frame_payload.len();
        let cap = self.extent_bytes + TRANSFER_CRC_LEN;
        let room = cap.saturating_sub(self.payload.len());
        let take = room.min(frame_payload.len());
        self.payload.extend_from_slice(&frame_payload[..take]);

        if !tail.end {
            return CanOutcome::Pending;
        }

        let transfer_id = TransferId::from(tail.transfer_id);
        let single_frame = tail.start;
        let timestamp = self.timestamp;
        let mut payload = core::mem::take(&mut self.payload);
        let fed_len = self.fed_len;
        let crc_ok = self.crc.get() == 0;
        self.prepare_for_next();

        if !single_frame {
            if !crc_ok {
                return CanOutcome::Error(CanReassemblyError::TransferCrcMismatch);
            }
            if fed_len <= self.extent_bytes + TRANSFER_CRC_LEN {
                let keep = payload.len().saturating_sub(TRANSFER_CRC_LEN);
                payload.truncate(keep);
            } else {
                // CRC bytes were never retained; the capped buffer is already all real payload.
                payload.truncate(self.extent_bytes.min(payload.len()));
            }
        }

        CanOutcome::Transfer(TransferFrom {
            transfer: Transfer {
                timestamp,
                priority,
                transfer_id,
                payload,
            },
            source: self.source_node_id,
        })
    }

    fn prepare_for_next(&mut self) {
        self.transfer_id = self.transfer_id.wrapping_add(1) & 0x1f;
        self.toggle = true;
        self.fed_len = 0;
    }
}
