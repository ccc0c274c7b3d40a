//! Out-of-order multi-frame transfer reassembly for high-overhead transports (serial, UDP).
//!
//! One instance is owned per source node ID by the session that creates it lazily on first valid
//! frame from that source. Frame-level protocol violations are
//! reported as [`ReassemblyError`] values, never raised: the caller is expected to count them and
//! forward them to statistics/tracer consumers.

use cyphal_core::priority::Priority;
use cyphal_core::time::Timestamp;
use cyphal_core::transfer::{Transfer, TransferFrom, TransferId};
use cyphal_crc::Crc32c;

/// Number of trailing bytes occupied by the transfer CRC on a multi-frame transfer.
const CRC_SIZE_BYTES: usize = 4;

/// A single received frame, transport-agnostic.
pub struct Frame<'a> {
    pub priority: Priority,
    pub transfer_id: TransferId,
    pub index: u32,
    pub end_of_transfer: bool,
    pub payload: &'a [u8],
}

impl Frame<'_> {
    pub const fn is_single_frame(&self) -> bool {
        self.index == 0 && self.end_of_transfer
    }
}

/// A per-frame protocol violation. These are statistics, not raised errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReassemblyError {
    /// A new transfer started before the previous one could be completed.
    MultiframeMissingFrames,
    /// The reassembled payload failed the trailing CRC check.
    MultiframeIntegrityError,
    /// A frame with no payload was received as part of a multi-frame transfer.
    MultiframeEmptyFrame,
    /// The end-of-transfer flag was set on a frame with index N, but a frame with index > N was
    /// also observed for the same transfer.
    MultiframeEotMisplaced,
    /// The end-of-transfer flag was set on frames with two different indices.
    MultiframeEotInconsistent,
}

/// The outcome of feeding one frame to the reassembler.
pub enum Outcome {
    /// The frame was accepted but did not complete a transfer.
    Pending,
    /// The frame completed a transfer.
    Transfer(TransferFrom<Vec<Vec<u8>>>),
    /// The frame (or an implied prior frame) violated the reassembly protocol.
    Error(ReassemblyError),
}

/// Reassembles multi-frame transfers from a single source, accepting frames out of order.
pub struct TransferReassembler {
    source_node_id: Option<cyphal_core::NodeId>,
    extent_bytes: usize,
    payloads: Vec<Vec<u8>>,
    max_index: Option<u32>,
    timestamp: Timestamp,
    transfer_id: TransferId,
}

impl TransferReassembler {
    /// Creates a reassembler for the given source (`None` for an anonymous sender, though
    /// anonymous senders may only emit single-frame transfers and so never need real reassembly
    /// state) and maximum retained payload size.
    pub fn new(source_node_id: Option<cyphal_core::NodeId>, extent_bytes: usize) -> Self {
        TransferReassembler {
            source_node_id,
            extent_bytes,
            payloads: Vec::new(),
            max_index: None,
            timestamp: Timestamp::ZERO,
            transfer_id: 0,
        }
    }

    /// Feeds one frame to the state machine.
    ///
    /// `transfer_id_timeout_ns` is the current per-source TID timeout, compared against the
    /// monotonic component of the timestamps.
    pub fn accept(&mut self, timestamp: Timestamp, frame: Frame<'_>, transfer_id_timeout_ns: u64) -> Outcome {
        // 1. Drop malformed: multi-frame (not single-frame) with empty payload.
        if !frame.is_single_frame() && frame.payload.is_empty() {
            return Outcome::Error(ReassemblyError::MultiframeEmptyFrame);
        }

        // 2. Detect new transfer: newer TID, or TID timeout elapsed.
        let timed_out = timestamp
            .monotonic_ns
            .saturating_sub(self.timestamp.monotonic_ns)
            > transfer_id_timeout_ns;
        if frame.transfer_id > self.transfer_id || timed_out {
            let had_payload = !self.payloads.is_empty();
            self.restart(timestamp, frame.transfer_id);
            if had_payload {
                return Outcome::Error(ReassemblyError::MultiframeMissingFrames);
            }
        }

        // 3. Drop stale frames from an already-superseded transfer.
        if frame.transfer_id < self.transfer_id {
            return Outcome::Pending;
        }
        debug_assert_eq!(frame.transfer_id, self.transfer_id);

        // 4. Determine max index.
        if frame.end_of_transfer {
            match self.max_index {
                Some(existing) if existing != frame.index => {
                    self.restart(timestamp, frame.transfer_id + 1);
                    return Outcome::Error(ReassemblyError::MultiframeEotInconsistent);
                }
                _ => self.max_index = Some(frame.index),
            }
        }

        // 5. Detect frames past the declared end of transfer.
        if let Some(max_index) = self.max_index {
            let high_water = frame.index.max(self.payloads.len().saturating_sub(1) as u32);
            if high_water > max_index {
                self.restart(timestamp, frame.transfer_id + 1);
                return Outcome::Error(ReassemblyError::MultiframeEotMisplaced);
            }
        }

        // 6. Store the payload (duplicates overwrite with assumed-identical content).
        while self.payloads.len() <= frame.index as usize {
            self.payloads.push(Vec::new());
        }
        self.payloads[frame.index as usize] = frame.payload.to_vec();
        self.timestamp = self.timestamp.earliest(timestamp);

        // 7. Completeness test.
        let complete = match self.max_index {
            None => false,
            Some(0) => true,
            Some(max_index) => {
                debug_assert_eq!(max_index as usize, self.payloads.len() - 1);
                self.payloads.iter().all(|p| !p.is_empty())
            }
        };
        if !complete {
            return Outcome::Pending;
        }

        // 8. Finalize.
        let priority = frame.priority;
        let transfer_id = frame.transfer_id;
        let source_node_id = self.source_node_id;
        let transfer_timestamp = self.timestamp;
        let payloads = core::mem::take(&mut self.payloads);
        self.restart(timestamp, transfer_id + 1);

        match finalize(transfer_timestamp, priority, transfer_id, payloads) {
            Some(mut transfer) => {
                apply_implicit_truncation(&mut transfer.transfer.payload, self.extent_bytes);
                transfer.source = source_node_id;
                Outcome::Transfer(transfer)
            }
            None => Outcome::Error(ReassemblyError::MultiframeIntegrityError),
        }
    }

    fn restart(&mut self, timestamp: Timestamp, transfer_id: TransferId) {
        self.timestamp = timestamp;
        self.transfer_id = transfer_id;
        self.max_index = None;
        self.payloads.clear();
    }
}

fn finalize(
    timestamp: Timestamp,
    priority: Priority,
    transfer_id: TransferId,
    mut payloads: Vec<Vec<u8>>,
) -> Option<TransferFrom<Vec<Vec<u8>>>> {
    if payloads.len() > 1 {
        let total_len: usize = payloads.iter().map(|p| p.len()).sum();
        let crc_ok = Crc32c::of(payloads.iter().map(|p| p.as_slice())).check_residue();
        if total_len <= CRC_SIZE_BYTES || !crc_ok {
            return None;
        }
        drop_crc(&mut payloads, CRC_SIZE_BYTES);
    }
    Some(TransferFrom {
        transfer: Transfer {
            timestamp,
            priority,
            transfer_id,
            payload: payloads,
        },
        source: None,
    })
}

/// Strips the trailing `crc_size` bytes from a fragment list, which may span multiple fragments.
fn drop_crc(fragments: &mut Vec<Vec<u8>>, crc_size: usize) {
    let mut remaining = crc_size;
    while remaining > 0 {
        match fragments.last_mut() {
            Some(last) if last.len() <= remaining => {
                remaining -= last.len();
                fragments.pop();
            }
            Some(last) => {
                let new_len = last.len() - remaining;
                last.truncate(new_len);
                remaining = 0;
            }
            None => break,
        }
    }
}

/// Drops trailing fragments until the cumulative length of the remainder does not exceed
/// `extent_bytes`.
fn apply_implicit_truncation(fragments: &mut Vec<Vec<u8>>, extent_bytes: usize) {
    loop {
        let total: usize = fragments.iter().map(|f| f.len()).sum();
        if fragments.is_empty() || total <= extent_bytes {
            break;
        }
        fragments.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyphal_core::priority::Priority;
    use core::convert::TryFrom;

    const TIMEOUT_NS: u64 = 1_000_000_000;

    fn ts(monotonic_s: f64) -> Timestamp {
        let monotonic_ns = (monotonic_s * 1e9) as u64;
        Timestamp::new(monotonic_ns + 1_000_000_000_000, monotonic_ns)
    }

    fn frame(transfer_id: TransferId, index: u32, eot: bool, payload: &[u8]) -> Frame<'_> {
        Frame {
            priority: Priority::Slow,
            transfer_id,
            index,
            end_of_transfer: eot,
            payload,
        }
    }

    fn source() -> cyphal_core::NodeId {
        cyphal_core::NodeId::try_from(1).unwrap()
    }

    #[test]
    fn single_frame_transfer() {
        let mut r = TransferReassembler::new(Some(source()), 1000);
        match r.accept(ts(1.0), frame(0, 0, true, b"hedgehog"), TIMEOUT_NS) {
            Outcome::Transfer(t) => assert_eq!(t.transfer.payload, vec![b"hedgehog".to_vec()]),
            _ => panic!("expected a transfer"),
        }
    }

    #[test]
    fn duplicate_single_frame_is_ignored() {
        let mut r = TransferReassembler::new(Some(source()), 1000);
        assert!(matches!(
            r.accept(ts(1.0), frame(0, 0, true, b"x"), TIMEOUT_NS),
            Outcome::Transfer(_)
        ));
        assert!(matches!(
            r.accept(ts(1.0), frame(0, 0, true, b"x"), TIMEOUT_NS),
            Outcome::Pending
        ));
    }

    #[test]
    fn multi_frame_round_trip() {
        let payload = b"In the evenings, the little Hedgehog went to the Bear Cub.";
        let mut crc = Crc32c::new();
        crc.add(payload);
        let crc_bytes = crc.value_as_bytes();

        let mut r = TransferReassembler::new(Some(source()), 1000);
        assert!(matches!(
            r.accept(ts(1.0), frame(2, 0, false, &payload[..30]), TIMEOUT_NS),
            Outcome::Pending
        ));
        let mut tail = payload[30..].to_vec();
        tail.extend_from_slice(&crc_bytes);
        match r.accept(ts(1.0), frame(2, 1, true, &tail), TIMEOUT_NS) {
            Outcome::Transfer(t) => {
                let joined: Vec<u8> = t.transfer.payload.into_iter().flatten().collect();
                assert_eq!(joined, payload.to_vec());
            }
            _ => panic!("expected a completed transfer"),
        }
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let payload = b"0123456789";
        let mut r = TransferReassembler::new(Some(source()), 1000);
        assert!(matches!(
            r.accept(ts(1.0), frame(0, 0, false, &payload[..5]), TIMEOUT_NS),
            Outcome::Pending
        ));
        let mut tail = payload[5..].to_vec();
        tail.extend_from_slice(&[0, 0, 0, 0]); // wrong CRC
        assert!(matches!(
            r.accept(ts(1.0), frame(0, 1, true, &tail), TIMEOUT_NS),
            Outcome::Error(ReassemblyError::MultiframeIntegrityError)
        ));
    }

    #[test]
    fn missing_frames_reported_on_new_transfer() {
        let mut r = TransferReassembler::new(Some(source()), 1000);
        assert!(matches!(
            r.accept(ts(1.0), frame(0, 0, false, b"partial"), TIMEOUT_NS),
            Outcome::Pending
        ));
        assert!(matches!(
            r.accept(ts(1.1), frame(1, 0, true, b"next"), TIMEOUT_NS),
            Outcome::Error(ReassemblyError::MultiframeMissingFrames)
        ));
    }

    #[test]
    fn implicit_truncation_keeps_within_extent() {
        let fragment_size = 19;
        let payload: Vec<u8> = (0..57u8).collect();
        let mut crc = Crc32c::new();
        crc.add(&payload);
        let mut with_crc = payload.clone();
        with_crc.extend_from_slice(&crc.value_as_bytes());

        let mut r = TransferReassembler::new(Some(source()), 50);
        let chunks: Vec<&[u8]> = with_crc.chunks(fragment_size).collect();
        let last = chunks.len() - 1;
        let mut result = None;
        for (i, chunk) in chunks.iter().enumerate() {
            result = Some(r.accept(ts(1.0), frame(0, i as u32, i == last, chunk), TIMEOUT_NS));
        }
        match result.unwrap() {
            Outcome::Transfer(t) => {
                let total: usize = t.transfer.payload.iter().map(|f| f.len()).sum();
                assert!(total <= 50);
            }
            _ => panic!("expected a completed transfer"),
        }
    }
}
