//! Capture-driven transfer reconstruction.
//!
//! A tracer is a pure computing entity: it holds no link, performs no I/O, and consumes already
//! captured frames (either raw CAN frames or decoded serial frames) one at a time, emitting a
//! [`Trace`] whenever a transfer completes or a reassembly error is detected. Unlike a live
//! session, a tracer does not know the `extent_bytes` the original receiver was configured with,
//! so it reconstructs the full payload rather than truncating it.

use std::collections::HashMap;
use std::time::Duration;

use cyphal_core::id::NodeId;
use cyphal_core::specifier::{DataSpecifier, SessionSpecifier};
use cyphal_core::time::Timestamp;
use cyphal_core::transfer::{AlienTransfer, Transfer};

use cyphal_can::frame::TailByte;
use cyphal_can::id::{parse_can_id, CanHeaderKind, CanId};
use cyphal_can::rx::{CanOutcome, Receiver as CanRx};

use cyphal_serial::frame::Header as SerialHeader;
use cyphal_transfer::reassembler::{Frame as ReassemblerFrame, Outcome, TransferReassembler};

/// Retained payload size used by every tracer-owned reassembler. A tracer does not know the
/// `extent_bytes` the original subscriber was configured with, so it uses a generous bound
/// instead of truncating diagnostic reconstructions.
const TRACER_EXTENT_BYTES: usize = 1 << 20;

/// Smoothing constant's reciprocal for the inter-arrival EMA: `ema += (sample
/// - ema) / 8`.
const EMA_DIVISOR: f64 = 8.0;

/// Upper clamp for the auto-deduced transfer-ID timeout, in nanoseconds.
const MAX_TIMEOUT_NS: f64 = 1_000_000_000.0;

/// Tracks the exponential moving average of inter-arrival times for one (source, data specifier)
/// key and derives the transfer-ID timeout from it.
#[derive(Debug, Default)]
struct ArrivalTracker {
    last_monotonic_ns: Option<u64>,
    ema_ns: Option<f64>,
}

impl ArrivalTracker {
    /// Records one arrival and returns the timeout, in nanoseconds, to use for the frame just
    /// observed. The very first arrival for a key has no prior sample, so it reports a timeout of
    /// zero (the reassembler behind it will simply treat every first frame as starting fresh).
    fn observe(&mut self, monotonic_ns: u64) -> u64 {
        let timeout_ns = match self.last_monotonic_ns {
            Some(last) => {
                let sample = monotonic_ns.saturating_sub(last) as f64;
                let ema = match self.ema_ns {
                    Some(prev) => prev + (sample - prev) / EMA_DIVISOR,
                    None => sample,
                };
                self.ema_ns = Some(ema);
                (2.0 * ema).clamp(0.0, MAX_TIMEOUT_NS)
            }
            None => 0.0,
        };
        self.last_monotonic_ns = Some(monotonic_ns);
        timeout_ns as u64
    }
}

/// A high-level event reconstructed by a tracer from a stream of captures.
#[derive(Debug, Clone)]
pub enum Trace {
    /// A transfer was fully reconstructed. Carries the transfer-ID timeout that was in effect
    /// (auto-deduced from the observed traffic) when it completed.
    Transfer(AlienTransfer<Vec<u8>>, Duration),
    /// A captured frame (or an implied prior frame) violated the reassembly protocol.
    Error,
}

fn session_key(source: Option<NodeId>, data_specifier: DataSpecifier) -> (Option<NodeId>, SessionSpecifier) {
    // `SessionSpecifier` bundles the two fields we key sessions on and is already `Hash + Eq`;
    // `remote_node` is unused here and left `None`.
    (source, SessionSpecifier::new(data_specifier, None))
}

/// Reconstructs transfers from raw CAN frame captures.
#[derive(Default)]
pub struct CanTracer {
    sessions: HashMap<(Option<NodeId>, SessionSpecifier), (CanRx, ArrivalTracker)>,
}

impl CanTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one captured CAN frame (its 29-bit identifier and data field, tail byte included) to
    /// the tracer.
    pub fn update(&mut self, timestamp: Timestamp, id: CanId, data: &[u8]) -> Option<Trace> {
        let header = parse_can_id(id).ok()?;
        if data.is_empty() {
            return None;
        }
        let (payload, tail_byte) = data.split_at(data.len() - 1);
        let tail = TailByte::parse(tail_byte[0]);
        let source = if header.is_anonymous() { None } else { Some(header.source) };
        let data_specifier = match header.kind {
            CanHeaderKind::Message(message) => DataSpecifier::Message { subject: message.subject },
            CanHeaderKind::Service(service) => DataSpecifier::Service {
                service: service.service,
                role: service.role,
            },
        };
        let destination = header.destination();

        let key = session_key(source, data_specifier);
        let (receiver, arrivals) = self
            .sessions
            .entry(key)
            .or_insert_with(|| (CanRx::new(source, TRACER_EXTENT_BYTES), ArrivalTracker::default()));
        let timeout_ns = arrivals.observe(timestamp.monotonic_ns);

        match receiver.accept(timestamp, header.priority, tail, payload, timeout_ns) {
            CanOutcome::Transfer(transfer) => Some(Trace::Transfer(
                AlienTransfer {
                    transfer: transfer.transfer,
                    source: transfer.source,
                    destination,
                    data_specifier,
                },
                Duration::from_nanos(timeout_ns),
            )),
            CanOutcome::Error(_) => Some(Trace::Error),
            CanOutcome::Pending => None,
        }
    }
}

/// Reconstructs transfers from decoded serial frame captures (header plus payload, already
/// stripped of COBS encoding and its per-frame CRC-32C).
#[derive(Default)]
pub struct SerialTracer {
    sessions: HashMap<(Option<NodeId>, SessionSpecifier), (TransferReassembler, ArrivalTracker)>,
}

impl SerialTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, timestamp: Timestamp, header: &SerialHeader, payload: &[u8]) -> Option<Trace> {
        let source = header.source_node_id;
        let key = session_key(source, header.data_specifier);
        let (reassembler, arrivals) = self
            .sessions
            .entry(key)
            .or_insert_with(|| (TransferReassembler::new(source, TRACER_EXTENT_BYTES), ArrivalTracker::default()));
        let timeout_ns = arrivals.observe(timestamp.monotonic_ns);

        let frame = ReassemblerFrame {
            priority: header.priority,
            transfer_id: header.transfer_id,
            index: header.frame_index,
            end_of_transfer: header.end_of_transfer,
            payload,
        };
        match reassembler.accept(timestamp, frame, timeout_ns) {
            Outcome::Transfer(transfer) => {
                let joined: Vec<u8> = transfer.transfer.payload.into_iter().flatten().collect();
                Some(Trace::Transfer(
                    AlienTransfer {
                        transfer: Transfer {
                            timestamp: transfer.transfer.timestamp,
                            priority: transfer.transfer.priority,
                            transfer_id: transfer.transfer.transfer_id,
                            payload: joined,
                        },
                        source: transfer.source,
                        destination: header.destination_node_id,
                        data_specifier: header.data_specifier,
                    },
                    Duration::from_nanos(timeout_ns),
                ))
            }
            Outcome::Error(_) => Some(Trace::Error),
            Outcome::Pending => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;
    use cyphal_can::id::{make_can_id, MessageHeader};
    use cyphal_core::id::SubjectId;
    use cyphal_core::priority::Priority;

    fn ts(monotonic_ns: u64) -> Timestamp {
        Timestamp::new(monotonic_ns, monotonic_ns)
    }

    #[test]
    fn arrival_tracker_seeds_from_first_gap_then_smooths() {
        let mut tracker = ArrivalTracker::default();
        assert_eq!(tracker.observe(0), 0);
        // First real gap of 100ms seeds the EMA directly; reported timeout is 2x that.
        assert_eq!(tracker.observe(100_000_000), 200_000_000);
        // A much larger second gap only nudges the EMA by 1/8th of the difference.
        let timeout = tracker.observe(100_000_000 + 900_000_000);
        assert!(timeout > 200_000_000 && timeout < 2 * 900_000_000);
    }

    #[test]
    fn arrival_tracker_clamps_to_one_second() {
        let mut tracker = ArrivalTracker::default();
        tracker.observe(0);
        let timeout = tracker.observe(10_000_000_000);
        assert_eq!(timeout, 1_000_000_000);
    }

    #[test]
    fn can_tracer_reconstructs_single_frame_transfer() {
        let mut tracer = CanTracer::new();
        let source = NodeId::try_from(5).unwrap();
        let kind = CanHeaderKind::Message(MessageHeader {
            anonymous: false,
            subject: SubjectId::try_from(10).unwrap(),
        });
        let id = make_can_id(Priority::Nominal, source, &kind);
        let trace = tracer.update(ts(0), id, b"hi\xE0");
        match trace {
            Some(Trace::Transfer(transfer, _timeout)) => {
                assert_eq!(transfer.transfer.payload, b"hi".to_vec());
                assert_eq!(transfer.source, Some(source));
            }
            _ => panic!("expected a reconstructed transfer"),
        }
    }

    #[test]
    fn serial_tracer_reconstructs_single_frame_transfer() {
        let mut tracer = SerialTracer::new();
        let header = SerialHeader {
            priority: Priority::Nominal,
            source_node_id: Some(NodeId::try_from(9).unwrap()),
            destination_node_id: None,
            data_specifier: DataSpecifier::Message {
                subject: SubjectId::try_from(1).unwrap(),
            },
            transfer_id: 0,
            frame_index: 0,
            end_of_transfer: true,
        };
        let trace = tracer.update(ts(0), &header, b"payload");
        match trace {
            Some(Trace::Transfer(transfer, _timeout)) => {
                assert_eq!(transfer.transfer.payload, b"payload".to_vec());
            }
            _ => panic!("expected a reconstructed transfer"),
        }
    }
}
