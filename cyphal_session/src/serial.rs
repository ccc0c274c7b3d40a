//! Serial-backed output/input sessions.
//!
//! The actual byte-stream I/O is abstracted behind [`SerialLink`]; a concrete UART or pty driver
//! is an out-of-scope collaborator that implements it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cyphal_core::error::{
    InvalidTransportConfiguration, OperationNotDefinedForAnonymousNode, ResourceClosed,
    UnsupportedSessionConfiguration,
};
use cyphal_core::id::NodeId;
use cyphal_core::specifier::{DataSpecifier, SessionSpecifier};
use cyphal_core::time::Timestamp;
use cyphal_core::transfer::{AlienTransfer, Fragments, Transfer, TransferFrom};
use cyphal_crc::Crc32c;

use cyphal_serial::frame::{decode_frame, encode_frame, Header};
use cyphal_serial::stream_parser::{ParserEvent, StreamParser};
use cyphal_transfer::reassembler::{Frame as ReassemblerFrame, Outcome, TransferReassembler};
use cyphal_transfer::refragment::refragment;

use crate::common::{validate_spoof_preconditions, Capture, CaptureHandler, SendError, SpoofError};
use crate::feedback::FeedbackHandler;
use crate::statistics::{Statistics, StatisticsSnapshot};

const FRAME_DELIMITER: u8 = 0x00;

/// Wraps a COBS-encoded region with its leading and trailing `0x00` delimiters, the exact bytes
/// that cross the wire.
fn delimited(cobs_bytes: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(cobs_bytes.len() + 2);
    wire.push(FRAME_DELIMITER);
    wire.extend_from_slice(cobs_bytes);
    wire.push(FRAME_DELIMITER);
    wire
}

fn run_capture_handlers(handlers: &Mutex<Vec<CaptureHandler>>, capture: &Capture) {
    let mut handlers = handlers.lock().unwrap();
    for handler in handlers.iter_mut() {
        handler(capture);
    }
}

/// The byte pipe a [`SerialOutputSession`]/[`SerialInputSession`] is built on. A real
/// implementation talks to a UART, a pty, or a TCP socket standing in for one.
pub trait SerialLink: Send + 'static {
    fn write(&mut self, bytes: &[u8]) -> Result<(), cyphal_core::error::BackendError>;
    /// Blocks until one byte arrives or `deadline` passes, whichever is first.
    fn read_byte(&mut self, deadline: Instant) -> Result<Option<u8>, cyphal_core::error::BackendError>;
}

/// Number of times a service transfer is duplicated on the wire. Message
/// transfers are sent once.
pub const SERVICE_TRANSFER_MULTIPLIER: u32 = 2;

/// An output session bound to one subject or one service, backed by a COBS-framed byte stream.
pub struct SerialOutputSession<L: SerialLink> {
    link: L,
    source: Option<NodeId>,
    specifier: SessionSpecifier,
    /// Maximum payload bytes per frame, before COBS/header overhead.
    mtu: usize,
    stats: Statistics,
    feedback: Option<FeedbackHandler>,
    capture: Vec<CaptureHandler>,
    closed: bool,
    epoch: Instant,
}

impl<L: SerialLink> SerialOutputSession<L> {
    pub fn new(
        link: L,
        mtu: usize,
        source: Option<NodeId>,
        specifier: SessionSpecifier,
    ) -> Result<Self, UnsupportedSessionConfiguration> {
        if !specifier.valid_for_output() {
            return Err(UnsupportedSessionConfiguration);
        }
        Ok(SerialOutputSession {
            link,
            source,
            specifier,
            mtu,
            stats: Statistics::new(),
            feedback: None,
            capture: Vec::new(),
            closed: false,
            epoch: Instant::now(),
        })
    }

    pub fn enable_feedback(&mut self, handler: FeedbackHandler) {
        self.feedback = Some(handler);
    }

    pub fn disable_feedback(&mut self) {
        self.feedback = None;
    }

    /// Registers a capture handler invoked once per frame this session actually transmits
    ///. Capture is cumulative: handlers already registered keep firing.
    pub fn begin_capture(&mut self, handler: CaptureHandler) {
        self.capture.push(handler);
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    pub fn send(
        &mut self,
        transfer: &Transfer<Fragments<'_>>,
        _monotonic_deadline: Instant,
    ) -> Result<bool, SendError> {
        if self.closed {
            return Err(SendError::Closed(ResourceClosed));
        }
        let payload_len = transfer.payload.total_len();
        if self.source.is_none() && payload_len > self.mtu {
            return Err(SendError::AnonymousMultiFrame(OperationNotDefinedForAnonymousNode));
        }

        let payload: Vec<u8> = transfer.payload.bytes().collect();
        let frames = self.build_frames(transfer, &payload);
        let repeats = if self.specifier.data_specifier.is_service() {
            SERVICE_TRANSFER_MULTIPLIER
        } else {
            1
        };

        let mut frame_count = 0u64;
        let mut first_tx_timestamp = None;
        for _ in 0..repeats {
            for cobs_bytes in &frames {
                frame_count += 1;
                match self.write_frame(cobs_bytes) {
                    Ok(()) => {
                        let tx_timestamp = Timestamp::now(&self.epoch);
                        if first_tx_timestamp.is_none() {
                            first_tx_timestamp = Some(tx_timestamp);
                        }
                        for handler in self.capture.iter_mut() {
                            handler(&Capture {
                                timestamp: tx_timestamp,
                                raw: delimited(cobs_bytes),
                                own: true,
                            });
                        }
                    }
                    Err(_) => {
                        self.stats.record_error();
                        return Ok(false);
                    }
                }
            }
        }

        self.stats.record_transfer(frame_count, payload_len as u64);
        if let (Some(handler), Some(tx_timestamp)) = (self.feedback.as_mut(), first_tx_timestamp) {
            handler(transfer.timestamp, tx_timestamp);
        }
        Ok(true)
    }

    fn build_frames(&self, transfer: &Transfer<Fragments<'_>>, payload: &[u8]) -> Vec<Vec<u8>> {
        let header_base = Header {
            priority: transfer.priority,
            source_node_id: self.source,
            destination_node_id: self.specifier.remote_node,
            data_specifier: self.specifier.data_specifier,
            transfer_id: transfer.transfer_id,
            frame_index: 0,
            end_of_transfer: false,
        };

        if payload.len() <= self.mtu {
            let mut header = header_base;
            header.end_of_transfer = true;
            return vec![encode_frame(&header, payload)];
        }

        let mut with_crc = payload.to_vec();
        with_crc.extend_from_slice(&Crc32c::of([payload]).value_as_bytes());
        let chunks = refragment(core::iter::once(with_crc.as_slice()), self.mtu);
        let last = chunks.len().saturating_sub(1);
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let mut header = header_base;
                header.frame_index = index as u32;
                header.end_of_transfer = index == last;
                encode_frame(&header, &chunk)
            })
            .collect()
    }

    fn write_frame(&mut self, cobs_bytes: &[u8]) -> Result<(), cyphal_core::error::BackendError> {
        self.link.write(&delimited(cobs_bytes))
    }
}

impl<L: SerialLink> crate::common::OutputSession for SerialOutputSession<L> {
    fn send(
        &mut self,
        transfer: &Transfer<Fragments<'_>>,
        monotonic_deadline: Instant,
    ) -> Result<bool, SendError> {
        SerialOutputSession::send(self, transfer, monotonic_deadline)
    }

    fn close(&mut self) {
        SerialOutputSession::close(self)
    }

    fn statistics(&self) -> StatisticsSnapshot {
        SerialOutputSession::statistics(self)
    }

    fn begin_capture(&mut self, handler: CaptureHandler) {
        SerialOutputSession::begin_capture(self, handler)
    }
}

/// Emits an arbitrary `AlienTransfer` directly onto the serial link, bypassing any session's
/// bookkeeping. Rejects the preconditions validated by
/// [`validate_spoof_preconditions`] before ever touching the wire.
pub fn spoof<L: SerialLink>(
    link: &mut L,
    mtu: usize,
    transfer: &AlienTransfer<Vec<u8>>,
    capture: &mut [CaptureHandler],
) -> Result<bool, SpoofError> {
    validate_spoof_preconditions(transfer, || transfer.transfer.payload.len(), mtu)?;

    let header_base = Header {
        priority: transfer.transfer.priority,
        source_node_id: transfer.source,
        destination_node_id: transfer.destination,
        data_specifier: transfer.data_specifier,
        transfer_id: transfer.transfer.transfer_id,
        frame_index: 0,
        end_of_transfer: false,
    };

    let payload = &transfer.transfer.payload;
    let cobs_frames: Vec<Vec<u8>> = if payload.len() <= mtu {
        let mut header = header_base;
        header.end_of_transfer = true;
        vec![encode_frame(&header, payload)]
    } else {
        let mut with_crc = payload.clone();
        with_crc.extend_from_slice(&Crc32c::of([payload.as_slice()]).value_as_bytes());
        let chunks = refragment(core::iter::once(with_crc.as_slice()), mtu);
        let last = chunks.len().saturating_sub(1);
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let mut header = header_base;
                header.frame_index = index as u32;
                header.end_of_transfer = index == last;
                encode_frame(&header, &chunk)
            })
            .collect()
    };

    for cobs_bytes in &cobs_frames {
        if link.write(&delimited(cobs_bytes)).is_err() {
            return Ok(false);
        }
        for handler in capture.iter_mut() {
            handler(&Capture {
                timestamp: transfer.transfer.timestamp,
                raw: delimited(cobs_bytes),
                own: true,
            });
        }
    }
    Ok(true)
}

fn matches_header(header: &Header, specifier: &SessionSpecifier, local_node: Option<NodeId>) -> bool {
    if header.data_specifier != specifier.data_specifier {
        return false;
    }
    match specifier.data_specifier {
        DataSpecifier::Service { .. } => {
            header.destination_node_id == local_node
                && specifier
                    .remote_node
                    .map_or(true, |remote| header.source_node_id == Some(remote))
        }
        DataSpecifier::Message { .. } => specifier
            .remote_node
            .map_or(true, |remote| header.source_node_id == Some(remote)),
    }
}

fn run_serial_reader<L: SerialLink>(
    mut link: L,
    specifier: SessionSpecifier,
    local_node: Option<NodeId>,
    extent_bytes: usize,
    max_frame_size: usize,
    stats: Arc<Statistics>,
    timeout_ns: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    capture: Arc<Mutex<Vec<CaptureHandler>>>,
    sender: mpsc::Sender<TransferFrom<Vec<u8>>>,
) {
    const POLL_INTERVAL: Duration = Duration::from_millis(200);
    let epoch = Instant::now();
    let mut parser = StreamParser::new(max_frame_size);
    let mut sessions: HashMap<Option<NodeId>, TransferReassembler> = HashMap::new();

    while !closed.load(Ordering::Relaxed) {
        let deadline = Instant::now() + POLL_INTERVAL;
        let byte = match link.read_byte(deadline) {
            Ok(Some(byte)) => byte,
            Ok(None) => continue,
            Err(_) => {
                stats.record_error();
                continue;
            }
        };

        let event = match parser.push_byte(Timestamp::now(&epoch), byte) {
            Some(event) => event,
            None => continue,
        };
        let (timestamp, bytes) = match event {
            ParserEvent::OutOfBand { .. } => {
                stats.record_drop();
                continue;
            }
            ParserEvent::Frame { timestamp, bytes } => (timestamp, bytes),
        };
        run_capture_handlers(
            &capture,
            &Capture {
                timestamp,
                raw: delimited(&bytes),
                own: false,
            },
        );

        let (header, payload) = match decode_frame(&bytes) {
            Ok(decoded) => decoded,
            Err(_) => {
                stats.record_error();
                continue;
            }
        };
        if !matches_header(&header, &specifier, local_node) {
            continue;
        }

        let key = specifier.remote_node.or(header.source_node_id);
        let entry = sessions
            .entry(key)
            .or_insert_with(|| TransferReassembler::new(header.source_node_id, extent_bytes));
        let frame = ReassemblerFrame {
            priority: header.priority,
            transfer_id: header.transfer_id,
            index: header.frame_index,
            end_of_transfer: header.end_of_transfer,
            payload: &payload,
        };
        let timeout = timeout_ns.load(Ordering::Relaxed);
        match entry.accept(timestamp, frame, timeout) {
            Outcome::Transfer(transfer) => {
                let joined: Vec<u8> = transfer.transfer.payload.into_iter().flatten().collect();
                stats.record_transfer(1, joined.len() as u64);
                let flat = TransferFrom {
                    transfer: Transfer {
                        timestamp: transfer.transfer.timestamp,
                        priority: transfer.transfer.priority,
                        transfer_id: transfer.transfer.transfer_id,
                        payload: joined,
                    },
                    source: transfer.source,
                };
                if sender.send(flat).is_err() {
                    break;
                }
            }
            Outcome::Error(_) => stats.record_error(),
            Outcome::Pending => {}
        }
    }
}

/// Default maximum frame size accepted by the stream parser before a frame is treated as noise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4096;

/// Default per-source transfer-ID timeout.
pub const DEFAULT_TRANSFER_ID_TIMEOUT: Duration = Duration::from_secs(2);

/// An input session receiving every transfer matching one subject or one service.
pub struct SerialInputSession {
    inbox: mpsc::Receiver<TransferFrom<Vec<u8>>>,
    stats: Arc<Statistics>,
    transfer_id_timeout_ns: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    capture: Arc<Mutex<Vec<CaptureHandler>>>,
    reader: Option<thread::JoinHandle<()>>,
}

impl SerialInputSession {
    pub fn new<L: SerialLink>(
        link: L,
        local_node: Option<NodeId>,
        specifier: SessionSpecifier,
        extent_bytes: usize,
    ) -> Result<Self, UnsupportedSessionConfiguration> {
        if !specifier.valid_for_input() {
            return Err(UnsupportedSessionConfiguration);
        }
        let (sender, inbox) = mpsc::channel();
        let stats = Arc::new(Statistics::new());
        let timeout_ns = Arc::new(AtomicU64::new(DEFAULT_TRANSFER_ID_TIMEOUT.as_nanos() as u64));
        let closed = Arc::new(AtomicBool::new(false));
        let capture = Arc::new(Mutex::new(Vec::new()));

        let reader = thread::spawn({
            let stats = stats.clone();
            let timeout_ns = timeout_ns.clone();
            let closed = closed.clone();
            let capture = capture.clone();
            move || {
                run_serial_reader(
                    link,
                    specifier,
                    local_node,
                    extent_bytes,
                    DEFAULT_MAX_FRAME_SIZE,
                    stats,
                    timeout_ns,
                    closed,
                    capture,
                    sender,
                )
            }
        });

        Ok(SerialInputSession {
            inbox,
            stats,
            transfer_id_timeout_ns: timeout_ns,
            closed,
            capture,
            reader: Some(reader),
        })
    }

    /// Registers a capture handler invoked once per frame this session's reader thread observes,
    /// whether or not it matches the session's specifier. May fire from the
    /// reader thread; handlers must synchronize their own state.
    pub fn begin_capture(&mut self, handler: CaptureHandler) {
        self.capture.lock().unwrap().push(handler);
    }

    pub fn receive(&mut self, monotonic_deadline: Instant) -> Result<Option<TransferFrom<Vec<u8>>>, ResourceClosed> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ResourceClosed);
        }
        let timeout = monotonic_deadline.saturating_duration_since(Instant::now());
        match self.inbox.recv_timeout(timeout) {
            Ok(transfer) => Ok(Some(transfer)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ResourceClosed),
        }
    }

    pub fn transfer_id_timeout(&self) -> Duration {
        Duration::from_nanos(self.transfer_id_timeout_ns.load(Ordering::Relaxed))
    }

    pub fn set_transfer_id_timeout(&mut self, timeout: Duration) -> Result<(), InvalidTransportConfiguration> {
        if timeout.is_zero() {
            return Err(InvalidTransportConfiguration("transfer-ID timeout must be positive"));
        }
        self.transfer_id_timeout_ns
            .store(timeout.as_nanos() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for SerialInputSession {
    fn drop(&mut self) {
        self.close();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl crate::common::InputSession for SerialInputSession {
    fn receive(&mut self, monotonic_deadline: Instant) -> Result<Option<TransferFrom<Vec<u8>>>, ResourceClosed> {
        SerialInputSession::receive(self, monotonic_deadline)
    }

    fn transfer_id_timeout(&self) -> Duration {
        SerialInputSession::transfer_id_timeout(self)
    }

    fn set_transfer_id_timeout(&mut self, timeout: Duration) -> Result<(), InvalidTransportConfiguration> {
        SerialInputSession::set_transfer_id_timeout(self, timeout)
    }

    fn close(&mut self) {
        SerialInputSession::close(self)
    }

    fn statistics(&self) -> StatisticsSnapshot {
        SerialInputSession::statistics(self)
    }

    fn begin_capture(&mut self, handler: CaptureHandler) {
        SerialInputSession::begin_capture(self, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;
    use cyphal_core::id::SubjectId;
    use std::sync::Mutex;

    struct LoopbackLink {
        outgoing: Arc<Mutex<Vec<u8>>>,
        incoming: Arc<Mutex<std::collections::VecDeque<u8>>>,
    }

    impl SerialLink for LoopbackLink {
        fn write(&mut self, bytes: &[u8]) -> Result<(), cyphal_core::error::BackendError> {
            self.outgoing.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        fn read_byte(&mut self, deadline: Instant) -> Result<Option<u8>, cyphal_core::error::BackendError> {
            loop {
                if let Some(byte) = self.incoming.lock().unwrap().pop_front() {
                    return Ok(Some(byte));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn single_frame_send_writes_one_delimited_frame() {
        let outgoing = Arc::new(Mutex::new(Vec::new()));
        let link = LoopbackLink {
            outgoing: outgoing.clone(),
            incoming: Arc::new(Mutex::new(std::collections::VecDeque::new())),
        };
        let specifier = SessionSpecifier::new(
            DataSpecifier::Message {
                subject: SubjectId::try_from(42).unwrap(),
            },
            None,
        );
        let mut session = SerialOutputSession::new(link, 256, Some(NodeId::try_from(1).unwrap()), specifier).unwrap();
        let payload: &[u8] = b"hello";
        let fragments = Fragments::new(&[payload]);
        let transfer = Transfer {
            timestamp: Timestamp::ZERO,
            priority: cyphal_core::priority::Priority::Nominal,
            transfer_id: 0,
            payload: fragments,
        };
        assert!(session
            .send(&transfer, Instant::now() + Duration::from_secs(1))
            .unwrap());
        let wire = outgoing.lock().unwrap();
        assert_eq!(wire[0], FRAME_DELIMITER);
        assert_eq!(*wire.last().unwrap(), FRAME_DELIMITER);
        assert_eq!(session.statistics().transfers, 1);
    }

    #[test]
    fn service_transfer_is_duplicated() {
        let outgoing = Arc::new(Mutex::new(Vec::new()));
        let link = LoopbackLink {
            outgoing: outgoing.clone(),
            incoming: Arc::new(Mutex::new(std::collections::VecDeque::new())),
        };
        let specifier = SessionSpecifier::new(
            DataSpecifier::Service {
                service: cyphal_core::id::ServiceId::try_from(1).unwrap(),
                role: cyphal_core::specifier::ServiceRole::Request,
            },
            Some(NodeId::try_from(9).unwrap()),
        );
        let mut session = SerialOutputSession::new(link, 256, Some(NodeId::try_from(1).unwrap()), specifier).unwrap();
        let payload: &[u8] = b"x";
        let fragments = Fragments::new(&[payload]);
        let transfer = Transfer {
            timestamp: Timestamp::ZERO,
            priority: cyphal_core::priority::Priority::Nominal,
            transfer_id: 0,
            payload: fragments,
        };
        session.send(&transfer, Instant::now() + Duration::from_secs(1)).unwrap();
        assert_eq!(session.statistics().frames, u64::from(SERVICE_TRANSFER_MULTIPLIER));
    }

    #[test]
    fn anonymous_multi_frame_is_rejected() {
        let link = LoopbackLink {
            outgoing: Arc::new(Mutex::new(Vec::new())),
            incoming: Arc::new(Mutex::new(std::collections::VecDeque::new())),
        };
        let specifier = SessionSpecifier::new(
            DataSpecifier::Message {
                subject: SubjectId::try_from(1).unwrap(),
            },
            None,
        );
        let mut session = SerialOutputSession::new(link, 4, None, specifier).unwrap();
        let payload: Vec<u8> = (0..20u8).collect();
        let fragments = Fragments::new(&[&payload[..]]);
        let transfer = Transfer {
            timestamp: Timestamp::ZERO,
            priority: cyphal_core::priority::Priority::Nominal,
            transfer_id: 0,
            payload: fragments,
        };
        assert_eq!(
            session.send(&transfer, Instant::now() + Duration::from_secs(1)),
            Err(SendError::AnonymousMultiFrame(OperationNotDefinedForAnonymousNode))
        );
    }

    #[test]
    fn input_session_receives_single_frame_transfer() {
        let header = Header {
            priority: cyphal_core::priority::Priority::Nominal,
            source_node_id: Some(NodeId::try_from(7).unwrap()),
            destination_node_id: None,
            data_specifier: DataSpecifier::Message {
                subject: SubjectId::try_from(42).unwrap(),
            },
            transfer_id: 3,
            frame_index: 0,
            end_of_transfer: true,
        };
        let cobs_bytes = encode_frame(&header, b"hi");
        let mut wire = vec![FRAME_DELIMITER];
        wire.extend_from_slice(&cobs_bytes);
        wire.push(FRAME_DELIMITER);

        let incoming: std::collections::VecDeque<u8> = wire.into_iter().collect();
        let link = LoopbackLink {
            outgoing: Arc::new(Mutex::new(Vec::new())),
            incoming: Arc::new(Mutex::new(incoming)),
        };
        let specifier = SessionSpecifier::new(
            DataSpecifier::Message {
                subject: SubjectId::try_from(42).unwrap(),
            },
            None,
        );
        let mut session = SerialInputSession::new(link, Some(NodeId::try_from(1).unwrap()), specifier, 1000).unwrap();
        let transfer = session
            .receive(Instant::now() + Duration::from_millis(500))
            .unwrap();
        assert_eq!(transfer.unwrap().transfer.payload, b"hi".to_vec());
    }
}
