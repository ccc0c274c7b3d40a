//! CAN-backed output/input sessions.
//!
//! The actual CAN bus I/O is abstracted behind [`CanLink`]; a concrete hardware or SocketCAN
//! driver is an out-of-scope collaborator that implements it.

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

use cyphal_can::frame::{CanFrame, Mtu, TailByte};
use cyphal_can::id::{parse_can_id, CanHeader, CanHeaderKind, MessageHeader, ServiceHeader};
use cyphal_can::rx::{CanOutcome, Receiver as CanRx};
use cyphal_can::tx::Transmitter;

use crate::common::{validate_spoof_preconditions, Capture, CaptureHandler, SendError, SpoofError};
use crate::feedback::FeedbackHandler;
use crate::statistics::{Statistics, StatisticsSnapshot};

/// Encodes a CAN frame's 29-bit identifier (little-endian) followed by its data field, the raw
/// byte form a capture handler receives.
fn capture_raw(frame: &CanFrame) -> Vec<u8> {
    let mut raw = Vec::with_capacity(4 + frame.data().len());
    raw.extend_from_slice(&u32::from(frame.id).to_le_bytes());
    raw.extend_from_slice(frame.data());
    raw
}

fn run_capture_handlers(handlers: &Mutex<Vec<CaptureHandler>>, capture: &Capture) {
    let mut handlers = handlers.lock().unwrap();
    for handler in handlers.iter_mut() {
        handler(capture);
    }
}

/// The CAN bus access a [`CanOutputSession`]/[`CanInputSession`] is built on. A real
/// implementation talks to hardware or a SocketCAN socket; this crate only defines the contract.
pub trait CanLink: Send + 'static {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), cyphal_core::error::BackendError>;
    /// Blocks until a frame arrives or `deadline` passes, whichever is first.
    fn receive(&mut self, deadline: Instant) -> Result<Option<CanFrame>, cyphal_core::error::BackendError>;
}

fn to_can_header_kind(specifier: &SessionSpecifier, anonymous: bool) -> CanHeaderKind {
    match specifier.data_specifier {
        DataSpecifier::Message { subject } => CanHeaderKind::Message(MessageHeader { anonymous, subject }),
        DataSpecifier::Service { service, role } => CanHeaderKind::Service(ServiceHeader {
            role,
            destination: specifier
                .remote_node
                .expect("SessionSpecifier::valid_for_output rejects broadcast services"),
            service,
        }),
    }
}

/// An output session bound to one subject (broadcast or unicast) or one service (always unicast).
pub struct CanOutputSession<L: CanLink> {
    link: L,
    transmitter: Transmitter,
    source: Option<NodeId>,
    specifier: SessionSpecifier,
    stats: Statistics,
    feedback: Option<FeedbackHandler>,
    capture: Vec<CaptureHandler>,
    closed: bool,
    epoch: Instant,
}

impl<L: CanLink> CanOutputSession<L> {
    pub fn new(
        link: L,
        mtu: Mtu,
        source: Option<NodeId>,
        specifier: SessionSpecifier,
    ) -> Result<Self, UnsupportedSessionConfiguration> {
        if !specifier.valid_for_output() {
            return Err(UnsupportedSessionConfiguration);
        }
        Ok(CanOutputSession {
            link,
            transmitter: Transmitter::new(mtu),
            source,
            specifier,
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

    /// Serializes and enqueues `transfer`. `monotonic_deadline` is only meaningful to a `CanLink`
    /// implementation that can genuinely back-pressure; this crate's session bookkeeping itself
    /// never blocks on it.
    pub fn send(
        &mut self,
        transfer: &Transfer<Fragments<'_>>,
        _monotonic_deadline: Instant,
    ) -> Result<bool, SendError> {
        if self.closed {
            return Err(SendError::Closed(ResourceClosed));
        }
        let payload_len = transfer.payload.total_len();
        if self.source.is_none() && payload_len > self.transmitter.single_frame_payload_cap() {
            return Err(SendError::AnonymousMultiFrame(OperationNotDefinedForAnonymousNode));
        }

        let kind = to_can_header_kind(&self.specifier, self.source.is_none());
        let payload: Vec<u8> = transfer.payload.bytes().collect();
        if self
            .transmitter
            .push(transfer.timestamp, transfer.priority, transfer.transfer_id, self.source, &kind, &payload)
            .is_err()
        {
            self.stats.record_error();
            return Ok(false);
        }

        let mut frame_count = 0u64;
        let mut first_tx_timestamp = None;
        while let Some(frame) = self.transmitter.pop_frame() {
            frame_count += 1;
            match self.link.transmit(&frame) {
                Ok(()) => {
                    let tx_timestamp = Timestamp::now(&self.epoch);
                    if first_tx_timestamp.is_none() {
                        first_tx_timestamp = Some(tx_timestamp);
                    }
                    for handler in self.capture.iter_mut() {
                        handler(&Capture {
                            timestamp: tx_timestamp,
                            raw: capture_raw(&frame),
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

        self.stats.record_transfer(frame_count, payload_len as u64);
        if let (Some(handler), Some(tx_timestamp)) = (self.feedback.as_mut(), first_tx_timestamp) {
            handler(transfer.timestamp, tx_timestamp);
        }
        Ok(true)
    }
}

impl<L: CanLink> crate::common::OutputSession for CanOutputSession<L> {
    fn send(
        &mut self,
        transfer: &Transfer<Fragments<'_>>,
        monotonic_deadline: Instant,
    ) -> Result<bool, SendError> {
        CanOutputSession::send(self, transfer, monotonic_deadline)
    }

    fn close(&mut self) {
        CanOutputSession::close(self)
    }

    fn statistics(&self) -> StatisticsSnapshot {
        CanOutputSession::statistics(self)
    }

    fn begin_capture(&mut self, handler: CaptureHandler) {
        CanOutputSession::begin_capture(self, handler)
    }
}

/// Emits an arbitrary `AlienTransfer` directly onto the CAN bus, bypassing any session's
/// bookkeeping. Rejects the preconditions validated by
/// [`validate_spoof_preconditions`] before ever touching the wire.
pub fn spoof<L: CanLink>(
    link: &mut L,
    mtu: Mtu,
    transfer: &AlienTransfer<Vec<u8>>,
    capture: &mut [CaptureHandler],
) -> Result<bool, SpoofError> {
    validate_spoof_preconditions(transfer, || transfer.transfer.payload.len(), mtu as usize - 1)?;

    let kind = match transfer.data_specifier {
        DataSpecifier::Message { subject } => CanHeaderKind::Message(MessageHeader {
            anonymous: transfer.source.is_none(),
            subject,
        }),
        DataSpecifier::Service { service, role } => CanHeaderKind::Service(ServiceHeader {
            role,
            destination: transfer.destination.expect("validated above"),
            service,
        }),
    };

    let mut transmitter = Transmitter::new(mtu);
    if transmitter
        .push(
            transfer.transfer.timestamp,
            transfer.transfer.priority,
            transfer.transfer.transfer_id,
            transfer.source,
            &kind,
            &transfer.transfer.payload,
        )
        .is_err()
    {
        return Ok(false);
    }

    while let Some(frame) = transmitter.pop_frame() {
        if link.transmit(&frame).is_err() {
            return Ok(false);
        }
        for handler in capture.iter_mut() {
            handler(&Capture {
                timestamp: frame.timestamp,
                raw: capture_raw(&frame),
                own: true,
            });
        }
    }
    Ok(true)
}

fn matches_specifier(header: &CanHeader, specifier: &SessionSpecifier, local_node: Option<NodeId>) -> bool {
    match (&header.kind, &specifier.data_specifier) {
        (CanHeaderKind::Message(m), DataSpecifier::Message { subject }) => {
            m.subject == *subject
                && specifier.remote_node.map_or(true, |remote| header.source == remote)
        }
        (CanHeaderKind::Service(s), DataSpecifier::Service { service, role }) => {
            s.service == *service
                && s.role == *role
                && header.destination() == local_node
                && specifier.remote_node.map_or(true, |remote| header.source == remote)
        }
        _ => false,
    }
}

fn run_can_reader<L: CanLink>(
    mut link: L,
    specifier: SessionSpecifier,
    local_node: Option<NodeId>,
    extent_bytes: usize,
    stats: Arc<Statistics>,
    timeout_ns: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    capture: Arc<Mutex<Vec<CaptureHandler>>>,
    sender: mpsc::Sender<TransferFrom<Vec<u8>>>,
) {
    const POLL_INTERVAL: Duration = Duration::from_millis(200);
    let mut sessions: HashMap<Option<NodeId>, CanRx> = HashMap::new();

    while !closed.load(Ordering::Relaxed) {
        let deadline = Instant::now() + POLL_INTERVAL;
        let frame = match link.receive(deadline) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(_) => {
                stats.record_error();
                continue;
            }
        };
        run_capture_handlers(
            &capture,
            &Capture {
                timestamp: frame.timestamp,
                raw: capture_raw(&frame),
                own: false,
            },
        );

        let header = match parse_can_id(frame.id) {
            Ok(header) => header,
            Err(_) => {
                stats.record_drop();
                continue;
            }
        };
        if !matches_specifier(&header, &specifier, local_node) {
            continue;
        }
        let data = frame.data();
        if data.is_empty() {
            stats.record_drop();
            continue;
        }
        let (payload, tail_byte) = data.split_at(data.len() - 1);
        let tail = TailByte::parse(tail_byte[0]);
        let source = if header.is_anonymous() { None } else { Some(header.source) };
        let key = specifier.remote_node.or(source);

        let entry = sessions
            .entry(key)
            .or_insert_with(|| CanRx::new(source, extent_bytes));
        let timeout = timeout_ns.load(Ordering::Relaxed);
        match entry.accept(frame.timestamp, header.priority, tail, payload, timeout) {
            CanOutcome::Transfer(transfer) => {
                stats.record_transfer(1, transfer.transfer.payload.len() as u64);
                if sender.send(transfer).is_err() {
                    break;
                }
            }
            CanOutcome::Error(_) => stats.record_error(),
            CanOutcome::Pending => {}
        }
    }
}

/// An input session receiving every transfer matching one subject (promiscuous or selective) or
/// one service (always selective).
pub struct CanInputSession {
    inbox: mpsc::Receiver<TransferFrom<Vec<u8>>>,
    stats: Arc<Statistics>,
    transfer_id_timeout_ns: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    capture: Arc<Mutex<Vec<CaptureHandler>>>,
    reader: Option<thread::JoinHandle<()>>,
}

/// Default per-source transfer-ID timeout.
pub const DEFAULT_TRANSFER_ID_TIMEOUT: Duration = Duration::from_secs(2);

impl CanInputSession {
    pub fn new<L: CanLink>(
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
                run_can_reader(
                    link, specifier, local_node, extent_bytes, stats, timeout_ns, closed, capture, sender,
                )
            }
        });

        Ok(CanInputSession {
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

impl Drop for CanInputSession {
    fn drop(&mut self) {
        self.close();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl crate::common::InputSession for CanInputSession {
    fn receive(&mut self, monotonic_deadline: Instant) -> Result<Option<TransferFrom<Vec<u8>>>, ResourceClosed> {
        CanInputSession::receive(self, monotonic_deadline)
    }

    fn transfer_id_timeout(&self) -> Duration {
        CanInputSession::transfer_id_timeout(self)
    }

    fn set_transfer_id_timeout(&mut self, timeout: Duration) -> Result<(), InvalidTransportConfiguration> {
        CanInputSession::set_transfer_id_timeout(self, timeout)
    }

    fn close(&mut self) {
        CanInputSession::close(self)
    }

    fn statistics(&self) -> StatisticsSnapshot {
        CanInputSession::statistics(self)
    }

    fn begin_capture(&mut self, handler: CaptureHandler) {
        CanInputSession::begin_capture(self, handler)
    }
}
