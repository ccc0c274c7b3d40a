//! Output and input sessions that fan a transfer out to, or deduplicate it across, a set of
//! inferior transport sessions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cyphal_core::error::{InvalidTransportConfiguration, ResourceClosed};
use cyphal_core::transfer::{Fragments, Transfer, TransferFrom};

use cyphal_session::{CaptureHandler, InputSession, OutputSession, SendError, Statistics, StatisticsSnapshot};

use crate::dedup::Deduplicator;

/// Wraps a shared handler so the same capture callback can be registered on several inferiors at
/// once: a plain `CaptureHandler` is `FnMut` and cannot be cloned.
pub(crate) fn shared_capture_handler(shared: Arc<Mutex<CaptureHandler>>) -> CaptureHandler {
    Box::new(move |capture| {
        (*shared.lock().unwrap())(capture);
    })
}

/// Fans a transfer out to every attached inferior output session. Grounded on `_redundant_transport.py`'s `RedundantOutputSession.send`, which gathers
/// `asyncio.gather` results from every inferior; this crate's inferior sessions are synchronous
/// rather than coroutines, so the fan-out below runs sequentially instead of concurrently
/// (documented in DESIGN.md as a deliberate simplification).
pub struct RedundantOutputSession {
    inferiors: Vec<Box<dyn OutputSession>>,
    capture_handlers: Vec<Arc<Mutex<CaptureHandler>>>,
}

impl Default for RedundantOutputSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RedundantOutputSession {
    pub fn new() -> Self {
        RedundantOutputSession { inferiors: Vec::new(), capture_handlers: Vec::new() }
    }

    pub fn inferior_count(&self) -> usize {
        self.inferiors.len()
    }

    /// Attaches an inferior output session. Capture handlers registered before this call are
    /// applied to it immediately, matching the original's "capture follows the group" contract.
    pub fn add_inferior(&mut self, mut inferior: Box<dyn OutputSession>) {
        for handler in &self.capture_handlers {
            inferior.begin_capture(shared_capture_handler(handler.clone()));
        }
        self.inferiors.push(inferior);
    }

    /// Detaches and closes the inferior at `index`, per attachment order. Grounded on
    /// `_redundant_transport.py`'s `detach_inferior`, which closes every session the departing
    /// inferior owned.
    pub fn detach_inferior(&mut self, index: usize) {
        if index < self.inferiors.len() {
            let mut removed = self.inferiors.remove(index);
            removed.close();
        }
    }

    /// Sends on every inferior and reports success if at least one accepted the transfer before
    /// its deadline, matching `all(...)`-over-`asyncio.gather` semantics in the original: with no
    /// inferiors attached there is nothing to fail, so the send trivially succeeds.
    pub fn send(
        &mut self,
        transfer: &Transfer<Fragments<'_>>,
        monotonic_deadline: Instant,
    ) -> Result<bool, SendError> {
        if self.inferiors.is_empty() {
            return Ok(true);
        }
        let mut any_accepted = false;
        let mut last_error = None;
        for inferior in &mut self.inferiors {
            match inferior.send(transfer, monotonic_deadline) {
                Ok(true) => any_accepted = true,
                Ok(false) => {}
                Err(e) => last_error = Some(e),
            }
        }
        if any_accepted {
            Ok(true)
        } else if let Some(e) = last_error {
            Err(e)
        } else {
            Ok(false)
        }
    }

    pub fn close(&mut self) {
        for inferior in &mut self.inferiors {
            inferior.close();
        }
    }

    /// Sums counters across every inferior. There is no single "the" transfer count for a
    /// redundant session, so this reports the aggregate traffic actually placed on the wire.
    pub fn statistics(&self) -> StatisticsSnapshot {
        let mut total = StatisticsSnapshot::default();
        for inferior in &self.inferiors {
            let s = inferior.statistics();
            total.transfers += s.transfers;
            total.frames += s.frames;
            total.payload_bytes += s.payload_bytes;
            total.errors += s.errors;
            total.drops += s.drops;
        }
        total
    }

    pub fn begin_capture(&mut self, handler: CaptureHandler) {
        let shared = Arc::new(Mutex::new(handler));
        for inferior in &mut self.inferiors {
            inferior.begin_capture(shared_capture_handler(shared.clone()));
        }
        self.capture_handlers.push(shared);
    }
}

impl OutputSession for RedundantOutputSession {
    fn send(
        &mut self,
        transfer: &Transfer<Fragments<'_>>,
        monotonic_deadline: Instant,
    ) -> Result<bool, SendError> {
        RedundantOutputSession::send(self, transfer, monotonic_deadline)
    }

    fn close(&mut self) {
        RedundantOutputSession::close(self)
    }

    fn statistics(&self) -> StatisticsSnapshot {
        RedundantOutputSession::statistics(self)
    }

    fn begin_capture(&mut self, handler: CaptureHandler) {
        RedundantOutputSession::begin_capture(self, handler)
    }
}

/// How long a forwarder thread blocks on one inferior's `receive` before checking whether the
/// session has been closed or another inferior's backlog needs draining.
const FORWARDER_POLL: Duration = Duration::from_millis(200);

/// A forwarder thread's join handle plus the flag used to stop it without affecting the other
/// inferiors, so a single inferior can be detached independently.
struct Forwarder {
    own_closed: Arc<AtomicBool>,
    join: thread::JoinHandle<()>,
}

fn run_forwarder(
    mut inferior: Box<dyn InputSession>,
    iface_id: u32,
    dedup: Arc<Mutex<Box<dyn Deduplicator>>>,
    transfer_id_timeout_ns: Arc<AtomicU64>,
    own_closed: Arc<AtomicBool>,
    session_closed: Arc<AtomicBool>,
    stats: Arc<Statistics>,
    sender: mpsc::Sender<TransferFrom<Vec<u8>>>,
) {
    while !own_closed.load(Ordering::Relaxed) && !session_closed.load(Ordering::Relaxed) {
        let deadline = Instant::now() + FORWARDER_POLL;
        match inferior.receive(deadline) {
            Ok(Some(transfer)) => {
                let timeout = Duration::from_nanos(transfer_id_timeout_ns.load(Ordering::Relaxed));
                let accept = dedup.lock().unwrap().should_accept(
                    iface_id,
                    timeout,
                    transfer.transfer.timestamp,
                    transfer.source,
                    transfer.transfer.transfer_id,
                );
                if !accept {
                    stats.record_drop();
                    continue;
                }
                stats.record_transfer(1, transfer.transfer.payload.len() as u64);
                if sender.send(transfer).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(ResourceClosed) => break,
        }
    }
    inferior.close();
}

/// Merges the input streams of a set of inferior input sessions into one, dropping duplicates
/// delivered by more than one inferior. Each inferior is drained by its own
/// background thread, reusing the forwarder-thread shape already used by the single-transport
/// sessions in `cyphal_session`.
pub struct RedundantInputSession {
    inbox: mpsc::Receiver<TransferFrom<Vec<u8>>>,
    sender: mpsc::Sender<TransferFrom<Vec<u8>>>,
    dedup: Arc<Mutex<Box<dyn Deduplicator>>>,
    transfer_id_timeout_ns: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    stats: Arc<Statistics>,
    capture_handlers: Vec<Arc<Mutex<CaptureHandler>>>,
    next_iface_id: u32,
    forwarders: Vec<Forwarder>,
}

/// Mirrors [`cyphal_session::can::DEFAULT_TRANSFER_ID_TIMEOUT`]; the redundant session applies its
/// own timeout only to deduplication, not to the inferiors' own reassembly.
pub const DEFAULT_TRANSFER_ID_TIMEOUT: Duration = Duration::from_secs(2);

impl RedundantInputSession {
    pub fn new(dedup: Box<dyn Deduplicator>) -> Self {
        let (sender, inbox) = mpsc::channel();
        RedundantInputSession {
            inbox,
            sender,
            dedup: Arc::new(Mutex::new(dedup)),
            transfer_id_timeout_ns: Arc::new(AtomicU64::new(DEFAULT_TRANSFER_ID_TIMEOUT.as_nanos() as u64)),
            closed: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Statistics::new()),
            capture_handlers: Vec::new(),
            next_iface_id: 0,
            forwarders: Vec::new(),
        }
    }

    /// Attaches an inferior input session, spawning its forwarder thread. Existing capture
    /// handlers are applied to it immediately.
    pub fn add_inferior(&mut self, mut inferior: Box<dyn InputSession>) {
        for handler in &self.capture_handlers {
            inferior.begin_capture(shared_capture_handler(handler.clone()));
        }
        let iface_id = self.next_iface_id;
        self.next_iface_id += 1;

        let own_closed = Arc::new(AtomicBool::new(false));
        let dedup = self.dedup.clone();
        let timeout_ns = self.transfer_id_timeout_ns.clone();
        let session_closed = self.closed.clone();
        let stats = self.stats.clone();
        let sender = self.sender.clone();
        let join = thread::spawn({
            let own_closed = own_closed.clone();
            move || run_forwarder(inferior, iface_id, dedup, timeout_ns, own_closed, session_closed, stats, sender)
        });
        self.forwarders.push(Forwarder { own_closed, join });
    }

    /// Detaches and closes the inferior at `index`, per attachment order, joining its forwarder
    /// thread without disturbing the others.
    pub fn detach_inferior(&mut self, index: usize) {
        if index < self.forwarders.len() {
            let forwarder = self.forwarders.remove(index);
            forwarder.own_closed.store(true, Ordering::Relaxed);
            let _ = forwarder.join.join();
        }
    }

    pub fn inferior_count(&self) -> usize {
        self.forwarders.len()
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
        self.transfer_id_timeout_ns.store(timeout.as_nanos() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    pub fn begin_capture(&mut self, handler: CaptureHandler) {
        // Only newly attached inferiors observe this handler; existing forwarder threads already
        // own their inferior and cannot be reached from here without the inferior itself exposing
        // a thread-safe capture registration, which `begin_capture` is not guaranteed to support
        // once a session has been handed to a forwarder thread. Handlers registered before any
        // inferior is attached, or before further `add_inferior` calls, still work as documented.
        self.capture_handlers.push(Arc::new(Mutex::new(handler)));
    }
}

impl Drop for RedundantInputSession {
    fn drop(&mut self) {
        self.close();
        for forwarder in self.forwarders.drain(..) {
            let _ = forwarder.join.join();
        }
    }
}

impl InputSession for RedundantInputSession {
    fn receive(&mut self, monotonic_deadline: Instant) -> Result<Option<TransferFrom<Vec<u8>>>, ResourceClosed> {
        RedundantInputSession::receive(self, monotonic_deadline)
    }

    fn transfer_id_timeout(&self) -> Duration {
        RedundantInputSession::transfer_id_timeout(self)
    }

    fn set_transfer_id_timeout(&mut self, timeout: Duration) -> Result<(), InvalidTransportConfiguration> {
        RedundantInputSession::set_transfer_id_timeout(self, timeout)
    }

    fn close(&mut self) {
        RedundantInputSession::close(self)
    }

    fn statistics(&self) -> StatisticsSnapshot {
        RedundantInputSession::statistics(self)
    }

    fn begin_capture(&mut self, handler: CaptureHandler) {
        RedundantInputSession::begin_capture(self, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyphal_core::priority::Priority;
    use cyphal_core::time::Timestamp;
    use std::sync::atomic::AtomicUsize;

    struct StubOutput {
        accept: bool,
        sent: Arc<AtomicUsize>,
    }

    impl OutputSession for StubOutput {
        fn send(&mut self, _transfer: &Transfer<Fragments<'_>>, _deadline: Instant) -> Result<bool, SendError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(self.accept)
        }
        fn close(&mut self) {}
        fn statistics(&self) -> StatisticsSnapshot {
            StatisticsSnapshot::default()
        }
        fn begin_capture(&mut self, _handler: CaptureHandler) {}
    }

    #[test]
    fn send_with_no_inferiors_succeeds_trivially() {
        let mut session = RedundantOutputSession::new();
        let transfer = Transfer {
            timestamp: Timestamp::ZERO,
            priority: Priority::Nominal,
            transfer_id: 0,
            payload: Fragments::new(&[]),
        };
        assert_eq!(session.send(&transfer, Instant::now()), Ok(true));
    }

    #[test]
    fn send_succeeds_if_any_inferior_accepts() {
        let mut session = RedundantOutputSession::new();
        let sent = Arc::new(AtomicUsize::new(0));
        session.add_inferior(Box::new(StubOutput { accept: false, sent: sent.clone() }));
        session.add_inferior(Box::new(StubOutput { accept: true, sent: sent.clone() }));
        let transfer = Transfer {
            timestamp: Timestamp::ZERO,
            priority: Priority::Nominal,
            transfer_id: 0,
            payload: Fragments::new(&[]),
        };
        assert_eq!(session.send(&transfer, Instant::now()), Ok(true));
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn send_fails_if_every_inferior_declines() {
        let mut session = RedundantOutputSession::new();
        let sent = Arc::new(AtomicUsize::new(0));
        session.add_inferior(Box::new(StubOutput { accept: false, sent: sent.clone() }));
        let transfer = Transfer {
            timestamp: Timestamp::ZERO,
            priority: Priority::Nominal,
            transfer_id: 0,
            payload: Fragments::new(&[]),
        };
        assert_eq!(session.send(&transfer, Instant::now()), Ok(false));
    }

    struct StubInput {
        items: Mutex<Vec<TransferFrom<Vec<u8>>>>,
    }

    impl InputSession for StubInput {
        fn receive(&mut self, _deadline: Instant) -> Result<Option<TransferFrom<Vec<u8>>>, ResourceClosed> {
            Ok(self.items.get_mut().unwrap().pop())
        }
        fn transfer_id_timeout(&self) -> Duration {
            DEFAULT_TRANSFER_ID_TIMEOUT
        }
        fn set_transfer_id_timeout(&mut self, _timeout: Duration) -> Result<(), InvalidTransportConfiguration> {
            Ok(())
        }
        fn close(&mut self) {}
        fn statistics(&self) -> StatisticsSnapshot {
            StatisticsSnapshot::default()
        }
        fn begin_capture(&mut self, _handler: CaptureHandler) {}
    }

    #[test]
    fn input_session_forwards_and_deduplicates() {
        use crate::dedup::MonotonicDeduplicator;
        use cyphal_core::id::NodeId;
        use core::convert::TryFrom;

        let source = Some(NodeId::try_from(1).unwrap());
        let make_transfer = |tid: u64| TransferFrom {
            transfer: Transfer { timestamp: Timestamp::ZERO, priority: Priority::Nominal, transfer_id: tid, payload: vec![0u8] },
            source,
        };

        let mut session = RedundantInputSession::new(Box::new(MonotonicDeduplicator::new()));
        session.add_inferior(Box::new(StubInput { items: Mutex::new(vec![make_transfer(1)]) }));
        session.add_inferior(Box::new(StubInput { items: Mutex::new(vec![make_transfer(1)]) }));

        let deadline = Instant::now() + Duration::from_secs(1);
        let first = session.receive(deadline).unwrap();
        assert!(first.is_some());
        // The duplicate transfer-ID from the second inferior must not surface.
        let second = session.receive(Instant::now() + Duration::from_millis(300)).unwrap();
        assert!(second.is_none());
    }
}
