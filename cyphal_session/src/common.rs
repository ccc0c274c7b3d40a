//! Small pieces shared by every transport-specific session implementation.

use std::fmt;
use std::time::{Duration, Instant};

use cyphal_core::error::{
    InvalidTransportConfiguration, OperationNotDefinedForAnonymousNode, ResourceClosed,
    UnsupportedSessionConfiguration,
};
use cyphal_core::time::Timestamp;
use cyphal_core::transfer::{AlienTransfer, Fragments, Transfer, TransferFrom};

use crate::statistics::StatisticsSnapshot;

/// The reason an output session's `send` call failed outright (as opposed to timing out, which is
/// reported as `Ok(false)`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendError {
    Closed(ResourceClosed),
    AnonymousMultiFrame(OperationNotDefinedForAnonymousNode),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(e) => write!(f, "{}", e),
            SendError::AnonymousMultiFrame(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SendError {}

/// The base interface every transport-specific output session implements. A [`crate::redundant`]-style composite transport holds a
/// heterogeneous set of inferior sessions behind this trait rather than being generic over one
/// concrete transport.
pub trait OutputSession: Send {
    fn send(
        &mut self,
        transfer: &Transfer<Fragments<'_>>,
        monotonic_deadline: Instant,
    ) -> Result<bool, SendError>;

    fn close(&mut self);

    fn statistics(&self) -> StatisticsSnapshot;

    /// Registers a capture handler invoked once per frame this session transmits.
    fn begin_capture(&mut self, handler: CaptureHandler);
}

/// The base interface every transport-specific input session implements.
pub trait InputSession: Send {
    fn receive(&mut self, monotonic_deadline: Instant) -> Result<Option<TransferFrom<Vec<u8>>>, ResourceClosed>;

    fn transfer_id_timeout(&self) -> Duration;

    fn set_transfer_id_timeout(&mut self, timeout: Duration) -> Result<(), InvalidTransportConfiguration>;

    fn close(&mut self);

    fn statistics(&self) -> StatisticsSnapshot;

    /// Registers a capture handler invoked once per frame this session's reader observes.
    fn begin_capture(&mut self, handler: CaptureHandler);
}

/// A timestamped observation of a wire-level frame. `raw` carries the transport's own on-wire encoding: the 29-bit CAN-ID plus data field
/// for CAN, or the delimited COBS-encoded byte sequence for serial.
#[derive(Debug, Clone)]
pub struct Capture {
    pub timestamp: Timestamp,
    pub raw: Vec<u8>,
    /// True if this capture was emitted by the local node (outgoing), false if received.
    pub own: bool,
}

/// Invoked once per emitted or received frame once capture is enabled. May be called from a
/// background reader thread; handlers must synchronize their own state.
pub type CaptureHandler = Box<dyn FnMut(&Capture) + Send>;

/// Checks the preconditions a [`AlienTransfer`] must satisfy before it may be spoofed
///: a service transfer must name a source and destination, and only
/// single-frame messages may be sent anonymously.
pub fn validate_spoof_preconditions<P>(
    transfer: &AlienTransfer<P>,
    single_frame_payload_len: impl FnOnce() -> usize,
    mtu: usize,
) -> Result<(), SpoofError> {
    if transfer.data_specifier.is_service() {
        if transfer.source.is_none() {
            return Err(SpoofError::AnonymousService(OperationNotDefinedForAnonymousNode));
        }
        if transfer.destination.is_none() {
            return Err(SpoofError::BroadcastService(UnsupportedSessionConfiguration));
        }
    } else if transfer.destination.is_some() {
        return Err(SpoofError::UnicastMessage(UnsupportedSessionConfiguration));
    }

    if transfer.source.is_none() && single_frame_payload_len() > mtu {
        return Err(SpoofError::AnonymousMultiFrame(OperationNotDefinedForAnonymousNode));
    }
    Ok(())
}

/// Why a `spoof()` call was rejected before ever touching the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpoofError {
    AnonymousService(OperationNotDefinedForAnonymousNode),
    BroadcastService(UnsupportedSessionConfiguration),
    UnicastMessage(UnsupportedSessionConfiguration),
    AnonymousMultiFrame(OperationNotDefinedForAnonymousNode),
}

impl fmt::Display for SpoofError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpoofError::AnonymousService(e) => write!(f, "{}", e),
            SpoofError::BroadcastService(e) => write!(f, "{}", e),
            SpoofError::UnicastMessage(e) => write!(f, "{}", e),
            SpoofError::AnonymousMultiFrame(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SpoofError {}
