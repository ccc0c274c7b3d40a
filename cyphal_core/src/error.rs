//! The error-kind taxonomy shared by every transport.
//!
//! These are *raised* errors: synchronous failures surfaced directly to a caller. Reassembly
//! errors (per-frame protocol violations) are a separate, non-raised taxonomy counted as
//! statistics; see `cyphal_transfer::reassembler::ReassemblyError` and
//! `cyphal_can::rx::CanReassemblyError`.

use core::fmt;

/// Bad constructor arguments, or an inconsistent set of inferior transports.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvalidTransportConfiguration(pub &'static str);

impl fmt::Display for InvalidTransportConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transport configuration: {}", self.0)
    }
}

/// The media layer rejected the requested configuration at open time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvalidMediaConfiguration(pub &'static str);

impl fmt::Display for InvalidMediaConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid media configuration: {}", self.0)
    }
}

/// A broadcast service session or a unicast message session was requested; neither is legal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UnsupportedSessionConfiguration;

impl fmt::Display for UnsupportedSessionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("service sessions must be unicast and message sessions must not require a remote node ID")
    }
}

/// A service session or a multi-frame send was attempted while the local node is anonymous.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OperationNotDefinedForAnonymousNode;

impl fmt::Display for OperationNotDefinedForAnonymousNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation not defined for an anonymous node")
    }
}

/// The session or transport this operation targets has already been closed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResourceClosed;

impl fmt::Display for ResourceClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("resource closed")
    }
}

/// An underlying I/O or storage failure in the media layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BackendError(pub &'static str);

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend error: {}", self.0)
    }
}

/// Memory could not be allocated or reserved for an operation that needed it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OutOfMemoryError;

impl fmt::Display for OutOfMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of memory")
    }
}

#[cfg(feature = "std")]
mod std_impls {
    use super::*;

    impl std::error::Error for InvalidTransportConfiguration {}
    impl std::error::Error for InvalidMediaConfiguration {}
    impl std::error::Error for UnsupportedSessionConfiguration {}
    impl std::error::Error for OperationNotDefinedForAnonymousNode {}
    impl std::error::Error for ResourceClosed {}
    impl std::error::Error for BackendError {}
    impl std::error::Error for OutOfMemoryError {}
}
