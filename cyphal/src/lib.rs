//!
//! A Cyphal/UAVCAN v1 transport stack.
//!
//! This crate is a thin facade over the workspace's component crates: transfer-layer framing and
//! reassembly, the CAN and serial transport specifics, CAN acceptance-filter optimization, the
//! session layer (output/input sessions, statistics, tracer), and redundant transport
//! composition with cyclic/monotonic deduplication. Each concern lives in its own crate
//! (`cyphal_core`, `cyphal_crc`, `cyphal_transfer`, `cyphal_can`, `cyphal_filter_config`,
//! `cyphal_serial`, `cyphal_session`, `cyphal_redundant`) so embedded users can depend on just the
//! leaf crates they need; this crate re-exports the full stack for applications that want all of
//! it under one name.
//!
//! DSDL data-type compilation, the high-level application node and register store, and
//! OS-specific media drivers (SocketCAN, a serial-port backend, raw UDP sockets) are explicitly
//! out of scope; see the workspace's `DESIGN.md` and `SPEC_FULL.md` §1.

pub mod core {
    pub use cyphal_core::*;
}

pub mod crc {
    pub use cyphal_crc::*;
}

pub mod transfer {
    pub use cyphal_transfer::*;
}

pub mod can {
    pub use cyphal_can::*;
}

pub mod filter_config {
    pub use cyphal_filter_config::*;
}

pub mod serial {
    pub use cyphal_serial::*;
}

pub mod session {
    pub use cyphal_session::*;
}

pub mod redundant {
    pub use cyphal_redundant::*;
}

pub use cyphal_core::{
    error, AlienTransfer, DataSpecifier, NodeId, Priority, SessionSpecifier, ServiceId,
    SubjectId, Timestamp, Transfer, TransferFrom,
};
pub use cyphal_session::{
    Capture, CaptureHandler, InputSession, OutputSession, SendError, SpoofError, Statistics,
    StatisticsSnapshot,
};
