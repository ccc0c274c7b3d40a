//!
//! Session layer for the Cyphal transport stack: per-transport output/input
//! sessions, shared statistics, TX feedback, and the capture-driven tracer (§4.9).
//!

mod common;

pub mod can;
pub mod feedback;
pub mod serial;
pub mod statistics;
pub mod tracer;

pub use common::{
    validate_spoof_preconditions, Capture, CaptureHandler, InputSession, OutputSession, SendError,
    SpoofError,
};
pub use feedback::FeedbackHandler;
pub use statistics::{Statistics, StatisticsSnapshot};
