//! Output session TX feedback.

use cyphal_core::time::Timestamp;

/// Invoked once per sent transfer (or, for a duplicated service transfer, once per transfer on
/// its first successful copy) with `(original transfer timestamp, first-frame TX timestamp)`.
pub type FeedbackHandler = Box<dyn FnMut(Timestamp, Timestamp) + Send>;
