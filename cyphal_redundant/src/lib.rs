//!
//! Redundant transport composition: fan-out sending and deduplicated receiving across a set of
//! inferior transports sharing one logical session.
//!

pub mod dedup;
pub mod session;
pub mod transport;

pub use dedup::{CyclicDeduplicator, Deduplicator, MonotonicDeduplicator, CYCLIC_DEDUP_MODULO_THRESHOLD};
pub use session::{RedundantInputSession, RedundantOutputSession};
pub use transport::{InconsistentInferiorConfiguration, InferiorParams, ProtocolParameters, RedundantTransport};
