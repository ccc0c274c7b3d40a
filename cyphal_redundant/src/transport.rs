//! A redundant transport group: a set of inferior transports whose sessions are kept consistent
//! and whose traffic is fanned out/deduplicated by [`crate::session`].
//!
//! Grounded on `_redundant_transport.py`'s `RedundantTransport`. That class creates sessions
//! on-demand against a generic `pyuavcan.transport.Transport` interface keyed by session
//! specifier; this codebase has no equivalent generic transport-construction trait (each concrete
//! transport only exposes its own `CanLink`/`SerialLink` plus session constructors), so
//! `RedundantTransport` here manages exactly one input/output session pair — the composite session
//! for one data specifier. A caller that wants redundant pub/sub on several subjects constructs
//! one `RedundantTransport` per subject (documented in DESIGN.md).

use std::fmt;

use cyphal_core::error::InvalidTransportConfiguration;
use cyphal_core::id::NodeId;

use cyphal_session::{CaptureHandler, InputSession, OutputSession};

use crate::dedup::{deduplicator_for_modulo, CYCLIC_DEDUP_MODULO_THRESHOLD};
use crate::session::{RedundantInputSession, RedundantOutputSession};

/// The subset of an inferior transport's configuration that must agree across the whole redundant
/// group, queried explicitly since there is no single
/// `Transport` trait object to pull them from at runtime.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InferiorParams {
    pub local_node_id: Option<NodeId>,
    pub transfer_id_modulo: u64,
    pub max_nodes: u32,
    pub mtu: usize,
}

/// Aggregate protocol parameters for a redundant group, reduced from its inferiors' parameters by
/// taking the minimum of each field, matching
/// `RedundantTransport.protocol_parameters`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct ProtocolParameters {
    pub transfer_id_modulo: u64,
    pub max_nodes: u32,
    pub mtu: usize,
}

/// Why a new inferior was refused. Grounded on
/// `InconsistentInferiorConfigurationError`, which this crate represents as the shared
/// [`InvalidTransportConfiguration`] rather than inventing a parallel error hierarchy.
pub type InconsistentInferiorConfiguration = InvalidTransportConfiguration;

pub struct RedundantTransport {
    inferiors: Vec<InferiorParams>,
    output: RedundantOutputSession,
    input: Option<RedundantInputSession>,
}

impl fmt::Debug for RedundantTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedundantTransport")
            .field("inferiors", &self.inferiors)
            .finish()
    }
}

impl Default for RedundantTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RedundantTransport {
    pub fn new() -> Self {
        RedundantTransport {
            inferiors: Vec::new(),
            output: RedundantOutputSession::new(),
            input: None,
        }
    }

    pub fn inferior_count(&self) -> usize {
        self.inferiors.len()
    }

    /// All inferiors share the same local node-ID, or all are anonymous; `None` if there are no
    /// inferiors. The value is trusted to already be consistent because [`attach_inferior`]
    /// rejects any inferior that would break that invariant.
    ///
    /// [`attach_inferior`]: RedundantTransport::attach_inferior
    pub fn local_node_id(&self) -> Option<NodeId> {
        self.inferiors.first().and_then(|p| p.local_node_id)
    }

    /// Min-reduction over every inferior's parameters; all-zero if there are no inferiors.
    pub fn protocol_parameters(&self) -> ProtocolParameters {
        self.inferiors.iter().fold(None, |acc: Option<ProtocolParameters>, p| {
            Some(match acc {
                None => ProtocolParameters {
                    transfer_id_modulo: p.transfer_id_modulo,
                    max_nodes: p.max_nodes,
                    mtu: p.mtu,
                },
                Some(prev) => ProtocolParameters {
                    transfer_id_modulo: prev.transfer_id_modulo.min(p.transfer_id_modulo),
                    max_nodes: prev.max_nodes.min(p.max_nodes),
                    mtu: prev.mtu.min(p.mtu),
                },
            })
        }).unwrap_or_default()
    }

    /// `None` once any inferior's transfer-ID modulo reaches the monotonic threshold, matching
    /// `_get_tid_modulo`: the group as a whole is monotonic if forced to be by any one inferior.
    fn cyclic_tid_modulo(&self) -> Option<u64> {
        let modulo = self.protocol_parameters().transfer_id_modulo;
        if modulo < CYCLIC_DEDUP_MODULO_THRESHOLD {
            Some(modulo)
        } else {
            None
        }
    }

    fn validate_new_inferior(&self, params: &InferiorParams) -> Result<(), InconsistentInferiorConfiguration> {
        let Some(_first) = self.inferiors.first() else {
            return Ok(());
        };
        if self.local_node_id() != params.local_node_id {
            return Err(InvalidTransportConfiguration(
                "inferior has a different local node-ID than the rest of the redundant group",
            ));
        }
        match self.cyclic_tid_modulo() {
            None => {
                if params.transfer_id_modulo < CYCLIC_DEDUP_MODULO_THRESHOLD {
                    return Err(InvalidTransportConfiguration(
                        "inferior must use a monotonic transfer-ID counter to match the rest of the group",
                    ));
                }
            }
            Some(modulo) => {
                if params.transfer_id_modulo != modulo {
                    return Err(InvalidTransportConfiguration(
                        "inferior's transfer-ID modulo is not compatible with the rest of the group",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validates `params` against the rest of the group, then attaches `output`/`input` as a new
    /// inferior. On rejection, neither session is touched.
    pub fn attach_inferior(
        &mut self,
        params: InferiorParams,
        output: Box<dyn OutputSession>,
        input: Box<dyn InputSession>,
    ) -> Result<(), InconsistentInferiorConfiguration> {
        if let Err(e) = self.validate_new_inferior(&params) {
            log::warn!("rejecting inferior {:?}: {}", params, e);
            return Err(e);
        }

        if self.input.is_none() {
            self.input = Some(RedundantInputSession::new(deduplicator_for_modulo(params.transfer_id_modulo)));
        }
        self.output.add_inferior(output);
        self.input.as_mut().expect("just constructed above").add_inferior(input);
        self.inferiors.push(params);
        log::debug!("attached inferior, group size now {}", self.inferiors.len());
        Ok(())
    }

    /// Detaches and closes the inferior at `index`, per attachment order.
    pub fn detach_inferior(&mut self, index: usize) {
        if index >= self.inferiors.len() {
            return;
        }
        self.inferiors.remove(index);
        self.output.detach_inferior(index);
        if let Some(input) = self.input.as_mut() {
            input.detach_inferior(index);
        }
        log::debug!("detached inferior #{}, group size now {}", index, self.inferiors.len());
    }

    /// Closes every session and forgets every inferior, returning the group to its initial empty
    /// state. Matches `RedundantTransport.close`'s "closing is reversible" contract: inferiors may
    /// be attached again afterwards.
    pub fn close(&mut self) {
        self.output.close();
        if let Some(input) = self.input.as_mut() {
            input.close();
        }
        self.inferiors.clear();
        self.input = None;
        self.output = RedundantOutputSession::new();
    }

    pub fn output_session(&mut self) -> &mut RedundantOutputSession {
        &mut self.output
    }

    pub fn input_session(&mut self) -> Option<&mut RedundantInputSession> {
        self.input.as_mut()
    }

    /// Propagates capture registration to both the output and input composite sessions this group
    /// owns, which in turn apply it to every currently attached inferior and auto-apply it to
    /// inferiors attached afterwards, matching `RedundantTransport.begin_capture`.
    pub fn begin_capture(&mut self, handler: CaptureHandler) {
        let shared = std::sync::Arc::new(std::sync::Mutex::new(handler));
        self.output.begin_capture(crate::session::shared_capture_handler(shared.clone()));
        if let Some(input) = self.input.as_mut() {
            input.begin_capture(crate::session::shared_capture_handler(shared));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    fn params(node: u8, modulo: u64) -> InferiorParams {
        InferiorParams {
            local_node_id: Some(NodeId::try_from(node).unwrap()),
            transfer_id_modulo: modulo,
            max_nodes: 128,
            mtu: 63,
        }
    }

    struct NoopOutput;
    impl OutputSession for NoopOutput {
        fn send(
            &mut self,
            _transfer: &cyphal_core::transfer::Transfer<cyphal_core::transfer::Fragments<'_>>,
            _deadline: std::time::Instant,
        ) -> Result<bool, cyphal_session::SendError> {
            Ok(true)
        }
        fn close(&mut self) {}
        fn statistics(&self) -> cyphal_session::StatisticsSnapshot {
            cyphal_session::StatisticsSnapshot::default()
        }
        fn begin_capture(&mut self, _handler: CaptureHandler) {}
    }

    struct NoopInput;
    impl InputSession for NoopInput {
        fn receive(
            &mut self,
            _deadline: std::time::Instant,
        ) -> Result<Option<cyphal_core::transfer::TransferFrom<Vec<u8>>>, cyphal_core::error::ResourceClosed> {
            Ok(None)
        }
        fn transfer_id_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(2)
        }
        fn set_transfer_id_timeout(&mut self, _timeout: std::time::Duration) -> Result<(), InvalidTransportConfiguration> {
            Ok(())
        }
        fn close(&mut self) {}
        fn statistics(&self) -> cyphal_session::StatisticsSnapshot {
            cyphal_session::StatisticsSnapshot::default()
        }
        fn begin_capture(&mut self, _handler: CaptureHandler) {}
    }

    #[test]
    fn protocol_parameters_is_min_reduced() {
        let mut transport = RedundantTransport::new();
        transport.attach_inferior(params(1, 32), Box::new(NoopOutput), Box::new(NoopInput)).unwrap();
        transport.attach_inferior(
            InferiorParams { mtu: 8, ..params(1, 32) },
            Box::new(NoopOutput),
            Box::new(NoopInput),
        ).unwrap();
        assert_eq!(transport.protocol_parameters().mtu, 8);
    }

    #[test]
    fn mismatched_node_id_is_rejected() {
        let mut transport = RedundantTransport::new();
        transport.attach_inferior(params(1, 32), Box::new(NoopOutput), Box::new(NoopInput)).unwrap();
        let err = transport.attach_inferior(params(2, 32), Box::new(NoopOutput), Box::new(NoopInput));
        assert!(err.is_err());
        assert_eq!(transport.inferior_count(), 1);
    }

    #[test]
    fn cyclic_inferior_cannot_join_a_monotonic_group() {
        let mut transport = RedundantTransport::new();
        transport
            .attach_inferior(params(1, CYCLIC_DEDUP_MODULO_THRESHOLD), Box::new(NoopOutput), Box::new(NoopInput))
            .unwrap();
        let err = transport.attach_inferior(params(1, 32), Box::new(NoopOutput), Box::new(NoopInput));
        assert!(err.is_err());
    }

    #[test]
    fn close_resets_to_empty_and_allows_reattachment() {
        let mut transport = RedundantTransport::new();
        transport.attach_inferior(params(1, 32), Box::new(NoopOutput), Box::new(NoopInput)).unwrap();
        transport.close();
        assert_eq!(transport.inferior_count(), 0);
        assert_eq!(transport.local_node_id(), None);
        transport.attach_inferior(params(7, 32), Box::new(NoopOutput), Box::new(NoopInput)).unwrap();
        assert_eq!(transport.inferior_count(), 1);
    }
}
