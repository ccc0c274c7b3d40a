//! Data and session specifiers.

use crate::id::{NodeId, ServiceId, SubjectId};

/// Whether a service transfer is a request or a response.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServiceRole {
    Request,
    Response,
}

/// Identifies what a transfer is about: a subject for messages, or a service plus role for
/// requests/responses.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DataSpecifier {
    Message { subject: SubjectId },
    Service { service: ServiceId, role: ServiceRole },
}

impl DataSpecifier {
    pub const fn is_service(&self) -> bool {
        matches!(self, DataSpecifier::Service { .. })
    }
}

/// A data specifier plus an optional remote node ID.
///
/// For input sessions, the absence of a remote ID means *promiscuous* (accept from any source);
/// its presence means *selective*. For output sessions, absence means *broadcast*; presence means
/// *unicast*. Service sessions always carry a remote node ID.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SessionSpecifier {
    pub data_specifier: DataSpecifier,
    pub remote_node: Option<NodeId>,
}

impl SessionSpecifier {
    pub const fn new(data_specifier: DataSpecifier, remote_node: Option<NodeId>) -> Self {
        SessionSpecifier {
            data_specifier,
            remote_node,
        }
    }

    /// Checks that a specifier intended for an output session is consistent: services must be
    /// unicast, and only messages may be broadcast.
    pub const fn valid_for_output(&self) -> bool {
        match self.data_specifier {
            DataSpecifier::Service { .. } => self.remote_node.is_some(),
            DataSpecifier::Message { .. } => self.remote_node.is_none(),
        }
    }

    /// Checks that a specifier intended for an input session is consistent: services are always
    /// selective (addressed to a specific local node), never promiscuous.
    pub const fn valid_for_input(&self) -> bool {
        match self.data_specifier {
            DataSpecifier::Service { .. } => self.remote_node.is_some(),
            DataSpecifier::Message { .. } => true,
        }
    }
}
