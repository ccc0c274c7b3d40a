//!
//! Transport-agnostic vocabulary shared by every concrete Cyphal transport:
//! priorities, node and port identifiers, session specifiers, timestamps,
//! transfers, and the error-kind taxonomy.
//!

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

pub mod error;
pub mod id;
pub mod priority;
pub mod specifier;
pub mod time;
pub mod transfer;

pub use id::{NodeId, ServiceId, SubjectId};
pub use priority::Priority;
pub use specifier::{DataSpecifier, SessionSpecifier};
pub use time::Timestamp;
pub use transfer::{AlienTransfer, Transfer, TransferFrom};
