//!
//! CAN frame codec, tail-byte transfer framing, and in-order transfer reassembly for the Cyphal CAN transport.
//!

#![no_std]

extern crate alloc;

pub mod crc;
pub mod frame;
pub mod id;
pub mod rx;
pub mod tx;

pub use frame::{pad_to_valid_dlc, CanFrame, Mtu, TailByte, DLC_TABLE};
pub use id::{CanHeader, CanId, CanIdParseError, MessageHeader, ServiceHeader};
pub use rx::{CanReassemblyError, Receiver};
pub use tx::Transmitter;
