//!
//! COBS frame codec, header (en/de)coding, and the byte-at-a-time stream parser for the Cyphal
//! serial transport.
//!

pub mod frame;
pub mod stream_parser;

pub use frame::{decode_frame, encode_frame, FrameError, Header, HeaderError, HEADER_SIZE};
pub use stream_parser::{ParserEvent, StreamParser};
