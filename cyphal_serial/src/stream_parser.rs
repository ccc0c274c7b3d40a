//! Byte-at-a-time serial stream parser.
//!
//! Frames are delimited by `0x00`; everything between two delimiters is a COBS-encoded region
//! (see [`crate::frame`]). The parser itself does not decode COBS: it only finds frame
//! boundaries and hands the raw (still-encoded) bytes onward, stamped with the timestamp of the
//! frame's first byte.

use cyphal_core::time::Timestamp;

const DELIMITER: u8 = 0x00;

enum State {
    /// Between frames; the next non-zero byte starts a new one.
    Outside,
    /// Accumulating a frame's bytes.
    Inside { buf: Vec<u8>, timestamp: Timestamp },
    /// The current frame already exceeded the size limit and was reported; further bytes up to
    /// the next delimiter are silently dropped.
    Discarding,
}

/// The result of pushing one byte into a [`StreamParser`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ParserEvent {
    /// A complete, well-sized frame (still COBS-encoded; pass to [`crate::frame::decode_frame`]).
    Frame { timestamp: Timestamp, bytes: Vec<u8> },
    /// Bytes that could not be delivered as a frame: oversized, or otherwise undecodable noise.
    /// Callers typically only count these for statistics.
    OutOfBand { bytes: Vec<u8> },
}

/// Finds frame boundaries in a byte stream delimited by `0x00`.
pub struct StreamParser {
    state: State,
    max_frame_size: usize,
}

impl StreamParser {
    pub fn new(max_frame_size: usize) -> Self {
        StreamParser {
            state: State::Outside,
            max_frame_size,
        }
    }

    /// Feeds one byte, with the timestamp it was received at, into the parser.
    pub fn push_byte(&mut self, timestamp: Timestamp, byte: u8) -> Option<ParserEvent> {
        if byte == DELIMITER {
            return match core::mem::replace(&mut self.state, State::Outside) {
                State::Outside | State::Discarding => None,
                State::Inside { buf, timestamp } => {
                    if buf.len() <= self.max_frame_size {
                        Some(ParserEvent::Frame { timestamp, bytes: buf })
                    } else {
                        Some(ParserEvent::OutOfBand { bytes: buf })
                    }
                }
            };
        }

        match &mut self.state {
            State::Outside => {
                self.state = State::Inside {
                    buf: vec![byte],
                    timestamp,
                };
                None
            }
            State::Inside { buf, .. } => {
                buf.push(byte);
                if buf.len() > self.max_frame_size {
                    let bytes = match core::mem::replace(&mut self.state, State::Discarding) {
                        State::Inside { buf, .. } => buf,
                        _ => unreachable!(),
                    };
                    Some(ParserEvent::OutOfBand { bytes })
                } else {
                    None
                }
            }
            State::Discarding => None,
        }
    }
}
