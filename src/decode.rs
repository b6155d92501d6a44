//! Diagnostic wire-message decoding
//!
//! The relay offers every relayed chunk, in both directions, to a
//! [`WireDecoder`] purely for logging. Decoding is best-effort: a failure
//! degrades log completeness and nothing else. Forwarding never waits on,
//! and is never altered by, the decoder.

use thiserror::Error;

/// Diagnostic decode failure
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Chunk shorter than a message header
    #[error("message too short: {0} bytes")]
    Truncated(usize),

    /// Header length field is inconsistent
    #[error("invalid message length {0}")]
    BadLength(i32),

    /// Opcode not known to this decoder
    #[error("unknown opcode {0}")]
    UnknownOpCode(i32),
}

/// Renders relayed chunks as one-line diagnostic summaries.
///
/// Implementations must be pure: no retained buffers, no side effects
/// beyond the returned string. The relay treats the decoder as a black box.
pub trait WireDecoder: Send + Sync {
    /// Decode one relayed chunk.
    fn decode(&self, bytes: &[u8]) -> Result<String, DecodeError>;
}

/// Decoder for the standard 16-byte message header carried by database
/// wire traffic: little-endian i32 message length, request id, response-to
/// and opcode.
#[derive(Debug, Default)]
pub struct HeaderDecoder;

const HEADER_SIZE: usize = 16;

impl WireDecoder for HeaderDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<String, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated(bytes.len()));
        }

        let message_length = read_i32(bytes, 0);
        let request_id = read_i32(bytes, 4);
        let response_to = read_i32(bytes, 8);
        let op_code = read_i32(bytes, 12);

        if message_length < HEADER_SIZE as i32 {
            return Err(DecodeError::BadLength(message_length));
        }

        let op_name = match op_code {
            1 => "reply",
            2004 => "query",
            2012 => "compressed",
            2013 => "msg",
            other => return Err(DecodeError::UnknownOpCode(other)),
        };

        Ok(format!(
            "{} len={} req={} resp={}",
            op_name, message_length, request_id, response_to
        ))
    }
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
