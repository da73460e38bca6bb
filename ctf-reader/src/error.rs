//! Error types for trace open and event decode operations

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CtfError {
    #[error("trace not found: {0}")]
    NotFound(PathBuf),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported metadata framing: {scheme} scheme {value}")]
    UnsupportedFraming { scheme: &'static str, value: u8 },

    #[error("invalid magic number {found:#x} at packet {packet} (file offset {offset})")]
    BadMagic {
        found: u64,
        packet: usize,
        offset: u64,
    },

    #[error("unique universal identifiers do not match")]
    UuidMismatch,

    #[error("stream id is changing within a stream: {expected} then {found}")]
    StreamIdChange { expected: u64, found: u64 },

    #[error("stream {0} is not declared in metadata")]
    UnknownStream(u64),

    #[error("event id {0} is outside range")]
    InvalidEventId(u64),

    #[error(
        "bad packet size: content {content_bits} bits, packet {packet_bits} bits, \
         {remaining_bits} bits left in file"
    )]
    BadPacketSize {
        content_bits: u64,
        packet_bits: u64,
        remaining_bits: u64,
    },

    #[error("metadata parse error: {0}")]
    MetadataParse(String),

    #[error("event decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, CtfError>;

impl CtfError {
    pub fn metadata(details: impl std::fmt::Display) -> Self {
        Self::MetadataParse(details.to_string())
    }

    pub fn decode(details: impl std::fmt::Display) -> Self {
        Self::Decode(details.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error__decode_constructor__then_formats_message() {
        let err = CtfError::decode("unexpected end of packet");
        assert!(matches!(err, CtfError::Decode(_)));
        assert!(format!("{err}").contains("unexpected end of packet"));
    }

    #[test]
    fn test_error__bad_packet_size__then_mentions_all_sizes() {
        let err = CtfError::BadPacketSize {
            content_bits: 8192,
            packet_bits: 4096,
            remaining_bits: 4096,
        };
        let message = err.to_string();
        assert!(message.contains("8192"));
        assert!(message.contains("4096"));
    }

    #[test]
    fn test_error__from_io__then_wraps_source() {
        let source = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let err = CtfError::from(source);
        assert!(matches!(err, CtfError::Io(_)));
        assert!(format!("{err}").contains("short read"));
    }
}
