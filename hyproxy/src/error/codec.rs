//! Hytale wire codec errors.

use thiserror::Error;

/// Errors from the Hytale byte codec and framed packet layer.
///
/// All of these are local to a single packet: the reader position is left
/// untouched and the caller decides whether to drop the packet or the stream.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// VarInt continuation ran past the 5-byte maximum
    #[error("varint exceeds 5 bytes")]
    VarIntTooLong,

    /// String length prefix exceeds the protocol maximum
    #[error("string length {length} exceeds maximum {limit}")]
    StringTooLong { length: u32, limit: u32 },

    /// String bytes are not valid UTF-8
    #[error("invalid utf-8 string")]
    InvalidUtf8,

    /// Input ended before a complete value was read
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Frame length field exceeds the maximum packet size
    #[error("packet of {size} bytes exceeds maximum {limit}")]
    PacketTooLarge { size: usize, limit: usize },

    /// A typed parser was handed a packet with the wrong id
    #[error("invalid packet id {actual:#010x}, expected {expected:#010x}")]
    InvalidPacketId { expected: u32, actual: u32 },

    /// Zstd decompression failed
    #[error("decompression failed: {reason}")]
    DecompressFailed { reason: String },
}
