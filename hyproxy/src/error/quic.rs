//! QUIC Initial packet processing errors.

use thiserror::Error;

/// Errors from QUIC header parsing, Initial key derivation, payload
/// decryption, and ClientHello extraction.
///
/// A failure here means the datagram is dropped; no session is created for
/// an Initial that cannot be decrypted and parsed.
#[derive(Error, Debug)]
pub enum QuicError {
    /// Packet is shorter than the structure being parsed requires
    #[error("packet too short: need {expected} bytes, have {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    /// Header is not a well-formed QUIC v1 long header of the expected type
    #[error("invalid packet header: {reason}")]
    InvalidHeader { reason: String },

    /// Initial key derivation failed
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    /// Header protection removal or AEAD open failed
    #[error("initial decrypt failed: {reason}")]
    DecryptFailed { reason: String },

    /// The ClientHello does not fit in the CRYPTO data of this Initial
    #[error("client hello incomplete")]
    HelloIncomplete,

    /// The CRYPTO stream does not contain a parseable ClientHello
    #[error("invalid client hello: {reason}")]
    InvalidClientHello { reason: String },
}
