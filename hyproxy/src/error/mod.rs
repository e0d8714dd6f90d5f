//! Error handling for the hyproxy reverse proxy.
//!
//! This module provides a hierarchical error system using `thiserror` that
//! covers the wire codecs, QUIC Initial processing, and the handler chain.
//! Codec and QUIC errors are local to a packet: the packet is dropped and the
//! session (if any) survives. Handler construction errors are fatal at
//! startup.

mod codec;
mod handler;
mod quic;

pub use codec::CodecError;
pub use handler::HandlerError;
pub use quic::QuicError;

use thiserror::Error;

/// Main error type for hyproxy.
///
/// Each variant maps to a functional domain of the proxy while keeping a
/// single error surface for the binary and the integration tests.
#[derive(Error, Debug)]
pub enum HyproxyError {
    /// Hytale wire codec errors (VarInt, strings, framed packets)
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// QUIC Initial parsing and decryption errors
    #[error("QUIC error: {0}")]
    Quic(#[from] QuicError),

    /// Handler chain construction and routing errors
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// I/O operations errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic system errors for unrecoverable conditions
    #[error("System error: {message}")]
    System { message: String },
}

impl From<serde_json::Error> for HyproxyError {
    fn from(err: serde_json::Error) -> Self {
        HyproxyError::Handler(HandlerError::InvalidConfig {
            reason: err.to_string(),
        })
    }
}

impl From<figment::Error> for HyproxyError {
    fn from(err: figment::Error) -> Self {
        HyproxyError::system(format!("Configuration error: {err}"))
    }
}

impl From<tracing::subscriber::SetGlobalDefaultError> for HyproxyError {
    fn from(err: tracing::subscriber::SetGlobalDefaultError) -> Self {
        HyproxyError::system(format!("Failed to set global tracing subscriber: {err}"))
    }
}

impl HyproxyError {
    /// Creates a new HyproxyError with a system message.
    pub fn system(message: impl Into<String>) -> Self {
        HyproxyError::System {
            message: message.into(),
        }
    }

    /// Creates a HyproxyError for a general configuration problem.
    pub fn config_error(message: impl Into<String>) -> Self {
        HyproxyError::system(message)
    }
}

/// Result type alias for hyproxy operations.
pub type Result<T> = std::result::Result<T, HyproxyError>;
