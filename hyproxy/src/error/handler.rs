//! Handler chain construction and routing errors.

use thiserror::Error;

/// Errors from handler construction and per-connection routing decisions.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Handler type name is not present in the registry
    #[error("unknown handler type: {name}")]
    UnknownType { name: String },

    /// Handler configuration blob failed to parse or validate
    #[error("invalid handler config: {reason}")]
    InvalidConfig { reason: String },

    /// Routing finished without a backend in the session context
    #[error("no backend selected")]
    NoBackend,

    /// The initial packet carried no extractable DCID
    #[error("no DCID in initial packet")]
    NoDcid,

    /// Dialing or relaying to the selected backend failed
    #[error("backend {address} unreachable: {reason}")]
    BackendUnreachable { address: String, reason: String },
}
