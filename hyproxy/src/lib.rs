//! QUIC reverse proxy for the Hytale game protocol.
//!
//! Clients connect to one public UDP endpoint. The proxy decrypts each new
//! connection's QUIC Initial packet, recovers the TLS ClientHello (SNI and
//! ALPN), and runs a configurable handler chain that decides what happens
//! next:
//!
//! * **transparent forwarding**: datagrams are relayed verbatim to the
//!   backend a router selected, for the life of the QUIC connection; or
//! * **termination**: the connection is redirected into an internal QUIC
//!   listener that completes TLS with the proxy's own certificate, dials
//!   the real backend as a QUIC client, and bridges the application
//!   streams, giving handlers sight of the cleartext Hytale protocol.
//!
//! The [`protocol`] module implements the Hytale framed wire protocol
//! (VarInt primitives, length-prefixed frames, Zstd payloads) used to
//! decode traffic on terminated streams.

pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod proxy;
pub mod quic;
pub mod terminator;
pub mod utils;

pub use config::{HandlerConfig, ProxyConfig};
pub use error::{HyproxyError, Result};
pub use handler::{Action, Chain, Direction, Handler, Registry};
pub use proxy::Proxy;
