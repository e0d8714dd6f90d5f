//! Protocol and proxy constants.
//!
//! Wire-format values here are fixed by the Hytale protocol and QUIC v1;
//! the timeouts are the proxy's operational defaults.

use std::time::Duration;

/// Frame header size for the Hytale framed protocol
/// (4 bytes length + 4 bytes packet id, both little-endian).
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size of a single framed packet.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Initial buffer size for the framed packet reader.
pub const DEFAULT_BUF_SIZE: usize = 64 * 1024;

/// Maximum length of a VarInt-prefixed protocol string.
pub const MAX_STRING_LENGTH: u32 = 256;

/// Zstd frame magic; a packet payload starting with these bytes is compressed.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Maximum UDP datagram size; recv buffers in the demux pool are this large.
pub const UDP_BUFFER_SIZE: usize = 65535;

/// Maximum QUIC v1 connection id length.
pub const MAX_CID_LENGTH: usize = 20;

/// Demux session idle timeout (also the QUIC idle timeout on both sides of
/// the terminator).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval at which the demux sweeps sessions for idle eviction.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout for dialing a backend from the terminator.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default size limit above which bridged packets are forwarded un-logged.
pub const DEFAULT_LOG_MAX_PACKET_SIZE: usize = 1024 * 1024;
