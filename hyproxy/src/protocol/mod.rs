//! The Hytale framed application protocol.
//!
//! Streams on a terminated connection carry length-prefixed frames of typed
//! packet records; payloads may be Zstd compressed. This module provides the
//! primitive codec, the frame reader/writer, and parsers for the known
//! packet types.

pub mod connect;
pub mod encoding;
pub mod packet;
pub mod reader;

pub use connect::{ConnectPacket, DisconnectPacket, CONNECT_PACKET_MIN_SIZE};
pub use packet::{decompress, Packet, PACKET_CONNECT, PACKET_DISCONNECT};
pub use reader::{PacketReader, PacketWriter};
