//! Hytale protocol packets and payload compression.

use std::sync::{LazyLock, Mutex};

use zstd::bulk::Decompressor;

use crate::constants::{MAX_PACKET_SIZE, ZSTD_MAGIC};
use crate::error::CodecError;

/// Connect packet id.
pub const PACKET_CONNECT: u32 = 0x0000_0000;
/// Disconnect packet id.
pub const PACKET_DISCONNECT: u32 = 0x0000_0001;

/// A decoded Hytale protocol packet.
///
/// `data` may be a Zstd frame; decompression is lazy and caller-driven via
/// [`Packet::decompress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type identifier
    pub id: u32,
    /// Payload, possibly Zstd compressed
    pub data: Vec<u8>,
}

/// Shared Zstd decompressor. The context is single-threaded; concurrent
/// callers serialize on the mutex.
static DECOMPRESSOR: LazyLock<Mutex<Decompressor<'static>>> =
    LazyLock::new(|| Mutex::new(Decompressor::new().expect("failed to create zstd decompressor")));

impl Packet {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Returns true if the payload starts with the Zstd frame magic.
    pub fn is_compressed(&self) -> bool {
        self.data.len() >= 4 && self.data[..4] == ZSTD_MAGIC
    }

    /// Returns the decompressed payload, or the payload unchanged when it is
    /// not compressed.
    pub fn decompress(&self) -> Result<Vec<u8>, CodecError> {
        decompress(&self.data)
    }

    /// Returns a human-readable name for known packet ids.
    pub fn name(id: u32) -> &'static str {
        match id {
            PACKET_CONNECT => "Connect",
            PACKET_DISCONNECT => "Disconnect",
            _ => "",
        }
    }
}

/// Decompresses `data` if it begins with the Zstd magic; otherwise returns it
/// unchanged.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() < 4 || data[..4] != ZSTD_MAGIC {
        return Ok(data.to_vec());
    }

    DECOMPRESSOR
        .lock()
        .expect("zstd decompressor mutex poisoned")
        .decompress(data, MAX_PACKET_SIZE)
        .map_err(|e| CodecError::DecompressFailed {
            reason: e.to_string(),
        })
}
