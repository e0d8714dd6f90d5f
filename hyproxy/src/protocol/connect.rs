//! Connect and Disconnect packet parsing.

use crate::error::CodecError;
use crate::protocol::encoding::read_string;
use crate::protocol::packet::{Packet, PACKET_CONNECT, PACKET_DISCONNECT};

/// Minimum decodable size of a Connect packet: 32-byte protocol hash,
/// 1-byte client type, 16-byte UUID, and three one-byte string length
/// prefixes plus minimal contents.
pub const CONNECT_PACKET_MIN_SIZE: usize = 82;

/// The first packet sent by a client (`id = 0x00000000`).
///
/// The fixed prefix is always present; the trailing strings and referral
/// bytes are parsed best-effort so a truncated capture still yields the
/// identifying fields.
#[derive(Debug, Clone, Default)]
pub struct ConnectPacket {
    /// SHA-256 hash identifying the protocol version
    pub protocol_hash: [u8; 32],
    /// Client type identifier
    pub client_type: u8,
    /// Player UUID (big-endian on the wire)
    pub uuid: [u8; 16],
    /// Client language, e.g. "en_US"
    pub language: String,
    /// Identity/auth token
    pub identity_token: String,
    /// Player username
    pub username: String,
    /// Trailing opaque referral bytes
    pub referral_data: Vec<u8>,
}

impl ConnectPacket {
    /// Parses a Connect packet payload.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < CONNECT_PACKET_MIN_SIZE {
            return Err(CodecError::UnexpectedEof);
        }

        let mut cp = ConnectPacket::default();
        let mut offset = 0;

        cp.protocol_hash.copy_from_slice(&data[offset..offset + 32]);
        offset += 32;

        cp.client_type = data[offset];
        offset += 1;

        cp.uuid.copy_from_slice(&data[offset..offset + 16]);
        offset += 16;

        // Trailing fields are best-effort: stop at the first field that does
        // not decode and keep what was recovered.
        match read_string(&data[offset..]) {
            Ok((language, n)) => {
                cp.language = language;
                offset += n;
            }
            Err(_) => return Ok(cp),
        }

        match read_string(&data[offset..]) {
            Ok((token, n)) => {
                cp.identity_token = token;
                offset += n;
            }
            Err(_) => return Ok(cp),
        }

        match read_string(&data[offset..]) {
            Ok((username, n)) => {
                cp.username = username;
                offset += n;
            }
            Err(_) => return Ok(cp),
        }

        if offset < data.len() {
            cp.referral_data = data[offset..].to_vec();
        }

        Ok(cp)
    }

    /// Parses a Connect packet, checking the packet id first.
    pub fn parse_packet(p: &Packet) -> Result<Self, CodecError> {
        if p.id != PACKET_CONNECT {
            return Err(CodecError::InvalidPacketId {
                expected: PACKET_CONNECT,
                actual: p.id,
            });
        }
        Self::parse(&p.data)
    }

    /// Returns the UUID formatted as `8-4-4-4-12` hex groups.
    pub fn uuid_string(&self) -> String {
        let u = &self.uuid;
        format!(
            "{}-{}-{}-{}-{}",
            hex(&u[0..4]),
            hex(&u[4..6]),
            hex(&u[6..8]),
            hex(&u[8..10]),
            hex(&u[10..16]),
        )
    }

    /// Returns the protocol hash as 64 lowercase hex characters.
    pub fn protocol_hash_hex(&self) -> String {
        hex(&self.protocol_hash)
    }
}

/// A Disconnect packet (`id = 0x00000001`); some protocol versions carry a
/// reason string.
#[derive(Debug, Clone, Default)]
pub struct DisconnectPacket {
    pub reason: String,
}

impl DisconnectPacket {
    /// Parses a Disconnect packet payload; an empty payload yields an empty
    /// reason.
    pub fn parse(data: &[u8]) -> Self {
        let reason = match read_string(data) {
            Ok((reason, _)) => reason,
            Err(_) => String::new(),
        };
        Self { reason }
    }

    /// Parses a Disconnect packet, checking the packet id first.
    pub fn parse_packet(p: &Packet) -> Result<Self, CodecError> {
        if p.id != PACKET_DISCONNECT {
            return Err(CodecError::InvalidPacketId {
                expected: PACKET_DISCONNECT,
                actual: p.id,
            });
        }
        Ok(Self::parse(&p.data))
    }
}

pub(crate) fn hex(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
