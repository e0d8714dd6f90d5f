//! QUIC Initial payload decryption (RFC 9001 §5).
//!
//! Parses the clear long-header fields, removes header protection, and
//! AEAD-opens the Initial payload so the CRYPTO frames become readable.

use ring::aead::quic::{HeaderProtectionKey, AES_128};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};

use crate::error::QuicError;
use crate::quic::crypto::{derive_initial_keys, InitialKeys};
use crate::quic::{PacketType, QUIC_V1};

/// A parsed and decrypted QUIC Initial packet.
#[derive(Debug, Clone)]
pub struct InitialPacket {
    pub version: u32,
    pub dcid: Vec<u8>,
    pub scid: Vec<u8>,
    pub token: Vec<u8>,
    pub packet_number: u64,
    /// Decrypted frame bytes
    pub payload: Vec<u8>,
}

/// Decrypts the first Initial packet in a datagram.
///
/// Coalesced packets after the Initial's declared length are ignored. The
/// input must be a QUIC v1 Initial; anything else is [`QuicError::
/// InvalidHeader`]. An AEAD failure (wrong keys, corrupted payload) is
/// [`QuicError::DecryptFailed`].
pub fn decrypt_initial(datagram: &[u8]) -> Result<InitialPacket, QuicError> {
    if datagram.len() < 7 {
        return Err(QuicError::PacketTooShort {
            expected: 7,
            actual: datagram.len(),
        });
    }

    match PacketType::classify(datagram) {
        Some(PacketType::Initial) => {}
        other => {
            return Err(QuicError::InvalidHeader {
                reason: format!("not an Initial packet: {other:?}"),
            })
        }
    }

    let version = u32::from_be_bytes(datagram[1..5].try_into().unwrap());
    if version != QUIC_V1 {
        return Err(QuicError::InvalidHeader {
            reason: format!("unsupported version {version:#010x}"),
        });
    }

    let mut pos = 5;
    let dcid = read_cid(datagram, &mut pos)?;
    let scid = read_cid(datagram, &mut pos)?;

    let token_len = quic_var_int(datagram, &mut pos)? as usize;
    let token_end = pos.checked_add(token_len).unwrap_or(usize::MAX);
    let token = datagram
        .get(pos..token_end)
        .ok_or(QuicError::PacketTooShort {
            expected: token_end,
            actual: datagram.len(),
        })?
        .to_vec();
    pos = token_end;

    let payload_len = quic_var_int(datagram, &mut pos)? as usize;
    let header_len = pos;
    let packet_end = header_len.checked_add(payload_len).unwrap_or(usize::MAX);
    if packet_end > datagram.len() {
        return Err(QuicError::PacketTooShort {
            expected: packet_end,
            actual: datagram.len(),
        });
    }

    let keys = derive_initial_keys(&dcid)?;

    // Work on a copy of just this packet; header protection is removed
    // in place.
    let mut packet = datagram[..packet_end].to_vec();

    // Sample starts 4 bytes past the packet number offset (RFC 9001 §5.4.2)
    let sample_start = header_len + 4;
    let sample_end = sample_start + 16;
    if sample_end > packet.len() {
        return Err(QuicError::PacketTooShort {
            expected: sample_end,
            actual: packet.len(),
        });
    }
    let mask = hp_mask(&keys, &packet[sample_start..sample_end])?;

    packet[0] ^= mask[0] & 0x0F;
    let pn_len = (packet[0] & 0x03) as usize + 1;

    let mut packet_number: u64 = 0;
    for i in 0..pn_len {
        packet[header_len + i] ^= mask[1 + i];
        packet_number = (packet_number << 8) | u64::from(packet[header_len + i]);
    }

    // Nonce = iv XOR left-padded packet number
    let mut nonce = keys.iv;
    for i in 0..8 {
        nonce[11 - i] ^= ((packet_number >> (8 * i)) & 0xFF) as u8;
    }

    let (aad, ciphertext) = packet.split_at_mut(header_len + pn_len);

    let key = UnboundKey::new(&AES_128_GCM, &keys.key).map_err(|_| QuicError::DecryptFailed {
        reason: "invalid AEAD key".into(),
    })?;
    let nonce = Nonce::assume_unique_for_key(nonce);
    let plaintext = LessSafeKey::new(key)
        .open_in_place(nonce, Aad::from(&aad[..]), ciphertext)
        .map_err(|_| QuicError::DecryptFailed {
            reason: "AEAD open failed".into(),
        })?;

    Ok(InitialPacket {
        version,
        dcid,
        scid,
        token,
        packet_number,
        payload: plaintext.to_vec(),
    })
}

fn read_cid(datagram: &[u8], pos: &mut usize) -> Result<Vec<u8>, QuicError> {
    let len = *datagram.get(*pos).ok_or(QuicError::PacketTooShort {
        expected: *pos + 1,
        actual: datagram.len(),
    })? as usize;
    *pos += 1;

    let cid = datagram
        .get(*pos..*pos + len)
        .ok_or(QuicError::PacketTooShort {
            expected: *pos + len,
            actual: datagram.len(),
        })?
        .to_vec();
    *pos += len;
    Ok(cid)
}

/// Reads a QUIC variable-length integer (RFC 9000 §16): the top two bits of
/// the first byte give the encoded length.
pub(crate) fn quic_var_int(data: &[u8], pos: &mut usize) -> Result<u64, QuicError> {
    let first = *data.get(*pos).ok_or(QuicError::PacketTooShort {
        expected: *pos + 1,
        actual: data.len(),
    })?;
    let len = 1usize << (first >> 6);

    let bytes = data
        .get(*pos..*pos + len)
        .ok_or(QuicError::PacketTooShort {
            expected: *pos + len,
            actual: data.len(),
        })?;

    let mut value = u64::from(first & 0x3F);
    for &b in &bytes[1..] {
        value = (value << 8) | u64::from(b);
    }
    *pos += len;
    Ok(value)
}

fn hp_mask(keys: &InitialKeys, sample: &[u8]) -> Result<[u8; 5], QuicError> {
    let hp = HeaderProtectionKey::new(&AES_128, &keys.hp).map_err(|_| QuicError::DecryptFailed {
        reason: "invalid header protection key".into(),
    })?;
    hp.new_mask(sample).map_err(|_| QuicError::DecryptFailed {
        reason: "header protection mask".into(),
    })
}

/// Builds a protected Initial packet around `plaintext` using the client
/// keys for `dcid`. This is the inverse of [`decrypt_initial`], used to
/// construct synthetic packets in tests.
#[cfg(test)]
pub(crate) fn seal_initial(dcid: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let keys = derive_initial_keys(dcid).unwrap();

    // Packet number 0, encoded in one byte (low header bits 00)
    let pn: u8 = 0;
    let payload_len = 1 + plaintext.len() + 16; // pn + body + AEAD tag

    let mut packet = vec![0xC0];
    packet.extend_from_slice(&QUIC_V1.to_be_bytes());
    packet.push(dcid.len() as u8);
    packet.extend_from_slice(dcid);
    packet.push(0); // empty SCID
    packet.push(0); // empty token
    packet.extend_from_slice(&(0x4000u16 | payload_len as u16).to_be_bytes());
    let header_len = packet.len();
    packet.push(pn);

    let mut nonce = keys.iv;
    nonce[11] ^= pn;

    let key = LessSafeKey::new(UnboundKey::new(&AES_128_GCM, &keys.key).unwrap());
    let mut body = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::from(&packet[..]),
        &mut body,
    )
    .unwrap();
    packet.extend_from_slice(&body);

    // Apply header protection
    let sample_start = header_len + 4;
    let sample: [u8; 16] = packet[sample_start..sample_start + 16].try_into().unwrap();
    let mask = hp_mask(&keys, &sample).unwrap();
    packet[0] ^= mask[0] & 0x0F;
    packet[header_len] ^= mask[1];

    packet
}
