//! TLS ClientHello extraction from a decrypted Initial payload.
//!
//! CRYPTO frames are reassembled in offset order and the handshake message
//! is parsed directly; QUIC carries handshake messages without the TLS
//! record layer (RFC 9001 §4.1.3), though a leading record header is
//! tolerated. A ClientHello that does not fit in the CRYPTO data of a
//! single Initial fails closed with [`QuicError::HelloIncomplete`].

use bytes::Buf;
use std::io::Cursor;

use crate::error::QuicError;

const FRAME_PADDING: u8 = 0x00;
const FRAME_PING: u8 = 0x01;
const FRAME_ACK: u8 = 0x02;
const FRAME_ACK_ECN: u8 = 0x03;
const FRAME_CRYPTO: u8 = 0x06;

const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0;
const EXTENSION_ALPN: u16 = 16;

/// The parts of a ClientHello the proxy routes on.
#[derive(Debug, Clone, Default)]
pub struct ClientHello {
    /// Server name indication; empty when the client sent none
    pub sni: String,
    /// Offered application protocols, in client preference order
    pub alpn: Vec<String>,
    /// Raw handshake message bytes, kept for forensic use
    pub raw: Vec<u8>,
}

/// Parses the ClientHello out of a decrypted Initial payload.
pub fn parse_client_hello(payload: &[u8]) -> Result<ClientHello, QuicError> {
    let crypto = collect_crypto(payload)?;
    parse_handshake(&crypto)
}

/// Collects CRYPTO frame data from the decrypted frames, reassembled in
/// offset order. Any gap in the stream fails closed.
fn collect_crypto(payload: &[u8]) -> Result<Vec<u8>, QuicError> {
    let mut chunks: Vec<(usize, &[u8])> = Vec::new();
    let mut pos = 0;

    while pos < payload.len() {
        let frame_type = payload[pos];
        pos += 1;

        match frame_type {
            FRAME_PADDING | FRAME_PING => continue,
            FRAME_ACK | FRAME_ACK_ECN => skip_ack(payload, &mut pos, frame_type)?,
            FRAME_CRYPTO => {
                let offset = quic_var_int(payload, &mut pos)? as usize;
                let length = quic_var_int(payload, &mut pos)? as usize;
                let end = pos.checked_add(length).ok_or(QuicError::HelloIncomplete)?;
                let data = payload.get(pos..end).ok_or(QuicError::HelloIncomplete)?;
                pos = end;
                chunks.push((offset, data));
            }
            // Anything else is not expected in a client Initial; stop
            // scanning and work with what was collected.
            _ => break,
        }
    }

    if chunks.is_empty() {
        return Err(QuicError::HelloIncomplete);
    }

    chunks.sort_by_key(|&(offset, _)| offset);

    let mut stream = Vec::new();
    for (offset, data) in chunks {
        if offset > stream.len() {
            // Hole in the CRYPTO stream; the rest of the hello is in a
            // packet we have not decrypted.
            return Err(QuicError::HelloIncomplete);
        }
        if offset + data.len() > stream.len() {
            stream.extend_from_slice(&data[stream.len() - offset..]);
        }
    }

    Ok(stream)
}

/// Skips over an ACK frame's fields.
fn skip_ack(payload: &[u8], pos: &mut usize, frame_type: u8) -> Result<(), QuicError> {
    quic_var_int(payload, pos)?; // largest acknowledged
    quic_var_int(payload, pos)?; // ack delay
    let range_count = quic_var_int(payload, pos)?;
    quic_var_int(payload, pos)?; // first ack range
    for _ in 0..range_count {
        quic_var_int(payload, pos)?; // gap
        quic_var_int(payload, pos)?; // range length
    }
    if frame_type == FRAME_ACK_ECN {
        for _ in 0..3 {
            quic_var_int(payload, pos)?; // ECT0, ECT1, CE counts
        }
    }
    Ok(())
}

fn quic_var_int(data: &[u8], pos: &mut usize) -> Result<u64, QuicError> {
    crate::quic::decrypt::quic_var_int(data, pos).map_err(|_| QuicError::HelloIncomplete)
}

/// Parses the ClientHello handshake message from the reassembled CRYPTO
/// stream.
fn parse_handshake(data: &[u8]) -> Result<ClientHello, QuicError> {
    // Tolerate a TLS record header in front of the handshake message.
    let data = if data.first() == Some(&0x16) && data.len() >= 5 {
        &data[5..]
    } else {
        data
    };

    if data.len() < 4 {
        return Err(QuicError::HelloIncomplete);
    }
    if data[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(QuicError::InvalidClientHello {
            reason: format!("handshake type {:#04x}", data[0]),
        });
    }

    let body_len = ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | data[3] as usize;
    let message_len = 4 + body_len;
    if message_len > data.len() {
        return Err(QuicError::HelloIncomplete);
    }

    let raw = data[..message_len].to_vec();
    let mut body = Cursor::new(&data[4..message_len]);

    // legacy_version + random
    if body.remaining() < 2 + 32 {
        return Err(invalid("truncated version/random"));
    }
    body.advance(2 + 32);

    // legacy_session_id
    if body.remaining() < 1 {
        return Err(invalid("truncated session id"));
    }
    let session_id_len = body.get_u8() as usize;
    if body.remaining() < session_id_len {
        return Err(invalid("truncated session id"));
    }
    body.advance(session_id_len);

    // cipher_suites
    if body.remaining() < 2 {
        return Err(invalid("truncated cipher suites"));
    }
    let cipher_len = body.get_u16() as usize;
    if body.remaining() < cipher_len {
        return Err(invalid("truncated cipher suites"));
    }
    body.advance(cipher_len);

    // legacy_compression_methods
    if body.remaining() < 1 {
        return Err(invalid("truncated compression methods"));
    }
    let compression_len = body.get_u8() as usize;
    if body.remaining() < compression_len {
        return Err(invalid("truncated compression methods"));
    }
    body.advance(compression_len);

    let mut hello = ClientHello {
        raw,
        ..Default::default()
    };

    // extensions are mandatory for TLS 1.3, but a hello without them still
    // parses (with no SNI and no ALPN)
    if body.remaining() < 2 {
        return Ok(hello);
    }
    let ext_total = body.get_u16() as usize;
    if body.remaining() < ext_total {
        return Err(invalid("truncated extensions"));
    }

    let ext_start = body.position() as usize;
    let ext_data = &body.get_ref()[ext_start..ext_start + ext_total];
    let mut ext = Cursor::new(ext_data);

    while ext.remaining() >= 4 {
        let ext_type = ext.get_u16();
        let ext_len = ext.get_u16() as usize;
        if ext.remaining() < ext_len {
            return Err(invalid("truncated extension body"));
        }

        let body_start = ext.position() as usize;
        let ext_body = &ext_data[body_start..body_start + ext_len];
        ext.advance(ext_len);

        match ext_type {
            EXTENSION_SERVER_NAME => {
                if let Some(sni) = parse_sni(ext_body) {
                    hello.sni = sni;
                }
            }
            EXTENSION_ALPN => {
                hello.alpn = parse_alpn(ext_body);
            }
            _ => {}
        }
    }

    Ok(hello)
}

/// server_name extension: u16 list length, then entries of
/// `u8 name_type, u16 length, bytes`. Only host_name (0) entries matter.
fn parse_sni(data: &[u8]) -> Option<String> {
    let mut cur = Cursor::new(data);
    if cur.remaining() < 2 {
        return None;
    }
    let list_len = cur.get_u16() as usize;
    let mut remaining = list_len.min(cur.remaining());

    while remaining >= 3 {
        let name_type = cur.get_u8();
        let name_len = cur.get_u16() as usize;
        remaining = remaining.saturating_sub(3);
        if cur.remaining() < name_len {
            return None;
        }
        let start = cur.position() as usize;
        let name = &data[start..start + name_len];
        cur.advance(name_len);
        remaining = remaining.saturating_sub(name_len);

        if name_type == 0 {
            return String::from_utf8(name.to_vec()).ok();
        }
    }
    None
}

/// application_layer_protocol_negotiation extension: u16 list length, then
/// `u8 length, bytes` entries in client preference order.
fn parse_alpn(data: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    let mut cur = Cursor::new(data);
    if cur.remaining() < 2 {
        return protocols;
    }
    let list_len = cur.get_u16() as usize;
    let mut remaining = list_len.min(cur.remaining());

    while remaining >= 1 {
        let proto_len = cur.get_u8() as usize;
        remaining = remaining.saturating_sub(1);
        if cur.remaining() < proto_len || remaining < proto_len {
            break;
        }
        let start = cur.position() as usize;
        let proto = &data[start..start + proto_len];
        cur.advance(proto_len);
        remaining -= proto_len;

        if let Ok(s) = String::from_utf8(proto.to_vec()) {
            protocols.push(s);
        }
    }
    protocols
}

fn invalid(reason: &str) -> QuicError {
    QuicError::InvalidClientHello {
        reason: reason.to_owned(),
    }
}

/// Builds a minimal TLS 1.3 ClientHello handshake message for tests.
#[cfg(test)]
pub(crate) fn build_client_hello(sni: &str, alpn: &[&str]) -> Vec<u8> {
    let mut exts = Vec::new();

    if !sni.is_empty() {
        let mut sni_body = Vec::new();
        sni_body.extend_from_slice(&((sni.len() + 3) as u16).to_be_bytes());
        sni_body.push(0); // host_name
        sni_body.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        sni_body.extend_from_slice(sni.as_bytes());

        exts.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
        exts.extend_from_slice(&(sni_body.len() as u16).to_be_bytes());
        exts.extend_from_slice(&sni_body);
    }

    if !alpn.is_empty() {
        let mut list = Vec::new();
        for proto in alpn {
            list.push(proto.len() as u8);
            list.extend_from_slice(proto.as_bytes());
        }
        let mut alpn_body = Vec::new();
        alpn_body.extend_from_slice(&(list.len() as u16).to_be_bytes());
        alpn_body.extend_from_slice(&list);

        exts.extend_from_slice(&EXTENSION_ALPN.to_be_bytes());
        exts.extend_from_slice(&(alpn_body.len() as u16).to_be_bytes());
        exts.extend_from_slice(&alpn_body);
    }

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // legacy_version
    body.extend_from_slice(&[0x42; 32]); // random
    body.push(0); // session id
    body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
    body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
    body.push(1); // compression methods
    body.push(0);
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut msg = vec![HANDSHAKE_CLIENT_HELLO];
    msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]); // u24
    msg.extend_from_slice(&body);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto_frame(offset: usize, data: &[u8]) -> Vec<u8> {
        // Two-byte QUIC varints keep the encoding simple for test sizes
        let mut frame = vec![FRAME_CRYPTO];
        frame.extend_from_slice(&(0x4000u16 | offset as u16).to_be_bytes());
        frame.extend_from_slice(&(0x4000u16 | data.len() as u16).to_be_bytes());
        frame.extend_from_slice(data);
        frame
    }

    #[test]
    fn single_crypto_frame() {
        let hello = build_client_hello("play.hytale.com", &["hytale"]);
        let mut payload = crypto_frame(0, &hello);
        payload.extend_from_slice(&[0u8; 40]); // padding frames

        let parsed = parse_client_hello(&payload).unwrap();
        assert_eq!(parsed.sni, "play.hytale.com");
        assert_eq!(parsed.alpn, vec!["hytale"]);
        assert_eq!(parsed.raw, hello);
    }

    #[test]
    fn fragmented_out_of_order_frames() {
        let hello = build_client_hello("lobby.example.com", &["hytale", "h3"]);
        let split = hello.len() / 2;

        let mut payload = crypto_frame(split, &hello[split..]);
        payload.extend_from_slice(&crypto_frame(0, &hello[..split]));

        let parsed = parse_client_hello(&payload).unwrap();
        assert_eq!(parsed.sni, "lobby.example.com");
        assert_eq!(parsed.alpn, vec!["hytale", "h3"]);
    }

    #[test]
    fn gap_fails_closed() {
        let hello = build_client_hello("play.hytale.com", &[]);
        // Second half only: offset 40 with nothing before it
        let payload = crypto_frame(40, &hello[40..]);
        assert!(matches!(
            parse_client_hello(&payload),
            Err(QuicError::HelloIncomplete)
        ));
    }

    #[test]
    fn truncated_hello_fails_closed() {
        let hello = build_client_hello("play.hytale.com", &["hytale"]);
        let payload = crypto_frame(0, &hello[..hello.len() - 10]);
        assert!(matches!(
            parse_client_hello(&payload),
            Err(QuicError::HelloIncomplete)
        ));
    }

    #[test]
    fn no_crypto_frames() {
        let payload = [0u8; 64]; // all padding
        assert!(matches!(
            parse_client_hello(&payload),
            Err(QuicError::HelloIncomplete)
        ));
    }

    #[test]
    fn ack_frames_skipped() {
        let hello = build_client_hello("play.hytale.com", &["hytale"]);
        let mut payload = vec![FRAME_ACK, 0x05, 0x00, 0x00, 0x00]; // one empty range
        payload.push(FRAME_PING);
        payload.extend_from_slice(&crypto_frame(0, &hello));

        let parsed = parse_client_hello(&payload).unwrap();
        assert_eq!(parsed.sni, "play.hytale.com");
    }

    #[test]
    fn not_a_client_hello() {
        let mut msg = vec![0x02]; // ServerHello
        msg.extend_from_slice(&[0, 0, 2, 0xAA, 0xBB]);
        let payload = crypto_frame(0, &msg);
        assert!(matches!(
            parse_client_hello(&payload),
            Err(QuicError::InvalidClientHello { .. })
        ));
    }

    #[test]
    fn record_layer_tolerated() {
        let hello = build_client_hello("play.hytale.com", &[]);
        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
        record.extend_from_slice(&hello);

        let payload = crypto_frame(0, &record);
        let parsed = parse_client_hello(&payload).unwrap();
        assert_eq!(parsed.sni, "play.hytale.com");
    }

    #[test]
    fn no_extensions_yields_empty_fields() {
        let hello = build_client_hello("", &[]);
        let payload = crypto_frame(0, &hello);
        let parsed = parse_client_hello(&payload).unwrap();
        assert_eq!(parsed.sni, "");
        assert!(parsed.alpn.is_empty());
    }

    #[test]
    fn sealed_initial_end_to_end() {
        let hello = build_client_hello("play.hytale.com", &["hytale"]);
        let mut frames = crypto_frame(0, &hello);
        frames.resize(1100, 0); // Initials are padded to at least 1200 bytes

        let dcid = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7];
        let packet = crate::quic::decrypt::seal_initial(&dcid, &frames);

        let initial = crate::quic::decrypt::decrypt_initial(&packet).unwrap();
        let parsed = parse_client_hello(&initial.payload).unwrap();
        assert_eq!(parsed.sni, "play.hytale.com");
        assert_eq!(parsed.alpn, vec!["hytale"]);
    }
}
