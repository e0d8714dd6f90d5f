//! QUIC v1 Initial key derivation (RFC 9001 §5.2).
//!
//! Initial keys are derived from the client-chosen Destination Connection
//! ID with HKDF-SHA256 and the fixed v1 salt. The extract step is computed
//! with HMAC directly (HKDF-Extract(salt, ikm) = HMAC(salt, ikm)) so the
//! intermediate secret stays inspectable against the RFC test vectors.

use ring::hkdf::{Prk, HKDF_SHA256};
use ring::hmac;

use crate::error::QuicError;

/// QUIC v1 Initial salt (RFC 9001 §5.2). Fixed by the standard.
pub const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Client-side Initial packet protection keys.
#[derive(Clone)]
pub struct InitialKeys {
    /// AEAD key (AES-128-GCM)
    pub key: [u8; 16],
    /// AEAD initialization vector
    pub iv: [u8; 12],
    /// Header protection key (AES-128)
    pub hp: [u8; 16],
}

/// Computes `initial_secret = HKDF-Extract(salt, dcid)`.
pub fn initial_secret(dcid: &[u8]) -> [u8; 32] {
    let salt = hmac::Key::new(hmac::HMAC_SHA256, &INITIAL_SALT_V1);
    let tag = hmac::sign(&salt, dcid);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(tag.as_ref());
    secret
}

/// Derives the client Initial keys for a connection from its first DCID.
pub fn derive_initial_keys(dcid: &[u8]) -> Result<InitialKeys, QuicError> {
    let initial = Prk::new_less_safe(HKDF_SHA256, &initial_secret(dcid));

    let mut client_secret = [0u8; 32];
    hkdf_expand_label(&initial, b"client in", &mut client_secret)?;
    let client = Prk::new_less_safe(HKDF_SHA256, &client_secret);

    let mut keys = InitialKeys {
        key: [0; 16],
        iv: [0; 12],
        hp: [0; 16],
    };
    hkdf_expand_label(&client, b"quic key", &mut keys.key)?;
    hkdf_expand_label(&client, b"quic iv", &mut keys.iv)?;
    hkdf_expand_label(&client, b"quic hp", &mut keys.hp)?;
    Ok(keys)
}

/// HKDF-Expand-Label (RFC 8446 §7.1) with an empty context, filling `out`.
fn hkdf_expand_label(secret: &Prk, label: &[u8], out: &mut [u8]) -> Result<(), QuicError> {
    // HkdfLabel: u16 length, opaque label<7..255> = "tls13 " + label,
    // opaque context<0..255> = ""
    let mut info = Vec::with_capacity(4 + 6 + label.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(0);

    struct Len(usize);
    impl ring::hkdf::KeyType for Len {
        fn len(&self) -> usize {
            self.0
        }
    }

    let info_slice = [info.as_slice()];
    let okm = secret
        .expand(&info_slice, Len(out.len()))
        .map_err(|_| QuicError::KeyDerivationFailed {
            reason: format!("HKDF-Expand '{}'", String::from_utf8_lossy(label)),
        })?;
    okm.fill(out).map_err(|_| QuicError::KeyDerivationFailed {
        reason: format!("HKDF fill '{}'", String::from_utf8_lossy(label)),
    })
}
