//! Cryptographic primitives for the MTProto 2.0 session engine.
//!
//! Provides:
//! - AES-256-IGE and AES-256-CTR
//! - SHA-1 / SHA-256 hash macros
//! - [`AuthKey`], the 256-byte session key with cached identifier
//! - MTProto 2.0 message encryption / decryption for either direction

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod prefix_buffer;
mod sha;

pub use aes::ObfuscationCipher;
pub use auth_key::AuthKey;
pub use prefix_buffer::PrefixBuffer;

// ─── MTProto 2.0 encrypt / decrypt ───────────────────────────────────────────

/// Errors from [`decrypt_data_v2`].
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match our key.
    AuthKeyMismatch,
    /// The `msg_key` in the ciphertext does not match our computed value.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}
impl std::error::Error for DecryptError {}

/// Which end of the connection originated a message.
///
/// Selects the `x` offset in the MTProto 2.0 key-derivation table. The
/// engine always encrypts as [`Side::Client`]; [`Side::Server`] exists for
/// decryption and for test harnesses that emulate the server.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn x(&self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..40 + x + 36], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

/// Random padding size: at least 12 bytes, bringing the total to a multiple
/// of 16.
fn padding_len(len: usize) -> usize {
    (16 - (len + 12) % 16) % 16 + 12
}

/// Encrypt `buffer` in place (with prepended header) using MTProto 2.0.
///
/// After this call `buffer` contains `key_id || msg_key || ciphertext`.
/// `side` is the originator of the message; a client engine passes
/// [`Side::Client`].
pub fn encrypt_data_v2(buffer: &mut PrefixBuffer, auth_key: &AuthKey, side: Side) {
    let mut rnd = [0u8; 32];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    do_encrypt_data_v2(buffer, auth_key, side, &rnd);
}

fn do_encrypt_data_v2(buffer: &mut PrefixBuffer, auth_key: &AuthKey, side: Side, rnd: &[u8; 32]) {
    let pad = padding_len(buffer.len());
    buffer.extend(rnd.iter().cycle().take(pad).copied());

    let x = side.x();
    let msg_key_large = sha256!(&auth_key.data[88 + x..88 + x + 32], buffer.as_ref());
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&msg_key_large[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_encrypt(buffer.as_mut(), &key, &iv);

    buffer.push_front(&msg_key);
    buffer.push_front(&auth_key.key_id);
}

/// Decrypt an MTProto 2.0 ciphertext produced by `side`.
///
/// `buffer` must start with `key_id || msg_key || ciphertext`. On success
/// returns a slice of `buffer` containing the plaintext (padding included;
/// the session layer trims it via the inner length field).
pub fn decrypt_data_v2<'a>(
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
    side: Side,
) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_decrypt(&mut buffer[24..], &key, &iv);

    let x = side.x();
    let our_key = sha256!(&auth_key.data[88 + x..88 + x + 32], &buffer[24..]);
    if msg_key != our_key[8..24] {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AuthKey {
        let mut data = [0u8; 256];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        AuthKey::from_bytes(data)
    }

    #[test]
    fn padding_is_at_least_12_and_aligns() {
        for len in 0..128 {
            let pad = padding_len(len);
            assert!(pad >= 12, "len={len} pad={pad}");
            assert!(pad < 28);
            assert_eq!((len + pad) % 16, 0, "len={len} pad={pad}");
        }
    }

    #[test]
    fn encrypt_then_decrypt_same_side() {
        let key = test_key();
        let payload = b"the quick brown fox".to_vec();

        let mut buf = PrefixBuffer::with_capacity(payload.len(), 24);
        buf.extend(payload.iter().copied());
        encrypt_data_v2(&mut buf, &key, Side::Client);

        let mut wire = buf.as_ref().to_vec();
        assert_eq!(&wire[..8], &key.key_id());

        let plain = decrypt_data_v2(&mut wire, &key, Side::Client).unwrap();
        assert_eq!(&plain[..payload.len()], &payload[..]);
    }

    #[test]
    fn sides_are_not_interchangeable() {
        let key = test_key();
        let mut buf = PrefixBuffer::with_capacity(16, 24);
        buf.extend([0u8; 16]);
        encrypt_data_v2(&mut buf, &key, Side::Client);

        let mut wire = buf.as_ref().to_vec();
        assert_eq!(
            decrypt_data_v2(&mut wire, &key, Side::Server),
            Err(DecryptError::MessageKeyMismatch)
        );
    }

    #[test]
    fn short_or_misaligned_buffers_rejected() {
        let key = test_key();
        let mut short = vec![0u8; 20];
        assert_eq!(
            decrypt_data_v2(&mut short, &key, Side::Client),
            Err(DecryptError::InvalidBuffer)
        );
        let mut misaligned = vec![0u8; 24 + 17];
        assert_eq!(
            decrypt_data_v2(&mut misaligned, &key, Side::Client),
            Err(DecryptError::InvalidBuffer)
        );
    }

    #[test]
    fn wrong_key_id_rejected() {
        let key = test_key();
        let other = AuthKey::from_bytes([0x55u8; 256]);

        let mut buf = PrefixBuffer::with_capacity(4, 24);
        buf.extend([1u8, 2, 3, 4]);
        encrypt_data_v2(&mut buf, &key, Side::Client);

        let mut wire = buf.as_ref().to_vec();
        assert_eq!(
            decrypt_data_v2(&mut wire, &other, Side::Client),
            Err(DecryptError::AuthKeyMismatch)
        );
    }
}
