//! Obfuscated transport layer.
//!
//! Wraps the abridged codec so every byte on the wire looks like random
//! noise. On connect the client sends a 64-byte random header; both ends
//! derive AES-256-CTR keystreams from it (the server from the reversed
//! half) and XOR all subsequent traffic.

use tether_crypto::ObfuscationCipher;

/// Magic prefixes the random header must not collide with, so obfuscated
/// traffic cannot be fingerprinted as another protocol's handshake.
const RESERVED_PREFIXES: [u32; 7] = [
    0x44414548, // "HEAD"
    0x54534f50, // "POST"
    0x20544547, // "GET "
    0x4954504f, // "OPTI"
    0x02010316,
    0xdddddddd,
    0xeeeeeeee,
];

/// Protocol tag for abridged framing inside the obfuscated layer.
const ABRIDGED_TAG: [u8; 4] = [0xef, 0xef, 0xef, 0xef];

/// One direction pair of keystream ciphers plus the header to transmit.
pub struct ObfuscatedLink {
    pub enc: ObfuscationCipher,
    pub dec: ObfuscationCipher,
    /// The 64-byte handshake header, tag portion already self-encrypted.
    pub header: [u8; 64],
}

/// Generate a fresh obfuscation header and the ciphers derived from it.
pub fn initialize() -> ObfuscatedLink {
    let mut header = [0u8; 64];
    loop {
        getrandom::getrandom(&mut header).expect("getrandom failed");
        if is_valid_header(&header) {
            break;
        }
    }
    header[56..60].copy_from_slice(&ABRIDGED_TAG);
    build_link(header)
}

fn build_link(mut header: [u8; 64]) -> ObfuscatedLink {
    let mut enc_key = [0u8; 32];
    let mut enc_iv = [0u8; 16];
    enc_key.copy_from_slice(&header[8..40]);
    enc_iv.copy_from_slice(&header[40..56]);

    // The decrypt direction keys come from the byte-reversed header.
    let mut reversed = header;
    reversed[8..56].reverse();
    let mut dec_key = [0u8; 32];
    let mut dec_iv = [0u8; 16];
    dec_key.copy_from_slice(&reversed[8..40]);
    dec_iv.copy_from_slice(&reversed[40..56]);

    let mut enc = ObfuscationCipher::new(&enc_key, &enc_iv);
    let dec = ObfuscationCipher::new(&dec_key, &dec_iv);

    // The trailing 8 header bytes go out encrypted with our own stream;
    // everything before them is sent as generated.
    let mut encrypted = header;
    enc.apply(&mut encrypted);
    header[56..].copy_from_slice(&encrypted[56..]);

    ObfuscatedLink { enc, dec, header }
}

fn is_valid_header(header: &[u8; 64]) -> bool {
    if header[0] == 0xef {
        return false;
    }
    let first_word = u32::from_le_bytes(header[..4].try_into().unwrap());
    if RESERVED_PREFIXES.contains(&first_word) {
        return false;
    }
    // A zero second word is reserved by the server.
    header[4..8] != [0, 0, 0, 0]
}
