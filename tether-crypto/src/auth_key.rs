//! The 256-byte authorization key shared with the server.

use crate::sha1;

/// A negotiated authorization key plus its cached 8-byte identifier.
///
/// The identifier is `SHA1(key)[12..20]` and prefixes every encrypted wire
/// message, letting the server pick the right key before decrypting.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) key_id: [u8; 8],
}

impl AuthKey {
    /// Construct from the raw 256-byte key material.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let sha = sha1!(&data);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, key_id }
    }

    /// The raw 256-byte representation (for persistence or key export).
    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    /// The 8-byte key identifier.
    pub fn key_id(&self) -> [u8; 8] {
        self.key_id
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "AuthKey(id={})", i64::from_le_bytes(self.key_id))
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}
