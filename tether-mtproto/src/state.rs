//! MTProto 2.0 session state: crypto, sequencing and replay protection.

use std::collections::VecDeque;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use tether_crypto::{AuthKey, DecryptError, PrefixBuffer, Side, decrypt_data_v2, encrypt_data_v2};

/// How many recently seen server message ids are kept for replay rejection.
const REPLAY_WINDOW: usize = 500;

/// Protocol bounds on the random padding of a decrypted message.
const MIN_PADDING: usize = 12;
const MAX_PADDING: usize = 1024;

/// Tolerated clock drift for incoming updates, in seconds.
const UPDATE_FUTURE_TOLERANCE: i64 = 30;
const UPDATE_PAST_TOLERANCE: i64 = 300;

/// A frame that failed one of the cryptographic or session checks. The frame
/// is dropped; a single occurrence does not invalidate the session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SecurityError {
    /// `auth_key_id` on the wire does not match our key.
    AuthKeyMismatch,
    /// Recomputed `msg_key` differs from the one on the wire.
    MessageKeyMismatch,
    /// The inner `session_id` belongs to a different session.
    SessionIdMismatch,
    /// Server message id was already seen within the replay window.
    ReplayedMsgId,
    /// Padding outside the mandated 12..=1024 byte range.
    BadPaddingLength,
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
            Self::SessionIdMismatch => write!(f, "session_id mismatch"),
            Self::ReplayedMsgId => write!(f, "duplicate server msg_id (replay)"),
            Self::BadPaddingLength => write!(f, "padding length out of range"),
        }
    }
}
impl std::error::Error for SecurityError {}

/// Errors from [`MtpState::decrypt_message_data`].
#[derive(Clone, Debug, PartialEq)]
pub enum UnpackError {
    /// Buffer too short or misaligned. A 4-byte frame carries a transport
    /// error status in `code` (for example `-404` for an unknown auth key).
    InvalidBuffer { code: Option<i32> },
    /// No auth key has been installed yet.
    MissingAuthKey,
    Security(SecurityError),
}

impl fmt::Display for UnpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBuffer { code: Some(code) } => {
                write!(f, "transport-level error: {code}")
            }
            Self::InvalidBuffer { code: None } => write!(f, "invalid message buffer"),
            Self::MissingAuthKey => write!(f, "no auth key installed"),
            Self::Security(e) => write!(f, "security check failed: {e}"),
        }
    }
}
impl std::error::Error for UnpackError {}

impl From<SecurityError> for UnpackError {
    fn from(e: SecurityError) -> Self {
        Self::Security(e)
    }
}

/// The header and body of a successfully decrypted server message.
#[derive(Clone, Debug, PartialEq)]
pub struct RawMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

/// Per-connection MTProto 2.0 session state.
///
/// Owns the auth key, the server salt, the session id and the sequencing
/// counters, and performs message encryption/decryption. All mutation happens
/// through the owning engine; the struct is deliberately not `Clone`.
pub struct MtpState {
    auth_key: Option<AuthKey>,
    session_id: i64,
    sequence: i32,
    last_msg_id: i64,
    seen_msg_ids: VecDeque<i64>,
    /// Current server salt, updated on `bad_server_salt` and
    /// `new_session_created`.
    pub salt: i64,
    /// Clock skew in seconds vs. the server.
    pub time_offset: i32,
}

impl MtpState {
    /// Create a fresh session with a random session id and no auth key.
    pub fn new() -> Self {
        Self {
            auth_key: None,
            session_id: random_session_id(),
            sequence: 0,
            last_msg_id: 0,
            seen_msg_ids: VecDeque::with_capacity(REPLAY_WINDOW),
            salt: 0,
            time_offset: 0,
        }
    }

    /// Install the shared key. Replaces any previous key.
    pub fn set_auth_key(&mut self, key: AuthKey) {
        self.auth_key = Some(key);
    }

    pub fn auth_key(&self) -> Option<&AuthKey> {
        self.auth_key.as_ref()
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Generate the next message id from corrected wall-clock time.
    ///
    /// Strictly greater than every previously issued id, even when the clock
    /// has not advanced since the last call.
    pub fn next_msg_id(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = (now.as_secs() as i64 + self.time_offset as i64) as u64;
        let nanos = now.subsec_nanos() as u64;
        let mut id = ((secs << 32) | (nanos << 2)) as i64;
        if id <= self.last_msg_id {
            id = self.last_msg_id + 4;
        }
        self.last_msg_id = id;
        id
    }

    /// Next sequence number. Content-related messages get `sequence * 2 + 1`
    /// and advance the counter; acks and other service chatter get
    /// `sequence * 2` without advancing it.
    pub fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.sequence * 2 + 1;
            self.sequence += 1;
            n
        } else {
            self.sequence * 2
        }
    }

    /// Append one `msg_id || seq_no || len || body` frame to `buf` and return
    /// the assigned message id. Used both for single messages and for each
    /// entry of a container.
    pub fn write_data_as_message(
        &mut self,
        buf: &mut Vec<u8>,
        body: &[u8],
        content_related: bool,
    ) -> i64 {
        let msg_id = self.next_msg_id();
        let seq_no = self.next_seq_no(content_related);
        buf.extend(msg_id.to_le_bytes());
        buf.extend(seq_no.to_le_bytes());
        buf.extend((body.len() as i32).to_le_bytes());
        buf.extend_from_slice(body);
        msg_id
    }

    /// Encrypt framed message data (`msg_id || seq_no || len || body` as
    /// produced by [`write_data_as_message`](Self::write_data_as_message))
    /// into a wire-ready `key_id || msg_key || ciphertext` buffer.
    pub fn encrypt_message_data(&self, data: &[u8]) -> Result<Vec<u8>, UnpackError> {
        let key = self.auth_key.as_ref().ok_or(UnpackError::MissingAuthKey)?;

        let mut buf = PrefixBuffer::with_capacity(16 + data.len() + 32, 24);
        buf.extend(self.salt.to_le_bytes());
        buf.extend(self.session_id.to_le_bytes());
        buf.extend(data.iter().copied());
        encrypt_data_v2(&mut buf, key, Side::Client);
        Ok(buf.as_ref().to_vec())
    }

    /// Decrypt and validate a server frame.
    ///
    /// Runs every session-level check: length and alignment, auth-key id,
    /// msg-key, session id, replay window, padding bounds. The returned
    /// [`RawMessage`] carries the inner body trimmed to its declared length.
    pub fn decrypt_message_data(&mut self, body: &mut [u8]) -> Result<RawMessage, UnpackError> {
        if body.len() == 4 {
            let code = i32::from_le_bytes(body[..4].try_into().unwrap());
            return Err(UnpackError::InvalidBuffer { code: Some(code) });
        }
        if body.len() < 8 || body.len() % 4 != 0 {
            return Err(UnpackError::InvalidBuffer { code: None });
        }
        let key = self.auth_key.as_ref().ok_or(UnpackError::MissingAuthKey)?;

        let plaintext = decrypt_data_v2(body, key, Side::Server).map_err(|e| match e {
            DecryptError::InvalidBuffer => UnpackError::InvalidBuffer { code: None },
            DecryptError::AuthKeyMismatch => SecurityError::AuthKeyMismatch.into(),
            DecryptError::MessageKeyMismatch => SecurityError::MessageKeyMismatch.into(),
        })?;

        // salt(8) + session_id(8) + msg_id(8) + seq_no(4) + len(4)
        if plaintext.len() < 32 {
            return Err(UnpackError::InvalidBuffer { code: None });
        }
        let session_id = i64::from_le_bytes(plaintext[8..16].try_into().unwrap());
        let msg_id = i64::from_le_bytes(plaintext[16..24].try_into().unwrap());
        let seq_no = i32::from_le_bytes(plaintext[24..28].try_into().unwrap());
        let body_len = u32::from_le_bytes(plaintext[28..32].try_into().unwrap()) as usize;

        if session_id != self.session_id {
            return Err(SecurityError::SessionIdMismatch.into());
        }
        if body_len > plaintext.len() - 32 {
            return Err(UnpackError::InvalidBuffer { code: None });
        }
        let padding = plaintext.len() - 32 - body_len;
        if !(MIN_PADDING..=MAX_PADDING).contains(&padding) {
            return Err(SecurityError::BadPaddingLength.into());
        }
        self.note_msg_id(msg_id)?;

        Ok(RawMessage {
            msg_id,
            seq_no,
            body: plaintext[32..32 + body_len].to_vec(),
        })
    }

    /// Record a server msg id, rejecting duplicates within the window.
    fn note_msg_id(&mut self, msg_id: i64) -> Result<(), SecurityError> {
        if self.seen_msg_ids.contains(&msg_id) {
            return Err(SecurityError::ReplayedMsgId);
        }
        if self.seen_msg_ids.len() == REPLAY_WINDOW {
            self.seen_msg_ids.pop_front();
        }
        self.seen_msg_ids.push_back(msg_id);
        Ok(())
    }

    /// Whether an update carried by `msg_id` is fresh enough to forward:
    /// at most 30 s in the future and 300 s in the past relative to our
    /// corrected clock.
    pub fn check_update_freshness(&self, msg_id: i64) -> bool {
        let sent = (msg_id >> 32) as i64;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
            + self.time_offset as i64;
        sent - now <= UPDATE_FUTURE_TOLERANCE && now - sent <= UPDATE_PAST_TOLERANCE
    }

    /// Recompute `time_offset` from a server-confirmed message id and force
    /// msg-id regeneration. Returns the new offset.
    pub fn update_time_offset(&mut self, correct_msg_id: i64) -> i32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let server_secs = (correct_msg_id >> 32) as i64;
        self.time_offset = (server_secs - now) as i32;
        self.last_msg_id = 0;
        log::debug!("time offset corrected to {}s", self.time_offset);
        self.time_offset
    }

    /// Shift the sequence counter after a server-reported sequence error
    /// (`bad_msg_notification` codes 32 and 33).
    pub fn adjust_sequence(&mut self, delta: i32) {
        self.sequence += delta;
    }

    /// Reset for a reconnect: fresh session id, zeroed counters, cleared
    /// replay window. Salt, auth key and time offset are preserved.
    pub fn reset(&mut self) {
        self.session_id = random_session_id();
        self.sequence = 0;
        self.last_msg_id = 0;
        self.seen_msg_ids.clear();
        log::debug!("session reset, new session_id generated");
    }
}

impl Default for MtpState {
    fn default() -> Self {
        Self::new()
    }
}

fn random_session_id() -> i64 {
    let mut rnd = [0u8; 8];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    i64::from_le_bytes(rnd)
}
