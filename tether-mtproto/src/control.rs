//! MTProto service (control) messages.
//!
//! Incoming frames are classified into [`ControlMessage`] by constructor id;
//! anything outside the service schema is handed back as [`ControlMessage::Raw`]
//! for the caller's own TL layer. The handful of service messages the client
//! sends (`msgs_ack`, `msgs_state_info`, `http_wait`, `ping`) get concrete
//! serializable types.

use crate::tl::{self, Cursor, Deserializable, RemoteCall, Serializable, VECTOR_ID};

pub const RPC_RESULT_ID: u32 = 0xf35c6d01;
pub const RPC_ERROR_ID: u32 = 0x2144ca19;
pub const MSG_CONTAINER_ID: u32 = 0x73f1f8dc;
pub const GZIP_PACKED_ID: u32 = 0x3072cfa1;
pub const PONG_ID: u32 = 0x347773c5;
pub const MSGS_ACK_ID: u32 = 0x62d6b459;
pub const BAD_SERVER_SALT_ID: u32 = 0xedab447b;
pub const BAD_MSG_NOTIFICATION_ID: u32 = 0xa7eff811;
pub const NEW_SESSION_CREATED_ID: u32 = 0x9ec20908;
pub const FUTURE_SALTS_ID: u32 = 0xae500895;
pub const MSGS_STATE_REQ_ID: u32 = 0xda69fb52;
pub const MSG_RESEND_REQ_ID: u32 = 0x7d861a08;
pub const MSGS_ALL_INFO_ID: u32 = 0x8cc0d131;
pub const MSG_DETAILED_INFO_ID: u32 = 0x276d3ec6;
pub const MSG_NEW_DETAILED_INFO_ID: u32 = 0x809db6df;
pub const MSGS_STATE_INFO_ID: u32 = 0x04deb57d;
pub const HTTP_WAIT_ID: u32 = 0x9299359f;
pub const PING_ID: u32 = 0x7abe77ec;

/// Constructor ids of the top-level `Updates` family.
const UPDATE_IDS: [u32; 6] = [
    0xe317af7e, // updatesTooLong
    0x313bc7f8, // updateShortMessage
    0x4d6deea5, // updateShortChatMessage
    0x78d4dec1, // updateShort
    0x725b04c3, // updatesCombined
    0x74ae4240, // updates
];

/// Whether `constructor_id` is an update container the session should forward
/// to the update sink rather than correlate with a pending request.
pub fn is_update_like(constructor_id: u32) -> bool {
    UPDATE_IDS.contains(&constructor_id)
}

/// One entry of a `msg_container`.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainedMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

/// One entry of a `future_salts` response.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FutureSalt {
    pub valid_since: i32,
    pub valid_until: i32,
    pub salt: i64,
}

/// A decoded server-side service message.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    /// Answer to a specific request. `body` is the raw result: it may start
    /// with `rpc_error`, `gzip_packed`, or the request's own result type.
    RpcResult { req_msg_id: i64, body: Vec<u8> },
    Container { messages: Vec<ContainedMessage> },
    /// Gzip-compressed payload to inflate and re-classify.
    GzipPacked { data: Vec<u8> },
    Pong(Pong),
    BadServerSalt {
        bad_msg_id: i64,
        bad_seq_no: i32,
        error_code: i32,
        new_salt: i64,
    },
    BadMsgNotification {
        bad_msg_id: i64,
        bad_seq_no: i32,
        error_code: i32,
    },
    NewSessionCreated {
        first_msg_id: i64,
        unique_id: i64,
        server_salt: i64,
    },
    MsgsAck { msg_ids: Vec<i64> },
    FutureSalts {
        req_msg_id: i64,
        now: i32,
        salts: Vec<FutureSalt>,
    },
    /// Server forgot our messages and asks for their state.
    MsgsStateReq { msg_ids: Vec<i64> },
    /// Server asks us to resend the listed messages.
    MsgResendReq { msg_ids: Vec<i64> },
    MsgsAllInfo { msg_ids: Vec<i64>, info: Vec<u8> },
    MsgDetailedInfo {
        msg_id: i64,
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    },
    MsgNewDetailedInfo {
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    },
    MsgsStateInfo { req_msg_id: i64, info: Vec<u8> },
    /// Anything outside the service schema, most notably updates.
    Raw { constructor_id: u32, body: Vec<u8> },
}

impl ControlMessage {
    /// Classify a decrypted message body by its leading constructor id.
    pub fn parse(body: &[u8]) -> tl::Result<Self> {
        let mut cur = Cursor::from_slice(body);
        let id = cur.read_u32()?;
        Ok(match id {
            RPC_RESULT_ID => Self::RpcResult {
                req_msg_id: cur.read_i64()?,
                body: cur.read_rest().to_vec(),
            },
            MSG_CONTAINER_ID => {
                let count = cur.read_i32()?;
                if count < 0 {
                    return Err(tl::Error::UnexpectedEof);
                }
                let mut messages = Vec::with_capacity(count.min(128) as usize);
                for _ in 0..count {
                    let msg_id = cur.read_i64()?;
                    let seq_no = cur.read_i32()?;
                    let len = cur.read_i32()?;
                    if len < 0 {
                        return Err(tl::Error::UnexpectedEof);
                    }
                    let body = cur.read_raw(len as usize)?.to_vec();
                    messages.push(ContainedMessage { msg_id, seq_no, body });
                }
                Self::Container { messages }
            }
            GZIP_PACKED_ID => Self::GzipPacked {
                data: cur.read_bytes()?,
            },
            PONG_ID => Self::Pong(Pong {
                msg_id: cur.read_i64()?,
                ping_id: cur.read_i64()?,
            }),
            BAD_SERVER_SALT_ID => Self::BadServerSalt {
                bad_msg_id: cur.read_i64()?,
                bad_seq_no: cur.read_i32()?,
                error_code: cur.read_i32()?,
                new_salt: cur.read_i64()?,
            },
            BAD_MSG_NOTIFICATION_ID => Self::BadMsgNotification {
                bad_msg_id: cur.read_i64()?,
                bad_seq_no: cur.read_i32()?,
                error_code: cur.read_i32()?,
            },
            NEW_SESSION_CREATED_ID => Self::NewSessionCreated {
                first_msg_id: cur.read_i64()?,
                unique_id: cur.read_i64()?,
                server_salt: cur.read_i64()?,
            },
            MSGS_ACK_ID => Self::MsgsAck {
                msg_ids: cur.read_i64_vec()?,
            },
            FUTURE_SALTS_ID => {
                let req_msg_id = cur.read_i64()?;
                let now = cur.read_i32()?;
                let count = cur.read_i32()?;
                if count < 0 || count as usize * 16 > cur.remaining() {
                    return Err(tl::Error::UnexpectedEof);
                }
                let mut salts = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    salts.push(FutureSalt {
                        valid_since: cur.read_i32()?,
                        valid_until: cur.read_i32()?,
                        salt: cur.read_i64()?,
                    });
                }
                Self::FutureSalts { req_msg_id, now, salts }
            }
            MSGS_STATE_REQ_ID => Self::MsgsStateReq {
                msg_ids: cur.read_i64_vec()?,
            },
            MSG_RESEND_REQ_ID => Self::MsgResendReq {
                msg_ids: cur.read_i64_vec()?,
            },
            MSGS_ALL_INFO_ID => Self::MsgsAllInfo {
                msg_ids: cur.read_i64_vec()?,
                info: cur.read_bytes()?,
            },
            MSG_DETAILED_INFO_ID => Self::MsgDetailedInfo {
                msg_id: cur.read_i64()?,
                answer_msg_id: cur.read_i64()?,
                bytes: cur.read_i32()?,
                status: cur.read_i32()?,
            },
            MSG_NEW_DETAILED_INFO_ID => Self::MsgNewDetailedInfo {
                answer_msg_id: cur.read_i64()?,
                bytes: cur.read_i32()?,
                status: cur.read_i32()?,
            },
            MSGS_STATE_INFO_ID => Self::MsgsStateInfo {
                req_msg_id: cur.read_i64()?,
                info: cur.read_bytes()?,
            },
            other => Self::Raw {
                constructor_id: other,
                body: body.to_vec(),
            },
        })
    }
}

// ─── Client-sent service messages ────────────────────────────────────────────

/// `msgs_ack` — acknowledge received server messages.
#[derive(Clone, Debug)]
pub struct MsgsAck {
    pub msg_ids: Vec<i64>,
}

impl Serializable for MsgsAck {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend(MSGS_ACK_ID.to_le_bytes());
        buf.extend(VECTOR_ID.to_le_bytes());
        buf.extend((self.msg_ids.len() as i32).to_le_bytes());
        for id in &self.msg_ids {
            buf.extend(id.to_le_bytes());
        }
    }
}

/// `msgs_state_info` — our answer to a `msgs_state_req`.
#[derive(Clone, Debug)]
pub struct MsgsStateInfo {
    pub req_msg_id: i64,
    pub info: Vec<u8>,
}

impl Serializable for MsgsStateInfo {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend(MSGS_STATE_INFO_ID.to_le_bytes());
        buf.extend(self.req_msg_id.to_le_bytes());
        tl::write_bytes(buf, &self.info);
    }
}

/// `http_wait` — long-poll tuning sent on the HTTP transport. All values in
/// milliseconds.
#[derive(Clone, Copy, Debug)]
pub struct HttpWait {
    pub max_delay: i32,
    pub wait_after: i32,
    pub max_wait: i32,
}

impl Default for HttpWait {
    fn default() -> Self {
        Self {
            max_delay: 3000,
            wait_after: 500,
            max_wait: 150,
        }
    }
}

impl Serializable for HttpWait {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend(HTTP_WAIT_ID.to_le_bytes());
        buf.extend(self.max_delay.to_le_bytes());
        buf.extend(self.wait_after.to_le_bytes());
        buf.extend(self.max_wait.to_le_bytes());
    }
}

/// `ping` — liveness check answered by a [`Pong`].
#[derive(Clone, Copy, Debug)]
pub struct Ping {
    pub ping_id: i64,
}

impl Serializable for Ping {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend(PING_ID.to_le_bytes());
        buf.extend(self.ping_id.to_le_bytes());
    }
}

/// `pong` — answer to a [`Ping`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pong {
    pub msg_id: i64,
    pub ping_id: i64,
}

impl Deserializable for Pong {
    fn deserialize(cur: &mut Cursor<'_>) -> tl::Result<Self> {
        let id = cur.read_u32()?;
        if id != PONG_ID {
            return Err(tl::Error::UnexpectedConstructor { id });
        }
        Ok(Self {
            msg_id: cur.read_i64()?,
            ping_id: cur.read_i64()?,
        })
    }
}

impl RemoteCall for Ping {
    type Return = Pong;
}
