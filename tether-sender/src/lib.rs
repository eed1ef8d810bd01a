//! Async MTProto session engine.
//!
//! A [`Sender`] owns one logical session to a data center: it batches
//! outgoing requests, encrypts them through an [`MtpState`], correlates
//! responses back to callers, and survives transport drops, bad salts and
//! clock skew without losing caller-visible requests.
//!
//! Three cooperating loops run per connection (send, receive, and long-poll
//! on HTTP transports). They communicate only through the packer queues and
//! the pending table, never by calling into each other.

#![deny(unsafe_code)]

pub mod auth_key;
pub mod connection;
pub mod errors;
mod packer;
mod pending;
pub mod request;
pub mod transport;
pub mod transport_http;
pub mod transport_obfuscated;

use std::future::Future;
use std::io::Read;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use tether_crypto::AuthKey;
use tether_mtproto::control::{
    self, ControlMessage, HttpWait, MsgsAck, MsgsStateInfo, GZIP_PACKED_ID, RPC_ERROR_ID,
};
use tether_mtproto::tl::{Cursor, Deserializable, RemoteCall, Serializable};
use tether_mtproto::{MtpState, RawMessage, UnpackError};

pub use auth_key::SharedAuthKey;
pub use connection::{Connection, ConnectionConfig, TransportKind};
pub use errors::{InvocationError, RpcError};
pub use request::RequestState;

use packer::MessagePacker;
use pending::PendingTable;

/// Transport error code the server answers with when it no longer knows our
/// auth key.
const BROKEN_AUTH_KEY_CODE: i32 = -404;

// ─── Configuration ────────────────────────────────────────────────────────────

/// Engine tuning knobs.
#[derive(Clone, Debug)]
pub struct SenderConfig {
    /// Connection attempts per connect/reconnect before giving up.
    pub retries: usize,
    /// Attempts on the main transport before switching to the fallback.
    pub retries_to_fallback: usize,
    /// Pause before re-establishing a dropped connection.
    pub reconnect_delay: Duration,
    /// Reconnect automatically on transport drops.
    pub auto_reconnect: bool,
    /// Exported (secondary DC) sessions report broken keys through
    /// [`Sender::on_connection_break`] instead of breaking the whole client.
    pub exported: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            retries_to_fallback: 2,
            reconnect_delay: Duration::from_secs(1),
            auto_reconnect: true,
            exported: false,
        }
    }
}

/// Externally observable connection state, published on a watch channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// The auth key is no longer valid; re-authentication is required.
    Broken,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum EngineState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Explicit user close; no further auto-reconnect.
    UserDisconnected,
    /// Auth key rejected by the server.
    Broken,
}

/// An update-shaped object forwarded to the external sink.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub constructor_id: u32,
    pub body: Vec<u8>,
}

// ─── Bootstrap handshake collaborators ────────────────────────────────────────

/// Result of the external key-exchange handshake.
pub struct AuthOutcome {
    pub auth_key: [u8; 256],
    pub time_offset: i32,
}

/// One-shot bootstrap handshake, invoked only when no auth key exists yet.
///
/// The handshake itself (the Diffie-Hellman exchange) lives outside this
/// crate; it gets a [`PlainSender`] to talk plaintext MTProto through.
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        sender: &'a mut PlainSender,
    ) -> Pin<Box<dyn Future<Output = Result<AuthOutcome, InvocationError>> + Send + 'a>>;
}

/// Authenticator for sessions whose key is restored externally; fails if the
/// engine ever actually needs a handshake.
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn authenticate<'a>(
        &'a self,
        _sender: &'a mut PlainSender,
    ) -> Pin<Box<dyn Future<Output = Result<AuthOutcome, InvocationError>> + Send + 'a>> {
        Box::pin(async { Err(InvocationError::ConnectionBroken) })
    }
}

/// Plaintext (auth_key_id = 0) request/response channel used exclusively by
/// the bootstrap handshake.
pub struct PlainSender {
    conn: Arc<Connection>,
    last_msg_id: i64,
}

impl PlainSender {
    fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            last_msg_id: 0,
        }
    }

    fn next_msg_id(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut id = ((now.as_secs() << 32) | ((now.subsec_nanos() as u64) << 2)) as i64;
        if id <= self.last_msg_id {
            id = self.last_msg_id + 4;
        }
        self.last_msg_id = id;
        id
    }

    /// Send one plaintext message and await its reply body.
    pub async fn send(&mut self, body: &[u8]) -> Result<Vec<u8>, InvocationError> {
        let mut frame = Vec::with_capacity(20 + body.len());
        frame.extend(0i64.to_le_bytes());
        frame.extend(self.next_msg_id().to_le_bytes());
        frame.extend((body.len() as i32).to_le_bytes());
        frame.extend_from_slice(body);
        self.conn.send(frame)?;

        let reply = self.conn.recv().await.ok_or_else(|| {
            InvocationError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            ))
        })?;
        if reply.len() == 4 {
            let code = i32::from_le_bytes(reply[..4].try_into().unwrap());
            return Err(if code == BROKEN_AUTH_KEY_CODE {
                InvocationError::ConnectionBroken
            } else {
                InvocationError::Deserialize(format!("transport error {code}"))
            });
        }
        if reply.len() < 20 || reply[..8] != [0u8; 8] {
            return Err(InvocationError::Deserialize(
                "malformed plaintext reply".into(),
            ));
        }
        let len = u32::from_le_bytes(reply[16..20].try_into().unwrap()) as usize;
        if reply.len() < 20 + len {
            return Err(InvocationError::Deserialize(
                "truncated plaintext reply".into(),
            ));
        }
        Ok(reply[20..20 + len].to_vec())
    }
}

// ─── Sender ───────────────────────────────────────────────────────────────────

type BreakCallback = Box<dyn Fn(i32) + Send + Sync>;

struct SenderInner {
    config: SenderConfig,
    main_config: ConnectionConfig,
    fallback_config: Option<ConnectionConfig>,
    auth_key: SharedAuthKey,
    mtp: StdMutex<MtpState>,
    packer: MessagePacker,
    long_poll_packer: MessagePacker,
    pending: StdMutex<PendingTable>,
    pending_acks: StdMutex<Vec<i64>>,
    connection: StdMutex<Option<Arc<Connection>>>,
    engine_state: StdMutex<EngineState>,
    conn_state_tx: watch::Sender<ConnectionState>,
    updates_tx: mpsc::UnboundedSender<Update>,
    updates_rx: StdMutex<Option<mpsc::UnboundedReceiver<Update>>>,
    reconnecting: AtomicBool,
    on_connection_break: StdMutex<Option<BreakCallback>>,
}

/// One logical MTProto session. Cheap to clone; all clones share the same
/// session state and loops.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

impl Sender {
    /// Create an engine for `main`, optionally with an HTTP `fallback`
    /// transport used after repeated main-transport failures.
    pub fn new(
        main: ConnectionConfig,
        fallback: Option<ConnectionConfig>,
        config: SenderConfig,
    ) -> Self {
        let (conn_state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SenderInner {
                config,
                main_config: main,
                fallback_config: fallback,
                auth_key: SharedAuthKey::default(),
                mtp: StdMutex::new(MtpState::new()),
                packer: MessagePacker::new(),
                long_poll_packer: MessagePacker::new(),
                pending: StdMutex::new(PendingTable::new()),
                pending_acks: StdMutex::new(Vec::new()),
                connection: StdMutex::new(None),
                engine_state: StdMutex::new(EngineState::Disconnected),
                conn_state_tx,
                updates_tx,
                updates_rx: StdMutex::new(Some(updates_rx)),
                reconnecting: AtomicBool::new(false),
                on_connection_break: StdMutex::new(None),
            }),
        }
    }

    /// Handle to the shared auth key; set it before `connect` to skip the
    /// bootstrap handshake (session restore).
    pub fn auth_key(&self) -> SharedAuthKey {
        self.inner.auth_key.clone()
    }

    /// Subscribe to connection-state transitions.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.conn_state_tx.subscribe()
    }

    /// Take the update stream. Yields `None` after the first call.
    pub fn updates(&self) -> Option<mpsc::UnboundedReceiver<Update>> {
        self.inner.updates_rx.lock().unwrap().take()
    }

    /// Register the broken-key callback for exported sessions.
    pub fn on_connection_break(&self, callback: impl Fn(i32) + Send + Sync + 'static) {
        *self.inner.on_connection_break.lock().unwrap() = Some(Box::new(callback));
    }

    /// Establish the connection and start the engine loops.
    ///
    /// When no auth key is present yet, `authenticator` is run once over a
    /// plaintext channel to produce one. Connecting while already connected
    /// is a no-op.
    pub async fn connect<A: Authenticator>(&self, authenticator: &A) -> Result<(), InvocationError> {
        {
            let mut state = self.inner.engine_state.lock().unwrap();
            if *state == EngineState::Connected {
                return Ok(());
            }
            *state = EngineState::Connecting;
        }

        let conn = establish(&self.inner).await.map_err(InvocationError::Io)?;

        if !self.inner.auth_key.is_set() {
            tracing::info!("no auth key, running bootstrap handshake");
            let mut plain = PlainSender::new(Arc::clone(&conn));
            let outcome = authenticator.authenticate(&mut plain).await?;
            self.inner
                .auth_key
                .set(AuthKey::from_bytes(outcome.auth_key));
            self.inner.mtp.lock().unwrap().time_offset = outcome.time_offset;
        }
        let key = self
            .inner
            .auth_key
            .get()
            .ok_or(InvocationError::ConnectionBroken)?;
        self.inner.mtp.lock().unwrap().set_auth_key(key);

        install(Arc::clone(&self.inner), conn);
        Ok(())
    }

    /// Send serialized request bytes and await the raw result bytes.
    pub async fn send(&self, body: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
        self.send_with_abort(body, None).await
    }

    /// Like [`send`](Self::send), with a caller-supplied abort token. An
    /// aborted request resolves locally without waiting for the server.
    pub async fn send_with_abort(
        &self,
        body: Vec<u8>,
        abort: Option<CancellationToken>,
    ) -> Result<Vec<u8>, InvocationError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .packer
            .enqueue(RequestState::new(body, tx, abort.clone()));
        match abort {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(InvocationError::Aborted),
                result = rx => result.map_err(|_| InvocationError::Dropped)?,
            },
            None => rx.await.map_err(|_| InvocationError::Dropped)?,
        }
    }

    /// Invoke a typed RPC function and deserialize its answer.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<R::Return, InvocationError> {
        let bytes = self.send(request.to_bytes()).await?;
        Ok(R::Return::from_bytes(&bytes)?)
    }

    /// Close the session. Pending requests resolve with
    /// [`InvocationError::Dropped`]; no reconnect is attempted.
    pub fn disconnect(&self) {
        *self.inner.engine_state.lock().unwrap() = EngineState::UserDisconnected;
        if let Some(conn) = self.inner.connection.lock().unwrap().take() {
            conn.disconnect();
        }
        let _ = self
            .inner
            .conn_state_tx
            .send(ConnectionState::Disconnected);
        for mut state in self.inner.pending.lock().unwrap().drain() {
            state.resolve(Err(InvocationError::Dropped));
        }
        tracing::info!("session closed by user");
    }
}

// ─── Connection lifecycle ─────────────────────────────────────────────────────

/// Attempt the configured transports in order until one connects.
async fn establish(inner: &Arc<SenderInner>) -> std::io::Result<Arc<Connection>> {
    let total = (inner.config.retries + inner.config.retries_to_fallback).max(1);
    let mut last_err = std::io::Error::other("no attempts made");
    for attempt in 0..total {
        let config = match &inner.fallback_config {
            Some(fallback) if attempt >= inner.config.retries_to_fallback => fallback,
            _ => &inner.main_config,
        };
        let weak = Arc::downgrade(inner);
        let on_disconnect = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                maybe_reconnect(inner);
            }
        });
        match Connection::connect(config, on_disconnect).await {
            Ok(conn) => return Ok(Arc::new(conn)),
            Err(e) => {
                tracing::warn!(attempt, "connect attempt failed: {e}");
                last_err = e;
                tokio::time::sleep(inner.config.reconnect_delay).await;
            }
        }
    }
    Err(last_err)
}

/// Adopt `conn` as the active connection and start its loops. Any requests
/// left pending from a previous connection are re-queued first, ahead of new
/// work.
fn install(inner: Arc<SenderInner>, conn: Arc<Connection>) {
    *inner.connection.lock().unwrap() = Some(Arc::clone(&conn));
    *inner.engine_state.lock().unwrap() = EngineState::Connected;
    let _ = inner.conn_state_tx.send(ConnectionState::Connected);

    let carried = inner.pending.lock().unwrap().drain();
    if !carried.is_empty() {
        tracing::info!(count = carried.len(), "re-queueing requests from previous connection");
        inner.packer.prepend(carried);
    }

    tokio::spawn(send_loop(Arc::clone(&inner), Arc::clone(&conn)));
    tokio::spawn(recv_loop(Arc::clone(&inner), Arc::clone(&conn)));
    if conn.should_long_poll() {
        tokio::spawn(long_poll_loop(inner, conn));
    }
}

fn is_current(inner: &SenderInner, conn: &Arc<Connection>) -> bool {
    inner
        .connection
        .lock()
        .unwrap()
        .as_ref()
        .is_some_and(|active| Arc::ptr_eq(active, conn))
}

/// Kick off a reconnect unless one is already running or the session ended.
fn maybe_reconnect(inner: Arc<SenderInner>) {
    {
        let state = inner.engine_state.lock().unwrap();
        if matches!(
            *state,
            EngineState::UserDisconnected | EngineState::Broken
        ) {
            return;
        }
    }
    if !inner.config.auto_reconnect {
        // Tear down so a later explicit `connect` can start over; pending
        // requests stay in the table and are re-queued on install.
        {
            let mut state = inner.engine_state.lock().unwrap();
            if *state != EngineState::Connected {
                return;
            }
            *state = EngineState::Disconnected;
        }
        if let Some(old) = inner.connection.lock().unwrap().take() {
            old.disconnect();
        }
        inner.mtp.lock().unwrap().reset();
        inner.pending_acks.lock().unwrap().clear();
        let _ = inner.conn_state_tx.send(ConnectionState::Disconnected);
        tracing::info!("transport lost, waiting for an explicit reconnect");
        return;
    }
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(reconnect_task(inner));
}

async fn reconnect_task(inner: Arc<SenderInner>) {
    *inner.engine_state.lock().unwrap() = EngineState::Reconnecting;
    let _ = inner.conn_state_tx.send(ConnectionState::Disconnected);
    tracing::info!("transport lost, reconnecting");

    tokio::time::sleep(inner.config.reconnect_delay).await;
    if let Some(old) = inner.connection.lock().unwrap().take() {
        old.disconnect();
    }
    inner.mtp.lock().unwrap().reset();
    inner.pending_acks.lock().unwrap().clear();

    match establish(&inner).await {
        Ok(conn) => {
            install(Arc::clone(&inner), conn);
            tracing::info!("reconnected");
        }
        Err(e) => {
            tracing::warn!("reconnect failed: {e}");
            *inner.engine_state.lock().unwrap() = EngineState::Disconnected;
            let _ = inner.conn_state_tx.send(ConnectionState::Broken);
            for mut state in inner.pending.lock().unwrap().drain() {
                state.resolve(Err(InvocationError::Dropped));
            }
        }
    }
    inner.reconnecting.store(false, Ordering::SeqCst);
}

/// Classify a `-404` transport code: the server no longer knows our key.
fn on_broken_key(inner: &Arc<SenderInner>, conn: &Arc<Connection>) {
    tracing::error!("server reports unknown auth key");
    *inner.engine_state.lock().unwrap() = EngineState::Broken;
    conn.disconnect();

    let dc_id = inner.main_config.dc_id;
    let callback = inner.on_connection_break.lock().unwrap();
    if inner.config.exported {
        if let Some(callback) = callback.as_ref() {
            callback(dc_id);
        }
    } else {
        let _ = inner.conn_state_tx.send(ConnectionState::Broken);
    }
    drop(callback);

    for mut state in inner.pending.lock().unwrap().drain() {
        state.resolve(Err(InvocationError::ConnectionBroken));
    }
}

// ─── Send loop ────────────────────────────────────────────────────────────────

/// Convert accumulated server msg ids into one batched `msgs_ack` request.
fn flush_acks(inner: &SenderInner) {
    let msg_ids: Vec<i64> = std::mem::take(&mut *inner.pending_acks.lock().unwrap());
    if msg_ids.is_empty() {
        return;
    }
    tracing::trace!(count = msg_ids.len(), "flushing acknowledgements");
    let ack = MsgsAck { msg_ids };
    inner
        .packer
        .enqueue(RequestState::detached(ack.to_bytes(), false));
}

async fn send_loop(inner: Arc<SenderInner>, conn: Arc<Connection>) {
    let closed = conn.closed();
    loop {
        flush_acks(&inner);
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = inner.packer.wait() => {}
        }
        if !is_current(&inner, &conn) {
            return;
        }
        flush_acks(&inner);

        let batch = {
            let mut mtp = inner.mtp.lock().unwrap();
            inner.packer.pop_batch(&mut mtp)
        };
        let Some(batch) = batch else { continue };

        let wire = {
            let mtp = inner.mtp.lock().unwrap();
            mtp.encrypt_message_data(&batch.data)
        };
        let wire = match wire {
            Ok(wire) => wire,
            Err(_) => {
                // Key not installed yet; park until the handshake finishes.
                inner.packer.prepend(batch.states);
                let key = inner.auth_key.wait_ready().await;
                inner.mtp.lock().unwrap().set_auth_key(key);
                continue;
            }
        };

        // Register before transmitting so a fast response always finds its
        // entry.
        {
            let mut pending = inner.pending.lock().unwrap();
            for state in batch.states {
                if state.wants_response() {
                    pending.insert(state);
                } else if state.constructor_id() == Some(control::MSGS_ACK_ID) {
                    pending.note_ack(state);
                }
            }
        }

        if let Err(e) = conn.send(wire) {
            tracing::warn!("transmit failed: {e}");
            maybe_reconnect(inner);
            return;
        }
    }
}

// ─── Receive loop ─────────────────────────────────────────────────────────────

async fn recv_loop(inner: Arc<SenderInner>, conn: Arc<Connection>) {
    loop {
        let Some(mut frame) = conn.recv().await else {
            if is_current(&inner, &conn) {
                maybe_reconnect(inner);
            }
            return;
        };

        let decrypted = inner.mtp.lock().unwrap().decrypt_message_data(&mut frame);
        match decrypted {
            Ok(raw) => process_message(&inner, &conn, raw, true),
            Err(UnpackError::InvalidBuffer {
                code: Some(BROKEN_AUTH_KEY_CODE),
            }) => {
                on_broken_key(&inner, &conn);
                return;
            }
            Err(UnpackError::InvalidBuffer { code }) => {
                tracing::warn!(?code, "dropping malformed frame");
            }
            Err(UnpackError::MissingAuthKey) => {
                tracing::warn!("frame received before auth key was installed, dropped");
            }
            Err(UnpackError::Security(e)) => {
                tracing::warn!("security check failed ({e}), frame dropped");
            }
        }
    }
}

/// Dispatch one decrypted message. `note_ack` is false when re-dispatching
/// an inflated gzip payload that was already acknowledged under its own id.
fn process_message(
    inner: &Arc<SenderInner>,
    conn: &Arc<Connection>,
    raw: RawMessage,
    note_ack: bool,
) {
    if note_ack {
        inner.pending_acks.lock().unwrap().push(raw.msg_id);
        inner.packer.wake();
    }

    let message = match ControlMessage::parse(&raw.body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(msg_id = raw.msg_id, "unparseable message ({e}), skipped");
            return;
        }
    };

    match message {
        ControlMessage::RpcResult { req_msg_id, body } => {
            handle_rpc_result(inner, conn, req_msg_id, body)
        }
        ControlMessage::Container { messages } => {
            for inner_msg in messages {
                process_message(
                    inner,
                    conn,
                    RawMessage {
                        msg_id: inner_msg.msg_id,
                        seq_no: inner_msg.seq_no,
                        body: inner_msg.body,
                    },
                    true,
                );
            }
        }
        ControlMessage::GzipPacked { data } => match gunzip(&data) {
            Ok(body) => process_message(inner, conn, RawMessage { body, ..raw }, false),
            Err(e) => tracing::warn!("bad gzip payload ({e}), skipped"),
        },
        ControlMessage::Pong(pong) => {
            if let Some(mut state) = inner.pending.lock().unwrap().take(pong.msg_id) {
                state.resolve(Ok(raw.body));
            }
        }
        ControlMessage::BadServerSalt {
            bad_msg_id,
            new_salt,
            ..
        } => {
            tracing::info!(bad_msg_id, "bad server salt, updating and resending");
            inner.mtp.lock().unwrap().salt = new_salt;
            let states = inner.pending.lock().unwrap().pop_states(bad_msg_id);
            inner.packer.prepend(states);
        }
        ControlMessage::BadMsgNotification {
            bad_msg_id,
            error_code,
            ..
        } => handle_bad_msg(inner, raw.msg_id, bad_msg_id, error_code),
        ControlMessage::NewSessionCreated { server_salt, .. } => {
            tracing::debug!("new session created by server");
            inner.mtp.lock().unwrap().salt = server_salt;
        }
        ControlMessage::MsgsAck { msg_ids } => {
            tracing::trace!(count = msg_ids.len(), "server acknowledged messages");
        }
        ControlMessage::FutureSalts { req_msg_id, .. } => {
            if let Some(mut state) = inner.pending.lock().unwrap().take(req_msg_id) {
                state.resolve(Ok(raw.body));
            }
        }
        ControlMessage::MsgsStateReq { msg_ids } | ControlMessage::MsgResendReq { msg_ids } => {
            // The server forgot about us (or wants a resend we can't do
            // post-reset); report every message as unknown.
            let info = MsgsStateInfo {
                req_msg_id: raw.msg_id,
                info: vec![1; msg_ids.len()],
            };
            inner
                .packer
                .enqueue(RequestState::detached(info.to_bytes(), false));
        }
        ControlMessage::MsgsAllInfo { msg_ids, .. } => {
            tracing::debug!(count = msg_ids.len(), "received msgs_all_info");
        }
        ControlMessage::MsgDetailedInfo { answer_msg_id, .. }
        | ControlMessage::MsgNewDetailedInfo { answer_msg_id, .. } => {
            inner.pending_acks.lock().unwrap().push(answer_msg_id);
            inner.packer.wake();
        }
        ControlMessage::MsgsStateInfo { req_msg_id, .. } => {
            if let Some(mut state) = inner.pending.lock().unwrap().take(req_msg_id) {
                state.resolve(Ok(raw.body));
            }
        }
        ControlMessage::Raw {
            constructor_id,
            body,
        } => {
            if control::is_update_like(constructor_id) {
                if inner.mtp.lock().unwrap().check_update_freshness(raw.msg_id) {
                    let _ = inner.updates_tx.send(Update {
                        constructor_id,
                        body,
                    });
                } else {
                    tracing::warn!(constructor_id, "stale update dropped");
                }
            } else {
                tracing::info!(constructor_id, "unknown constructor, skipped");
            }
        }
    }
}

fn handle_rpc_result(
    inner: &Arc<SenderInner>,
    conn: &Arc<Connection>,
    req_msg_id: i64,
    body: Vec<u8>,
) {
    let state = inner.pending.lock().unwrap().take(req_msg_id);
    let Some(mut state) = state else {
        // HTTP long-poll legitimately re-delivers results; elsewhere an
        // unmatched result means we lost track of something.
        if conn.should_long_poll() {
            tracing::debug!(req_msg_id, "duplicate rpc result on long-poll, ignored");
        } else {
            tracing::warn!(req_msg_id, "rpc result for unknown request");
        }
        return;
    };
    state.resolve(interpret_rpc_body(body));
}

/// An `rpc_result` body is either an `rpc_error`, a gzip-wrapped result, or
/// the result bytes themselves.
fn interpret_rpc_body(body: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
    let mut cur = Cursor::from_slice(&body);
    match cur.read_u32() {
        Ok(RPC_ERROR_ID) => {
            let code = cur.read_i32()?;
            let message = String::from_utf8_lossy(&cur.read_bytes()?).into_owned();
            Err(InvocationError::Rpc(RpcError::from_wire(code, &message)))
        }
        Ok(GZIP_PACKED_ID) => {
            let packed = cur.read_bytes()?;
            gunzip(&packed).map_err(|e| InvocationError::Deserialize(e.to_string()))
        }
        _ => Ok(body),
    }
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn handle_bad_msg(inner: &Arc<SenderInner>, notification_msg_id: i64, bad_msg_id: i64, code: i32) {
    match code {
        16 | 17 => {
            // Our msg ids are too far off the server clock.
            let offset = inner
                .mtp
                .lock()
                .unwrap()
                .update_time_offset(notification_msg_id);
            tracing::info!(code, offset, "clock skew corrected");
        }
        32 => inner.mtp.lock().unwrap().adjust_sequence(64),
        33 => inner.mtp.lock().unwrap().adjust_sequence(-16),
        _ => {
            tracing::warn!(code, bad_msg_id, "unrecoverable bad_msg_notification");
            for mut state in inner.pending.lock().unwrap().pop_states(bad_msg_id) {
                state.resolve(Err(InvocationError::BadMessage { code }));
            }
            return;
        }
    }
    let states = inner.pending.lock().unwrap().pop_states(bad_msg_id);
    inner.packer.prepend(states);
}

// ─── Long-poll loop ───────────────────────────────────────────────────────────

/// Keeps a request parked server-side on HTTP transports by sending
/// `http_wait` whenever the long-poll queue runs dry.
async fn long_poll_loop(inner: Arc<SenderInner>, conn: Arc<Connection>) {
    let closed = conn.closed();
    let wait = HttpWait::default();
    loop {
        if !is_current(&inner, &conn) {
            return;
        }
        inner
            .long_poll_packer
            .enqueue(RequestState::detached(wait.to_bytes(), false));

        let batch = {
            let mut mtp = inner.mtp.lock().unwrap();
            inner.long_poll_packer.pop_batch(&mut mtp)
        };
        if let Some(batch) = batch {
            let wire = {
                let mtp = inner.mtp.lock().unwrap();
                mtp.encrypt_message_data(&batch.data)
            };
            match wire {
                Ok(wire) => {
                    if let Err(e) = conn.send(wire) {
                        tracing::warn!("long-poll transmit failed: {e}");
                        maybe_reconnect(inner);
                        return;
                    }
                }
                Err(_) => {
                    let key = inner.auth_key.wait_ready().await;
                    inner.mtp.lock().unwrap().set_auth_key(key);
                    continue;
                }
            }
        }

        tokio::select! {
            _ = closed.cancelled() => return,
            _ = inner.long_poll_packer.wait() => {}
            _ = tokio::time::sleep(Duration::from_millis(wait.max_delay as u64)) => {}
        }
    }
}
