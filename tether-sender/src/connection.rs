//! A framed connection to one data center.
//!
//! The connection owns an outgoing and an incoming frame queue and two pump
//! tasks that move whole frames between those queues and the transport. The
//! engine loops never touch the socket directly, so a reconnect can swap the
//! whole connection out from under them.

use std::io;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_crypto::ObfuscationCipher;

use crate::transport::{self, INIT_BYTE};
use crate::transport_http::HttpLink;
use crate::transport_obfuscated;

/// Which framing strategy a connection runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TransportKind {
    Abridged,
    Obfuscated,
    Http,
}

/// Everything needed to build a fresh transport with the same shape, kept as
/// a plain value so a reconnect can clone it instead of reaching into a dead
/// connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub ip: String,
    pub port: u16,
    pub dc_id: i32,
    pub kind: TransportKind,
}

impl ConnectionConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

type DisconnectCallback = Box<dyn FnOnce() + Send + 'static>;

/// Fires the disconnect callback at most once, no matter how many pump
/// paths race to report the teardown.
#[derive(Clone)]
struct DisconnectOnce {
    slot: Arc<StdMutex<Option<DisconnectCallback>>>,
}

impl DisconnectOnce {
    fn new(callback: DisconnectCallback) -> Self {
        Self {
            slot: Arc::new(StdMutex::new(Some(callback))),
        }
    }

    fn fire(&self) {
        let callback = self.slot.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// An established connection with its pump tasks running.
pub struct Connection {
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    in_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    shutdown: CancellationToken,
    long_poll: bool,
}

impl Connection {
    /// Connect per `config` and start the pump tasks. `on_disconnect` is
    /// invoked exactly once when the connection terminates for any reason.
    pub async fn connect(
        config: &ConnectionConfig,
        on_disconnect: DisconnectCallback,
    ) -> io::Result<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let notifier = DisconnectOnce::new(on_disconnect);

        match config.kind {
            TransportKind::Abridged => {
                let stream = TcpStream::connect(config.addr()).await?;
                let (reader, writer) = stream.into_split();
                tokio::spawn(write_pump(
                    writer,
                    out_rx,
                    shutdown.clone(),
                    notifier.clone(),
                    None,
                    None,
                ));
                tokio::spawn(read_pump(reader, in_tx, shutdown.clone(), notifier, None));
            }
            TransportKind::Obfuscated => {
                let stream = TcpStream::connect(config.addr()).await?;
                let (reader, writer) = stream.into_split();
                let link = transport_obfuscated::initialize();
                tokio::spawn(write_pump(
                    writer,
                    out_rx,
                    shutdown.clone(),
                    notifier.clone(),
                    Some(link.enc),
                    Some(link.header),
                ));
                tokio::spawn(read_pump(
                    reader,
                    in_tx,
                    shutdown.clone(),
                    notifier,
                    Some(link.dec),
                ));
            }
            TransportKind::Http => {
                let link = HttpLink::new(config);
                tokio::spawn(http_pump(link, out_rx, in_tx, shutdown.clone(), notifier));
            }
        }

        tracing::debug!(addr = %config.addr(), kind = ?config.kind, "connection established");
        Ok(Self {
            out_tx,
            in_rx: tokio::sync::Mutex::new(in_rx),
            shutdown,
            long_poll: config.kind == TransportKind::Http,
        })
    }

    /// Queue one wire frame for transmission.
    pub fn send(&self, frame: Vec<u8>) -> io::Result<()> {
        self.out_tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))
    }

    /// Next incoming frame, or `None` once the connection has terminated.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.in_rx.lock().await.recv().await
    }

    /// Tear the connection down. Idempotent; the disconnect callback still
    /// fires exactly once.
    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled when this connection terminates, for loops that need
    /// to stop waiting on a dead transport.
    pub fn closed(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether the engine must run the dedicated long-poll loop.
    pub fn should_long_poll(&self) -> bool {
        self.long_poll
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_pump(
    mut writer: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
    notifier: DisconnectOnce,
    mut cipher: Option<ObfuscationCipher>,
    obfuscation_header: Option<[u8; 64]>,
) {
    let result: io::Result<()> = async {
        match obfuscation_header {
            Some(header) => writer.write_all(&header).await?,
            None => writer.write_all(&[INIT_BYTE]).await?,
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    let mut packet = transport::encode_packet(&frame);
                    if let Some(cipher) = cipher.as_mut() {
                        cipher.apply(&mut packet);
                    }
                    writer.write_all(&packet).await?;
                    writer.flush().await?;
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        tracing::warn!("write pump terminated: {e}");
    }
    shutdown.cancel();
    notifier.fire();
}

async fn read_pump(
    mut reader: OwnedReadHalf,
    in_tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
    notifier: DisconnectOnce,
    mut cipher: Option<ObfuscationCipher>,
) {
    let result: io::Result<()> = async {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                frame = read_one(&mut reader, &mut cipher) => {
                    if in_tx.send(frame?).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        tracing::warn!("read pump terminated: {e}");
    }
    shutdown.cancel();
    notifier.fire();
}

async fn read_one(
    reader: &mut OwnedReadHalf,
    cipher: &mut Option<ObfuscationCipher>,
) -> io::Result<Vec<u8>> {
    let Some(cipher) = cipher else {
        return transport::read_frame(reader).await;
    };
    let mut marker = [0u8; 1];
    reader.read_exact(&mut marker).await?;
    cipher.apply(&mut marker);
    let words = if marker[0] < 0x7f {
        marker[0] as usize
    } else {
        let mut ext = [0u8; 3];
        reader.read_exact(&mut ext).await?;
        cipher.apply(&mut ext);
        ext[0] as usize | (ext[1] as usize) << 8 | (ext[2] as usize) << 16
    };
    let mut frame = vec![0u8; words * 4];
    reader.read_exact(&mut frame).await?;
    cipher.apply(&mut frame);
    Ok(frame)
}

async fn http_pump(
    link: HttpLink,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    in_tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
    notifier: DisconnectOnce,
) {
    let result: io::Result<()> = async {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    let body = link.roundtrip(frame).await?;
                    if !body.is_empty() && in_tx.send(body).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        tracing::warn!("http pump terminated: {e}");
    }
    shutdown.cancel();
    notifier.fire();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn local_config(port: u16, kind: TransportKind) -> ConnectionConfig {
        ConnectionConfig {
            ip: "127.0.0.1".into(),
            port,
            dc_id: 2,
            kind,
        }
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut init = [0u8; 1];
            socket.read_exact(&mut init).await.unwrap();
            assert_eq!(init[0], INIT_BYTE);

            let frame = transport::read_frame(&mut socket).await.unwrap();
            assert_eq!(frame, [5u8; 8]);
            transport::write_frame(&mut socket, &[6u8; 4]).await.unwrap();
        });

        let conn = Connection::connect(
            &local_config(port, TransportKind::Abridged),
            Box::new(|| {}),
        )
        .await
        .unwrap();
        conn.send(vec![5u8; 8]).unwrap();
        assert_eq!(conn.recv().await.unwrap(), [6u8; 4]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_callback_fires_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and immediately drop the socket.
            let _ = listener.accept().await;
        });

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let conn = Connection::connect(
            &local_config(port, TransportKind::Abridged),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        // Remote drop ends the read pump; local disconnects race with it.
        assert!(conn.recv().await.is_none());
        conn.disconnect();
        conn.disconnect();
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
