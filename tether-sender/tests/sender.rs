//! Engine tests against a scripted in-process server.
//!
//! The "server" side speaks real abridged framing and MTProto 2.0 crypto
//! (encrypting with the server-direction keys), so these exercise the full
//! send/receive/reconnect paths over a loopback TCP socket.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use tether_crypto::{AuthKey, PrefixBuffer, Side, decrypt_data_v2, encrypt_data_v2};
use tether_mtproto::control::{
    BAD_SERVER_SALT_ID, MSG_CONTAINER_ID, MSGS_ACK_ID, RPC_RESULT_ID,
};
use tether_sender::transport::{read_frame, write_frame};
use tether_sender::{
    ConnectionConfig, NoAuth, Sender, SenderConfig, TransportKind,
};

fn test_key() -> AuthKey {
    let mut data = [0u8; 256];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i * 11 + 3) as u8;
    }
    AuthKey::from_bytes(data)
}

fn config(port: u16) -> ConnectionConfig {
    ConnectionConfig {
        ip: "127.0.0.1".into(),
        port,
        dc_id: 2,
        kind: TransportKind::Abridged,
    }
}

/// One client message as seen by the server.
#[derive(Clone, Debug)]
struct ClientMessage {
    salt: i64,
    session_id: i64,
    msg_id: i64,
    body: Vec<u8>,
}

/// Read one wire frame and decrypt it, expanding containers.
async fn read_client_messages(socket: &mut TcpStream, key: &AuthKey) -> Vec<ClientMessage> {
    let mut frame = read_frame(socket).await.expect("client frame");
    let plaintext = decrypt_data_v2(&mut frame, key, Side::Client).expect("client crypto");

    let salt = i64::from_le_bytes(plaintext[..8].try_into().unwrap());
    let session_id = i64::from_le_bytes(plaintext[8..16].try_into().unwrap());
    let msg_id = i64::from_le_bytes(plaintext[16..24].try_into().unwrap());
    let len = u32::from_le_bytes(plaintext[28..32].try_into().unwrap()) as usize;
    let body = plaintext[32..32 + len].to_vec();

    let top = ClientMessage {
        salt,
        session_id,
        msg_id,
        body,
    };
    if top.body.len() >= 8 && top.body[..4] == MSG_CONTAINER_ID.to_le_bytes() {
        let count = i32::from_le_bytes(top.body[4..8].try_into().unwrap()) as usize;
        let mut out = Vec::with_capacity(count);
        let mut pos = 8;
        for _ in 0..count {
            let msg_id = i64::from_le_bytes(top.body[pos..pos + 8].try_into().unwrap());
            let len =
                i32::from_le_bytes(top.body[pos + 12..pos + 16].try_into().unwrap()) as usize;
            let body = top.body[pos + 16..pos + 16 + len].to_vec();
            out.push(ClientMessage {
                salt,
                session_id,
                msg_id,
                body,
            });
            pos += 16 + len;
        }
        out
    } else {
        vec![top]
    }
}

/// Encrypt and frame one server-side message addressed at `session_id`.
async fn send_server_message(
    socket: &mut TcpStream,
    key: &AuthKey,
    session_id: i64,
    msg_id: i64,
    body: &[u8],
) {
    let mut buf = PrefixBuffer::with_capacity(32 + body.len(), 24);
    buf.extend(0i64.to_le_bytes());
    buf.extend(session_id.to_le_bytes());
    buf.extend(msg_id.to_le_bytes());
    buf.extend(1i32.to_le_bytes());
    buf.extend((body.len() as i32).to_le_bytes());
    buf.extend(body.iter().copied());
    encrypt_data_v2(&mut buf, key, Side::Server);
    write_frame(socket, buf.as_ref()).await.expect("server write");
}

fn rpc_result(req_msg_id: i64, result: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(RPC_RESULT_ID.to_le_bytes());
    body.extend(req_msg_id.to_le_bytes());
    body.extend_from_slice(result);
    body
}

fn bad_server_salt(bad_msg_id: i64, new_salt: i64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(BAD_SERVER_SALT_ID.to_le_bytes());
    body.extend(bad_msg_id.to_le_bytes());
    body.extend(1i32.to_le_bytes());
    body.extend(48i32.to_le_bytes());
    body.extend(new_salt.to_le_bytes());
    body
}

fn is_ack(body: &[u8]) -> bool {
    body.len() >= 4 && body[..4] == MSGS_ACK_ID.to_le_bytes()
}

async fn expect_init_byte(socket: &mut TcpStream) {
    let mut init = [0u8; 1];
    socket.read_exact(&mut init).await.expect("init byte");
    assert_eq!(init[0], 0xef);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_salt_updates_session_and_resends_exactly_once() {
    const NEW_SALT: i64 = 0x1357_9bdf_0246_8ace;
    let request_body = vec![0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4];
    let result_body = vec![0x15, 0xc4, 0xb5, 0x1c, 9, 9, 9, 9];

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let key = test_key();

    let server_req = request_body.clone();
    let server_result = result_body.clone();
    let server_key = key.clone();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        expect_init_byte(&mut socket).await;

        // First delivery of the request.
        let first = loop {
            let messages = read_client_messages(&mut socket, &server_key).await;
            if let Some(m) = messages.into_iter().find(|m| m.body == server_req) {
                break m;
            }
        };

        let mut server_msg_id = 0x5f00_0000_0001i64;
        send_server_message(
            &mut socket,
            &server_key,
            first.session_id,
            server_msg_id,
            &bad_server_salt(first.msg_id, NEW_SALT),
        )
        .await;

        // The resend must carry the new salt.
        let resent = loop {
            let messages = read_client_messages(&mut socket, &server_key).await;
            if let Some(m) = messages.into_iter().find(|m| m.body == server_req) {
                break m;
            }
        };
        assert_ne!(resent.msg_id, first.msg_id, "resend gets a fresh msg id");
        assert_eq!(resent.salt, NEW_SALT, "resend must use the corrected salt");

        server_msg_id += 4;
        send_server_message(
            &mut socket,
            &server_key,
            resent.session_id,
            server_msg_id,
            &rpc_result(resent.msg_id, &server_result),
        )
        .await;

        // Nothing but acks may follow; a third copy of the request would
        // mean it was duplicated.
        loop {
            let read = tokio::time::timeout(
                Duration::from_millis(300),
                read_client_messages(&mut socket, &server_key),
            )
            .await;
            match read {
                Ok(messages) => {
                    for m in &messages {
                        assert!(
                            is_ack(&m.body),
                            "unexpected non-ack after resolution: {:x?}",
                            &m.body[..4]
                        );
                    }
                }
                Err(_) => break,
            }
        }
    });

    let sender = Sender::new(config(port), None, SenderConfig::default());
    sender.auth_key().set(key);
    sender.connect(&NoAuth).await.unwrap();

    let answer = sender.send(request_body).await.unwrap();
    assert_eq!(answer, result_body);

    server.await.unwrap();
    sender.disconnect();
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_connect_recovers_after_drop_without_auto_reconnect() {
    let request_body = vec![0x42u8; 8];
    let result_body = vec![0x99u8; 4];

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let key = test_key();

    let server_req = request_body.clone();
    let server_result = result_body.clone();
    let server_key = key.clone();
    let server = tokio::spawn(async move {
        // First connection: swallow the request, then drop the socket.
        {
            let (mut socket, _) = listener.accept().await.unwrap();
            expect_init_byte(&mut socket).await;
            let _ = read_client_messages(&mut socket, &server_key).await;
        }

        // The request must arrive again on the manually re-dialed
        // connection.
        let (mut socket, _) = listener.accept().await.unwrap();
        expect_init_byte(&mut socket).await;
        let resent = loop {
            let messages = read_client_messages(&mut socket, &server_key).await;
            if let Some(m) = messages.into_iter().find(|m| m.body == server_req) {
                break m;
            }
        };
        send_server_message(
            &mut socket,
            &server_key,
            resent.session_id,
            0x7f00_0000_0001,
            &rpc_result(resent.msg_id, &server_result),
        )
        .await;

        let mut sink = [0u8; 256];
        loop {
            match socket.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let sender = Sender::new(
        config(port),
        None,
        SenderConfig {
            auto_reconnect: false,
            ..SenderConfig::default()
        },
    );
    sender.auth_key().set(key);
    sender.connect(&NoAuth).await.unwrap();

    let in_flight = {
        let sender = sender.clone();
        let body = request_body.clone();
        tokio::spawn(async move { sender.send(body).await })
    };

    // Let the server-side drop land; nothing reconnects on its own.
    tokio::time::sleep(Duration::from_millis(300)).await;
    sender.connect(&NoAuth).await.unwrap();

    let answer = in_flight.await.unwrap().unwrap();
    assert_eq!(answer, result_body);

    sender.disconnect();
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_preserves_three_pending_requests_in_order() {
    let bodies: Vec<Vec<u8>> = (1u8..=3).map(|t| vec![t; 8]).collect();
    let results: Vec<Vec<u8>> = (1u8..=3).map(|t| vec![t + 0x40; 4]).collect();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let key = test_key();

    let server_bodies = bodies.clone();
    let server_results = results.clone();
    let server_key = key.clone();
    let server = tokio::spawn(async move {
        // First connection: swallow one frame, then drop the socket.
        {
            let (mut socket, _) = listener.accept().await.unwrap();
            expect_init_byte(&mut socket).await;
            let _ = read_client_messages(&mut socket, &server_key).await;
        }

        // Second connection: the requests must arrive again, in order.
        let (mut socket, _) = listener.accept().await.unwrap();
        expect_init_byte(&mut socket).await;

        let mut seen: Vec<ClientMessage> = Vec::new();
        while seen.len() < 3 {
            let messages = read_client_messages(&mut socket, &server_key).await;
            seen.extend(messages.into_iter().filter(|m| !is_ack(&m.body)));
        }
        for (i, m) in seen.iter().enumerate() {
            assert_eq!(m.body, server_bodies[i], "request #{i} out of order");
        }

        let mut server_msg_id = 0x6f00_0000_0001i64;
        for (m, result) in seen.iter().zip(&server_results) {
            send_server_message(
                &mut socket,
                &server_key,
                m.session_id,
                server_msg_id,
                &rpc_result(m.msg_id, result),
            )
            .await;
            server_msg_id += 4;
        }

        // Keep the socket alive until the client disconnects.
        let mut sink = [0u8; 256];
        loop {
            match socket.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let sender = Sender::new(
        config(port),
        None,
        SenderConfig {
            reconnect_delay: Duration::from_millis(100),
            ..SenderConfig::default()
        },
    );
    sender.auth_key().set(key);
    sender.connect(&NoAuth).await.unwrap();

    let (a, b, c) = tokio::join!(
        sender.send(bodies[0].clone()),
        sender.send(bodies[1].clone()),
        sender.send(bodies[2].clone()),
    );
    assert_eq!(a.unwrap(), results[0]);
    assert_eq!(b.unwrap(), results[1]);
    assert_eq!(c.unwrap(), results[2]);

    sender.disconnect();
    server.await.unwrap();
}
