use tether_crypto::{AuthKey, PrefixBuffer, Side, encrypt_data_v2};
use tether_mtproto::state::SecurityError;
use tether_mtproto::{ControlMessage, MtpState, UnpackError};

fn fixed_key() -> AuthKey {
    let mut data = [0u8; 256];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i * 3 + 1) as u8;
    }
    AuthKey::from_bytes(data)
}

/// Build a server-side frame addressed at `state`, the way a data center
/// would answer us.
fn frame_from_server(state: &MtpState, msg_id: i64, seq_no: i32, body: &[u8]) -> Vec<u8> {
    let mut buf = PrefixBuffer::with_capacity(32 + body.len(), 24);
    buf.extend(0x0123456789abcdefi64.to_le_bytes());
    buf.extend(state.session_id().to_le_bytes());
    buf.extend(msg_id.to_le_bytes());
    buf.extend(seq_no.to_le_bytes());
    buf.extend((body.len() as i32).to_le_bytes());
    buf.extend(body.iter().copied());
    encrypt_data_v2(&mut buf, state.auth_key().unwrap(), Side::Server);
    buf.as_ref().to_vec()
}

#[test]
fn msg_ids_monotonic_within_one_tick() {
    let mut state = MtpState::new();
    // Many ids per clock tick must still be strictly increasing.
    let ids: Vec<i64> = (0..1000).map(|_| state.next_msg_id()).collect();
    for pair in ids.windows(2) {
        assert!(pair[1] > pair[0], "{} !> {}", pair[1], pair[0]);
    }
}

#[test]
fn content_related_seq_nos_are_odd_acks_even() {
    let mut state = MtpState::new();
    for i in 0..20 {
        if i % 3 == 0 {
            assert_eq!(state.next_seq_no(false) % 2, 0);
        } else {
            assert_eq!(state.next_seq_no(true) % 2, 1);
        }
    }
}

#[test]
fn end_to_end_known_key_ten_byte_payload() {
    let key = fixed_key();
    let key_id = key.key_id();

    let mut state = MtpState::new();
    state.set_auth_key(fixed_key());

    let payload = [7u8; 10];
    let mut data = Vec::new();
    state.write_data_as_message(&mut data, &payload, true);
    let wire = state.encrypt_message_data(&data).unwrap();

    assert_eq!(&wire[..8], &key_id, "wire message must lead with the key id");

    // A server holding the same key can recover the payload.
    let mut frame = wire;
    let plaintext =
        tether_crypto::decrypt_data_v2(&mut frame, &key, Side::Client).unwrap();
    let len = u32::from_le_bytes(plaintext[28..32].try_into().unwrap()) as usize;
    assert_eq!(len, 10);
    assert_eq!(&plaintext[32..42], &payload);
}

#[test]
fn second_frame_with_same_msg_id_is_rejected() {
    let mut state = MtpState::new();
    state.set_auth_key(fixed_key());

    let mut pong = Vec::new();
    pong.extend(0x347773c5u32.to_le_bytes());
    pong.extend(1i64.to_le_bytes());
    pong.extend(2i64.to_le_bytes());

    let wire = frame_from_server(&state, 0x6100000001, 3, &pong);

    let mut first = wire.clone();
    let msg = state.decrypt_message_data(&mut first).unwrap();
    assert_eq!(msg.msg_id, 0x6100000001);
    assert!(matches!(
        ControlMessage::parse(&msg.body).unwrap(),
        ControlMessage::Pong(_)
    ));

    let mut replay = wire;
    assert_eq!(
        state.decrypt_message_data(&mut replay),
        Err(UnpackError::Security(SecurityError::ReplayedMsgId))
    );
}

#[test]
fn distinct_msg_ids_pass_the_window() {
    let mut state = MtpState::new();
    state.set_auth_key(fixed_key());

    for i in 0..5i64 {
        let wire = frame_from_server(&state, 0x6100000001 + i * 4, 1, b"body");
        let mut frame = wire;
        assert!(state.decrypt_message_data(&mut frame).is_ok(), "id #{i}");
    }
}
