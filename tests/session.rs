use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    sync::mpsc,
    time::{Duration, timeout},
};

use proto::{HEADER_SIZE, PacketHeader, PacketKind, control};
use visor_client::{
    crypto::{KeyExchange, SessionCipher, parse_handshake},
    nat::Path,
    session::{Session, SessionConfig, SessionEvent},
};

fn packet(kind: PacketKind, timestamp: u64, total: u32, index: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    PacketHeader {
        kind,
        timestamp,
        total_fragments: total,
        fragment_index: index,
    }
    .encode(&mut bytes);
    bytes.extend_from_slice(payload);
    bytes.to_vec()
}

/// the host's control endpoint: approves the first registration, then
/// forwards everything else it reads (the disconnect byte included).
async fn run_control_host(listener: TcpListener, seen_tx: mpsc::Sender<Vec<u8>>) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 256];

    // first registration approves the session.
    let size = stream.read(&mut buf).await.unwrap();
    assert_eq!(buf[0], control::REGISTRATION);
    let _ = seen_tx.send(buf[..size].to_vec()).await;
    stream.write_all(&[control::AUTH_RESULT, 0x01]).await.unwrap();

    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(size) => {
                let _ = seen_tx.send(buf[..size].to_vec()).await;
            }
        }
    }
}

#[tokio::test]
async fn direct_session_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::channel(64);
    tokio::spawn(run_control_host(listener, seen_tx));

    // the host's video socket, also the ICE-selected remote endpoint.
    let host_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let host_addr = host_udp.local_addr().unwrap();

    // stand-in for the socket the ICE probe connected.
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut session = Session::start(
        SessionConfig {
            control: control_addr,
            listen_port: 0,
            user_id: "alice".to_string(),
        },
        Path::Direct {
            socket: probe,
            remote: host_addr,
        },
    )
    .await
    .unwrap();

    let client_data: SocketAddr = format!("127.0.0.1:{}", session.data_port()).parse().unwrap();

    // the registration carried the actual data port.
    let registration = timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registration[0], control::REGISTRATION);
    assert_eq!(
        u16::from_be_bytes([registration[1], registration[2]]),
        session.data_port()
    );
    assert_eq!(&registration[3..], b"alice");

    // auth verdict flows through as an event.
    let event = timeout(Duration::from_secs(2), session.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, SessionEvent::AuthResult(true)));

    // handshake: host key out, client echo back, shared cipher on both.
    let host_keys = KeyExchange::generate();
    host_udp
        .send_to(
            &packet(PacketKind::Handshake, 1, 1, 0, &host_keys.handshake_payload()),
            client_data,
        )
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let (size, _) = timeout(Duration::from_secs(2), host_udp.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let (echo_header, echo_payload) = PacketHeader::split(&buf[..size]).unwrap();
    assert_eq!(echo_header.kind, PacketKind::Handshake);
    let client_public = parse_handshake(echo_payload).unwrap();
    let cipher = SessionCipher::new(&host_keys.derive(&client_public).unwrap());

    // parameter sets, then a key-frame fragmented out of order.
    let sps = cipher.encrypt(&[0x67, 0x64, 0x00]).unwrap();
    host_udp
        .send_to(&packet(PacketKind::Sps, 2, 1, 0, &sps), client_data)
        .await
        .unwrap();
    let pps = cipher.encrypt(&[0x68, 0xEE]).unwrap();
    host_udp
        .send_to(&packet(PacketKind::Pps, 3, 1, 0, &pps), client_data)
        .await
        .unwrap();

    let key_frame = {
        let mut annex_b = vec![0, 0, 0, 1, 0x65];
        annex_b.resize(1800, 0xAB);
        annex_b
    };
    let sealed = cipher.encrypt(&key_frame).unwrap();
    let chunk = sealed.len().div_ceil(3);
    let parts: Vec<&[u8]> = sealed.chunks(chunk).collect();
    for index in [2u32, 0, 1] {
        host_udp
            .send_to(
                &packet(PacketKind::KeyFrame, 4, 3, index, parts[index as usize]),
                client_data,
            )
            .await
            .unwrap();
    }

    for expected in [PacketKind::Sps, PacketKind::Pps, PacketKind::KeyFrame] {
        let frame = timeout(Duration::from_secs(2), session.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind, expected);
        if expected == PacketKind::KeyFrame {
            assert_eq!(frame.bytes, key_frame);
        }
    }

    // orderly teardown notifies the host over TCP.
    session.disconnect().await;

    let mut saw_disconnect = false;
    while let Ok(Some(bytes)) = timeout(Duration::from_secs(2), seen_rx.recv()).await {
        if bytes.contains(&control::DISCONNECT) {
            saw_disconnect = true;
            break;
        }
    }
    assert!(saw_disconnect);
}

#[tokio::test]
async fn repeated_loss_triggers_a_key_frame_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = listener.local_addr().unwrap();
    let (seen_tx, _seen_rx) = mpsc::channel(64);
    tokio::spawn(run_control_host(listener, seen_tx));

    let host_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let host_addr = host_udp.local_addr().unwrap();
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let session = Session::start(
        SessionConfig {
            control: control_addr,
            listen_port: 0,
            user_id: "alice".to_string(),
        },
        Path::Direct {
            socket: probe,
            remote: host_addr,
        },
    )
    .await
    .unwrap();

    let client_data: SocketAddr = format!("127.0.0.1:{}", session.data_port()).parse().unwrap();

    // five P-frames that never complete...
    for i in 0..5u64 {
        host_udp
            .send_to(
                &packet(PacketKind::VideoFrame, 1_000_000 * (i + 1), 2, 0, b"half"),
                client_data,
            )
            .await
            .unwrap();
    }

    // ...outlive the direct-mode timeout...
    tokio::time::sleep(Duration::from_millis(300)).await;

    // ...and the next arrival evicts them, firing exactly one `0xFC`.
    host_udp
        .send_to(
            &packet(PacketKind::VideoFrame, 10_000_000, 2, 0, b"half"),
            client_data,
        )
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (size, _) = timeout(Duration::from_secs(2), host_udp.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..size], &[control::KEY_FRAME_REQUEST]);

    session.disconnect().await;
}
