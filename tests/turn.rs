use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::{net::UdpSocket, sync::mpsc, time::Duration};

use stun::{
    Decoder, Payload,
    attribute::{
        ChannelNumber, Error as ErrorAttr, ErrorCode, ErrorKind, Lifetime, Nonce, Realm,
        RequestedTransport, XorMappedAddress, XorPeerAddress, XorRelayedAddress,
    },
    channel::ChannelData,
    message::{Message, MessageEncoder, Method, MethodKind},
    util,
};
use visor_client::nat::{TurnClient, TurnConfig, turn::State};

const REALM: &str = "visor.example";
const USERNAME: &str = "visor";
const CREDENTIAL: &str = "secret";

const RELAY: &str = "198.51.100.4:49200";
const PEER: &str = "203.0.113.9:5000";

struct MockTurnServer {
    socket: UdpSocket,
    nonce: &'static str,
    /// answer the first authenticated allocate with 438 Stale Nonce.
    stale_nonce_once: bool,
}

impl MockTurnServer {
    fn auth(&self) -> [u8; 16] {
        util::long_key(USERNAME, CREDENTIAL, REALM)
    }

    async fn recv(&self, buf: &mut [u8]) -> (usize, SocketAddr) {
        self.socket.recv_from(buf).await.unwrap()
    }

    async fn respond(&self, bytes: &BytesMut, to: SocketAddr) {
        self.socket.send_to(bytes, to).await.unwrap();
    }

    /// the scripted server side: 401 challenge, allocate success,
    /// permission, channel bind, then a ChannelData echo service.
    async fn run(mut self) {
        let mut buf = vec![0u8; 2048];
        let relay: SocketAddr = RELAY.parse().unwrap();
        let peer: SocketAddr = PEER.parse().unwrap();

        // 1: unauthenticated Allocate → 401 with realm and nonce.
        let (size, client) = self.recv(&mut buf).await;
        let mut attributes = Vec::new();
        let message = Message::decode(&buf[..size], &mut attributes).unwrap();
        assert_eq!(message.method(), Method::Allocate(MethodKind::Request));
        assert_eq!(message.get::<RequestedTransport>(), Some(17));
        assert!(message.integrity(&self.auth()).is_err());

        let token: [u8; 12] = message.token().try_into().unwrap();
        let mut bytes = BytesMut::with_capacity(1280);
        let mut response =
            MessageEncoder::new(Method::Allocate(MethodKind::Error), &token, &mut bytes);
        response.append::<ErrorAttr>(ErrorCode::from(ErrorKind::Unauthorized));
        response.append::<Realm>(REALM);
        response.append::<Nonce>(self.nonce);
        response.flush(None).unwrap();
        self.respond(&bytes, client).await;

        // 2: authenticated Allocate; optionally one stale-nonce detour.
        loop {
            let (size, client) = self.recv(&mut buf).await;
            let mut attributes = Vec::new();
            let message = Message::decode(&buf[..size], &mut attributes).unwrap();
            assert_eq!(message.method(), Method::Allocate(MethodKind::Request));
            assert_eq!(message.get::<Nonce>(), Some(self.nonce));
            message.integrity(&self.auth()).unwrap();

            let token: [u8; 12] = message.token().try_into().unwrap();
            let mut bytes = BytesMut::with_capacity(1280);

            if self.stale_nonce_once {
                self.stale_nonce_once = false;
                self.nonce = "n2";

                let mut response =
                    MessageEncoder::new(Method::Allocate(MethodKind::Error), &token, &mut bytes);
                response.append::<ErrorAttr>(ErrorCode::from(ErrorKind::StaleNonce));
                response.append::<Realm>(REALM);
                response.append::<Nonce>(self.nonce);
                response.flush(None).unwrap();
                self.respond(&bytes, client).await;
                continue;
            }

            let mut response =
                MessageEncoder::new(Method::Allocate(MethodKind::Response), &token, &mut bytes);
            response.append::<XorRelayedAddress>(relay);
            response.append::<XorMappedAddress>(client);
            response.append::<Lifetime>(600);
            response.flush(Some(&self.auth())).unwrap();
            self.respond(&bytes, client).await;
            break;
        }

        // 3: CreatePermission for the peer.
        let (size, client) = self.recv(&mut buf).await;
        let mut attributes = Vec::new();
        let message = Message::decode(&buf[..size], &mut attributes).unwrap();
        assert_eq!(
            message.method(),
            Method::CreatePermission(MethodKind::Request)
        );
        assert_eq!(message.get::<XorPeerAddress>(), Some(peer));
        message.integrity(&self.auth()).unwrap();

        let token: [u8; 12] = message.token().try_into().unwrap();
        let mut bytes = BytesMut::with_capacity(1280);
        MessageEncoder::new(
            Method::CreatePermission(MethodKind::Response),
            &token,
            &mut bytes,
        )
        .flush(Some(&self.auth()))
        .unwrap();
        self.respond(&bytes, client).await;

        // 4: ChannelBind with the first channel number.
        let (size, client) = self.recv(&mut buf).await;
        let mut attributes = Vec::new();
        let message = Message::decode(&buf[..size], &mut attributes).unwrap();
        assert_eq!(message.method(), Method::ChannelBind(MethodKind::Request));
        assert_eq!(message.get::<ChannelNumber>(), Some(0x4000));
        assert_eq!(message.get::<XorPeerAddress>(), Some(peer));
        message.integrity(&self.auth()).unwrap();

        let token: [u8; 12] = message.token().try_into().unwrap();
        let mut bytes = BytesMut::with_capacity(1280);
        MessageEncoder::new(Method::ChannelBind(MethodKind::Response), &token, &mut bytes)
            .flush(Some(&self.auth()))
            .unwrap();
        self.respond(&bytes, client).await;

        // relay service: push one frame down, then echo whatever arrives.
        let mut frame = BytesMut::with_capacity(64);
        ChannelData {
            number: 0x4000,
            bytes: b"relayed-frame",
        }
        .encode(&mut frame);
        self.respond(&frame, client).await;

        let mut decoder = Decoder::new();
        loop {
            let (size, client) = self.recv(&mut buf).await;
            if let Ok(Payload::ChannelData(data)) = decoder.decode(&buf[..size]) {
                assert_eq!(data.number, 0x4000);
                let payload = data.bytes.to_vec();

                let mut echo = BytesMut::with_capacity(payload.len() + 4);
                ChannelData {
                    number: 0x4000,
                    bytes: &payload,
                }
                .encode(&mut echo);
                self.respond(&echo, client).await;
            }
        }
    }
}

async fn start_server(stale_nonce_once: bool) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap();

    tokio::spawn(
        MockTurnServer {
            socket,
            nonce: "n1",
            stale_nonce_once,
        }
        .run(),
    );

    address
}

#[tokio::test]
async fn allocate_permission_bind_and_relay() {
    let server = start_server(false).await;
    let peer: SocketAddr = PEER.parse().unwrap();

    let mut client = TurnClient::new(&TurnConfig {
        server,
        username: USERNAME.to_string(),
        credential: CREDENTIAL.to_string(),
    })
    .await
    .unwrap();

    // the 401 dance lands the expected relay endpoint.
    let allocation = client.allocate().await.unwrap();
    assert_eq!(allocation.relay, RELAY.parse::<SocketAddr>().unwrap());
    assert_eq!(allocation.lifetime, 600);
    assert_eq!(client.state(), State::Allocated);

    client.create_permission(peer).await.unwrap();
    assert_eq!(client.channel_bind(peer).await.unwrap(), 0x4000);

    // a second bind for the same peer reuses the channel.
    assert_eq!(client.channel_bind(peer).await.unwrap(), 0x4000);

    // only now does the receive loop take the socket.
    let (sink_tx, mut sink_rx) = mpsc::channel(16);
    client.start(sink_tx).unwrap();

    // the frame the server pushed right after setup arrives relayed.
    let frame = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&frame[..], b"relayed-frame");

    // upstream: ChannelData out, echoed back through the receive loop.
    client
        .send_to_peer(peer, b"key-frame-request")
        .await
        .unwrap();
    let echo = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echo[..], b"key-frame-request");

    client.deallocate().await;
    assert_eq!(client.state(), State::Deallocated);
}

#[tokio::test]
async fn stale_nonce_is_retried_once() {
    let server = start_server(true).await;

    let mut client = TurnClient::new(&TurnConfig {
        server,
        username: USERNAME.to_string(),
        credential: CREDENTIAL.to_string(),
    })
    .await
    .unwrap();

    let allocation = client.allocate().await.unwrap();
    assert_eq!(allocation.relay, RELAY.parse::<SocketAddr>().unwrap());
}
