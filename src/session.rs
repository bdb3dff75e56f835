use std::{net::SocketAddr, sync::Arc};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::{Notify, mpsc},
    task::JoinHandle,
    time::{Duration, interval, timeout},
};

use proto::{
    HEADER_SIZE, PacketHeader, PacketKind, control,
    packet::{encode_registration, parse_auth_result},
    state::OmniscientState,
};

use crate::{
    assembler::{Frame, FrameAssembler, TransportMode},
    crypto::{KeyExchange, SessionCipher, parse_handshake},
    nat::{Path, TurnClient, turn::TurnSender},
};

/// cadence of the `0xFE` registration on the control channel; it doubles
/// as the keep-alive while listening or receiving.
pub const REGISTRATION_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Turn(crate::nat::turn::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<crate::nat::turn::Error> for Error {
    fn from(value: crate::nat::turn::Error) -> Self {
        Self::Turn(value)
    }
}

/// Events the connection manager consumes.
#[derive(Debug)]
pub enum SessionEvent {
    AuthResult(bool),
    HostState(OmniscientState),
    /// the reliable control channel dropped.
    ControlClosed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// the host's signaling TCP endpoint.
    pub control: SocketAddr,
    /// local UDP data port; 0 binds an ephemeral port.
    pub listen_port: u16,
    pub user_id: String,
}

/// the raw datagram pipeline outputs, routed by the listener task.
#[derive(Debug)]
enum Output {
    AuthResult(bool),
    Frame(Frame),
    HostState(OmniscientState),
    SendToHost(Vec<u8>),
}

/// The datagram pipeline: dispatch, reassembly, key exchange, control
/// documents. Synchronous; owned by whichever task feeds it, so none of
/// its state is shared.
struct Pipeline {
    assembler: FrameAssembler,
    exchange: Option<KeyExchange>,
    cipher: Option<SessionCipher>,
    parameter_sets: AHashMap<PacketKind, Vec<u8>>,
}

impl Pipeline {
    fn new(mode: TransportMode) -> Self {
        Self {
            assembler: FrameAssembler::new(mode),
            exchange: None,
            cipher: None,
            parameter_sets: AHashMap::new(),
        }
    }

    fn process(&mut self, bytes: &[u8], outputs: &mut Vec<Output>) {
        // dispatch rule 1: the one-byte-prefixed auth verdict.
        if let Some(approved) = parse_auth_result(bytes) {
            if approved && self.exchange.is_none() {
                // generate our keypair now so the handshake can answer
                // immediately when it arrives.
                self.exchange = Some(KeyExchange::generate());
            }
            outputs.push(Output::AuthResult(approved));
            return;
        }

        // dispatch rule 2 and 3: too short is dropped, the rest is framed.
        let Ok((header, payload)) = PacketHeader::split(bytes) else {
            return;
        };

        let push = self.assembler.push(
            header,
            Bytes::copy_from_slice(payload),
            self.cipher.as_ref(),
        );

        if push.request_key_frame {
            log::info!("requesting key frame after repeated loss");
            outputs.push(Output::SendToHost(vec![control::KEY_FRAME_REQUEST]));
        }

        let Some(frame) = push.frame else {
            return;
        };

        match frame.kind {
            PacketKind::Handshake => self.on_handshake(&frame, outputs),
            PacketKind::OmniscientState => match OmniscientState::from_slice(&frame.bytes) {
                Ok(state) => outputs.push(Output::HostState(state)),
                Err(err) => log::warn!("undecodable omniscient state: err={}", err),
            },
            kind if kind.is_parameter_set() => {
                // changed parameter bytes mean a new encoder session on
                // the host; in-flight assemblies belong to the old one.
                let changed = self
                    .parameter_sets
                    .get(&kind)
                    .is_some_and(|previous| previous != &frame.bytes);
                self.parameter_sets.insert(kind, frame.bytes.clone());

                if changed {
                    log::info!("codec parameters changed, purging assembly state");
                    self.assembler.clear();
                }

                outputs.push(Output::Frame(frame));
            }
            _ => outputs.push(Output::Frame(frame)),
        }
    }

    /// derive the session key and echo our own handshake so both sides
    /// hold keys before the first encrypted frame.
    fn on_handshake(&mut self, frame: &Frame, outputs: &mut Vec<Output>) {
        let Ok(peer_public) = parse_handshake(&frame.bytes) else {
            log::warn!("malformed handshake payload dropped");
            return;
        };

        let exchange = self.exchange.get_or_insert_with(KeyExchange::generate);
        match exchange.derive(&peer_public) {
            Ok(key) => {
                self.cipher = Some(SessionCipher::new(&key));
                log::info!("session key established");

                let mut bytes = BytesMut::with_capacity(HEADER_SIZE + 33);
                PacketHeader {
                    kind: PacketKind::Handshake,
                    timestamp: frame.timestamp,
                    total_fragments: 1,
                    fragment_index: 0,
                }
                .encode(&mut bytes);
                bytes.extend_from_slice(&exchange.handshake_payload());
                outputs.push(Output::SendToHost(bytes.to_vec()));
            }
            Err(err) => log::warn!("key derivation failed: err={}", err),
        }
    }
}

/// where upstream datagrams (handshake echo, key-frame requests) go.
#[derive(Clone)]
enum Upstream {
    Direct {
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
    },
    Relay(TurnSender),
}

impl Upstream {
    async fn send(&self, bytes: &[u8]) {
        let result = match self {
            Self::Direct { socket, remote } => socket
                .send_to(bytes, *remote)
                .await
                .map(|_| ())
                .map_err(Error::Io),
            Self::Relay(sender) => sender.send(bytes).await.map_err(Error::Turn),
        };

        if let Err(err) = result {
            log::warn!("upstream send failed: err={}", err);
        }
    }
}

/// One live receiving session: the UDP (or TURN-injected) data pipeline
/// plus the reliable TCP control channel.
pub struct Session {
    /// decoder hand-off: completed frames in completion order.
    pub frames: mpsc::Receiver<Frame>,
    /// control-plane events for the connection manager.
    pub events: mpsc::Receiver<SessionEvent>,
    remote: SocketAddr,
    data_port: u16,
    mode: TransportMode,
    turn: Option<TurnClient>,
    shutdown: Arc<Notify>,
    control_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
}

impl Session {
    pub async fn start(config: SessionConfig, path: Path) -> Result<Self, Error> {
        let (frames_tx, frames) = mpsc::channel(64);
        let (events_tx, events) = mpsc::channel(64);
        let shutdown = Arc::new(Notify::new());
        let remote = path.remote();

        let (mode, data_port, turn, listener_task) = match path {
            Path::Direct { remote, .. } => {
                // the data listener accepts datagrams from ANY source:
                // the host's NAT rebinds mid-stream and the stream must
                // survive the new mapping.
                let socket =
                    Arc::new(UdpSocket::bind(("0.0.0.0", config.listen_port)).await?);
                let data_port = socket.local_addr()?.port();

                let upstream = Upstream::Direct {
                    socket: socket.clone(),
                    remote,
                };

                let task = tokio::spawn(listen_direct(
                    socket,
                    Pipeline::new(TransportMode::Direct),
                    upstream,
                    frames_tx,
                    events_tx.clone(),
                ));

                (TransportMode::Direct, data_port, None, task)
            }
            Path::Relay { mut client, peer } => {
                let (inject_tx, inject_rx) = mpsc::channel(256);

                // setup exchanges are over; the receive loop may own the
                // socket from here on.
                client.start(inject_tx)?;
                let upstream = Upstream::Relay(client.sender(peer));

                let task = tokio::spawn(listen_injected(
                    inject_rx,
                    Pipeline::new(TransportMode::Relay),
                    upstream,
                    frames_tx,
                    events_tx.clone(),
                ));

                (TransportMode::Relay, config.listen_port, Some(client), task)
            }
        };

        let stream = TcpStream::connect(config.control).await?;
        let control_task = tokio::spawn(control_channel(
            stream,
            data_port,
            config.user_id.clone(),
            events_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            frames,
            events,
            remote,
            data_port,
            mode,
            turn,
            shutdown,
            control_task,
            listener_task,
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Orderly teardown: the control task flushes the `0xFF` notification,
    /// the TURN allocation (if any) sends its lifetime-0 Refresh, then
    /// every task is cancelled. Both notifications are best-effort and
    /// independent, which is why both paths exist.
    pub async fn disconnect(mut self) {
        // notify_one stores a permit, so the control task picks the signal
        // up even if it is mid-write when this fires.
        self.shutdown.notify_one();
        let _ = timeout(Duration::from_millis(500), &mut self.control_task).await;
        self.control_task.abort();

        if let Some(mut turn) = self.turn.take() {
            turn.deallocate().await;
        }

        self.listener_task.abort();
    }
}

async fn dispatch(
    outputs: &mut Vec<Output>,
    upstream: &Upstream,
    frames_tx: &mpsc::Sender<Frame>,
    events_tx: &mpsc::Sender<SessionEvent>,
) -> bool {
    for output in outputs.drain(..) {
        match output {
            Output::AuthResult(approved) => {
                if events_tx
                    .send(SessionEvent::AuthResult(approved))
                    .await
                    .is_err()
                {
                    return false;
                }
            }
            Output::HostState(state) => {
                if events_tx.send(SessionEvent::HostState(state)).await.is_err() {
                    return false;
                }
            }
            Output::Frame(frame) => {
                if frames_tx.send(frame).await.is_err() {
                    return false;
                }
            }
            Output::SendToHost(bytes) => upstream.send(&bytes).await,
        }
    }

    true
}

async fn listen_direct(
    socket: Arc<UdpSocket>,
    mut pipeline: Pipeline,
    upstream: Upstream,
    frames_tx: mpsc::Sender<Frame>,
    events_tx: mpsc::Sender<SessionEvent>,
) {
    let mut buf = vec![0u8; 65_536];
    let mut outputs = Vec::new();

    loop {
        let size = match socket.recv_from(&mut buf).await {
            Ok((size, _)) => size,
            Err(err) => {
                log::warn!("data listener failed: err={}", err);
                return;
            }
        };

        pipeline.process(&buf[..size], &mut outputs);
        if !dispatch(&mut outputs, &upstream, &frames_tx, &events_tx).await {
            return;
        }
    }
}

async fn listen_injected(
    mut inject_rx: mpsc::Receiver<Bytes>,
    mut pipeline: Pipeline,
    upstream: Upstream,
    frames_tx: mpsc::Sender<Frame>,
    events_tx: mpsc::Sender<SessionEvent>,
) {
    let mut outputs = Vec::new();

    while let Some(bytes) = inject_rx.recv().await {
        pipeline.process(&bytes, &mut outputs);
        if !dispatch(&mut outputs, &upstream, &frames_tx, &events_tx).await {
            return;
        }
    }
}

/// the reliable control channel: registration every second, the auth
/// verdict inbound, and the disconnect notification on the way out.
async fn control_channel(
    stream: TcpStream,
    listen_port: u16,
    user_id: String,
    events_tx: mpsc::Sender<SessionEvent>,
    shutdown: Arc<Notify>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let mut registration = BytesMut::with_capacity(64);
    encode_registration(listen_port, &user_id, &mut registration);

    let mut ticker = interval(REGISTRATION_INTERVAL);
    let mut buf = [0u8; 256];

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                let _ = writer.write_all(&[control::DISCONNECT]).await;
                let _ = writer.flush().await;
                return;
            }
            _ = ticker.tick() => {
                if writer.write_all(&registration).await.is_err() {
                    let _ = events_tx.send(SessionEvent::ControlClosed).await;
                    return;
                }
            }
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        let _ = events_tx.send(SessionEvent::ControlClosed).await;
                        return;
                    }
                    Ok(size) => {
                        if let Some(approved) = parse_auth_result(&buf[..size]) {
                            let _ = events_tx.send(SessionEvent::AuthResult(approved)).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn auth_verdict_generates_the_keypair() {
        let mut pipeline = Pipeline::new(TransportMode::Direct);
        let mut outputs = Vec::new();

        pipeline.process(&[control::AUTH_RESULT, 0x01], &mut outputs);
        assert!(matches!(outputs[0], Output::AuthResult(true)));
        assert!(pipeline.exchange.is_some());

        outputs.clear();
        pipeline.process(&[control::AUTH_RESULT, 0x00], &mut outputs);
        assert!(matches!(outputs[0], Output::AuthResult(false)));
    }

    #[tokio::test]
    async fn short_datagrams_are_dropped() {
        let mut pipeline = Pipeline::new(TransportMode::Direct);
        let mut outputs = Vec::new();

        pipeline.process(&[0x03; 16], &mut outputs);
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn handshake_derives_and_echoes() {
        let mut pipeline = Pipeline::new(TransportMode::Direct);
        let mut outputs = Vec::new();

        // the host side of the exchange.
        let host = KeyExchange::generate();
        let mut payload = Vec::new();
        payload.extend_from_slice(&host.handshake_payload());

        pipeline.process(
            &packet(PacketKind::Handshake, 7, 1, 0, &payload),
            &mut outputs,
        );

        // the echo carries our public key under the same packet kind.
        let Output::SendToHost(echo) = &outputs[0] else {
            panic!("expected an echo, got {:?}", outputs);
        };
        let (header, echo_payload) = PacketHeader::split(echo).unwrap();
        assert_eq!(header.kind, PacketKind::Handshake);
        let client_public = parse_handshake(echo_payload).unwrap();

        // both sides now decrypt each other.
        let host_cipher = SessionCipher::new(&host.derive(&client_public).unwrap());
        let sealed = host_cipher.encrypt(b"first frame").unwrap();

        outputs.clear();
        pipeline.process(
            &packet(PacketKind::VideoFrame, 8, 1, 0, &sealed),
            &mut outputs,
        );

        let Output::Frame(frame) = &outputs[0] else {
            panic!("expected a frame, got {:?}", outputs);
        };
        assert_eq!(frame.bytes, b"first frame");
    }

    #[tokio::test]
    async fn parameter_change_purges_assembly_state() {
        let mut pipeline = Pipeline::new(TransportMode::Direct);
        let mut outputs = Vec::new();

        // establish a cipher.
        let host = KeyExchange::generate();
        pipeline.process(
            &packet(PacketKind::Handshake, 1, 1, 0, &host.handshake_payload()),
            &mut outputs,
        );
        let Output::SendToHost(echo) = &outputs[0] else {
            panic!("expected echo");
        };
        let (_, echo_payload) = PacketHeader::split(echo).unwrap();
        let host_cipher =
            SessionCipher::new(&host.derive(&parse_handshake(echo_payload).unwrap()).unwrap());
        outputs.clear();

        // first SPS, then a partial frame in flight.
        let sps_v1 = host_cipher.encrypt(&[0x67, 0x01]).unwrap();
        pipeline.process(&packet(PacketKind::Sps, 2, 1, 0, &sps_v1), &mut outputs);
        outputs.clear();

        pipeline.process(
            &packet(PacketKind::VideoFrame, 3, 2, 0, b"half"),
            &mut outputs,
        );
        assert!(outputs.is_empty());

        // the same SPS again: no purge.
        pipeline.process(&packet(PacketKind::Sps, 4, 1, 0, &sps_v1), &mut outputs);
        assert_eq!(outputs.len(), 1);
        outputs.clear();
        assert_eq!(pipeline.assembler.latest_frame_id(), 3);

        // different SPS bytes: assembly state is gone.
        let sps_v2 = host_cipher.encrypt(&[0x67, 0x02]).unwrap();
        pipeline.process(&packet(PacketKind::Sps, 5, 1, 0, &sps_v2), &mut outputs);
        assert_eq!(outputs.len(), 1);
        assert_eq!(pipeline.assembler.latest_frame_id(), 0);
    }

    #[tokio::test]
    async fn omniscient_state_becomes_an_event() {
        let mut pipeline = Pipeline::new(TransportMode::Direct);
        let mut outputs = Vec::new();

        let host = KeyExchange::generate();
        pipeline.process(
            &packet(PacketKind::Handshake, 1, 1, 0, &host.handshake_payload()),
            &mut outputs,
        );
        let Output::SendToHost(echo) = &outputs[0] else {
            panic!("expected echo");
        };
        let (_, echo_payload) = PacketHeader::split(echo).unwrap();
        let host_cipher =
            SessionCipher::new(&host.derive(&parse_handshake(echo_payload).unwrap()).unwrap());
        outputs.clear();

        let doc = br#"{"engineMode": "balanced"}"#;
        let sealed = host_cipher.encrypt(doc).unwrap();
        pipeline.process(
            &packet(PacketKind::OmniscientState, 2, 1, 0, &sealed),
            &mut outputs,
        );

        let Output::HostState(state) = &outputs[0] else {
            panic!("expected host state, got {:?}", outputs);
        };
        assert_eq!(state.engine_mode, "balanced");
    }
}
