use std::{net::SocketAddr, time::Duration};

use tokio::{net::UdpSocket, sync::watch, time::timeout};

use super::turn::{self, TurnClient, TurnConfig};

/// per-candidate wait on the direct paths.
pub const DIRECT_TIMEOUT: Duration = Duration::from_millis(1_500);

/// overall wait for the single relay fallback.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

const PUNCH_COUNT: u32 = 10;
const PUNCH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Turn(turn::Error),
    AllCandidatesFailed,
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

impl From<turn::Error> for Error {
    fn from(value: turn::Error) -> Self {
        Self::Turn(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    Relay,
}

impl CandidateKind {
    pub const fn default_priority(self) -> u32 {
        match self {
            Self::Host => 1000,
            Self::ServerReflexive => 500,
            Self::Relay => 100,
        }
    }
}

/// One way to reach the host. Higher priority is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub address: SocketAddr,
    pub priority: u32,
}

impl Candidate {
    pub fn host(address: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::Host,
            address,
            priority: CandidateKind::Host.default_priority(),
        }
    }

    pub fn server_reflexive(address: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::ServerReflexive,
            address,
            priority: CandidateKind::ServerReflexive.default_priority(),
        }
    }

    pub fn relay(address: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::Relay,
            address,
            priority: CandidateKind::Relay.default_priority(),
        }
    }
}

/// Trial progress, published over a watch channel.
///
/// Only the terminal `Failed` is an error signal; individual candidate
/// failures stay internal so that expected probing noise never flickers
/// through the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceState {
    Idle,
    Discovering,
    HolePunching,
    RelayFallback,
    Connected(SocketAddr),
    Failed,
}

/// The transport path a successful trial yields.
pub enum Path {
    /// a socket already connected to the working remote endpoint.
    Direct { socket: UdpSocket, remote: SocketAddr },
    /// an allocated TURN client with permission and channel for the peer.
    Relay { client: TurnClient, peer: SocketAddr },
}

impl Path {
    pub fn remote(&self) -> SocketAddr {
        match self {
            Self::Direct { remote, .. } => *remote,
            Self::Relay { peer, .. } => *peer,
        }
    }

    pub const fn is_relay(&self) -> bool {
        matches!(self, Self::Relay { .. })
    }
}

/// Priority-ordered candidate trial: host → server-reflexive → relay.
pub struct IceAgent {
    turn: TurnConfig,
    state: watch::Sender<IceState>,
}

impl IceAgent {
    pub fn new(turn: TurnConfig) -> Self {
        Self {
            turn,
            state: watch::channel(IceState::Idle).0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<IceState> {
        self.state.subscribe()
    }

    /// run the trial protocol over the candidate list.
    pub async fn connect(&self, mut candidates: Vec<Candidate>) -> Result<Path, Error> {
        self.state.send_replace(IceState::Discovering);
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        let (direct, relay): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|it| it.kind != CandidateKind::Relay);

        for candidate in direct {
            if candidate.kind == CandidateKind::ServerReflexive {
                self.state.send_replace(IceState::HolePunching);
            }

            match timeout(DIRECT_TIMEOUT, probe(candidate)).await {
                Ok(Ok(socket)) => {
                    log::info!(
                        "candidate connected: kind={:?}, addr={}",
                        candidate.kind,
                        candidate.address
                    );
                    self.state
                        .send_replace(IceState::Connected(candidate.address));
                    return Ok(Path::Direct {
                        socket,
                        remote: candidate.address,
                    });
                }
                Ok(Err(err)) => {
                    log::debug!("candidate failed: addr={}, err={}", candidate.address, err);
                }
                Err(_) => {
                    log::debug!("candidate timed out: addr={}", candidate.address);
                }
            }
        }

        // exactly one relay attempt, the highest-priority relay candidate.
        if let Some(candidate) = relay.first() {
            self.state.send_replace(IceState::RelayFallback);

            match timeout(RELAY_TIMEOUT, relay_setup(&self.turn, candidate.address)).await {
                Ok(Ok(client)) => {
                    self.state
                        .send_replace(IceState::Connected(candidate.address));
                    return Ok(Path::Relay {
                        client,
                        peer: candidate.address,
                    });
                }
                Ok(Err(err)) => {
                    log::warn!("relay candidate failed: err={}", err);
                }
                Err(_) => {
                    log::warn!("relay candidate timed out: addr={}", candidate.address);
                }
            }
        }

        self.state.send_replace(IceState::Failed);
        Err(Error::AllCandidatesFailed)
    }
}

/// ping/ack exchange on one direct candidate: a single `"ACK"` for a LAN
/// address, a burst of `"PUNCH"` datagrams for a NAT-mapped one. Any reply
/// at all means the mapping is open.
async fn probe(candidate: Candidate) -> Result<UdpSocket, std::io::Error> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(candidate.address).await?;

    let mut buf = [0u8; 64];
    match candidate.kind {
        CandidateKind::Host => {
            socket.send(b"ACK").await?;
            socket.recv(&mut buf).await?;
        }
        CandidateKind::ServerReflexive => {
            let mut interval = tokio::time::interval(PUNCH_INTERVAL);
            let mut sent = 0;

            loop {
                tokio::select! {
                    _ = interval.tick(), if sent < PUNCH_COUNT => {
                        socket.send(b"PUNCH").await?;
                        sent += 1;
                    }
                    result = socket.recv(&mut buf) => {
                        result?;
                        break;
                    }
                }
            }
        }
        CandidateKind::Relay => unreachable!("relay candidates are partitioned out"),
    }

    Ok(socket)
}

/// the complete relay setup: allocate, install the peer permission, bind a
/// channel. The receive loop is NOT started here; it would race these
/// exchanges for the socket, so the session starts it once it owns the
/// client.
async fn relay_setup(config: &TurnConfig, peer: SocketAddr) -> Result<TurnClient, Error> {
    let mut client = TurnClient::new(config).await?;
    client.allocate().await?;
    client.create_permission(peer).await?;
    client.channel_bind(peer).await?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_partition() {
        let mut candidates = vec![
            Candidate::relay("198.51.100.4:49200".parse().unwrap()),
            Candidate::server_reflexive("203.0.113.5:40000".parse().unwrap()),
            Candidate::host("192.168.1.10:5000".parse().unwrap()),
        ];

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        assert_eq!(candidates[0].kind, CandidateKind::Host);
        assert_eq!(candidates[1].kind, CandidateKind::ServerReflexive);
        assert_eq!(candidates[2].kind, CandidateKind::Relay);
    }

    // the host candidate never answers, the reflexive one
    // answers the third punch; the agent lands on the reflexive path and
    // intermediate failures never surface.
    #[tokio::test]
    async fn hole_punch_succeeds_after_silent_host_candidate() {
        // silent socket: bound, never replies.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let host_addr = silent.local_addr().unwrap();

        // punch responder: replies after the third datagram.
        let punch = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let punch_addr = punch.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            for i in 0..3u32 {
                let (size, from) = punch.recv_from(&mut buf).await.unwrap();
                assert_eq!(&buf[..size], b"PUNCH");
                if i == 2 {
                    punch.send_to(b"ACK", from).await.unwrap();
                }
            }
        });

        let agent = IceAgent::new(TurnConfig {
            server: "127.0.0.1:3478".parse().unwrap(),
            username: String::new(),
            credential: String::new(),
        });
        let mut states = agent.subscribe();

        let path = agent
            .connect(vec![
                Candidate::host(host_addr),
                Candidate::server_reflexive(punch_addr),
            ])
            .await
            .unwrap();

        assert_eq!(path.remote(), punch_addr);
        assert!(!path.is_relay());

        states.mark_changed();
        assert_eq!(*states.borrow_and_update(), IceState::Connected(punch_addr));
    }

    #[tokio::test]
    async fn empty_list_fails_terminally() {
        let agent = IceAgent::new(TurnConfig {
            server: "127.0.0.1:3478".parse().unwrap(),
            username: String::new(),
            credential: String::new(),
        });

        assert!(matches!(
            agent.connect(Vec::new()).await,
            Err(Error::AllCandidatesFailed)
        ));
    }
}
