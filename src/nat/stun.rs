use std::{net::SocketAddr, time::Duration};

use bytes::BytesMut;
use rand::Rng;
use stun::{
    Decoder, Payload,
    attribute::{MappedAddress, XorMappedAddress},
    message::{MessageEncoder, Method, MethodKind},
};
use tokio::{net::UdpSocket, time::timeout};

/// per-server wait for a Binding response.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Codec(stun::Error),
    NoAddress,
    AllServersFailed,
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

impl From<stun::Error> for Error {
    fn from(value: stun::Error) -> Self {
        Self::Codec(value)
    }
}

/// NAT behavior classification is out of scope for the datapath; the field
/// exists so callers keep a stable shape if classification lands later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    Unknown,
}

/// The reflexive transport address a STUN server saw the client from.
#[derive(Debug, Clone, Copy)]
pub struct Reflexive {
    pub address: SocketAddr,
    pub nat_type: NatType,
}

/// Binding-request client over a pool of public STUN servers.
pub struct StunClient {
    servers: Vec<String>,
}

impl StunClient {
    pub fn new(servers: Vec<String>) -> Self {
        Self { servers }
    }

    /// discover the public `(ip, port)` mapping, trying the pool in order.
    pub async fn discover(&self) -> Result<Reflexive, Error> {
        for server in &self.servers {
            match timeout(SERVER_TIMEOUT, Self::binding(server)).await {
                Ok(Ok(address)) => {
                    log::info!("reflexive address: addr={}, server={}", address, server);
                    return Ok(Reflexive {
                        address,
                        nat_type: NatType::Unknown,
                    });
                }
                Ok(Err(err)) => {
                    log::warn!("stun server failed: server={}, err={}", server, err);
                }
                Err(_) => {
                    log::warn!("stun server timed out: server={}", server);
                }
            }
        }

        Err(Error::AllServersFailed)
    }

    async fn binding(server: &str) -> Result<SocketAddr, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server).await?;

        let mut token = [0u8; 12];
        rand::thread_rng().fill(&mut token);

        let mut bytes = BytesMut::with_capacity(1280);
        MessageEncoder::new(Method::Binding(MethodKind::Request), &token, &mut bytes)
            .flush(None)?;
        socket.send(&bytes).await?;

        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; 1500];

        // responses that fail to parse or answer someone else's transaction
        // are skipped, not fatal; the outer timeout bounds the wait.
        loop {
            let size = socket.recv(&mut buf).await?;

            let Ok(Payload::Message(message)) = decoder.decode(&buf[..size]) else {
                continue;
            };

            if message.method() != Method::Binding(MethodKind::Response)
                || message.token() != token
            {
                continue;
            }

            return message
                .get::<XorMappedAddress>()
                .or_else(|| message.get::<MappedAddress>())
                .ok_or(Error::NoAddress);
        }
    }
}
