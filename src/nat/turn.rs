use std::{net::SocketAddr, sync::Arc, time::Duration};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use stun::{
    ChannelData, Decoder, Payload,
    attribute::{
        ChannelNumber, Data, Error as ErrorAttr, ErrorKind, Lifetime, Nonce, Realm,
        RequestedTransport, UserName, XorMappedAddress, XorPeerAddress, XorRelayedAddress,
    },
    message::{Message, MessageEncoder, Method, MethodKind},
    util::{self, Auth},
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};

/// per-exchange wait for a TURN response.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// the allocation is refreshed at this fraction of its lifetime.
const REFRESH_FRACTION: f64 = 0.8;

const CHANNEL_FIRST: u16 = 0x4000;
const CHANNEL_LAST: u16 = 0x7FFF;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Codec(stun::Error),
    Timeout,
    NoResponse,
    InvalidResponse,
    AuthenticationFailed,
    AllocateFailed(u16),
    NoRelayAddress,
    NotAllocated,
    PermissionDenied,
    ChannelBindFailed,
    ChannelsExhausted,
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

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub server: SocketAddr,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Allocating,
    Allocated,
    Deallocated,
}

/// What an Allocate success handed back.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub relay: SocketAddr,
    pub mapped: SocketAddr,
    pub lifetime: u32,
}

/// long-term credentials learned from the 401 challenge.
///
/// Owned by exactly one task at a time: the client itself during setup,
/// the refresh task afterwards. Nothing locks them.
struct Credentials {
    auth: Auth,
    realm: String,
    nonce: String,
}

/// a request handed to the receive task for send-and-receive: the reply
/// sender becomes the task's pending-continuation slot.
struct PendingExchange {
    request: BytesMut,
    reply: oneshot::Sender<Vec<u8>>,
}

/// TURN (RFC 5766) client over UDP with long-term credential
/// authentication and channel binding.
///
/// Lifecycle: `Idle → Allocating → Allocated → Deallocated`. All setup
/// exchanges (`allocate`, `create_permission`, `channel_bind`) read the
/// socket directly and therefore MUST complete before [`TurnClient::start`]
/// hands the socket to the receive loop. `start` also hands over the
/// mutable state: the receive task owns the pending-continuation slot, the
/// refresh task owns the credentials, and later requests reach them as
/// messages, never through a shared lock.
pub struct TurnClient {
    socket: Arc<UdpSocket>,
    username: String,
    credential: String,
    credentials: Option<Credentials>,
    state: State,
    allocation: Option<Allocation>,
    channels: AHashMap<SocketAddr, u16>,
    next_channel: u16,
    receive_started: bool,
    receive_task: Option<JoinHandle<()>>,
    refresh_task: Option<JoinHandle<()>>,
    refresh_stop: Option<oneshot::Sender<()>>,
}

impl TurnClient {
    pub async fn new(config: &TurnConfig) -> Result<Self, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(config.server).await?;

        Ok(Self {
            socket: Arc::new(socket),
            username: config.username.clone(),
            credential: config.credential.clone(),
            credentials: None,
            state: State::Idle,
            allocation: None,
            channels: AHashMap::new(),
            next_channel: CHANNEL_FIRST,
            receive_started: false,
            receive_task: None,
            refresh_task: None,
            refresh_stop: None,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    /// Allocate a relayed transport address.
    ///
    /// The first request goes out unauthenticated; the expected 401 carries
    /// the REALM and NONCE from which the long-term credential key is
    /// derived. One 438 Stale Nonce on the authenticated retry is absorbed.
    pub async fn allocate(&mut self) -> Result<Allocation, Error> {
        self.state = State::Allocating;

        // unauthenticated probe for the challenge.
        let response = self.exchange(build_allocate(&self.username, None)).await?;

        let mut attributes = Vec::new();
        let message = Message::decode(&response, &mut attributes)?;

        let allocation = match classify(&message, Method::Allocate(MethodKind::Response))? {
            Classified::Success => parse_allocation(&message)?,
            Classified::Error(ErrorKind::Unauthorized) => {
                let realm = message.get::<Realm>().ok_or(Error::InvalidResponse)?;
                let nonce = message.get::<Nonce>().ok_or(Error::InvalidResponse)?;

                self.credentials = Some(Credentials {
                    auth: util::long_key(&self.username, &self.credential, realm),
                    realm: realm.to_string(),
                    nonce: nonce.to_string(),
                });

                self.allocate_authenticated(true).await?
            }
            Classified::Error(kind) => return Err(Error::AllocateFailed(kind.code())),
        };

        log::info!(
            "turn allocated: relay={}, mapped={}, lifetime={}",
            allocation.relay,
            allocation.mapped,
            allocation.lifetime
        );

        self.allocation = Some(allocation);
        self.state = State::Allocated;
        Ok(allocation)
    }

    async fn allocate_authenticated(&mut self, retry_stale: bool) -> Result<Allocation, Error> {
        let request = build_allocate(&self.username, self.credentials.as_ref());
        let response = self.exchange(request).await?;

        let mut attributes = Vec::new();
        let message = Message::decode(&response, &mut attributes)?;

        match classify(&message, Method::Allocate(MethodKind::Response))? {
            Classified::Success => parse_allocation(&message),
            Classified::Error(ErrorKind::StaleNonce) if retry_stale => {
                self.refresh_nonce(&message)?;
                Box::pin(self.allocate_authenticated(false)).await
            }
            Classified::Error(ErrorKind::Unauthorized) => Err(Error::AuthenticationFailed),
            Classified::Error(kind) => Err(Error::AllocateFailed(kind.code())),
        }
    }

    /// Install a permission for a peer. Permissions silently expire after
    /// five minutes on the server and are simply re-created on demand.
    pub async fn create_permission(&mut self, peer: SocketAddr) -> Result<(), Error> {
        if self.state != State::Allocated {
            return Err(Error::NotAllocated);
        }

        let request = build_create_permission(&self.username, self.credentials.as_ref(), peer);
        let response = self.exchange(request).await?;

        let mut attributes = Vec::new();
        let message = Message::decode(&response, &mut attributes)?;

        match classify(&message, Method::CreatePermission(MethodKind::Response))? {
            Classified::Success => {
                log::info!("turn permission installed: peer={}", peer);
                Ok(())
            }
            Classified::Error(kind) => {
                log::warn!(
                    "create permission rejected: peer={}, code={}",
                    peer,
                    kind.code()
                );
                Err(Error::PermissionDenied)
            }
        }
    }

    /// Bind a channel number to a peer. Numbers are handed out
    /// monotonically per allocation, starting at 0x4000.
    pub async fn channel_bind(&mut self, peer: SocketAddr) -> Result<u16, Error> {
        if self.state != State::Allocated {
            return Err(Error::NotAllocated);
        }

        if let Some(number) = self.channels.get(&peer) {
            return Ok(*number);
        }

        if self.next_channel > CHANNEL_LAST {
            return Err(Error::ChannelsExhausted);
        }

        let number = self.next_channel;
        let request = build_channel_bind(&self.username, self.credentials.as_ref(), peer, number);
        let response = self.exchange(request).await?;

        let mut attributes = Vec::new();
        let message = Message::decode(&response, &mut attributes)?;

        match classify(&message, Method::ChannelBind(MethodKind::Response))? {
            Classified::Success => {
                log::info!("turn channel bound: peer={}, number={:#06x}", peer, number);
                self.next_channel += 1;
                self.channels.insert(peer, number);
                Ok(number)
            }
            Classified::Error(kind) => {
                log::warn!("channel bind rejected: peer={}, code={}", peer, kind.code());
                Err(Error::ChannelBindFailed)
            }
        }
    }

    /// Start the receive and refresh loops.
    ///
    /// Relayed payloads (ChannelData or Data indications) are pushed into
    /// `sink`; STUN responses are routed to the receive task's pending
    /// continuation. Ownership moves here: the credentials leave the
    /// client for the refresh task, which reaches the socket's
    /// send-and-receive path only through the exchange channel.
    pub fn start(&mut self, sink: mpsc::Sender<Bytes>) -> Result<(), Error> {
        let allocation = *self.allocation.as_ref().ok_or(Error::NotAllocated)?;
        if self.receive_started {
            return Ok(());
        }

        self.receive_started = true;

        let (exchange_tx, exchange_rx) = mpsc::channel(4);
        self.receive_task = Some(tokio::spawn(receive_loop(
            self.socket.clone(),
            exchange_rx,
            sink,
        )));

        let (stop_tx, stop_rx) = oneshot::channel();
        self.refresh_stop = Some(stop_tx);
        self.refresh_task = Some(tokio::spawn(refresh_loop(
            RefreshState {
                socket: self.socket.clone(),
                username: self.username.clone(),
                credentials: self.credentials.take(),
                lifetime: allocation.lifetime,
                exchange: exchange_tx,
            },
            stop_rx,
        )));

        Ok(())
    }

    /// a cheap clonable handle for sending to one peer, for tasks that do
    /// not own the client.
    pub fn sender(&self, peer: SocketAddr) -> TurnSender {
        TurnSender {
            socket: self.socket.clone(),
            peer,
            number: self.channels.get(&peer).copied(),
        }
    }

    /// Send application data to a bound peer using ChannelData framing,
    /// falling back to a Send indication for peers without a channel.
    pub async fn send_to_peer(&self, peer: SocketAddr, payload: &[u8]) -> Result<(), Error> {
        if self.state != State::Allocated {
            return Err(Error::NotAllocated);
        }

        let mut bytes = BytesMut::with_capacity(payload.len() + 64);
        match self.channels.get(&peer) {
            Some(number) => {
                ChannelData {
                    number: *number,
                    bytes: payload,
                }
                .encode(&mut bytes);
            }
            None => {
                let token = new_token();
                let mut message = MessageEncoder::new(Method::SendIndication, &token, &mut bytes);
                message.append::<XorPeerAddress>(peer);
                message.append::<Data>(payload);
                message.flush(None)?;
            }
        }

        self.socket.send(&bytes).await?;
        Ok(())
    }

    /// Tear the allocation down.
    ///
    /// Once started, the refresh task owns the credentials, so the
    /// lifetime-0 Refresh is its parting act: the stop signal asks it to
    /// fire the deallocation on its way out (best-effort). Before start,
    /// the client still holds everything and sends directly.
    pub async fn deallocate(&mut self) {
        if self.receive_started {
            if let Some(stop) = self.refresh_stop.take() {
                let _ = stop.send(());
            }

            if let Some(mut task) = self.refresh_task.take() {
                let _ = timeout(Duration::from_millis(500), &mut task).await;
                task.abort();
            }
        } else if self.state == State::Allocated {
            let request = build_refresh(&self.username, self.credentials.as_ref(), 0);
            if let Err(err) = self.socket.send(&request).await {
                log::debug!("deallocate refresh not sent: err={}", err);
            }
        }

        if let Some(task) = self.receive_task.take() {
            task.abort();
        }

        self.channels.clear();
        self.allocation = None;
        self.state = State::Deallocated;
    }

    fn refresh_nonce(&mut self, message: &Message<'_, '_>) -> Result<(), Error> {
        let nonce = message.get::<Nonce>().ok_or(Error::InvalidResponse)?;
        match self.credentials.as_mut() {
            Some(credentials) => {
                credentials.nonce = nonce.to_string();
                Ok(())
            }
            None => Err(Error::AuthenticationFailed),
        }
    }

    /// one setup request/response exchange, reading the socket directly.
    /// Only valid before the receive loop owns the socket.
    async fn exchange(&self, request: BytesMut) -> Result<Vec<u8>, Error> {
        self.socket.send(&request).await?;

        let mut buf = vec![0u8; 1500];
        let size = timeout(EXCHANGE_TIMEOUT, self.socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Timeout)??;
        buf.truncate(size);
        Ok(buf)
    }
}

/// Upstream send handle detached from the client's lifecycle: ChannelData
/// framing when the peer has a bound channel, a Send indication otherwise.
#[derive(Clone)]
pub struct TurnSender {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    number: Option<u16>,
}

impl TurnSender {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), Error> {
        let mut bytes = BytesMut::with_capacity(payload.len() + 64);
        match self.number {
            Some(number) => {
                ChannelData {
                    number,
                    bytes: payload,
                }
                .encode(&mut bytes);
            }
            None => {
                let token = new_token();
                let mut message = MessageEncoder::new(Method::SendIndication, &token, &mut bytes);
                message.append::<XorPeerAddress>(self.peer);
                message.append::<Data>(payload);
                message.flush(None)?;
            }
        }

        self.socket.send(&bytes).await?;
        Ok(())
    }
}

enum Classified {
    Success,
    Error(ErrorKind),
}

/// match a response against the expected success method; error responses
/// surface their decoded code, anything else is invalid.
fn classify(message: &Message<'_, '_>, expected: Method) -> Result<Classified, Error> {
    let method = message.method();
    if method == expected {
        return Ok(Classified::Success);
    }

    if method.is_error() {
        let error = message.get::<ErrorAttr>().ok_or(Error::InvalidResponse)?;
        return Ok(Classified::Error(
            error.kind().ok_or(Error::InvalidResponse)?,
        ));
    }

    Err(Error::InvalidResponse)
}

fn parse_allocation(message: &Message<'_, '_>) -> Result<Allocation, Error> {
    Ok(Allocation {
        relay: message
            .get::<XorRelayedAddress>()
            .ok_or(Error::NoRelayAddress)?,
        mapped: message
            .get::<XorMappedAddress>()
            .ok_or(Error::InvalidResponse)?,
        lifetime: message.get::<Lifetime>().unwrap_or(600),
    })
}

fn new_token() -> [u8; 12] {
    let mut token = [0u8; 12];
    rand::thread_rng().fill(&mut token);
    token
}

// request builders. Each takes the credentials of whichever task owns
// them at the time, so setup code and the refresh task share nothing.

fn build_allocate(username: &str, credentials: Option<&Credentials>) -> BytesMut {
    let token = new_token();
    let mut bytes = BytesMut::with_capacity(1280);
    let mut message = MessageEncoder::new(Method::Allocate(MethodKind::Request), &token, &mut bytes);
    message.append::<RequestedTransport>(17);

    let auth = append_credentials(&mut message, username, credentials);

    // flush failure means the hmac backend rejected the key, which cannot
    // happen for md5-derived keys; the message goes out unauthenticated
    // and the server's 401 restarts the dance.
    if message.flush(auth.as_ref()).is_err() {
        log::error!("allocate flush failed");
    }

    bytes
}

fn build_create_permission(
    username: &str,
    credentials: Option<&Credentials>,
    peer: SocketAddr,
) -> BytesMut {
    let token = new_token();
    let mut bytes = BytesMut::with_capacity(1280);
    let mut message = MessageEncoder::new(
        Method::CreatePermission(MethodKind::Request),
        &token,
        &mut bytes,
    );
    message.append::<XorPeerAddress>(peer);

    let auth = append_credentials(&mut message, username, credentials);
    if message.flush(auth.as_ref()).is_err() {
        log::error!("create permission flush failed");
    }

    bytes
}

fn build_channel_bind(
    username: &str,
    credentials: Option<&Credentials>,
    peer: SocketAddr,
    number: u16,
) -> BytesMut {
    let token = new_token();
    let mut bytes = BytesMut::with_capacity(1280);
    let mut message =
        MessageEncoder::new(Method::ChannelBind(MethodKind::Request), &token, &mut bytes);
    message.append::<ChannelNumber>(number);
    message.append::<XorPeerAddress>(peer);

    let auth = append_credentials(&mut message, username, credentials);
    if message.flush(auth.as_ref()).is_err() {
        log::error!("channel bind flush failed");
    }

    bytes
}

fn build_refresh(username: &str, credentials: Option<&Credentials>, lifetime: u32) -> BytesMut {
    let token = new_token();
    let mut bytes = BytesMut::with_capacity(1280);
    let mut message = MessageEncoder::new(Method::Refresh(MethodKind::Request), &token, &mut bytes);
    message.append::<Lifetime>(lifetime);

    let auth = append_credentials(&mut message, username, credentials);
    if message.flush(auth.as_ref()).is_err() {
        log::error!("refresh flush failed");
    }

    bytes
}

fn append_credentials(
    message: &mut MessageEncoder<'_>,
    username: &str,
    credentials: Option<&Credentials>,
) -> Option<Auth> {
    let credentials = credentials?;
    message.append::<UserName>(username);
    message.append::<Realm>(&credentials.realm);
    message.append::<Nonce>(&credentials.nonce);
    Some(credentials.auth)
}

/// classify inbound datagrams: STUN responses fulfil the pending
/// continuation, Data indications and ChannelData feed the sink.
///
/// The pending slot is a plain local: this task is its only reader and
/// writer. A request arriving over the exchange channel replaces whatever
/// waiter came before it — at most one request is outstanding, and the
/// newest one wins.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    mut exchanges: mpsc::Receiver<PendingExchange>,
    sink: mpsc::Sender<Bytes>,
) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 2048];
    let mut pending: Option<oneshot::Sender<Vec<u8>>> = None;

    loop {
        tokio::select! {
            exchange = exchanges.recv() => {
                let Some(PendingExchange { request, reply }) = exchange else {
                    return;
                };

                pending = Some(reply);
                if let Err(err) = socket.send(&request).await {
                    log::warn!("turn request not sent: err={}", err);
                }
            }
            result = socket.recv(&mut buf) => {
                let size = match result {
                    Ok(size) => size,
                    Err(err) => {
                        log::warn!("turn receive failed: err={}", err);
                        return;
                    }
                };

                match decoder.decode(&buf[..size]) {
                    Ok(Payload::ChannelData(data)) => {
                        if sink.send(Bytes::copy_from_slice(data.bytes)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Payload::Message(message)) => {
                        if message.method() == Method::DataIndication {
                            if let Some(data) = message.get::<Data>() {
                                if sink.send(Bytes::copy_from_slice(data)).await.is_err() {
                                    return;
                                }
                            }
                            continue;
                        }

                        match pending.take() {
                            Some(reply) => {
                                let _ = reply.send(buf[..size].to_vec());
                            }
                            None => {
                                log::debug!("unsolicited stun message dropped");
                            }
                        }
                    }
                    Err(_) => {
                        log::debug!("undecodable datagram dropped: size={}", size);
                    }
                }
            }
        }
    }
}

/// the refresh task's whole world: it owns the credentials outright and
/// talks to the socket's receive path only through the exchange channel.
struct RefreshState {
    socket: Arc<UdpSocket>,
    username: String,
    credentials: Option<Credentials>,
    lifetime: u32,
    exchange: mpsc::Sender<PendingExchange>,
}

/// sleep to 80% of the lifetime, refresh, repeat. A 438 replaces the nonce
/// and retries once; other failures keep the previous cadence and let the
/// next cycle try again. The stop signal turns into the parting
/// lifetime-0 Refresh (best-effort, no response awaited).
async fn refresh_loop(mut state: RefreshState, mut stop: oneshot::Receiver<()>) {
    loop {
        let delay = Duration::from_secs_f64(f64::from(state.lifetime) * REFRESH_FRACTION);

        tokio::select! {
            _ = sleep(delay) => {
                let lifetime = state.lifetime;
                match refresh_once(&mut state, lifetime, true).await {
                    Ok(granted) => {
                        log::debug!("turn allocation refreshed: lifetime={}", granted);
                        state.lifetime = granted;
                    }
                    Err(err) => {
                        log::warn!("turn refresh failed: err={}", err);
                    }
                }
            }
            _ = &mut stop => {
                let request = build_refresh(&state.username, state.credentials.as_ref(), 0);
                if let Err(err) = state.socket.send(&request).await {
                    log::debug!("deallocate refresh not sent: err={}", err);
                }
                return;
            }
        }
    }
}

async fn refresh_once(
    state: &mut RefreshState,
    lifetime: u32,
    retry_stale: bool,
) -> Result<u32, Error> {
    let request = build_refresh(&state.username, state.credentials.as_ref(), lifetime);

    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .exchange
        .send(PendingExchange {
            request,
            reply: reply_tx,
        })
        .await
        .map_err(|_| Error::NoResponse)?;

    let response = match timeout(EXCHANGE_TIMEOUT, reply_rx).await {
        Err(_) => return Err(Error::Timeout),
        Ok(Err(_)) => return Err(Error::NoResponse),
        Ok(Ok(bytes)) => bytes,
    };

    let mut attributes = Vec::new();
    let message = Message::decode(&response, &mut attributes)?;

    match classify(&message, Method::Refresh(MethodKind::Response))? {
        Classified::Success => Ok(message.get::<Lifetime>().unwrap_or(lifetime)),
        Classified::Error(ErrorKind::StaleNonce) if retry_stale => {
            let nonce = message.get::<Nonce>().ok_or(Error::InvalidResponse)?;
            if let Some(credentials) = state.credentials.as_mut() {
                credentials.nonce = nonce.to_string();
            }
            Box::pin(refresh_once(state, lifetime, false)).await
        }
        Classified::Error(kind) => Err(Error::AllocateFailed(kind.code())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_allocate_has_no_integrity() {
        let bytes = build_allocate("visor", None);
        let mut attributes = Vec::new();
        let message = Message::decode(&bytes, &mut attributes).unwrap();

        assert_eq!(message.method(), Method::Allocate(MethodKind::Request));
        assert_eq!(message.get::<RequestedTransport>(), Some(17));
        assert!(message.get::<UserName>().is_none());
        assert!(message.integrity(&[0u8; 16]).is_err());
    }

    #[test]
    fn authenticated_requests_carry_the_credential_set() {
        let auth = util::long_key("visor", "secret", "visor.example");
        let credentials = Credentials {
            auth,
            realm: "visor.example".into(),
            nonce: "n1".into(),
        };

        let peer = "203.0.113.9:5000".parse().unwrap();
        let bytes = build_channel_bind("visor", Some(&credentials), peer, 0x4000);

        let mut attributes = Vec::new();
        let message = Message::decode(&bytes, &mut attributes).unwrap();
        assert_eq!(message.get::<ChannelNumber>(), Some(0x4000));
        assert_eq!(message.get::<XorPeerAddress>(), Some(peer));
        assert_eq!(message.get::<UserName>(), Some("visor"));
        assert_eq!(message.get::<Nonce>(), Some("n1"));
        assert!(message.integrity(&auth).is_ok());
    }

    #[test]
    fn deallocation_refresh_has_zero_lifetime() {
        let credentials = Credentials {
            auth: util::long_key("visor", "secret", "visor.example"),
            realm: "visor.example".into(),
            nonce: "n1".into(),
        };

        let bytes = build_refresh("visor", Some(&credentials), 0);
        let mut attributes = Vec::new();
        let message = Message::decode(&bytes, &mut attributes).unwrap();

        assert_eq!(message.method(), Method::Refresh(MethodKind::Request));
        assert_eq!(message.get::<Lifetime>(), Some(0));
    }
}
