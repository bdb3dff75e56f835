//! ## Visor client core
//!
//! The client side of a real-time remote-desktop link: it punches (or
//! relays) its way to the host over the public Internet, agrees on a
//! session key, reassembles the fragmented encrypted frame stream under
//! strict latency bounds, and carries the pointer/keyboard channel back.
//!
//! ```text
//! signaling directory          host
//!       │                       ▲ ▲
//!  fetch candidates     input   │ │ control (TCP)
//!       ▼                       │ │
//! ┌───────────┐   ┌───────────────────────────────────────────┐
//! │ ICE agent │──►│ session: UDP listener / TURN receive loop │
//! └───────────┘   │   frame assembler ── decrypt ── hand-off  │
//!   STUN/TURN     └─────────────────────┬─────────────────────┘
//!                                       ▼
//!                               decoder adapter ──► platform decoder
//! ```
//!
//! The connection manager observes every layer and owns the lifecycle
//! state; everything else posts events upstream and holds read-only
//! handles downstream.

pub mod assembler;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod decoder;
pub mod input;
pub mod nat;
pub mod observer;
pub mod session;
pub mod signaling;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use proto::input::InputEvent;
use tokio::{
    sync::{Mutex, Notify, mpsc},
    time::timeout,
};

use crate::{
    config::Config,
    connection::{CONNECT_TIMEOUT, ConnectionManager, ConnectionState, Directive, DisconnectReason},
    decoder::{DecoderAdapter, VideoDecoder},
    input::InputSender,
    nat::{IceAgent, StunClient, TurnConfig},
    observer::{ClientObserver, Failure},
    session::{Session, SessionConfig, SessionEvent},
    signaling::SignalingDirectory,
};

#[derive(Debug)]
pub enum ClientError {
    Directory(signaling::DirectoryError),
    HostUnavailable,
    Ice(nat::ice::Error),
    Session(session::Error),
    Failed(Failure),
}

impl std::error::Error for ClientError {}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<signaling::DirectoryError> for ClientError {
    fn from(value: signaling::DirectoryError) -> Self {
        Self::Directory(value)
    }
}

impl From<nat::ice::Error> for ClientError {
    fn from(value: nat::ice::Error) -> Self {
        Self::Ice(value)
    }
}

impl From<session::Error> for ClientError {
    fn from(value: session::Error) -> Self {
        Self::Session(value)
    }
}

/// The assembled receiver core.
///
/// Owns nothing platform-specific: the signaling directory and the video
/// decoder are injected, the observer receives lifecycle and telemetry
/// events, and [`Client::run`] drives the whole connect/receive/reconnect
/// cycle until a terminal failure or a signal on [`Client::shutdown_handle`].
pub struct Client<S> {
    config: Arc<Config>,
    directory: S,
    observer: Arc<dyn ClientObserver>,
    shutdown: Arc<Notify>,
    input_tx: mpsc::Sender<InputEvent>,
    /// shared with the per-session drain task; sessions come and go but
    /// the queue survives them.
    input_rx: Arc<Mutex<mpsc::Receiver<InputEvent>>>,
}

impl<S: SignalingDirectory> Client<S> {
    pub fn new(config: Arc<Config>, directory: S, observer: Arc<dyn ClientObserver>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(256);

        Self {
            config,
            directory,
            observer,
            shutdown: Arc::new(Notify::new()),
            input_tx,
            input_rx: Arc::new(Mutex::new(input_rx)),
        }
    }

    /// handle for an orderly stop from another task.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// queue handle for pointer, key, zoom and telemetry events; drained
    /// toward the host's input port while a session is live.
    pub fn input(&self) -> mpsc::Sender<InputEvent> {
        self.input_tx.clone()
    }

    /// Run the full lifecycle: publish our endpoint, resolve the target
    /// host, try candidates, then receive until the session ends. Session
    /// drops re-enter the cycle under the exponential-backoff policy.
    pub async fn run<D: VideoDecoder>(&self, decoder: D) -> Result<(), ClientError> {
        let mut manager =
            ConnectionManager::new(self.config.reconnect.into(), self.observer.clone());
        let mut adapter = DecoderAdapter::new(decoder);

        loop {
            manager.connect();

            let directive = match timeout(CONNECT_TIMEOUT, self.establish()).await {
                Ok(Ok((session, input_addr))) => {
                    manager.notify_waiting_auth();
                    self.drive(session, input_addr, &mut manager, &mut adapter).await
                }
                Ok(Err(ClientError::Ice(nat::ice::Error::AllCandidatesFailed))) => {
                    manager.notify_candidates_failed();
                    return Err(ClientError::Failed(Failure::AllCandidatesFailed));
                }
                Ok(Err(err)) => {
                    log::warn!("connect failed: err={}", err);
                    manager.notify_disconnected(DisconnectReason::ConnectionLost, true)
                }
                Err(_) => {
                    log::warn!("connect timed out");
                    manager.notify_disconnected(DisconnectReason::Timeout, true)
                }
            };

            match directive {
                Directive::RetryAfter(delay) => tokio::time::sleep(delay).await,
                Directive::Stop => {
                    return match manager.state() {
                        ConnectionState::Failed(failure) => Err(ClientError::Failed(failure)),
                        _ => Ok(()),
                    };
                }
            }
        }
    }

    /// one connection attempt, bounded by the caller's timeout.
    async fn establish(&self) -> Result<(Session, SocketAddr), ClientError> {
        // reflexive discovery is best-effort: it informs the directory
        // record but a LAN-only or relayed session works without it.
        let stun = StunClient::new(self.config.stun.servers.clone());
        if let Err(err) = stun.discover().await {
            log::warn!("reflexive discovery failed: err={}", err);
        }

        self.directory
            .publish_endpoint(self.config.transport.listen_port, &self.config.user_id)
            .await?;

        let records = self
            .directory
            .fetch_host_candidates(&self.config.target_user)
            .await?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let record = records
            .iter()
            .find(|it| it.is_usable(now))
            .ok_or(ClientError::HostUnavailable)?;

        log::info!(
            "connecting: host={}, device={}",
            record.user_id,
            record.device_name
        );

        let agent = IceAgent::new(TurnConfig {
            server: self.config.turn.server,
            username: self.config.turn.username.clone(),
            credential: self.config.turn.credential.clone(),
        });

        let path = agent.connect(record.candidates()).await?;
        let input_addr = SocketAddr::new(record.local_ip, self.config.transport.input_port);

        let session = Session::start(
            SessionConfig {
                control: SocketAddr::new(record.local_ip, record.local_port),
                listen_port: self.config.transport.listen_port,
                user_id: self.config.user_id.clone(),
            },
            path,
        )
        .await?;

        Ok((session, input_addr))
    }

    /// the receiving loop of one live session.
    async fn drive<D: VideoDecoder>(
        &self,
        mut session: Session,
        input_addr: SocketAddr,
        manager: &mut ConnectionManager,
        adapter: &mut DecoderAdapter<D>,
    ) -> Directive {
        let remote = session.remote();
        let input_task = tokio::spawn(input_drain(
            self.input_rx.clone(),
            input_addr,
            session.data_port(),
            self.config.user_id.clone(),
        ));

        let directive = loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    manager.disconnect();
                    session.disconnect().await;
                    break Directive::Stop;
                }
                frame = session.frames.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = adapter.handle(&frame) {
                            log::error!("decoder rejected input: err={}", err);
                            manager.notify_decoder_error(err.to_string());
                        }
                    }
                    None => {
                        let directive =
                            manager.notify_disconnected(DisconnectReason::ConnectionLost, true);
                        session.disconnect().await;
                        break directive;
                    }
                },
                event = session.events.recv() => match event {
                    Some(SessionEvent::AuthResult(true)) => {
                        // the host repeats the verdict alongside every
                        // registration cycle; only the first one connects.
                        if manager.state() != ConnectionState::Connected {
                            self.observer.on_auth_result(true);
                            manager.notify_connected(remote);
                        }
                    }
                    Some(SessionEvent::AuthResult(false)) => {
                        self.observer.on_auth_result(false);
                        manager.notify_auth_denied();
                        session.disconnect().await;
                        break Directive::Stop;
                    }
                    Some(SessionEvent::HostState(state)) => {
                        self.observer.on_host_state(&state);
                    }
                    Some(SessionEvent::ControlClosed) | None => {
                        let directive =
                            manager.notify_disconnected(DisconnectReason::HostClosed, true);
                        session.disconnect().await;
                        break directive;
                    }
                },
            }
        };

        input_task.abort();
        directive
    }
}

/// drain the caller-facing input queue toward the host for as long as the
/// session lives; the queue itself outlives the session, so queued events
/// survive a reconnect. The channel opens with a registration so the host
/// learns the input socket's mapping before any event arrives.
async fn input_drain(
    queue: Arc<Mutex<mpsc::Receiver<InputEvent>>>,
    host: SocketAddr,
    listen_port: u16,
    user_id: String,
) {
    let mut sender = match InputSender::connect(host).await {
        Ok(sender) => sender,
        Err(err) => {
            log::warn!("input channel unavailable: err={}", err);
            return;
        }
    };

    if let Err(err) = sender.register(listen_port, &user_id).await {
        log::warn!("input registration failed: err={}", err);
    }

    let mut queue = queue.lock().await;
    while let Some(event) = queue.recv().await {
        if let Err(err) = sender.send(event).await {
            log::warn!("input send failed: err={}", err);
        }
    }
}
