use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::{
    config::Reconnect,
    observer::{ClientObserver, Failure},
};

/// overall wait for one connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    WaitingForAuth,
    Connected,
    Reconnecting(u32),
    Failed(Failure),
}

/// Why a live session ended; only used for logging and the reconnect
/// decision the caller already made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Timeout,
    ConnectionLost,
    HostClosed,
    UserRequested,
}

/// Exponential backoff schedule: `min(base · multiplier^(attempt−1), max)`.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.base.mul_f64(factor).min(self.max_interval)
    }
}

impl From<Reconnect> for ReconnectPolicy {
    fn from(value: Reconnect) -> Self {
        Self {
            base: Duration::from_millis(value.base_ms),
            multiplier: value.multiplier,
            max_interval: Duration::from_millis(value.max_ms),
            max_attempts: value.max_attempts,
        }
    }
}

/// What the state machine wants the driving loop to do next.
#[derive(Debug, PartialEq, Eq)]
pub enum Directive {
    /// wait this long, then attempt to connect again.
    RetryAfter(Duration),
    /// stop; the session is over.
    Stop,
}

/// Lifecycle state machine.
///
/// The manager is the single owner of the connection state; every other
/// layer holds a read-only watch handle and posts events upstream. All
/// observer callbacks fire from whichever task drives the manager, which
/// is one task by construction.
pub struct ConnectionManager {
    state: watch::Sender<ConnectionState>,
    observer: Arc<dyn ClientObserver>,
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy, observer: Arc<dyn ClientObserver>) -> Self {
        Self {
            state: watch::channel(ConnectionState::Disconnected).0,
            observer,
            policy,
            attempt: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn connect(&mut self) {
        self.state.send_replace(ConnectionState::Connecting);
    }

    pub fn notify_waiting_auth(&mut self) {
        self.state.send_replace(ConnectionState::WaitingForAuth);
    }

    pub fn notify_connected(&mut self, remote: SocketAddr) {
        let reconnected = self.attempt > 0;
        self.attempt = 0;
        self.state.send_replace(ConnectionState::Connected);

        if reconnected {
            self.observer.on_reconnect_success();
        }
        self.observer.on_connect(remote);
        log::info!("connected: remote={}, reconnected={}", remote, reconnected);
    }

    /// the host rejected the registration; terminal, never retried.
    pub fn notify_auth_denied(&mut self) {
        log::warn!("authentication denied by host");
        self.state
            .send_replace(ConnectionState::Failed(Failure::AuthDenied));
        self.observer.on_failure(&Failure::AuthDenied);
        self.observer.on_disconnect();
    }

    /// no path to the host could be established at all.
    pub fn notify_candidates_failed(&mut self) {
        self.state
            .send_replace(ConnectionState::Failed(Failure::AllCandidatesFailed));
        self.observer.on_failure(&Failure::AllCandidatesFailed);
    }

    pub fn notify_decoder_error(&mut self, detail: String) {
        let failure = Failure::DecoderError(detail);
        self.observer.on_failure(&failure);
    }

    /// the session dropped. Returns what the driver should do: back off
    /// and retry, or stop for good.
    pub fn notify_disconnected(&mut self, reason: DisconnectReason, should_reconnect: bool) -> Directive {
        log::info!(
            "disconnected: reason={:?}, reconnect={}",
            reason,
            should_reconnect
        );

        // a terminal failure (auth denial) is sticky.
        if matches!(self.state(), ConnectionState::Failed(_)) {
            return Directive::Stop;
        }

        if !should_reconnect {
            self.state.send_replace(ConnectionState::Disconnected);
            self.observer.on_disconnect();
            return Directive::Stop;
        }

        self.attempt += 1;
        if self.attempt > self.policy.max_attempts {
            self.state
                .send_replace(ConnectionState::Failed(Failure::MaxReconnectAttemptsReached));
            self.observer.on_reconnect_failed();
            self.observer
                .on_failure(&Failure::MaxReconnectAttemptsReached);
            self.observer.on_disconnect();
            return Directive::Stop;
        }

        let delay = self.policy.delay(self.attempt);
        self.state
            .send_replace(ConnectionState::Reconnecting(self.attempt));
        self.observer.on_reconnect_start(self.attempt);
        Directive::RetryAfter(delay)
    }

    /// orderly, user-initiated shutdown.
    pub fn disconnect(&mut self) {
        self.attempt = 0;
        self.state.send_replace(ConnectionState::Disconnected);
        self.observer.on_disconnect();
    }
}
