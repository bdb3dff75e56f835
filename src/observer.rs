use std::net::SocketAddr;

use proto::state::OmniscientState;

/// The failures a user of the core can actually see; everything else is
/// absorbed by retries, fallbacks or the key-frame recovery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    AuthDenied,
    AllCandidatesFailed,
    MaxReconnectAttemptsReached,
    DecoderError(String),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthDenied => write!(f, "auth_denied"),
            Self::AllCandidatesFailed => write!(f, "all_candidates_failed"),
            Self::MaxReconnectAttemptsReached => write!(f, "max_reconnect_attempts_reached"),
            Self::DecoderError(detail) => write!(f, "decoder_error: {}", detail),
        }
    }
}

/// Lifecycle and telemetry callbacks.
///
/// One observer instance is registered at construction and outlives the
/// session. Every method has an empty default so integrations implement
/// only what they render; all callbacks fire on the connection-manager
/// task, so implementations must not block.
#[allow(unused_variables)]
pub trait ClientObserver: Send + Sync {
    /// a transport path to the host was established.
    fn on_connect(&self, remote: SocketAddr) {}

    /// the session ended, orderly or not.
    fn on_disconnect(&self) {}

    /// a reconnect cycle began; `attempt` starts at 1.
    fn on_reconnect_start(&self, attempt: u32) {}

    fn on_reconnect_success(&self) {}

    fn on_reconnect_failed(&self) {}

    /// the host answered the registration.
    fn on_auth_result(&self, approved: bool) {}

    /// a fresh omniscient-state snapshot arrived.
    fn on_host_state(&self, state: &OmniscientState) {}

    /// terminal, user-visible failure.
    fn on_failure(&self, failure: &Failure) {}
}

/// Observer used when the integration does not care about a session's
/// events, and by tests.
pub struct NullObserver;

impl ClientObserver for NullObserver {}
