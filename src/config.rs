use std::{fs::read_to_string, net::SocketAddr};

use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct Transport {
    /// signaling TCP port
    ///
    /// the host's reliable control channel: registration, heartbeats,
    /// the auth verdict and the disconnect notification travel here.
    #[serde(default = "Transport::signaling_port")]
    pub signaling_port: u16,

    /// UDP data listen port
    ///
    /// the local port the video datagram listener binds. The host may
    /// reach it from more than one source endpoint once its NAT mapping
    /// churns, so the listener accepts datagrams from any peer.
    #[serde(default = "Transport::listen_port")]
    pub listen_port: u16,

    /// host input port
    ///
    /// the UDP port on the host that consumes pointer, key, zoom and
    /// telemetry events.
    #[serde(default = "Transport::input_port")]
    pub input_port: u16,
}

impl Transport {
    fn signaling_port() -> u16 {
        5000
    }

    fn listen_port() -> u16 {
        5001
    }

    fn input_port() -> u16 {
        5002
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            signaling_port: Self::signaling_port(),
            listen_port: Self::listen_port(),
            input_port: Self::input_port(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Stun {
    /// STUN server pool
    ///
    /// tried strictly in order with a per-server timeout; the first
    /// usable Binding response wins.
    #[serde(default = "Stun::servers")]
    pub servers: Vec<String>,
}

impl Stun {
    fn servers() -> Vec<String> {
        [
            "stun.l.google.com:19302",
            "stun1.l.google.com:19302",
            "stun2.l.google.com:19302",
            "stun.cloudflare.com:3478",
            "stun.stunprotocol.org:3478",
        ]
        .map(String::from)
        .to_vec()
    }
}

impl Default for Stun {
    fn default() -> Self {
        Self {
            servers: Self::servers(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Turn {
    /// turn server address
    #[serde(default = "Turn::server")]
    pub server: SocketAddr,

    /// long-term credential username
    #[serde(default)]
    pub username: String,

    /// long-term credential password
    #[serde(default)]
    pub credential: String,

    /// turn server realm
    ///
    /// the realm is normally learned from the 401 challenge; configuring
    /// it only pins the expected value for diagnostics.
    #[serde(default)]
    pub realm: String,
}

impl Turn {
    fn server() -> SocketAddr {
        "127.0.0.1:3478".parse().unwrap()
    }
}

impl Default for Turn {
    fn default() -> Self {
        Self {
            server: Self::server(),
            username: String::default(),
            credential: String::default(),
            realm: String::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct Reconnect {
    /// first retry delay in milliseconds
    #[serde(default = "Reconnect::base_ms")]
    pub base_ms: u64,

    /// delay growth factor per attempt
    #[serde(default = "Reconnect::multiplier")]
    pub multiplier: f64,

    /// delay ceiling in milliseconds
    #[serde(default = "Reconnect::max_ms")]
    pub max_ms: u64,

    /// give up after this many attempts
    #[serde(default = "Reconnect::max_attempts")]
    pub max_attempts: u32,
}

impl Reconnect {
    fn base_ms() -> u64 {
        1_000
    }

    fn multiplier() -> f64 {
        1.5
    }

    fn max_ms() -> u64 {
        30_000
    }

    fn max_attempts() -> u32 {
        5
    }

    /// the profile for sessions that should come back fast at the cost of
    /// more chatter, e.g. while the user is actively driving the remote
    /// screen.
    pub fn aggressive() -> Self {
        Self {
            base_ms: 500,
            multiplier: 1.2,
            max_ms: 10_000,
            max_attempts: 10,
        }
    }
}

impl Default for Reconnect {
    fn default() -> Self {
        Self {
            base_ms: Self::base_ms(),
            multiplier: Self::multiplier(),
            max_ms: Self::max_ms(),
            max_attempts: Self::max_attempts(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Host {
    /// host address for directory-less operation
    ///
    /// when set, the binary serves this address back as the only host
    /// record instead of querying a signaling directory.
    #[serde(default)]
    pub ip: Option<std::net::IpAddr>,

    /// host signaling TCP port
    #[serde(default = "Host::port")]
    pub port: u16,
}

impl Host {
    fn port() -> u16 {
        5000
    }
}

impl Default for Host {
    fn default() -> Self {
        Self {
            ip: None,
            port: Self::port(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub stun: Stun,
    #[serde(default)]
    pub turn: Turn,
    #[serde(default)]
    pub reconnect: Reconnect,
    #[serde(default)]
    pub host: Host,
    #[serde(default)]
    pub log: Log,

    /// user id presented during registration
    #[serde(default)]
    pub user_id: String,

    /// the host to connect to, resolved through the signaling directory
    #[serde(default)]
    pub target_user: String,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters; if a configuration file path is
    /// given the configuration is read from it, otherwise every field
    /// falls back to its default.
    pub fn load() -> anyhow::Result<Self> {
        let cfg_str = Cli::parse()
            .config
            .and_then(|path| read_to_string(path).ok())
            .unwrap_or_default();
        Ok(toml::from_str(&cfg_str)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_per_section() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.transport.signaling_port, 5000);
        assert_eq!(config.transport.listen_port, 5001);
        assert_eq!(config.stun.servers.len(), 5);
        assert_eq!(config.turn.server.port(), 3478);
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let config: Config = toml::from_str(
            r#"
            user_id = "alice"

            [transport]
            listen_port = 6001

            [reconnect]
            base_ms = 500
            multiplier = 1.2
            max_ms = 10000
            max_attempts = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.user_id, "alice");
        assert_eq!(config.transport.listen_port, 6001);
        assert_eq!(config.transport.signaling_port, 5000);
        assert_eq!(config.reconnect.multiplier, 1.2);
    }
}
